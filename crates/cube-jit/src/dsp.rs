//! Fixed-point core register file and the combined-opcode write-back log.
//!
//! The fixed-point DSP packs two sub-operations into one instruction word:
//! a main operation and an "extension" operation, each with its own
//! destination. Hardware commits both destinations in one step, so the main
//! operation always sees the registers as they were *before* the extension
//! writes. The compiler models that with an explicit `PendingWrites` value
//! threaded from the extension-decode step to a single commit at the end of
//! the instruction — never by writing destinations early.

/// Status-register bit: accumulators operate in 40-bit (long) mode.
pub const SR_40_MODE_BIT: u16 = 0x4000;

/// Register indices of the fixed-point core.
pub mod reg {
    pub const AR0: u8 = 0x00; // addressing registers AR0..AR3
    pub const AR1: u8 = 0x01;
    pub const AR2: u8 = 0x02;
    pub const AR3: u8 = 0x03;
    pub const IX0: u8 = 0x04; // index registers IX0..IX3
    pub const IX1: u8 = 0x05;
    pub const IX2: u8 = 0x06;
    pub const IX3: u8 = 0x07;
    pub const WR0: u8 = 0x08; // wrapping registers WR0..WR3
    pub const WR1: u8 = 0x09;
    pub const WR2: u8 = 0x0A;
    pub const WR3: u8 = 0x0B;
    pub const ST0: u8 = 0x0C; // stacks ST0..ST3
    pub const ST1: u8 = 0x0D;
    pub const ST2: u8 = 0x0E;
    pub const ST3: u8 = 0x0F;
    pub const AC0_H: u8 = 0x10;
    pub const AC1_H: u8 = 0x11;
    pub const CR: u8 = 0x12;
    pub const SR: u8 = 0x13;
    pub const PROD_L: u8 = 0x14; // product parts PROD_L..PROD_M2
    pub const AX0_L: u8 = 0x18;
    pub const AX1_L: u8 = 0x19;
    pub const AX0_H: u8 = 0x1A;
    pub const AX1_H: u8 = 0x1B;
    pub const AC0_L: u8 = 0x1C;
    pub const AC1_L: u8 = 0x1D;
    pub const AC0_M: u8 = 0x1E;
    pub const AC1_M: u8 = 0x1F;
}

/// Is this register index the low part of an accumulator?
pub fn is_accumulator_low(index: u8) -> bool {
    index == reg::AC0_L || index == reg::AC1_L
}

/// One 40-bit accumulator, stored as low/middle/high parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accumulator {
    pub l: u16,
    pub m: u16,
    pub h: u16,
}

/// The fixed-point core's register file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DspRegisters {
    pub ar: [u16; 4],
    pub ix: [u16; 4],
    pub wr: [u16; 4],
    pub st: [u16; 4],
    pub ac: [Accumulator; 2],
    pub ax: [u32; 2],
    pub cr: u16,
    pub sr: u16,
    pub prod: [u16; 4],
}

impl DspRegisters {
    pub fn read(&self, index: u8) -> u16 {
        match index {
            0x00..=0x03 => self.ar[usize::from(index)],
            0x04..=0x07 => self.ix[usize::from(index - reg::IX0)],
            0x08..=0x0B => self.wr[usize::from(index - reg::WR0)],
            0x0C..=0x0F => self.st[usize::from(index - reg::ST0)],
            0x10 | 0x11 => self.ac[usize::from(index - reg::AC0_H)].h,
            0x12 => self.cr,
            0x13 => self.sr,
            0x14..=0x17 => self.prod[usize::from(index - reg::PROD_L)],
            0x18 | 0x19 => self.ax[usize::from(index - reg::AX0_L)] as u16,
            0x1A | 0x1B => (self.ax[usize::from(index - reg::AX0_H)] >> 16) as u16,
            0x1C | 0x1D => self.ac[usize::from(index - reg::AC0_L)].l,
            0x1E | 0x1F => self.ac[usize::from(index - reg::AC0_M)].m,
            _ => {
                log::warn!("read of unknown fixed-point register {index:#04X}");
                0
            }
        }
    }

    pub fn write(&mut self, index: u8, value: u16) {
        match index {
            0x00..=0x03 => self.ar[usize::from(index)] = value,
            0x04..=0x07 => self.ix[usize::from(index - reg::IX0)] = value,
            0x08..=0x0B => self.wr[usize::from(index - reg::WR0)] = value,
            0x0C..=0x0F => self.st[usize::from(index - reg::ST0)] = value,
            0x10 | 0x11 => self.ac[usize::from(index - reg::AC0_H)].h = value,
            0x12 => self.cr = value,
            0x13 => self.sr = value,
            0x14..=0x17 => self.prod[usize::from(index - reg::PROD_L)] = value,
            0x18 | 0x19 => {
                let ax = &mut self.ax[usize::from(index - reg::AX0_L)];
                *ax = (*ax & 0xFFFF_0000) | u32::from(value);
            }
            0x1A | 0x1B => {
                let ax = &mut self.ax[usize::from(index - reg::AX0_H)];
                *ax = (*ax & 0x0000_FFFF) | (u32::from(value) << 16);
            }
            0x1C | 0x1D => self.ac[usize::from(index - reg::AC0_L)].l = value,
            0x1E | 0x1F => self.ac[usize::from(index - reg::AC0_M)].m = value,
            _ => log::warn!("write of unknown fixed-point register {index:#04X}"),
        }
    }
}

/// Status word captured when an extension write was decoded. The commit
/// step tests the captured word, not the live one — the main operation may
/// have modified SR in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSnapshot(u16);

impl ModeSnapshot {
    pub fn capture(sr: u16) -> Self {
        ModeSnapshot(sr)
    }

    pub fn long_mode(self) -> bool {
        self.0 & SR_40_MODE_BIT != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub index: u8,
    pub value: u16,
    pub mode: Option<ModeSnapshot>,
}

/// Write-back log for one combined instruction word.
///
/// Extension sub-operations record here while the main operation is
/// compiled against the pre-update register file; `commit` applies
/// everything at once. A slot with no write is a true no-op on commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWrites {
    a: Option<PendingWrite>,
    b: Option<PendingWrite>,
}

impl PendingWrites {
    pub const fn none() -> Self {
        PendingWrites { a: None, b: None }
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_none() && self.b.is_none()
    }

    /// Record one pending write. A combined word encodes at most two; a
    /// third record overwrites the second (later records win).
    pub fn record(&mut self, index: u8, value: u16, mode: Option<ModeSnapshot>) {
        let write = PendingWrite { index, value, mode };
        if self.a.is_none() {
            self.a = Some(write);
        } else {
            if self.b.is_some() {
                log::warn!("combined write-back log overflow; keeping the latest write");
            }
            self.b = Some(write);
        }
    }

    /// Apply both pending writes as one atomic step and clear the log.
    ///
    /// Writes apply in record order, so two writes to the same index
    /// resolve to the later one without the earlier value ever becoming
    /// visible. A lone write to an accumulator low part additionally tests
    /// the captured 40-bit-mode flag: set means the low part's sign fills
    /// the middle and high parts, clear leaves them untouched.
    pub fn commit(&mut self, regs: &mut DspRegisters) {
        let a = self.a.take();
        let b = self.b.take();

        if let Some(write) = a {
            regs.write(write.index, write.value);
            if b.is_none() && is_accumulator_low(write.index) {
                if let Some(mode) = write.mode {
                    if mode.long_mode() {
                        let acc = &mut regs.ac[usize::from(write.index - reg::AC0_L)];
                        let fill = if write.value & 0x8000 != 0 { 0xFFFF } else { 0x0000 };
                        acc.m = fill;
                        acc.h = fill;
                    }
                }
            }
        }
        if let Some(write) = b {
            regs.write(write.index, write.value);
        }
    }
}
