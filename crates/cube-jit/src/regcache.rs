//! Per-block guest register cache.
//!
//! Each guest register is in exactly one of three states: untouched
//! canonical storage, a compile-time constant, or bound to a scratch host
//! register. The cache — not the compiler — is the single source of truth
//! for which host registers are free; acquisitions lock a register until
//! the end of the current instruction.
//!
//! Invariant: at every control-flow join (conditional exit, fallback call,
//! end of block) every slot is flushed to canonical storage before emission
//! continues. `FlushMode` picks whether the bookkeeping survives.

use crate::compiler::CompileError;
use crate::emit::{CodeEmitter, GuestReg, HostReg};

/// State of one guest register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Slot {
    /// Canonical storage holds the value.
    Unbound,
    /// The value is a compile-time constant; canonical storage is stale.
    Immediate(u32),
    /// A scratch host register holds the value. `dirty` means canonical
    /// storage is stale.
    Bound { host: HostReg, dirty: bool },
}

/// What a flush leaves behind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlushMode {
    /// True block exit: store everything and clear the bookkeeping.
    Exit,
    /// Control flow within a still-open block (a conditionally-taken exit
    /// that resumes): store everything but keep bindings and constants.
    Checkpoint,
}

#[derive(Clone, Copy)]
struct HostSlot {
    guest: Option<GuestReg>,
    locked: bool,
}

pub struct RegCache {
    slots: [Slot; 32],
    host: Vec<HostSlot>,
}

impl RegCache {
    pub fn new(scratch_regs: u8) -> Self {
        RegCache {
            slots: [Slot::Unbound; 32],
            host: vec![
                HostSlot {
                    guest: None,
                    locked: false,
                };
                usize::from(scratch_regs)
            ],
        }
    }

    pub fn slot(&self, reg: GuestReg) -> Slot {
        self.slots[usize::from(reg)]
    }

    pub fn imm(&self, reg: GuestReg) -> Option<u32> {
        match self.slot(reg) {
            Slot::Immediate(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_imm(&self, reg: GuestReg) -> bool {
        self.imm(reg).is_some()
    }

    /// Mark `reg` as holding a compile-time constant. No host code runs;
    /// any previous binding is simply dropped.
    pub fn set_immediate(&mut self, reg: GuestReg, value: u32) {
        if let Slot::Bound { host, .. } = self.slot(reg) {
            self.host[usize::from(host.0)].guest = None;
        }
        self.slots[usize::from(reg)] = Slot::Immediate(value);
    }

    /// Lock a free scratch register, spilling an unlocked binding if the
    /// pool is exhausted. The eviction choice only affects performance, so
    /// the lowest-numbered unlocked register is taken.
    pub fn acquire<E: CodeEmitter>(
        &mut self,
        emit: &mut E,
        hint: Option<HostReg>,
    ) -> Result<HostReg, CompileError> {
        if let Some(hint) = hint {
            let slot = &self.host[usize::from(hint.0)];
            if slot.guest.is_none() && !slot.locked {
                self.host[usize::from(hint.0)].locked = true;
                return Ok(hint);
            }
        }
        for index in 0..self.host.len() {
            let slot = &self.host[index];
            if slot.guest.is_none() && !slot.locked {
                self.host[index].locked = true;
                return Ok(HostReg(index as u8));
            }
        }
        // No free register; evict.
        for index in 0..self.host.len() {
            if self.host[index].locked {
                continue;
            }
            let guest = self.host[index]
                .guest
                .expect("unlocked host register with no guest is free");
            let host = HostReg(index as u8);
            if let Slot::Bound { dirty: true, .. } = self.slot(guest) {
                emit.store_gpr(guest, host);
            }
            self.slots[usize::from(guest)] = Slot::Unbound;
            self.host[index] = HostSlot {
                guest: None,
                locked: true,
            };
            return Ok(host);
        }
        Err(CompileError::RegisterPressure)
    }

    /// Unlock a host register without touching its binding.
    pub fn release(&mut self, host: HostReg) {
        self.host[usize::from(host.0)].locked = false;
    }

    /// Lock an anonymous scratch register (no guest binding).
    pub fn scratch<E: CodeEmitter>(&mut self, emit: &mut E) -> Result<HostReg, CompileError> {
        self.acquire(emit, None)
    }

    /// Get `reg`'s value into a locked host register, loading from
    /// canonical storage or materializing a constant as needed. A constant
    /// that must be emitted anyway goes through a load-constant step, never
    /// back through guest storage.
    pub fn materialize<E: CodeEmitter>(
        &mut self,
        emit: &mut E,
        reg: GuestReg,
    ) -> Result<HostReg, CompileError> {
        match self.slot(reg) {
            Slot::Bound { host, .. } => {
                self.host[usize::from(host.0)].locked = true;
                Ok(host)
            }
            Slot::Immediate(value) => {
                let host = self.acquire(emit, None)?;
                emit.load_imm(host, value);
                self.bind(reg, host, true);
                Ok(host)
            }
            Slot::Unbound => {
                let host = self.acquire(emit, None)?;
                emit.load_gpr(host, reg);
                self.bind(reg, host, false);
                Ok(host)
            }
        }
    }

    /// Bind `reg` for writing: its current value (if any) stays readable in
    /// the returned register, and the slot is marked dirty.
    pub fn bind_write<E: CodeEmitter>(
        &mut self,
        emit: &mut E,
        reg: GuestReg,
    ) -> Result<HostReg, CompileError> {
        match self.slot(reg) {
            Slot::Bound { host, .. } => {
                self.host[usize::from(host.0)].locked = true;
                self.slots[usize::from(reg)] = Slot::Bound { host, dirty: true };
                Ok(host)
            }
            _ => {
                let host = self.acquire(emit, None)?;
                self.bind(reg, host, true);
                Ok(host)
            }
        }
    }

    fn bind(&mut self, reg: GuestReg, host: HostReg, dirty: bool) {
        self.host[usize::from(host.0)].guest = Some(reg);
        self.slots[usize::from(reg)] = Slot::Bound { host, dirty };
    }

    /// Unlock every host register. Called between instructions; locks never
    /// outlive the instruction that took them.
    pub fn unlock_all(&mut self) {
        for slot in &mut self.host {
            slot.locked = false;
        }
    }

    /// Force every cached value back to canonical guest storage.
    pub fn flush<E: CodeEmitter>(&mut self, emit: &mut E, mode: FlushMode) {
        for reg in 0..32u8 {
            match self.slot(reg) {
                Slot::Unbound => {}
                Slot::Immediate(value) => {
                    emit.store_gpr_imm(reg, value);
                    if mode == FlushMode::Exit {
                        self.slots[usize::from(reg)] = Slot::Unbound;
                    }
                }
                Slot::Bound { host, dirty } => {
                    if dirty {
                        emit.store_gpr(reg, host);
                    }
                    match mode {
                        FlushMode::Exit => {
                            self.host[usize::from(host.0)].guest = None;
                            self.slots[usize::from(reg)] = Slot::Unbound;
                        }
                        FlushMode::Checkpoint => {
                            self.slots[usize::from(reg)] = Slot::Bound { host, dirty: false };
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingEmitter;

    #[test]
    fn immediates_never_touch_host_storage() {
        let mut emit = RecordingEmitter::default();
        let mut cache = RegCache::new(emit.scratch_regs());

        cache.set_immediate(3, 5);
        cache.set_immediate(4, 7);
        assert_eq!(cache.imm(3), Some(5));
        assert!(emit.ops.is_empty());

        cache.flush(&mut emit, FlushMode::Exit);
        assert_eq!(
            emit.ops,
            vec!["store_gpr_imm r3 0x5", "store_gpr_imm r4 0x7"]
        );
        assert_eq!(cache.slot(3), Slot::Unbound);
    }

    #[test]
    fn acquire_prefers_free_then_evicts_unlocked() {
        let mut emit = RecordingEmitter::default();
        let mut cache = RegCache::new(emit.scratch_regs());

        // Occupy all four scratch registers with dirty bindings.
        for reg in 0..4u8 {
            let host = cache.bind_write(&mut emit, reg).unwrap();
            assert_eq!(host.0, reg);
        }
        cache.unlock_all();

        // The pool is full; a fifth binding evicts the lowest-numbered
        // unlocked register and spills it.
        let host = cache.bind_write(&mut emit, 10).unwrap();
        assert_eq!(host.0, 0);
        assert!(emit.ops.contains(&"store_gpr r0 h0".to_string()));
        assert_eq!(cache.slot(0), Slot::Unbound);

        // A locked register is never handed out twice.
        let next = cache.bind_write(&mut emit, 11).unwrap();
        assert_ne!(next, host);
    }

    #[test]
    fn register_pressure_is_an_error_not_a_corruption() {
        let mut emit = RecordingEmitter::default();
        let mut cache = RegCache::new(2);
        cache.materialize(&mut emit, 1).unwrap();
        cache.materialize(&mut emit, 2).unwrap();
        // Both registers are locked by the current instruction.
        assert!(matches!(
            cache.scratch(&mut emit),
            Err(CompileError::RegisterPressure)
        ));
    }

    #[test]
    fn checkpoint_flush_preserves_bindings_and_constants() {
        let mut emit = RecordingEmitter::default();
        let mut cache = RegCache::new(4);

        cache.set_immediate(3, 9);
        let host = cache.bind_write(&mut emit, 5).unwrap();
        cache.unlock_all();

        cache.flush(&mut emit, FlushMode::Checkpoint);
        assert_eq!(cache.imm(3), Some(9), "constant survives a checkpoint");
        assert_eq!(cache.slot(5), Slot::Bound { host, dirty: false });

        // A clean binding is not stored again at the next flush.
        emit.ops.clear();
        cache.flush(&mut emit, FlushMode::Exit);
        assert_eq!(emit.ops, vec!["store_gpr_imm r3 0x9"]);
    }

    #[test]
    fn materialized_constant_uses_a_load_constant_step() {
        let mut emit = RecordingEmitter::default();
        let mut cache = RegCache::new(4);
        cache.set_immediate(7, 0x1234);
        let host = cache.materialize(&mut emit, 7).unwrap();
        assert_eq!(emit.ops, vec![format!("load_imm h{} 0x1234", host.0)]);
        // The binding is dirty: canonical storage never saw the constant.
        assert_eq!(cache.slot(7), Slot::Bound { host, dirty: true });
    }
}
