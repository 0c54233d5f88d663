//! The opcode compiler.
//!
//! Consumes the analyzer's instruction records one at a time and either
//! folds the operation at compile time (all relevant operands are known
//! constants) or emits host operations through the `CodeEmitter` contract.
//! Anything without a special case defers the single instruction to the
//! external interpreter — that escape hatch is load-bearing, not optional.

use crate::analyzer::{CodeBlock, CodeOp};
use crate::emit::{
    BinOp, BranchCond, CarryCapture, CmpOperand, CodeEmitter, CrBit, CrTest, CtrTest, ExitTarget,
    FallbackExit, ShiftOp,
};
use crate::isa::{rotate_mask, BO_BRANCH_IF_CTR_ZERO, BO_BRANCH_IF_TRUE, BO_DONT_CHECK_CONDITION,
    BO_DONT_DECREMENT};
use crate::regcache::{FlushMode, RegCache};

/// Why a block could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("block at {address:#010X} is broken; no clean exit was found")]
    BrokenBlock { address: u32 },
    #[error("block at {address:#010X} faulted during instruction fetch")]
    MemoryException { address: u32 },
    #[error("block at {address:#010X} starts with an undecodable instruction")]
    DecodeFailure { address: u32 },
    #[error("out of host scratch registers")]
    RegisterPressure,
    #[error("backend failure: {message}")]
    Backend { message: String },
}

/// Compiles one analyzed block into a `CodeEmitter`.
pub struct BlockCompiler<'a, E: CodeEmitter> {
    emit: &'a mut E,
    gpr: RegCache,
}

impl<'a, E: CodeEmitter> BlockCompiler<'a, E> {
    pub fn new(emit: &'a mut E) -> Self {
        let scratch = emit.scratch_regs();
        BlockCompiler {
            emit,
            gpr: RegCache::new(scratch),
        }
    }

    /// Compile every instruction of `block`. The block must have analyzed
    /// cleanly; broken or faulted blocks belong to the dispatcher's
    /// non-compiled path.
    pub fn compile(&mut self, block: &CodeBlock, ops: &[CodeOp]) -> Result<(), CompileError> {
        if block.memory_exception {
            return Err(CompileError::MemoryException {
                address: block.address,
            });
        }
        if block.decode_failure && block.num_instructions == 0 {
            return Err(CompileError::DecodeFailure {
                address: block.address,
            });
        }
        if block.broken {
            return Err(CompileError::BrokenBlock {
                address: block.address,
            });
        }

        let mut exited = false;
        for (i, op) in ops.iter().enumerate() {
            if exited {
                // Everything behind an unconditional exit is reachable only
                // through the dispatcher as a fresh block.
                break;
            }
            if op.skip {
                continue;
            }
            exited = self.compile_op(op, ops.get(i + 1))?;
            self.gpr.unlock_all();
        }

        if !exited {
            self.gpr.flush(&mut *self.emit, FlushMode::Exit);
            self.emit.exit(ExitTarget::Direct(block.end_address));
        }
        Ok(())
    }

    fn compile_op(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        match inst.opcd() {
            7 | 8 | 12 | 13 | 14 | 15 | 24 | 25 | 26 | 27 | 28 | 29 => self.reg_imm(op),
            10 | 11 => self.cmp_x(op),
            16 => self.bcx(op, next),
            18 => self.bx(op, next),
            19 => match inst.subop10() {
                16 => self.bclrx(op, next),
                528 => self.bcctrx(op, next),
                _ => self.fall_back(op, next),
            },
            21 => self.rlwinmx(op),
            31 => match inst.subop10() {
                0 | 32 => self.cmp_x(op),
                8 | 40 => self.subfx(op, next),
                10 | 266 => self.addx(op, next),
                138 | 202 => self.addex(op, next),
                24 | 536 => self.shift_var(op),
                26 => self.cntlzwx(op),
                28 | 60 | 124 | 284 | 316 | 412 | 444 | 476 => self.bool_x(op),
                104 => self.negx(op, next),
                235 => self.mullwx(op, next),
                824 => self.srawix(op),
                922 | 954 => self.extsx(op),
                _ => self.fall_back(op, next),
            },
            _ => self.fall_back(op, next),
        }
    }

    // ---- integer immediates -------------------------------------------

    fn reg_imm(&mut self, op: &CodeOp) -> Result<bool, CompileError> {
        let inst = op.inst;
        let d = inst.rd();
        let a = inst.ra();
        let s = inst.rs();
        match inst.opcd() {
            // Careful: addic treats r0 as r0, but addi treats r0 as zero.
            14 => {
                if a == 0 {
                    self.gpr.set_immediate(d, inst.simm() as u32);
                } else {
                    self.regimmop(op, d, a, inst.simm() as u32, BinOp::Add, u32::wrapping_add)?;
                }
            }
            15 => {
                let value = (inst.simm() as u32) << 16;
                if a == 0 {
                    self.gpr.set_immediate(d, value);
                } else {
                    self.regimmop(op, d, a, value, BinOp::Add, u32::wrapping_add)?;
                }
            }
            24 | 25 => {
                let value = if inst.opcd() == 24 {
                    u32::from(inst.uimm())
                } else {
                    u32::from(inst.uimm()) << 16
                };
                if value == 0 && a == s {
                    // canonical nop encoding
                    return Ok(false);
                }
                self.regimmop(op, a, s, value, BinOp::Or, |x, y| x | y)?;
            }
            26 | 27 => {
                let value = if inst.opcd() == 26 {
                    u32::from(inst.uimm())
                } else {
                    u32::from(inst.uimm()) << 16
                };
                if value == 0 && a == s {
                    return Ok(false);
                }
                self.regimmop(op, a, s, value, BinOp::Xor, |x, y| x ^ y)?;
            }
            28 | 29 => {
                let value = if inst.opcd() == 28 {
                    u32::from(inst.uimm())
                } else {
                    u32::from(inst.uimm()) << 16
                };
                self.regimmop(op, a, s, value, BinOp::And, |x, y| x & y)?;
            }
            12 | 13 => {
                self.regimmop(op, d, a, inst.simm() as u32, BinOp::Add, u32::wrapping_add)?;
            }
            7 => {
                self.regimmop(op, d, a, inst.simm() as u32, BinOp::Mul, u32::wrapping_mul)?;
            }
            8 => self.subfic(op)?,
            _ => unreachable!("reg_imm dispatched with a non-immediate opcode"),
        }
        Ok(false)
    }

    fn regimmop(
        &mut self,
        op: &CodeOp,
        d: u8,
        a: u8,
        value: u32,
        bin: BinOp,
        fold: fn(u32, u32) -> u32,
    ) -> Result<(), CompileError> {
        if let Some(ia) = self.gpr.imm(a) {
            let result = fold(ia, value);
            self.gpr.set_immediate(d, result);
            if op.outputs_carry && op.wants_carry {
                debug_assert_eq!(bin, BinOp::Add);
                let ca = u64::from(ia) + u64::from(value) > u64::from(u32::MAX);
                self.emit.set_carry_imm(ca);
            }
        } else {
            let ra = self.gpr.materialize(&mut *self.emit, a)?;
            let rd = self.gpr.bind_write(&mut *self.emit, d)?;
            let capture = if op.outputs_carry && op.wants_carry {
                CarryCapture::HostCarry
            } else {
                CarryCapture::None
            };
            self.emit.bin_ri(bin, rd, ra, value, capture);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, d)?;
        }
        Ok(())
    }

    fn subfic(&mut self, op: &CodeOp) -> Result<(), CompileError> {
        let inst = op.inst;
        let d = inst.rd();
        let a = inst.ra();
        let imm = inst.simm() as u32;

        if let Some(ia) = self.gpr.imm(a) {
            self.gpr.set_immediate(d, imm.wrapping_sub(ia));
            if op.wants_carry {
                // Guest carry is the inverted host borrow of imm - a.
                self.emit.set_carry_imm(ia == 0 || imm > ia.wrapping_sub(1));
            }
            return Ok(());
        }

        let ra = self.gpr.materialize(&mut *self.emit, a)?;
        let rd = self.gpr.bind_write(&mut *self.emit, d)?;
        if imm == u32::MAX {
            // imm - a == !a; carry is unconditionally set
            self.emit.not(rd, ra);
            if op.wants_carry {
                self.emit.set_carry_imm(true);
            }
        } else if imm == 0 && !op.wants_carry {
            self.emit.neg(rd, ra);
        } else {
            let tmp = self.gpr.scratch(&mut *self.emit)?;
            let capture = if op.wants_carry {
                CarryCapture::HostCarryInverted
            } else {
                CarryCapture::None
            };
            self.emit.load_imm(tmp, imm);
            self.emit.bin_rr(BinOp::Sub, rd, tmp, ra, capture);
        }
        Ok(())
    }

    // ---- X-form integer -------------------------------------------------

    fn addx(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        if inst.oe() {
            return self.fall_back(op, next);
        }
        let (d, a, b) = (inst.rd(), inst.ra(), inst.rb());
        let carry = op.outputs_carry && op.wants_carry;

        if let (Some(ia), Some(ib)) = (self.gpr.imm(a), self.gpr.imm(b)) {
            self.gpr.set_immediate(d, ia.wrapping_add(ib));
            if carry {
                self.emit
                    .set_carry_imm(u64::from(ia) + u64::from(ib) > u64::from(u32::MAX));
            }
        } else {
            let ra = self.gpr.materialize(&mut *self.emit, a)?;
            let rb = self.gpr.materialize(&mut *self.emit, b)?;
            let rd = self.gpr.bind_write(&mut *self.emit, d)?;
            let capture = if carry {
                CarryCapture::HostCarry
            } else {
                CarryCapture::None
            };
            self.emit.bin_rr(BinOp::Add, rd, ra, rb, capture);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, d)?;
        }
        Ok(false)
    }

    fn addex(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        if inst.oe() {
            return self.fall_back(op, next);
        }
        let (d, a) = (inst.rd(), inst.ra());

        // The carry-in is runtime state, so there is nothing to fold.
        let ra = self.gpr.materialize(&mut *self.emit, a)?;
        let rb = if inst.subop10() == 138 {
            self.gpr.materialize(&mut *self.emit, inst.rb())?
        } else {
            // addze: add zero extended
            let tmp = self.gpr.scratch(&mut *self.emit)?;
            self.emit.load_imm(tmp, 0);
            tmp
        };
        let rd = self.gpr.bind_write(&mut *self.emit, d)?;
        self.emit.add_carry_in(rd, ra, rb, op.wants_carry);
        if op.outputs_cr0 {
            self.compute_rc(op, d)?;
        }
        Ok(false)
    }

    fn subfx(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        if inst.oe() {
            return self.fall_back(op, next);
        }
        let (d, a, b) = (inst.rd(), inst.ra(), inst.rb());
        let carry = op.outputs_carry && op.wants_carry;

        if a == b {
            self.gpr.set_immediate(d, 0);
            if carry {
                self.emit.set_carry_imm(true);
            }
        } else if let (Some(ia), Some(ib)) = (self.gpr.imm(a), self.gpr.imm(b)) {
            self.gpr.set_immediate(d, ib.wrapping_sub(ia));
            if carry {
                self.emit.set_carry_imm(ia == 0 || ib >= ia);
            }
        } else {
            let ra = self.gpr.materialize(&mut *self.emit, a)?;
            let rb = self.gpr.materialize(&mut *self.emit, b)?;
            let rd = self.gpr.bind_write(&mut *self.emit, d)?;
            let capture = if carry {
                CarryCapture::HostCarryInverted
            } else {
                CarryCapture::None
            };
            // subtract-from: b - a, not a - b
            self.emit.bin_rr(BinOp::Sub, rd, rb, ra, capture);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, d)?;
        }
        Ok(false)
    }

    fn negx(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        if inst.oe() {
            return self.fall_back(op, next);
        }
        let (d, a) = (inst.rd(), inst.ra());
        if let Some(ia) = self.gpr.imm(a) {
            self.gpr.set_immediate(d, 0u32.wrapping_sub(ia));
        } else {
            let ra = self.gpr.materialize(&mut *self.emit, a)?;
            let rd = self.gpr.bind_write(&mut *self.emit, d)?;
            self.emit.neg(rd, ra);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, d)?;
        }
        Ok(false)
    }

    fn mullwx(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        if inst.oe() {
            return self.fall_back(op, next);
        }
        let (d, a, b) = (inst.rd(), inst.ra(), inst.rb());
        if let (Some(ia), Some(ib)) = (self.gpr.imm(a), self.gpr.imm(b)) {
            self.gpr.set_immediate(d, ia.wrapping_mul(ib));
        } else {
            let ra = self.gpr.materialize(&mut *self.emit, a)?;
            let rb = self.gpr.materialize(&mut *self.emit, b)?;
            let rd = self.gpr.bind_write(&mut *self.emit, d)?;
            self.emit.bin_rr(BinOp::Mul, rd, ra, rb, CarryCapture::None);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, d)?;
        }
        Ok(false)
    }

    fn bool_x(&mut self, op: &CodeOp) -> Result<bool, CompileError> {
        let inst = op.inst;
        let (a, s, b) = (inst.ra(), inst.rs(), inst.rb());
        let subop = inst.subop10();

        if let (Some(is), Some(ib)) = (self.gpr.imm(s), self.gpr.imm(b)) {
            let result = match subop {
                28 => is & ib,
                476 => !(is & ib),
                60 => is & !ib,
                444 => is | ib,
                124 => !(is | ib),
                412 => is | !ib,
                316 => is ^ ib,
                284 => !(is ^ ib),
                _ => unreachable!("bool_x dispatched with a non-logical subop"),
            };
            self.gpr.set_immediate(a, result);
        } else if s == b {
            match subop {
                28 | 444 => {
                    // and/or with itself: a move
                    if a != s {
                        let rs = self.gpr.materialize(&mut *self.emit, s)?;
                        let ra = self.gpr.bind_write(&mut *self.emit, a)?;
                        self.emit.mov(ra, rs);
                    }
                }
                476 | 124 => {
                    let rs = self.gpr.materialize(&mut *self.emit, s)?;
                    let ra = self.gpr.bind_write(&mut *self.emit, a)?;
                    self.emit.not(ra, rs);
                }
                412 | 284 => self.gpr.set_immediate(a, u32::MAX),
                60 | 316 => self.gpr.set_immediate(a, 0),
                _ => unreachable!("bool_x dispatched with a non-logical subop"),
            }
        } else {
            let bin = match subop {
                28 => BinOp::And,
                476 => BinOp::Nand,
                60 => BinOp::Andc,
                444 => BinOp::Or,
                124 => BinOp::Nor,
                412 => BinOp::Orc,
                316 => BinOp::Xor,
                284 => BinOp::Eqv,
                _ => unreachable!("bool_x dispatched with a non-logical subop"),
            };
            let rs = self.gpr.materialize(&mut *self.emit, s)?;
            let rb = self.gpr.materialize(&mut *self.emit, b)?;
            let ra = self.gpr.bind_write(&mut *self.emit, a)?;
            self.emit.bin_rr(bin, ra, rs, rb, CarryCapture::None);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, a)?;
        }
        Ok(false)
    }

    fn extsx(&mut self, op: &CodeOp) -> Result<bool, CompileError> {
        let inst = op.inst;
        let (a, s) = (inst.ra(), inst.rs());
        let bits = if inst.subop10() == 922 { 16 } else { 8 };
        if let Some(is) = self.gpr.imm(s) {
            let result = if bits == 16 {
                is as u16 as i16 as i32 as u32
            } else {
                is as u8 as i8 as i32 as u32
            };
            self.gpr.set_immediate(a, result);
        } else {
            let rs = self.gpr.materialize(&mut *self.emit, s)?;
            let ra = self.gpr.bind_write(&mut *self.emit, a)?;
            self.emit.sign_extend(ra, rs, bits);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, a)?;
        }
        Ok(false)
    }

    fn cntlzwx(&mut self, op: &CodeOp) -> Result<bool, CompileError> {
        let inst = op.inst;
        let (a, s) = (inst.ra(), inst.rs());
        if let Some(is) = self.gpr.imm(s) {
            self.gpr.set_immediate(a, is.leading_zeros());
        } else {
            let rs = self.gpr.materialize(&mut *self.emit, s)?;
            let ra = self.gpr.bind_write(&mut *self.emit, a)?;
            self.emit.count_leading_zeros(ra, rs);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, a)?;
        }
        Ok(false)
    }

    fn shift_var(&mut self, op: &CodeOp) -> Result<bool, CompileError> {
        let inst = op.inst;
        let (a, s, b) = (inst.ra(), inst.rs(), inst.rb());
        let kind = if inst.subop10() == 24 {
            ShiftOp::Left
        } else {
            ShiftOp::RightLogical
        };
        if let (Some(is), Some(ib)) = (self.gpr.imm(s), self.gpr.imm(b)) {
            let amount = ib & 0x3F;
            let result = if amount >= 32 {
                0
            } else if kind == ShiftOp::Left {
                is << amount
            } else {
                is >> amount
            };
            self.gpr.set_immediate(a, result);
        } else {
            let rs = self.gpr.materialize(&mut *self.emit, s)?;
            let rb = self.gpr.materialize(&mut *self.emit, b)?;
            let ra = self.gpr.bind_write(&mut *self.emit, a)?;
            self.emit.shift_reg(kind, ra, rs, rb);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, a)?;
        }
        Ok(false)
    }

    fn srawix(&mut self, op: &CodeOp) -> Result<bool, CompileError> {
        let inst = op.inst;
        let (a, s) = (inst.ra(), inst.rs());
        let sh = inst.sh();
        if let Some(is) = self.gpr.imm(s) {
            self.gpr.set_immediate(a, ((is as i32) >> sh) as u32);
            if op.wants_carry {
                // carry = negative input with any one bits shifted out
                let shifted_out = is & ((1u32 << sh) - 1);
                self.emit.set_carry_imm((is as i32) < 0 && shifted_out != 0);
            }
        } else {
            let rs = self.gpr.materialize(&mut *self.emit, s)?;
            let ra = self.gpr.bind_write(&mut *self.emit, a)?;
            let capture = if op.wants_carry {
                CarryCapture::HostCarry
            } else {
                CarryCapture::None
            };
            self.emit.shift_imm(ShiftOp::RightArithmetic, ra, rs, sh, capture);
        }
        if op.outputs_cr0 {
            self.compute_rc(op, a)?;
        }
        Ok(false)
    }

    fn rlwinmx(&mut self, op: &CodeOp) -> Result<bool, CompileError> {
        let inst = op.inst;
        let (a, s) = (inst.ra(), inst.rs());
        let sh = inst.sh();
        let mask = rotate_mask(inst.mb(), inst.me());
        if let Some(is) = self.gpr.imm(s) {
            self.gpr.set_immediate(a, is.rotate_left(u32::from(sh)) & mask);
        } else {
            let rs = self.gpr.materialize(&mut *self.emit, s)?;
            let ra = self.gpr.bind_write(&mut *self.emit, a)?;
            self.emit.rotate_left_imm(ra, rs, sh);
            if mask != u32::MAX {
                self.emit.bin_ri(BinOp::And, ra, ra, mask, CarryCapture::None);
            }
        }
        if op.outputs_cr0 {
            self.compute_rc(op, a)?;
        }
        Ok(false)
    }

    // ---- compares -------------------------------------------------------

    fn cmp_x(&mut self, op: &CodeOp) -> Result<bool, CompileError> {
        let inst = op.inst;
        let a = inst.ra();
        let crf = inst.crfd();

        // A pair nothing reads before the next write is not written at all.
        if crf == 0 && !op.wants_cr0 {
            return Ok(false);
        }

        let signed = inst.opcd() == 11 || (inst.opcd() == 31 && inst.subop10() == 0);
        let rhs_imm = match inst.opcd() {
            10 => Some(u32::from(inst.uimm())),
            11 => Some(inst.simm() as i32 as u32),
            _ => self.gpr.imm(inst.rb()),
        };

        if let (Some(ia), Some(ib)) = (self.gpr.imm(a), rhs_imm) {
            // Both operands known: pre-compute the whole compare.
            let diff = if signed {
                i64::from(ia as i32) - i64::from(ib as i32)
            } else {
                i64::from(ia) - i64::from(ib)
            };
            self.emit.write_cr_imm(crf, diff);
            return Ok(false);
        }

        let lhs = self.gpr.materialize(&mut *self.emit, a)?;
        let rhs = match rhs_imm {
            Some(value) => CmpOperand::Imm(value),
            None => CmpOperand::Host(self.gpr.materialize(&mut *self.emit, inst.rb())?),
        };
        self.emit.write_cr_cmp(crf, lhs, rhs, signed);
        Ok(false)
    }

    fn compute_rc(&mut self, op: &CodeOp, reg: u8) -> Result<(), CompileError> {
        if !op.wants_cr0 {
            return Ok(());
        }
        if let Some(value) = self.gpr.imm(reg) {
            self.emit.write_cr_imm(0, i64::from(value as i32));
        } else {
            let host = self.gpr.materialize(&mut *self.emit, reg)?;
            self.emit.write_cr(0, host);
        }
        Ok(())
    }

    // ---- branches and exits ----------------------------------------------

    fn bx(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        if inst.lk() {
            self.emit.write_lr_imm(op.address.wrapping_add(4));
        }
        let target = op.branch_to.expect("direct branch has a static target");
        if next.map(|n| n.address) == Some(target) {
            // Followed by the analyzer; execution continues in place.
            return Ok(false);
        }
        self.gpr.flush(&mut *self.emit, FlushMode::Exit);
        self.emit.exit(ExitTarget::Direct(target));
        Ok(true)
    }

    fn bcx(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        let target = op.branch_to.expect("conditional branch has a static target");
        if inst.lk() {
            self.emit.write_lr_imm(op.address.wrapping_add(4));
        }
        if inst.bo() & BO_DONT_DECREMENT != 0 && inst.bo() & BO_DONT_CHECK_CONDITION != 0 {
            // Unconditional form.
            if next.map(|n| n.address) == Some(target) {
                return Ok(false);
            }
            self.gpr.flush(&mut *self.emit, FlushMode::Exit);
            self.emit.exit(ExitTarget::Direct(target));
            return Ok(true);
        }
        self.conditional_exit(op, ExitTarget::Direct(target))
    }

    fn bclrx(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        if inst.lk() {
            // blrl both reads and writes LR; leave it to the interpreter.
            return self.fall_back(op, next);
        }
        if inst.bo() & BO_DONT_DECREMENT != 0 && inst.bo() & BO_DONT_CHECK_CONDITION != 0 {
            self.gpr.flush(&mut *self.emit, FlushMode::Exit);
            self.emit.exit(ExitTarget::LinkRegister);
            return Ok(true);
        }
        self.conditional_exit(op, ExitTarget::LinkRegister)
    }

    fn bcctrx(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        let inst = op.inst;
        if inst.bo() & BO_DONT_DECREMENT == 0 {
            // Decrementing bcctr forms are architecturally invalid.
            return self.fall_back(op, next);
        }
        if inst.lk() {
            self.emit.write_lr_imm(op.address.wrapping_add(4));
        }
        if inst.bo() & BO_DONT_CHECK_CONDITION != 0 {
            self.gpr.flush(&mut *self.emit, FlushMode::Exit);
            self.emit.exit(ExitTarget::CountRegister);
            return Ok(true);
        }
        self.conditional_exit(op, ExitTarget::CountRegister)
    }

    /// Shared tail of the conditional branch forms: decrement CTR if asked,
    /// build the conjunctive condition, flush, and emit the exit.
    fn conditional_exit(
        &mut self,
        op: &CodeOp,
        target: ExitTarget,
    ) -> Result<bool, CompileError> {
        let inst = op.inst;
        let bo = inst.bo();
        let mut cond = BranchCond { ctr: None, cr: None };

        if bo & BO_DONT_DECREMENT == 0 {
            // CTR decrements whether or not the branch is taken.
            self.emit.decrement_ctr();
            cond.ctr = Some(CtrTest {
                branch_if_zero: bo & BO_BRANCH_IF_CTR_ZERO != 0,
            });
        }

        if bo & BO_DONT_CHECK_CONDITION == 0 {
            let bit = match inst.bi() & 3 {
                0 => CrBit::Lt,
                1 => CrBit::Gt,
                2 => CrBit::Eq,
                _ => CrBit::So,
            };
            let expect_set = bo & BO_BRANCH_IF_TRUE != 0;
            if bit == CrBit::So {
                // Summary overflow is not modeled by compares: a branch on
                // SO set never takes, a branch on SO clear always does.
                if expect_set {
                    return Ok(false);
                }
            } else {
                cond.cr = Some(CrTest {
                    field: (inst.bi() >> 2) as u8,
                    bit,
                    expect_set,
                });
            }
        }

        self.gpr.flush(&mut *self.emit, FlushMode::Checkpoint);
        if cond.ctr.is_none() && cond.cr.is_none() {
            // The condition degenerated to always-taken.
            self.emit.exit(target);
            return Ok(true);
        }
        self.emit.exit_if(cond, target);
        Ok(false)
    }

    /// Defer one instruction to the external interpreter. The cache is
    /// fully flushed first — the interpreter owns all guest state for the
    /// duration of the call.
    fn fall_back(&mut self, op: &CodeOp, next: Option<&CodeOp>) -> Result<bool, CompileError> {
        self.gpr.flush(&mut *self.emit, FlushMode::Exit);
        let is_last = next.is_none();
        let exit = if op.can_end_block && is_last {
            FallbackExit::AlwaysExit
        } else if op.can_end_block || op.can_cause_exception {
            FallbackExit::ExitIfDiverted
        } else {
            FallbackExit::Continue
        };
        self.emit.fallback(op.inst.raw(), op.address, exit);
        Ok(op.can_end_block && is_last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, CodeBlock, CodeBuffer};
    use crate::config::AnalyzerOptions;
    use crate::tables::DecodeTable;
    use crate::test_support::{RecordingEmitter, TestMemory};

    const START: u32 = 0x8000_0000;
    const BLR: u32 = 0x4E80_0020;

    fn compile(
        program: &[u32],
        options: AnalyzerOptions,
    ) -> Result<(CodeBlock, RecordingEmitter), CompileError> {
        let table = DecodeTable::new();
        let analyzer = Analyzer::new(&table, options);
        let mut buffer = CodeBuffer::new(64);
        let mut mem = TestMemory::with_program(START, program);
        let block = analyzer.analyze(&mut mem, START, &mut buffer, 32);
        let mut emit = RecordingEmitter::default();
        BlockCompiler::new(&mut emit).compile(&block, buffer.ops())?;
        Ok((block, emit))
    }

    fn compile_ok(program: &[u32], options: AnalyzerOptions) -> (CodeBlock, RecordingEmitter) {
        compile(program, options).expect("block compiles")
    }

    /// Pull the folded constant stored to `reg` out of the recording.
    fn stored_imm(emit: &RecordingEmitter, reg: u8) -> Option<u32> {
        let prefix = format!("store_gpr_imm r{reg} ");
        emit.ops.iter().rev().find_map(|line| {
            let hex = line.strip_prefix(&prefix)?.strip_prefix("0x")?;
            u32::from_str_radix(hex, 16).ok()
        })
    }

    /// Load an arbitrary 32-bit constant: lis + ori.
    fn load_const(reg: u8, value: u32) -> [u32; 2] {
        let lis = (15 << 26) | (u32::from(reg) << 21) | (value >> 16);
        let ori =
            (24 << 26) | (u32::from(reg) << 21) | (u32::from(reg) << 16) | (value & 0xFFFF);
        [lis, ori]
    }

    #[test]
    fn whole_block_folds_to_an_immediate() {
        // With inlining and conditional continuation both off, the add must
        // fold to r5 = 12 with no host arithmetic at all.
        let (_, emit) = compile_ok(
            &[
                0x3860_0005, // li r3, 5
                0x3880_0007, // li r4, 7
                0x7CA3_2214, // add r5, r3, r4
                BLR,
            ],
            AnalyzerOptions::conservative(),
        );
        assert_eq!(emit.arithmetic_ops(), 0);
        assert_eq!(stored_imm(&emit, 5), Some(12));
        assert_eq!(*emit.ops.last().unwrap(), "exit LinkRegister");
    }

    #[test]
    fn folded_alu_matches_wrapping_reference() {
        struct Case {
            word: u32,
            reference: fn(u32, u32) -> u32,
        }
        // op r5, r3, r4 encodings; note the arithmetic forms put the
        // destination in the D field while the logical forms put it in A.
        let arith = |subop: u32| (31 << 26) | (5 << 21) | (3 << 16) | (4 << 11) | (subop << 1);
        let logical = |subop: u32| (31 << 26) | (3 << 21) | (5 << 16) | (4 << 11) | (subop << 1);
        let cases = [
            Case { word: arith(266), reference: u32::wrapping_add },
            // subtract-from computes rb - ra
            Case { word: arith(40), reference: |a, b| b.wrapping_sub(a) },
            Case { word: arith(235), reference: u32::wrapping_mul },
            Case { word: logical(444), reference: |a, b| a | b },
            Case { word: logical(28), reference: |a, b| a & b },
            Case { word: logical(316), reference: |a, b| a ^ b },
        ];
        let boundary = [0u32, 1, 0xFFFF_FFFF, 0x8000_0000];

        for case in &cases {
            for &a in &boundary {
                for &b in &boundary {
                    let mut program = Vec::new();
                    program.extend_from_slice(&load_const(3, a));
                    program.extend_from_slice(&load_const(4, b));
                    program.push(case.word);
                    program.push(BLR);
                    let (_, emit) = compile_ok(&program, AnalyzerOptions::conservative());
                    assert_eq!(emit.arithmetic_ops(), 0, "fold failed for {a:#x},{b:#x}");
                    assert_eq!(
                        stored_imm(&emit, 5),
                        Some((case.reference)(a, b)),
                        "wrong fold for {:#010x} with {a:#x},{b:#x}",
                        case.word
                    );
                }
            }
        }
    }

    #[test]
    fn subfic_carry_is_inverted_borrow() {
        let cases = [
            (0u32, 0u32),          // operand 0, immediate 0
            (1, 0xFFFF_FFFF),      // operand 1, immediate -1
            (5, 3),                // generic
        ];
        for (operand, immediate) in cases {
            let mut program = Vec::new();
            program.extend_from_slice(&load_const(3, operand));
            // subfic r4, r3, imm — only the low 16 bits encode, so pick
            // immediates representable as simm16
            let simm = immediate as u16;
            program.push((8 << 26) | (4 << 21) | (3 << 16) | u32::from(simm));
            program.push(BLR);
            let (_, emit) = compile_ok(&program, AnalyzerOptions::conservative());

            let imm_ext = simm as i16 as i32 as u32;
            let borrow = imm_ext < operand;
            let expected = format!("set_carry_imm {}", !borrow);
            assert!(
                emit.ops.contains(&expected),
                "operand={operand:#x} imm={imm_ext:#x}: wanted `{expected}` in {:?}",
                emit.ops
            );
            assert_eq!(stored_imm(&emit, 4), Some(imm_ext.wrapping_sub(operand)));
        }
    }

    #[test]
    fn dead_carry_write_is_elided() {
        // The first addic's carry is overwritten before anything reads it.
        let (_, emit) = compile_ok(
            &[
                0x3860_0001, // li r3, 1
                0x3083_0001, // addic r4, r3, 1
                0x30A3_0002, // addic r5, r3, 2
                BLR,
            ],
            AnalyzerOptions::conservative(),
        );
        let carries: Vec<_> = emit
            .ops
            .iter()
            .filter(|line| line.starts_with("set_carry_imm"))
            .collect();
        assert_eq!(carries.len(), 1, "exactly one live carry write: {:?}", emit.ops);
    }

    #[test]
    fn dead_compare_is_dropped_entirely() {
        let (_, emit) = compile_ok(
            &[
                0x2C03_0000, // cmpwi r3, 0 (overwritten before any read)
                0x2C03_0001, // cmpwi r3, 1
                BLR,
            ],
            AnalyzerOptions::conservative(),
        );
        let writes: Vec<_> = emit
            .ops
            .iter()
            .filter(|line| line.starts_with("write_cr"))
            .collect();
        assert_eq!(writes.len(), 1, "{:?}", emit.ops);
    }

    #[test]
    fn constant_compare_folds_to_pair_write() {
        let (_, emit) = compile_ok(
            &[
                0x3860_0005, // li r3, 5
                0x2C03_0003, // cmpwi r3, 3
                0x4182_0008, // beq +8 (keeps the compare alive)
                BLR,
            ],
            AnalyzerOptions::conservative(),
        );
        assert!(emit.ops.contains(&"write_cr_imm cr0 0x2".to_string()), "{:?}", emit.ops);
    }

    #[test]
    fn register_compare_emits_widening_compare() {
        let (_, emit) = compile_ok(
            &[
                0x7C03_2000, // cmpw cr0, r3, r4
                0x4182_0008, // beq +8
                BLR,
            ],
            AnalyzerOptions::conservative(),
        );
        assert!(
            emit.ops
                .iter()
                .any(|line| line.starts_with("write_cr_cmp cr0") && line.ends_with("signed=true")),
            "{:?}",
            emit.ops
        );
    }

    #[test]
    fn conditional_branch_emits_checkpointed_exit() {
        let (_, emit) = compile_ok(
            &[
                0x2C03_0000, // cmpwi r3, 0
                0x4182_0008, // beq +8
                0x3880_0001, // li r4, 1
                BLR,
            ],
            AnalyzerOptions {
                reorder_cmp: false,
                ..AnalyzerOptions::default()
            },
        );
        let exit_if = emit
            .ops
            .iter()
            .position(|line| line.starts_with("exit_if"))
            .expect("conditional exit emitted");
        assert!(emit.ops[exit_if].contains("Eq"));
        assert!(emit.ops[exit_if].contains("Direct(2147483660)")); // 0x8000000C
        // The taken path must not see the later r4 write.
        let r4_store = emit
            .ops
            .iter()
            .position(|line| line.starts_with("store_gpr_imm r4"))
            .expect("r4 flushed at block end");
        assert!(exit_if < r4_store);
    }

    #[test]
    fn ctr_branch_decrements_and_tests() {
        // bdnz back to the block start
        let bdnz = (16u32 << 26) | (0x10 << 21) | 0xFFFC;
        let (_, emit) = compile_ok(
            &[0x3860_0000, bdnz, BLR],
            AnalyzerOptions::conservative(),
        );
        assert!(emit.ops.contains(&"decrement_ctr".to_string()));
        assert!(
            emit.ops
                .iter()
                .any(|line| line.starts_with("exit_if") && line.contains("branch_if_zero: false")),
            "{:?}",
            emit.ops
        );
    }

    #[test]
    fn loads_and_stores_defer_to_the_interpreter() {
        let (_, emit) = compile_ok(
            &[
                0x8064_0000, // lwz r3, 0(r4)
                0x9064_0004, // stw r3, 4(r4)
                BLR,
            ],
            AnalyzerOptions::conservative(),
        );
        let fallbacks: Vec<_> = emit
            .ops
            .iter()
            .filter(|line| line.starts_with("fallback"))
            .collect();
        assert_eq!(fallbacks.len(), 2);
        assert!(fallbacks[0].contains("ExitIfDiverted"));
    }

    #[test]
    fn oe_forms_defer_to_the_interpreter() {
        let addo = (31u32 << 26) | (5 << 21) | (3 << 16) | (4 << 11) | (1 << 10) | (266 << 1);
        let (_, emit) = compile_ok(&[addo, BLR], AnalyzerOptions::conservative());
        assert!(emit.ops.iter().any(|line| line.starts_with("fallback")));
    }

    #[test]
    fn broken_and_faulted_blocks_are_refused() {
        let table = DecodeTable::new();
        let analyzer = Analyzer::new(&table, AnalyzerOptions::conservative());
        let mut buffer = CodeBuffer::new(8);

        // Budget exhaustion: no exit in sight.
        let mut mem = TestMemory::with_program(START, &[0x3860_0005; 16]);
        let block = analyzer.analyze(&mut mem, START, &mut buffer, 8);
        assert!(block.broken);
        let mut emit = RecordingEmitter::default();
        assert!(matches!(
            BlockCompiler::new(&mut emit).compile(&block, buffer.ops()),
            Err(CompileError::BrokenBlock { .. })
        ));
        assert!(emit.ops.is_empty(), "no code for a broken block");

        // Fetch fault at the start address.
        let mut mem = TestMemory::new();
        let block = analyzer.analyze(&mut mem, START, &mut buffer, 8);
        assert!(block.memory_exception);
        let mut emit = RecordingEmitter::default();
        assert!(matches!(
            BlockCompiler::new(&mut emit).compile(&block, buffer.ops()),
            Err(CompileError::MemoryException { .. })
        ));

        // Unresolvable first instruction.
        let mut mem = TestMemory::with_program(START, &[0x0400_0000]);
        let block = analyzer.analyze(&mut mem, START, &mut buffer, 8);
        assert!(block.decode_failure);
        assert_eq!(block.num_instructions, 0);
        let mut emit = RecordingEmitter::default();
        assert!(matches!(
            BlockCompiler::new(&mut emit).compile(&block, buffer.ops()),
            Err(CompileError::DecodeFailure { .. })
        ));
    }

    #[test]
    fn code_past_an_unconditional_exit_is_not_emitted() {
        // The forward branch target keeps the block open past the blr, but
        // nothing after the blr is reachable from the block entry.
        let (_, emit) = compile_ok(
            &[
                0x2C03_0000, // cmpwi r3, 0
                0x4182_000C, // beq +12
                BLR,
                0x3880_0001, // li r4, 1 (unreachable from this entry)
                BLR,
            ],
            AnalyzerOptions {
                reorder_cmp: false,
                ..AnalyzerOptions::default()
            },
        );
        assert!(stored_imm(&emit, 4).is_none(), "{:?}", emit.ops);
        assert_eq!(*emit.ops.last().unwrap(), "exit LinkRegister");
    }

    #[test]
    fn followed_call_writes_lr_and_continues() {
        let leaf = START + 0x100;
        let table = DecodeTable::new();
        let analyzer = Analyzer::new(&table, AnalyzerOptions::default());
        let mut buffer = CodeBuffer::new(64);
        let mut mem = TestMemory::with_program(
            START,
            &[
                0x4800_0000 | 0x100 | 1, // bl leaf
                BLR,
            ],
        );
        mem.load(leaf, &[0x3860_002A, BLR]); // li r3, 42; blr

        let block = analyzer.analyze(&mut mem, START, &mut buffer, 32);
        let mut emit = RecordingEmitter::default();
        BlockCompiler::new(&mut emit).compile(&block, buffer.ops()).unwrap();

        // The call writes LR but produces no exit; the inlined return is
        // skipped; the leaf body folds.
        assert!(emit
            .ops
            .contains(&format!("write_lr_imm {:#x}", START + 4)));
        assert_eq!(stored_imm(&emit, 3), Some(42));
        assert_eq!(
            emit.ops.iter().filter(|l| l.starts_with("exit")).count(),
            1,
            "only the final return exits: {:?}",
            emit.ops
        );
    }
}
