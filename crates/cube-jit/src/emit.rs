//! The host emission contract.
//!
//! The block compiler speaks to the host backend through this trait alone.
//! Operations are expressed in guest semantics (32-bit wraparound, the
//! inverted-carry convention, the two-word condition pair); how a backend
//! realizes them is its own business. The analyzer does not depend on
//! anything in this module.

/// Guest general-purpose register index (0..32).
pub type GuestReg = u8;

/// One of the backend's scratch registers, as numbered by the register
/// cache. The cache is the single source of truth for which of these are
/// live; backends only ever see indices below `scratch_regs()`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HostReg(pub u8);

/// Two-operand ALU operations. `Sub` computes `lhs - rhs`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Eqv,
    Andc,
    Orc,
    Mul,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShiftOp {
    Left,
    RightLogical,
    RightArithmetic,
}

/// What to do with the operation's carry-out.
///
/// The guest's subtract-from family defines its carry as the logical
/// inverse of the host borrow; `HostCarryInverted` is that documented
/// asymmetry, not an oversight.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CarryCapture {
    None,
    HostCarry,
    HostCarryInverted,
}

/// Right-hand side of an emitted compare.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmpOperand {
    Host(HostReg),
    Imm(u32),
}

/// Where a block exit transfers control.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExitTarget {
    Direct(u32),
    LinkRegister,
    CountRegister,
}

/// One bit of a condition pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CrBit {
    Lt,
    Gt,
    Eq,
    So,
}

/// Test of one condition-pair bit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CrTest {
    pub field: u8,
    pub bit: CrBit,
    pub expect_set: bool,
}

/// Test of the count register after its decrement.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CtrTest {
    pub branch_if_zero: bool,
}

/// Condition of a conditional block exit. Both tests must pass (they are
/// conjunctive, matching the guest branch encoding). An empty condition is
/// never constructed; unconditional exits use `exit`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BranchCond {
    pub ctr: Option<CtrTest>,
    pub cr: Option<CrTest>,
}

/// How the emitted code treats the interpreter fallback's returned PC.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FallbackExit {
    /// Straight-line instruction; execution continues regardless.
    Continue,
    /// The instruction may divert (trap, fault); leave the block if the
    /// returned PC is not the next sequential address.
    ExitIfDiverted,
    /// The instruction always redirects control; leave the block through
    /// the returned PC.
    AlwaysExit,
}

/// Abstract host instruction sink for one compiled block.
///
/// Contract notes:
/// - every value is a 32-bit guest word; arithmetic wraps;
/// - `write_cr*` always writes both words of the pair together;
/// - carry-capturing operations must leave the guest carry bit exactly as
///   the guest ISA defines it, inverting the host borrow where asked;
/// - at every `exit`/`exit_if`/`fallback` site the register cache has
///   already flushed guest state to canonical storage.
pub trait CodeEmitter {
    /// Size of the scratch register pool the register cache may use.
    fn scratch_regs(&self) -> u8;

    fn load_imm(&mut self, dst: HostReg, value: u32);
    /// Load a guest register from canonical storage.
    fn load_gpr(&mut self, dst: HostReg, src: GuestReg);
    /// Store a scratch register back to canonical storage.
    fn store_gpr(&mut self, dst: GuestReg, src: HostReg);
    fn store_gpr_imm(&mut self, dst: GuestReg, value: u32);
    fn mov(&mut self, dst: HostReg, src: HostReg);

    fn bin_rr(&mut self, op: BinOp, dst: HostReg, lhs: HostReg, rhs: HostReg, carry: CarryCapture);
    fn bin_ri(&mut self, op: BinOp, dst: HostReg, lhs: HostReg, imm: u32, carry: CarryCapture);
    /// `dst = lhs + rhs + carry`, optionally capturing the carry-out.
    fn add_carry_in(&mut self, dst: HostReg, lhs: HostReg, rhs: HostReg, capture: bool);
    fn not(&mut self, dst: HostReg, src: HostReg);
    fn neg(&mut self, dst: HostReg, src: HostReg);
    /// Sign-extend the low `from_bits` (8 or 16) of `src`.
    fn sign_extend(&mut self, dst: HostReg, src: HostReg, from_bits: u8);
    fn count_leading_zeros(&mut self, dst: HostReg, src: HostReg);
    fn rotate_left_imm(&mut self, dst: HostReg, src: HostReg, amount: u8);
    /// Immediate shift. Carry capture is defined only for
    /// `RightArithmetic`: carry = sign bit set and any one bits shifted out.
    fn shift_imm(&mut self, op: ShiftOp, dst: HostReg, src: HostReg, amount: u8, carry: CarryCapture);
    /// Register shift with guest semantics: the amount is taken modulo 64
    /// and amounts of 32 or more produce zero.
    fn shift_reg(&mut self, op: ShiftOp, dst: HostReg, src: HostReg, amount: HostReg);

    /// Write a condition pair from a result value: the raw word plus its
    /// arithmetic-shift-right-by-31.
    fn write_cr(&mut self, field: u8, src: HostReg);
    /// Write a condition pair from a folded 64-bit value (low word, high
    /// word).
    fn write_cr_imm(&mut self, field: u8, value: i64);
    /// Write a condition pair from a 64-bit widening compare subtraction.
    fn write_cr_cmp(&mut self, field: u8, lhs: HostReg, rhs: CmpOperand, signed: bool);
    fn set_carry_imm(&mut self, carry: bool);

    fn write_lr_imm(&mut self, value: u32);
    fn decrement_ctr(&mut self);

    /// Hand one instruction to the external interpreter.
    fn fallback(&mut self, raw: u32, address: u32, exit: FallbackExit);

    /// Unconditional block exit.
    fn exit(&mut self, target: ExitTarget);
    /// Conditional block exit; falls through when the condition fails.
    fn exit_if(&mut self, cond: BranchCond, target: ExitTarget);
}
