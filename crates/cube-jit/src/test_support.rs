//! Shared test doubles: an in-memory instruction source and a recording
//! emitter that logs every contract call as a line of text.

use std::collections::HashMap;

use crate::emit::{
    BinOp, BranchCond, CarryCapture, CmpOperand, CodeEmitter, ExitTarget, FallbackExit, GuestReg,
    HostReg, ShiftOp,
};
use crate::mem::{FetchFault, GuestMemory};

pub struct TestMemory {
    words: HashMap<u32, u32>,
}

impl TestMemory {
    pub fn new() -> Self {
        TestMemory {
            words: HashMap::new(),
        }
    }

    pub fn with_program(start: u32, words: &[u32]) -> Self {
        let mut mem = Self::new();
        mem.load(start, words);
        mem
    }

    pub fn load(&mut self, start: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.words.insert(start + (i as u32) * 4, *word);
        }
    }
}

impl GuestMemory for TestMemory {
    fn read_u32(&mut self, address: u32) -> Result<u32, FetchFault> {
        self.words
            .get(&address)
            .copied()
            .ok_or(FetchFault::Fetch { address })
    }
}

/// Records every emitted operation as one formatted line.
#[derive(Default)]
pub struct RecordingEmitter {
    pub ops: Vec<String>,
}

impl RecordingEmitter {
    fn log(&mut self, entry: String) {
        self.ops.push(entry);
    }

    /// Count of recorded ALU operations (the "host arithmetic" of the
    /// constant-folding tests).
    pub fn arithmetic_ops(&self) -> usize {
        self.ops
            .iter()
            .filter(|line| {
                line.starts_with("bin_")
                    || line.starts_with("add_carry_in")
                    || line.starts_with("neg")
                    || line.starts_with("not")
                    || line.starts_with("shift_")
                    || line.starts_with("rotl")
                    || line.starts_with("cntlz")
                    || line.starts_with("sign_extend")
            })
            .count()
    }
}

impl CodeEmitter for RecordingEmitter {
    fn scratch_regs(&self) -> u8 {
        4
    }
    fn load_imm(&mut self, dst: HostReg, value: u32) {
        self.log(format!("load_imm h{} {value:#x}", dst.0));
    }
    fn load_gpr(&mut self, dst: HostReg, src: GuestReg) {
        self.log(format!("load_gpr h{} r{src}", dst.0));
    }
    fn store_gpr(&mut self, dst: GuestReg, src: HostReg) {
        self.log(format!("store_gpr r{dst} h{}", src.0));
    }
    fn store_gpr_imm(&mut self, dst: GuestReg, value: u32) {
        self.log(format!("store_gpr_imm r{dst} {value:#x}"));
    }
    fn mov(&mut self, dst: HostReg, src: HostReg) {
        self.log(format!("mov h{} h{}", dst.0, src.0));
    }
    fn bin_rr(&mut self, op: BinOp, dst: HostReg, lhs: HostReg, rhs: HostReg, carry: CarryCapture) {
        self.log(format!(
            "bin_rr {op:?} h{} h{} h{} {carry:?}",
            dst.0, lhs.0, rhs.0
        ));
    }
    fn bin_ri(&mut self, op: BinOp, dst: HostReg, lhs: HostReg, imm: u32, carry: CarryCapture) {
        self.log(format!(
            "bin_ri {op:?} h{} h{} {imm:#x} {carry:?}",
            dst.0, lhs.0
        ));
    }
    fn add_carry_in(&mut self, dst: HostReg, lhs: HostReg, rhs: HostReg, capture: bool) {
        self.log(format!(
            "add_carry_in h{} h{} h{} {capture}",
            dst.0, lhs.0, rhs.0
        ));
    }
    fn not(&mut self, dst: HostReg, src: HostReg) {
        self.log(format!("not h{} h{}", dst.0, src.0));
    }
    fn neg(&mut self, dst: HostReg, src: HostReg) {
        self.log(format!("neg h{} h{}", dst.0, src.0));
    }
    fn sign_extend(&mut self, dst: HostReg, src: HostReg, from_bits: u8) {
        self.log(format!("sign_extend h{} h{} {from_bits}", dst.0, src.0));
    }
    fn count_leading_zeros(&mut self, dst: HostReg, src: HostReg) {
        self.log(format!("cntlz h{} h{}", dst.0, src.0));
    }
    fn rotate_left_imm(&mut self, dst: HostReg, src: HostReg, amount: u8) {
        self.log(format!("rotl h{} h{} {amount}", dst.0, src.0));
    }
    fn shift_imm(&mut self, op: ShiftOp, dst: HostReg, src: HostReg, amount: u8, carry: CarryCapture) {
        self.log(format!(
            "shift_imm {op:?} h{} h{} {amount} {carry:?}",
            dst.0, src.0
        ));
    }
    fn shift_reg(&mut self, op: ShiftOp, dst: HostReg, src: HostReg, amount: HostReg) {
        self.log(format!(
            "shift_reg {op:?} h{} h{} h{}",
            dst.0, src.0, amount.0
        ));
    }
    fn write_cr(&mut self, field: u8, src: HostReg) {
        self.log(format!("write_cr cr{field} h{}", src.0));
    }
    fn write_cr_imm(&mut self, field: u8, value: i64) {
        self.log(format!("write_cr_imm cr{field} {value:#x}"));
    }
    fn write_cr_cmp(&mut self, field: u8, lhs: HostReg, rhs: CmpOperand, signed: bool) {
        self.log(format!(
            "write_cr_cmp cr{field} h{} {rhs:?} signed={signed}",
            lhs.0
        ));
    }
    fn set_carry_imm(&mut self, carry: bool) {
        self.log(format!("set_carry_imm {carry}"));
    }
    fn write_lr_imm(&mut self, value: u32) {
        self.log(format!("write_lr_imm {value:#x}"));
    }
    fn decrement_ctr(&mut self) {
        self.log("decrement_ctr".to_string());
    }
    fn fallback(&mut self, raw: u32, address: u32, exit: FallbackExit) {
        self.log(format!("fallback {raw:#010x} @ {address:#010x} {exit:?}"));
    }
    fn exit(&mut self, target: ExitTarget) {
        self.log(format!("exit {target:?}"));
    }
    fn exit_if(&mut self, cond: BranchCond, target: ExitTarget) {
        self.log(format!("exit_if {cond:?} {target:?}"));
    }
}
