//! Basic-block analysis.
//!
//! `Analyzer::analyze` walks guest memory from a start address, decodes a
//! run of instructions into annotated `CodeOp` records, decides where the
//! block ends, and runs two static passes over the result: instruction
//! reordering (bubble compares toward their consuming branch, bubble
//! carry ops toward each other) and backward flag liveness (so the emitter
//! can skip flag updates nothing will read).
//!
//! Everything here is host-independent; the passes see only descriptor
//! metadata and register fields, never runtime values.

use crate::config::AnalyzerOptions;
use crate::isa::{
    Instruction, RegBits, BO_DONT_CHECK_CONDITION, BO_DONT_DECREMENT, SPR_LR, SPR_XER,
};
use crate::mem::GuestMemory;
use crate::tables::{DecodeTable, OpCategory, OpFlags, OpcodeDescriptor};

/// One analyzed guest instruction.
#[derive(Clone)]
pub struct CodeOp {
    pub address: u32,
    pub inst: Instruction,
    pub desc: &'static OpcodeDescriptor,
    /// General-purpose registers read / written.
    pub regs_in: RegBits,
    pub regs_out: RegBits,
    /// Float registers read, and the float register written (if any).
    pub fregs_in: RegBits,
    pub freg_out: Option<u8>,
    /// CR fields read / written, one bit per field.
    pub cr_in: u8,
    pub cr_out: u8,
    /// Branch destination when encoded in the word itself.
    pub branch_to: Option<u32>,
    pub branch_uses_ctr: bool,
    pub branch_is_idle_loop: bool,
    pub can_end_block: bool,
    pub can_cause_exception: bool,
    /// Folded away by the analyzer (e.g. an inlined return); the emitter
    /// must not generate code for it.
    pub skip: bool,
    pub outputs_carry: bool,
    pub outputs_cr0: bool,
    pub outputs_float_flag: bool,
    pub reads_carry: bool,
    pub reads_cr0: bool,
    pub reads_float_flag: bool,
    /// Filled by the backward liveness pass: is the named flag needed at or
    /// after this instruction, before the next write to it.
    pub wants_carry: bool,
    pub wants_cr0: bool,
    pub wants_float_flag: bool,
}

impl CodeOp {
    fn new(address: u32, inst: Instruction, desc: &'static OpcodeDescriptor) -> Self {
        CodeOp {
            address,
            inst,
            desc,
            regs_in: RegBits::EMPTY,
            regs_out: RegBits::EMPTY,
            fregs_in: RegBits::EMPTY,
            freg_out: None,
            cr_in: 0,
            cr_out: 0,
            branch_to: None,
            branch_uses_ctr: false,
            branch_is_idle_loop: false,
            can_end_block: false,
            can_cause_exception: false,
            skip: false,
            outputs_carry: false,
            outputs_cr0: false,
            outputs_float_flag: false,
            reads_carry: false,
            reads_cr0: false,
            reads_float_flag: false,
            wants_carry: true,
            wants_cr0: true,
            wants_float_flag: true,
        }
    }
}

/// Per-block metadata produced by one analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlock {
    /// Guest address of the first instruction.
    pub address: u32,
    /// Address the block falls through to (one past the last instruction
    /// fetched, following any inlined branches).
    pub end_address: u32,
    pub num_instructions: usize,
    /// No clean exit instruction was found within the size budget. Terminal
    /// for this compilation attempt: a broken block must not reach codegen.
    pub broken: bool,
    /// Instruction fetch faulted before anything was analyzed.
    pub memory_exception: bool,
    /// A word matched no known opcode; analysis aborted there.
    pub decode_failure: bool,
    /// Sum of per-instruction cycle estimates.
    pub num_cycles: u32,
    /// GPRs the block reads before writing.
    pub gpr_inputs: RegBits,
    pub gpr_any: bool,
    pub fpr_any: bool,
}

impl CodeBlock {
    fn new(address: u32) -> Self {
        CodeBlock {
            address,
            end_address: address,
            num_instructions: 0,
            broken: false,
            memory_exception: false,
            decode_failure: false,
            num_cycles: 0,
            gpr_inputs: RegBits::EMPTY,
            gpr_any: false,
            fpr_any: false,
        }
    }
}

/// Reusable fixed-capacity instruction buffer.
///
/// One analysis pass owns it exclusively, then the block compiler reads it;
/// the next pass overwrites it. Analysis never grows it past capacity — a
/// block that would need more instructions is cut short and marked broken
/// instead.
pub struct CodeBuffer {
    ops: Vec<CodeOp>,
    capacity: usize,
}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Self {
        CodeBuffer {
            ops: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[CodeOp] {
        &self.ops
    }

    fn clear(&mut self) {
        self.ops.clear();
    }

    fn push(&mut self, op: CodeOp) {
        debug_assert!(self.ops.len() < self.capacity);
        self.ops.push(op);
    }

    fn ops_mut(&mut self) -> &mut [CodeOp] {
        &mut self.ops
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReorderKind {
    Carry,
    Cmp,
}

/// The basic-block analyzer.
pub struct Analyzer<'a> {
    table: &'a DecodeTable,
    options: AnalyzerOptions,
}

impl<'a> Analyzer<'a> {
    pub fn new(table: &'a DecodeTable, options: AnalyzerOptions) -> Self {
        Analyzer { table, options }
    }

    pub fn options(&self) -> &AnalyzerOptions {
        &self.options
    }

    /// Analyze one basic block starting at `address`, writing at most
    /// `size_budget` instruction records into `buffer`.
    ///
    /// The returned block carries the failure flags; callers must check
    /// `memory_exception` / `decode_failure` / `broken` before compiling.
    pub fn analyze<M: GuestMemory>(
        &self,
        mem: &mut M,
        address: u32,
        buffer: &mut CodeBuffer,
        size_budget: usize,
    ) -> CodeBlock {
        buffer.clear();
        let mut block = CodeBlock::new(address);

        if address == 0 {
            block.memory_exception = true;
            return block;
        }

        let budget = size_budget.min(buffer.capacity()).max(1);

        let mut found_exit = false;
        let mut found_call = false;
        let mut caller = 0usize;
        let mut num_follows = 0u32;
        // Internal forward branches keep the block open past an exit
        // instruction until their target has been passed.
        let mut farthest_internal_target = address;
        let mut addr = address;

        for i in 0..budget {
            let raw = match mem.read_u32(addr) {
                Ok(word) => word,
                Err(fault) => {
                    if i == 0 {
                        block.memory_exception = true;
                    } else {
                        log::warn!(
                            "instruction fetch fault inside block {:#010X}: {fault}",
                            address
                        );
                    }
                    break;
                }
            };
            let Some(desc) = self.table.describe(raw) else {
                block.decode_failure = true;
                log::warn!("undecodable instruction {raw:#010X} at {addr:#010X}, aborting block");
                break;
            };

            let inst = Instruction(raw);
            let mut op = CodeOp::new(addr, inst, desc);
            block.num_cycles += u32::from(desc.cycles);
            self.set_instruction_stats(&mut block, &mut op);

            let mut follow = false;
            if self.options.branch_follow && budget > 1 {
                if inst.opcd() == 18 {
                    // Direct unconditional branch: follow it in place unless
                    // it targets the block head.
                    follow = op.branch_to.is_some() && op.branch_to != Some(address);
                    if inst.lk() {
                        found_call = true;
                        caller = i;
                    }
                } else if inst.opcd() == 16
                    && inst.bo() & BO_DONT_DECREMENT != 0
                    && inst.bo() & BO_DONT_CHECK_CONDITION != 0
                {
                    // Unconditional conditional-form branch; rare.
                    follow = op.branch_to.is_some() && op.branch_to != Some(address);
                    if inst.lk() {
                        found_call = true;
                        caller = i;
                    }
                } else if inst.opcd() == 19 && inst.subop10() == 16 && !inst.lk() && found_call {
                    // Return: we know where the last call came from, so the
                    // return address is known even though it lives in LR.
                    op.branch_to = Some(buffer.ops()[caller].address.wrapping_add(4));
                    if inst.bo() & BO_DONT_DECREMENT != 0
                        && inst.bo() & BO_DONT_CHECK_CONDITION != 0
                        && num_follows < self.options.branch_follow_limit
                    {
                        follow = true;
                        found_call = false;
                        op.skip = true;
                    }
                } else if inst.is_mtspr() && inst.spr() == SPR_LR {
                    // LR overwritten through a generic move; give up on
                    // tracking the return address.
                    found_call = false;
                }
            }

            let conditional_continue =
                self.options.conditional_continue && can_continue_past(inst);

            let op_address = op.address;
            let op_branch_to = op.branch_to;
            let op_can_end_block = op.can_end_block;
            buffer.push(op);

            let idle = op_branch_to == Some(address)
                && is_busy_wait_loop(address, &buffer.ops()[..=i]);
            buffer.ops_mut()[i].branch_is_idle_loop = idle;

            if follow && num_follows < self.options.branch_follow_limit {
                num_follows += 1;
                addr = op_branch_to.expect("followed branch has a target");
            } else {
                addr = addr.wrapping_add(4);
                if conditional_continue {
                    // A skipped conditional branch breaks the call/return
                    // pairing; stop substituting return addresses.
                    found_call = false;
                    if let Some(target) = op_branch_to {
                        if target > op_address && target > farthest_internal_target {
                            farthest_internal_target = target;
                        }
                    }
                } else if op_can_end_block {
                    if farthest_internal_target <= op_address {
                        found_exit = true;
                        break;
                    }
                    // An earlier internal branch lands past this exit; the
                    // block is not done yet.
                }
            }
        }

        block.num_instructions = buffer.len();
        block.end_address = addr;

        if buffer.len() > 1 {
            self.reorder_instructions(buffer.ops_mut());
        }

        if !found_exit && !buffer.is_empty() {
            block.broken = true;
        }

        self.liveness_pass(&mut block, buffer.ops_mut());

        block
    }

    fn set_instruction_stats(&self, block: &mut CodeBlock, op: &mut CodeOp) {
        let inst = op.inst;
        let flags = op.desc.flags;

        let first_fpu_instruction = flags.contains(OpFlags::USE_FPU) && !block.fpr_any;
        block.fpr_any |= flags.contains(OpFlags::USE_FPU);

        if flags.contains(OpFlags::READ_CR_BI) {
            op.cr_in |= 1 << (inst.bi() >> 2);
        }
        if flags.contains(OpFlags::SET_CRF) {
            op.cr_out |= 1 << inst.crfd();
        }
        if flags.contains(OpFlags::SET_CR0) || (flags.contains(OpFlags::RC_BIT) && inst.rc()) {
            op.cr_out |= 1;
        }
        op.reads_cr0 = op.cr_in & 1 != 0;
        op.outputs_cr0 = op.cr_out & 1 != 0;

        op.outputs_carry = flags.contains(OpFlags::SET_CA);
        op.reads_carry = flags.contains(OpFlags::READ_CA);
        // SPR moves can touch the carry through the XER register.
        if inst.is_mfspr() {
            op.reads_carry = inst.spr() == SPR_XER;
        }
        if inst.is_mtspr() {
            op.outputs_carry = inst.spr() == SPR_XER;
        }

        op.outputs_float_flag = flags.contains(OpFlags::SET_FLOAT_FLAG);
        op.reads_float_flag = flags.contains(OpFlags::READ_FLOAT_FLAG);

        op.can_end_block = flags.contains(OpFlags::ENDBLOCK);
        op.can_cause_exception = flags.contains(OpFlags::CAN_EXCEPTION) || first_fpu_instruction;

        if flags.contains(OpFlags::OUT_D) {
            op.regs_out.set(inst.rd());
        }
        if flags.contains(OpFlags::OUT_A) {
            op.regs_out.set(inst.ra());
        }
        if flags.contains(OpFlags::IN_A) || (flags.contains(OpFlags::IN_A0) && inst.ra() != 0) {
            op.regs_in.set(inst.ra());
        }
        if flags.contains(OpFlags::IN_B) {
            op.regs_in.set(inst.rb());
        }
        if flags.contains(OpFlags::IN_S) {
            op.regs_in.set(inst.rs());
        }
        match inst.opcd() {
            // lmw / stmw touch everything from their named register up
            46 => {
                for reg in inst.rd()..32 {
                    op.regs_out.set(reg);
                }
            }
            47 => {
                for reg in inst.rs()..32 {
                    op.regs_in.set(reg);
                }
            }
            _ => {}
        }
        block.gpr_any |= !op.regs_in.is_empty() || !op.regs_out.is_empty();

        if flags.contains(OpFlags::OUT_FD) {
            op.freg_out = Some(inst.fd());
        }
        if flags.contains(OpFlags::IN_FA) {
            op.fregs_in.set(inst.fa());
        }
        if flags.contains(OpFlags::IN_FB) {
            op.fregs_in.set(inst.fb());
        }
        if flags.contains(OpFlags::IN_FS) {
            op.fregs_in.set(inst.rs());
        }

        op.branch_to = inst.branch_target(op.address);
        op.branch_uses_ctr = match (inst.opcd(), inst.subop10()) {
            (16, _) => inst.bo() & BO_DONT_DECREMENT == 0,
            (19, 16) | (19, 528) => inst.bo() & BO_DONT_DECREMENT == 0,
            _ => false,
        };
    }

    /// Can `a` and `b` (adjacent, `a` first) swap without changing any
    /// register or flag value?
    pub fn can_swap_adjacent_ops(&self, a: &CodeOp, b: &CodeOp) -> bool {
        let a_flags = a.desc.flags;
        let b_flags = b.desc.flags;

        // Anything that can fault or leave the block pins its position.
        if a.can_cause_exception || b.can_cause_exception {
            return false;
        }
        if a.can_end_block || b.can_end_block {
            return false;
        }
        let pinned = OpFlags::NO_REORDER.union(OpFlags::OE_CAPABLE);
        if a_flags.intersects(pinned) || b_flags.intersects(pinned) {
            return false;
        }
        // Two carry-touching ops must keep their order.
        let carry = OpFlags::SET_CA.union(OpFlags::READ_CA);
        if a_flags.intersects(carry) && b_flags.intersects(carry) {
            return false;
        }
        // For now, only integer ops are acceptable swap partners.
        if b.desc.category != OpCategory::Integer {
            return false;
        }

        // Register collisions, in both directions, including write-after-write.
        if b.regs_out.intersects(a.regs_in) {
            return false;
        }
        if b.cr_out & a.cr_in != 0 {
            return false;
        }
        if a.regs_out.intersects(b.regs_in) {
            return false;
        }
        if a.cr_out & b.cr_in != 0 {
            return false;
        }
        if b.regs_out.intersects(a.regs_out) {
            return false;
        }
        if b.cr_out & a.cr_out != 0 {
            return false;
        }

        true
    }

    fn reorder_instructions(&self, ops: &mut [CodeOp]) {
        // For carry, bubble instructions *towards* each other; one direction
        // often isn't enough to get producer/consumer pairs adjacent.
        if self.options.reorder_carry {
            self.reorder_pass(ops, false, ReorderKind::Carry);
            self.reorder_pass(ops, true, ReorderKind::Carry);
        }
        // Move CR-writing instructions (typically compares) down toward the
        // branch that consumes them.
        if self.options.reorder_cmp {
            self.reorder_pass(ops, false, ReorderKind::Cmp);
        }
    }

    fn reorder_pass(&self, ops: &mut [CodeOp], reverse: bool, kind: ReorderKind) {
        let len = ops.len() as isize;
        let start = if reverse { len - 1 } else { 0 };
        let end = if reverse { 0 } else { len - 1 };
        let increment: isize = if reverse { -1 } else { 1 };

        let mut i = start;
        let mut next = start;
        let mut go_backwards = false;

        loop {
            if go_backwards {
                i -= increment;
                go_backwards = false;
            } else {
                i = next;
                next += increment;
            }
            if i == end {
                break;
            }

            let a = i as usize;
            let b = (i + increment) as usize;

            let candidate = match kind {
                ReorderKind::Carry => is_carry_op(&ops[a]),
                ReorderKind::Cmp => ops[a].cr_out != 0,
            };
            if !candidate {
                continue;
            }

            // Once next to a carry partner, don't move away from it.
            if kind == ReorderKind::Carry && i != start {
                let prev = (i - increment) as usize;
                let a_flags = ops[a].desc.flags;
                let prev_flags = ops[prev].desc.flags;
                if !reverse
                    && a_flags.contains(OpFlags::READ_CA)
                    && prev_flags.contains(OpFlags::SET_CA)
                {
                    continue;
                }
                if reverse
                    && a_flags.contains(OpFlags::SET_CA)
                    && prev_flags.contains(OpFlags::READ_CA)
                {
                    continue;
                }
            }

            if self.can_swap_adjacent_ops(&ops[a], &ops[b]) {
                ops.swap(a, b);
                if i != start {
                    // A swap sometimes reveals another opportunity one step
                    // back; revisit it.
                    go_backwards = true;
                }
            }
        }
    }

    /// Backward flag liveness. Seeded wanted-at-tail: assume whatever block
    /// runs next reads every flag. A write resets the running want before
    /// the writer's own read requirement is folded back in, so an
    /// instruction that both reads and writes a flag keeps it alive.
    fn liveness_pass(&self, block: &mut CodeBlock, ops: &mut [CodeOp]) {
        let mut wants_carry = true;
        let mut wants_cr0 = true;
        let mut wants_float_flag = true;
        let mut gpr_inputs = RegBits::EMPTY;

        for op in ops.iter_mut().rev() {
            // Control flow may leave the block here; flags must be
            // architecturally visible at that point.
            let may_exit = op.can_end_block || op.can_cause_exception;

            op.wants_carry = wants_carry || may_exit;
            op.wants_cr0 = wants_cr0 || may_exit;
            op.wants_float_flag = wants_float_flag || may_exit;

            wants_carry |= op.reads_carry || may_exit;
            wants_cr0 |= op.reads_cr0 || may_exit;
            wants_float_flag |= op.reads_float_flag || may_exit;

            wants_carry &= !op.outputs_carry || op.reads_carry;
            wants_cr0 &= !op.outputs_cr0 || op.reads_cr0;
            wants_float_flag &= !op.outputs_float_flag || op.reads_float_flag;

            gpr_inputs.remove_all(op.regs_out);
            gpr_inputs.insert_all(op.regs_in);
        }

        block.gpr_inputs = gpr_inputs;
    }
}

fn is_carry_op(op: &CodeOp) -> bool {
    op.desc.flags.contains(OpFlags::SET_CA)
        && !op.desc.flags.contains(OpFlags::OE_CAPABLE)
        && op.desc.category == OpCategory::Integer
}

fn can_continue_past(inst: Instruction) -> bool {
    let conditional = inst.bo() & BO_DONT_DECREMENT == 0
        || inst.bo() & BO_DONT_CHECK_CONDITION == 0;
    match inst.opcd() {
        16 => conditional,
        19 if inst.subop10() == 16 => conditional,
        19 if inst.subop10() == 528 => inst.bo() & BO_DONT_CHECK_CONDITION == 0,
        // traps test a condition and raise or fall through at runtime
        3 => true,
        31 if inst.subop10() == 4 => true,
        _ => false,
    }
}

/// Very basic busy-wait detection:
///   * the loop branches to its own start and contains no other branches,
///   * it does not write memory,
///   * it only reads registers it wrote earlier in the loop, or never
///     writes the registers it read.
fn is_busy_wait_loop(block_address: u32, ops: &[CodeOp]) -> bool {
    let mut write_disallowed = RegBits::EMPTY;
    let mut written = RegBits::EMPTY;
    let last = ops.len() - 1;

    for (i, op) in ops.iter().enumerate() {
        match op.desc.category {
            OpCategory::Branch => {
                if op.branch_uses_ctr {
                    return false;
                }
                if op.branch_to == Some(block_address) && i == last {
                    return true;
                }
            }
            OpCategory::Integer | OpCategory::Load => {
                for reg in op.regs_in.iter() {
                    if written.contains(reg) {
                        continue;
                    }
                    write_disallowed.set(reg);
                }
                for reg in op.regs_out.iter() {
                    if write_disallowed.contains(reg) {
                        return false;
                    }
                    written.set(reg);
                }
            }
            _ => return false,
        }
    }
    false
}
