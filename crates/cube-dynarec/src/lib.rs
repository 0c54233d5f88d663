//! Cranelift host backend for the recompiler core.
//!
//! Implements the `cube_jit::emit::CodeEmitter` contract on top of a
//! Cranelift JIT module: scratch registers become SSA variables, guest
//! state lives behind a pointer parameter, and the interpreter fallback is
//! an indirect call through a hooks structure passed alongside it.

mod state;

pub use state::{CrPair, FallbackHooks, InterpretFn, JitState};

use std::mem::offset_of;

use cranelift_codegen::entity::EntityRef;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, InstBuilder, MemFlags, SigRef, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};

use cube_jit::analyzer::{Analyzer, CodeBuffer};
use cube_jit::compiler::{BlockCompiler, CompileError};
use cube_jit::config::JitOptions;
use cube_jit::emit::{
    BinOp, BranchCond, CarryCapture, CmpOperand, CodeEmitter, CrBit, ExitTarget, FallbackExit,
    GuestReg, HostReg, ShiftOp,
};
use cube_jit::mem::GuestMemory;
use cube_jit::tables::DecodeTable;

/// Scratch pool exposed to the register cache. Cranelift allocates real
/// machine registers underneath, so this bounds cache pressure, not
/// correctness.
const SCRATCH_REGS: u8 = 8;

type BlockFn = unsafe extern "C" fn(*mut JitState, *mut FallbackHooks);

/// Pointer to a compiled native entry point.
#[derive(Clone, Copy)]
pub struct BlockEntry(*const u8);

impl BlockEntry {
    fn as_fn(self) -> BlockFn {
        // SAFETY: entry pointers come from the Cranelift JIT with exactly
        // this signature.
        unsafe { std::mem::transmute(self.0) }
    }
}

impl std::fmt::Debug for BlockEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockEntry({:p})", self.0)
    }
}

/// Metadata and executable for one compiled block.
#[derive(Debug, Clone, Copy)]
pub struct CompiledBlock {
    pub address: u32,
    pub end_address: u32,
    pub instruction_count: usize,
    /// Estimated guest cycles for the whole block.
    pub cycles: u32,
    entry: BlockEntry,
}

impl CompiledBlock {
    /// Run the block against `state`. Exits write `state.pc`.
    pub fn execute(&self, state: &mut JitState, hooks: &mut FallbackHooks) {
        // SAFETY: the block was generated with the `BlockFn` signature and
        // only dereferences the two pointers it is given.
        unsafe {
            (self.entry.as_fn())(state as *mut JitState, hooks as *mut FallbackHooks);
        }
    }
}

const GPR_BASE: i32 = offset_of!(JitState, gpr) as i32;
const CR_BASE: i32 = offset_of!(JitState, cr) as i32;
const LR_OFFSET: i32 = offset_of!(JitState, lr) as i32;
const CTR_OFFSET: i32 = offset_of!(JitState, ctr) as i32;
const CA_OFFSET: i32 = offset_of!(JitState, xer_ca) as i32;
const PC_OFFSET: i32 = offset_of!(JitState, pc) as i32;
const HOOKS_USER_OFFSET: i32 = offset_of!(FallbackHooks, user) as i32;
const HOOKS_INTERPRET_OFFSET: i32 = offset_of!(FallbackHooks, interpret) as i32;

fn gpr_offset(reg: GuestReg) -> i32 {
    GPR_BASE + i32::from(reg) * 4
}

fn cr_value_offset(field: u8) -> i32 {
    CR_BASE + i32::from(field) * 8
}

fn cr_sign_offset(field: u8) -> i32 {
    cr_value_offset(field) + 4
}

/// `CodeEmitter` over one in-progress Cranelift function.
struct CraneliftEmitter<'a> {
    builder: FunctionBuilder<'a>,
    state_ptr: Value,
    hooks_ptr: Value,
    vars: Vec<Variable>,
    ptr_type: cranelift_codegen::ir::Type,
    flags: MemFlags,
    fallback_sig: SigRef,
}

impl CraneliftEmitter<'_> {
    fn var(&self, reg: HostReg) -> Variable {
        self.vars[usize::from(reg.0)]
    }

    fn use_reg(&mut self, reg: HostReg) -> Value {
        self.builder.use_var(self.var(reg))
    }

    fn def_reg(&mut self, reg: HostReg, value: Value) {
        self.builder.def_var(self.var(reg), value);
    }

    fn iconst32(&mut self, value: u32) -> Value {
        // I32 immediates must be passed sign-extended.
        self.builder.ins().iconst(types::I32, i64::from(value as i32))
    }

    fn load_state32(&mut self, offset: i32) -> Value {
        self.builder
            .ins()
            .load(types::I32, self.flags, self.state_ptr, offset)
    }

    fn store_state32(&mut self, offset: i32, value: Value) {
        self.builder
            .ins()
            .store(self.flags, value, self.state_ptr, offset);
    }

    fn store_carry_bool(&mut self, carry_i8: Value) {
        let wide = self.builder.ins().uextend(types::I32, carry_i8);
        self.store_state32(CA_OFFSET, wide);
    }

    fn bin_values(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        match op {
            BinOp::Add => self.builder.ins().iadd(lhs, rhs),
            BinOp::Sub => self.builder.ins().isub(lhs, rhs),
            BinOp::And => self.builder.ins().band(lhs, rhs),
            BinOp::Or => self.builder.ins().bor(lhs, rhs),
            BinOp::Xor => self.builder.ins().bxor(lhs, rhs),
            BinOp::Nand => {
                let and = self.builder.ins().band(lhs, rhs);
                self.builder.ins().bnot(and)
            }
            BinOp::Nor => {
                let or = self.builder.ins().bor(lhs, rhs);
                self.builder.ins().bnot(or)
            }
            BinOp::Eqv => {
                let xor = self.builder.ins().bxor(lhs, rhs);
                self.builder.ins().bnot(xor)
            }
            BinOp::Andc => {
                let inv = self.builder.ins().bnot(rhs);
                self.builder.ins().band(lhs, inv)
            }
            BinOp::Orc => {
                let inv = self.builder.ins().bnot(rhs);
                self.builder.ins().bor(lhs, inv)
            }
            BinOp::Mul => self.builder.ins().imul(lhs, rhs),
        }
    }

    fn capture_carry(
        &mut self,
        op: BinOp,
        lhs: Value,
        rhs: Value,
        result: Value,
        carry: CarryCapture,
    ) {
        let carry_i8 = match (op, carry) {
            (_, CarryCapture::None) => return,
            (BinOp::Add, CarryCapture::HostCarry) => {
                self.builder.ins().icmp(IntCC::UnsignedLessThan, result, lhs)
            }
            (BinOp::Add, CarryCapture::HostCarryInverted) => {
                self.builder
                    .ins()
                    .icmp(IntCC::UnsignedGreaterThanOrEqual, result, lhs)
            }
            (BinOp::Sub, CarryCapture::HostCarry) => {
                self.builder.ins().icmp(IntCC::UnsignedLessThan, lhs, rhs)
            }
            // Guest carry of the subtract family is the inverted borrow.
            (BinOp::Sub, CarryCapture::HostCarryInverted) => self
                .builder
                .ins()
                .icmp(IntCC::UnsignedGreaterThanOrEqual, lhs, rhs),
            _ => {
                debug_assert!(false, "carry capture on a non-arithmetic op");
                return;
            }
        };
        self.store_carry_bool(carry_i8);
    }

    fn exit_pc_value(&mut self, target: ExitTarget) -> Value {
        match target {
            ExitTarget::Direct(address) => self.iconst32(address),
            ExitTarget::LinkRegister => {
                let lr = self.load_state32(LR_OFFSET);
                self.builder.ins().band_imm(lr, -4)
            }
            ExitTarget::CountRegister => {
                let ctr = self.load_state32(CTR_OFFSET);
                self.builder.ins().band_imm(ctr, -4)
            }
        }
    }

    fn emit_return(&mut self, pc: Value) {
        self.store_state32(PC_OFFSET, pc);
        self.builder.ins().return_(&[]);
    }
}

impl CodeEmitter for CraneliftEmitter<'_> {
    fn scratch_regs(&self) -> u8 {
        SCRATCH_REGS
    }

    fn load_imm(&mut self, dst: HostReg, value: u32) {
        let v = self.iconst32(value);
        self.def_reg(dst, v);
    }

    fn load_gpr(&mut self, dst: HostReg, src: GuestReg) {
        let v = self.load_state32(gpr_offset(src));
        self.def_reg(dst, v);
    }

    fn store_gpr(&mut self, dst: GuestReg, src: HostReg) {
        let v = self.use_reg(src);
        self.store_state32(gpr_offset(dst), v);
    }

    fn store_gpr_imm(&mut self, dst: GuestReg, value: u32) {
        let v = self.iconst32(value);
        self.store_state32(gpr_offset(dst), v);
    }

    fn mov(&mut self, dst: HostReg, src: HostReg) {
        let v = self.use_reg(src);
        self.def_reg(dst, v);
    }

    fn bin_rr(&mut self, op: BinOp, dst: HostReg, lhs: HostReg, rhs: HostReg, carry: CarryCapture) {
        let lhs_v = self.use_reg(lhs);
        let rhs_v = self.use_reg(rhs);
        let result = self.bin_values(op, lhs_v, rhs_v);
        self.capture_carry(op, lhs_v, rhs_v, result, carry);
        self.def_reg(dst, result);
    }

    fn bin_ri(&mut self, op: BinOp, dst: HostReg, lhs: HostReg, imm: u32, carry: CarryCapture) {
        let lhs_v = self.use_reg(lhs);
        let rhs_v = self.iconst32(imm);
        let result = self.bin_values(op, lhs_v, rhs_v);
        self.capture_carry(op, lhs_v, rhs_v, result, carry);
        self.def_reg(dst, result);
    }

    fn add_carry_in(&mut self, dst: HostReg, lhs: HostReg, rhs: HostReg, capture: bool) {
        let a = self.use_reg(lhs);
        let b = self.use_reg(rhs);
        let ca = self.load_state32(CA_OFFSET);
        let partial = self.builder.ins().iadd(a, b);
        let result = self.builder.ins().iadd(partial, ca);
        if capture {
            let c1 = self.builder.ins().icmp(IntCC::UnsignedLessThan, partial, a);
            let c2 = self
                .builder
                .ins()
                .icmp(IntCC::UnsignedLessThan, result, partial);
            let c1 = self.builder.ins().uextend(types::I32, c1);
            let c2 = self.builder.ins().uextend(types::I32, c2);
            let ca_out = self.builder.ins().bor(c1, c2);
            self.store_state32(CA_OFFSET, ca_out);
        }
        self.def_reg(dst, result);
    }

    fn not(&mut self, dst: HostReg, src: HostReg) {
        let v = self.use_reg(src);
        let r = self.builder.ins().bnot(v);
        self.def_reg(dst, r);
    }

    fn neg(&mut self, dst: HostReg, src: HostReg) {
        let v = self.use_reg(src);
        let r = self.builder.ins().ineg(v);
        self.def_reg(dst, r);
    }

    fn sign_extend(&mut self, dst: HostReg, src: HostReg, from_bits: u8) {
        let v = self.use_reg(src);
        let narrow = if from_bits == 16 {
            self.builder.ins().ireduce(types::I16, v)
        } else {
            self.builder.ins().ireduce(types::I8, v)
        };
        let wide = self.builder.ins().sextend(types::I32, narrow);
        self.def_reg(dst, wide);
    }

    fn count_leading_zeros(&mut self, dst: HostReg, src: HostReg) {
        let v = self.use_reg(src);
        let r = self.builder.ins().clz(v);
        self.def_reg(dst, r);
    }

    fn rotate_left_imm(&mut self, dst: HostReg, src: HostReg, amount: u8) {
        let v = self.use_reg(src);
        let amt = self.iconst32(u32::from(amount));
        let r = self.builder.ins().rotl(v, amt);
        self.def_reg(dst, r);
    }

    fn shift_imm(&mut self, op: ShiftOp, dst: HostReg, src: HostReg, amount: u8, carry: CarryCapture) {
        let v = self.use_reg(src);
        let result = match op {
            ShiftOp::Left => self.builder.ins().ishl_imm(v, i64::from(amount)),
            ShiftOp::RightLogical => self.builder.ins().ushr_imm(v, i64::from(amount)),
            ShiftOp::RightArithmetic => self.builder.ins().sshr_imm(v, i64::from(amount)),
        };
        if carry != CarryCapture::None {
            debug_assert_eq!(op, ShiftOp::RightArithmetic);
            // carry = negative input with any one bits shifted out
            let mask = if amount == 0 { 0 } else { (1u32 << amount) - 1 };
            let negative = self
                .builder
                .ins()
                .icmp_imm(IntCC::SignedLessThan, v, 0);
            let shifted_out = self.builder.ins().band_imm(v, i64::from(mask as i32));
            let any_out = self
                .builder
                .ins()
                .icmp_imm(IntCC::NotEqual, shifted_out, 0);
            let neg32 = self.builder.ins().uextend(types::I32, negative);
            let out32 = self.builder.ins().uextend(types::I32, any_out);
            let ca = self.builder.ins().band(neg32, out32);
            self.store_state32(CA_OFFSET, ca);
        }
        self.def_reg(dst, result);
    }

    fn shift_reg(&mut self, op: ShiftOp, dst: HostReg, src: HostReg, amount: HostReg) {
        let v = self.use_reg(src);
        let amt_raw = self.use_reg(amount);
        let amt = self.builder.ins().band_imm(amt_raw, 0x3F);
        // Cranelift masks shift amounts to the type width, so the >= 32
        // case is selected explicitly.
        let shifted = match op {
            ShiftOp::Left => self.builder.ins().ishl(v, amt),
            ShiftOp::RightLogical => self.builder.ins().ushr(v, amt),
            ShiftOp::RightArithmetic => self.builder.ins().sshr(v, amt),
        };
        let overflow_fill = match op {
            ShiftOp::RightArithmetic => self.builder.ins().sshr_imm(v, 31),
            _ => self.iconst32(0),
        };
        let big = self
            .builder
            .ins()
            .icmp_imm(IntCC::UnsignedGreaterThanOrEqual, amt, 32);
        let r = self.builder.ins().select(big, overflow_fill, shifted);
        self.def_reg(dst, r);
    }

    fn write_cr(&mut self, field: u8, src: HostReg) {
        let v = self.use_reg(src);
        let sign = self.builder.ins().sshr_imm(v, 31);
        self.store_state32(cr_value_offset(field), v);
        self.store_state32(cr_sign_offset(field), sign);
    }

    fn write_cr_imm(&mut self, field: u8, value: i64) {
        let lo = self.iconst32(value as u32);
        let hi = self.iconst32((value >> 32) as u32);
        self.store_state32(cr_value_offset(field), lo);
        self.store_state32(cr_sign_offset(field), hi);
    }

    fn write_cr_cmp(&mut self, field: u8, lhs: HostReg, rhs: CmpOperand, signed: bool) {
        let lhs_v = self.use_reg(lhs);
        let lhs64 = if signed {
            self.builder.ins().sextend(types::I64, lhs_v)
        } else {
            self.builder.ins().uextend(types::I64, lhs_v)
        };
        let rhs64 = match rhs {
            CmpOperand::Imm(value) => {
                let imm = if signed {
                    i64::from(value as i32)
                } else {
                    i64::from(value)
                };
                self.builder.ins().iconst(types::I64, imm)
            }
            CmpOperand::Host(reg) => {
                let v = self.use_reg(reg);
                if signed {
                    self.builder.ins().sextend(types::I64, v)
                } else {
                    self.builder.ins().uextend(types::I64, v)
                }
            }
        };
        let diff = self.builder.ins().isub(lhs64, rhs64);
        let lo = self.builder.ins().ireduce(types::I32, diff);
        let hi64 = self.builder.ins().ushr_imm(diff, 32);
        let hi = self.builder.ins().ireduce(types::I32, hi64);
        self.store_state32(cr_value_offset(field), lo);
        self.store_state32(cr_sign_offset(field), hi);
    }

    fn set_carry_imm(&mut self, carry: bool) {
        let v = self.iconst32(u32::from(carry));
        self.store_state32(CA_OFFSET, v);
    }

    fn write_lr_imm(&mut self, value: u32) {
        let v = self.iconst32(value);
        self.store_state32(LR_OFFSET, v);
    }

    fn decrement_ctr(&mut self) {
        let ctr = self.load_state32(CTR_OFFSET);
        let dec = self.builder.ins().iadd_imm(ctr, -1);
        self.store_state32(CTR_OFFSET, dec);
    }

    fn fallback(&mut self, raw: u32, address: u32, exit: FallbackExit) {
        let interpret = self.builder.ins().load(
            self.ptr_type,
            self.flags,
            self.hooks_ptr,
            HOOKS_INTERPRET_OFFSET,
        );
        let user = self
            .builder
            .ins()
            .load(self.ptr_type, self.flags, self.hooks_ptr, HOOKS_USER_OFFSET);
        let raw_v = self.iconst32(raw);
        let pc_v = self.iconst32(address);
        let call = self
            .builder
            .ins()
            .call_indirect(self.fallback_sig, interpret, &[user, raw_v, pc_v]);
        let next_pc = self.builder.inst_results(call)[0];

        match exit {
            FallbackExit::Continue => {}
            FallbackExit::AlwaysExit => {
                self.emit_return(next_pc);
            }
            FallbackExit::ExitIfDiverted => {
                let expected = self.iconst32(address.wrapping_add(4));
                let diverted = self.builder.ins().icmp(IntCC::NotEqual, next_pc, expected);
                let exit_block = self.builder.create_block();
                let resume_block = self.builder.create_block();
                self.builder
                    .ins()
                    .brif(diverted, exit_block, &[], resume_block, &[]);
                self.builder.switch_to_block(exit_block);
                self.builder.seal_block(exit_block);
                self.emit_return(next_pc);
                self.builder.switch_to_block(resume_block);
                self.builder.seal_block(resume_block);
            }
        }
    }

    fn exit(&mut self, target: ExitTarget) {
        let pc = self.exit_pc_value(target);
        self.emit_return(pc);
    }

    fn exit_if(&mut self, cond: BranchCond, target: ExitTarget) {
        let mut taken: Option<Value> = None;

        if let Some(ctr) = cond.ctr {
            let value = self.load_state32(CTR_OFFSET);
            let cc = if ctr.branch_if_zero {
                IntCC::Equal
            } else {
                IntCC::NotEqual
            };
            taken = Some(self.builder.ins().icmp_imm(cc, value, 0));
        }

        if let Some(cr) = cond.cr {
            let value_word = self.load_state32(cr_value_offset(cr.field));
            let sign_word = self.load_state32(cr_sign_offset(cr.field));
            let bit = match cr.bit {
                CrBit::Eq => self.builder.ins().icmp_imm(IntCC::Equal, value_word, 0),
                CrBit::Lt => self
                    .builder
                    .ins()
                    .icmp_imm(IntCC::SignedLessThan, sign_word, 0),
                CrBit::Gt => {
                    let not_lt = self
                        .builder
                        .ins()
                        .icmp_imm(IntCC::SignedGreaterThanOrEqual, sign_word, 0);
                    let not_eq = self.builder.ins().icmp_imm(IntCC::NotEqual, value_word, 0);
                    self.builder.ins().band(not_lt, not_eq)
                }
                // Summary overflow is never set by emitted compares.
                CrBit::So => self.builder.ins().iconst(types::I8, 0),
            };
            let bit = if cr.expect_set {
                bit
            } else {
                self.builder.ins().bxor_imm(bit, 1)
            };
            taken = Some(match taken {
                Some(prev) => self.builder.ins().band(prev, bit),
                None => bit,
            });
        }

        let taken = taken.expect("conditional exit with an empty condition");
        let taken_block = self.builder.create_block();
        let fall_block = self.builder.create_block();
        self.builder.ins().brif(taken, taken_block, &[], fall_block, &[]);
        self.builder.switch_to_block(taken_block);
        self.builder.seal_block(taken_block);
        let pc = self.exit_pc_value(target);
        self.emit_return(pc);
        self.builder.switch_to_block(fall_block);
        self.builder.seal_block(fall_block);
    }
}

/// The Cranelift backend: owns the JIT module and compiles one block at a
/// time through the analyzer and the block compiler.
pub struct CraneliftBackend {
    module: JITModule,
    ctx: cranelift_codegen::Context,
    builder_ctx: FunctionBuilderContext,
    next_symbol_id: u64,
}

impl Default for CraneliftBackend {
    fn default() -> Self {
        let mut flag_builder = settings::builder();
        // Favor runtime speed for hot instruction paths.
        flag_builder
            .set("opt_level", "speed")
            .expect("set cranelift opt_level");
        let flags = settings::Flags::new(flag_builder);

        let isa_builder = cranelift_native::builder().expect("create host ISA builder");
        let isa = isa_builder.finish(flags).expect("finish host ISA");
        let jit_builder = JITBuilder::with_isa(isa, default_libcall_names());
        let module = JITModule::new(jit_builder);
        let ctx = module.make_context();

        CraneliftBackend {
            module,
            ctx,
            builder_ctx: FunctionBuilderContext::new(),
            next_symbol_id: 0,
        }
    }
}

impl CraneliftBackend {
    pub fn name(&self) -> &'static str {
        "cranelift"
    }

    /// Analyze and compile one block starting at `address`.
    ///
    /// `buffer` is the reusable analysis buffer; its contents are
    /// overwritten. Analysis failures surface as the matching
    /// `CompileError` — the caller falls back to its non-compiled path.
    pub fn compile_block<M: GuestMemory>(
        &mut self,
        table: &DecodeTable,
        options: &JitOptions,
        mem: &mut M,
        buffer: &mut CodeBuffer,
        address: u32,
    ) -> Result<CompiledBlock, CompileError> {
        let analyzer = Analyzer::new(table, options.analyzer);
        let block = analyzer.analyze(mem, address, buffer, options.max_block_instructions);

        let ptr_type = self.module.target_config().pointer_type();

        self.ctx.clear();
        self.ctx.func.signature.call_conv = self.module.target_config().default_call_conv;
        self.ctx.func.signature.params.clear();
        self.ctx.func.signature.returns.clear();
        self.ctx.func.signature.params.push(AbiParam::new(ptr_type));
        self.ctx.func.signature.params.push(AbiParam::new(ptr_type));

        let mut fallback_signature = self.module.make_signature();
        fallback_signature.params.push(AbiParam::new(ptr_type));
        fallback_signature.params.push(AbiParam::new(types::I32));
        fallback_signature.params.push(AbiParam::new(types::I32));
        fallback_signature.returns.push(AbiParam::new(types::I32));

        let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let state_ptr = builder.block_params(entry)[0];
        let hooks_ptr = builder.block_params(entry)[1];
        let fallback_sig = builder.import_signature(fallback_signature);

        let mut flags = MemFlags::new();
        flags.set_notrap();
        flags.set_aligned();

        let mut vars = Vec::with_capacity(usize::from(SCRATCH_REGS));
        for index in 0..SCRATCH_REGS {
            let var = Variable::new(usize::from(index));
            builder.declare_var(var, types::I32);
            let zero = builder.ins().iconst(types::I32, 0);
            builder.def_var(var, zero);
            vars.push(var);
        }

        let mut emitter = CraneliftEmitter {
            builder,
            state_ptr,
            hooks_ptr,
            vars,
            ptr_type,
            flags,
            fallback_sig,
        };
        BlockCompiler::new(&mut emitter).compile(&block, buffer.ops())?;
        emitter.builder.finalize();

        let symbol = format!("cube_jit_block_{}", self.next_symbol_id);
        self.next_symbol_id += 1;

        let func_id = self
            .module
            .declare_function(&symbol, Linkage::Local, &self.ctx.func.signature)
            .map_err(|e| CompileError::Backend {
                message: format!("declare_function: {e}"),
            })?;
        self.module
            .define_function(func_id, &mut self.ctx)
            .map_err(|e| CompileError::Backend {
                message: format!("define_function: {e}"),
            })?;
        self.module.clear_context(&mut self.ctx);
        self.module
            .finalize_definitions()
            .map_err(|e| CompileError::Backend {
                message: format!("finalize_definitions: {e}"),
            })?;

        let entry_ptr = self.module.get_finalized_function(func_id);
        log::debug!(
            "compiled block {:#010X}..{:#010X} ({} instructions)",
            block.address,
            block.end_address,
            block.num_instructions
        );

        Ok(CompiledBlock {
            address,
            end_address: block.end_address,
            instruction_count: block.num_instructions,
            cycles: block.num_cycles,
            entry: BlockEntry(entry_ptr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use cube_jit::config::AnalyzerOptions;
    use cube_jit::mem::FetchFault;

    struct TestMemory {
        words: HashMap<u32, u32>,
    }

    impl TestMemory {
        fn with_program(start: u32, words: &[u32]) -> Self {
            let mut map = HashMap::new();
            for (i, word) in words.iter().enumerate() {
                map.insert(start + (i as u32) * 4, *word);
            }
            TestMemory { words: map }
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

    /// Interpreter stand-in: logs (raw, address) pairs and returns either
    /// the sequential next PC or a forced divert target.
    struct InterpLog {
        calls: Vec<(u32, u32)>,
        divert_to: Option<u32>,
    }

    unsafe extern "C" fn test_interpret(user: *mut u8, raw: u32, address: u32) -> u32 {
        // SAFETY: `user` is the InterpLog the test passed in.
        let log = unsafe { &mut *(user as *mut InterpLog) };
        log.calls.push((raw, address));
        log.divert_to.unwrap_or(address.wrapping_add(4))
    }

    fn hooks(log: &mut InterpLog) -> FallbackHooks {
        FallbackHooks {
            user: (log as *mut InterpLog).cast::<u8>(),
            interpret: test_interpret,
        }
    }

    const START: u32 = 0x8000_0000;
    const BLR: u32 = 0x4E80_0020;

    fn compile(program: &[u32], options: JitOptions) -> CompiledBlock {
        let table = DecodeTable::new();
        let mut backend = CraneliftBackend::default();
        let mut buffer = CodeBuffer::new(256);
        let mut mem = TestMemory::with_program(START, program);
        backend
            .compile_block(&table, &options, &mut mem, &mut buffer, START)
            .expect("block compiles")
    }

    fn conservative() -> JitOptions {
        JitOptions {
            analyzer: AnalyzerOptions::conservative(),
            ..JitOptions::default()
        }
    }

    fn run(block: &CompiledBlock, state: &mut JitState) -> InterpLog {
        let mut log = InterpLog {
            calls: Vec::new(),
            divert_to: None,
        };
        let mut hooks = hooks(&mut log);
        block.execute(state, &mut hooks);
        log
    }

    #[test]
    fn alu_block_computes_against_live_registers() {
        let block = compile(
            &[
                0x7CA3_2214, // add r5, r3, r4
                0x7CA6_1A78, // xor r6, r5, r3
                0x7CE5_2050, // subf r7, r5, r4
                BLR,
            ],
            conservative(),
        );
        assert_eq!(block.instruction_count, 4);

        let mut state = JitState::new();
        state.gpr[3] = 5;
        state.gpr[4] = 7;
        state.lr = 0x8000_0400;
        run(&block, &mut state);

        assert_eq!(state.gpr[5], 12);
        assert_eq!(state.gpr[6], 12 ^ 5);
        assert_eq!(state.gpr[7], 7u32.wrapping_sub(12));
        assert_eq!(state.pc, 0x8000_0400);
    }

    #[test]
    fn folded_block_stores_constants() {
        let block = compile(
            &[
                0x3860_0005, // li r3, 5
                0x3880_0007, // li r4, 7
                0x7CA3_2214, // add r5, r3, r4
                BLR,
            ],
            conservative(),
        );
        let mut state = JitState::new();
        state.lr = 0x8000_1000;
        run(&block, &mut state);
        assert_eq!(state.gpr[3], 5);
        assert_eq!(state.gpr[4], 7);
        assert_eq!(state.gpr[5], 12);
        assert_eq!(state.pc, 0x8000_1000);
    }

    #[test]
    fn subtract_from_carry_is_inverted_borrow_at_runtime() {
        // subfc r5, r3, r4 computes r4 - r3
        let block = compile(&[0x7CA3_2010, BLR], conservative());

        let mut state = JitState::new();
        state.gpr[3] = 1;
        state.gpr[4] = 0xFFFF_FFFF;
        run(&block, &mut state);
        assert_eq!(state.gpr[5], 0xFFFF_FFFE);
        assert_eq!(state.xer_ca, 1, "no borrow means carry set");

        let mut state = JitState::new();
        state.gpr[3] = 5;
        state.gpr[4] = 3;
        run(&block, &mut state);
        assert_eq!(state.gpr[5], 3u32.wrapping_sub(5));
        assert_eq!(state.xer_ca, 0, "borrow means carry clear");
    }

    #[test]
    fn carry_chain_through_adde() {
        // addc r5, r3, r4 ; adde r6, r3, r4
        let block = compile(&[0x7CA3_2014, 0x7CC3_2114, BLR], conservative());
        let mut state = JitState::new();
        state.gpr[3] = 0xFFFF_FFFF;
        state.gpr[4] = 1;
        run(&block, &mut state);
        assert_eq!(state.gpr[5], 0);
        // second add sees the carry from the first, and carries again
        assert_eq!(state.gpr[6], 1);
        assert_eq!(state.xer_ca, 1);
    }

    #[test]
    fn conditional_branch_exits_or_falls_through() {
        let program = [
            0x2C03_0005, // cmpwi r3, 5
            0x4182_000C, // beq +12 (past both li, straight to the return)
            0x3880_006F, // li r4, 111
            0x3880_00DE, // li r4, 222
            BLR,
        ];
        let block = compile(&program, JitOptions::default());

        // Taken: the block exits at the branch target.
        let mut state = JitState::new();
        state.gpr[3] = 5;
        state.lr = 0x8000_2000;
        run(&block, &mut state);
        assert_eq!(state.pc, START + 16);
        assert_eq!(state.gpr[4], 0, "taken path must not see later writes");

        // Not taken: both writes run and the block returns through LR.
        let mut state = JitState::new();
        state.gpr[3] = 4;
        state.lr = 0x8000_2000;
        run(&block, &mut state);
        assert_eq!(state.pc, 0x8000_2000);
        assert_eq!(state.gpr[4], 222);
    }

    #[test]
    fn ctr_loop_counts_down() {
        let program = [
            0x3884_0001, // addi r4, r4, 1
            (16u32 << 26) | (0x10 << 21) | 0xFFFC, // bdnz -4
            BLR,
        ];
        let block = compile(&program, JitOptions::default());

        let mut state = JitState::new();
        state.ctr = 3;
        state.lr = 0x8000_3000;
        // The dispatcher would re-enter at the block head on each taken
        // branch; simulate that.
        for _ in 0..10 {
            run(&block, &mut state);
            if state.pc != START {
                break;
            }
        }
        assert_eq!(state.gpr[4], 3);
        assert_eq!(state.ctr, 0);
        assert_eq!(state.pc, 0x8000_3000);
    }

    #[test]
    fn srawi_result_and_carry() {
        // srawi r4, r3, 1
        let srawi = (31u32 << 26) | (3 << 21) | (4 << 16) | (1 << 11) | (824 << 1);
        let block = compile(&[srawi, BLR], conservative());

        let mut state = JitState::new();
        state.gpr[3] = 0x8000_0001;
        run(&block, &mut state);
        assert_eq!(state.gpr[4], 0xC000_0000);
        assert_eq!(state.xer_ca, 1);

        let mut state = JitState::new();
        state.gpr[3] = 4;
        run(&block, &mut state);
        assert_eq!(state.gpr[4], 2);
        assert_eq!(state.xer_ca, 0);
    }

    #[test]
    fn fallback_receives_flushed_state_and_resumes() {
        let program = [
            0x3860_0005, // li r3, 5
            0x8083_0000, // lwz r4, 0(r3) — interpreter fallback
            0x3863_0001, // addi r3, r3, 1
            BLR,
        ];
        let block = compile(&program, conservative());

        let mut state = JitState::new();
        state.lr = 0x8000_4000;
        let log = run(&block, &mut state);

        assert_eq!(log.calls, vec![(0x8083_0000, START + 4)]);
        // The constant was flushed before the call and the block resumed
        // past it.
        assert_eq!(state.gpr[3], 6);
        assert_eq!(state.pc, 0x8000_4000);
    }

    #[test]
    fn diverted_fallback_leaves_the_block() {
        let program = [
            0x0C03_0000, // twi 0, r3, 0 — trap, interpreter decides
            0x3860_0009, // li r3, 9
            BLR,
        ];
        let block = compile(&program, JitOptions::default());

        // Interpreter reports a trap taken: the block must exit without
        // running the rest.
        let mut state = JitState::new();
        let mut log = InterpLog {
            calls: Vec::new(),
            divert_to: Some(0x0000_0700),
        };
        let mut h = hooks(&mut log);
        block.execute(&mut state, &mut h);
        assert_eq!(state.pc, 0x0000_0700);
        assert_eq!(state.gpr[3], 0);

        // No trap: execution resumes in the same block.
        let mut state = JitState::new();
        state.lr = 0x8000_5000;
        let log = run(&block, &mut state);
        assert_eq!(log.calls.len(), 1);
        assert_eq!(state.gpr[3], 9);
        assert_eq!(state.pc, 0x8000_5000);
    }

    #[test]
    fn broken_blocks_do_not_reach_codegen() {
        let table = DecodeTable::new();
        let mut backend = CraneliftBackend::default();
        let mut buffer = CodeBuffer::new(8);
        let mut mem = TestMemory::with_program(START, &[0x3860_0005; 16]);
        let options = JitOptions {
            max_block_instructions: 8,
            ..conservative()
        };
        let result = backend.compile_block(&table, &options, &mut mem, &mut buffer, START);
        assert!(matches!(result, Err(CompileError::BrokenBlock { .. })));
    }
}
