//! Static per-opcode metadata and the decode table built from it.
//!
//! Descriptors carry everything the analyzer needs to classify an
//! instruction without looking at runtime state: which register fields it
//! reads and writes, which flags it may set, a coarse category and a cycle
//! estimate. The table itself is immutable after construction and is passed
//! by reference into the analyzer and the block compiler.

use bitflags::bitflags;

use crate::isa::Instruction;

bitflags! {
    /// Static properties of one opcode.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct OpFlags: u32 {
        /// Reads the RA field.
        const IN_A = 1 << 0;
        /// Reads the RA field, except RA=0 means a literal zero.
        const IN_A0 = 1 << 1;
        /// Reads the RB field.
        const IN_B = 1 << 2;
        /// Reads the RS field.
        const IN_S = 1 << 3;
        /// Writes the RD field.
        const OUT_D = 1 << 4;
        /// Writes the RA field.
        const OUT_A = 1 << 5;
        /// Always writes the CR0 pair.
        const SET_CR0 = 1 << 6;
        /// Writes the CR0 pair when the record bit is set.
        const RC_BIT = 1 << 7;
        /// Writes the CR field selected by the CRFD bits.
        const SET_CRF = 1 << 8;
        /// Reads the CR field selected by the BI bits.
        const READ_CR_BI = 1 << 9;
        /// Writes the carry bit.
        const SET_CA = 1 << 10;
        /// Reads the carry bit.
        const READ_CA = 1 << 11;
        /// Has an overflow-enable encoding (the OE bit may be set).
        const OE_CAPABLE = 1 << 12;
        /// Writes the float-status summary flag.
        const SET_FLOAT_FLAG = 1 << 13;
        /// Reads the float-status summary flag.
        const READ_FLOAT_FLAG = 1 << 14;
        /// Ends the basic block (branches, returns, system entries).
        const ENDBLOCK = 1 << 15;
        /// May raise a guest exception mid-block (memory access, trap).
        const CAN_EXCEPTION = 1 << 16;
        /// Must never be reordered relative to its neighbors.
        const NO_REORDER = 1 << 17;
        /// Touches the floating-point unit.
        const USE_FPU = 1 << 18;
        /// Reads the FA field as a float register.
        const IN_FA = 1 << 19;
        /// Reads the FB field as a float register.
        const IN_FB = 1 << 20;
        /// Reads the FS (store source) field as a float register.
        const IN_FS = 1 << 21;
        /// Writes the FD field as a float register.
        const OUT_FD = 1 << 22;
    }
}

/// Coarse instruction category.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpCategory {
    Integer,
    Float,
    Branch,
    Load,
    Store,
    System,
}

/// Where an opcode lives in the encoding space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Pattern {
    /// Selected by the primary opcode field alone.
    Primary(u8),
    /// Primary opcode 19, selected by the 10-bit extended field.
    Op19(u16),
    /// Primary opcode 31, selected by the 10-bit extended field.
    Op31(u16),
    /// Primary opcode 63, selected by the 10-bit extended field.
    Op63(u16),
}

/// Static metadata for one opcode.
#[derive(Debug)]
pub struct OpcodeDescriptor {
    pub name: &'static str,
    pub category: OpCategory,
    pub flags: OpFlags,
    pub cycles: u8,
    pattern: Pattern,
}

const fn op(
    name: &'static str,
    pattern: Pattern,
    category: OpCategory,
    flags: OpFlags,
    cycles: u8,
) -> OpcodeDescriptor {
    OpcodeDescriptor {
        name,
        category,
        flags,
        cycles,
        pattern,
    }
}

use OpCategory::{Branch, Float, Integer, Load, Store, System};
use Pattern::{Op19, Op31, Op63, Primary};

const IN_A: OpFlags = OpFlags::IN_A;
const IN_A0: OpFlags = OpFlags::IN_A0;
const IN_B: OpFlags = OpFlags::IN_B;
const IN_S: OpFlags = OpFlags::IN_S;
const OUT_D: OpFlags = OpFlags::OUT_D;
const OUT_A: OpFlags = OpFlags::OUT_A;

static OPCODES: &[OpcodeDescriptor] = &[
    // D-form integer immediates
    op(
        "twi",
        Primary(3),
        System,
        IN_A.union(OpFlags::CAN_EXCEPTION).union(OpFlags::ENDBLOCK),
        1,
    ),
    op("mulli", Primary(7), Integer, IN_A.union(OUT_D), 3),
    op("subfic", Primary(8), Integer, IN_A.union(OUT_D).union(OpFlags::SET_CA), 1),
    op("cmpli", Primary(10), Integer, IN_A.union(OpFlags::SET_CRF), 1),
    op("cmpi", Primary(11), Integer, IN_A.union(OpFlags::SET_CRF), 1),
    op("addic", Primary(12), Integer, IN_A.union(OUT_D).union(OpFlags::SET_CA), 1),
    op(
        "addic.",
        Primary(13),
        Integer,
        IN_A.union(OUT_D).union(OpFlags::SET_CA).union(OpFlags::SET_CR0),
        1,
    ),
    op("addi", Primary(14), Integer, IN_A0.union(OUT_D), 1),
    op("addis", Primary(15), Integer, IN_A0.union(OUT_D), 1),
    op("ori", Primary(24), Integer, IN_S.union(OUT_A), 1),
    op("oris", Primary(25), Integer, IN_S.union(OUT_A), 1),
    op("xori", Primary(26), Integer, IN_S.union(OUT_A), 1),
    op("xoris", Primary(27), Integer, IN_S.union(OUT_A), 1),
    op("andi.", Primary(28), Integer, IN_S.union(OUT_A).union(OpFlags::SET_CR0), 1),
    op("andis.", Primary(29), Integer, IN_S.union(OUT_A).union(OpFlags::SET_CR0), 1),
    // rotates
    op(
        "rlwimi",
        Primary(20),
        Integer,
        IN_A.union(IN_S).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op("rlwinm", Primary(21), Integer, IN_S.union(OUT_A).union(OpFlags::RC_BIT), 1),
    op(
        "rlwnm",
        Primary(23),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    // branches and system entry
    op(
        "bcx",
        Primary(16),
        Branch,
        OpFlags::ENDBLOCK.union(OpFlags::READ_CR_BI),
        1,
    ),
    op("sc", Primary(17), System, OpFlags::ENDBLOCK, 2),
    op("bx", Primary(18), Branch, OpFlags::ENDBLOCK, 1),
    op(
        "bclrx",
        Op19(16),
        Branch,
        OpFlags::ENDBLOCK.union(OpFlags::READ_CR_BI),
        1,
    ),
    op("rfi", Op19(50), System, OpFlags::ENDBLOCK, 2),
    op(
        "bcctrx",
        Op19(528),
        Branch,
        OpFlags::ENDBLOCK.union(OpFlags::READ_CR_BI),
        1,
    ),
    // loads and stores
    op("lwz", Primary(32), Load, IN_A0.union(OUT_D).union(OpFlags::CAN_EXCEPTION), 1),
    op("lbz", Primary(34), Load, IN_A0.union(OUT_D).union(OpFlags::CAN_EXCEPTION), 1),
    op("stw", Primary(36), Store, IN_A0.union(IN_S).union(OpFlags::CAN_EXCEPTION), 1),
    op("stb", Primary(38), Store, IN_A0.union(IN_S).union(OpFlags::CAN_EXCEPTION), 1),
    op("lhz", Primary(40), Load, IN_A0.union(OUT_D).union(OpFlags::CAN_EXCEPTION), 1),
    op("sth", Primary(44), Store, IN_A0.union(IN_S).union(OpFlags::CAN_EXCEPTION), 1),
    // lmw/stmw touch a register range; the analyzer special-cases the
    // register sets by primary opcode.
    op(
        "lmw",
        Primary(46),
        Load,
        IN_A0.union(OpFlags::CAN_EXCEPTION).union(OpFlags::NO_REORDER),
        11,
    ),
    op(
        "stmw",
        Primary(47),
        Store,
        IN_A0.union(OpFlags::CAN_EXCEPTION).union(OpFlags::NO_REORDER),
        11,
    ),
    op(
        "lfd",
        Primary(50),
        Load,
        IN_A0.union(OpFlags::OUT_FD).union(OpFlags::CAN_EXCEPTION).union(OpFlags::USE_FPU),
        1,
    ),
    op(
        "stfd",
        Primary(54),
        Store,
        IN_A0.union(OpFlags::IN_FS).union(OpFlags::CAN_EXCEPTION).union(OpFlags::USE_FPU),
        1,
    ),
    // X-form integer
    op("cmp", Op31(0), Integer, IN_A.union(IN_B).union(OpFlags::SET_CRF), 1),
    op(
        "tw",
        Op31(4),
        System,
        IN_A.union(IN_B).union(OpFlags::CAN_EXCEPTION).union(OpFlags::ENDBLOCK),
        2,
    ),
    op(
        "subfc",
        Op31(8),
        Integer,
        IN_A.union(IN_B)
            .union(OUT_D)
            .union(OpFlags::SET_CA)
            .union(OpFlags::RC_BIT)
            .union(OpFlags::OE_CAPABLE),
        1,
    ),
    op(
        "addc",
        Op31(10),
        Integer,
        IN_A.union(IN_B)
            .union(OUT_D)
            .union(OpFlags::SET_CA)
            .union(OpFlags::RC_BIT)
            .union(OpFlags::OE_CAPABLE),
        1,
    ),
    op(
        "mulhwu",
        Op31(11),
        Integer,
        IN_A.union(IN_B).union(OUT_D).union(OpFlags::RC_BIT),
        5,
    ),
    op(
        "slw",
        Op31(24),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op("cntlzw", Op31(26), Integer, IN_S.union(OUT_A).union(OpFlags::RC_BIT), 1),
    op(
        "and",
        Op31(28),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op("cmpl", Op31(32), Integer, IN_A.union(IN_B).union(OpFlags::SET_CRF), 1),
    op(
        "subf",
        Op31(40),
        Integer,
        IN_A.union(IN_B).union(OUT_D).union(OpFlags::RC_BIT).union(OpFlags::OE_CAPABLE),
        1,
    ),
    op(
        "andc",
        Op31(60),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op(
        "mulhw",
        Op31(75),
        Integer,
        IN_A.union(IN_B).union(OUT_D).union(OpFlags::RC_BIT),
        5,
    ),
    op(
        "neg",
        Op31(104),
        Integer,
        IN_A.union(OUT_D).union(OpFlags::RC_BIT).union(OpFlags::OE_CAPABLE),
        1,
    ),
    op(
        "nor",
        Op31(124),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op(
        "subfe",
        Op31(136),
        Integer,
        IN_A.union(IN_B)
            .union(OUT_D)
            .union(OpFlags::SET_CA)
            .union(OpFlags::READ_CA)
            .union(OpFlags::RC_BIT)
            .union(OpFlags::OE_CAPABLE),
        1,
    ),
    op(
        "adde",
        Op31(138),
        Integer,
        IN_A.union(IN_B)
            .union(OUT_D)
            .union(OpFlags::SET_CA)
            .union(OpFlags::READ_CA)
            .union(OpFlags::RC_BIT)
            .union(OpFlags::OE_CAPABLE),
        1,
    ),
    op(
        "addze",
        Op31(202),
        Integer,
        IN_A.union(OUT_D)
            .union(OpFlags::SET_CA)
            .union(OpFlags::READ_CA)
            .union(OpFlags::RC_BIT)
            .union(OpFlags::OE_CAPABLE),
        1,
    ),
    op(
        "mullw",
        Op31(235),
        Integer,
        IN_A.union(IN_B).union(OUT_D).union(OpFlags::RC_BIT).union(OpFlags::OE_CAPABLE),
        5,
    ),
    op(
        "add",
        Op31(266),
        Integer,
        IN_A.union(IN_B).union(OUT_D).union(OpFlags::RC_BIT).union(OpFlags::OE_CAPABLE),
        1,
    ),
    op(
        "eqv",
        Op31(284),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op(
        "xor",
        Op31(316),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op("mfspr", Op31(339), System, OUT_D, 1),
    op(
        "orc",
        Op31(412),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op(
        "or",
        Op31(444),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op(
        "divwu",
        Op31(459),
        Integer,
        IN_A.union(IN_B).union(OUT_D).union(OpFlags::RC_BIT).union(OpFlags::OE_CAPABLE),
        40,
    ),
    op("mtspr", Op31(467), System, IN_S, 2),
    op(
        "nand",
        Op31(476),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op(
        "divw",
        Op31(491),
        Integer,
        IN_A.union(IN_B).union(OUT_D).union(OpFlags::RC_BIT).union(OpFlags::OE_CAPABLE),
        40,
    ),
    op(
        "srw",
        Op31(536),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::RC_BIT),
        1,
    ),
    op(
        "sraw",
        Op31(792),
        Integer,
        IN_S.union(IN_B).union(OUT_A).union(OpFlags::SET_CA).union(OpFlags::RC_BIT),
        1,
    ),
    op(
        "srawi",
        Op31(824),
        Integer,
        IN_S.union(OUT_A).union(OpFlags::SET_CA).union(OpFlags::RC_BIT),
        1,
    ),
    op("extsh", Op31(922), Integer, IN_S.union(OUT_A).union(OpFlags::RC_BIT), 1),
    op("extsb", Op31(954), Integer, IN_S.union(OUT_A).union(OpFlags::RC_BIT), 1),
    // floats, enough for the analyzer's float-register bookkeeping
    op(
        "fadd",
        Op63(21),
        Float,
        OpFlags::IN_FA
            .union(OpFlags::IN_FB)
            .union(OpFlags::OUT_FD)
            .union(OpFlags::SET_FLOAT_FLAG)
            .union(OpFlags::USE_FPU),
        1,
    ),
    op(
        "fmr",
        Op63(72),
        Float,
        OpFlags::IN_FB.union(OpFlags::OUT_FD).union(OpFlags::USE_FPU),
        1,
    ),
];

/// Decode table: maps a raw instruction word to its descriptor.
///
/// Built once from the static descriptor list; construction logs any
/// colliding patterns rather than silently overwriting them, so a bad table
/// edit is caught the first time it is loaded.
pub struct DecodeTable {
    primary: [Option<&'static OpcodeDescriptor>; 64],
    op19: Box<[Option<&'static OpcodeDescriptor>; 1024]>,
    op31: Box<[Option<&'static OpcodeDescriptor>; 1024]>,
    op63: Box<[Option<&'static OpcodeDescriptor>; 1024]>,
}

impl DecodeTable {
    pub fn new() -> Self {
        let mut table = DecodeTable {
            primary: [None; 64],
            op19: Box::new([None; 1024]),
            op31: Box::new([None; 1024]),
            op63: Box::new([None; 1024]),
        };
        for desc in OPCODES {
            let slot = match desc.pattern {
                Pattern::Primary(opcd) => &mut table.primary[opcd as usize],
                Pattern::Op19(subop) => &mut table.op19[subop as usize],
                Pattern::Op31(subop) => &mut table.op31[subop as usize],
                Pattern::Op63(subop) => &mut table.op63[subop as usize],
            };
            if let Some(existing) = slot {
                log::error!(
                    "decode table slot for {} already in use by {}",
                    desc.name,
                    existing.name
                );
                continue;
            }
            *slot = Some(desc);
        }
        table
    }

    /// Look up the descriptor for a raw instruction word.
    pub fn describe(&self, raw: u32) -> Option<&'static OpcodeDescriptor> {
        let inst = Instruction(raw);
        match inst.opcd() {
            19 => self.op19[inst.subop10() as usize],
            31 => self.op31[inst.subop10() as usize],
            63 => self.op63[inst.subop10() as usize],
            opcd => self.primary[opcd as usize],
        }
    }
}

impl Default for DecodeTable {
    fn default() -> Self {
        Self::new()
    }
}
