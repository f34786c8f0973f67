//! Extended (register machine) instruction model.

use serde::{Deserialize, Serialize};

use std::fmt;

pub const CLASS_LD: u8 = 0x00;
pub const CLASS_LDX: u8 = 0x01;
pub const CLASS_ST: u8 = 0x02;
pub const CLASS_STX: u8 = 0x03;
pub const CLASS_ALU: u8 = 0x04;
pub const CLASS_JMP: u8 = 0x05;
pub const CLASS_JMP32: u8 = 0x06;
pub const CLASS_ALU64: u8 = 0x07;

pub const SRC_IMM: u8 = 0x00;
pub const SRC_REG: u8 = 0x08;

pub const ALU_ADD: u8 = 0x00;
pub const ALU_SUB: u8 = 0x10;
pub const ALU_MUL: u8 = 0x20;
pub const ALU_DIV: u8 = 0x30;
pub const ALU_OR: u8 = 0x40;
pub const ALU_AND: u8 = 0x50;
pub const ALU_LSH: u8 = 0x60;
pub const ALU_RSH: u8 = 0x70;
pub const ALU_NEG: u8 = 0x80;
pub const ALU_MOD: u8 = 0x90;
pub const ALU_XOR: u8 = 0xa0;
pub const ALU_MOV: u8 = 0xb0;
pub const ALU_ARSH: u8 = 0xc0;
pub const ALU_END: u8 = 0xd0;

pub const JMP_JA: u8 = 0x00;
pub const JMP_JEQ: u8 = 0x10;
pub const JMP_JGT: u8 = 0x20;
pub const JMP_JGE: u8 = 0x30;
pub const JMP_JSET: u8 = 0x40;
pub const JMP_JNE: u8 = 0x50;
pub const JMP_JSGT: u8 = 0x60;
pub const JMP_JSGE: u8 = 0x70;
pub const JMP_CALL: u8 = 0x80;
pub const JMP_EXIT: u8 = 0x90;
pub const JMP_JLT: u8 = 0xa0;
pub const JMP_JLE: u8 = 0xb0;
pub const JMP_JSLT: u8 = 0xc0;
pub const JMP_JSLE: u8 = 0xd0;

pub const MODE_IMM: u8 = 0x00;
pub const MODE_ABS: u8 = 0x20;
pub const MODE_IND: u8 = 0x40;
pub const MODE_MEM: u8 = 0x60;
pub const MODE_ATOMIC: u8 = 0xc0;

pub const SIZE_W: u8 = 0x00;
pub const SIZE_H: u8 = 0x08;
pub const SIZE_B: u8 = 0x10;
pub const SIZE_DW: u8 = 0x18;

pub const HELPER_MAP_LOOKUP: i32 = 0x01;
pub const HELPER_SKB_LOAD_BYTES_RELATIVE: i32 = 0x44;
/// `bpf_loop(nr_loops, callback, ctx, flags)`.
pub const HELPER_LOOP: i32 = 181;

/// Source register value that marks a wide load's immediate as a map fd.
pub const PSEUDO_MAP_FD: Register = Register::R1;
/// Source register value that marks a wide load's immediate as the word
/// offset of a function, relative to the word after the load.
pub const PSEUDO_FUNC: Register = Register::R4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Register {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    /// Read-only frame pointer.
    R10,
}

impl Register {
    pub const ALL: [Register; 11] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
        Self::R8,
        Self::R9,
        Self::R10,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.get(n as usize).copied()
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.number())
    }
}

/// Right-hand operand accepted by the constructors below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Register),
    Imm(i32),
}

impl From<Register> for Operand {
    fn from(r: Register) -> Self {
        Self::Reg(r)
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Self::Imm(v)
    }
}

/// Trailing word of a wide immediate load; only its immediate is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudoSlot {
    pub imm: i32,
}

/// One extended instruction, kept as raw fields.
///
/// `code` is the operation (`ALU_*`/`JMP_*`) for arithmetic and jump classes,
/// and `size | mode` for load/store classes. `source` is only consulted for
/// arithmetic and jump classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub class: u8,
    pub code: u8,
    #[serde(default)]
    pub source: u8,
    pub dst: Register,
    pub src: Register,
    #[serde(default)]
    pub offset: i16,
    #[serde(default)]
    pub imm: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudo: Option<PseudoSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    AluOrJmp,
    Memory,
}

pub fn shape_for_class(class: u8) -> Option<Shape> {
    match class {
        CLASS_ALU | CLASS_ALU64 | CLASS_JMP | CLASS_JMP32 => Some(Shape::AluOrJmp),
        CLASS_LD | CLASS_LDX | CLASS_ST | CLASS_STX => Some(Shape::Memory),
        _ => None,
    }
}

impl Instruction {
    fn alu(class: u8, op: u8, dst: Register, src: Operand) -> Self {
        let (source, src, imm) = match src {
            Operand::Reg(r) => (SRC_REG, r, 0),
            Operand::Imm(v) => (SRC_IMM, Register::R0, v),
        };
        Self {
            class,
            code: op,
            source,
            dst,
            src,
            offset: 0,
            imm,
            pseudo: None,
        }
    }

    pub fn alu_op(class: u8, op: u8, dst: Register, src: impl Into<Operand>) -> Self {
        Self::alu(class, op, dst, src.into())
    }

    pub fn alu64(op: u8, dst: Register, src: impl Into<Operand>) -> Self {
        Self::alu(CLASS_ALU64, op, dst, src.into())
    }

    pub fn alu32(op: u8, dst: Register, src: impl Into<Operand>) -> Self {
        Self::alu(CLASS_ALU, op, dst, src.into())
    }

    pub fn mov64(dst: Register, src: impl Into<Operand>) -> Self {
        Self::alu64(ALU_MOV, dst, src)
    }

    pub fn mov32(dst: Register, src: impl Into<Operand>) -> Self {
        Self::alu32(ALU_MOV, dst, src)
    }

    pub fn add64(dst: Register, src: impl Into<Operand>) -> Self {
        Self::alu64(ALU_ADD, dst, src)
    }

    pub fn sub64(dst: Register, src: impl Into<Operand>) -> Self {
        Self::alu64(ALU_SUB, dst, src)
    }

    pub fn mul64(dst: Register, src: impl Into<Operand>) -> Self {
        Self::alu64(ALU_MUL, dst, src)
    }

    pub fn neg64(dst: Register) -> Self {
        Self::alu64(ALU_NEG, dst, 0)
    }

    pub fn jmp_op(class: u8, op: u8, dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        let mut ins = Self::alu(class, op, dst, src.into());
        ins.offset = offset;
        ins
    }

    pub fn ja(offset: i16) -> Self {
        Self::jmp_op(CLASS_JMP, JMP_JA, Register::R0, 0, offset)
    }

    pub fn jmp_eq(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::jmp_op(CLASS_JMP, JMP_JEQ, dst, src, offset)
    }

    pub fn jmp_ne(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::jmp_op(CLASS_JMP, JMP_JNE, dst, src, offset)
    }

    pub fn jmp_gt(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::jmp_op(CLASS_JMP, JMP_JGT, dst, src, offset)
    }

    pub fn jmp_ge(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::jmp_op(CLASS_JMP, JMP_JGE, dst, src, offset)
    }

    pub fn jmp_lt(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::jmp_op(CLASS_JMP, JMP_JLT, dst, src, offset)
    }

    pub fn jmp_le(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::jmp_op(CLASS_JMP, JMP_JLE, dst, src, offset)
    }

    pub fn call(helper: i32) -> Self {
        Self::jmp_op(CLASS_JMP, JMP_CALL, Register::R0, helper, 0)
    }

    pub fn exit() -> Self {
        Self::jmp_op(CLASS_JMP, JMP_EXIT, Register::R0, 0, 0)
    }

    fn mem(class: u8, size: u8, dst: Register, src: Register, offset: i16, imm: i32) -> Self {
        Self {
            class,
            code: size | MODE_MEM,
            source: SRC_IMM,
            dst,
            src,
            offset,
            imm,
            pseudo: None,
        }
    }

    /// Store to `[dst + offset]`; an immediate source selects ST, a register STX.
    pub fn store(size: u8, dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        match src.into() {
            Operand::Imm(v) => Self::mem(CLASS_ST, size, dst, Register::R0, offset, v),
            Operand::Reg(r) => Self::mem(CLASS_STX, size, dst, r, offset, 0),
        }
    }

    pub fn st_dw(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::store(SIZE_DW, dst, src, offset)
    }

    pub fn st_w(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::store(SIZE_W, dst, src, offset)
    }

    pub fn st_h(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::store(SIZE_H, dst, src, offset)
    }

    pub fn st_b(dst: Register, src: impl Into<Operand>, offset: i16) -> Self {
        Self::store(SIZE_B, dst, src, offset)
    }

    /// Load `[src + offset]` into `dst`.
    pub fn load(size: u8, dst: Register, src: Register, offset: i16) -> Self {
        Self::mem(CLASS_LDX, size, dst, src, offset, 0)
    }

    pub fn ld_dw(dst: Register, src: Register, offset: i16) -> Self {
        Self::load(SIZE_DW, dst, src, offset)
    }

    pub fn ld_w(dst: Register, src: Register, offset: i16) -> Self {
        Self::load(SIZE_W, dst, src, offset)
    }

    /// Two-word load of a 64-bit immediate.
    pub fn ld_imm64(dst: Register, value: i64) -> Self {
        Self {
            class: CLASS_LD,
            code: SIZE_DW | MODE_IMM,
            source: SRC_IMM,
            dst,
            src: Register::R0,
            offset: 0,
            imm: value as i32,
            pseudo: Some(PseudoSlot {
                imm: (value >> 32) as i32,
            }),
        }
    }

    /// Wide load whose immediate the kernel resolves to a map pointer.
    pub fn ld_map_fd(dst: Register, fd: i32) -> Self {
        Self {
            src: PSEUDO_MAP_FD,
            imm: fd,
            pseudo: Some(PseudoSlot { imm: 0 }),
            ..Self::ld_imm64(dst, 0)
        }
    }

    /// Wide load of a pointer to the function `offset` words past this load.
    pub fn ld_func(dst: Register, offset: i32) -> Self {
        Self {
            src: PSEUDO_FUNC,
            imm: offset,
            pseudo: Some(PseudoSlot { imm: 0 }),
            ..Self::ld_imm64(dst, 0)
        }
    }

    pub fn shape(&self) -> Option<Shape> {
        shape_for_class(self.class)
    }

    pub fn is_wide_load(&self) -> bool {
        self.class == CLASS_LD && self.code == (SIZE_DW | MODE_IMM)
    }

    pub fn is_jmp_class(&self) -> bool {
        self.class == CLASS_JMP || self.class == CLASS_JMP32
    }

    /// Any jump-class instruction that transfers control by offset, exit included.
    pub fn is_jump(&self) -> bool {
        self.is_jmp_class() && self.code != JMP_CALL
    }

    pub fn is_exit(&self) -> bool {
        self.is_jmp_class() && self.code == JMP_EXIT
    }

    pub fn is_conditional_jump(&self) -> bool {
        self.is_jump() && !matches!(self.code, JMP_JA | JMP_EXIT)
    }

    /// Number of wire words this instruction occupies.
    pub fn word_len(&self) -> usize {
        if self.pseudo.is_some() { 2 } else { 1 }
    }

    /// Full 64-bit immediate of a wide load.
    pub fn wide_imm(&self) -> Option<i64> {
        let hi = self.pseudo?.imm as i64;
        Some((hi << 32) | (self.imm as u32 as i64))
    }
}

pub fn is_conditional_jmp_op(op: u8) -> bool {
    !matches!(op, JMP_JA | JMP_CALL | JMP_EXIT)
}

pub fn alu_op_name(op: u8) -> &'static str {
    match op {
        ALU_ADD => "BPF_ADD",
        ALU_SUB => "BPF_SUB",
        ALU_MUL => "BPF_MUL",
        ALU_DIV => "BPF_DIV",
        ALU_OR => "BPF_OR",
        ALU_AND => "BPF_AND",
        ALU_LSH => "BPF_LSH",
        ALU_RSH => "BPF_RSH",
        ALU_NEG => "BPF_NEG",
        ALU_MOD => "BPF_MOD",
        ALU_XOR => "BPF_XOR",
        ALU_MOV => "BPF_MOV",
        ALU_ARSH => "BPF_ARSH",
        ALU_END => "BPF_END",
        _ => "BPF_ALU_UNKNOWN",
    }
}

pub fn jmp_op_name(op: u8) -> &'static str {
    match op {
        JMP_JA => "BPF_JA",
        JMP_JEQ => "BPF_JEQ",
        JMP_JGT => "BPF_JGT",
        JMP_JGE => "BPF_JGE",
        JMP_JSET => "BPF_JSET",
        JMP_JNE => "BPF_JNE",
        JMP_JSGT => "BPF_JSGT",
        JMP_JSGE => "BPF_JSGE",
        JMP_CALL => "BPF_CALL",
        JMP_EXIT => "BPF_EXIT",
        JMP_JLT => "BPF_JLT",
        JMP_JLE => "BPF_JLE",
        JMP_JSLT => "BPF_JSLT",
        JMP_JSLE => "BPF_JSLE",
        _ => "BPF_JMP_UNKNOWN",
    }
}

fn size_name(size: u8) -> &'static str {
    match size {
        SIZE_W => "BPF_W",
        SIZE_H => "BPF_H",
        SIZE_B => "BPF_B",
        _ => "BPF_DW",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wide_load() {
            if self.src == PSEUDO_MAP_FD {
                return write!(f, "BPF_LD_MAP_FD({}, {})", self.dst, self.imm);
            }
            if self.src == PSEUDO_FUNC {
                return write!(f, "BPF_LD_FUNC({}, {:+})", self.dst, self.imm);
            }
            return write!(f, "BPF_LD_IMM64({}, {:#x})", self.dst, self.wide_imm().unwrap_or_default());
        }
        let operand = if self.source == SRC_REG {
            self.src.to_string()
        } else {
            self.imm.to_string()
        };
        match self.class {
            CLASS_ALU | CLASS_ALU64 => {
                let width = if self.class == CLASS_ALU64 { "ALU64" } else { "ALU" };
                write!(f, "BPF_{width}({}, {}, {operand})", alu_op_name(self.code), self.dst)
            }
            CLASS_JMP | CLASS_JMP32 if self.code == JMP_EXIT => write!(f, "BPF_EXIT_INSN()"),
            CLASS_JMP | CLASS_JMP32 if self.code == JMP_CALL => write!(f, "BPF_CALL({})", self.imm),
            CLASS_JMP | CLASS_JMP32 => {
                let width = if self.class == CLASS_JMP32 { "JMP32" } else { "JMP" };
                write!(
                    f,
                    "BPF_{width}({}, {}, {operand}, {:+})",
                    jmp_op_name(self.code),
                    self.dst,
                    self.offset
                )
            }
            CLASS_ST => write!(
                f,
                "BPF_ST_MEM({}, {}, {:+}, {})",
                size_name(self.code & 0x18),
                self.dst,
                self.offset,
                self.imm
            ),
            CLASS_STX => write!(
                f,
                "BPF_STX_MEM({}, {}, {}, {:+})",
                size_name(self.code & 0x18),
                self.dst,
                self.src,
                self.offset
            ),
            CLASS_LDX => write!(
                f,
                "BPF_LDX_MEM({}, {}, {}, {:+})",
                size_name(self.code & 0x18),
                self.dst,
                self.src,
                self.offset
            ),
            _ => write!(f, "BPF_RAW(class={:#x}, code={:#04x})", self.class, self.code),
        }
    }
}
