//! Classic (accumulator machine) instruction model, the `sock_filter` dialect.

use serde::{Deserialize, Serialize};

use crate::StructuralError;

pub const CLASS_LD: u8 = 0x00;
pub const CLASS_LDX: u8 = 0x01;
pub const CLASS_ST: u8 = 0x02;
pub const CLASS_STX: u8 = 0x03;
pub const CLASS_ALU: u8 = 0x04;
pub const CLASS_JMP: u8 = 0x05;
pub const CLASS_RET: u8 = 0x06;
pub const CLASS_MISC: u8 = 0x07;

pub const SRC_K: u8 = 0x00;
pub const SRC_X: u8 = 0x08;

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

pub const JMP_JA: u8 = 0x00;
pub const JMP_JEQ: u8 = 0x10;
pub const JMP_JGT: u8 = 0x20;
pub const JMP_JGE: u8 = 0x30;
pub const JMP_JSET: u8 = 0x40;

pub const MODE_IMM: u8 = 0x00;
pub const MODE_ABS: u8 = 0x20;
pub const MODE_IND: u8 = 0x40;
pub const MODE_MEM: u8 = 0x60;
pub const MODE_LEN: u8 = 0x80;
pub const MODE_MSH: u8 = 0xa0;

pub const SIZE_W: u8 = 0x00;
pub const SIZE_H: u8 = 0x08;
pub const SIZE_B: u8 = 0x10;

/// Operation bits of a MISC instruction.
pub const MISC_TAX: u8 = 0x00;
pub const MISC_TXA: u8 = 0x80;

/// Negative packet offsets at or below this select kernel extensions.
pub const EXTENSION_OFFSET: i32 = -0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Register {
    A = 0,
    X = 1,
}

impl Register {
    pub fn number(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Register),
    K(u32),
}

impl From<Register> for Operand {
    fn from(r: Register) -> Self {
        Self::Reg(r)
    }
}

impl From<u32> for Operand {
    fn from(k: u32) -> Self {
        Self::K(k)
    }
}

impl From<i32> for Operand {
    fn from(k: i32) -> Self {
        Self::K(k as u32)
    }
}

/// One classic instruction.
///
/// `code` holds the operation for ALU/JMP, `size | mode` for loads and
/// stores, the return-value source for RET and the MISC sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub class: u8,
    pub code: u8,
    #[serde(default)]
    pub source: u8,
    #[serde(default)]
    pub jt: u8,
    #[serde(default)]
    pub jf: u8,
    #[serde(default)]
    pub k: u32,
}

impl Instruction {
    pub fn alu(op: u8, src: impl Into<Operand>) -> Self {
        let (source, k) = match src.into() {
            Operand::Reg(_) => (SRC_X, Register::X.number() as u32),
            Operand::K(k) => (SRC_K, k),
        };
        Self {
            class: CLASS_ALU,
            code: op,
            source,
            jt: 0,
            jf: 0,
            k,
        }
    }

    pub fn add(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_ADD, src)
    }

    pub fn sub(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_SUB, src)
    }

    pub fn mul(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_MUL, src)
    }

    pub fn div(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_DIV, src)
    }

    pub fn or(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_OR, src)
    }

    pub fn and(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_AND, src)
    }

    pub fn lsh(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_LSH, src)
    }

    pub fn rsh(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_RSH, src)
    }

    pub fn neg() -> Self {
        Self::alu(ALU_NEG, 0u32)
    }

    pub fn modulo(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_MOD, src)
    }

    pub fn xor(src: impl Into<Operand>) -> Self {
        Self::alu(ALU_XOR, src)
    }

    /// Return an immediate, or the accumulator when given a register.
    pub fn ret(src: impl Into<Operand>) -> Self {
        let (source, k) = match src.into() {
            Operand::Reg(_) => (SRC_X, Register::A.number() as u32),
            Operand::K(k) => (SRC_K, k),
        };
        Self {
            class: CLASS_RET,
            code: 0,
            source,
            jt: 0,
            jf: 0,
            k,
        }
    }

    /// `A` selects TAX, `X` selects TXA.
    pub fn misc(reg: Register) -> Self {
        let code = match reg {
            Register::A => MISC_TAX,
            Register::X => MISC_TXA,
        };
        Self {
            class: CLASS_MISC,
            code,
            source: SRC_K,
            jt: 0,
            jf: 0,
            k: reg.number() as u32,
        }
    }

    pub fn jmp(op: u8, jt: u8, jf: u8, src: impl Into<Operand>) -> Self {
        let (source, k) = match src.into() {
            Operand::Reg(_) => (SRC_X, 0),
            Operand::K(k) => (SRC_K, k),
        };
        Self {
            class: CLASS_JMP,
            code: op,
            source,
            jt,
            jf,
            k,
        }
    }

    pub fn ja(offset: u8) -> Self {
        Self::jmp(JMP_JA, offset, 0, 0u32)
    }

    pub fn jeq(jt: u8, jf: u8, k: u32) -> Self {
        Self::jmp(JMP_JEQ, jt, jf, k)
    }

    pub fn jgt(jt: u8, jf: u8, k: u32) -> Self {
        Self::jmp(JMP_JGT, jt, jf, k)
    }

    pub fn jge(jt: u8, jf: u8, k: u32) -> Self {
        Self::jmp(JMP_JGE, jt, jf, k)
    }

    pub fn jset(jt: u8, jf: u8, k: u32) -> Self {
        Self::jmp(JMP_JSET, jt, jf, k)
    }

    pub fn load_store(class: u8, size: u8, mode: u8, jt: u8, jf: u8, k: u32) -> Self {
        Self {
            class,
            code: size | mode,
            source: SRC_K,
            jt,
            jf,
            k,
        }
    }

    /// `A = M[k]`.
    pub fn ld(k: u32) -> Self {
        Self::load_store(CLASS_LD, SIZE_W, MODE_MEM, 0, 0, k)
    }

    /// `A = k`.
    pub fn ldi(k: u32) -> Self {
        Self::load_store(CLASS_LD, SIZE_W, MODE_IMM, 0, 0, k)
    }

    /// `A = skb->len`.
    pub fn ld_len() -> Self {
        Self::load_store(CLASS_LD, SIZE_W, MODE_LEN, 0, 0, 0)
    }

    pub fn ld_abs(size: u8, k: u32) -> Self {
        Self::load_store(CLASS_LD, size, MODE_ABS, 0, 0, k)
    }

    pub fn ld_ind(size: u8, k: u32) -> Self {
        Self::load_store(CLASS_LD, size, MODE_IND, 0, 0, k)
    }

    pub fn ldx(k: u32) -> Self {
        Self::load_store(CLASS_LDX, SIZE_W, MODE_MEM, 0, 0, k)
    }

    /// `M[k] = A`.
    pub fn st(k: u32) -> Self {
        Self::load_store(CLASS_ST, SIZE_W, MODE_MEM, 0, 0, k)
    }

    /// `M[k] = X`.
    pub fn stx(k: u32) -> Self {
        Self::load_store(CLASS_STX, SIZE_W, MODE_MEM, 0, 0, k)
    }

    pub fn is_jump(&self) -> bool {
        self.class == CLASS_JMP
    }

    pub fn is_conditional_jump(&self) -> bool {
        self.is_jump() && self.code != JMP_JA
    }
}

/// Check that every branch target of a classic program lands inside it.
///
/// Targets are `pc + 1 + jt` and `pc + 1 + jf` for conditional jumps; JA
/// carries its offset in `jt` as well.
pub fn validate_jumps(program: &[Instruction]) -> Result<(), StructuralError> {
    if program.is_empty() {
        return Err(StructuralError::EmptyProgram);
    }
    let len = program.len();
    for (index, ins) in program.iter().enumerate() {
        if !ins.is_jump() {
            continue;
        }
        let remaining = len - index;
        let offsets: &[u8] = if ins.is_conditional_jump() {
            &[ins.jt, ins.jf]
        } else {
            &[ins.jt]
        };
        for &offset in offsets {
            if index + 1 + offset as usize >= len {
                return Err(StructuralError::JumpOutOfBounds {
                    index,
                    offset: offset as i32,
                    remaining,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alu_with_register_source_points_k_at_x() {
        let ins = Instruction::add(Register::X);
        assert_eq!(ins.source, SRC_X);
        assert_eq!(ins.k, 1);

        let imm = Instruction::add(65535u32);
        assert_eq!(imm.source, SRC_K);
        assert_eq!(imm.k, 0xffff);
    }

    #[test]
    fn ret_with_register_returns_the_accumulator() {
        let ins = Instruction::ret(Register::A);
        assert_eq!(ins.class, CLASS_RET);
        assert_eq!(ins.source, SRC_X);
        assert_eq!(ins.k, Register::A.number() as u32);
    }

    #[test]
    fn misc_selects_transfer_direction() {
        assert_eq!(Instruction::misc(Register::A).code, MISC_TAX);
        assert_eq!(Instruction::misc(Register::X).code, MISC_TXA);
        assert_eq!(Instruction::misc(Register::X).k, 1);
    }

    #[test]
    fn validate_jumps_rejects_targets_past_the_end() {
        let ok = vec![Instruction::jeq(1, 0, 7), Instruction::ret(0u32), Instruction::ret(1u32)];
        validate_jumps(&ok).expect("in bounds");

        let bad = vec![Instruction::jeq(2, 0, 7), Instruction::ret(0u32), Instruction::ret(1u32)];
        let err = validate_jumps(&bad).expect_err("jt past end");
        assert!(matches!(err, StructuralError::JumpOutOfBounds { index: 0, offset: 2, .. }));

        let ja = vec![Instruction::ja(1), Instruction::ret(0u32)];
        assert!(validate_jumps(&ja).is_err());
    }
}
