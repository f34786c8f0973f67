//! Bit-exact wire encoding for both instruction dialects.
//!
//! Extended word, low byte first: opcode, registers (dst low nibble, src high
//! nibble), 16-bit offset, 32-bit immediate. Classic word: 16-bit code, jt,
//! jf, 32-bit k.

use crate::EncodingError;
use crate::classic;
use crate::ebpf::{self, Instruction, Register, Shape};

pub const CLASS_MASK: u8 = 0x07;
pub const SOURCE_MASK: u8 = 0x08;
pub const OP_MASK: u8 = 0xF0;
pub const SIZE_MASK: u8 = 0x18;
pub const MODE_MASK: u8 = 0xE0;
/// Return-value source bits of a classic RET.
pub const RET_SOURCE_MASK: u8 = 0x18;
/// Sub-operation bits of a classic MISC.
pub const MISC_OP_MASK: u8 = 0xF8;

pub fn encode_alu_or_jmp_opcode(class: u8, source: u8, op: u8) -> u8 {
    (class & CLASS_MASK) | (source & SOURCE_MASK) | (op & OP_MASK)
}

pub fn encode_store_or_load_opcode(class: u8, size: u8, mode: u8) -> u8 {
    (class & CLASS_MASK) | (size & SIZE_MASK) | (mode & MODE_MASK)
}

pub fn pack_word(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> u64 {
    let registers = (dst & 0x0F) | ((src & 0x0F) << 4);
    u64::from(opcode)
        | (u64::from(registers) << 8)
        | (u64::from(offset as u16) << 16)
        | (u64::from(imm as u32) << 32)
}

fn opcode_for(ins: &Instruction) -> Result<u8, EncodingError> {
    match ins.shape() {
        Some(Shape::AluOrJmp) => {
            if ins.code & !OP_MASK != 0 {
                return Err(EncodingError::UnknownOpcodeShape {
                    class: ins.class,
                    code: ins.code,
                });
            }
            if ins.source != ebpf::SRC_IMM && ins.source != ebpf::SRC_REG {
                return Err(EncodingError::UnknownOperandType(ins.source));
            }
            Ok(encode_alu_or_jmp_opcode(ins.class, ins.source, ins.code))
        }
        Some(Shape::Memory) => {
            if ins.code & CLASS_MASK != 0 {
                return Err(EncodingError::UnknownOpcodeShape {
                    class: ins.class,
                    code: ins.code,
                });
            }
            Ok(encode_store_or_load_opcode(
                ins.class,
                ins.code & SIZE_MASK,
                ins.code & MODE_MASK,
            ))
        }
        None => Err(EncodingError::UnknownOpcodeShape {
            class: ins.class,
            code: ins.code,
        }),
    }
}

/// Encode one extended instruction; wide loads produce two words.
pub fn encode(ins: &Instruction) -> Result<Vec<u64>, EncodingError> {
    let opcode = opcode_for(ins)?;
    if ins.is_wide_load() != ins.pseudo.is_some() {
        return Err(EncodingError::PseudoSlotMismatch(opcode));
    }

    let main = pack_word(opcode, ins.dst.number(), ins.src.number(), ins.offset, ins.imm);
    match ins.pseudo {
        Some(slot) => Ok(vec![main, pack_word(0, 0, 0, 0, slot.imm)]),
        None => Ok(vec![main]),
    }
}

pub fn encode_program(instructions: &[Instruction]) -> Result<Vec<u64>, EncodingError> {
    let mut words = Vec::with_capacity(instructions.len() + 2);
    for ins in instructions {
        words.extend(encode(ins)?);
    }
    Ok(words)
}

/// Raw fields of one extended word, split along the opcode masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFields {
    pub opcode: u8,
    pub class: u8,
    /// Source bit; zero for load/store classes.
    pub source: u8,
    /// Operation bits for ALU/JMP, `size | mode` for load/store.
    pub code: u8,
    pub dst: u8,
    pub src: u8,
    pub offset: i16,
    pub imm: i32,
}

pub fn decode_fields(word: u64) -> DecodedFields {
    let opcode = (word & 0xFF) as u8;
    let registers = ((word >> 8) & 0xFF) as u8;
    let class = opcode & CLASS_MASK;
    let (source, code) = match ebpf::shape_for_class(class) {
        Some(Shape::AluOrJmp) => (opcode & SOURCE_MASK, opcode & OP_MASK),
        _ => (0, opcode & (SIZE_MASK | MODE_MASK)),
    };
    DecodedFields {
        opcode,
        class,
        source,
        code,
        dst: registers & 0x0F,
        src: registers >> 4,
        offset: ((word >> 16) & 0xFFFF) as u16 as i16,
        imm: (word >> 32) as u32 as i32,
    }
}

fn register(n: u8) -> Result<Register, EncodingError> {
    Register::from_number(n).ok_or(EncodingError::UnknownRegister(n))
}

/// Rebuild instructions from wire words, folding pseudo slots back into
/// their owners.
pub fn decode_program(words: &[u64]) -> Result<Vec<Instruction>, EncodingError> {
    let mut out = Vec::with_capacity(words.len());
    let mut i = 0usize;
    while i < words.len() {
        let f = decode_fields(words[i]);
        let mut ins = Instruction {
            class: f.class,
            code: f.code,
            source: f.source,
            dst: register(f.dst)?,
            src: register(f.src)?,
            offset: f.offset,
            imm: f.imm,
            pseudo: None,
        };
        if ins.is_wide_load() {
            let Some(&slot) = words.get(i + 1) else {
                return Err(EncodingError::PseudoSlotMismatch(f.opcode));
            };
            ins.pseudo = Some(ebpf::PseudoSlot {
                imm: decode_fields(slot).imm,
            });
            i += 1;
        }
        out.push(ins);
        i += 1;
    }
    Ok(out)
}

/// Classic 16-bit code for one instruction.
pub fn classic_code(ins: &classic::Instruction) -> Result<u16, EncodingError> {
    let class = ins.class & CLASS_MASK;
    let code = match class {
        classic::CLASS_ALU | classic::CLASS_JMP => {
            if ins.source != classic::SRC_K && ins.source != classic::SRC_X {
                return Err(EncodingError::UnknownOperandType(ins.source));
            }
            encode_alu_or_jmp_opcode(class, ins.source, ins.code)
        }
        classic::CLASS_LD | classic::CLASS_LDX | classic::CLASS_ST | classic::CLASS_STX => {
            encode_store_or_load_opcode(class, ins.code & SIZE_MASK, ins.code & MODE_MASK)
        }
        classic::CLASS_RET => {
            if ins.source != classic::SRC_K && ins.source != classic::SRC_X {
                return Err(EncodingError::UnknownOperandType(ins.source));
            }
            class | (ins.source & RET_SOURCE_MASK)
        }
        classic::CLASS_MISC => class | (ins.code & MISC_OP_MASK),
        _ => {
            return Err(EncodingError::UnknownOpcodeShape {
                class: ins.class,
                code: ins.code,
            });
        }
    };
    Ok(u16::from(code))
}

/// Encode one classic instruction into its `sock_filter` word.
pub fn encode_classic(ins: &classic::Instruction) -> Result<u64, EncodingError> {
    let code = classic_code(ins)?;
    Ok(u64::from(code)
        | (u64::from(ins.jt) << 16)
        | (u64::from(ins.jf) << 24)
        | (u64::from(ins.k) << 32))
}

pub fn encode_classic_program(instructions: &[classic::Instruction]) -> Result<Vec<u64>, EncodingError> {
    instructions.iter().map(encode_classic).collect()
}

pub fn words_to_le_bytes(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Inverse of [`words_to_le_bytes`]; trailing partial words are rejected.
pub fn le_bytes_to_words(bytes: &[u8]) -> Option<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b)
            })
            .collect(),
    )
}
