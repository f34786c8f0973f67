//! Random instruction generation for both dialects.

use crate::RandomSource;
use crate::classic;
use crate::ebpf::{self, Instruction, Register};

/// Random general purpose register, R0 through R9; the frame pointer is
/// never picked.
pub fn random_register<R: RandomSource + ?Sized>(rng: &mut R) -> Register {
    let n = rng.rand_range(0, 9) as u8;
    Register::from_number(n).unwrap_or(Register::R0)
}

/// Random 32-bit immediate, biased towards boundary values half the time.
pub fn random_immediate<R: RandomSource + ?Sized>(rng: &mut R) -> i32 {
    if rng.one_of(2) {
        rng.biased_int() as u32 as i32
    } else {
        rng.rand_range(0, 0xFFFF_FFFF) as u32 as i32
    }
}

pub fn random_alu_op<R: RandomSource + ?Sized>(rng: &mut R) -> u8 {
    (rng.rand_range(0x00, 0x0c) as u8) << 4
}

pub fn random_jmp_op<R: RandomSource + ?Sized>(rng: &mut R) -> u8 {
    (rng.rand_range(0x00, 0x0d) as u8) << 4
}

pub fn random_alu_instruction<R: RandomSource + ?Sized>(rng: &mut R) -> Instruction {
    let mut op = random_alu_op(rng);
    let dst = random_register(rng);
    let class = if rng.rand_range(0, 1) == 0 {
        ebpf::CLASS_ALU
    } else {
        ebpf::CLASS_ALU64
    };

    if rng.rand_range(0, 1) == 0 {
        let mut value = random_immediate(rng);
        match op {
            ebpf::ALU_LSH | ebpf::ALU_RSH | ebpf::ALU_ARSH => {
                let max_shift = if class == ebpf::CLASS_ALU { 32 } else { 64 };
                value = (value % max_shift).abs();
            }
            ebpf::ALU_NEG => value = 0,
            _ => {}
        }
        Instruction::alu_op(class, op, dst, value)
    } else {
        // Negation only takes an immediate.
        while op == ebpf::ALU_NEG {
            op = random_alu_op(rng);
        }
        let src = random_register(rng);
        Instruction::alu_op(class, op, dst, src)
    }
}

/// A conditional jump whose offset lies in `[1, max_offset]`.
///
/// Callers pass the number of instructions that follow the jump, so the
/// target always stays inside the program.
pub fn random_jmp_instruction<R: RandomSource + ?Sized>(rng: &mut R, max_offset: u64) -> Instruction {
    let op = loop {
        let op = random_jmp_op(rng);
        if ebpf::is_conditional_jmp_op(op) {
            break op;
        }
    };
    let class = if rng.one_of(2) {
        ebpf::CLASS_JMP32
    } else {
        ebpf::CLASS_JMP
    };
    let dst = random_register(rng);
    let offset = rng.rand_range(1, max_offset.clamp(1, i16::MAX as u64)) as i16;
    if rng.one_of(2) {
        let imm = random_immediate(rng);
        Instruction::jmp_op(class, op, dst, imm, offset)
    } else {
        let src = random_register(rng);
        Instruction::jmp_op(class, op, dst, src, offset)
    }
}

pub fn random_size<R: RandomSource + ?Sized>(rng: &mut R) -> u8 {
    ((rng.rand_int() % 4) as u8) << 3
}

fn alignment_for_size(size: u8) -> i16 {
    match size {
        ebpf::SIZE_B => 1,
        ebpf::SIZE_H => 2,
        ebpf::SIZE_W => 4,
        _ => 8,
    }
}

/// Non-zero negative stack offset, at most 512 deep, aligned to `alignment`.
fn random_stack_offset<R: RandomSource + ?Sized>(rng: &mut R, alignment: i16) -> i16 {
    let depth = rng.rand_range(1, 512) as i16;
    let aligned = depth + (alignment - depth % alignment) % alignment;
    -aligned.min(512)
}

/// A load or store against the frame pointer.
pub fn random_mem_instruction<R: RandomSource + ?Sized>(rng: &mut R) -> Instruction {
    let size = random_size(rng);
    let offset = random_stack_offset(rng, alignment_for_size(size));
    if rng.one_of(2) {
        if rng.one_of(2) {
            let imm = random_immediate(rng);
            Instruction::store(size, Register::R10, imm, offset)
        } else {
            let src = random_register(rng);
            Instruction::store(size, Register::R10, src, offset)
        }
    } else {
        let dst = random_register(rng);
        Instruction::load(size, dst, Register::R10, offset)
    }
}

pub mod classic_gen {
    //! Classic counterparts. Offsets and immediates are packed into `k`.

    use super::*;
    use crate::classic::Instruction;

    pub fn random_register<R: RandomSource + ?Sized>(rng: &mut R) -> classic::Register {
        if rng.rand_range(0, 1) == 0 {
            classic::Register::A
        } else {
            classic::Register::X
        }
    }

    pub fn random_alu_instruction<R: RandomSource + ?Sized>(rng: &mut R) -> Instruction {
        let op = (rng.rand_range(0x00, 0x0a) as u8) << 4;
        if rng.rand_range(0, 1) == 0 {
            let mut value = random_immediate(rng);
            if matches!(op, classic::ALU_LSH | classic::ALU_RSH) {
                value = (value % 32).abs();
            }
            Instruction::alu(op, value)
        } else {
            Instruction::alu(op, random_register(rng))
        }
    }

    /// Conditional jump whose true branch skips `[1, max_offset]` instructions.
    pub fn random_jmp_instruction<R: RandomSource + ?Sized>(rng: &mut R, max_offset: u64) -> Instruction {
        let op = loop {
            let op = (rng.rand_range(0x00, 0x04) as u8) << 4;
            if op != classic::JMP_JA {
                break op;
            }
        };
        let jt = rng.rand_range(1, max_offset.clamp(1, u8::MAX as u64)) as u8;
        if rng.one_of(2) {
            Instruction::jmp(op, jt, 0, random_immediate(rng))
        } else {
            Instruction::jmp(op, jt, 0, random_register(rng))
        }
    }

    pub fn random_size<R: RandomSource + ?Sized>(rng: &mut R) -> u8 {
        ((rng.rand_int() % 3) as u8) << 3
    }

    pub fn alignment_for_size(size: u8) -> i16 {
        match size {
            classic::SIZE_B => 1,
            classic::SIZE_H => 2,
            _ => 4,
        }
    }

    /// Non-zero, negative, capped at 512 and aligned to the access size.
    pub fn random_offset<R: RandomSource + ?Sized>(rng: &mut R, size: u8) -> i16 {
        let mut offset = 0i16;
        while offset == 0 {
            offset = (rng.rand_int() % 512) as i16;
        }
        offset = -offset;
        let alignment = alignment_for_size(size);
        while offset % alignment != 0 {
            offset -= 1;
        }
        offset
    }

    fn random_mode<R: RandomSource + ?Sized>(rng: &mut R) -> u8 {
        const MODES: [u8; 6] = [
            classic::MODE_IMM,
            classic::MODE_ABS,
            classic::MODE_IND,
            classic::MODE_MEM,
            classic::MODE_LEN,
            classic::MODE_MSH,
        ];
        MODES[(rng.rand_int() % MODES.len() as u64) as usize]
    }

    pub fn random_store_instruction<R: RandomSource + ?Sized>(rng: &mut R) -> Instruction {
        let size = random_size(rng);
        let offset = random_offset(rng, size);
        let mode = random_mode(rng);
        let class = if rng.rand_int() % 2 == 0 {
            classic::CLASS_ST
        } else {
            classic::CLASS_STX
        };
        Instruction::load_store(class, size, mode, 0, 0, offset as i32 as u32)
    }

    pub fn random_load_instruction<R: RandomSource + ?Sized>(rng: &mut R) -> Instruction {
        let size = random_size(rng);
        let offset = random_offset(rng, size);
        let mode = random_mode(rng);
        let class = if rng.rand_int() % 2 == 0 {
            classic::CLASS_LD
        } else {
            classic::CLASS_LDX
        };
        Instruction::load_store(class, size, mode, 0, 0, offset as i32 as u32)
    }

    pub fn random_mem_instruction<R: RandomSource + ?Sized>(rng: &mut R) -> Instruction {
        if rng.rand_int() % 2 == 0 {
            random_store_instruction(rng)
        } else {
            random_load_instruction(rng)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SeededRandom;

    #[test]
    fn alu_shifts_stay_in_range_and_neg_never_uses_a_register() {
        let mut rng = SeededRandom::from_seed(1);
        for _ in 0..2000 {
            let ins = random_alu_instruction(&mut rng);
            assert!(ins.class == ebpf::CLASS_ALU || ins.class == ebpf::CLASS_ALU64);
            assert!(ins.code <= ebpf::ALU_ARSH);
            if ins.source == ebpf::SRC_IMM && matches!(ins.code, ebpf::ALU_LSH | ebpf::ALU_RSH | ebpf::ALU_ARSH) {
                let max = if ins.class == ebpf::CLASS_ALU { 32 } else { 64 };
                assert!((0..max).contains(&ins.imm), "{ins}");
            }
            if ins.code == ebpf::ALU_NEG {
                assert_eq!(ins.source, ebpf::SRC_IMM);
                assert_eq!(ins.imm, 0);
            }
            assert_ne!(ins.dst, Register::R10);
        }
    }

    #[test]
    fn jumps_are_conditional_with_offsets_in_bounds() {
        let mut rng = SeededRandom::from_seed(2);
        for max in [1u64, 2, 7, 40] {
            for _ in 0..500 {
                let ins = random_jmp_instruction(&mut rng, max);
                assert!(ins.is_conditional_jump(), "{ins}");
                assert!((1..=max as i16).contains(&ins.offset), "{ins}");
            }
        }
    }

    #[test]
    fn memory_accesses_hit_the_stack_aligned() {
        let mut rng = SeededRandom::from_seed(3);
        for _ in 0..2000 {
            let ins = random_mem_instruction(&mut rng);
            let size = ins.code & 0x18;
            assert!(ins.offset < 0 && ins.offset >= -512, "{ins}");
            assert_eq!(ins.offset % alignment_for_size(size), 0, "{ins}");
            match ins.class {
                ebpf::CLASS_ST | ebpf::CLASS_STX => assert_eq!(ins.dst, Register::R10),
                ebpf::CLASS_LDX => assert_eq!(ins.src, Register::R10),
                other => panic!("unexpected class {other}"),
            }
        }
    }

    #[test]
    fn classic_offsets_are_negative_and_aligned() {
        let mut rng = SeededRandom::from_seed(4);
        for _ in 0..2000 {
            let size = classic_gen::random_size(&mut rng);
            let offset = classic_gen::random_offset(&mut rng, size);
            assert!(offset < 0 && offset > -520);
            assert_eq!(offset % classic_gen::alignment_for_size(size), 0);
        }
    }

    #[test]
    fn classic_jumps_never_produce_ja() {
        let mut rng = SeededRandom::from_seed(5);
        for _ in 0..500 {
            let ins = classic_gen::random_jmp_instruction(&mut rng, 3);
            assert!(ins.is_conditional_jump());
            assert!((1..=3).contains(&ins.jt));
        }
    }
}
