//! Error types shared across the crate.

use thiserror::Error;

/// The encoder was handed an instruction whose fields cannot be framed.
///
/// These are defects in whatever produced the instruction, never a verifier
/// outcome, so the fuzz loop treats them as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("unknown operand source tag {0:#04x} (expected register 0x08 or immediate 0x00)")]
    UnknownOperandType(u8),

    #[error("no opcode layout for class {class:#x} with code {code:#04x}")]
    UnknownOpcodeShape { class: u8, code: u8 },

    #[error("pseudo slot does not match wide-load framing for opcode {0:#04x}")]
    PseudoSlotMismatch(u8),

    #[error("unknown register number {0}")]
    UnknownRegister(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("instruction {index}: only exit and unconditional jumps may have a zero offset")]
    ZeroOffsetNotAllowed { index: usize },

    #[error("instruction {index}: jump offset {offset} goes out of bounds ({remaining} instructions remain)")]
    JumpOutOfBounds {
        index: usize,
        offset: i32,
        remaining: usize,
    },

    #[error("instruction {index}: jump lands on the pseudo slot at word {target}")]
    JumpIntoPseudoSlot { index: usize, target: usize },

    #[error("program is empty")]
    EmptyProgram,

    #[error("func_info {index}: offset {insn_off} is not the next function start")]
    BadFuncInfo { index: usize, insn_off: u32 },
}

/// A BTF blob a loader would refuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BtfError {
    #[error("invalid magic {0:#06x}")]
    BadMagic(u16),

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported hdr_len {0}")]
    BadHeaderLen(u32),

    #[error("section at {off} with length {len} runs past the blob")]
    SectionOutOfBounds { off: usize, len: usize },

    #[error("truncated type data at byte {0}")]
    Truncated(usize),

    #[error("string section must start and end with a nul byte")]
    BadStringSection,

    #[error("unknown kind {0}")]
    UnknownKind(u8),

    #[error("[{id}] invalid name_offset {off}")]
    BadNameOffset { id: u32, off: u32 },

    #[error("[{id}] invalid type_id {referenced}")]
    BadTypeId { id: u32, referenced: u32 },

    #[error("[{0}] func must be named")]
    AnonymousFunc(u32),

    #[error("[{0}] func does not point at a func_proto")]
    FuncWithoutProto(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("unknown mutation operation {0}")]
    UnknownOperation(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("map creation failed: {0}")]
    MapCreation(String),

    #[error("map {0} is not open")]
    UnknownMap(u32),

    #[error("program handle {0} is not loaded")]
    UnknownProgram(u32),
}

#[derive(Debug, Error)]
pub enum BpfuzzError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("program flaked: no successful execution in {attempts} attempts")]
    ExecutionFlake { attempts: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BpfuzzError {
    /// Errors that abort the current iteration but leave the run intact.
    pub fn is_iteration_scoped(&self) -> bool {
        matches!(self, Self::Resource(_) | Self::ExecutionFlake { .. })
    }
}

pub type BpfuzzResult<T> = Result<T, BpfuzzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_and_flake_errors_are_iteration_scoped() {
        let resource: BpfuzzError = ResourceError::MapCreation("enomem".to_string()).into();
        assert!(resource.is_iteration_scoped());
        assert!(BpfuzzError::ExecutionFlake { attempts: 3 }.is_iteration_scoped());

        let encoding: BpfuzzError = EncodingError::UnknownOperandType(0x10).into();
        assert!(!encoding.is_iteration_scoped());
        let structural: BpfuzzError = StructuralError::ZeroOffsetNotAllowed { index: 1 }.into();
        assert!(!structural.is_iteration_scoped());
    }

    #[test]
    fn messages_carry_the_offending_values() {
        let err = StructuralError::JumpOutOfBounds {
            index: 1,
            offset: 2,
            remaining: 2,
        };
        assert!(err.to_string().contains("offset 2"));
        assert!(EncodingError::UnknownOperandType(0x10).to_string().contains("0x10"));
    }
}
