//! `bpfuzz encode`: program JSON to wire words.

use serde::Serialize;

use std::path::Path;

use crate::{BpfuzzResult, CandidateProgram, Dialect, ProgramArtifact, write_words_bin};

#[derive(Debug, Clone, Serialize)]
pub struct EncodedProgram {
    pub dialect: Dialect,
    pub instructions: usize,
    /// One `0x`-prefixed hex string per wire word.
    pub words: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
}

/// Read either a program artifact or a bare `{"dialect", "instructions"}`
/// program from `path`. Artifacts are checked against their recorded
/// bytecode.
pub fn read_program(path: &Path) -> BpfuzzResult<CandidateProgram> {
    let value: serde_json::Value = serde_json::from_slice(&std::fs::read(path)?)?;
    if value.get("format").is_some() {
        let artifact = ProgramArtifact::read_json(path)?;
        artifact.verify_encoding()?;
        return Ok(artifact.program);
    }
    Ok(serde_json::from_value(value)?)
}

pub fn encode_command(path: &Path, out: Option<&Path>) -> BpfuzzResult<EncodedProgram> {
    let program = read_program(path)?;
    let words = program.encode()?;
    if let Some(out) = out {
        write_words_bin(out, &words)?;
    }
    Ok(EncodedProgram {
        dialect: program.dialect(),
        instructions: program.len(),
        words: words.iter().map(|w| format!("{w:#018x}")).collect(),
        out: out.map(|p| p.to_string_lossy().to_string()),
    })
}
