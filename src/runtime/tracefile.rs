//! On-disk program artifacts and corpus traces.

use serde::{Deserialize, Serialize};
use tracing::warn;
use walkdir::WalkDir;

use std::path::{Path, PathBuf};

use crate::encoding::{le_bytes_to_words, words_to_le_bytes};
use crate::{BpfuzzError, BpfuzzResult, CandidateProgram, CoverageTrace, Dialect, VersionInfo};

pub const ARTIFACT_FORMAT: &str = "bpfuzz-program";
pub const CURRENT_ARTIFACT_VERSION: u32 = 1;

/// A program exported for reproduction, with the exact bytecode that was
/// submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramArtifact {
    pub format: String,
    pub version: u32,
    pub engine: VersionInfo,
    pub program: CandidateProgram,
    /// Little-endian wire words as lowercase hex.
    pub bytecode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ProgramArtifact {
    pub fn new(program: CandidateProgram, seed: Option<u64>) -> BpfuzzResult<Self> {
        let words = program.encode()?;
        Ok(Self {
            format: ARTIFACT_FORMAT.to_string(),
            version: CURRENT_ARTIFACT_VERSION,
            engine: crate::version_info(),
            program,
            bytecode: bytes_to_hex(&words_to_le_bytes(&words)),
            seed,
            note: None,
            checksum: None,
        })
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.program.dialect()
    }

    /// Recorded bytecode, decoded back into words.
    pub fn words(&self) -> BpfuzzResult<Vec<u64>> {
        let bytes = hex_decode(&self.bytecode)?;
        le_bytes_to_words(&bytes)
            .ok_or_else(|| BpfuzzError::Artifact(format!("bytecode is {} bytes, not whole words", bytes.len())))
    }

    /// Check that encoding the stored instructions reproduces the recorded
    /// bytecode word for word.
    pub fn verify_encoding(&self) -> BpfuzzResult<Vec<u64>> {
        let recorded = self.words()?;
        let encoded = self.program.encode()?;
        if recorded != encoded {
            let at = recorded
                .iter()
                .zip(&encoded)
                .position(|(a, b)| a != b)
                .unwrap_or(recorded.len().min(encoded.len()));
            return Err(BpfuzzError::Artifact(format!(
                "re-encoded bytecode diverges at word {at} ({} recorded, {} encoded)",
                recorded.len(),
                encoded.len()
            )));
        }
        Ok(encoded)
    }

    pub fn write_json(&self, path: &Path) -> BpfuzzResult<()> {
        let mut with_checksum = self.clone();
        with_checksum.checksum = None;
        let canonical = serde_json::to_vec(&with_checksum)?;
        with_checksum.checksum = Some(blake3::hash(&canonical).to_hex().to_string());
        atomic_write(path, &serde_json::to_vec_pretty(&with_checksum)?)
    }

    pub fn read_json(path: &Path) -> BpfuzzResult<Self> {
        let bytes = std::fs::read(path)?;
        let artifact: ProgramArtifact = serde_json::from_slice(&bytes)
            .map_err(|e| BpfuzzError::Artifact(format!("failed to parse artifact {}: {e}", path.display())))?;
        if artifact.format != ARTIFACT_FORMAT {
            return Err(BpfuzzError::Artifact(format!(
                "{} is not a {ARTIFACT_FORMAT} artifact (format {:?})",
                path.display(),
                artifact.format
            )));
        }
        if artifact.version > CURRENT_ARTIFACT_VERSION {
            warn!(
                version = artifact.version,
                current = CURRENT_ARTIFACT_VERSION,
                "artifact was written by a newer bpfuzz"
            );
        }
        verify_checksum(&artifact, path)?;
        Ok(artifact)
    }
}

fn verify_checksum(artifact: &ProgramArtifact, path: &Path) -> BpfuzzResult<()> {
    let Some(expected) = artifact.checksum.as_ref() else {
        return Ok(());
    };
    let mut canonical = artifact.clone();
    canonical.checksum = None;
    let got = blake3::hash(&serde_json::to_vec(&canonical)?).to_hex().to_string();
    if &got != expected {
        return Err(BpfuzzError::Artifact(format!(
            "artifact checksum mismatch for {} (expected {expected}, got {got})",
            path.display()
        )));
    }
    Ok(())
}

/// Write bytecode as raw little-endian words.
pub fn write_words_bin(path: &Path, words: &[u64]) -> BpfuzzResult<()> {
    atomic_write(path, &words_to_le_bytes(words))
}

pub fn read_words_bin(path: &Path) -> BpfuzzResult<Vec<u64>> {
    let bytes = std::fs::read(path)?;
    le_bytes_to_words(&bytes).ok_or_else(|| {
        BpfuzzError::Artifact(format!(
            "{} holds {} bytes, not a whole number of words",
            path.display(),
            bytes.len()
        ))
    })
}

/// Store a kept trace under a content-addressed name; existing files are
/// left alone.
pub fn persist_trace(dir: &Path, trace: &CoverageTrace) -> BpfuzzResult<PathBuf> {
    let program = serde_json::to_vec(&trace.program)?;
    let out = dir.join(format!("trace-{}.json", blake3::hash(&program).to_hex()));
    if !out.exists() {
        atomic_write(&out, &serde_json::to_vec_pretty(trace)?)?;
    }
    Ok(out)
}

/// Every parseable `trace-*.json` directly under `dir`, in file name order.
pub fn load_traces(dir: &Path) -> BpfuzzResult<Vec<(PathBuf, CoverageTrace)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            BpfuzzError::Io(e.into_io_error().unwrap_or_else(|| std::io::Error::other(msg)))
        })?;
        if !entry.file_type().is_file() || !is_trace_file(entry.path()) {
            continue;
        }
        let bytes = std::fs::read(entry.path())?;
        match serde_json::from_slice::<CoverageTrace>(&bytes) {
            Ok(trace) => out.push((entry.path().to_path_buf(), trace)),
            Err(err) => warn!(path = %entry.path().display(), "skipping unreadable corpus trace: {err}"),
        }
    }
    Ok(out)
}

pub fn is_trace_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|name| name.starts_with("trace-") && name.ends_with(".json"))
}

// Write beside the target then rename over it.
fn atomic_write(path: &Path, bytes: &[u8]) -> BpfuzzResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("artifact");
    let tmp_path = parent.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    const TABLE: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for b in bytes {
        out.push(TABLE[(b >> 4) as usize] as char);
        out.push(TABLE[(b & 0x0F) as usize] as char);
    }
    out
}

fn hex_decode(s: &str) -> BpfuzzResult<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(BpfuzzError::Artifact("hex bytecode has odd length".to_string()));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| Ok((hex_val(pair[0])? << 4) | hex_val(pair[1])?))
        .collect()
}

fn hex_val(b: u8) -> BpfuzzResult<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(BpfuzzError::Artifact(format!("invalid hex digit {:?}", b as char))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::{Instruction, Register::*};
    use crate::{classic, ClassicProgram, Program};
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bpfuzz-tracefile-tests-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn sample() -> CandidateProgram {
        let prog = Program::new(vec![Instruction::ld_imm64(R1, -2), Instruction::mov64(R0, 0), Instruction::exit()])
            .expect("program");
        CandidateProgram::Extended(prog)
    }

    #[test]
    fn artifact_round_trips_with_checksum() {
        let dir = temp_dir();
        let path = dir.join("program.json");
        let artifact = ProgramArtifact::new(sample(), Some(9)).expect("artifact").with_note("map check");
        artifact.write_json(&path).expect("write");

        let back = ProgramArtifact::read_json(&path).expect("read");
        assert!(back.checksum.is_some());
        assert_eq!(back.program, artifact.program);
        assert_eq!(back.note.as_deref(), Some("map check"));
        assert_eq!(back.verify_encoding().expect("encoding").len(), 4);
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tampered_artifact_is_rejected() {
        let dir = temp_dir();
        let path = dir.join("program.json");
        ProgramArtifact::new(sample(), None).expect("artifact").write_json(&path).expect("write");

        let mut value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        value["bytecode"] = serde_json::Value::String("00".repeat(32));
        std::fs::write(&path, serde_json::to_vec(&value).expect("json")).expect("write");
        let err = ProgramArtifact::read_json(&path).expect_err("checksum must not match");
        assert!(err.to_string().contains("checksum mismatch"), "{err}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn diverging_bytecode_fails_the_encoding_check() {
        let mut artifact = ProgramArtifact::new(sample(), None).expect("artifact");
        artifact.bytecode = "00".repeat(32);
        let err = artifact.verify_encoding().expect_err("must diverge");
        assert!(err.to_string().contains("diverges at word 0"), "{err}");
    }

    #[test]
    fn classic_artifacts_keep_their_dialect() {
        let prog = ClassicProgram::new(vec![classic::Instruction::ret(0u32)]).expect("classic");
        let artifact = ProgramArtifact::new(CandidateProgram::Classic(prog), None).expect("artifact");
        assert_eq!(artifact.dialect(), Dialect::Classic);
        assert_eq!(artifact.words().expect("words"), vec![0x06]);
    }

    #[test]
    fn bin_export_is_little_endian_words() {
        let dir = temp_dir();
        let path = dir.join("program.bin");
        write_words_bin(&path, &[0x0102, u64::MAX]).expect("write");
        let raw = std::fs::read(&path).expect("read");
        assert_eq!(&raw[..2], &[0x02, 0x01]);
        assert_eq!(read_words_bin(&path).expect("words"), vec![0x0102, u64::MAX]);

        std::fs::write(&path, [1u8, 2, 3]).expect("short");
        assert!(read_words_bin(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn traces_persist_once_and_reload() {
        let dir = temp_dir();
        let trace = CoverageTrace {
            program: vec![Instruction::mov64(R0, 0), Instruction::exit()],
            signature: 0xabc,
            coverage_size: 2,
            usage_count: 4,
        };
        let first = persist_trace(&dir, &trace).expect("persist");
        let second = persist_trace(&dir, &trace).expect("persist again");
        assert_eq!(first, second);
        assert!(is_trace_file(&first));
        std::fs::write(dir.join("trace-broken.json"), b"{").expect("junk");
        std::fs::write(dir.join("notes.txt"), b"ignored").expect("notes");

        let loaded = load_traces(&dir).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1, trace);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
