//! Corpus inspection.

use clap::Subcommand;
use serde::Serialize;

use std::path::{Path, PathBuf};

use crate::{BpfuzzError, BpfuzzResult, Config, CoverageTrace, is_trace_file, load_traces};

#[derive(Debug, Subcommand)]
pub enum CorpusCommand {
    /// List the traces of a corpus directory (default: the configured corpus).
    List { dir: Option<PathBuf> },
    /// Print one trace with its disassembly.
    Show { path: PathBuf },
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusEntry {
    pub path: String,
    pub signature: String,
    #[serde(rename = "coverageSize")]
    pub coverage_size: u64,
    pub instructions: usize,
}

impl CorpusEntry {
    fn new(path: &Path, trace: &CoverageTrace) -> Self {
        Self {
            path: path.to_string_lossy().to_string(),
            signature: format!("{:#018x}", trace.signature),
            coverage_size: trace.coverage_size,
            instructions: trace.program.len(),
        }
    }
}

pub fn corpus_command(config: &Config, command: &CorpusCommand) -> BpfuzzResult<serde_json::Value> {
    match command {
        CorpusCommand::List { dir } => {
            let dir = dir.clone().unwrap_or_else(|| config.default_corpus_dir());
            let mut entries: Vec<CorpusEntry> = load_traces(&dir)?
                .iter()
                .map(|(path, trace)| CorpusEntry::new(path, trace))
                .collect();
            entries.sort_by(|a, b| b.coverage_size.cmp(&a.coverage_size).then_with(|| a.path.cmp(&b.path)));
            Ok(serde_json::to_value(entries)?)
        }

        CorpusCommand::Show { path } => {
            if !is_trace_file(path) {
                return Err(BpfuzzError::InvalidArgument(format!(
                    "{} is not a corpus trace (expected trace-<hash>.json)",
                    path.display()
                )));
            }
            let trace: CoverageTrace = serde_json::from_slice(&std::fs::read(path)?)?;
            let disassembly: Vec<String> = trace.program.iter().map(ToString::to_string).collect();
            let mut out = serde_json::to_value(CorpusEntry::new(path, &trace))?;
            out["disassembly"] = serde_json::to_value(disassembly)?;
            Ok(out)
        }
    }
}
