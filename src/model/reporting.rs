//! Run summaries and findings.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reporter {
    Pretty,
    Json,
}

impl clap::ValueEnum for Reporter {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Pretty, Self::Json]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Pretty => clap::builder::PossibleValue::new("pretty"),
            Self::Json => clap::builder::PossibleValue::new("json"),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Fuzz,
    Replay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdentity {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub seed: u64,
    pub strategy: String,
    #[serde(rename = "reportPath", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(rename = "artifactsDir", skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<String>,
    #[serde(rename = "corpusDir", skip_serializing_if = "Option::is_none")]
    pub corpus_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// The verifier accepted a program whose execution broke the map check.
    MapCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub title: String,
    pub message: String,
    #[serde(rename = "programPath", skip_serializing_if = "Option::is_none")]
    pub program_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzStats {
    pub iterations: u64,
    pub valid: u64,
    pub rejected: u64,
    pub kept: u64,
    pub executed: u64,
    pub flakes: u64,
    #[serde(rename = "iterationErrors")]
    pub iteration_errors: u64,
    #[serde(rename = "corpusEntries")]
    pub corpus_entries: usize,
    #[serde(rename = "uniqueAddresses")]
    pub unique_addresses: usize,
}

impl FuzzStats {
    /// Share of generated programs the verifier accepted.
    pub fn valid_ratio(&self) -> f64 {
        if self.iterations == 0 {
            return 0.0;
        }
        self.valid as f64 / self.iterations as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: ExitStatus,
    pub mode: RunMode,
    pub identity: RunIdentity,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<FuzzStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    /// Set when the run stopped on an error rather than finishing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "status={:?} mode={:?} strategy={} runId={} seed={}\n",
            self.status, self.mode, self.identity.strategy, self.identity.run_id, self.identity.seed
        ));
        if let Some(path) = &self.identity.report_path {
            out.push_str(&format!("report={path}\n"));
        }
        if let Some(dir) = &self.identity.artifacts_dir {
            out.push_str(&format!("artifacts={dir}\n"));
        }
        if let Some(stats) = &self.stats {
            out.push_str(&format!(
                "iterations={} valid={} ({:.1}%) kept={} executed={} flakes={} errors={} corpus={} addresses={}\n",
                stats.iterations,
                stats.valid,
                stats.valid_ratio() * 100.0,
                stats.kept,
                stats.executed,
                stats.flakes,
                stats.iteration_errors,
                stats.corpus_entries,
                stats.unique_addresses
            ));
        }
        if let Some(err) = &self.error {
            out.push_str(&format!("error: {err}\n"));
        }
        for finding in &self.findings {
            out.push_str(&format!("- {:?}: {}: {}\n", finding.kind, finding.title, finding.message));
            if let Some(path) = &finding.program_path {
                out.push_str(&format!("  program={path}\n"));
            }
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub mode: RunMode,
    pub status: ExitStatus,
    pub seed: u64,
    pub strategy: String,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "reportPath", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(rename = "findingsCount")]
    pub findings_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
}

pub fn write_run_manifest(summary: &RunSummary, artifacts_dir: &Path) -> crate::BpfuzzResult<PathBuf> {
    std::fs::create_dir_all(artifacts_dir)?;
    let manifest = RunManifest {
        schema_version: "bpfuzz.run_manifest.v1".to_string(),
        run_id: summary.identity.run_id.clone(),
        mode: summary.mode,
        status: summary.status,
        seed: summary.identity.seed,
        strategy: summary.identity.strategy.clone(),
        started_at: summary.started_at.clone(),
        finished_at: summary.finished_at.clone(),
        duration_ms: summary.duration_ms,
        report_path: summary.identity.report_path.clone(),
        findings_count: summary.findings.len(),
        iterations: summary.stats.as_ref().map(|s| s.iterations),
    };
    let out = artifacts_dir.join("manifest.json");
    std::fs::write(&out, serde_json::to_vec_pretty(&manifest)?)?;
    Ok(out)
}
