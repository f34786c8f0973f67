//! `bpfuzz.toml` config loading.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Base directory for run reports and corpora.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Strategy used when `fuzz` is given none.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Times a queued trace is reused as a seed before it is dropped.
    #[serde(default = "default_max_prog_reuse")]
    pub max_prog_reuse: u32,

    /// Execution retries while the check map stays all zero.
    #[serde(default = "default_flake_max_attempts")]
    pub flake_max_attempts: u32,

    /// Capacity of the kernel coverage buffer, in addresses.
    #[serde(default = "default_coverage_buffer_size")]
    pub coverage_buffer_size: usize,

    /// Collect verifier coverage at all.
    #[serde(default = "default_coverage_enabled")]
    pub coverage_enabled: bool,

    /// Kernel image used to resolve coverage addresses to source lines.
    #[serde(default)]
    pub vmlinux_path: Option<PathBuf>,

    /// Upper bound on instructions in a mutated program; longer candidates
    /// restart from the default seed.
    #[serde(default = "default_max_program_len")]
    pub max_program_len: usize,

    /// Default reporter for CLI commands.
    #[serde(default = "default_reporter")]
    pub reporter: crate::Reporter,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".bpfuzz")
}

fn default_strategy() -> String {
    "coverage".to_string()
}

fn default_max_prog_reuse() -> u32 {
    crate::MAX_PROG_REUSE
}

fn default_flake_max_attempts() -> u32 {
    1000
}

fn default_coverage_buffer_size() -> usize {
    64 << 10
}

fn default_coverage_enabled() -> bool {
    true
}

fn default_max_program_len() -> usize {
    4096
}

fn default_reporter() -> crate::Reporter {
    crate::Reporter::Pretty
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            strategy: default_strategy(),
            max_prog_reuse: default_max_prog_reuse(),
            flake_max_attempts: default_flake_max_attempts(),
            coverage_buffer_size: default_coverage_buffer_size(),
            coverage_enabled: default_coverage_enabled(),
            vmlinux_path: None,
            max_program_len: default_max_program_len(),
            reporter: default_reporter(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    pub fn corpora_dir(&self) -> PathBuf {
        self.base_dir.join("corpora")
    }

    pub fn default_corpus_dir(&self) -> PathBuf {
        self.corpora_dir().join("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load_optional(Path::new("/nonexistent/bpfuzz.toml"));
        assert_eq!(cfg.max_prog_reuse, 25);
        assert_eq!(cfg.flake_max_attempts, 1000);
        assert_eq!(cfg.strategy, "coverage");
        assert_eq!(cfg.default_corpus_dir(), PathBuf::from(".bpfuzz/corpora/default"));
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let cfg: Config = toml::from_str(
            r#"
            strategy = "playground"
            max_prog_reuse = 3
            vmlinux_path = "/boot/vmlinux"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.strategy, "playground");
        assert_eq!(cfg.max_prog_reuse, 3);
        assert_eq!(cfg.vmlinux_path, Some(PathBuf::from("/boot/vmlinux")));
        assert!(cfg.coverage_enabled);
        assert_eq!(cfg.reporter, crate::Reporter::Pretty);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("bpfuzz-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "max_prog_reuse = \"many\"").expect("write");
        let cfg = Config::load_optional(&path);
        assert_eq!(cfg.max_prog_reuse, 25);
        let _ = std::fs::remove_file(&path);
    }
}
