//! bpfuzz CLI entrypoint.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use bpfuzz::{
    Config, CorpusCommand, ExitStatus, FuzzDuration, FuzzOptions, ModelVerifier, Reporter, RunSummary, StrategyKind,
};

#[derive(Debug, Parser)]
#[command(name = "bpfuzz")]
#[command(about = "coverage-guided fuzzer for classic and extended BPF verifiers")]
struct Cli {
    /// Path to config file. Missing configs are treated as "defaults".
    #[arg(long, global = true, default_value = "bpfuzz.toml")]
    config: PathBuf,

    /// Working directory for execution.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    /// Machine-readable output to stdout (JSON).
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate, verify and execute programs until a budget runs out or a
    /// strategy reports a finding
    Fuzz {
        /// Strategy name (see `bpfuzz strategies`); defaults to the config.
        #[arg(long)]
        strategy: Option<StrategyKind>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        runs: Option<u64>,

        #[arg(long)]
        time: Option<FuzzDuration>,

        /// Corpus directory; defaults to <base_dir>/corpora/default.
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Do not write kept traces back to the corpus.
        #[arg(long)]
        no_persist: bool,

        /// Also write the first finding's program artifact to this path.
        #[arg(long)]
        record: Option<PathBuf>,

        #[arg(long)]
        reporter: Option<Reporter>,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Encode a program JSON file to wire words
    Encode {
        program: PathBuf,

        /// Write the little-endian words to this .bin file.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Re-verify and re-execute an exported program artifact
    Replay {
        artifact: PathBuf,

        #[arg(long)]
        reporter: Option<Reporter>,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Inspect a persisted corpus
    Corpus {
        #[command(subcommand)]
        command: CorpusCommand,
    },

    /// List the available strategies
    Strategies,

    /// Print version and build info
    Version,
}

/// Knobs of the in-process model verifier.
#[derive(Debug, Clone, clap::Args)]
struct ModelArgs {
    /// Skip bounds checks on map value stores (plants a verifier bug).
    #[arg(long)]
    model_unchecked_stores: bool,

    /// Forget what `bpf_loop` callbacks write to the caller's stack (plants a verifier bug).
    #[arg(long)]
    model_stale_callback_stack: bool,

    /// Report this many executions as not triggered before running them.
    #[arg(long, default_value_t = 0)]
    model_failing_runs: u32,
}

impl ModelArgs {
    fn build(&self, config: &Config) -> ModelVerifier {
        let mut verifier = ModelVerifier::new()
            .with_coverage(config.coverage_enabled)
            .with_failing_runs(self.model_failing_runs);
        if self.model_unchecked_stores {
            verifier = verifier.with_unchecked_map_stores();
        }
        if self.model_stale_callback_stack {
            verifier = verifier.with_stale_callback_stack();
        }
        verifier
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_global_args(std::env::args()));

    if let Err(err) = init_tracing(&cli.log) {
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    let cwd = cli
        .cwd
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    if let Err(err) = std::env::set_current_dir(&cwd) {
        return print_error_and_exit(
            &cli,
            anyhow::anyhow!(err).context(format!("failed to set cwd to {}", cwd.display())),
        );
    }

    let config = Config::load_optional(&cli.config);

    match run_command(&cli, &config) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(&cli, err),
    }
}

// Accept global flags after the subcommand as well as before it.
fn normalize_global_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let all: Vec<String> = args.into_iter().collect();
    if all.is_empty() {
        return all;
    }

    let mut globals = Vec::new();
    let mut rest = Vec::new();

    let mut i = 1usize;
    while i < all.len() {
        let arg = &all[i];
        match arg.as_str() {
            "--json" => {
                globals.push(arg.clone());
                i += 1;
            }
            "--config" | "--cwd" | "--log" => {
                globals.push(arg.clone());
                if i + 1 < all.len() {
                    globals.push(all[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ if arg.starts_with("--config=") || arg.starts_with("--cwd=") || arg.starts_with("--log=") => {
                globals.push(arg.clone());
                i += 1;
            }
            _ => {
                rest.push(arg.clone());
                i += 1;
            }
        }
    }

    let mut normalized = Vec::with_capacity(all.len());
    normalized.push(all[0].clone());
    normalized.extend(globals);
    normalized.extend(rest);
    normalized
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("{err}"))
}

fn run_command(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Command::Fuzz {
            strategy,
            seed,
            runs,
            time,
            corpus,
            no_persist,
            record,
            reporter,
            model,
        } => {
            let strategy = match strategy {
                Some(kind) => *kind,
                None => config.strategy.parse()?,
            };
            let mut executor = model.build(config);
            let opt = FuzzOptions {
                strategy,
                seed: *seed,
                runs: *runs,
                time: time.map(|d| d.0),
                corpus_dir: corpus.clone(),
                persist_corpus: !*no_persist,
                record_to: record.clone(),
            };
            let run = bpfuzz::fuzz(config, &mut executor, &opt)?;
            print_run_summary(cli, reporter.unwrap_or(config.reporter), &run.summary)?;
            Ok(exit_code_for_status(run.summary.status))
        }

        Command::Encode { program, out } => {
            let encoded = bpfuzz::encode_command(program, out.as_deref())?;
            if cli.json {
                print_json_or_text(cli, &encoded)?;
            } else {
                for word in &encoded.words {
                    println!("{word}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Replay {
            artifact,
            reporter,
            model,
        } => {
            let mut executor = model.build(config);
            let result = bpfuzz::replay(config, &mut executor, artifact)?;
            print_run_summary(cli, reporter.unwrap_or(config.reporter), &result.summary)?;
            Ok(exit_code_for_status(result.summary.status))
        }

        Command::Corpus { command } => {
            let out = bpfuzz::corpus_command(config, command)?;
            print_json_or_text(cli, &out)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Strategies => {
            if cli.json {
                let list: Vec<_> = StrategyKind::ALL
                    .iter()
                    .map(|k| serde_json::json!({"name": k.name(), "dialect": k.dialect(), "description": k.description()}))
                    .collect();
                print_json_or_text(cli, &list)?;
            } else {
                for kind in StrategyKind::ALL {
                    println!("{:<24} {}", kind.name(), kind.description());
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Version => {
            let info = bpfuzz::version_info();
            print_json_or_text(cli, &info)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_run_summary(cli: &Cli, reporter: Reporter, summary: &RunSummary) -> anyhow::Result<()> {
    if cli.json || reporter == Reporter::Json {
        println!("{}", serde_json::to_string(summary)?);
    } else {
        println!("{}", summary.pretty());
    }
    Ok(())
}

fn print_json_or_text<T: serde::Serialize>(cli: &Cli, value: &T) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

fn print_error_and_exit(cli: &Cli, err: anyhow::Error) -> ExitCode {
    let msg = format!("{err:#}");
    if cli.json {
        let out = serde_json::json!({
            "status": "error",
            "code": "error",
            "message": msg,
        });
        println!("{out}");
    } else {
        eprintln!("{msg}");
    }
    ExitCode::from(2)
}

fn exit_code_for_status(status: ExitStatus) -> ExitCode {
    match status {
        ExitStatus::Pass => ExitCode::SUCCESS,
        ExitStatus::Fail => ExitCode::from(1),
        ExitStatus::Error => ExitCode::from(2),
    }
}
