//! The fuzz loop and artifact replay.
//!
//! One strategy instance drives one executor, one iteration at a time:
//! generate, encode, verify, maybe execute, then fold the outcome back into
//! the strategy. Resource and flake errors cost a single iteration; encoding
//! defects stop the run.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ebpf;
use crate::{
    Addr2Line, AnyStrategy, BpfuzzError, BpfuzzResult, CandidateProgram, Config, CoverageManager, CoverageWorker,
    Deadline, ExecutionResult, ExecutionVerdict, Executor, ExitStatus, Finding, FindingKind, FuzzStats,
    LineCoverageReport, MapHandle, Program, ProgramArtifact, ProgramHandle, RunIdentity, RunMode, RunSummary,
    Strategy, StrategyKind, StrategySettings, ValidationResult, MAP_CHECK_VALUE, gen_seed, load_traces,
    persist_trace, wall_time_iso_utc, write_run_manifest, write_words_bin,
};

#[derive(Debug, Clone)]
pub struct FuzzOptions {
    pub strategy: StrategyKind,
    pub seed: Option<u64>,
    pub runs: Option<u64>,
    pub time: Option<Duration>,
    pub corpus_dir: Option<PathBuf>,
    /// Write kept traces back to the corpus directory.
    pub persist_corpus: bool,
    /// Extra copy of the first finding's program artifact.
    pub record_to: Option<PathBuf>,
}

impl FuzzOptions {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            seed: None,
            runs: None,
            time: None,
            corpus_dir: None,
            persist_corpus: true,
            record_to: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzCoverageStats {
    pub strategy: String,
    pub iterations: u64,
    #[serde(rename = "uniqueAddresses")]
    pub unique_addresses: usize,
    #[serde(rename = "corpusEntries")]
    pub corpus_entries: usize,
    #[serde(rename = "restoredTraces")]
    pub restored_traces: usize,
    #[serde(rename = "persistedTraces")]
    pub persisted_traces: usize,
    #[serde(rename = "lineCoverage", default, skip_serializing_if = "Option::is_none")]
    pub line_coverage: Option<LineCoverageReport>,
}

/// A program the verifier accepted but whose execution disagreed.
#[derive(Debug, Clone)]
struct Mismatch {
    program: CandidateProgram,
    message: String,
    verifier_log: String,
}

pub fn fuzz(config: &Config, executor: &mut dyn Executor, opt: &FuzzOptions) -> BpfuzzResult<RunResult> {
    let seed = opt.seed.unwrap_or_else(gen_seed);
    let run_id = Uuid::new_v4().to_string();
    let started_at = wall_time_iso_utc();
    let deadline = Deadline::new(opt.time);

    let artifacts_dir = config.runs_dir().join(&run_id);
    std::fs::create_dir_all(&artifacts_dir)?;
    let corpus_dir = opt.corpus_dir.clone().unwrap_or_else(|| config.default_corpus_dir());
    std::fs::create_dir_all(&corpus_dir)?;

    let mut strategy = opt.strategy.build(seed, &StrategySettings::from(config));
    let restored: Vec<_> = load_traces(&corpus_dir)?.into_iter().map(|(_, trace)| trace).collect();
    let restored_traces = restored.len();
    if restored_traces > 0 {
        info!(traces = restored_traces, dir = %corpus_dir.display(), "restored corpus");
        strategy.restore_traces(restored);
    }

    let worker = spawn_line_coverage(config);

    info!(run_id = %run_id, seed, strategy = strategy.name(), "fuzzing started");

    let max_runs = opt.runs.unwrap_or(u64::MAX);
    let mut stats = FuzzStats::default();
    let mut findings = Vec::new();
    let mut fatal = None;
    let mut persisted_traces = 0usize;

    while stats.iterations < max_runs && !deadline.expired() && !strategy.is_fuzzing_done() {
        stats.iterations += 1;
        let outcome = run_iteration(
            executor,
            &mut strategy,
            config.flake_max_attempts,
            &mut stats,
            worker.as_ref(),
        );

        let new_traces = strategy.take_new_traces();
        stats.kept += new_traces.len() as u64;
        if opt.persist_corpus {
            for trace in &new_traces {
                match persist_trace(&corpus_dir, trace) {
                    Ok(_) => persisted_traces += 1,
                    Err(err) => warn!("failed to persist corpus trace: {err}"),
                }
            }
        }

        match outcome {
            Ok(None) => {}
            Ok(Some(mismatch)) => {
                warn!(iteration = stats.iterations, "{}", mismatch.message);
                let index = findings.len();
                let path = export_finding(&artifacts_dir, index, &mismatch, seed, opt.record_to.as_deref())?;
                findings.push(Finding {
                    kind: FindingKind::MapCheck,
                    title: "verifier accepted out-of-bounds map access".to_string(),
                    message: mismatch.message,
                    program_path: Some(path.to_string_lossy().to_string()),
                });
            }
            Err(err) if err.is_iteration_scoped() => {
                stats.iteration_errors += 1;
                if matches!(err, BpfuzzError::ExecutionFlake { .. }) {
                    stats.flakes += 1;
                }
                warn!(iteration = stats.iterations, "iteration aborted: {err}");
            }
            Err(err @ BpfuzzError::Encoding(_)) => {
                error!(iteration = stats.iterations, "encoder defect: {err}");
                fatal = Some(err.to_string());
                break;
            }
            Err(err) => {
                if strategy.on_error(&err) {
                    stats.iteration_errors += 1;
                    continue;
                }
                error!(iteration = stats.iterations, "fuzzing stopped: {err}");
                fatal = Some(err.to_string());
                break;
            }
        }

        if stats.iterations % 1000 == 0 {
            let progress = strategy.progress();
            info!(
                iterations = stats.iterations,
                valid = stats.valid,
                queue = progress.queued,
                addresses = progress.unique_addresses,
                "progress"
            );
        }
    }

    strategy.teardown(executor);
    let line_coverage = worker.map(CoverageWorker::finish);

    let progress = strategy.progress();
    stats.corpus_entries = progress.queued;
    stats.unique_addresses = progress.unique_addresses;

    let status = if fatal.is_some() {
        ExitStatus::Error
    } else if findings.is_empty() {
        ExitStatus::Pass
    } else {
        ExitStatus::Fail
    };
    let report_path = artifacts_dir.join("report.json");
    let summary = RunSummary {
        status,
        mode: RunMode::Fuzz,
        identity: RunIdentity {
            run_id,
            seed,
            strategy: strategy.name().to_string(),
            report_path: Some(report_path.to_string_lossy().to_string()),
            artifacts_dir: Some(artifacts_dir.to_string_lossy().to_string()),
            corpus_dir: Some(corpus_dir.to_string_lossy().to_string()),
        },
        started_at,
        finished_at: wall_time_iso_utc(),
        duration_ms: deadline.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
        stats: Some(stats.clone()),
        findings,
        error: fatal,
    };

    std::fs::write(&report_path, serde_json::to_vec_pretty(&summary)?)?;
    write_run_manifest(&summary, &artifacts_dir)?;
    let coverage_stats = FuzzCoverageStats {
        strategy: strategy.name().to_string(),
        iterations: stats.iterations,
        unique_addresses: stats.unique_addresses,
        corpus_entries: stats.corpus_entries,
        restored_traces,
        persisted_traces,
        line_coverage,
    };
    std::fs::write(
        artifacts_dir.join("coverage.json"),
        serde_json::to_vec_pretty(&coverage_stats)?,
    )?;

    info!(status = ?summary.status, iterations = stats.iterations, "fuzzing finished");
    Ok(RunResult { summary })
}

fn spawn_line_coverage(config: &Config) -> Option<CoverageWorker> {
    if !config.coverage_enabled {
        return None;
    }
    let vmlinux = config.vmlinux_path.clone()?;
    match CoverageWorker::spawn(CoverageManager::new(Addr2Line::new(vmlinux))) {
        Ok(worker) => Some(worker),
        Err(err) => {
            warn!("line coverage disabled: {err}");
            None
        }
    }
}

fn run_iteration(
    executor: &mut dyn Executor,
    strategy: &mut AnyStrategy,
    flake_max_attempts: u32,
    stats: &mut FuzzStats,
    worker: Option<&CoverageWorker>,
) -> BpfuzzResult<Option<Mismatch>> {
    let program = strategy.generate_program(executor)?;
    let words = program.encode()?;
    let validation = submit(executor, &program, &words)?;
    if validation.is_valid {
        stats.valid += 1;
    } else {
        stats.rejected += 1;
        debug!(log = %last_line(&validation.verifier_log), "verifier rejected program");
    }
    if let Some(worker) = worker
        && validation.did_collect_coverage
        && !validation.coverage_addresses.is_empty()
        && !worker.submit(validation.coverage_addresses.clone())
    {
        warn!("line coverage worker has stopped");
    }

    let proceed = strategy.on_verify_done(executor, &validation);
    let Some(handle) = validation.program_handle else {
        return Ok(None);
    };
    let verdict = if proceed {
        let maps = strategy.execution_maps();
        execute_with_retry(executor, handle, &maps, flake_max_attempts).map(|result| {
            stats.executed += 1;
            strategy.on_execute_done(executor, &result)
        })
    } else {
        Ok(ExecutionVerdict::Expected)
    };
    close_program(executor, handle);

    match verdict? {
        ExecutionVerdict::Expected => Ok(None),
        ExecutionVerdict::Mismatch(message) => Ok(Some(Mismatch {
            program,
            message,
            verifier_log: validation.verifier_log,
        })),
    }
}

/// Run `program` until the executor reports it triggered, at most
/// `max_attempts` times.
pub fn execute_with_retry(
    executor: &mut dyn Executor,
    program: ProgramHandle,
    maps: &[MapHandle],
    max_attempts: u32,
) -> BpfuzzResult<ExecutionResult> {
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let result = executor.execute(program, maps)?;
        if result.succeeded {
            if attempt > 1 {
                debug!(attempt, "execution succeeded after retries");
            }
            return Ok(result);
        }
    }
    Err(BpfuzzError::ExecutionFlake { attempts })
}

fn close_program(executor: &mut dyn Executor, handle: ProgramHandle) {
    if let Err(err) = executor.close_program(handle) {
        warn!("failed to unload program {}: {err}", handle.0);
    }
}

fn last_line(log: &str) -> &str {
    log.lines().last().unwrap_or_default()
}

fn export_finding(
    artifacts_dir: &Path,
    index: usize,
    mismatch: &Mismatch,
    seed: u64,
    record_to: Option<&Path>,
) -> BpfuzzResult<PathBuf> {
    let dir = artifacts_dir.join(format!("finding-{index}"));
    std::fs::create_dir_all(&dir)?;

    let artifact = ProgramArtifact::new(mismatch.program.clone(), Some(seed))?.with_note(mismatch.message.clone());
    let program_path = dir.join("program.json");
    artifact.write_json(&program_path)?;
    write_words_bin(&dir.join("program.bin"), &artifact.words()?)?;
    std::fs::write(dir.join("verifier.log"), &mismatch.verifier_log)?;

    if index == 0
        && let Some(record) = record_to
    {
        artifact.write_json(record)?;
        info!(path = %record.display(), "recorded finding");
    }
    info!(path = %program_path.display(), "exported finding");
    Ok(program_path)
}

#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub summary: RunSummary,
    pub validation: ValidationResult,
    pub execution: Option<ExecutionResult>,
}

/// Re-submit an exported program to `executor`.
///
/// The recorded bytecode must match a fresh encoding of the recorded
/// instructions. Map references are rebound to newly created maps, and a
/// program that uses maps is held to the map check on execution.
pub fn replay(config: &Config, executor: &mut dyn Executor, artifact_path: &Path) -> BpfuzzResult<ReplayResult> {
    let artifact = ProgramArtifact::read_json(artifact_path)?;
    artifact.verify_encoding()?;

    let run_id = Uuid::new_v4().to_string();
    let started_at = wall_time_iso_utc();
    let deadline = Deadline::new(None);

    let (program, maps) = rebind_maps(executor, artifact.program.clone())?;
    let outcome = replay_program(executor, &program, &maps, config.flake_max_attempts);
    for map in &maps {
        if let Err(err) = executor.close_map(*map) {
            warn!("failed to close map {}: {err}", map.0);
        }
    }
    let (validation, execution) = outcome?;

    let mut findings = Vec::new();
    if !maps.is_empty()
        && let Some(result) = &execution
    {
        let element = result.map_elements.first().and_then(|m| m.first()).copied();
        if element != Some(MAP_CHECK_VALUE) {
            findings.push(Finding {
                kind: FindingKind::MapCheck,
                title: "verifier accepted out-of-bounds map access".to_string(),
                message: format!(
                    "map element 0 is {:#x}, expected {MAP_CHECK_VALUE:#x}",
                    element.unwrap_or(0)
                ),
                program_path: Some(artifact_path.to_string_lossy().to_string()),
            });
        }
    }
    if !validation.is_valid {
        info!(log = %last_line(&validation.verifier_log), "replayed program was rejected");
    }

    let artifacts_dir = config.runs_dir().join(&run_id);
    std::fs::create_dir_all(&artifacts_dir)?;
    let report_path = artifacts_dir.join("report.json");
    let summary = RunSummary {
        status: if findings.is_empty() {
            ExitStatus::Pass
        } else {
            ExitStatus::Fail
        },
        mode: RunMode::Replay,
        identity: RunIdentity {
            run_id,
            seed: artifact.seed.unwrap_or_default(),
            strategy: "replay".to_string(),
            report_path: Some(report_path.to_string_lossy().to_string()),
            artifacts_dir: Some(artifacts_dir.to_string_lossy().to_string()),
            corpus_dir: None,
        },
        started_at,
        finished_at: wall_time_iso_utc(),
        duration_ms: deadline.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
        stats: None,
        findings,
        error: None,
    };
    std::fs::write(&report_path, serde_json::to_vec_pretty(&summary)?)?;
    write_run_manifest(&summary, &artifacts_dir)?;
    std::fs::write(artifacts_dir.join("verifier.log"), &validation.verifier_log)?;

    Ok(ReplayResult {
        summary,
        validation,
        execution,
    })
}

fn replay_program(
    executor: &mut dyn Executor,
    program: &CandidateProgram,
    maps: &[MapHandle],
    flake_max_attempts: u32,
) -> BpfuzzResult<(ValidationResult, Option<ExecutionResult>)> {
    let validation = submit(executor, program, &program.encode()?)?;
    let Some(handle) = validation.program_handle else {
        return Ok((validation, None));
    };
    let execution = execute_with_retry(executor, handle, maps, flake_max_attempts);
    close_program(executor, handle);
    Ok((validation, Some(execution?)))
}

/// Load `words` the way `program` asks for: with its BTF and func_info when
/// it has more than one function.
fn submit(executor: &mut dyn Executor, program: &CandidateProgram, words: &[u64]) -> BpfuzzResult<ValidationResult> {
    let validation = match program {
        CandidateProgram::Functions(f) => executor.validate_functions(words, f.btf(), f.func_info())?,
        other => executor.validate(other.dialect(), words)?,
    };
    Ok(validation)
}

/// Point every map-fd load at a fresh single-element map. Loads that named
/// the same fd share a map.
fn rebind_maps(
    executor: &mut dyn Executor,
    program: CandidateProgram,
) -> BpfuzzResult<(CandidateProgram, Vec<MapHandle>)> {
    let (mut instructions, functions) = match program {
        CandidateProgram::Extended(program) => (program.into_instructions(), None),
        CandidateProgram::Functions(f) => (f.program().clone().into_instructions(), Some(f)),
        classic @ CandidateProgram::Classic(_) => return Ok((classic, Vec::new())),
    };
    let mut rebound: HashMap<i32, MapHandle> = HashMap::new();
    let mut maps = Vec::new();
    for ins in instructions.iter_mut() {
        if !ins.is_wide_load() || ins.src != ebpf::PSEUDO_MAP_FD {
            continue;
        }
        let map = match rebound.get(&ins.imm) {
            Some(map) => *map,
            None => {
                let map = executor.create_map(1)?;
                rebound.insert(ins.imm, map);
                maps.push(map);
                map
            }
        };
        ins.imm = map.fd();
    }
    let program = Program::new(instructions)?;
    let rebound = match functions {
        Some(f) => CandidateProgram::Functions(f.with_program(program)?),
        None => CandidateProgram::Extended(program),
    };
    Ok((rebound, maps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelVerifier;

    fn temp_config(tag: &str) -> Config {
        Config {
            base_dir: std::env::temp_dir().join(format!("bpfuzz-{tag}-{}", Uuid::new_v4())),
            ..Config::default()
        }
    }

    #[test]
    fn retry_gives_up_with_a_flake() {
        let mut executor = ModelVerifier::new().with_failing_runs(5);
        let program = Program::new(vec![
            ebpf::Instruction::mov64(ebpf::Register::R0, 0),
            ebpf::Instruction::exit(),
        ])
        .expect("program");
        let words = program.encode().expect("encode");
        let result = executor
            .validate(crate::Dialect::Extended, &words)
            .expect("validate");
        let handle = result.program_handle.expect("accepted");

        let err = execute_with_retry(&mut executor, handle, &[], 3).expect_err("flake");
        assert!(matches!(err, BpfuzzError::ExecutionFlake { attempts: 3 }));
        // Two failing runs left, so the third attempt succeeds.
        let ok = execute_with_retry(&mut executor, handle, &[], 3).expect("retry");
        assert!(ok.succeeded);
    }

    #[test]
    fn maps_are_rebound_consistently() {
        let mut executor = ModelVerifier::new();
        let instructions = vec![
            ebpf::Instruction::ld_map_fd(ebpf::Register::R1, 40),
            ebpf::Instruction::ld_map_fd(ebpf::Register::R2, 41),
            ebpf::Instruction::ld_map_fd(ebpf::Register::R3, 40),
            ebpf::Instruction::mov64(ebpf::Register::R0, 0),
            ebpf::Instruction::exit(),
        ];
        let program = CandidateProgram::Extended(Program::new(instructions).expect("program"));
        let (rebound, maps) = rebind_maps(&mut executor, program).expect("rebind");
        assert_eq!(maps.len(), 2);
        let CandidateProgram::Extended(rebound) = rebound else {
            panic!("dialect changed");
        };
        let ins = rebound.instructions();
        assert_eq!(ins[0].imm, maps[0].fd());
        assert_eq!(ins[1].imm, maps[1].fd());
        assert_eq!(ins[2].imm, maps[0].fd());
    }

    #[test]
    fn function_programs_keep_their_layout_when_rebound() {
        use crate::btf::{FuncInfo, LoopCallbackTypes};
        use ebpf::{Instruction, Register::*};

        let mut executor = ModelVerifier::new();
        let types = LoopCallbackTypes::new();
        let instructions = vec![
            Instruction::ld_map_fd(R6, 40),
            Instruction::mov64(R3, R10),
            Instruction::mov64(R1, 1),
            Instruction::mov64(R4, 0),
            Instruction::ld_func(R2, 4),
            Instruction::call(ebpf::HELPER_LOOP),
            Instruction::mov64(R0, 0),
            Instruction::exit(),
            Instruction::mov64(R0, 0),
            Instruction::exit(),
        ];
        let func_info = vec![
            FuncInfo {
                insn_off: 0,
                type_id: types.main,
            },
            FuncInfo {
                insn_off: 10,
                type_id: types.callback,
            },
        ];
        let functions = crate::FunctionProgram::new(
            Program::new(instructions).expect("program"),
            types.btf.encode(),
            func_info.clone(),
        )
        .expect("function program");

        let (rebound, maps) =
            rebind_maps(&mut executor, CandidateProgram::Functions(functions)).expect("rebind");
        assert_eq!(maps.len(), 1);
        let CandidateProgram::Functions(rebound) = &rebound else {
            panic!("function layout dropped");
        };
        assert_eq!(rebound.program().instructions()[0].imm, maps[0].fd());
        assert_eq!(rebound.func_info(), func_info.as_slice());

        let candidate = CandidateProgram::Functions(rebound.clone());
        let (validation, execution) = replay_program(&mut executor, &candidate, &maps, 1).expect("replay");
        assert!(validation.is_valid, "{}", validation.verifier_log);
        assert!(validation.coverage_addresses.contains(&crate::stable_edge("btf:func_info")));
        assert!(execution.expect("executed").succeeded);
    }

    #[test]
    fn playground_run_writes_reports() {
        let config = temp_config("playground");
        let mut executor = ModelVerifier::new();
        let mut opt = FuzzOptions::new(StrategyKind::Playground);
        opt.seed = Some(1);
        let result = fuzz(&config, &mut executor, &opt).expect("fuzz");
        let summary = result.summary;
        assert_eq!(summary.status, ExitStatus::Pass);
        let stats = summary.stats.expect("stats");
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.executed, 1);

        let artifacts = PathBuf::from(summary.identity.artifacts_dir.expect("artifacts"));
        assert!(artifacts.join("report.json").exists());
        assert!(artifacts.join("manifest.json").exists());
        assert!(artifacts.join("coverage.json").exists());
        let _ = std::fs::remove_dir_all(&config.base_dir);
    }

    #[test]
    fn run_budget_bounds_the_loop() {
        let config = temp_config("budget");
        let mut executor = ModelVerifier::new();
        let mut opt = FuzzOptions::new(StrategyKind::CbpfRandomInstruction);
        opt.seed = Some(2);
        opt.runs = Some(25);
        let summary = fuzz(&config, &mut executor, &opt).expect("fuzz").summary;
        let stats = summary.stats.expect("stats");
        assert_eq!(stats.iterations, 25);
        assert_eq!(stats.valid + stats.rejected, 25);
        assert_eq!(stats.executed, stats.valid);
        assert_eq!(executor.loaded_programs(), 0);
        let _ = std::fs::remove_dir_all(&config.base_dir);
    }
}
