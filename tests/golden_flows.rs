use std::path::{Path, PathBuf};

use bpfuzz::{
    Config, CorpusCommand, ExitStatus, FindingKind, FuzzOptions, ModelVerifier, ProgramArtifact, Reporter,
    StrategyKind, corpus_command, fuzz, is_trace_file, read_words_bin, replay,
};

fn temp_workspace(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("bpfuzz-golden-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp workspace");
    root
}

fn config_in(ws: &Path) -> Config {
    Config {
        base_dir: ws.join(".bpfuzz"),
        reporter: Reporter::Json,
        ..Config::default()
    }
}

fn coverage_options(seed: u64, runs: u64, corpus: &Path) -> FuzzOptions {
    let mut opt = FuzzOptions::new(StrategyKind::Coverage);
    opt.seed = Some(seed);
    opt.runs = Some(runs);
    opt.corpus_dir = Some(corpus.to_path_buf());
    opt
}

fn trace_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .expect("read corpus dir")
        .filter_map(Result::ok)
        .filter(|e| is_trace_file(&e.path()))
        .count()
}

#[test]
fn golden_planted_bug_is_found_exported_and_replayed() {
    let ws = temp_workspace("planted");
    let cfg = config_in(&ws);
    let record = ws.join("finding.json");

    let mut executor = ModelVerifier::new().with_unchecked_map_stores();
    let mut opt = coverage_options(7, 2000, &ws.join("corpus"));
    opt.record_to = Some(record.clone());
    let run = fuzz(&cfg, &mut executor, &opt).expect("fuzz");
    let summary = run.summary;

    assert_eq!(summary.status, ExitStatus::Fail, "{}", summary.pretty());
    assert_eq!(summary.findings.len(), 1);
    let finding = &summary.findings[0];
    assert_eq!(finding.kind, FindingKind::MapCheck);
    assert!(finding.message.contains("0xcafe"), "{}", finding.message);
    let stats = summary.stats.as_ref().expect("stats");
    assert!(stats.iterations < 2000, "run must stop on the finding");
    assert!(stats.executed >= 1);
    assert_eq!(executor.loaded_programs(), 0);
    assert_eq!(executor.open_maps(), 0);

    let program_path = PathBuf::from(finding.program_path.as_ref().expect("program path"));
    let artifact = ProgramArtifact::read_json(&program_path).expect("read artifact");
    let words = artifact.verify_encoding().expect("bytecode matches");
    let bin = read_words_bin(&program_path.with_file_name("program.bin")).expect("bin export");
    assert_eq!(bin, words);
    assert_eq!(ProgramArtifact::read_json(&record).expect("recorded copy"), artifact);

    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(summary.identity.report_path.as_ref().expect("report")).expect("read"))
            .expect("report json");
    assert_eq!(report["status"], "fail");

    // The same build of the verifier still accepts it and the check still fails.
    let mut buggy = ModelVerifier::new().with_unchecked_map_stores();
    let replayed = replay(&cfg, &mut buggy, &program_path).expect("replay");
    assert!(replayed.validation.is_valid);
    assert_eq!(replayed.summary.status, ExitStatus::Fail);
    assert_eq!(buggy.open_maps(), 0);

    // A sound verifier refuses the program outright.
    let mut sound = ModelVerifier::new();
    let replayed = replay(&cfg, &mut sound, &program_path).expect("replay");
    assert!(!replayed.validation.is_valid, "{}", replayed.validation.verifier_log);
    assert!(replayed.execution.is_none());
    assert_eq!(replayed.summary.status, ExitStatus::Pass);

    let _ = std::fs::remove_dir_all(&ws);
}

#[test]
fn golden_sound_verifier_yields_no_findings() {
    let ws = temp_workspace("sound");
    let cfg = config_in(&ws);
    let mut executor = ModelVerifier::new();
    let run = fuzz(&cfg, &mut executor, &coverage_options(11, 300, &ws.join("corpus"))).expect("fuzz");

    assert_eq!(run.summary.status, ExitStatus::Pass, "{}", run.summary.pretty());
    let stats = run.summary.stats.expect("stats");
    assert_eq!(stats.iterations, 300);
    assert_eq!(stats.valid + stats.rejected, 300);
    assert!(stats.executed <= stats.kept);
    let _ = std::fs::remove_dir_all(&ws);
}

#[test]
fn golden_flaky_executions_abort_only_their_iteration() {
    let ws = temp_workspace("flake");
    let mut cfg = config_in(&ws);
    cfg.flake_max_attempts = 3;

    let mut executor = ModelVerifier::new().with_unchecked_map_stores().with_failing_runs(9);
    let run = fuzz(&cfg, &mut executor, &coverage_options(7, 2000, &ws.join("corpus"))).expect("fuzz");

    let stats = run.summary.stats.as_ref().expect("stats");
    assert!(stats.flakes >= 3, "{}", run.summary.pretty());
    assert!(stats.iteration_errors >= stats.flakes);
    assert_eq!(run.summary.status, ExitStatus::Fail, "{}", run.summary.pretty());
    assert!(run.summary.error.is_none());
    let _ = std::fs::remove_dir_all(&ws);
}

#[test]
fn golden_corpus_persists_and_reloads() {
    let ws = temp_workspace("corpus");
    let cfg = config_in(&ws);
    let corpus = ws.join("corpus");

    let mut executor = ModelVerifier::new().with_unchecked_map_stores();
    let first = fuzz(&cfg, &mut executor, &coverage_options(3, 2000, &corpus)).expect("first run");
    let kept = first.summary.stats.as_ref().expect("stats").kept;
    let persisted = trace_files(&corpus);
    assert!(persisted >= 1);
    assert!(persisted as u64 <= kept);

    let listed = corpus_command(&cfg, &CorpusCommand::List { dir: Some(corpus.clone()) }).expect("list");
    assert_eq!(listed.as_array().expect("array").len(), persisted);

    let mut executor = ModelVerifier::new();
    let second = fuzz(&cfg, &mut executor, &coverage_options(4, 20, &corpus)).expect("second run");
    let artifacts = PathBuf::from(second.summary.identity.artifacts_dir.as_ref().expect("artifacts"));
    let coverage: serde_json::Value =
        serde_json::from_slice(&std::fs::read(artifacts.join("coverage.json")).expect("read")).expect("json");
    assert_eq!(coverage["restoredTraces"], persisted as u64);

    let _ = std::fs::remove_dir_all(&ws);
}

#[test]
fn golden_classic_random_programs_run_to_budget() {
    let ws = temp_workspace("cbpf");
    let cfg = config_in(&ws);
    let mut executor = ModelVerifier::new();
    let mut opt = FuzzOptions::new(StrategyKind::CbpfRandomInstruction);
    opt.seed = Some(5);
    opt.runs = Some(50);
    opt.corpus_dir = Some(ws.join("corpus"));

    let run = fuzz(&cfg, &mut executor, &opt).expect("fuzz");
    assert_eq!(run.summary.status, ExitStatus::Pass);
    let stats = run.summary.stats.expect("stats");
    assert_eq!(stats.iterations, 50);
    assert_eq!(stats.valid + stats.rejected, 50);
    assert_eq!(stats.executed, stats.valid);
    assert_eq!(executor.loaded_programs(), 0);
    assert_eq!(trace_files(&ws.join("corpus")), 0);
    let _ = std::fs::remove_dir_all(&ws);
}

#[test]
fn golden_loop_callback_bug_is_found_and_replayed() {
    let ws = temp_workspace("loop");
    let cfg = config_in(&ws);

    let mut executor = ModelVerifier::new().with_stale_callback_stack().with_complexity_limit(5_000);
    let mut opt = FuzzOptions::new(StrategyKind::LoopPointerArithmetic);
    opt.seed = Some(21);
    opt.runs = Some(4000);
    opt.corpus_dir = Some(ws.join("corpus"));
    let run = fuzz(&cfg, &mut executor, &opt).expect("fuzz");
    let summary = run.summary;

    assert_eq!(summary.status, ExitStatus::Fail, "{}", summary.pretty());
    assert_eq!(summary.findings.len(), 1);
    let finding = &summary.findings[0];
    assert_eq!(finding.kind, FindingKind::MapCheck);
    let stats = summary.stats.as_ref().expect("stats");
    assert!(stats.iterations < 4000, "run must stop on the finding");
    assert!(stats.executed >= 1 && stats.executed <= stats.valid);
    assert_eq!(executor.loaded_programs(), 0);
    assert_eq!(executor.open_maps(), 0);

    let program_path = PathBuf::from(finding.program_path.as_ref().expect("program path"));
    let artifact = ProgramArtifact::read_json(&program_path).expect("read artifact");
    artifact.verify_encoding().expect("bytecode matches");
    assert!(matches!(artifact.program, bpfuzz::CandidateProgram::Functions(_)));

    let mut buggy = ModelVerifier::new().with_stale_callback_stack();
    let replayed = replay(&cfg, &mut buggy, &program_path).expect("replay");
    assert!(replayed.validation.is_valid, "{}", replayed.validation.verifier_log);
    assert_eq!(replayed.summary.status, ExitStatus::Fail);

    // Tracking the callback's writes is enough to refuse it.
    let mut sound = ModelVerifier::new();
    let replayed = replay(&cfg, &mut sound, &program_path).expect("replay");
    assert!(!replayed.validation.is_valid);
    assert_eq!(replayed.summary.status, ExitStatus::Pass);

    let _ = std::fs::remove_dir_all(&ws);
}
