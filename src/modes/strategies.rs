//! Fuzzing strategies and the registry that selects them by name.
//!
//! A strategy owns everything that varies between fuzzing approaches: how
//! candidates are produced, which verifier outcomes are worth executing and
//! what a correct execution looks like. The loop in [`crate::fuzz()`] drives
//! any of them through the [`Strategy`] trait.

use tracing::{debug, info, warn};

use std::str::FromStr;

use crate::btf::{FuncInfo, LoopCallbackTypes};
use crate::classic;
use crate::ebpf::{Instruction, Register};
use crate::generator::{
    classic_gen, random_alu_instruction, random_immediate, random_jmp_instruction, random_register,
};
use crate::{
    BpfuzzError, BpfuzzResult, CandidateProgram, ClassicProgram, CoverageEngine, CoverageTrace, Dialect, ExecutionResult,
    Executor, FunctionProgram, MapHandle, Program, ProgramTree, RandomSource, SeededRandom, ValidationResult, Verdict,
};

/// Value the map check footer stores through the adjusted map pointer.
pub const MAP_CHECK_VALUE: u64 = 0xCAFE;

/// Instructions appended to every coverage-guided candidate.
pub const FOOTER_LEN: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionVerdict {
    Expected,
    /// Execution contradicted what the verifier accepted.
    Mismatch(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusProgress {
    pub queued: usize,
    pub unique_addresses: usize,
}

pub trait Strategy {
    fn name(&self) -> &'static str;

    fn generate_program(&mut self, executor: &mut dyn Executor) -> BpfuzzResult<CandidateProgram>;

    /// Returns true when the verified program should be executed.
    fn on_verify_done(&mut self, executor: &mut dyn Executor, result: &ValidationResult) -> bool;

    /// Maps snapshotted into [`ExecutionResult::map_elements`], in order.
    fn execution_maps(&self) -> Vec<MapHandle> {
        Vec::new()
    }

    fn on_execute_done(&mut self, executor: &mut dyn Executor, result: &ExecutionResult) -> ExecutionVerdict;

    /// Returns true to keep fuzzing after `err`.
    fn on_error(&mut self, err: &BpfuzzError) -> bool;

    fn is_fuzzing_done(&self) -> bool;

    /// Traces accepted since the last call.
    fn take_new_traces(&mut self) -> Vec<CoverageTrace> {
        Vec::new()
    }

    /// Seed the strategy with traces from an earlier run.
    fn restore_traces(&mut self, traces: Vec<CoverageTrace>) {
        let _ = traces;
    }

    fn progress(&self) -> CorpusProgress {
        CorpusProgress::default()
    }

    /// Release executor resources still held at the end of a run.
    fn teardown(&mut self, executor: &mut dyn Executor) {
        let _ = executor;
    }
}

/// Looks up a fresh element of `map` and stores [`MAP_CHECK_VALUE`] at the
/// lookup result plus whatever `random_reg` held.
///
/// The verifier must only accept this when `random_reg` is provably zero at
/// that point; any other offset lands the store outside element 0.
pub fn map_check_footer(random_reg: Register, map_fd: i32) -> Vec<Instruction> {
    use Register::*;

    vec![
        Instruction::mov64(R8, random_reg),
        Instruction::ld_map_fd(R9, map_fd),
        Instruction::st_w(R10, 0, -4),
        Instruction::mov64(R2, R10),
        Instruction::add64(R2, -4),
        Instruction::mov64(R1, R9),
        Instruction::call(crate::ebpf::HELPER_MAP_LOOKUP),
        Instruction::jmp_ne(R0, 0, 1),
        Instruction::exit(),
        Instruction::add64(R0, R8),
        Instruction::st_dw(R0, MAP_CHECK_VALUE as i32, 0),
        Instruction::mov64(R0, 0),
        Instruction::exit(),
    ]
}

/// Element 0 of the check map must hold [`MAP_CHECK_VALUE`] after a run of
/// a program ending in [`map_check_footer`].
fn check_map_marker(executor: &dyn Executor, map: Option<MapHandle>, result: &ExecutionResult) -> ExecutionVerdict {
    let element = match result.map_elements.first() {
        Some(elements) => elements.first().copied(),
        None => map
            .and_then(|map| executor.map_elements(map).ok())
            .and_then(|elements| elements.first().copied()),
    };
    match element {
        Some(MAP_CHECK_VALUE) => ExecutionVerdict::Expected,
        other => ExecutionVerdict::Mismatch(format!(
            "map element 0 is {:#x}, expected {MAP_CHECK_VALUE:#x}",
            other.unwrap_or(0)
        )),
    }
}

/// Coverage-guided mutation with the map pointer arithmetic check.
#[derive(Debug)]
pub struct CoverageBased<R> {
    engine: CoverageEngine<R>,
    map: Option<MapHandle>,
    finished: bool,
    program_count: u64,
    valid_count: u64,
    new_traces: Vec<CoverageTrace>,
}

impl<R: RandomSource> CoverageBased<R> {
    pub fn new(engine: CoverageEngine<R>) -> Self {
        Self {
            engine,
            map: None,
            finished: false,
            program_count: 0,
            valid_count: 0,
            new_traces: Vec::new(),
        }
    }

    pub fn engine(&self) -> &CoverageEngine<R> {
        &self.engine
    }

    pub fn map(&self) -> Option<MapHandle> {
        self.map
    }
}

impl<R: RandomSource> Strategy for CoverageBased<R> {
    fn name(&self) -> &'static str {
        StrategyKind::Coverage.name()
    }

    fn generate_program(&mut self, executor: &mut dyn Executor) -> BpfuzzResult<CandidateProgram> {
        self.program_count += 1;
        debug!(
            programs = self.program_count,
            valid = self.valid_count,
            queue = self.engine.queue().len(),
            "generating program"
        );

        let mut instructions = self.engine.next_candidate()?;

        if let Some(old) = self.map.take()
            && let Err(err) = executor.close_map(old)
        {
            warn!("failed to close check map {}: {err}", old.0);
        }
        let map = executor.create_map(1)?;
        self.map = Some(map);

        if let Some(first) = instructions.first_mut() {
            first.imm = map.fd();
        }
        let reg = random_register(self.engine.rng_mut());
        let footer = ProgramTree::build(&map_check_footer(reg, map.fd()))?;
        instructions.extend(footer.linearize());
        Ok(CandidateProgram::Extended(Program::new(instructions)?))
    }

    fn on_verify_done(&mut self, _executor: &mut dyn Executor, result: &ValidationResult) -> bool {
        if result.is_valid {
            self.valid_count += 1;
        }
        let verdict = self.engine.on_feedback(result);
        if let Some(trace) = self.engine.take_last_kept() {
            self.new_traces.push(trace);
        }
        self.engine.finish_iteration();
        verdict == Verdict::Keep
    }

    fn execution_maps(&self) -> Vec<MapHandle> {
        self.map.into_iter().collect()
    }

    fn on_execute_done(&mut self, executor: &mut dyn Executor, result: &ExecutionResult) -> ExecutionVerdict {
        let verdict = check_map_marker(executor, self.map, result);
        self.finished |= verdict != ExecutionVerdict::Expected;
        verdict
    }

    fn on_error(&mut self, err: &BpfuzzError) -> bool {
        warn!("coverage strategy error: {err}");
        false
    }

    fn is_fuzzing_done(&self) -> bool {
        self.finished
    }

    fn take_new_traces(&mut self) -> Vec<CoverageTrace> {
        std::mem::take(&mut self.new_traces)
    }

    fn restore_traces(&mut self, traces: Vec<CoverageTrace>) {
        for trace in traces {
            self.engine.restore(trace);
        }
    }

    fn progress(&self) -> CorpusProgress {
        CorpusProgress {
            queued: self.engine.queue().len(),
            unique_addresses: self.engine.seen_address_count(),
        }
    }

    fn teardown(&mut self, executor: &mut dyn Executor) {
        if let Some(map) = self.map.take()
            && let Err(err) = executor.close_map(map)
        {
            warn!("failed to close check map {}: {err}", map.0);
        }
    }
}

/// Submits `r0 = 0; exit` once and prints the verifier log.
#[derive(Debug, Default)]
pub struct Playground {
    finished: bool,
}

impl Strategy for Playground {
    fn name(&self) -> &'static str {
        StrategyKind::Playground.name()
    }

    fn generate_program(&mut self, _executor: &mut dyn Executor) -> BpfuzzResult<CandidateProgram> {
        let program = Program::new(vec![Instruction::mov64(Register::R0, 0), Instruction::exit()])?;
        Ok(CandidateProgram::Extended(program))
    }

    fn on_verify_done(&mut self, _executor: &mut dyn Executor, result: &ValidationResult) -> bool {
        info!(valid = result.is_valid, "verifier log:\n{}", result.verifier_log);
        self.finished = true;
        true
    }

    fn on_execute_done(&mut self, _executor: &mut dyn Executor, _result: &ExecutionResult) -> ExecutionVerdict {
        ExecutionVerdict::Expected
    }

    fn on_error(&mut self, err: &BpfuzzError) -> bool {
        warn!("playground error: {err}");
        false
    }

    fn is_fuzzing_done(&self) -> bool {
        self.finished
    }
}

/// Classic counterpart of [`Playground`].
#[derive(Debug, Default)]
pub struct CbpfPlayground {
    finished: bool,
}

impl Strategy for CbpfPlayground {
    fn name(&self) -> &'static str {
        StrategyKind::CbpfPlayground.name()
    }

    fn generate_program(&mut self, _executor: &mut dyn Executor) -> BpfuzzResult<CandidateProgram> {
        let program = ClassicProgram::new(vec![classic::Instruction::add(1u32), classic::Instruction::ret(0u32)])?;
        Ok(CandidateProgram::Classic(program))
    }

    fn on_verify_done(&mut self, _executor: &mut dyn Executor, result: &ValidationResult) -> bool {
        info!(
            valid = result.is_valid,
            coverage = result.coverage_addresses.len(),
            "verifier log:\n{}",
            result.verifier_log
        );
        self.finished = true;
        true
    }

    fn on_execute_done(&mut self, _executor: &mut dyn Executor, result: &ExecutionResult) -> ExecutionVerdict {
        info!(succeeded = result.succeeded, "classic program executed");
        ExecutionVerdict::Expected
    }

    fn on_error(&mut self, err: &BpfuzzError) -> bool {
        warn!("cbpf playground error: {err}");
        false
    }

    fn is_fuzzing_done(&self) -> bool {
        self.finished
    }
}

/// Random classic programs of up to a thousand instructions; accepted ones
/// are executed once.
#[derive(Debug)]
pub struct CbpfRandomInstruction<R> {
    rng: R,
    program_count: u64,
    valid_count: u64,
}

impl<R: RandomSource> CbpfRandomInstruction<R> {
    pub const MAX_BODY_LEN: u64 = 1000;

    pub fn new(rng: R) -> Self {
        Self {
            rng,
            program_count: 0,
            valid_count: 0,
        }
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.program_count, self.valid_count)
    }

    fn random_body(&mut self) -> Vec<classic::Instruction> {
        let mut count = self.rng.rand_int() % Self::MAX_BODY_LEN;
        let mut body = vec![classic::Instruction::add(1u32), classic::Instruction::misc(classic::Register::A)];
        while count > 0 {
            // `count` is now the number of body instructions after this one.
            count -= 1;
            let ins = match self.rng.rand_int() % 4 {
                0 => classic_gen::random_store_instruction(&mut self.rng),
                1 => classic_gen::random_load_instruction(&mut self.rng),
                2 if count > 0 => classic_gen::random_jmp_instruction(&mut self.rng, count),
                _ => classic_gen::random_alu_instruction(&mut self.rng),
            };
            body.push(ins);
        }
        body.push(classic::Instruction::ret(4u32));
        body
    }
}

impl<R: RandomSource> Strategy for CbpfRandomInstruction<R> {
    fn name(&self) -> &'static str {
        StrategyKind::CbpfRandomInstruction.name()
    }

    fn generate_program(&mut self, _executor: &mut dyn Executor) -> BpfuzzResult<CandidateProgram> {
        self.program_count += 1;
        debug!(programs = self.program_count, valid = self.valid_count, "generating classic program");
        let program = ClassicProgram::new(self.random_body())?;
        Ok(CandidateProgram::Classic(program))
    }

    fn on_verify_done(&mut self, _executor: &mut dyn Executor, result: &ValidationResult) -> bool {
        if result.is_valid {
            self.valid_count += 1;
        }
        true
    }

    fn on_execute_done(&mut self, _executor: &mut dyn Executor, _result: &ExecutionResult) -> ExecutionVerdict {
        ExecutionVerdict::Expected
    }

    fn on_error(&mut self, err: &BpfuzzError) -> bool {
        warn!("cbpf strategy error: {err}");
        false
    }

    fn is_fuzzing_done(&self) -> bool {
        false
    }
}

/// A `bpf_loop` callback scribbles bytes into its caller's stack through the
/// context pointer; the caller then uses one of those stack slots as the map
/// check offset.
///
/// A verifier that loses track of what the callback wrote accepts a nonzero
/// offset, and the footer's store misses element 0.
#[derive(Debug)]
pub struct LoopPointerArithmetic<R> {
    rng: R,
    map: Option<MapHandle>,
    finished: bool,
    program_count: u64,
    valid_count: u64,
}

impl<R: RandomSource> LoopPointerArithmetic<R> {
    pub const MAX_CALLBACK_LEN: u64 = 1000;
    pub const ITERATIONS: i32 = 10;
    /// Caller stack offset handed to the callback as its context.
    pub const CTX_OFFSET: i16 = -8;
    /// Caller stack slot read back as the map check offset.
    pub const CHECKED_SLOT: i16 = -12;
    const LD_FUNC_INDEX: usize = 5;

    pub fn new(rng: R) -> Self {
        Self {
            rng,
            map: None,
            finished: false,
            program_count: 0,
            valid_count: 0,
        }
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.program_count, self.valid_count)
    }

    pub fn map(&self) -> Option<MapHandle> {
        self.map
    }

    /// Zero the checked slot, loop over the callback, then run the map check
    /// with whatever the slot holds afterwards.
    fn main_function(map_fd: i32) -> Vec<Instruction> {
        use Register::*;

        let mut main = vec![
            Instruction::st_w(R10, 0, Self::CHECKED_SLOT),
            Instruction::mov64(R3, R10),
            Instruction::add64(R3, i32::from(Self::CTX_OFFSET)),
            Instruction::mov64(R1, Self::ITERATIONS),
            Instruction::mov64(R4, 0),
            Instruction::ld_func(R2, 0),
            Instruction::call(crate::ebpf::HELPER_LOOP),
            Instruction::ld_w(R7, R10, Self::CHECKED_SLOT),
        ];
        main.extend(map_check_footer(R7, map_fd));

        let words: usize = main.iter().map(Instruction::word_len).sum();
        let load_word: usize = main[..Self::LD_FUNC_INDEX].iter().map(Instruction::word_len).sum();
        // The callback starts right after main.
        main[Self::LD_FUNC_INDEX].imm = (words - load_word - 1) as i32;
        main
    }

    /// Random ALU and forward jumps, interleaved with byte stores into the
    /// caller's stack at `ctx - (reg & 0x3f)`.
    fn callback_function(&mut self) -> Vec<Instruction> {
        use Register::*;

        let mut body = vec![Instruction::st_dw(R10, R2, -8)];
        for reg in [R0, R2, R3, R4, R5, R6, R7, R8, R9] {
            body.push(Instruction::mov64(reg, random_immediate(&mut self.rng)));
        }
        let mut count = self.rng.rand_int() % Self::MAX_CALLBACK_LEN;
        while count > 0 {
            // Every remaining iteration appends at least one instruction, so
            // a jump of up to `count` lands at or before `r0 = 0`.
            count -= 1;
            if self.rng.rand_int() % 4 == 0 {
                let reg = loop {
                    let reg = random_register(&mut self.rng);
                    if !matches!(reg, R1 | R2) {
                        break reg;
                    }
                };
                body.extend([
                    Instruction::ld_dw(R2, R10, -8),
                    Instruction::alu64(crate::ebpf::ALU_AND, reg, 0x3f),
                    Instruction::mul64(reg, -1),
                    Instruction::add64(R2, reg),
                    Instruction::st_b(R2, 0x10, 0),
                    Instruction::mov64(R2, random_immediate(&mut self.rng)),
                ]);
            } else if count > 0 && self.rng.rand_range(1, 100) <= 30 {
                body.push(random_jmp_instruction(&mut self.rng, count));
            } else {
                body.push(random_alu_instruction(&mut self.rng));
            }
        }
        body.extend([Instruction::mov64(R0, 0), Instruction::exit()]);
        body
    }
}

impl<R: RandomSource> Strategy for LoopPointerArithmetic<R> {
    fn name(&self) -> &'static str {
        StrategyKind::LoopPointerArithmetic.name()
    }

    fn generate_program(&mut self, executor: &mut dyn Executor) -> BpfuzzResult<CandidateProgram> {
        self.program_count += 1;
        debug!(programs = self.program_count, valid = self.valid_count, "generating loop program");

        if let Some(old) = self.map.take()
            && let Err(err) = executor.close_map(old)
        {
            warn!("failed to close check map {}: {err}", old.0);
        }
        let map = executor.create_map(1)?;
        self.map = Some(map);

        let mut instructions = Self::main_function(map.fd());
        let callback_word: usize = instructions.iter().map(Instruction::word_len).sum();
        instructions.extend(self.callback_function());

        let types = LoopCallbackTypes::new();
        let func_info = vec![
            FuncInfo {
                insn_off: 0,
                type_id: types.main,
            },
            FuncInfo {
                insn_off: callback_word as u32,
                type_id: types.callback,
            },
        ];
        let program = FunctionProgram::new(Program::new(instructions)?, types.btf.encode(), func_info)?;
        Ok(CandidateProgram::Functions(program))
    }

    fn on_verify_done(&mut self, _executor: &mut dyn Executor, result: &ValidationResult) -> bool {
        if result.is_valid {
            self.valid_count += 1;
        }
        true
    }

    fn execution_maps(&self) -> Vec<MapHandle> {
        self.map.into_iter().collect()
    }

    fn on_execute_done(&mut self, executor: &mut dyn Executor, result: &ExecutionResult) -> ExecutionVerdict {
        let verdict = check_map_marker(executor, self.map, result);
        self.finished |= verdict != ExecutionVerdict::Expected;
        verdict
    }

    fn on_error(&mut self, err: &BpfuzzError) -> bool {
        warn!("loop strategy error: {err}");
        false
    }

    fn is_fuzzing_done(&self) -> bool {
        self.finished
    }

    fn teardown(&mut self, executor: &mut dyn Executor) {
        if let Some(map) = self.map.take()
            && let Err(err) = executor.close_map(map)
        {
            warn!("failed to close check map {}: {err}", map.0);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Coverage,
    Playground,
    CbpfPlayground,
    CbpfRandomInstruction,
    LoopPointerArithmetic,
}

impl StrategyKind {
    pub const ALL: [Self; 5] = [
        Self::Coverage,
        Self::Playground,
        Self::CbpfPlayground,
        Self::CbpfRandomInstruction,
        Self::LoopPointerArithmetic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Coverage => "coverage",
            Self::Playground => "playground",
            Self::CbpfPlayground => "cbpf_playground",
            Self::CbpfRandomInstruction => "cbpf_random_instruction",
            Self::LoopPointerArithmetic => "loop_pointer_arithmetic",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Coverage => "coverage-guided eBPF mutation with a map pointer arithmetic check",
            Self::Playground => "verify a fixed eBPF program once and print the log",
            Self::CbpfPlayground => "verify a fixed cBPF program once and print the log",
            Self::CbpfRandomInstruction => "random cBPF programs, accepted ones are executed",
            Self::LoopPointerArithmetic => "bpf_loop callbacks writing the caller's stack, with a map pointer arithmetic check",
        }
    }

    pub fn dialect(self) -> Dialect {
        match self {
            Self::Coverage | Self::Playground | Self::LoopPointerArithmetic => Dialect::Extended,
            Self::CbpfPlayground | Self::CbpfRandomInstruction => Dialect::Classic,
        }
    }

    pub fn build(self, seed: u64, settings: &StrategySettings) -> AnyStrategy {
        let rng = SeededRandom::from_seed(seed);
        match self {
            Self::Coverage => {
                let engine = CoverageEngine::new(rng)
                    .with_max_reuse(settings.max_prog_reuse)
                    .with_max_len(settings.max_program_len.saturating_sub(FOOTER_LEN));
                AnyStrategy::Coverage(CoverageBased::new(engine))
            }
            Self::Playground => AnyStrategy::Playground(Playground::default()),
            Self::CbpfPlayground => AnyStrategy::CbpfPlayground(CbpfPlayground::default()),
            Self::CbpfRandomInstruction => AnyStrategy::CbpfRandomInstruction(CbpfRandomInstruction::new(rng)),
            Self::LoopPointerArithmetic => AnyStrategy::LoopPointerArithmetic(LoopPointerArithmetic::new(rng)),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = BpfuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coverage" | "coverage_based" => Ok(Self::Coverage),
            "playground" => Ok(Self::Playground),
            "cbpf_playground" => Ok(Self::CbpfPlayground),
            "cbpf_random_instruction" => Ok(Self::CbpfRandomInstruction),
            "loop_pointer_arithmetic" => Ok(Self::LoopPointerArithmetic),
            other => Err(BpfuzzError::InvalidArgument(format!("unknown fuzzing strategy: {other}"))),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StrategySettings {
    pub max_prog_reuse: u32,
    pub max_program_len: usize,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            max_prog_reuse: crate::MAX_PROG_REUSE,
            max_program_len: 4096,
        }
    }
}

impl From<&crate::Config> for StrategySettings {
    fn from(config: &crate::Config) -> Self {
        Self {
            max_prog_reuse: config.max_prog_reuse,
            max_program_len: config.max_program_len,
        }
    }
}

#[derive(Debug)]
pub enum AnyStrategy {
    Coverage(CoverageBased<SeededRandom>),
    Playground(Playground),
    CbpfPlayground(CbpfPlayground),
    CbpfRandomInstruction(CbpfRandomInstruction<SeededRandom>),
    LoopPointerArithmetic(LoopPointerArithmetic<SeededRandom>),
}

impl AnyStrategy {
    fn inner(&self) -> &dyn Strategy {
        match self {
            Self::Coverage(s) => s,
            Self::Playground(s) => s,
            Self::CbpfPlayground(s) => s,
            Self::CbpfRandomInstruction(s) => s,
            Self::LoopPointerArithmetic(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Strategy {
        match self {
            Self::Coverage(s) => s,
            Self::Playground(s) => s,
            Self::CbpfPlayground(s) => s,
            Self::CbpfRandomInstruction(s) => s,
            Self::LoopPointerArithmetic(s) => s,
        }
    }
}

impl Strategy for AnyStrategy {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn generate_program(&mut self, executor: &mut dyn Executor) -> BpfuzzResult<CandidateProgram> {
        self.inner_mut().generate_program(executor)
    }

    fn on_verify_done(&mut self, executor: &mut dyn Executor, result: &ValidationResult) -> bool {
        self.inner_mut().on_verify_done(executor, result)
    }

    fn execution_maps(&self) -> Vec<MapHandle> {
        self.inner().execution_maps()
    }

    fn on_execute_done(&mut self, executor: &mut dyn Executor, result: &ExecutionResult) -> ExecutionVerdict {
        self.inner_mut().on_execute_done(executor, result)
    }

    fn on_error(&mut self, err: &BpfuzzError) -> bool {
        self.inner_mut().on_error(err)
    }

    fn is_fuzzing_done(&self) -> bool {
        self.inner().is_fuzzing_done()
    }

    fn take_new_traces(&mut self) -> Vec<CoverageTrace> {
        self.inner_mut().take_new_traces()
    }

    fn restore_traces(&mut self, traces: Vec<CoverageTrace>) {
        self.inner_mut().restore_traces(traces)
    }

    fn progress(&self) -> CorpusProgress {
        self.inner().progress()
    }

    fn teardown(&mut self, executor: &mut dyn Executor) {
        self.inner_mut().teardown(executor)
    }
}
