//! Coverage-guided corpus engine.
//!
//! Programs are a fixed head (the default seed) followed by a mutable body.
//! Each iteration pops the most productive trace, mutates its body by one
//! instruction and waits for verifier feedback; programs that reach a new
//! coverage address or a new coverage signature are queued for reuse.

use tracing::{debug, warn};

use std::collections::HashSet;

use crate::ebpf::{self, Instruction, Register};
use crate::generator::{random_alu_instruction, random_jmp_instruction, random_mem_instruction};
use crate::{CoverageTrace, MutationError, RandomSource, TraceQueue, ValidationResult};

/// How many times a queued trace is handed out before it is dropped.
pub const MAX_PROG_REUSE: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Add,
    Modify,
}

impl TryFrom<u64> for MutationOp {
    type Error = MutationError;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Add),
            1 => Ok(Self::Modify),
            other => Err(MutationError::UnknownOperation(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Selecting,
    Mutating,
    AwaitingFeedback,
    Accepting,
    Discarding,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub generated: u64,
    pub valid: u64,
    pub kept: u64,
    pub discarded: u64,
}

/// Order-independent fingerprint of a coverage address set.
pub fn coverage_signature(addresses: &[u64]) -> u64 {
    addresses.iter().fold(0, |acc, a| acc ^ a)
}

/// Map lookup into R0, then R1..R9 and the stack from -16 to -512 seeded
/// with values so the verifier sees every register and slot initialized.
///
/// The first instruction's immediate is a placeholder for the map fd.
pub fn default_seed<R: RandomSource + ?Sized>(rng: &mut R) -> Vec<Instruction> {
    use Register::*;

    let mut seed = vec![
        Instruction::ld_map_fd(R1, 0),
        Instruction::st_w(R10, 0, -4),
        Instruction::mov64(R2, R10),
        Instruction::add64(R2, -4),
        Instruction::call(ebpf::HELPER_MAP_LOOKUP),
        Instruction::jmp_ne(R0, 0, 1),
        Instruction::exit(),
        Instruction::ld_dw(R0, R0, 0),
    ];
    for reg in [R1, R2, R3, R4, R5, R6, R7, R8, R9] {
        seed.push(Instruction::mov64(reg, rng.rand_int() as i32));
    }
    for depth in (16..=512).step_by(8) {
        seed.push(Instruction::st_dw(R10, R0, -(depth as i16)));
    }
    seed
}

fn random_instruction<R: RandomSource + ?Sized>(rng: &mut R, max_jmp: u64) -> Instruction {
    match rng.rand_int() % 3 {
        0 => random_alu_instruction(rng),
        1 if max_jmp == 0 => random_alu_instruction(rng),
        1 => random_jmp_instruction(rng, max_jmp),
        _ => random_mem_instruction(rng),
    }
}

/// Insert one random instruction at a random position in `body`.
///
/// A generated jump may skip at most the instructions already following
/// the insertion point, less one.
pub fn add_instruction<R: RandomSource + ?Sized>(rng: &mut R, body: &mut Vec<Instruction>) {
    let len = body.len() as u64;
    let pos = rng.rand_int() % (len + 1);
    let max_jmp = if pos == len { 0 } else { len - pos - 1 };
    let ins = random_instruction(rng, max_jmp);
    body.insert(pos as usize, ins);
}

/// Replace one random instruction of `body`; an empty body gets an insert.
pub fn modify_instruction<R: RandomSource + ?Sized>(rng: &mut R, body: &mut Vec<Instruction>) {
    if body.is_empty() {
        add_instruction(rng, body);
        return;
    }
    let len = body.len() as u64;
    let pos = rng.rand_int() % len;
    let max_jmp = len - pos - 1;
    body[pos as usize] = random_instruction(rng, max_jmp);
}

#[derive(Debug)]
pub struct CoverageEngine<R> {
    rng: R,
    queue: TraceQueue,
    seen_addresses: HashSet<u64>,
    seen_signatures: HashSet<u64>,
    default_seed: Vec<Instruction>,
    max_reuse: u32,
    max_len: usize,
    last_program: Option<Vec<Instruction>>,
    last_kept: Option<CoverageTrace>,
    state: EngineState,
    stats: EngineStats,
}

impl<R: RandomSource> CoverageEngine<R> {
    pub fn new(mut rng: R) -> Self {
        let default_seed = default_seed(&mut rng);
        Self {
            rng,
            queue: TraceQueue::new(),
            seen_addresses: HashSet::new(),
            seen_signatures: HashSet::new(),
            default_seed,
            max_reuse: MAX_PROG_REUSE,
            max_len: usize::MAX,
            last_program: None,
            last_kept: None,
            state: EngineState::Idle,
            stats: EngineStats::default(),
        }
    }

    pub fn with_max_reuse(mut self, max_reuse: u32) -> Self {
        self.max_reuse = max_reuse;
        self
    }

    /// Queued programs at or past `max_len` instructions are dropped on
    /// selection instead of grown further.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn default_seed(&self) -> &[Instruction] {
        &self.default_seed
    }

    /// Number of leading instructions mutation never touches.
    pub fn head_len(&self) -> usize {
        self.default_seed.len()
    }

    pub fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }

    pub fn queue(&self) -> &TraceQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut TraceQueue {
        &mut self.queue
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn seen_address_count(&self) -> usize {
        self.seen_addresses.len()
    }

    pub fn seen_signature_count(&self) -> usize {
        self.seen_signatures.len()
    }

    /// Re-queue a trace loaded from a persisted corpus.
    pub fn restore(&mut self, mut trace: CoverageTrace) {
        self.seen_signatures.insert(trace.signature);
        trace.usage_count = 0;
        self.queue.push(trace);
    }

    /// Copy of the best queued program, or of the default seed when the
    /// queue is empty. Traces under the reuse budget go back in the queue.
    pub fn select_seed(&mut self) -> Vec<Instruction> {
        self.state = EngineState::Selecting;
        let Some(mut trace) = self.queue.pop() else {
            return self.default_seed.clone();
        };
        if trace.program.len() >= self.max_len {
            debug!(len = trace.program.len(), "dropping trace at the length limit");
            return self.default_seed.clone();
        }
        let program = trace.program.clone();
        if trace.usage_count < self.max_reuse {
            trace.usage_count += 1;
            self.queue.push(trace);
        } else {
            debug!(signature = trace.signature, "trace exhausted its reuse budget");
        }
        program
    }

    /// Apply one mutation, chosen at random, to the body after the head.
    pub fn mutate(&mut self, program: Vec<Instruction>) -> Result<Vec<Instruction>, MutationError> {
        let op = MutationOp::try_from(self.rng.rand_int() % 2)?;
        Ok(self.mutate_with(program, op))
    }

    pub fn mutate_with(&mut self, mut program: Vec<Instruction>, op: MutationOp) -> Vec<Instruction> {
        self.state = EngineState::Mutating;
        let split = self.head_len().min(program.len());
        let mut body = program.split_off(split);
        match op {
            MutationOp::Add => add_instruction(&mut self.rng, &mut body),
            MutationOp::Modify => modify_instruction(&mut self.rng, &mut body),
        }
        program.extend(body);
        program
    }

    /// Select, mutate and remember the result until feedback arrives.
    pub fn next_candidate(&mut self) -> Result<Vec<Instruction>, MutationError> {
        self.stats.generated += 1;
        let seed = self.select_seed();
        let mutated = self.mutate(seed)?;
        self.last_program = Some(mutated.clone());
        self.state = EngineState::AwaitingFeedback;
        Ok(mutated)
    }

    fn discard(&mut self) -> Verdict {
        self.state = EngineState::Discarding;
        self.stats.discarded += 1;
        Verdict::Discard
    }

    /// Fold verifier feedback for the last candidate into the dedup sets.
    pub fn on_feedback(&mut self, result: &ValidationResult) -> Verdict {
        let program = self.last_program.take();
        if !result.is_valid {
            return self.discard();
        }
        self.stats.valid += 1;

        if !result.did_collect_coverage {
            warn!("verifier accepted the program but coverage was not collected");
            return self.discard();
        }

        let mut new_address = false;
        for addr in &result.coverage_addresses {
            new_address |= self.seen_addresses.insert(*addr);
        }
        let signature = coverage_signature(&result.coverage_addresses);
        let new_signature = self.seen_signatures.insert(signature);

        if !(new_address || new_signature) {
            return self.discard();
        }
        let Some(program) = program else {
            warn!("feedback arrived without a pending candidate");
            return self.discard();
        };

        self.state = EngineState::Accepting;
        self.stats.kept += 1;
        let trace = CoverageTrace {
            program,
            signature,
            coverage_size: result.coverage_addresses.len() as u64,
            usage_count: 0,
        };
        self.last_kept = Some(trace.clone());
        self.queue.push(trace);
        debug!(
            signature = format_args!("{signature:#x}"),
            coverage = result.coverage_addresses.len(),
            queue = self.queue.len(),
            "queued program with new coverage"
        );
        Verdict::Keep
    }

    /// The trace queued by the most recent `Keep`, for persistence.
    pub fn take_last_kept(&mut self) -> Option<CoverageTrace> {
        self.last_kept.take()
    }

    /// Return to idle once the iteration has been fully processed.
    pub fn finish_iteration(&mut self) {
        self.state = EngineState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProgramTree, ScriptedRandom, SeededRandom};

    fn valid(addresses: Vec<u64>) -> ValidationResult {
        ValidationResult {
            is_valid: true,
            program_handle: None,
            verifier_log: String::new(),
            coverage_addresses: addresses,
            did_collect_coverage: true,
        }
    }

    #[test]
    fn default_seed_shape() {
        let mut rng = SeededRandom::from_seed(9);
        let seed = default_seed(&mut rng);
        assert_eq!(seed.len(), 80);
        assert!(seed[0].is_wide_load());
        assert_eq!(seed[79], Instruction::st_dw(Register::R10, Register::R0, -512));
        ProgramTree::build(&seed).expect("default seed nests");
    }

    #[test]
    fn unknown_mutation_operation_is_an_error() {
        assert_eq!(MutationOp::try_from(0), Ok(MutationOp::Add));
        assert_eq!(MutationOp::try_from(1), Ok(MutationOp::Modify));
        assert_eq!(MutationOp::try_from(2), Err(MutationError::UnknownOperation(2)));
    }

    #[test]
    fn new_address_set_is_kept_with_zero_usage() {
        let mut engine = CoverageEngine::new(SeededRandom::from_seed(1));
        let candidate = engine.next_candidate().expect("candidate");
        assert_eq!(engine.state(), EngineState::AwaitingFeedback);

        assert_eq!(engine.on_feedback(&valid(vec![0x10, 0x20, 0x30])), Verdict::Keep);
        assert_eq!(engine.state(), EngineState::Accepting);

        let trace = engine.queue_mut().pop().expect("queued trace");
        assert_eq!(trace.usage_count, 0);
        assert_eq!(trace.coverage_size, 3);
        assert_eq!(trace.signature, 0x10 ^ 0x20 ^ 0x30);
        assert_eq!(trace.program, candidate);
        assert_eq!(engine.take_last_kept(), Some(trace));
        assert_eq!(engine.take_last_kept(), None);
    }

    #[test]
    fn repeated_address_set_is_discarded() {
        let mut engine = CoverageEngine::new(SeededRandom::from_seed(2));
        engine.next_candidate().expect("first");
        assert_eq!(engine.on_feedback(&valid(vec![1, 2, 3])), Verdict::Keep);

        engine.next_candidate().expect("second");
        assert_eq!(engine.on_feedback(&valid(vec![1, 2, 3])), Verdict::Discard);
        assert_eq!(engine.state(), EngineState::Discarding);
        assert_eq!(engine.queue().len(), 1);
    }

    #[test]
    fn new_signature_alone_is_enough_to_keep() {
        let mut engine = CoverageEngine::new(SeededRandom::from_seed(3));
        engine.next_candidate().expect("first");
        assert_eq!(engine.on_feedback(&valid(vec![1, 2, 4])), Verdict::Keep);
        engine.next_candidate().expect("second");
        // Subset of seen addresses with a different fold.
        assert_eq!(engine.on_feedback(&valid(vec![1, 2])), Verdict::Keep);
        assert_eq!(engine.seen_address_count(), 3);
        assert_eq!(engine.seen_signature_count(), 2);
    }

    #[test]
    fn invalid_or_uncollected_feedback_is_discarded() {
        let mut engine = CoverageEngine::new(SeededRandom::from_seed(4));
        engine.next_candidate().expect("candidate");
        let mut rejected = valid(vec![7]);
        rejected.is_valid = false;
        assert_eq!(engine.on_feedback(&rejected), Verdict::Discard);

        engine.next_candidate().expect("candidate");
        let mut uncollected = valid(vec![7]);
        uncollected.did_collect_coverage = false;
        assert_eq!(engine.on_feedback(&uncollected), Verdict::Discard);
        assert_eq!(engine.seen_address_count(), 0);
        assert!(engine.queue().is_empty());
        assert_eq!(engine.stats().valid, 1);
    }

    #[test]
    fn mutation_never_touches_the_head() {
        let mut engine = CoverageEngine::new(SeededRandom::from_seed(5));
        let head = engine.default_seed().to_vec();
        let mut program = head.clone();
        for i in 0..300 {
            let op = if i % 2 == 0 { MutationOp::Add } else { MutationOp::Modify };
            program = engine.mutate_with(program, op);
            assert_eq!(&program[..head.len()], head.as_slice());
        }
        assert!(program.len() > head.len());
    }

    #[test]
    fn mutated_jumps_stay_inside_the_body() {
        let mut engine = CoverageEngine::new(SeededRandom::from_seed(6));
        let mut program = engine.default_seed().to_vec();
        let head_len = engine.head_len();
        for _ in 0..400 {
            program = engine.mutate(program).expect("mutate");
            for (i, ins) in program.iter().enumerate().skip(head_len) {
                if ins.is_conditional_jump() {
                    let target = i as i64 + 1 + i64::from(ins.offset);
                    assert!(target <= program.len() as i64, "jump at {i} escapes");
                }
            }
        }
    }

    #[test]
    fn first_insert_into_empty_body_cannot_jump() {
        // pos = 0 of an empty body, then instruction kind 1 (jump) falls back to ALU.
        let mut rng = ScriptedRandom::new(vec![0, 2]);
        let mut body = Vec::new();
        add_instruction(&mut rng, &mut body);
        assert_eq!(body.len(), 1);
        assert!(!body[0].is_jmp_class());
    }

    #[test]
    fn seeds_are_reused_up_to_the_budget() {
        let mut engine = CoverageEngine::new(SeededRandom::from_seed(7)).with_max_reuse(2);
        engine.queue_mut().push(CoverageTrace {
            program: vec![Instruction::exit()],
            signature: 1,
            coverage_size: 1,
            usage_count: 0,
        });
        for _ in 0..3 {
            assert_eq!(engine.select_seed(), vec![Instruction::exit()]);
        }
        assert!(engine.queue().is_empty());
        assert_eq!(engine.select_seed().len(), engine.head_len());
    }

    #[test]
    fn traces_at_the_length_limit_are_dropped() {
        let mut engine = CoverageEngine::new(SeededRandom::from_seed(8)).with_max_len(2);
        engine.queue_mut().push(CoverageTrace {
            program: vec![Instruction::mov64(Register::R0, 0), Instruction::exit()],
            signature: 1,
            coverage_size: 9,
            usage_count: 0,
        });
        assert_eq!(engine.select_seed().len(), engine.head_len());
        assert!(engine.queue().is_empty());
    }
}
