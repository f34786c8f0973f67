//! Program construction and structural validation.
//!
//! [`ProgramTree`] builds the nested branch structure of a hand-written
//! sequence: every conditional jump splits what follows it into a
//! false-branch of exactly `offset` instructions and a true-branch holding
//! the rest. [`Program`] is the flat form that gets encoded and submitted;
//! it checks jump targets in wire words the way the kernel resolves them.

use serde::{Deserialize, Serialize};

use crate::btf::FuncInfo;
use crate::classic;
use crate::ebpf::Instruction;
use crate::encoding;
use crate::{EncodingError, StructuralError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Extended,
    Classic,
}

impl clap::ValueEnum for Dialect {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Extended, Self::Classic]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Extended => clap::builder::PossibleValue::new("extended").alias("ebpf"),
            Self::Classic => clap::builder::PossibleValue::new("classic").alias("cbpf"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Successor {
    End,
    Next(NodeId),
    Branch {
        on_false: Option<NodeId>,
        on_true: Option<NodeId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub instruction: Instruction,
    pub next: Successor,
}

/// Arena of instruction nodes. Node ids equal source positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramTree {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl ProgramTree {
    pub fn build(instructions: &[Instruction]) -> Result<Self, StructuralError> {
        let mut nodes = Vec::with_capacity(instructions.len());
        let root = build_range(instructions, 0, instructions.len(), &mut nodes)?;
        Ok(Self { nodes, root })
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Source positions reachable from `id`, in encoding order.
    pub fn subtree_indices(&self, id: NodeId) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(NodeId(mut at)) = stack.pop() {
            loop {
                out.push(at);
                match self.nodes[at].next {
                    Successor::End => break,
                    Successor::Next(NodeId(n)) => at = n,
                    Successor::Branch { on_false, on_true } => {
                        if let Some(t) = on_true {
                            stack.push(t);
                        }
                        match on_false {
                            Some(NodeId(f)) => at = f,
                            None => break,
                        }
                    }
                }
            }
        }
        out
    }

    /// Flatten back to source order: node, false subtree, true subtree.
    pub fn linearize(&self) -> Vec<Instruction> {
        match self.root {
            Some(root) => self
                .subtree_indices(root)
                .into_iter()
                .map(|i| self.nodes[i].instruction)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u64>, EncodingError> {
        encoding::encode_program(&self.linearize())
    }
}

fn build_range(
    all: &[Instruction],
    start: usize,
    end: usize,
    nodes: &mut Vec<Node>,
) -> Result<Option<NodeId>, StructuralError> {
    let mut root = None;
    let mut prev: Option<NodeId> = None;

    let mut i = start;
    while i < end {
        let instruction = all[i];
        let id = NodeId(nodes.len());
        debug_assert_eq!(id.0, i);
        nodes.push(Node {
            instruction,
            next: Successor::End,
        });
        if let Some(p) = prev {
            nodes[p.0].next = Successor::Next(id);
        } else {
            root = Some(id);
        }
        prev = Some(id);

        if instruction.is_jump() {
            let offset = i32::from(instruction.offset);
            let remaining = end - i;
            if offset == 0 && instruction.is_conditional_jump() {
                return Err(StructuralError::ZeroOffsetNotAllowed { index: i });
            }
            if offset < 0 || offset as usize + 1 > remaining {
                return Err(StructuralError::JumpOutOfBounds {
                    index: i,
                    offset,
                    remaining,
                });
            }
            let split = i + 1 + offset as usize;
            let on_false = build_range(all, i + 1, split, nodes)?;
            let on_true = build_range(all, split, end, nodes)?;
            nodes[id.0].next = Successor::Branch { on_false, on_true };
            break;
        }
        i += 1;
    }
    Ok(root)
}

/// Validate a flat extended program.
///
/// Jump offsets count wire words from the instruction after the jump. A
/// target must be the first word of an instruction inside the program.
pub fn validate_flat(instructions: &[Instruction]) -> Result<(), StructuralError> {
    if instructions.is_empty() {
        return Err(StructuralError::EmptyProgram);
    }

    let mut starts = Vec::with_capacity(instructions.len());
    let mut total = 0usize;
    for ins in instructions {
        starts.push(total);
        total += ins.word_len();
    }

    for (index, ins) in instructions.iter().enumerate() {
        if !ins.is_jump() || ins.is_exit() {
            continue;
        }
        let offset = i32::from(ins.offset);
        if offset == 0 && ins.is_conditional_jump() {
            return Err(StructuralError::ZeroOffsetNotAllowed { index });
        }
        let target = starts[index] as i64 + 1 + i64::from(offset);
        if target < 0 || target >= total as i64 {
            return Err(StructuralError::JumpOutOfBounds {
                index,
                offset,
                remaining: instructions.len() - index,
            });
        }
        let target = target as usize;
        if starts.binary_search(&target).is_err() {
            return Err(StructuralError::JumpIntoPseudoSlot { index, target });
        }
    }
    Ok(())
}

/// A validated, flat extended program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Instruction>", into = "Vec<Instruction>")]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Result<Self, StructuralError> {
        validate_flat(&instructions)?;
        Ok(Self { instructions })
    }

    pub fn from_tree(tree: &ProgramTree) -> Result<Self, StructuralError> {
        Self::new(tree.linearize())
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn word_len(&self) -> usize {
        self.instructions.iter().map(Instruction::word_len).sum()
    }

    pub fn encode(&self) -> Result<Vec<u64>, EncodingError> {
        encoding::encode_program(&self.instructions)
    }
}

impl TryFrom<Vec<Instruction>> for Program {
    type Error = StructuralError;

    fn try_from(instructions: Vec<Instruction>) -> Result<Self, Self::Error> {
        Self::new(instructions)
    }
}

impl From<Program> for Vec<Instruction> {
    fn from(p: Program) -> Self {
        p.instructions
    }
}

/// A validated classic program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<classic::Instruction>", into = "Vec<classic::Instruction>")]
pub struct ClassicProgram {
    instructions: Vec<classic::Instruction>,
}

impl ClassicProgram {
    pub fn new(instructions: Vec<classic::Instruction>) -> Result<Self, StructuralError> {
        classic::validate_jumps(&instructions)?;
        Ok(Self { instructions })
    }

    pub fn instructions(&self) -> &[classic::Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u64>, EncodingError> {
        encoding::encode_classic_program(&self.instructions)
    }
}

impl TryFrom<Vec<classic::Instruction>> for ClassicProgram {
    type Error = StructuralError;

    fn try_from(instructions: Vec<classic::Instruction>) -> Result<Self, Self::Error> {
        Self::new(instructions)
    }
}

impl From<ClassicProgram> for Vec<classic::Instruction> {
    fn from(p: ClassicProgram) -> Self {
        p.instructions
    }
}

/// An extended program split into functions that a BTF blob describes.
///
/// `func_info` names each function's first word, in order, starting at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFunctionProgram")]
pub struct FunctionProgram {
    program: Program,
    btf: Vec<u8>,
    func_info: Vec<FuncInfo>,
}

#[derive(Deserialize)]
struct RawFunctionProgram {
    program: Program,
    btf: Vec<u8>,
    func_info: Vec<FuncInfo>,
}

impl FunctionProgram {
    pub fn new(program: Program, btf: Vec<u8>, func_info: Vec<FuncInfo>) -> Result<Self, StructuralError> {
        let mut starts = Vec::with_capacity(program.len());
        let mut word = 0u32;
        for ins in program.instructions() {
            starts.push(word);
            word += ins.word_len() as u32;
        }
        let mut last = None;
        for (index, info) in func_info.iter().enumerate() {
            let in_order = match last {
                None => info.insn_off == 0,
                Some(prev) => info.insn_off > prev,
            };
            if !in_order || starts.binary_search(&info.insn_off).is_err() {
                return Err(StructuralError::BadFuncInfo {
                    index,
                    insn_off: info.insn_off,
                });
            }
            last = Some(info.insn_off);
        }
        Ok(Self {
            program,
            btf,
            func_info,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn btf(&self) -> &[u8] {
        &self.btf
    }

    pub fn func_info(&self) -> &[FuncInfo] {
        &self.func_info
    }

    /// Swap the instructions, keeping the BTF and function layout.
    pub fn with_program(self, program: Program) -> Result<Self, StructuralError> {
        Self::new(program, self.btf, self.func_info)
    }
}

impl TryFrom<RawFunctionProgram> for FunctionProgram {
    type Error = StructuralError;

    fn try_from(raw: RawFunctionProgram) -> Result<Self, Self::Error> {
        Self::new(raw.program, raw.btf, raw.func_info)
    }
}

/// Whatever a strategy hands to the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "dialect", content = "instructions", rename_all = "snake_case")]
pub enum CandidateProgram {
    Extended(Program),
    Classic(ClassicProgram),
    /// Extended instructions loaded together with BTF function info.
    Functions(FunctionProgram),
}

impl CandidateProgram {
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Extended(_) | Self::Functions(_) => Dialect::Extended,
            Self::Classic(_) => Dialect::Classic,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Extended(p) => p.len(),
            Self::Classic(p) => p.len(),
            Self::Functions(f) => f.program.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> Result<Vec<u64>, EncodingError> {
        match self {
            Self::Extended(p) => p.encode(),
            Self::Classic(p) => p.encode(),
            Self::Functions(f) => f.program.encode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::{Instruction as I, Register::*};

    fn nested_program() -> Vec<I> {
        vec![
            I::mov64(R0, 0),
            I::jmp_gt(R0, 1, 4),
            I::mul64(R1, 2),
            I::jmp_lt(R1, 3, 2),
            I::ja(1),
            I::mov64(R0, 1),
            I::exit(),
        ]
    }

    #[test]
    fn nested_jumps_build_and_linearize_in_source_order() {
        let source = nested_program();
        let tree = ProgramTree::build(&source).expect("build");
        assert_eq!(tree.len(), source.len());
        assert_eq!(tree.linearize(), source);

        let jgt = tree.node(NodeId(1)).expect("jgt node");
        assert_eq!(
            jgt.next,
            Successor::Branch {
                on_false: Some(NodeId(2)),
                on_true: Some(NodeId(6)),
            }
        );
        assert_eq!(tree.subtree_indices(NodeId(3)), vec![3, 4, 5]);
    }

    #[test]
    fn zero_offset_conditional_is_rejected() {
        let err = ProgramTree::build(&[I::mov64(R0, 0), I::jmp_gt(R0, 1, 0), I::exit()])
            .expect_err("zero offset");
        assert_eq!(err, StructuralError::ZeroOffsetNotAllowed { index: 1 });
    }

    #[test]
    fn jump_past_the_end_is_rejected() {
        let err = ProgramTree::build(&[I::mov64(R0, 0), I::jmp_gt(R0, 1, 2), I::exit()])
            .expect_err("out of bounds");
        assert_eq!(
            err,
            StructuralError::JumpOutOfBounds {
                index: 1,
                offset: 2,
                remaining: 2,
            }
        );
    }

    #[test]
    fn backward_jumps_are_not_nested() {
        let err = ProgramTree::build(&[I::mov64(R0, 0), I::jmp_ne(R0, 1, -1), I::exit()])
            .expect_err("negative offset");
        assert!(matches!(err, StructuralError::JumpOutOfBounds { offset: -1, .. }));
    }

    #[test]
    fn exit_and_ja_may_use_zero_offset() {
        ProgramTree::build(&[I::ja(0), I::mov64(R0, 0), I::exit()]).expect("ja 0");
        let tree = ProgramTree::build(&[I::mov64(R0, 0), I::exit()]).expect("exit");
        assert_eq!(tree.encode().expect("encode"), vec![0xb7, 0x95]);
    }

    #[test]
    fn flat_validation_counts_words() {
        let program = vec![
            I::jmp_eq(R1, 0, 2),
            I::ld_imm64(R2, 1),
            I::exit(),
        ];
        Program::new(program.clone()).expect("jump over the wide load");

        let mut into_slot = program.clone();
        into_slot[0].offset = 1;
        assert_eq!(
            Program::new(into_slot).expect_err("pseudo slot"),
            StructuralError::JumpIntoPseudoSlot { index: 0, target: 2 }
        );

        let mut past_end = program;
        past_end[0].offset = 3;
        assert!(matches!(
            Program::new(past_end),
            Err(StructuralError::JumpOutOfBounds { index: 0, .. })
        ));
    }

    #[test]
    fn flat_validation_accepts_overlapping_jumps() {
        let program = vec![
            I::jmp_eq(R1, 0, 2),
            I::jmp_eq(R2, 0, 2),
            I::mov64(R0, 1),
            I::mov64(R0, 2),
            I::exit(),
        ];
        assert!(ProgramTree::build(&program).is_err());
        Program::new(program).expect("flat form allows overlap");
    }

    #[test]
    fn programs_deserialize_through_validation() {
        let program = Program::new(vec![I::mov64(R0, 0), I::exit()]).expect("valid");
        let json = serde_json::to_string(&program).expect("serialize");
        let back: Program = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, program);

        let bad = serde_json::to_string(&vec![I::jmp_gt(R0, 1, 0), I::exit()]).expect("serialize");
        assert!(serde_json::from_str::<Program>(&bad).is_err());
    }

    #[test]
    fn function_info_must_follow_instruction_starts() {
        let program = Program::new(vec![
            I::ld_func(R2, 1),
            I::mov64(R0, 0),
            I::exit(),
            I::mov64(R0, 0),
            I::exit(),
        ])
        .expect("program");
        let info = |offs: &[u32]| {
            offs.iter()
                .map(|&insn_off| FuncInfo { insn_off, type_id: 1 })
                .collect::<Vec<_>>()
        };

        let functions = FunctionProgram::new(program.clone(), vec![], info(&[0, 4])).expect("valid layout");
        let candidate = CandidateProgram::Functions(functions);
        assert_eq!(candidate.dialect(), Dialect::Extended);
        assert_eq!(candidate.encode().expect("encode").len(), 6);

        assert_eq!(
            FunctionProgram::new(program.clone(), vec![], info(&[0, 1])).expect_err("pseudo slot"),
            StructuralError::BadFuncInfo { index: 1, insn_off: 1 }
        );
        assert!(FunctionProgram::new(program.clone(), vec![], info(&[3])).is_err());
        assert!(FunctionProgram::new(program, vec![], info(&[0, 4, 4])).is_err());
    }

    #[test]
    fn function_programs_deserialize_through_validation() {
        let program = Program::new(vec![I::mov64(R0, 0), I::exit()]).expect("program");
        let candidate = CandidateProgram::Functions(
            FunctionProgram::new(program, vec![0x9f, 0xeb], vec![FuncInfo { insn_off: 0, type_id: 2 }])
                .expect("functions"),
        );
        let json = serde_json::to_string(&candidate).expect("serialize");
        assert!(json.contains("\"dialect\":\"functions\""), "{json}");
        let back: CandidateProgram = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, candidate);

        let tampered = json.replace("\"insn_off\":0", "\"insn_off\":1");
        assert!(serde_json::from_str::<CandidateProgram>(&tampered).is_err());
    }

    #[test]
    fn classic_candidates_encode_per_instruction() {
        use crate::classic::{Instruction as C, Register as CR};

        let program = ClassicProgram::new(vec![C::add(1u32), C::misc(CR::A), C::ret(4u32)]).expect("valid");
        let candidate = CandidateProgram::Classic(program);
        assert_eq!(candidate.dialect(), Dialect::Classic);
        assert_eq!(candidate.encode().expect("encode").len(), 3);
    }
}
