//! Deterministic in-process verifier and interpreter.
//!
//! Tracks register and stack types the way a kernel verifier does, only far
//! coarser: scalars are either known constants or unknown, pointers carry a
//! fixed offset, and every path is walked separately. Each distinct check
//! reports a stable coverage address, so the feedback loop behaves as it
//! would against kcov over a real verifier.

use tracing::debug;

use std::collections::{BTreeSet, HashMap};

use crate::btf::{Btf, FuncInfo, Kind};
use crate::ebpf::{self, Instruction, Register};
use crate::encoding::decode_program;
use crate::{
    classic, stable_edge, Dialect, ExecutionResult, Executor, MapHandle, ProgramHandle, ResourceError,
    ValidationResult,
};

/// Every map the model creates is an array of 8-byte values.
pub const MAP_VALUE_SIZE: i64 = 8;
const STACK_SIZE: i64 = 512;
const FIRST_HANDLE: u32 = 3;
const DEFAULT_COMPLEXITY_LIMIT: usize = 100_000;
const EXEC_STEP_LIMIT: usize = 1 << 16;
const LOG_LINE_LIMIT: usize = 2048;
const LOOP_MAX_ITERATIONS: u64 = 1 << 23;
const MAX_FUNC_ARGS: u16 = 5;

const CLASSIC_MAX_INSNS: usize = 4096;
const CLASSIC_MEMWORDS: u32 = 16;
const CLASSIC_MAX_ANCILLARY: i32 = 64;

// Fake kernel addresses so concrete pointer comparisons are deterministic.
const STACK_BASE: u64 = 0xffff_c900_0000_0200;
const MAP_VALUE_BASE: u64 = 0xffff_8880_0000_0000;
const MAP_BASE: u64 = 0xffff_8880_4000_0000;
const CTX_BASE: u64 = 0xffff_8880_8000_0000;
const FUNC_BASE: u64 = 0xffff_ffff_a000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
    Uninit,
    Scalar(Option<u64>),
    Ctx,
    Stack(i64),
    /// Into the stack of the frame that called `bpf_loop`.
    ParentStack(i64),
    /// Instruction index of a function.
    Func(usize),
    Map(u32),
    MapValue { map: u32, elem: u32, off: i64 },
    MapValueOrNull { map: u32, off: i64 },
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::Uninit => "uninit",
            Self::Scalar(_) => "scalar",
            Self::Ctx => "ctx",
            Self::Stack(_) => "fp",
            Self::ParentStack(_) => "parent_fp",
            Self::Func(_) => "func",
            Self::Map(_) => "map_ptr",
            Self::MapValue { .. } => "map_value",
            Self::MapValueOrNull { .. } => "map_value_or_null",
        }
    }

    fn is_pointer(&self) -> bool {
        !matches!(self, Self::Uninit | Self::Scalar(_))
    }

    fn known(&self) -> Option<u64> {
        match self {
            Self::Scalar(v) => *v,
            _ => None,
        }
    }

    /// Runtime bit pattern, pointers included.
    fn address(&self) -> Option<u64> {
        match *self {
            Self::Scalar(v) => v,
            Self::Ctx => Some(CTX_BASE),
            Self::Stack(off) | Self::ParentStack(off) => Some(STACK_BASE.wrapping_add(off as u64)),
            Self::Func(idx) => Some(FUNC_BASE + idx as u64 * 8),
            Self::Map(map) => Some(MAP_BASE + (u64::from(map) << 12)),
            Self::MapValue { map, elem, off } => Some(
                MAP_VALUE_BASE
                    .wrapping_add(u64::from(map) << 20)
                    .wrapping_add(u64::from(elem) * MAP_VALUE_SIZE as u64)
                    .wrapping_add(off as u64),
            ),
            Self::Uninit | Self::MapValueOrNull { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reject {
    check: &'static str,
    message: String,
}

fn reject<T>(check: &'static str, message: impl Into<String>) -> Result<T, Reject> {
    Err(Reject {
        check,
        message: message.into(),
    })
}

type Check<T> = Result<T, Reject>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackByte {
    Uninit,
    Unknown,
    Known(u8),
}

#[derive(Debug, Clone)]
struct Stack {
    bytes: Vec<StackByte>,
    spills: HashMap<i64, Value>,
}

impl Stack {
    fn new() -> Self {
        Self {
            bytes: vec![StackByte::Uninit; STACK_SIZE as usize],
            spills: HashMap::new(),
        }
    }

    fn index(off: i64) -> usize {
        (off + STACK_SIZE) as usize
    }

    /// `off..off + size` must already be inside the frame.
    fn write(&mut self, off: i64, size: i64, value: Value, concrete: bool) {
        self.spills.retain(|slot, _| *slot >= off + size || *slot + 8 <= off);
        let raw = if concrete || !value.is_pointer() {
            value.address()
        } else {
            None
        };
        let bytes = raw.map(u64::to_le_bytes);
        for i in 0..size {
            self.bytes[Self::index(off + i)] = match bytes {
                Some(b) => StackByte::Known(b[i as usize]),
                None => StackByte::Unknown,
            };
        }
        if value.is_pointer() {
            self.spills.insert(off, value);
        }
    }

    fn read(&self, off: i64, size: i64) -> Check<Value> {
        if size == 8 {
            if let Some(spilled) = self.spills.get(&off) {
                return Ok(*spilled);
            }
        }
        let mut raw = [0u8; 8];
        let mut known = true;
        for i in 0..size {
            match self.bytes[Self::index(off + i)] {
                StackByte::Uninit => {
                    return reject("stack_uninit", format!("invalid read from stack off {off}+{i} size {size}"));
                }
                StackByte::Unknown => known = false,
                StackByte::Known(b) => raw[i as usize] = b,
            }
        }
        Ok(Value::Scalar(known.then(|| u64::from_le_bytes(raw))))
    }
}

#[derive(Debug, Clone)]
struct Frame {
    regs: [Value; 11],
    stack: Stack,
}

impl Frame {
    fn entry() -> Self {
        let mut regs = [Value::Uninit; 11];
        regs[Register::R1.number() as usize] = Value::Ctx;
        regs[Register::R10.number() as usize] = Value::Stack(0);
        Self {
            regs,
            stack: Stack::new(),
        }
    }

    /// Entry state of a loop callback: R1 holds the iteration, R2 the
    /// caller's context pointer.
    fn callback(index: Value, ctx: i64) -> Self {
        let mut regs = [Value::Uninit; 11];
        regs[Register::R1.number() as usize] = index;
        regs[Register::R2.number() as usize] = Value::ParentStack(ctx);
        regs[Register::R10.number() as usize] = Value::Stack(0);
        Self {
            regs,
            stack: Stack::new(),
        }
    }

    fn get(&self, r: Register) -> Value {
        self.regs[r.number() as usize]
    }

    fn read(&self, r: Register) -> Check<Value> {
        match self.get(r) {
            Value::Uninit => reject("reg_uninit", format!("R{} !read_ok", r.number())),
            v => Ok(v),
        }
    }

    fn set(&mut self, r: Register, v: Value) {
        self.regs[r.number() as usize] = v;
    }
}

#[derive(Debug, Clone)]
struct MapState {
    elements: Vec<u64>,
}

impl MapState {
    fn byte_len(&self) -> i64 {
        self.elements.len() as i64 * MAP_VALUE_SIZE
    }

    fn read(&self, at: i64, size: i64) -> u64 {
        let mut out = [0u8; 8];
        for i in 0..size {
            let pos = at + i;
            if pos < 0 || pos >= self.byte_len() {
                continue;
            }
            let word = self.elements[(pos / MAP_VALUE_SIZE) as usize];
            out[i as usize] = word.to_le_bytes()[(pos % MAP_VALUE_SIZE) as usize];
        }
        u64::from_le_bytes(out)
    }

    /// Returns false when the store falls outside the array.
    fn write(&mut self, at: i64, size: i64, value: u64) -> bool {
        if at < 0 || at + size > self.byte_len() {
            return false;
        }
        let src = value.to_le_bytes();
        for i in 0..size {
            let pos = at + i;
            let idx = (pos / MAP_VALUE_SIZE) as usize;
            let mut word = self.elements[idx].to_le_bytes();
            word[(pos % MAP_VALUE_SIZE) as usize] = src[i as usize];
            self.elements[idx] = u64::from_le_bytes(word);
        }
        true
    }
}

enum Flow {
    Next,
    Goto(usize),
    Fork { target: usize, taken: Frame },
    Exit,
}

enum Access {
    Stack(i64),
    ParentStack(i64),
    MapValue { map: u32, elem: u32, off: i64 },
}

fn size_bytes(code: u8) -> i64 {
    match code & 0x18 {
        ebpf::SIZE_B => 1,
        ebpf::SIZE_H => 2,
        ebpf::SIZE_W => 4,
        _ => 8,
    }
}

fn truncate(v: u64, size: i64) -> u64 {
    if size >= 8 { v } else { v & ((1u64 << (size * 8)) - 1) }
}

fn alu_eval(op: u8, is64: bool, a: u64, b: u64) -> Option<u64> {
    let (a, b) = if is64 { (a, b) } else { (a as u32 as u64, b as u32 as u64) };
    let bits = if is64 { 64 } else { 32 };
    let shift = (b & (bits - 1)) as u32;
    let r = match op {
        ebpf::ALU_ADD => a.wrapping_add(b),
        ebpf::ALU_SUB => a.wrapping_sub(b),
        ebpf::ALU_MUL => a.wrapping_mul(b),
        ebpf::ALU_DIV => a.checked_div(b).unwrap_or(0),
        ebpf::ALU_OR => a | b,
        ebpf::ALU_AND => a & b,
        ebpf::ALU_LSH => a << shift,
        ebpf::ALU_RSH => a >> shift,
        ebpf::ALU_NEG => (a as i64).wrapping_neg() as u64,
        ebpf::ALU_MOD => a.checked_rem(b).unwrap_or(a),
        ebpf::ALU_XOR => a ^ b,
        ebpf::ALU_MOV => b,
        ebpf::ALU_ARSH if is64 => ((a as i64) >> shift) as u64,
        ebpf::ALU_ARSH => ((a as u32 as i32) >> shift) as u32 as u64,
        _ => return None,
    };
    Some(if is64 { r } else { r as u32 as u64 })
}

fn jmp_eval(op: u8, is32: bool, a: u64, b: u64) -> Option<bool> {
    let (a, b) = if is32 { (a as u32 as u64, b as u32 as u64) } else { (a, b) };
    let (sa, sb) = if is32 {
        (a as u32 as i32 as i64, b as u32 as i32 as i64)
    } else {
        (a as i64, b as i64)
    };
    Some(match op {
        ebpf::JMP_JEQ => a == b,
        ebpf::JMP_JNE => a != b,
        ebpf::JMP_JGT => a > b,
        ebpf::JMP_JGE => a >= b,
        ebpf::JMP_JLT => a < b,
        ebpf::JMP_JLE => a <= b,
        ebpf::JMP_JSET => a & b != 0,
        ebpf::JMP_JSGT => sa > sb,
        ebpf::JMP_JSGE => sa >= sb,
        ebpf::JMP_JSLT => sa < sb,
        ebpf::JMP_JSLE => sa <= sb,
        _ => return None,
    })
}

struct Walker<'a> {
    prog: &'a [Instruction],
    starts: Vec<usize>,
    total_words: usize,
    /// Sorted instruction indices where functions begin.
    functions: Vec<usize>,
    func_info: Option<(&'a [u8], &'a [FuncInfo])>,
    maps: &'a mut HashMap<u32, MapState>,
    /// Stack of the `bpf_loop` caller while a callback runs.
    parent: Option<Stack>,
    concrete: bool,
    unchecked_map_stores: bool,
    stale_callback_stack: bool,
    complexity_limit: usize,
    processed: usize,
    steps: usize,
    coverage: BTreeSet<u64>,
    log: Vec<String>,
}

impl<'a> Walker<'a> {
    fn new(prog: &'a [Instruction], maps: &'a mut HashMap<u32, MapState>, concrete: bool) -> Self {
        let mut starts = Vec::with_capacity(prog.len());
        let mut word = 0usize;
        for ins in prog {
            starts.push(word);
            word += ins.word_len();
        }
        Self {
            prog,
            starts,
            total_words: word,
            functions: vec![0],
            func_info: None,
            maps,
            parent: None,
            concrete,
            unchecked_map_stores: false,
            stale_callback_stack: false,
            complexity_limit: DEFAULT_COMPLEXITY_LIMIT,
            processed: 0,
            steps: 0,
            coverage: BTreeSet::new(),
            log: Vec::new(),
        }
    }

    fn hit(&mut self, label: &str) {
        if !self.concrete {
            self.coverage.insert(stable_edge(label));
        }
    }

    fn log_line(&mut self, line: String) {
        if self.log.len() < LOG_LINE_LIMIT {
            self.log.push(line);
        }
    }

    /// Instruction indices where functions begin: 0 plus every target of a
    /// function pointer load.
    fn discover_functions(&self) -> Check<Vec<usize>> {
        let mut functions = vec![0];
        for (pc, ins) in self.prog.iter().enumerate() {
            if !ins.is_wide_load() || ins.src != ebpf::PSEUDO_FUNC {
                continue;
            }
            let word = self.starts[pc] as i64 + 1 + i64::from(ins.imm);
            let target = usize::try_from(word).ok().and_then(|w| self.starts.binary_search(&w).ok());
            match target {
                Some(idx) if idx > 0 => functions.push(idx),
                _ => {
                    return reject(
                        "func_target",
                        format!("insn {pc}: function pointer to invalid destination {word}"),
                    );
                }
            }
        }
        functions.sort_unstable();
        functions.dedup();
        Ok(functions)
    }

    /// `[start, end)` of the function holding `pc`.
    fn function_bounds(&self, pc: usize) -> (usize, usize) {
        let at = self.functions.partition_point(|&start| start <= pc);
        let start = at.checked_sub(1).and_then(|i| self.functions.get(i)).copied().unwrap_or(0);
        let end = self.functions.get(at).copied().unwrap_or(self.prog.len());
        (start, end)
    }

    fn check_func_info(&mut self, blob: &[u8], func_info: &[FuncInfo]) -> Check<()> {
        let btf = match Btf::parse(blob) {
            Ok(btf) => btf,
            Err(err) => return reject("btf", format!("btf load failed: {err}")),
        };
        if func_info.len() != self.functions.len() {
            return reject(
                "func_info_count",
                format!(
                    "number of funcs in func_info doesn't match number of subprogs ({} != {})",
                    func_info.len(),
                    self.functions.len()
                ),
            );
        }
        for (info, &start) in func_info.iter().zip(&self.functions) {
            if info.insn_off as usize != self.starts[start] {
                return reject(
                    "func_info_off",
                    format!("func_info offset {} doesn't match subprog start {}", info.insn_off, self.starts[start]),
                );
            }
            let proto = btf
                .get(info.type_id)
                .filter(|ty| ty.kind() == Some(Kind::Func))
                .and_then(|func| btf.get(func.size_or_type));
            let Some(proto) = proto else {
                return reject("func_info_type", format!("invalid type id {} in func info", info.type_id));
            };
            if proto.vlen() > MAX_FUNC_ARGS {
                return reject(
                    "func_info_args",
                    format!("type id {} takes {} arguments, at most {MAX_FUNC_ARGS}", info.type_id, proto.vlen()),
                );
            }
        }
        self.hit("btf:func_info");
        Ok(())
    }

    fn verify(&mut self) -> Check<()> {
        if self.prog.is_empty() {
            return reject("empty", "empty program");
        }
        self.functions = self.discover_functions()?;
        if let Some((blob, func_info)) = self.func_info {
            self.check_func_info(blob, func_info)?;
        }
        self.walk(0, Frame::entry())
    }

    /// Explore every path through the function that starts at `start`.
    fn walk(&mut self, start: usize, entry: Frame) -> Check<()> {
        let (_, end) = self.function_bounds(start);
        let mut pending = vec![(start, entry)];
        while let Some((mut pc, mut frame)) = pending.pop() {
            loop {
                if pc >= end {
                    return reject("fall_through", "last insn is not an exit or jmp");
                }
                self.processed += 1;
                if self.processed > self.complexity_limit {
                    return reject(
                        "complexity",
                        format!("BPF program is too large. Processed {} insn", self.processed),
                    );
                }
                let line = format!("{pc}: {}", self.prog[pc]);
                self.log_line(line);
                match self.step(pc, &mut frame)? {
                    Flow::Next => pc += 1,
                    Flow::Goto(target) => pc = target,
                    Flow::Fork { target, taken } => {
                        pending.push((target, taken));
                        pc += 1;
                    }
                    Flow::Exit => break,
                }
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Check<()> {
        self.functions = self.discover_functions()?;
        self.run_function(0, Frame::entry()).map(|_| ())
    }

    /// Execute from `start` to the function's exit and return R0.
    fn run_function(&mut self, start: usize, mut frame: Frame) -> Check<Value> {
        let (_, end) = self.function_bounds(start);
        let mut pc = start;
        while self.steps < EXEC_STEP_LIMIT {
            self.steps += 1;
            if pc >= end {
                return reject("fall_through", "execution ran off the end of the program");
            }
            match self.step(pc, &mut frame)? {
                // Concrete values always decide a branch.
                Flow::Next | Flow::Fork { .. } => pc += 1,
                Flow::Goto(target) => pc = target,
                Flow::Exit => return Ok(frame.get(Register::R0)),
            }
        }
        reject("step_limit", "execution step limit exceeded")
    }

    fn step(&mut self, pc: usize, frame: &mut Frame) -> Check<Flow> {
        let ins = self.prog[pc];
        match ins.class {
            ebpf::CLASS_ALU | ebpf::CLASS_ALU64 => self.alu(&ins, frame).map(|_| Flow::Next),
            ebpf::CLASS_JMP | ebpf::CLASS_JMP32 => self.jmp(pc, &ins, frame),
            ebpf::CLASS_LDX => self.load(&ins, frame).map(|_| Flow::Next),
            ebpf::CLASS_ST | ebpf::CLASS_STX => self.store(&ins, frame).map(|_| Flow::Next),
            ebpf::CLASS_LD => self.ld_wide(pc, &ins, frame).map(|_| Flow::Next),
            other => reject("bad_class", format!("unknown insn class {other}")),
        }
    }

    fn operand(&self, ins: &Instruction, frame: &Frame) -> Check<Value> {
        if ins.source == ebpf::SRC_REG {
            frame.read(ins.src)
        } else {
            Ok(Value::Scalar(Some(ins.imm as i64 as u64)))
        }
    }

    fn alu(&mut self, ins: &Instruction, frame: &mut Frame) -> Check<()> {
        let is64 = ins.class == ebpf::CLASS_ALU64;
        let width = if is64 { "alu64" } else { "alu32" };
        let op = ins.code;
        let name = ebpf::alu_op_name(op);
        if op == ebpf::ALU_END {
            return reject("alu_end", "BPF_END is not supported");
        }
        if op > ebpf::ALU_END {
            return reject("alu_bad_op", format!("invalid BPF_ALU opcode {op:#x}"));
        }
        if ins.dst == Register::R10 {
            return reject("fp_write", "frame pointer is read only");
        }
        if op == ebpf::ALU_NEG && ins.source == ebpf::SRC_REG {
            return reject("neg_reg", "BPF_NEG uses reserved fields");
        }
        let src = self.operand(ins, frame)?;

        if op == ebpf::ALU_MOV {
            if !is64 && src.is_pointer() {
                return reject("ptr_mov32", format!("{} partial copy of pointer", ins.src));
            }
            let v = match src {
                Value::Scalar(Some(x)) if !is64 => Value::Scalar(Some(x as u32 as u64)),
                other => other,
            };
            self.hit(&format!("{width}:{name}:{}", v.kind()));
            frame.set(ins.dst, v);
            return Ok(());
        }

        let dst = frame.read(ins.dst)?;
        if ins.source == ebpf::SRC_IMM {
            let bits = if is64 { 64 } else { 32 };
            if matches!(op, ebpf::ALU_LSH | ebpf::ALU_RSH | ebpf::ALU_ARSH) && !(0..bits).contains(&ins.imm) {
                return reject("shift_range", format!("invalid shift {}", ins.imm));
            }
            if matches!(op, ebpf::ALU_DIV | ebpf::ALU_MOD) && ins.imm == 0 {
                return reject("div_zero", "division by zero");
            }
        }

        if dst.is_pointer() || src.is_pointer() {
            let v = self.pointer_alu(ins, is64, dst, src)?;
            frame.set(ins.dst, v);
            return Ok(());
        }

        let result = match (dst.known(), src.known()) {
            (Some(a), Some(b)) => Value::Scalar(alu_eval(op, is64, a, b)),
            _ => Value::Scalar(None),
        };
        let state = if result.known().is_some() { "known" } else { "unknown" };
        self.hit(&format!("{width}:{name}:{state}"));
        frame.set(ins.dst, result);
        Ok(())
    }

    fn pointer_alu(&mut self, ins: &Instruction, is64: bool, dst: Value, src: Value) -> Check<Value> {
        let op = ins.code;
        let name = ebpf::alu_op_name(op);
        if !is64 {
            return reject("ptr_alu32", format!("{} 32-bit pointer arithmetic prohibited", ins.dst));
        }
        let (ptr, scalar) = match (dst.is_pointer(), src.is_pointer()) {
            (true, false) if matches!(op, ebpf::ALU_ADD | ebpf::ALU_SUB) => (dst, src),
            (false, true) if op == ebpf::ALU_ADD => (src, dst),
            _ => {
                return reject(
                    "ptr_alu_op",
                    format!("{} pointer arithmetic with {name} operator prohibited", ins.dst),
                );
            }
        };
        match ptr {
            Value::MapValueOrNull { .. } => {
                return reject(
                    "ptr_or_null_alu",
                    format!("{} pointer arithmetic on map_value_or_null prohibited, null-check it first", ins.dst),
                );
            }
            Value::Ctx | Value::Map(_) | Value::Func(_) => {
                return reject(
                    "ptr_alu_kind",
                    format!("{} pointer arithmetic on {} prohibited", ins.dst, ptr.kind()),
                );
            }
            _ => {}
        }
        let Some(delta) = scalar.known() else {
            return reject(
                "ptr_unbounded",
                format!(
                    "math between {} pointer and register with unbounded min value is not allowed",
                    ptr.kind()
                ),
            );
        };
        let delta = if op == ebpf::ALU_SUB {
            (delta as i64).wrapping_neg()
        } else {
            delta as i64
        };
        self.hit(&format!("alu64:{name}:{}", ptr.kind()));
        Ok(match ptr {
            Value::Stack(off) => Value::Stack(off.wrapping_add(delta)),
            Value::ParentStack(off) => Value::ParentStack(off.wrapping_add(delta)),
            Value::MapValue { map, elem, off } => Value::MapValue {
                map,
                elem,
                off: off.wrapping_add(delta),
            },
            other => other,
        })
    }

    fn target(&self, pc: usize, offset: i16) -> Check<usize> {
        if offset < 0 {
            return reject("back_edge", format!("back-edge from insn {pc}"));
        }
        let word = self.starts[pc] + 1 + offset as usize;
        match self.starts.binary_search(&word) {
            Ok(idx) if idx >= self.function_bounds(pc).1 => {
                reject("jump_range", format!("jump out of range from insn {pc} to {idx}"))
            }
            Ok(idx) => Ok(idx),
            Err(_) if word >= self.total_words => {
                reject("jump_range", format!("jump out of range from insn {pc} to {word}"))
            }
            Err(_) => reject("jump_ldimm64", format!("jump into the middle of ldimm64 insn {word}")),
        }
    }

    fn jmp(&mut self, pc: usize, ins: &Instruction, frame: &mut Frame) -> Check<Flow> {
        let is32 = ins.class == ebpf::CLASS_JMP32;
        let width = if is32 { "jmp32" } else { "jmp" };
        let op = ins.code;
        if is32 && matches!(op, ebpf::JMP_JA | ebpf::JMP_CALL | ebpf::JMP_EXIT) {
            return reject("jmp32_op", format!("invalid BPF_JMP32 opcode {op:#x}"));
        }
        match op {
            ebpf::JMP_EXIT => {
                let r0 = frame.get(Register::R0);
                if r0 == Value::Uninit {
                    return reject("exit_uninit", "R0 !read_ok");
                }
                if r0.is_pointer() {
                    return reject("exit_leak", "R0 leaks addr as return value");
                }
                if self.parent.is_none() {
                    self.hit("exit:ok");
                    return Ok(Flow::Exit);
                }
                if !self.concrete && !matches!(r0.known(), Some(0 | 1)) {
                    return reject("callback_ret", "At callback return the register R0 should have been in [0, 1]");
                }
                self.hit("exit:callback");
                Ok(Flow::Exit)
            }
            ebpf::JMP_CALL => {
                self.call(ins, frame)?;
                Ok(Flow::Next)
            }
            ebpf::JMP_JA => {
                let target = self.target(pc, ins.offset)?;
                self.hit("jmp:ja");
                Ok(Flow::Goto(target))
            }
            op if op > ebpf::JMP_JSLE => reject("jmp_bad_op", format!("invalid BPF_JMP opcode {op:#x}")),
            op => {
                let name = ebpf::jmp_op_name(op);
                let dst = frame.read(ins.dst)?;
                let src = self.operand(ins, frame)?;
                let target = self.target(pc, ins.offset)?;

                if let Value::MapValueOrNull { map, off } = dst {
                    if !is32 && src == Value::Scalar(Some(0)) && matches!(op, ebpf::JMP_JEQ | ebpf::JMP_JNE) {
                        self.hit(&format!("jmp:{name}:null_check"));
                        let non_null = Value::MapValue { map, elem: 0, off };
                        let null = Value::Scalar(Some(0));
                        let (on_taken, on_fall) = if op == ebpf::JMP_JNE { (non_null, null) } else { (null, non_null) };
                        let mut taken = frame.clone();
                        taken.set(ins.dst, on_taken);
                        frame.set(ins.dst, on_fall);
                        return Ok(Flow::Fork { target, taken });
                    }
                }

                let (a, b) = if self.concrete {
                    (dst.address(), src.address())
                } else {
                    (dst.known(), src.known())
                };
                let decision = match (a, b) {
                    (Some(a), Some(b)) => jmp_eval(op, is32, a, b),
                    _ => None,
                };
                match decision {
                    Some(true) => {
                        self.hit(&format!("{width}:{name}:taken"));
                        Ok(Flow::Goto(target))
                    }
                    Some(false) => {
                        self.hit(&format!("{width}:{name}:fallthrough"));
                        Ok(Flow::Next)
                    }
                    None => {
                        let kind = if dst.is_pointer() { dst.kind() } else { "scalar" };
                        self.hit(&format!("{width}:{name}:{kind}:both"));
                        Ok(Flow::Fork {
                            target,
                            taken: frame.clone(),
                        })
                    }
                }
            }
        }
    }

    fn call(&mut self, ins: &Instruction, frame: &mut Frame) -> Check<()> {
        let result = match ins.imm {
            ebpf::HELPER_MAP_LOOKUP => self.map_lookup(frame)?,
            ebpf::HELPER_LOOP => self.bpf_loop(frame)?,
            other => return reject("helper_unknown", format!("invalid func unknown#{other}")),
        };
        for r in [Register::R1, Register::R2, Register::R3, Register::R4, Register::R5] {
            frame.set(r, Value::Uninit);
        }
        frame.set(Register::R0, result);
        Ok(())
    }

    fn map_lookup(&mut self, frame: &Frame) -> Check<Value> {
        let map = match frame.read(Register::R1)? {
            Value::Map(map) => map,
            other => return reject("helper_arg1", format!("R1 type={} expected=map_ptr", other.kind())),
        };
        let key_off = match frame.read(Register::R2)? {
            Value::Stack(off) => off,
            other => return reject("helper_arg2", format!("R2 type={} expected=fp", other.kind())),
        };
        if key_off < -STACK_SIZE || key_off + 4 > 0 {
            return reject("helper_key_bounds", format!("invalid indirect access to stack off={key_off} size=4"));
        }
        let key = frame.stack.read(key_off, 4).map_err(|_| Reject {
            check: "helper_key_uninit",
            message: format!("invalid indirect read from stack off {key_off}"),
        })?;

        let result = if self.concrete {
            let len = self.maps.get(&map).map_or(0, |m| m.elements.len() as u64);
            match key.known() {
                Some(k) if k < len => Value::MapValue {
                    map,
                    elem: k as u32,
                    off: 0,
                },
                _ => Value::Scalar(Some(0)),
            }
        } else {
            Value::MapValueOrNull { map, off: 0 }
        };
        self.hit("call:map_lookup_elem");
        Ok(result)
    }

    /// `bpf_loop`: the callback sees the caller's stack through R2, and the
    /// caller's bytes it can reach are unknown once the loop returns.
    fn bpf_loop(&mut self, frame: &mut Frame) -> Check<Value> {
        if self.parent.is_some() {
            return reject("loop_nested", "bpf_loop is not allowed inside a loop callback");
        }
        let iterations = match frame.read(Register::R1)? {
            Value::Scalar(n) => n,
            other => return reject("helper_arg1", format!("R1 type={} expected=scalar", other.kind())),
        };
        let callback = match frame.read(Register::R2)? {
            Value::Func(idx) => idx,
            other => return reject("loop_callback", format!("R2 type={} expected=func", other.kind())),
        };
        let ctx = match frame.read(Register::R3)? {
            Value::Stack(off) => off,
            other => return reject("loop_ctx", format!("R3 type={} expected=fp", other.kind())),
        };
        if frame.read(Register::R4)? != Value::Scalar(Some(0)) {
            return reject("loop_flags", "R4 flags must be zero");
        }
        self.hit("call:loop");

        let before = self.stale_callback_stack.then(|| frame.stack.clone());
        self.parent = Some(std::mem::replace(&mut frame.stack, Stack::new()));
        let outcome = if self.concrete {
            self.run_callback(callback, iterations.unwrap_or(0), ctx)
        } else {
            self.walk(callback, Frame::callback(Value::Scalar(None), ctx))
                .map(|_| Value::Scalar(None))
        };
        if let Some(stack) = self.parent.take() {
            frame.stack = stack;
        }
        if let Some(before) = before {
            frame.stack = before;
        }
        outcome
    }

    fn run_callback(&mut self, callback: usize, iterations: u64, ctx: i64) -> Check<Value> {
        let iterations = iterations.min(LOOP_MAX_ITERATIONS);
        for i in 0..iterations {
            let ret = self.run_function(callback, Frame::callback(Value::Scalar(Some(i)), ctx))?;
            if ret.known() == Some(1) {
                return Ok(Value::Scalar(Some(i + 1)));
            }
        }
        Ok(Value::Scalar(Some(iterations)))
    }

    fn mem_access(&mut self, base: Value, reg: Register, off: i16, size: i64, write: bool) -> Check<Access> {
        let rw = if write { "write" } else { "read" };
        match base {
            Value::Stack(o) => {
                let at = o + i64::from(off);
                if at < -STACK_SIZE || at + size > 0 {
                    return reject("stack_bounds", format!("invalid stack off={at} size={size}"));
                }
                self.hit(&format!("mem:stack:{rw}:{size}"));
                Ok(Access::Stack(at))
            }
            Value::ParentStack(o) => {
                let at = o + i64::from(off);
                if self.parent.is_none() || at < -STACK_SIZE || at + size > 0 {
                    return reject("parent_stack_bounds", format!("invalid caller stack off={at} size={size}"));
                }
                self.hit(&format!("mem:parent_stack:{rw}:{size}"));
                Ok(Access::ParentStack(at))
            }
            Value::MapValue { map, elem, off: o } => {
                let at = o + i64::from(off);
                let in_bounds = at >= 0 && at + size <= MAP_VALUE_SIZE;
                if !in_bounds && !self.concrete && !(write && self.unchecked_map_stores) {
                    return reject(
                        "map_value_bounds",
                        format!("invalid access to map value, value_size={MAP_VALUE_SIZE} off={at} size={size}"),
                    );
                }
                self.hit(&format!("mem:map_value:{rw}:{size}"));
                Ok(Access::MapValue { map, elem, off: at })
            }
            other => reject("mem_kind", format!("{reg} invalid mem access '{}'", other.kind())),
        }
    }

    fn load(&mut self, ins: &Instruction, frame: &mut Frame) -> Check<()> {
        if ins.code & 0xe0 != ebpf::MODE_MEM {
            return reject("ldx_mode", "BPF_LDX uses reserved fields");
        }
        if ins.dst == Register::R10 {
            return reject("fp_write", "frame pointer is read only");
        }
        let size = size_bytes(ins.code);
        let base = frame.read(ins.src)?;
        let value = match self.mem_access(base, ins.src, ins.offset, size, false)? {
            Access::Stack(at) => frame.stack.read(at, size)?,
            Access::ParentStack(at) => match &self.parent {
                Some(stack) => stack.read(at, size)?,
                None => return reject("parent_stack_bounds", "caller stack is not reachable here"),
            },
            Access::MapValue { map, elem, off } => {
                if self.concrete {
                    let at = i64::from(elem) * MAP_VALUE_SIZE + off;
                    Value::Scalar(self.maps.get(&map).map(|m| m.read(at, size)))
                } else {
                    Value::Scalar(None)
                }
            }
        };
        let value = match value {
            Value::Scalar(Some(v)) => Value::Scalar(Some(truncate(v, size))),
            other => other,
        };
        frame.set(ins.dst, value);
        Ok(())
    }

    fn store(&mut self, ins: &Instruction, frame: &mut Frame) -> Check<()> {
        if ins.code & 0xe0 != ebpf::MODE_MEM {
            return reject("st_mode", format!("unsupported store mode {:#x}", ins.code & 0xe0));
        }
        let size = size_bytes(ins.code);
        let base = frame.read(ins.dst)?;
        let value = if ins.class == ebpf::CLASS_ST {
            Value::Scalar(Some(ins.imm as i64 as u64))
        } else {
            frame.read(ins.src)?
        };
        match self.mem_access(base, ins.dst, ins.offset, size, true)? {
            Access::Stack(at) => {
                if value.is_pointer() && (size != 8 || at % 8 != 0) {
                    return reject("spill_size", "invalid size of register spill");
                }
                frame.stack.write(at, size, value, self.concrete);
            }
            Access::ParentStack(at) => {
                if value.is_pointer() && (size != 8 || at % 8 != 0) {
                    return reject("spill_size", "invalid size of register spill");
                }
                // The callback may run any number of times, so what it leaves
                // behind is unknown to the verifier.
                let value = if self.concrete { value } else { Value::Scalar(None) };
                let concrete = self.concrete;
                if let Some(stack) = self.parent.as_mut() {
                    stack.write(at, size, value, concrete);
                }
            }
            Access::MapValue { map, elem, off } => {
                if value.is_pointer() {
                    return reject("map_leak", format!("{} leaks addr into map", ins.src));
                }
                if self.concrete {
                    let at = i64::from(elem) * MAP_VALUE_SIZE + off;
                    let raw = truncate(value.known().unwrap_or(0), size);
                    let landed = self.maps.get_mut(&map).is_some_and(|m| m.write(at, size, raw));
                    if !landed {
                        debug!(map, at, size, "store landed outside the map value");
                    }
                }
            }
        }
        Ok(())
    }

    fn ld_wide(&mut self, pc: usize, ins: &Instruction, frame: &mut Frame) -> Check<()> {
        if !ins.is_wide_load() {
            return reject("ld_abs", "BPF_LD_[ABS|IND] instructions not allowed for this program type");
        }
        if ins.dst == Register::R10 {
            return reject("fp_write", "frame pointer is read only");
        }
        let value = if ins.src == ebpf::PSEUDO_MAP_FD {
            let fd = ins.imm as u32;
            if !self.maps.contains_key(&fd) {
                return reject("map_fd", format!("fd {} is not pointing to valid bpf_map", ins.imm));
            }
            self.hit("ld_imm64:map_fd");
            Value::Map(fd)
        } else if ins.src == ebpf::PSEUDO_FUNC {
            let word = self.starts[pc] as i64 + 1 + i64::from(ins.imm);
            let target = usize::try_from(word).ok().and_then(|w| self.starts.binary_search(&w).ok());
            match target {
                Some(idx) if idx > 0 && self.functions.binary_search(&idx).is_ok() => {
                    self.hit("ld_imm64:func");
                    Value::Func(idx)
                }
                _ => return reject("func_target", format!("insn {pc}: function pointer to invalid destination {word}")),
            }
        } else if ins.src == Register::R0 {
            self.hit("ld_imm64:scalar");
            Value::Scalar(ins.wide_imm().map(|v| v as u64))
        } else {
            return reject("ld_imm64_src", "unrecognized bpf_ld_imm64 insn");
        };
        frame.set(ins.dst, value);
        Ok(())
    }
}

/// Classic program checks, in the spirit of `bpf_check_classic`.
fn verify_classic(words: &[u64], coverage: &mut BTreeSet<u64>) -> Check<()> {
    if words.is_empty() || words.len() > CLASSIC_MAX_INSNS {
        return reject("cbpf_len", format!("program length {} out of range", words.len()));
    }
    let mut hit = |label: String| {
        coverage.insert(stable_edge(&label));
    };
    let mut written = [false; CLASSIC_MEMWORDS as usize];
    let len = words.len();

    for (i, &w) in words.iter().enumerate() {
        let code = (w & 0xffff) as u16;
        let jt = ((w >> 16) & 0xff) as usize;
        let jf = ((w >> 24) & 0xff) as usize;
        let k = (w >> 32) as u32;
        let class = (code & 0x07) as u8;
        let bad_opcode = || reject::<()>("cbpf_opcode", format!("insn {i}: unknown opcode {code:#06x}"));

        match class {
            classic::CLASS_LD | classic::CLASS_LDX => {
                let mode = (code & 0xe0) as u8;
                let size = (code & 0x18) as u8;
                if size == 0x18 {
                    return bad_opcode();
                }
                match mode {
                    classic::MODE_IMM | classic::MODE_LEN => {}
                    classic::MODE_ABS | classic::MODE_IND if class == classic::CLASS_LD => {
                        let off = k as i32;
                        if off < 0 && off >= classic::EXTENSION_OFFSET {
                            if off - classic::EXTENSION_OFFSET > CLASSIC_MAX_ANCILLARY {
                                return reject("cbpf_ancillary", format!("insn {i}: unknown ancillary load {off}"));
                            }
                            hit("cbpf:ld:ancillary".to_string());
                        }
                    }
                    classic::MODE_MEM => {
                        if k >= CLASSIC_MEMWORDS {
                            return reject("cbpf_memslot", format!("insn {i}: invalid scratch slot {k}"));
                        }
                        if !written[k as usize] {
                            return reject("cbpf_mem_uninit", format!("insn {i}: read of uninitialized M[{k}]"));
                        }
                    }
                    classic::MODE_MSH if class == classic::CLASS_LDX && size == classic::SIZE_B => {}
                    _ => return bad_opcode(),
                }
                hit(format!("cbpf:ld:{class}:{mode:#x}:{size:#x}"));
            }
            classic::CLASS_ST | classic::CLASS_STX => {
                if !matches!((code & 0xf8) as u8, 0 | classic::MODE_MEM) {
                    return bad_opcode();
                }
                if k >= CLASSIC_MEMWORDS {
                    return reject("cbpf_memslot", format!("insn {i}: invalid scratch slot {k}"));
                }
                written[k as usize] = true;
                hit(format!("cbpf:st:{class}"));
            }
            classic::CLASS_ALU => {
                let op = (code & 0xf0) as u8;
                let from_k = code & 0x08 == 0;
                if op > classic::ALU_XOR {
                    return bad_opcode();
                }
                if from_k && matches!(op, classic::ALU_DIV | classic::ALU_MOD) && k == 0 {
                    return reject("cbpf_div_zero", format!("insn {i}: division by zero"));
                }
                if from_k && matches!(op, classic::ALU_LSH | classic::ALU_RSH) && k >= 32 {
                    return reject("cbpf_shift", format!("insn {i}: invalid shift {k}"));
                }
                hit(format!("cbpf:alu:{op:#x}:{from_k}"));
            }
            classic::CLASS_JMP => {
                let op = (code & 0xf0) as u8;
                if op == classic::JMP_JA {
                    if i + 1 + jt >= len {
                        return reject("cbpf_jump_range", format!("insn {i}: jump out of range"));
                    }
                } else if op <= classic::JMP_JSET {
                    if i + 1 + jt >= len || i + 1 + jf >= len {
                        return reject("cbpf_jump_range", format!("insn {i}: jump out of range"));
                    }
                } else {
                    return bad_opcode();
                }
                hit(format!("cbpf:jmp:{op:#x}"));
            }
            classic::CLASS_RET => {
                if code & 0xe0 != 0 {
                    return bad_opcode();
                }
                hit(format!("cbpf:ret:{:#x}", code & 0x18));
            }
            _ => {
                let op = (code & 0xf8) as u8;
                if op != classic::MISC_TAX && op != classic::MISC_TXA {
                    return bad_opcode();
                }
                hit(format!("cbpf:misc:{op:#x}"));
            }
        }
    }

    if words[len - 1] & 0x07 != u64::from(classic::CLASS_RET) {
        return reject("cbpf_no_ret", "last instruction is not a return");
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum LoadedProgram {
    Extended(Vec<Instruction>),
    Classic,
}

/// Kernel-free [`Executor`] used by the CLI and the test suite.
#[derive(Debug)]
pub struct ModelVerifier {
    maps: HashMap<u32, MapState>,
    programs: HashMap<u32, LoadedProgram>,
    next_handle: u32,
    coverage_enabled: bool,
    complexity_limit: usize,
    unchecked_map_stores: bool,
    stale_callback_stack: bool,
    failing_runs: u32,
}

impl Default for ModelVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelVerifier {
    pub fn new() -> Self {
        Self {
            maps: HashMap::new(),
            programs: HashMap::new(),
            next_handle: FIRST_HANDLE,
            coverage_enabled: true,
            complexity_limit: DEFAULT_COMPLEXITY_LIMIT,
            unchecked_map_stores: false,
            stale_callback_stack: false,
            failing_runs: 0,
        }
    }

    pub fn with_coverage(mut self, enabled: bool) -> Self {
        self.coverage_enabled = enabled;
        self
    }

    pub fn with_complexity_limit(mut self, limit: usize) -> Self {
        self.complexity_limit = limit;
        self
    }

    /// Skip bounds checks on stores through map value pointers.
    ///
    /// This plants a verifier bug that the map check footer detects at
    /// execution time.
    pub fn with_unchecked_map_stores(mut self) -> Self {
        self.unchecked_map_stores = true;
        self
    }

    /// Keep the caller's stack as it was before `bpf_loop`, ignoring what
    /// the callback wrote through its context pointer.
    ///
    /// Another planted bug; the loop strategy's map check catches it.
    pub fn with_stale_callback_stack(mut self) -> Self {
        self.stale_callback_stack = true;
        self
    }

    /// Report the next `n` executions as not triggered.
    pub fn with_failing_runs(mut self, n: u32) -> Self {
        self.failing_runs = n;
        self
    }

    pub fn open_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn loaded_programs(&self) -> usize {
        self.programs.len()
    }

    fn alloc_handle(&mut self) -> u32 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn validate_extended(&mut self, bytecode: &[u64], func_info: Option<(&[u8], &[FuncInfo])>) -> ValidationResult {
        let instructions = match decode_program(bytecode) {
            Ok(instructions) => instructions,
            Err(err) => {
                let coverage = BTreeSet::from([stable_edge("reject:decode")]);
                return self.finish(None, err.to_string(), coverage);
            }
        };
        let (outcome, mut log, mut coverage, processed) = {
            let mut walker = Walker::new(&instructions, &mut self.maps, false);
            walker.unchecked_map_stores = self.unchecked_map_stores;
            walker.stale_callback_stack = self.stale_callback_stack;
            walker.complexity_limit = self.complexity_limit;
            walker.func_info = func_info;
            let outcome = walker.verify();
            (outcome, walker.log, walker.coverage, walker.processed)
        };
        match outcome {
            Ok(()) => {
                log.push(format!("processed {processed} insns"));
                self.finish(Some(LoadedProgram::Extended(instructions)), log.join("\n"), coverage)
            }
            Err(rej) => {
                coverage.insert(stable_edge(&format!("reject:{}", rej.check)));
                log.push(rej.message);
                self.finish(None, log.join("\n"), coverage)
            }
        }
    }

    fn finish(&mut self, accepted: Option<LoadedProgram>, log: String, coverage: BTreeSet<u64>) -> ValidationResult {
        let is_valid = accepted.is_some();
        let program_handle = accepted.map(|p| {
            let h = self.alloc_handle();
            self.programs.insert(h, p);
            ProgramHandle(h)
        });
        let (coverage_addresses, did_collect_coverage) = if self.coverage_enabled {
            (coverage.into_iter().collect(), true)
        } else {
            (Vec::new(), false)
        };
        ValidationResult {
            is_valid,
            program_handle,
            verifier_log: log,
            coverage_addresses,
            did_collect_coverage,
        }
    }
}

impl Executor for ModelVerifier {
    fn create_map(&mut self, size: u32) -> Result<MapHandle, ResourceError> {
        if size == 0 {
            return Err(ResourceError::MapCreation("array map needs at least one element".to_string()));
        }
        let h = self.alloc_handle();
        self.maps.insert(
            h,
            MapState {
                elements: vec![0; size as usize],
            },
        );
        Ok(MapHandle(h))
    }

    fn close_map(&mut self, map: MapHandle) -> Result<(), ResourceError> {
        self.maps.remove(&map.0).map(|_| ()).ok_or(ResourceError::UnknownMap(map.0))
    }

    fn map_elements(&self, map: MapHandle) -> Result<Vec<u64>, ResourceError> {
        self.maps
            .get(&map.0)
            .map(|m| m.elements.clone())
            .ok_or(ResourceError::UnknownMap(map.0))
    }

    fn validate(&mut self, dialect: Dialect, bytecode: &[u64]) -> Result<ValidationResult, ResourceError> {
        match dialect {
            Dialect::Extended => Ok(self.validate_extended(bytecode, None)),
            Dialect::Classic => {
                let mut coverage = BTreeSet::new();
                match verify_classic(bytecode, &mut coverage) {
                    Ok(()) => Ok(self.finish(Some(LoadedProgram::Classic), String::new(), coverage)),
                    Err(rej) => {
                        coverage.insert(stable_edge(&format!("reject:{}", rej.check)));
                        Ok(self.finish(None, rej.message, coverage))
                    }
                }
            }
        }
    }

    fn validate_functions(
        &mut self,
        bytecode: &[u64],
        btf: &[u8],
        func_info: &[FuncInfo],
    ) -> Result<ValidationResult, ResourceError> {
        Ok(self.validate_extended(bytecode, Some((btf, func_info))))
    }

    fn execute(&mut self, program: ProgramHandle, maps: &[MapHandle]) -> Result<ExecutionResult, ResourceError> {
        let loaded = self
            .programs
            .get(&program.0)
            .cloned()
            .ok_or(ResourceError::UnknownProgram(program.0))?;
        if let Some(missing) = maps.iter().find(|m| !self.maps.contains_key(&m.0)) {
            return Err(ResourceError::UnknownMap(missing.0));
        }
        if self.failing_runs > 0 {
            self.failing_runs -= 1;
            return Ok(ExecutionResult::default());
        }

        let succeeded = match &loaded {
            LoadedProgram::Extended(instructions) => {
                let mut walker = Walker::new(instructions, &mut self.maps, true);
                match walker.run() {
                    Ok(()) => true,
                    Err(fault) => {
                        debug!(program = program.0, "execution faulted: {}", fault.message);
                        false
                    }
                }
            }
            LoadedProgram::Classic => true,
        };
        let map_elements = maps
            .iter()
            .map(|m| self.maps.get(&m.0).map(|s| s.elements.clone()).unwrap_or_default())
            .collect();
        Ok(ExecutionResult {
            succeeded,
            map_elements,
        })
    }

    fn close_program(&mut self, program: ProgramHandle) -> Result<(), ResourceError> {
        self.programs
            .remove(&program.0)
            .map(|_| ())
            .ok_or(ResourceError::UnknownProgram(program.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classic::Instruction as Cins;
    use crate::btf::LoopCallbackTypes;
    use crate::encoding::{encode_classic_program, encode_program};
    use Register::*;

    fn words(prog: &[Instruction]) -> Vec<u64> {
        encode_program(prog).expect("encode")
    }

    /// Map lookup, null check, then `*(u64 *)(value + r8) = 0xCAFE`.
    fn map_check(fd: i32, delta: i32) -> Vec<Instruction> {
        vec![
            Instruction::mov64(R8, delta),
            Instruction::ld_map_fd(R9, fd),
            Instruction::st_w(R10, 0, -4),
            Instruction::mov64(R2, R10),
            Instruction::add64(R2, -4),
            Instruction::mov64(R1, R9),
            Instruction::call(ebpf::HELPER_MAP_LOOKUP),
            Instruction::jmp_ne(R0, 0, 1),
            Instruction::exit(),
            Instruction::add64(R0, R8),
            Instruction::st_dw(R0, 0xCAFE, 0),
            Instruction::mov64(R0, 0),
            Instruction::exit(),
        ]
    }

    #[test]
    fn trivial_program_is_accepted_with_coverage() {
        let mut model = ModelVerifier::new();
        let res = model
            .validate(Dialect::Extended, &words(&[Instruction::mov64(R0, 0), Instruction::exit()]))
            .expect("validate");
        assert!(res.is_valid, "{}", res.verifier_log);
        assert!(res.did_collect_coverage);
        assert!(!res.coverage_addresses.is_empty());
        assert!(res.program_handle.is_some());
        assert!(res.verifier_log.contains("BPF_EXIT_INSN()"));
    }

    #[test]
    fn coverage_is_deterministic_and_program_sensitive() {
        let mut model = ModelVerifier::new();
        let a = words(&[Instruction::mov64(R0, 0), Instruction::exit()]);
        let b = words(&[Instruction::mov64(R0, 1), Instruction::add64(R0, 2), Instruction::exit()]);
        let first = model.validate(Dialect::Extended, &a).expect("a");
        let again = model.validate(Dialect::Extended, &a).expect("a again");
        let other = model.validate(Dialect::Extended, &b).expect("b");
        assert_eq!(first.coverage_addresses, again.coverage_addresses);
        assert_ne!(first.coverage_addresses, other.coverage_addresses);
    }

    #[test]
    fn uninitialized_return_value_is_rejected() {
        let mut model = ModelVerifier::new();
        let res = model.validate(Dialect::Extended, &words(&[Instruction::exit()])).expect("validate");
        assert!(!res.is_valid);
        assert!(res.program_handle.is_none());
        assert!(res.verifier_log.contains("R0 !read_ok"), "{}", res.verifier_log);
    }

    #[test]
    fn unchecked_map_value_dereference_is_rejected() {
        let mut model = ModelVerifier::new();
        let map = model.create_map(1).expect("map");
        let prog = [
            Instruction::ld_map_fd(R1, map.fd()),
            Instruction::st_w(R10, 0, -4),
            Instruction::mov64(R2, R10),
            Instruction::add64(R2, -4),
            Instruction::call(ebpf::HELPER_MAP_LOOKUP),
            Instruction::ld_dw(R0, R0, 0),
            Instruction::exit(),
        ];
        let res = model.validate(Dialect::Extended, &words(&prog)).expect("validate");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("map_value_or_null"), "{}", res.verifier_log);
    }

    #[test]
    fn in_bounds_map_store_runs_and_writes_the_marker() {
        let mut model = ModelVerifier::new();
        let map = model.create_map(1).expect("map");
        let res = model.validate(Dialect::Extended, &words(&map_check(map.fd(), 0))).expect("validate");
        assert!(res.is_valid, "{}", res.verifier_log);

        let handle = res.program_handle.expect("handle");
        let out = model.execute(handle, &[map]).expect("execute");
        assert!(out.succeeded);
        assert_eq!(out.map_elements, vec![vec![0xCAFE]]);
        model.close_program(handle).expect("close");
        assert_eq!(model.loaded_programs(), 0);
    }

    #[test]
    fn out_of_bounds_map_store_is_rejected() {
        let mut model = ModelVerifier::new();
        let map = model.create_map(1).expect("map");
        let res = model.validate(Dialect::Extended, &words(&map_check(map.fd(), 16))).expect("validate");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("invalid access to map value"), "{}", res.verifier_log);
    }

    #[test]
    fn planted_bug_lets_the_store_escape_the_value() {
        let mut model = ModelVerifier::new().with_unchecked_map_stores();
        let map = model.create_map(1).expect("map");
        let res = model.validate(Dialect::Extended, &words(&map_check(map.fd(), 16))).expect("validate");
        assert!(res.is_valid, "{}", res.verifier_log);
        let out = model
            .execute(res.program_handle.expect("handle"), &[map])
            .expect("execute");
        assert!(out.succeeded);
        assert_eq!(out.map_elements, vec![vec![0]]);
    }

    #[test]
    fn unknown_offsets_on_map_pointers_are_rejected() {
        let mut model = ModelVerifier::new();
        let map = model.create_map(1).expect("map");
        let mut prog = map_check(map.fd(), 0);
        // r8 comes out of a map value, so nothing bounds it.
        prog.splice(
            0..1,
            [
                Instruction::ld_map_fd(R1, map.fd()),
                Instruction::st_w(R10, 0, -4),
                Instruction::mov64(R2, R10),
                Instruction::add64(R2, -4),
                Instruction::call(ebpf::HELPER_MAP_LOOKUP),
                Instruction::jmp_ne(R0, 0, 1),
                Instruction::exit(),
                Instruction::ld_dw(R8, R0, 0),
            ],
        );
        let res = model.validate(Dialect::Extended, &words(&prog)).expect("validate");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("unbounded min value"), "{}", res.verifier_log);
    }

    #[test]
    fn jump_structure_is_checked() {
        let mut model = ModelVerifier::new();
        let back = [Instruction::mov64(R0, 0), Instruction::ja(-2), Instruction::exit()];
        let res = model.validate(Dialect::Extended, &words(&back)).expect("back edge");
        assert!(res.verifier_log.contains("back-edge"), "{}", res.verifier_log);

        let into_wide = [
            Instruction::mov64(R0, 0),
            Instruction::jmp_eq(R0, 1, 1),
            Instruction::ld_imm64(R1, 5),
            Instruction::exit(),
        ];
        let res = model.validate(Dialect::Extended, &words(&into_wide)).expect("ldimm64");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("middle of ldimm64"), "{}", res.verifier_log);
    }

    #[test]
    fn known_branches_are_decided_and_unknown_ones_forked() {
        let mut model = ModelVerifier::new();
        // The taken branch reads the uninitialized R3; it is never explored
        // because R0 is known to be zero.
        let decided = [
            Instruction::mov64(R0, 0),
            Instruction::jmp_eq(R0, 1, 1),
            Instruction::exit(),
            Instruction::add64(R0, R3),
            Instruction::exit(),
        ];
        assert!(model.validate(Dialect::Extended, &words(&decided)).expect("decided").is_valid);

        let map = model.create_map(1).expect("map");
        let forked = [
            Instruction::ld_map_fd(R1, map.fd()),
            Instruction::st_w(R10, 0, -4),
            Instruction::mov64(R2, R10),
            Instruction::add64(R2, -4),
            Instruction::call(ebpf::HELPER_MAP_LOOKUP),
            Instruction::jmp_ne(R0, 0, 2),
            Instruction::mov64(R0, 0),
            Instruction::exit(),
            Instruction::ld_dw(R0, R0, 0),
            Instruction::jmp_eq(R0, 1, 1),
            Instruction::exit(),
            Instruction::add64(R0, R3),
            Instruction::exit(),
        ];
        let res = model.validate(Dialect::Extended, &words(&forked)).expect("forked");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("R3 !read_ok"), "{}", res.verifier_log);
    }

    #[test]
    fn disabled_coverage_reports_nothing() {
        let mut model = ModelVerifier::new().with_coverage(false);
        let res = model
            .validate(Dialect::Extended, &words(&[Instruction::mov64(R0, 0), Instruction::exit()]))
            .expect("validate");
        assert!(res.is_valid);
        assert!(!res.did_collect_coverage);
        assert!(res.coverage_addresses.is_empty());
    }

    #[test]
    fn complexity_limit_rejects_long_walks() {
        let mut model = ModelVerifier::new().with_complexity_limit(3);
        let prog: Vec<Instruction> = (0..4)
            .map(|_| Instruction::mov64(R0, 0))
            .chain([Instruction::exit()])
            .collect();
        let res = model.validate(Dialect::Extended, &words(&prog)).expect("validate");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("too large"), "{}", res.verifier_log);
    }

    #[test]
    fn failing_runs_report_not_triggered() {
        let mut model = ModelVerifier::new().with_failing_runs(2);
        let map = model.create_map(1).expect("map");
        let res = model.validate(Dialect::Extended, &words(&map_check(map.fd(), 0))).expect("validate");
        let handle = res.program_handle.expect("handle");
        assert!(!model.execute(handle, &[map]).expect("first").succeeded);
        assert!(!model.execute(handle, &[map]).expect("second").succeeded);
        assert!(model.execute(handle, &[map]).expect("third").succeeded);
    }

    #[test]
    fn handles_are_checked() {
        let mut model = ModelVerifier::new();
        assert_eq!(model.close_map(MapHandle(99)), Err(ResourceError::UnknownMap(99)));
        assert_eq!(
            model.execute(ProgramHandle(42), &[]),
            Err(ResourceError::UnknownProgram(42))
        );
        assert!(matches!(model.create_map(0), Err(ResourceError::MapCreation(_))));
        let map = model.create_map(2).expect("map");
        assert_eq!(model.map_elements(map).expect("elements"), vec![0, 0]);
        model.close_map(map).expect("close");
        assert_eq!(model.open_maps(), 0);
    }

    #[test]
    fn classic_programs_are_checked() {
        let mut model = ModelVerifier::new();
        let ok = encode_classic_program(&[
            Cins::add(1u32),
            Cins::misc(classic::Register::A),
            Cins::st(3),
            Cins::ld(3),
            Cins::ret(4u32),
        ])
        .expect("encode");
        let res = model.validate(Dialect::Classic, &ok).expect("validate");
        assert!(res.is_valid, "{}", res.verifier_log);
        assert!(!res.coverage_addresses.is_empty());

        let no_ret = encode_classic_program(&[Cins::add(1u32)]).expect("encode");
        assert!(!model.validate(Dialect::Classic, &no_ret).expect("no ret").is_valid);

        let bad_slot = encode_classic_program(&[Cins::ld(20), Cins::ret(0u32)]).expect("encode");
        let res = model.validate(Dialect::Classic, &bad_slot).expect("slot");
        assert!(res.verifier_log.contains("scratch slot"), "{}", res.verifier_log);

        let uninit = encode_classic_program(&[Cins::ld(2), Cins::ret(0u32)]).expect("encode");
        assert!(!model.validate(Dialect::Classic, &uninit).expect("uninit").is_valid);

        let div = encode_classic_program(&[Cins::div(0u32), Cins::ret(0u32)]).expect("encode");
        assert!(!model.validate(Dialect::Classic, &div).expect("div").is_valid);
    }

    /// `bpf_loop` three times over `callback` with its context at fp-8, then
    /// the map check with the offset read back from fp-12.
    fn loop_program(fd: i32, callback: &[Instruction]) -> (Vec<u64>, Vec<u8>, Vec<FuncInfo>) {
        let mut prog = vec![
            Instruction::st_w(R10, 0, -12),
            Instruction::mov64(R3, R10),
            Instruction::add64(R3, -8),
            Instruction::mov64(R1, 3),
            Instruction::mov64(R4, 0),
            Instruction::ld_func(R2, 0),
            Instruction::call(ebpf::HELPER_LOOP),
            Instruction::ld_w(R7, R10, -12),
        ];
        let mut check = map_check(fd, 0);
        check[0] = Instruction::mov64(R8, R7);
        prog.extend(check);
        let main_words: usize = prog.iter().map(Instruction::word_len).sum();
        // The function load is the sixth word.
        prog[5].imm = (main_words - 6) as i32;
        prog.extend_from_slice(callback);

        let types = LoopCallbackTypes::new();
        let func_info = vec![
            FuncInfo {
                insn_off: 0,
                type_id: types.main,
            },
            FuncInfo {
                insn_off: main_words as u32,
                type_id: types.callback,
            },
        ];
        (words(&prog), types.btf.encode(), func_info)
    }

    #[test]
    fn loop_callback_that_leaves_the_caller_alone_runs() {
        let mut model = ModelVerifier::new();
        let map = model.create_map(1).expect("map");
        let (prog, btf, info) = loop_program(map.fd(), &[Instruction::mov64(R0, 0), Instruction::exit()]);

        let res = model.validate_functions(&prog, &btf, &info).expect("validate");
        assert!(res.is_valid, "{}", res.verifier_log);
        assert!(res.coverage_addresses.contains(&stable_edge("call:loop")));
        assert!(res.coverage_addresses.contains(&stable_edge("exit:callback")));
        assert!(res.coverage_addresses.contains(&stable_edge("btf:func_info")));

        let out = model.execute(res.program_handle.expect("handle"), &[map]).expect("execute");
        assert!(out.succeeded);
        assert_eq!(out.map_elements, vec![vec![0xCAFE]]);
    }

    #[test]
    fn callback_writes_through_the_context_taint_the_caller_stack() {
        let scribble = [
            Instruction::st_b(R2, 0x10, -4),
            Instruction::mov64(R0, 0),
            Instruction::exit(),
        ];

        let mut sound = ModelVerifier::new();
        let map = sound.create_map(1).expect("map");
        let (prog, btf, info) = loop_program(map.fd(), &scribble);
        let res = sound.validate_functions(&prog, &btf, &info).expect("validate");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("unbounded"), "{}", res.verifier_log);

        let mut buggy = ModelVerifier::new().with_stale_callback_stack();
        let map = buggy.create_map(1).expect("map");
        let (prog, btf, info) = loop_program(map.fd(), &scribble);
        let res = buggy.validate_functions(&prog, &btf, &info).expect("validate");
        assert!(res.is_valid, "{}", res.verifier_log);
        let out = buggy.execute(res.program_handle.expect("handle"), &[map]).expect("execute");
        assert!(out.succeeded);
        // The store went to offset 0x10, past the only element.
        assert_eq!(out.map_elements, vec![vec![0]]);
    }

    #[test]
    fn callbacks_must_return_zero_or_one() {
        let mut model = ModelVerifier::new();
        let map = model.create_map(1).expect("map");
        let (prog, btf, info) = loop_program(map.fd(), &[Instruction::mov64(R0, R1), Instruction::exit()]);
        let res = model.validate_functions(&prog, &btf, &info).expect("validate");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("should have been in [0, 1]"), "{}", res.verifier_log);
    }

    #[test]
    fn func_info_must_describe_the_functions() {
        let mut model = ModelVerifier::new();
        let map = model.create_map(1).expect("map");
        let (prog, btf, info) = loop_program(map.fd(), &[Instruction::mov64(R0, 0), Instruction::exit()]);

        let res = model.validate_functions(&prog, &[0u8; 4], &info).expect("garbage btf");
        assert!(res.verifier_log.contains("btf load failed"), "{}", res.verifier_log);

        let res = model.validate_functions(&prog, &btf, &info[..1]).expect("short func_info");
        assert!(res.verifier_log.contains("doesn't match number of subprogs"), "{}", res.verifier_log);

        let mut shifted = info.clone();
        shifted[1].insn_off += 1;
        let res = model.validate_functions(&prog, &btf, &shifted).expect("shifted func_info");
        assert!(res.verifier_log.contains("doesn't match subprog start"), "{}", res.verifier_log);

        let mut not_a_func = info.clone();
        not_a_func[1].type_id = 3;
        let res = model.validate_functions(&prog, &btf, &not_a_func).expect("int type");
        assert!(res.verifier_log.contains("invalid type id 3"), "{}", res.verifier_log);

        // Without func_info the same bytecode is still walked.
        assert!(model.validate(Dialect::Extended, &prog).expect("plain").is_valid);
    }

    #[test]
    fn jumps_stay_inside_their_function() {
        let mut model = ModelVerifier::new();
        let prog = [
            Instruction::ld_func(R1, 4),
            Instruction::mov64(R0, 0),
            Instruction::ja(1),
            Instruction::exit(),
            Instruction::mov64(R0, 0),
            Instruction::exit(),
        ];
        let res = model.validate(Dialect::Extended, &words(&prog)).expect("validate");
        assert!(!res.is_valid);
        assert!(res.verifier_log.contains("jump out of range"), "{}", res.verifier_log);

        let stray = [Instruction::ld_func(R1, 0), Instruction::mov64(R0, 0), Instruction::exit()];
        let res = model.validate(Dialect::Extended, &words(&stray)).expect("validate");
        assert!(res.verifier_log.contains("invalid destination"), "{}", res.verifier_log);
    }
}
