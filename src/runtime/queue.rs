//! Priority queue of accepted programs, largest coverage first.

use serde::{Deserialize, Serialize};

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::ebpf::Instruction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageTrace {
    pub program: Vec<Instruction>,
    /// XOR fold of the coverage addresses the program reached.
    pub signature: u64,
    pub coverage_size: u64,
    pub usage_count: u32,
}

#[derive(Debug)]
struct Entry {
    trace: CoverageTrace,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Ties go to the earlier push.
    fn cmp(&self, other: &Self) -> Ordering {
        self.trace
            .coverage_size
            .cmp(&other.trace.coverage_size)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct TraceQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TraceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, trace: CoverageTrace) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { trace, seq });
    }

    pub fn pop(&mut self) -> Option<CoverageTrace> {
        self.heap.pop().map(|e| e.trace)
    }

    pub fn peek(&self) -> Option<&CoverageTrace> {
        self.heap.peek().map(|e| &e.trace)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queued traces in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &CoverageTrace> {
        self.heap.iter().map(|e| &e.trace)
    }
}
