//! Boundary to whatever loads, verifies and runs bytecode.
//!
//! The kernel binding lives outside this crate; anything that can answer
//! these calls (the in-process [`crate::ModelVerifier`], a kernel FFI shim,
//! a remote worker) plugs into the fuzz loop through [`Executor`].

use serde::{Deserialize, Serialize};

use crate::btf::FuncInfo;
use crate::{Dialect, ResourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapHandle(pub u32);

impl MapHandle {
    /// Value patched into a map-fd wide load.
    pub fn fd(self) -> i32 {
        self.0 as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramHandle(pub u32);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Present only when the program was accepted and stays loaded.
    pub program_handle: Option<ProgramHandle>,
    pub verifier_log: String,
    pub coverage_addresses: Vec<u64>,
    pub did_collect_coverage: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// False when the program could not be triggered at all.
    pub succeeded: bool,
    /// Element snapshot of each requested map, in request order.
    pub map_elements: Vec<Vec<u64>>,
}

pub trait Executor {
    /// Create an array map with `size` 64-bit elements, all zero.
    fn create_map(&mut self, size: u32) -> Result<MapHandle, ResourceError>;

    fn close_map(&mut self, map: MapHandle) -> Result<(), ResourceError>;

    fn map_elements(&self, map: MapHandle) -> Result<Vec<u64>, ResourceError>;

    /// Run the verifier over `bytecode`. Rejection is a normal result, not
    /// an error.
    fn validate(&mut self, dialect: Dialect, bytecode: &[u64]) -> Result<ValidationResult, ResourceError>;

    /// Run the verifier over an extended program whose functions `btf` and
    /// `func_info` describe.
    ///
    /// Executors without BTF support load the instructions alone, the same
    /// as a kernel that refused the blob.
    fn validate_functions(
        &mut self,
        bytecode: &[u64],
        btf: &[u8],
        func_info: &[FuncInfo],
    ) -> Result<ValidationResult, ResourceError> {
        let _ = (btf, func_info);
        self.validate(Dialect::Extended, bytecode)
    }

    fn execute(&mut self, program: ProgramHandle, maps: &[MapHandle]) -> Result<ExecutionResult, ResourceError>;

    /// Unload a program returned by [`Executor::validate`].
    fn close_program(&mut self, program: ProgramHandle) -> Result<(), ResourceError>;
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn create_map(&mut self, size: u32) -> Result<MapHandle, ResourceError> {
        (**self).create_map(size)
    }

    fn close_map(&mut self, map: MapHandle) -> Result<(), ResourceError> {
        (**self).close_map(map)
    }

    fn map_elements(&self, map: MapHandle) -> Result<Vec<u64>, ResourceError> {
        (**self).map_elements(map)
    }

    fn validate(&mut self, dialect: Dialect, bytecode: &[u64]) -> Result<ValidationResult, ResourceError> {
        (**self).validate(dialect, bytecode)
    }

    fn validate_functions(
        &mut self,
        bytecode: &[u64],
        btf: &[u8],
        func_info: &[FuncInfo],
    ) -> Result<ValidationResult, ResourceError> {
        (**self).validate_functions(bytecode, btf, func_info)
    }

    fn execute(&mut self, program: ProgramHandle, maps: &[MapHandle]) -> Result<ExecutionResult, ResourceError> {
        (**self).execute(program, maps)
    }

    fn close_program(&mut self, program: ProgramHandle) -> Result<(), ResourceError> {
        (**self).close_program(program)
    }
}

/// Stable 64-bit coverage address for a named verifier check.
pub fn stable_edge(label: &str) -> u64 {
    let h = blake3::hash(label.as_bytes());
    let mut b = [0u8; 8];
    b.copy_from_slice(&h.as_bytes()[..8]);
    u64::from_le_bytes(b)
}
