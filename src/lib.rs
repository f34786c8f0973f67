//! bpfuzz core library: instruction model, encoder, coverage engine and the
//! fuzz loop shared by the CLI and the test suite.

#[path = "model/btf.rs"]
pub mod btf;
#[path = "model/classic.rs"]
pub mod classic;
#[path = "model/ebpf.rs"]
pub mod ebpf;
#[path = "model/encoding.rs"]
pub mod encoding;
#[path = "model/generator.rs"]
pub mod generator;

#[path = "runtime/clock.rs"]
mod clock;
#[path = "platform/config.rs"]
mod config;
#[path = "cmd/corpus.rs"]
mod corpus;
#[path = "runtime/coverage.rs"]
mod coverage;
#[path = "platform/duration.rs"]
mod duration;
#[path = "cmd/encode.rs"]
mod encode_cmd;
#[path = "platform/envinfo.rs"]
mod envinfo;
#[path = "platform/error.rs"]
mod error;
#[path = "runtime/executor.rs"]
mod executor;
#[path = "modes/fuzz.rs"]
mod fuzz;
#[path = "runtime/linecov.rs"]
mod linecov;
#[path = "runtime/model.rs"]
mod model_verifier;
#[path = "model/program.rs"]
mod program;
#[path = "runtime/queue.rs"]
mod queue;
#[path = "platform/rand.rs"]
mod rand;
#[path = "model/reporting.rs"]
mod reporting;
#[path = "modes/strategies.rs"]
mod strategies;
#[path = "runtime/tracefile.rs"]
mod tracefile;

pub use clock::*;
pub use config::*;
pub use corpus::*;
pub use coverage::*;
pub use duration::*;
pub use encode_cmd::*;
pub use envinfo::*;
pub use error::*;
pub use executor::*;
pub use fuzz::*;
pub use linecov::*;
pub use model_verifier::*;
pub use program::*;
pub use queue::*;
pub use rand::*;
pub use reporting::*;
pub use strategies::*;
pub use tracefile::*;
