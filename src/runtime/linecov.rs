//! Coverage address to source line resolution.
//!
//! Raw addresses are resolved against a `vmlinux` image off the fuzz loop's
//! thread: the loop hands each accepted program's addresses to a
//! [`CoverageWorker`] and never waits on the resolver.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::{BpfuzzError, BpfuzzResult};

const IDLE_BACKOFF_MIN: Duration = Duration::from_millis(10);
const IDLE_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLine {
    pub path: String,
    pub line: u32,
}

impl SourceLine {
    /// Parse one `addr2line` output line such as
    /// `kernel/bpf/verifier.c:1234 (discriminator 2)`. Unknown locations
    /// (`??:0`, `??:?`) yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let location = text.split_whitespace().next()?;
        let (path, line) = location.rsplit_once(':')?;
        if path.is_empty() || path == "??" {
            return None;
        }
        let line = line.parse().ok().filter(|l| *l != 0)?;
        Some(Self {
            path: path.to_string(),
            line,
        })
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_name(), self.line)
    }
}

pub trait AddressResolver: Send {
    /// One entry per input address, in input order.
    fn resolve(&mut self, addresses: &[u64]) -> BpfuzzResult<Vec<Option<SourceLine>>>;
}

impl<F> AddressResolver for F
where
    F: FnMut(&[u64]) -> BpfuzzResult<Vec<Option<SourceLine>>> + Send,
{
    fn resolve(&mut self, addresses: &[u64]) -> BpfuzzResult<Vec<Option<SourceLine>>> {
        self(addresses)
    }
}

/// Resolves through the `addr2line` binutils tool.
#[derive(Debug, Clone)]
pub struct Addr2Line {
    program: PathBuf,
    vmlinux: PathBuf,
}

impl Addr2Line {
    pub fn new(vmlinux: PathBuf) -> Self {
        Self {
            program: PathBuf::from("addr2line"),
            vmlinux,
        }
    }

    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }
}

impl AddressResolver for Addr2Line {
    fn resolve(&mut self, addresses: &[u64]) -> BpfuzzResult<Vec<Option<SourceLine>>> {
        let mut child = Command::new(&self.program)
            .arg("-e")
            .arg(&self.vmlinux)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let input: String = addresses.iter().map(|a| format!("{a:x}\n")).collect();
        // Feed stdin from its own thread so stdout keeps draining; a full
        // pipe on either side would otherwise stall both processes.
        let writer = child
            .stdin
            .take()
            .map(|mut stdin| std::thread::spawn(move || stdin.write_all(input.as_bytes())));
        let output = child.wait_with_output()?;
        match writer.map(JoinHandle::join) {
            None | Some(Ok(Ok(()))) => {}
            Some(Ok(Err(err))) => return Err(err.into()),
            Some(Err(_)) => {
                return Err(BpfuzzError::Config(format!(
                    "stdin writer for {} panicked",
                    self.program.display()
                )));
            }
        }
        if !output.status.success() {
            return Err(BpfuzzError::Config(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut lines: Vec<Option<SourceLine>> = text.lines().map(SourceLine::parse).collect();
        lines.resize(addresses.len(), None);
        Ok(lines)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveragePoint {
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
    pub addresses: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCoverageReport {
    /// Every rise of the distinct address count, oldest first.
    pub history: Vec<CoveragePoint>,
    pub resolved: usize,
    pub unresolved: usize,
    pub files: BTreeMap<String, BTreeSet<u32>>,
}

impl LineCoverageReport {
    pub fn covered_lines(&self) -> usize {
        self.files.values().map(BTreeSet::len).sum()
    }
}

pub struct CoverageManager<R> {
    resolver: R,
    cache: HashMap<u64, SourceLine>,
    unresolved: HashSet<u64>,
    files: BTreeMap<String, BTreeSet<u32>>,
    history: Vec<CoveragePoint>,
    last_max: usize,
    started: Instant,
}

impl<R: AddressResolver> CoverageManager<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            cache: HashMap::new(),
            unresolved: HashSet::new(),
            files: BTreeMap::new(),
            history: Vec::new(),
            last_max: 0,
            started: Instant::now(),
        }
    }

    /// Resolve whatever in `addresses` is new and return the known lines
    /// for all of them.
    pub fn process(&mut self, addresses: &[u64]) -> BpfuzzResult<BTreeMap<u64, SourceLine>> {
        let mut unknown: Vec<u64> = addresses
            .iter()
            .copied()
            .filter(|a| !self.cache.contains_key(a) && !self.unresolved.contains(a))
            .collect();
        unknown.sort_unstable();
        unknown.dedup();

        let seen = self.cache.len() + self.unresolved.len() + unknown.len();
        if seen > self.last_max {
            self.last_max = seen;
            self.history.push(CoveragePoint {
                elapsed_ms: self.started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
                addresses: seen,
            });
        }

        if !unknown.is_empty() {
            let resolved = self.resolver.resolve(&unknown)?;
            for (addr, line) in unknown.iter().zip(resolved) {
                match line {
                    Some(line) => {
                        self.files.entry(line.path.clone()).or_default().insert(line.line);
                        self.cache.insert(*addr, line);
                    }
                    None => {
                        self.unresolved.insert(*addr);
                    }
                }
            }
            debug!(new = unknown.len(), cached = self.cache.len(), "resolved coverage addresses");
        }

        Ok(addresses
            .iter()
            .filter_map(|a| self.cache.get(a).map(|l| (*a, l.clone())))
            .collect())
    }

    pub fn report(&self) -> LineCoverageReport {
        LineCoverageReport {
            history: self.history.clone(),
            resolved: self.cache.len(),
            unresolved: self.unresolved.len(),
            files: self.files.clone(),
        }
    }
}

/// Background thread that owns a [`CoverageManager`].
pub struct CoverageWorker {
    tx: Option<Sender<Vec<u64>>>,
    handle: Option<JoinHandle<LineCoverageReport>>,
}

impl CoverageWorker {
    pub fn spawn<R: AddressResolver + 'static>(mut manager: CoverageManager<R>) -> BpfuzzResult<Self> {
        let (tx, rx) = mpsc::channel::<Vec<u64>>();
        let handle = std::thread::Builder::new()
            .name("bpfuzz-linecov".to_string())
            .spawn(move || {
                let mut idle = IDLE_BACKOFF_MIN;
                loop {
                    match rx.recv_timeout(idle) {
                        Ok(batch) => {
                            idle = IDLE_BACKOFF_MIN;
                            if let Err(err) = manager.process(&batch) {
                                warn!("coverage resolution failed: {err}");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            idle = (idle * 2).min(IDLE_BACKOFF_MAX);
                            trace!(backoff_ms = idle.as_millis() as u64, "coverage worker idle");
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                manager.report()
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a batch; false once the worker has gone away.
    pub fn submit(&self, addresses: Vec<u64>) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(addresses).is_ok())
    }

    /// Drain the queue, stop the thread and return its final report.
    pub fn finish(mut self) -> LineCoverageReport {
        self.tx = None;
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            Some(Err(_)) => {
                warn!("coverage worker panicked; line coverage is lost");
                LineCoverageReport::default()
            }
            None => LineCoverageReport::default(),
        }
    }
}

impl Drop for CoverageWorker {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
