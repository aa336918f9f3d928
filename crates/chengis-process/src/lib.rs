//! Process sub-executor for Chengis: runs a step's shell command, streaming
//! masked output line-by-line (and in `chunk_size`-line batches) while
//! enforcing a wall-clock timeout.
//!
//! Uses a `try_wait` loop against an `Instant` deadline, killing the child
//! on expiry, and adds the things a CI step executor needs beyond a
//! one-shot command runner: output is streamed line-by-line as it's
//! produced (not just captured at exit), every line passes through a
//! [`mask::SecretMasker`] before a caller ever sees it, and lines are also
//! batched per stream into [`ChunkEvent`]s for callers that want to ship
//! output in bulk rather than per line.

pub mod mask;

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mask::SecretMasker;
use serde::{Deserialize, Serialize};

/// Which stream a line came from, passed to the line callback so a caller
/// can tag log lines or color terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A batch of `chunk_size` (or fewer, for the final partial batch)
/// already-masked lines from one stream, emitted to `on_chunk` alongside
/// the per-line callback.
#[derive(Debug, Clone)]
pub struct ChunkEvent {
    pub source: StreamKind,
    /// 0-based index of the first line in this chunk, counted per stream.
    pub line_start: usize,
    pub line_count: usize,
    pub text: String,
}

/// A command to run as one pipeline step.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Merged into the child's environment (does not clear existing vars).
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// Per-stream cap; output beyond this is dropped and the corresponding
    /// `*_truncated` flag is set, matching `Step::stdout_truncated` /
    /// `stderr_truncated` in the data model.
    pub max_output_bytes: usize,
    /// Lines per stream aggregated into one `on_chunk` batch.
    pub chunk_size: usize,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            timeout: None,
            max_output_bytes: 10 * 1024 * 1024,
            chunk_size: 20,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

/// Outcome of running one [`ProcessSpec`], with output already masked and
/// joined back into full text for storage, alongside the truncation and
/// timeout bookkeeping the step executor needs to set `Step` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

enum Line {
    Stdout(String),
    Stderr(String),
}

/// Buffers lines per stream and emits a [`ChunkEvent`] every `chunk_size`
/// lines, per §4.B.
struct ChunkAggregator {
    chunk_size: usize,
    stdout_lines: Vec<String>,
    stdout_start: usize,
    stderr_lines: Vec<String>,
    stderr_start: usize,
}

impl ChunkAggregator {
    fn new(chunk_size: usize) -> Self {
        Self { chunk_size, stdout_lines: Vec::new(), stdout_start: 0, stderr_lines: Vec::new(), stderr_start: 0 }
    }

    fn push(&mut self, source: StreamKind, masked: &str) -> Option<ChunkEvent> {
        let (lines, start) = match source {
            StreamKind::Stdout => (&mut self.stdout_lines, &mut self.stdout_start),
            StreamKind::Stderr => (&mut self.stderr_lines, &mut self.stderr_start),
        };
        lines.push(masked.to_string());
        if lines.len() < self.chunk_size {
            return None;
        }
        Self::drain_into_event(source, lines, start)
    }

    fn drain_into_event(source: StreamKind, lines: &mut Vec<String>, start: &mut usize) -> Option<ChunkEvent> {
        if lines.is_empty() {
            return None;
        }
        let line_start = *start;
        let line_count = lines.len();
        let text = lines.join("\n");
        lines.clear();
        *start += line_count;
        Some(ChunkEvent { source, line_start, line_count, text })
    }

    /// Emit whatever partial chunks remain once the process has exited.
    fn flush(&mut self) -> Vec<ChunkEvent> {
        [
            Self::drain_into_event(StreamKind::Stdout, &mut self.stdout_lines, &mut self.stdout_start),
            Self::drain_into_event(StreamKind::Stderr, &mut self.stderr_lines, &mut self.stderr_start),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Run `spec`, masking every line through `masker` and invoking
/// `on_line(stream, masked_line)` as output arrives (not only at process
/// exit), while also batching every `spec.chunk_size` lines per stream into
/// an `on_chunk` callback per §4.B. Enforces `spec.timeout` by polling
/// `try_wait` against a deadline and killing the child if it's exceeded,
/// exactly as the command runner this was adapted from does for
/// `cargo publish --dry-run`.
pub fn run(
    spec: &ProcessSpec,
    masker: &SecretMasker,
    mut on_line: impl FnMut(StreamKind, &str),
    mut on_chunk: impl FnMut(ChunkEvent),
) -> Result<ProcessResult> {
    let start = Instant::now();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn step command: {}", spec.program))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (tx, rx) = mpsc::channel::<Line>();
    let stdout_tx = tx.clone();
    let stdout_thread = std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if stdout_tx.send(Line::Stdout(line)).is_err() {
                break;
            }
        }
    });
    let stderr_thread = std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            if tx.send(Line::Stderr(line)).is_err() {
                break;
            }
        }
    });

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();
    let mut stdout_truncated = false;
    let mut stderr_truncated = false;
    let deadline = spec.timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    let mut chunks = ChunkAggregator::new(spec.chunk_size);

    let drain = |rx: &mpsc::Receiver<Line>,
                 stdout_buf: &mut String,
                 stderr_buf: &mut String,
                 stdout_truncated: &mut bool,
                 stderr_truncated: &mut bool,
                 chunks: &mut ChunkAggregator,
                 on_line: &mut dyn FnMut(StreamKind, &str),
                 on_chunk: &mut dyn FnMut(ChunkEvent)| {
        while let Ok(line) = rx.try_recv() {
            match line {
                Line::Stdout(raw) => {
                    let masked = masker.mask(&raw);
                    on_line(StreamKind::Stdout, &masked);
                    if let Some(chunk) = chunks.push(StreamKind::Stdout, &masked) {
                        on_chunk(chunk);
                    }
                    if stdout_buf.len() < spec.max_output_bytes {
                        stdout_buf.push_str(&masked);
                        stdout_buf.push('\n');
                    } else {
                        *stdout_truncated = true;
                    }
                }
                Line::Stderr(raw) => {
                    let masked = masker.mask(&raw);
                    on_line(StreamKind::Stderr, &masked);
                    if let Some(chunk) = chunks.push(StreamKind::Stderr, &masked) {
                        on_chunk(chunk);
                    }
                    if stderr_buf.len() < spec.max_output_bytes {
                        stderr_buf.push_str(&masked);
                        stderr_buf.push('\n');
                    } else {
                        *stderr_truncated = true;
                    }
                }
            }
        }
    };

    let exit_code = loop {
        match child.try_wait().context("failed to poll step process")? {
            Some(status) => {
                drain(
                    &rx,
                    &mut stdout_buf,
                    &mut stderr_buf,
                    &mut stdout_truncated,
                    &mut stderr_truncated,
                    &mut chunks,
                    &mut on_line,
                    &mut on_chunk,
                );
                break status.code();
            }
            None => {
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    let _ = child.kill();
                    let _ = child.wait();
                    timed_out = true;
                    drain(
                        &rx,
                        &mut stdout_buf,
                        &mut stderr_buf,
                        &mut stdout_truncated,
                        &mut stderr_truncated,
                        &mut chunks,
                        &mut on_line,
                        &mut on_chunk,
                    );
                    break None;
                }
                drain(
                    &rx,
                    &mut stdout_buf,
                    &mut stderr_buf,
                    &mut stdout_truncated,
                    &mut stderr_truncated,
                    &mut chunks,
                    &mut on_line,
                    &mut on_chunk,
                );
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let _ = stdout_thread.join();
    let _ = stderr_thread.join();
    // Final drain for any lines that landed after the last poll.
    drain(
        &rx,
        &mut stdout_buf,
        &mut stderr_buf,
        &mut stdout_truncated,
        &mut stderr_truncated,
        &mut chunks,
        &mut on_line,
        &mut on_chunk,
    );
    for chunk in chunks.flush() {
        on_chunk(chunk);
    }

    Ok(ProcessResult {
        exit_code,
        stdout: stdout_buf,
        stderr: stderr_buf,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Check whether a command exists in `PATH`, used by the IaC engine to
/// distinguish "tool not installed" from "tool errored" (§9's OPA
/// exit-127 rule follows the same idea).
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}
