//! Per-host job state and output capture
//!
//! A [`Job`] is shared between the worker running it and the renderer
//! reading it. Output lines, phase and error live behind one lock so the
//! renderer never sees a half-appended update.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::ssh::{EffectiveOptions, SessionPhase, SshError};

/// Lines shown per host in the live view
pub const TAIL_LINES: usize = 5;

#[derive(Debug, Default)]
struct JobState {
    phase: SessionPhase,
    lines: Vec<String>,
    error: Option<String>,
}

/// One host's unit of work and its accumulated result
#[derive(Debug)]
pub struct Job {
    target: String,
    options: Option<EffectiveOptions>,
    state: Mutex<JobState>,
    signal: Arc<Notify>,
}

impl Job {
    /// A job for `target`; a resolution error fails it before dispatch.
    pub fn new(
        target: impl Into<String>,
        options: Result<EffectiveOptions, SshError>,
        signal: Arc<Notify>,
    ) -> Self {
        let mut state = JobState::default();
        let options = match options {
            Ok(options) => Some(options),
            Err(e) => {
                state.phase = SessionPhase::Failed;
                state.error = Some(e.to_string());
                None
            }
        };

        Self {
            target: target.into(),
            options,
            state: Mutex::new(state),
            signal,
        }
    }

    /// Host as given on the command line
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Resolved options, `None` when resolution failed
    pub fn options(&self) -> Option<&EffectiveOptions> {
        self.options.as_ref()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        let mut state = self.state.lock();
        if state.phase.is_finished() {
            return;
        }
        state.phase = phase;
        drop(state);
        self.signal.notify_one();
    }

    pub fn push_line(&self, line: String) {
        self.state.lock().lines.push(line);
        self.signal.notify_one();
    }

    /// Record the job's outcome. The first error is kept.
    pub fn finish(&self, result: Result<(), SshError>) {
        let mut state = self.state.lock();
        if state.phase.is_finished() {
            return;
        }
        match result {
            Ok(()) => state.phase = SessionPhase::Closed,
            Err(e) => {
                state.phase = SessionPhase::Failed;
                state.error = Some(e.to_string());
            }
        }
        drop(state);
        self.signal.notify_one();
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn failed(&self) -> bool {
        self.state.lock().error.is_some()
    }

    /// Last `count` lines
    pub fn tail(&self, count: usize) -> Vec<String> {
        let state = self.state.lock();
        let from = state.lines.len().saturating_sub(count);
        state.lines[from..].to_vec()
    }

    /// Consistent copy of the job for rendering and reports
    pub fn snapshot(&self) -> JobReport {
        let state = self.state.lock();
        JobReport {
            host: self.target.clone(),
            phase: state.phase,
            success: state.phase == SessionPhase::Closed && state.error.is_none(),
            error: state.error.clone(),
            output: state.lines.clone(),
        }
    }
}

/// Serializable view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub host: String,
    pub phase: SessionPhase,
    pub success: bool,
    pub error: Option<String>,
    pub output: Vec<String>,
}

/// `io::Write` sink turning streamed bytes into job lines.
///
/// A partial line is held until its newline arrives or the writer is
/// finished. ANSI escape sequences are stripped.
pub struct JobWriter {
    job: Arc<Job>,
    partial: Vec<u8>,
}

impl JobWriter {
    pub fn new(job: Arc<Job>) -> Self {
        Self {
            job,
            partial: Vec::new(),
        }
    }

    /// Flush a trailing partial line
    pub fn finish(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.emit(&line);
        }
    }

    fn emit(&self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let clean = strip_ansi_escapes::strip(raw);
        self.job.push_line(String::from_utf8_lossy(&clean).into_owned());
    }
}

impl io::Write for JobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            if self.partial.is_empty() {
                self.emit(&rest[..pos]);
            } else {
                self.partial.extend_from_slice(&rest[..pos]);
                let line = std::mem::take(&mut self.partial);
                self.emit(&line);
            }
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        Ok(buf.len())
    }

    // Not end of stream: a partial line stays buffered
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for JobWriter {
    fn drop(&mut self) {
        self.finish();
    }
}
