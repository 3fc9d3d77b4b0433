//! Simulation event log: record format and the logger every role writes through.
//!
//! Each event becomes one line in the run's log file:
//!
//! ```text
//! simTimeMinutes;pid;[wR=inside/capacity;rQ=n;tQ=n;sQ=n;wSem=n;sSem=n;]role;text
//! ```
//!
//! Records travel over the log channel with a non-blocking send. When the
//! channel is full the record is dropped; the simulation never waits on
//! its own log.

use crate::ipc::IpcHandles;
use crate::roles::Role;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Version of the line format above.
pub const WIRE_FORMAT_VERSION: u32 = 1;

/// Text of the record that tells the log sink to stop.
pub const END_MARKER: &str = "END";

/// One event as carried on the log channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub sim_time: i64,
    pub pid: i32,
    /// Everything after the pid: optional metrics block, role label, free text.
    pub text: String,
}

impl LogRecord {
    /// The stop record for the log sink.
    #[must_use]
    pub fn end(sim_time: i64, pid: i32) -> Self {
        Self {
            sim_time,
            pid,
            text: END_MARKER.to_string(),
        }
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        self.text.starts_with(END_MARKER)
    }

    /// Format as a log file line (without the trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{};{};{}", self.sim_time, self.pid, self.text)
    }
}

/// Occupancy and queue gauges prefixed to each record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub inside: i32,
    pub capacity: i32,
    pub registration_queue: usize,
    pub triage_queue: usize,
    pub specialist_queue: usize,
    pub gate: i32,
    pub mutex: i32,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wR={}/{};rQ={};tQ={};sQ={};wSem={};sSem={}",
            self.inside,
            self.capacity,
            self.registration_queue,
            self.triage_queue,
            self.specialist_queue,
            self.gate,
            self.mutex
        )
    }
}

/// Build the record text: `[metrics;]role;text`.
#[must_use]
pub fn compose_text(metrics: Option<&Metrics>, role: Role, text: &str) -> String {
    match metrics {
        Some(m) => format!("{m};{role};{text}"),
        None => format!("{role};{text}"),
    }
}

/// Sends event records for one role.
#[derive(Debug, Clone)]
pub struct EventLogger {
    ipc: Arc<IpcHandles>,
    role: Role,
    pid: i32,
}

impl EventLogger {
    #[must_use]
    pub fn new(ipc: Arc<IpcHandles>, role: Role) -> Self {
        Self {
            ipc,
            role,
            pid: std::process::id() as i32,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Build the record for `text` without sending it.
    #[must_use]
    pub fn record(&self, text: &str) -> LogRecord {
        let metrics = self.ipc.metrics();
        LogRecord {
            sim_time: self.ipc.sim_minutes(),
            pid: self.pid,
            text: compose_text(Some(&metrics), self.role, text),
        }
    }

    /// Send one event. Returns `false` if the record was dropped.
    pub fn log(&self, text: impl AsRef<str>) -> bool {
        let record = self.record(text.as_ref());
        debug!(role = %self.role, "{}", text.as_ref());
        match self.ipc.log.send_log(&record) {
            Ok(()) => true,
            Err(e) => {
                trace!("Dropped log record: {}", e);
                false
            }
        }
    }
}
