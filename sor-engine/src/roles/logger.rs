//! Event log sink: drains the log channel into a plain-text file.

use super::{RoleError, WorkerContext};
use crate::event_log::{LogRecord, WIRE_FORMAT_VERSION};
use crate::ipc::PriorityChannel;
use crate::shutdown::Shutdown;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Why the sink stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEnd {
    EndMarker,
    /// Shutdown signal; the records already queued were still written.
    Interrupted,
    ChannelRemoved,
}

/// Append-only log file, one record per line.
pub struct LogSink {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl LogSink {
    /// Open (or create) the file at `path` for appending.
    pub fn create(path: &Path) -> Result<Self, RoleError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| RoleError::Sink {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| RoleError::Sink {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    /// Write one record and flush, so a killed sink loses at most the line in flight.
    pub fn write(&mut self, record: &LogRecord) -> Result<(), RoleError> {
        writeln!(self.writer, "{}", record.to_line())
            .and_then(|()| self.writer.flush())
            .map_err(|source| RoleError::Sink {
                path: self.path.clone(),
                source,
            })?;
        self.records += 1;
        Ok(())
    }

    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Copy records from `channel` into `sink` until the end marker arrives.
///
/// On shutdown, whatever is still queued is written before returning.
pub async fn drain_into(
    channel: &PriorityChannel,
    sink: &mut LogSink,
    shutdown: &mut Shutdown,
) -> Result<SinkEnd, RoleError> {
    loop {
        match channel.receive_log(shutdown).await {
            Ok(record) if record.is_end() => return Ok(SinkEnd::EndMarker),
            Ok(record) => sink.write(&record)?,
            Err(e) if e.is_interrupted() => break,
            Err(e) if e.is_removed() => return Ok(SinkEnd::ChannelRemoved),
            Err(e) => return Err(e.into()),
        }
    }

    loop {
        match channel.try_receive_log() {
            Ok(Some(record)) if record.is_end() => return Ok(SinkEnd::EndMarker),
            Ok(Some(record)) => sink.write(&record)?,
            Ok(None) => return Ok(SinkEnd::Interrupted),
            Err(e) if e.is_removed() => return Ok(SinkEnd::ChannelRemoved),
            Err(e) => return Err(e.into()),
        }
    }
}

pub async fn run(mut ctx: WorkerContext, log_path: &Path) -> Result<SinkEnd, RoleError> {
    let mut sink = LogSink::create(log_path)?;
    debug!("Event log v{} at {}", WIRE_FORMAT_VERSION, sink.path().display());

    let end = drain_into(&ctx.ipc.log, &mut sink, &mut ctx.shutdown).await?;
    match end {
        SinkEnd::EndMarker => info!("Event log closed after {} records", sink.records()),
        SinkEnd::Interrupted => warn!("Event log stopped by signal after {} records", sink.records()),
        SinkEnd::ChannelRemoved => warn!("Log channel removed; {} records written", sink.records()),
    }
    Ok(end)
}
