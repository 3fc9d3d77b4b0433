//! Child process supervision for the director and the patient generator.
//!
//! Every actor is a re-executed copy of this binary running one worker
//! mode. A [`ManagedProcess`] owns the child handle and knows how to
//! signal it, reap it, and stop it: graceful signal, bounded wait, then
//! SIGKILL.

use crate::cli::Mode;
use crate::roles::Role;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Process supervision errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned {0} but the OS reported no pid")]
    MissingPid(String),

    #[error("Failed to send {signal:?} to {name} (pid {pid}): {source}")]
    Signal {
        name: String,
        pid: u32,
        signal: Signal,
        #[source]
        source: Errno,
    },

    #[error("Failed to wait for {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Process already exists: {0}")]
    AlreadyExists(String),
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the timeout; `None` when ended by a signal.
    Exited(Option<i32>),
    /// Did not exit in time and was killed.
    ForceKilled,
    /// Had already exited before the stop request.
    AlreadyExited,
}

/// One supervised child process.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    role: Role,
    pid: u32,
    child: Child,
    status: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Start `exe` in worker `mode`.
    pub fn spawn(exe: &Path, name: impl Into<String>, role: Role, mode: &Mode) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(exe);
        cmd.args(mode.to_args());
        Self::spawn_command(name, role, cmd)
    }

    /// Start an arbitrary command. Stdin is closed; output is inherited.
    pub fn spawn_command(name: impl Into<String>, role: Role, mut cmd: Command) -> Result<Self, ProcessError> {
        let name = name.into();
        cmd.stdin(Stdio::null());
        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            name: name.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| ProcessError::MissingPid(name.clone()))?;
        debug!("Started {} (pid: {})", name, pid);
        Ok(Self {
            name,
            role,
            pid,
            child,
            status: None,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Deliver `signal`. A child that already exited is not an error.
    pub fn signal(&mut self, signal: Signal) -> Result<(), ProcessError> {
        if self.try_reap()?.is_some() {
            return Ok(());
        }
        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal {
                name: self.name.clone(),
                pid: self.pid,
                signal,
                source,
            }),
        }
    }

    /// Collect the exit status if the child has exited, without waiting.
    pub fn try_reap(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        if self.status.is_none() {
            self.status = self.child.try_wait().map_err(|source| ProcessError::Wait {
                name: self.name.clone(),
                source,
            })?;
        }
        Ok(self.status)
    }

    /// Wait for the child to exit, up to `timeout`.
    pub async fn wait_for(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, ProcessError> {
        if let Some(status) = self.try_reap()? {
            return Ok(Some(status));
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Ok(Err(source)) => Err(ProcessError::Wait {
                name: self.name.clone(),
                source,
            }),
            Err(_) => Ok(None),
        }
    }

    /// Send `signal`, wait up to `timeout`, then SIGKILL.
    pub async fn stop(&mut self, signal: Signal, timeout: Duration) -> Result<StopOutcome, ProcessError> {
        if self.try_reap()?.is_some() {
            return Ok(StopOutcome::AlreadyExited);
        }
        self.signal(signal)?;
        if let Some(status) = self.wait_for(timeout).await? {
            return Ok(StopOutcome::Exited(status.code()));
        }

        warn!("{} (pid {}) did not stop within {:?}; killing", self.name, self.pid, timeout);
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to kill {}: {}", self.name, e);
        }
        let status = self.child.wait().await.map_err(|source| ProcessError::Wait {
            name: self.name.clone(),
            source,
        })?;
        self.status = Some(status);
        Ok(StopOutcome::ForceKilled)
    }
}

/// A child that exited without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub name: String,
    pub role: Role,
    pub pid: u32,
    pub code: Option<i32>,
}

/// Named set of supervised children, kept in spawn order.
#[derive(Debug)]
pub struct ProcessManager {
    exe: PathBuf,
    processes: Vec<ManagedProcess>,
}

impl ProcessManager {
    #[must_use]
    pub fn new(exe: PathBuf) -> Self {
        Self {
            exe,
            processes: Vec::new(),
        }
    }

    /// Spawn `name` in `mode` and return its pid.
    pub fn spawn(&mut self, name: &str, role: Role, mode: &Mode) -> Result<u32, ProcessError> {
        if self.contains(name) {
            return Err(ProcessError::AlreadyExists(name.to_string()));
        }
        let process = ManagedProcess::spawn(&self.exe, name, role, mode)?;
        let pid = process.pid();
        info!("Started {} (pid: {})", name, pid);
        self.processes.push(process);
        Ok(pid)
    }

    /// Take over an already spawned process.
    pub fn adopt(&mut self, process: ManagedProcess) -> Result<u32, ProcessError> {
        if self.contains(process.name()) {
            return Err(ProcessError::AlreadyExists(process.name().to_string()));
        }
        let pid = process.pid();
        self.processes.push(process);
        Ok(pid)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.processes.iter().any(|p| p.name() == name)
    }

    #[must_use]
    pub fn pid_of(&self, name: &str) -> Option<u32> {
        self.processes.iter().find(|p| p.name() == name).map(ManagedProcess::pid)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.processes.iter().map(|p| p.name().to_string()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn signal(&mut self, name: &str, signal: Signal) -> Result<(), ProcessError> {
        self.processes
            .iter_mut()
            .find(|p| p.name() == name)
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))?
            .signal(signal)
    }

    /// Stop one process and forget it.
    pub async fn stop(&mut self, name: &str, signal: Signal, timeout: Duration) -> Result<StopOutcome, ProcessError> {
        let index = self
            .processes
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
        let mut process = self.processes.remove(index);
        process.stop(signal, timeout).await
    }

    /// Wait for a process that was asked to exit by other means; if it is
    /// still running after `timeout`, stop it with SIGTERM and then SIGKILL.
    pub async fn join(&mut self, name: &str, timeout: Duration) -> Result<StopOutcome, ProcessError> {
        let index = self
            .processes
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
        let mut process = self.processes.remove(index);
        match process.wait_for(timeout).await? {
            Some(status) => Ok(StopOutcome::Exited(status.code())),
            None => process.stop(Signal::SIGTERM, timeout).await,
        }
    }

    /// Stop every process except those named in `keep`.
    ///
    /// All of them are signalled first, then each is joined with `timeout`.
    pub async fn drain(&mut self, keep: &[&str], signal: Signal, timeout: Duration) -> Vec<(String, StopOutcome)> {
        let (mut stopping, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.processes)
            .into_iter()
            .partition(|p| !keep.contains(&p.name()));
        self.processes = kept;

        for process in &mut stopping {
            if let Err(e) = process.signal(signal) {
                warn!("{}", e);
            }
        }

        let mut outcomes = Vec::with_capacity(stopping.len());
        for mut process in stopping {
            let outcome = match process.stop(signal, timeout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("{}", e);
                    StopOutcome::ForceKilled
                }
            };
            debug!("{} stopped: {:?}", process.name(), outcome);
            outcomes.push((process.name().to_string(), outcome));
        }
        outcomes
    }

    /// Forget and report children that have exited on their own.
    pub fn reap_exited(&mut self) -> Vec<ExitReport> {
        let mut exited = Vec::new();
        self.processes.retain_mut(|p| match p.try_reap() {
            Ok(Some(status)) => {
                exited.push(ExitReport {
                    name: p.name().to_string(),
                    role: p.role(),
                    pid: p.pid(),
                    code: status.code(),
                });
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("{}", e);
                true
            }
        });
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_stop_sleeping_child() -> Result<(), Box<dyn std::error::Error>> {
        let mut process = ManagedProcess::spawn_command("sleeper", Role::Triage, shell("sleep 30"))?;
        assert!(process.pid() > 0);
        let outcome = process.stop(Signal::SIGTERM, Duration::from_secs(5)).await?;
        assert_eq!(outcome, StopOutcome::Exited(None));
        Ok(())
    }

    #[tokio::test]
    async fn test_escalates_to_kill() -> Result<(), Box<dyn std::error::Error>> {
        let mut process = ManagedProcess::spawn_command(
            "stubborn",
            Role::Logger,
            shell("trap '' TERM; while true; do sleep 1; done"),
        )?;
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = process.stop(Signal::SIGTERM, Duration::from_millis(200)).await?;
        assert_eq!(outcome, StopOutcome::ForceKilled);
        Ok(())
    }

    #[tokio::test]
    async fn test_reap_reports_unexpected_exit() -> Result<(), Box<dyn std::error::Error>> {
        let mut manager = ProcessManager::new(PathBuf::from("sh"));
        let quick = ManagedProcess::spawn_command("quick", Role::Triage, shell("exit 3"))?;
        let slow = ManagedProcess::spawn_command("slow", Role::Logger, shell("sleep 30"))?;
        manager.adopt(quick)?;
        manager.adopt(slow)?;
        assert!(matches!(
            manager.adopt(ManagedProcess::spawn_command("slow", Role::Logger, shell("true"))?),
            Err(ProcessError::AlreadyExists(_))
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let reports = loop {
            let reports = manager.reap_exited();
            if !reports.is_empty() {
                break reports;
            }
            assert!(tokio::time::Instant::now() < deadline, "child never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "quick");
        assert_eq!(reports[0].code, Some(3));
        assert_eq!(manager.names(), vec!["slow".to_string()]);

        let outcomes = manager.drain(&[], Signal::SIGTERM, Duration::from_secs(5)).await;
        assert_eq!(outcomes, vec![("slow".to_string(), StopOutcome::Exited(None))]);
        assert!(manager.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_join_waits_for_voluntary_exit() -> Result<(), Box<dyn std::error::Error>> {
        let mut manager = ProcessManager::new(PathBuf::from("sh"));
        manager.adopt(ManagedProcess::spawn_command("sink", Role::Logger, shell("sleep 0.1; exit 0"))?)?;
        let outcome = manager.join("sink", Duration::from_secs(5)).await?;
        assert_eq!(outcome, StopOutcome::Exited(Some(0)));
        assert!(manager.pid_of("sink").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_unknown_name() {
        let mut manager = ProcessManager::new(PathBuf::from("sh"));
        let result = manager.stop("ghost", Signal::SIGTERM, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ProcessError::NotFound(_))));
    }
}
