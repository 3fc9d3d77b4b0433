//! Worker roles of the simulation.
//!
//! Each role runs in its own process. A role's `run` function is its whole
//! lifetime; the step functions next to it (`admit`, `register`, `assess`,
//! `examine`) handle one unit and are what the pipeline tests drive.

pub mod generator;
pub mod logger;
pub mod patient;
pub mod registration;
pub mod specialist;
pub mod triage;

use crate::cli::Mode;
use crate::event_log::EventLogger;
use crate::ipc::{IpcError, IpcHandles, IpcKeys, RetryPolicy};
use crate::messages::{PatientUnit, Specialty};
use crate::random::RandomGenerator;
use crate::shutdown::{self, LeaveRequests, Shutdown, SignalError};
use crate::timing::Timing;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors that end a worker process.
#[derive(Debug, Error)]
pub enum RoleError {
    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("log sink I/O error on {}: {source}", path.display())]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid worker arguments: {0}")]
    InvalidArguments(String),
}

/// Who is acting. Also the role label in event log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Director,
    PatientGenerator,
    Patient,
    Registration { elastic: bool },
    Triage,
    Specialist(Specialty),
    Logger,
}

impl Role {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Director => "director",
            Self::PatientGenerator => "patient_gen",
            Self::Patient => "patient",
            Self::Registration { elastic: false } => "reg1",
            Self::Registration { elastic: true } => "reg2",
            Self::Triage => "triage",
            Self::Specialist(_) => "specialist",
            Self::Logger => "logger",
        }
    }

    /// Per-role salt for deriving a random stream from the master seed.
    #[must_use]
    pub const fn salt(self) -> u64 {
        match self {
            Self::Director => 1,
            Self::PatientGenerator => 2,
            Self::Patient => 3,
            Self::Registration { elastic: false } => 4,
            Self::Registration { elastic: true } => 5,
            Self::Triage => 6,
            Self::Specialist(s) => 10 + s.index() as u64,
            Self::Logger => 7,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything a role needs: IPC handles, its logger, the shutdown token and timing.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub ipc: Arc<IpcHandles>,
    pub log: EventLogger,
    pub shutdown: Shutdown,
    pub timing: Timing,
    pub retry: RetryPolicy,
}

impl WorkerContext {
    #[must_use]
    pub fn new(ipc: Arc<IpcHandles>, role: Role, shutdown: Shutdown) -> Self {
        let timing = ipc.timing();
        Self {
            log: EventLogger::new(Arc::clone(&ipc), role),
            retry: RetryPolicy::from_timing(&timing),
            ipc,
            shutdown,
            timing,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.log.role()
    }

    /// Random stream for this role.
    #[must_use]
    pub fn rng(&self) -> RandomGenerator {
        RandomGenerator::for_role(self.timing.seed, self.role().salt())
    }

    /// Sleep unless shutdown arrives first. Returns `false` on shutdown.
    pub async fn pause(&mut self, duration: Duration) -> bool {
        if self.shutdown.is_requested() {
            return false;
        }
        tokio::select! {
            () = self.shutdown.requested() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

fn open_context(key_path: &Path, role: Role, shutdown: Shutdown) -> Result<WorkerContext, RoleError> {
    let keys = IpcKeys::derive(key_path)?;
    let ipc = Arc::new(IpcHandles::open(&keys)?);
    Ok(WorkerContext::new(ipc, role, shutdown))
}

/// Entry point of every worker process.
///
/// Ignores SIGINT, turns SIGUSR2/SIGTERM into the shutdown token, opens the
/// run's IPC objects and runs the role selected by `mode`.
pub async fn run_worker(mode: Mode, exe: PathBuf) -> Result<(), RoleError> {
    shutdown::ignore_interrupt()?;
    let (shutdown, _signals) = shutdown::worker_shutdown()?;

    match mode {
        Mode::Run(_) => Err(RoleError::InvalidArguments("run is not a worker mode".to_string())),
        Mode::Logger { key_path, log_path } => {
            let ctx = open_context(&key_path, Role::Logger, shutdown)?;
            logger::run(ctx, &log_path).await.map(drop)
        }
        Mode::Registration { key_path, elastic } => {
            let ctx = open_context(&key_path, Role::Registration { elastic }, shutdown)?;
            registration::run(ctx).await
        }
        Mode::Triage { key_path } => {
            let ctx = open_context(&key_path, Role::Triage, shutdown)?;
            triage::run(ctx).await
        }
        Mode::Specialist { key_path, index } => {
            let specialty = Specialty::from_index(usize::from(index))
                .ok_or_else(|| RoleError::InvalidArguments(format!("no specialist with index {index}")))?;
            let leave = LeaveRequests::default();
            let _leave_signals = leave.listen()?;
            let ctx = open_context(&key_path, Role::Specialist(specialty), shutdown)?;
            specialist::run(ctx, specialty, leave).await
        }
        Mode::Generator { key_path } => {
            let ctx = open_context(&key_path, Role::PatientGenerator, shutdown)?;
            generator::run(ctx, &exe, &key_path).await.map(drop)
        }
        Mode::Patient {
            key_path,
            id,
            age,
            vip,
            guardian,
            persons,
        } => {
            let unit = PatientUnit {
                id,
                age,
                vip: vip == 1,
                has_guardian: guardian == 1,
                person_count: persons,
            };
            let ctx = open_context(&key_path, Role::Patient, shutdown)?;
            let state = patient::run(ctx, unit).await?;
            info!("Patient {} finished as {:?}", id, state);
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ipc::resources::ProvisionSettings;
    use crate::ipc::IpcResources;
    use crate::shutdown::ShutdownTrigger;
    use crate::timing::{MsRange, ReleasePoint};

    /// A private IPC set with instant service times.
    pub struct Harness {
        pub resources: IpcResources,
        pub trigger: ShutdownTrigger,
        shutdown: Shutdown,
    }

    impl Harness {
        pub fn new(capacity: i32, release_point: ReleasePoint) -> Result<Self, IpcError> {
            let settings = ProvisionSettings {
                capacity,
                queue_bytes: 0,
                poll: Duration::from_millis(2),
            };
            let resources = IpcResources::provision(&IpcKeys::private(), &settings)?;
            let timing = Timing {
                arrival: MsRange::new(1, 1),
                registration: MsRange::new(1, 1),
                triage: MsRange::new(1, 1),
                exam: MsRange::new(1, 1),
                leave: MsRange::new(1, 1),
                send_retry_limit: 3,
                poll_interval: Duration::from_millis(2),
                release_point,
                ..Timing::default()
            };
            resources.handles().store.with_state(|s| {
                s.waiting_room_capacity = capacity;
                s.set_timing(&timing);
            })?;
            let (trigger, shutdown) = shutdown::channel();
            Ok(Self {
                resources,
                trigger,
                shutdown,
            })
        }

        pub fn context(&self, role: Role) -> WorkerContext {
            WorkerContext::new(Arc::clone(self.resources.handles()), role, self.shutdown.clone())
        }

        pub fn ipc(&self) -> &IpcHandles {
            self.resources.handles()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_labels() {
        assert_eq!(Role::PatientGenerator.to_string(), "patient_gen");
        assert_eq!(Role::Registration { elastic: false }.to_string(), "reg1");
        assert_eq!(Role::Registration { elastic: true }.to_string(), "reg2");
        assert_eq!(Role::Specialist(Specialty::Neurologist).to_string(), "specialist");
    }

    #[test]
    fn test_role_salts_are_distinct() {
        let mut salts: Vec<u64> = [
            Role::Director,
            Role::PatientGenerator,
            Role::Patient,
            Role::Registration { elastic: false },
            Role::Registration { elastic: true },
            Role::Triage,
            Role::Logger,
        ]
        .iter()
        .map(|r| r.salt())
        .chain(Specialty::ALL.iter().map(|s| Role::Specialist(*s).salt()))
        .collect();
        salts.sort_unstable();
        salts.dedup();
        assert_eq!(salts.len(), 13);
    }
}
