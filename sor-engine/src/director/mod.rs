//! The director: owns the IPC objects and every fixed worker process.
//!
//! A run moves through four phases:
//!
//! ```text
//! Provisioning -> Running -> Draining -> TornDown
//! ```
//!
//! Provisioning creates the IPC objects and starts the workers. Running is
//! the control loop: duration check, elastic registration, temporary leave
//! injection and the capacity gate audit. Draining stops every worker with
//! SIGUSR2 (SIGKILL after the drain timeout), writes the summary and closes
//! the event log. TornDown removes the IPC objects whatever happened before.

pub mod reconcile;
pub mod scaling;
pub mod summary;

use crate::cli::Mode;
use crate::config::{ConfigError, SimulationConfig};
use crate::event_log::{EventLogger, LogRecord};
use crate::ipc::resources::ProvisionSettings;
use crate::ipc::{IpcError, IpcHandles, IpcKeys, IpcResources};
use crate::messages::Specialty;
use crate::process_manager::{ProcessError, ProcessManager, StopOutcome};
use crate::random::RandomGenerator;
use crate::roles::Role;
use crate::shutdown::{self, Shutdown, SignalError};
use crate::timing::{monotonic_ms, Timing};
use chrono::Utc;
use nix::sys::signal::Signal;
use reconcile::{AuditOutcome, GateAudit, Reconciler};
use scaling::{ScalingAction, ScalingPolicy};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use summary::{DriftCorrection, ElasticSpawn, Summary};
use thiserror::Error;
use tokio::signal::unix::SignalKind;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const LOGGER: &str = "logger";
const REGISTRATION: &str = "reg1";
const ELASTIC_REGISTRATION: &str = "reg2";
const TRIAGE: &str = "triage";
const GENERATOR: &str = "generator";

/// Attempts to queue the end marker when the log channel is full.
const END_MARKER_ATTEMPTS: u32 = 50;

fn specialist_name(specialty: Specialty) -> String {
    format!("specialist-{}", specialty.name())
}

/// Director errors.
#[derive(Debug, Error)]
pub enum DirectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IPC provisioning failed: {0}")]
    Provision(#[source] IpcError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("Failed to start fixed worker: {0}")]
    FixedWorker(#[source] ProcessError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("Output error on {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Provisioning,
    Running,
    Draining,
    TornDown,
}

/// Why the control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    /// SIGINT from the terminal.
    Interrupted,
    /// SIGTERM or SIGUSR2 from outside.
    ShutdownRequested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DurationElapsed => write!(f, "duration_elapsed"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::ShutdownRequested => write!(f, "shutdown_requested"),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunReport {
    pub summary: Summary,
    pub log_path: PathBuf,
    pub summary_path: PathBuf,
    pub teardown_errors: usize,
}

/// Control-loop bookkeeping.
struct Control {
    policy: ScalingPolicy,
    reconciler: Reconciler,
    rng: RandomGenerator,
    next_leave: Instant,
    next_audit: Instant,
    elastic: Vec<ElasticSpawn>,
    corrections: Vec<DriftCorrection>,
    force_killed: Vec<String>,
}

impl Control {
    fn new(config: &SimulationConfig, timing: &Timing) -> Self {
        let now = Instant::now();
        Self {
            policy: ScalingPolicy::new(
                config.waiting_room.capacity,
                config.waiting_room.registration_open_threshold,
            ),
            reconciler: Reconciler::new(config.director.reconciliation_guardrail),
            rng: RandomGenerator::for_role(timing.seed, Role::Director.salt()),
            next_leave: now + Duration::from_millis(config.director.leave_period_ms),
            next_audit: now + Duration::from_millis(config.director.audit_period_ms),
            elastic: Vec::new(),
            corrections: Vec::new(),
            force_killed: Vec::new(),
        }
    }
}

/// Run one audit of the capacity gate and apply a correction if one is due.
///
/// The gate is read under the state mutex so releases, which post the gate
/// inside the same critical section, cannot interleave with the reading.
pub fn audit_gate(
    ipc: &IpcHandles,
    reconciler: &mut Reconciler,
    events: &EventLogger,
    minute: i64,
) -> Result<Option<DriftCorrection>, IpcError> {
    let audit = ipc.store.with_state(|state| {
        ipc.gate.value().map(|observed| GateAudit {
            observed,
            expected: state.expected_gate_value(),
        })
    })??;

    match reconciler.assess(audit) {
        AuditOutcome::Balanced => {
            debug!("Gate audit balanced at {}", audit.observed);
            Ok(None)
        }
        AuditOutcome::ExcessPermits { drift } => {
            warn!("Gate holds {} permits more than free places", -drift);
            events.log(format!(
                "audit: excess permits gate={} expected={}",
                audit.observed, audit.expected
            ));
            Ok(None)
        }
        AuditOutcome::MissingPermits { drift, correct } => {
            warn!("Gate is missing {} permits", drift);
            events.log(format!(
                "audit: missing permits gate={} expected={}",
                audit.observed, audit.expected
            ));
            if !correct {
                return Ok(None);
            }
            let reset_to = ipc.store.with_state(|state| {
                let expected = state.expected_gate_value();
                ipc.gate.reset(expected).map(|()| expected)
            })??;
            events.log(format!("audit: gate reset to {reset_to}"));
            info!("Gate reset to {} (drift {})", reset_to, drift);
            Ok(Some(DriftCorrection {
                at_minute: minute,
                drift,
                reset_to,
            }))
        }
    }
}

/// Supervises one simulation run.
pub struct Director {
    config: SimulationConfig,
    exe: PathBuf,
    phase: Phase,
}

impl Director {
    /// `exe` is the binary re-executed for every worker.
    #[must_use]
    pub fn new(config: SimulationConfig, exe: PathBuf) -> Self {
        Self {
            config,
            exe,
            phase: Phase::Provisioning,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the simulation to completion.
    ///
    /// The IPC objects are removed before this returns, on success and on error.
    pub async fn run(&mut self) -> Result<RunReport, DirectorError> {
        self.phase = Phase::Provisioning;
        self.config.validate()?;

        let (interrupt, _interrupt_guard) = shutdown::on_signals(&[SignalKind::interrupt()])?;
        let (terminate, _terminate_guard) =
            shutdown::on_signals(&[SignalKind::terminate(), SignalKind::user_defined2()])?;

        let key_path = self.config.resolve_key_path(&self.exe);
        let keys = IpcKeys::derive(&key_path).map_err(DirectorError::Provision)?;
        let stale = IpcResources::reset_if_exists(&keys);
        if stale > 0 {
            warn!("Removed {} IPC objects left by an earlier run", stale);
        }

        let settings = ProvisionSettings {
            capacity: self.config.waiting_room.capacity,
            queue_bytes: self.config.channels.queue_bytes,
            poll: Duration::from_millis(self.config.channels.poll_interval_ms.max(1)),
        };
        let mut resources = IpcResources::provision(&keys, &settings).map_err(DirectorError::Provision)?;
        info!("Provisioned IPC objects from key path {}", key_path.display());

        let result = self
            .run_provisioned(&resources, &key_path, interrupt, terminate)
            .await;

        let errors = resources.teardown();
        for e in &errors {
            warn!("IPC teardown: {}", e);
        }
        self.phase = Phase::TornDown;
        info!("IPC objects removed");

        result.map(|mut report| {
            report.teardown_errors = errors.len();
            report
        })
    }

    async fn run_provisioned(
        &mut self,
        resources: &IpcResources,
        key_path: &Path,
        mut interrupt: Shutdown,
        mut terminate: Shutdown,
    ) -> Result<RunReport, DirectorError> {
        let ipc = Arc::clone(resources.handles());
        let timing = self.config.timing(monotonic_ms());
        let capacity = self.config.waiting_room.capacity;
        ipc.store.with_state(|state| {
            state.waiting_room_capacity = capacity;
            state.set_timing(&timing);
            state.director_pid = std::process::id() as i32;
        })?;

        let log_dir = &self.config.output.log_dir;
        std::fs::create_dir_all(log_dir).map_err(|source| DirectorError::Output {
            path: log_dir.clone(),
            source,
        })?;
        let (log_path, summary_path) = summary::output_paths(log_dir, Utc::now().timestamp());

        let events = EventLogger::new(Arc::clone(&ipc), Role::Director);
        let mut workers = ProcessManager::new(self.exe.clone());
        let drain_timeout = self.config.director.drain_timeout();

        if let Err(e) = self.start_fixed_workers(&mut workers, &ipc, key_path, &log_path) {
            error!("{}", e);
            workers.drain(&[], Signal::SIGUSR2, drain_timeout).await;
            return Err(e);
        }

        self.phase = Phase::Running;
        info!(
            "Simulation running: capacity {}, threshold {}, {} simulated minutes",
            capacity, self.config.waiting_room.registration_open_threshold, timing.duration_minutes
        );
        events.log(format!(
            "Simulation started N={} K={} duration={}",
            capacity, self.config.waiting_room.registration_open_threshold, timing.duration_minutes
        ));

        let mut control = Control::new(&self.config, &timing);

        let mut ticker = tokio::time::interval(self.config.director.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stop_reason = loop {
            tokio::select! {
                () = interrupt.requested() => {
                    info!("SIGINT received; stopping simulation");
                    break StopReason::Interrupted;
                }
                () = terminate.requested() => {
                    info!("Termination signal received; stopping simulation");
                    break StopReason::ShutdownRequested;
                }
                _ = ticker.tick() => {}
            }

            if timing.duration_elapsed() {
                info!("Simulated duration of {} minutes reached", timing.duration_minutes);
                break StopReason::DurationElapsed;
            }

            if let Err(e) = self.tick(&mut control, &mut workers, &ipc, &events, &timing).await {
                if e.is_removed() {
                    error!("IPC objects disappeared during the run: {}", e);
                    break StopReason::ShutdownRequested;
                }
                warn!("Control tick failed: {}", e);
            }
        };

        self.phase = Phase::Draining;
        events.log(format!("Simulation stopping ({stop_reason})"));
        self.drain_workers(&mut workers, &mut control, drain_timeout).await;

        let final_state = ipc.store.with_state(|state| *state).unwrap_or_else(|e| {
            warn!("Reading final state without the mutex: {}", e);
            ipc.store.snapshot()
        });
        if let Some(open) = control.elastic.last_mut().filter(|s| s.closed_at.is_none()) {
            open.closed_at = Some(timing.elapsed_minutes());
        }
        let summary = Summary {
            stop_reason,
            elapsed_minutes: timing.elapsed_minutes(),
            state: final_state,
            elastic: control.elastic,
            corrections: control.corrections,
            force_killed: control.force_killed,
            log_file: log_path.clone(),
            generated_at: Utc::now(),
        };
        match summary.write_to(&summary_path) {
            Ok(()) => info!("Summary written to {}", summary_path.display()),
            Err(e) => error!("Failed to write summary {}: {}", summary_path.display(), e),
        }
        events.log(format!(
            "Simulation finished: {} patients, {} dropped",
            final_state.total_patients, final_state.dropped_units
        ));

        self.close_event_log(&mut workers, &ipc, drain_timeout).await;

        Ok(RunReport {
            summary,
            log_path,
            summary_path,
            teardown_errors: 0,
        })
    }

    fn start_fixed_workers(
        &self,
        workers: &mut ProcessManager,
        ipc: &IpcHandles,
        key_path: &Path,
        log_path: &Path,
    ) -> Result<(), DirectorError> {
        let key_path = key_path.to_path_buf();
        let mut start = |name: &str, role: Role, mode: Mode| {
            workers.spawn(name, role, &mode).map_err(DirectorError::FixedWorker)
        };

        let logger = start(
            LOGGER,
            Role::Logger,
            Mode::Logger {
                key_path: key_path.clone(),
                log_path: log_path.to_path_buf(),
            },
        )?;
        ipc.store.with_state(|s| s.logger_pid = logger as i32)?;

        let reg1 = start(
            REGISTRATION,
            Role::Registration { elastic: false },
            Mode::Registration {
                key_path: key_path.clone(),
                elastic: false,
            },
        )?;
        ipc.store.with_state(|s| s.registration1_pid = reg1 as i32)?;

        let triage = start(TRIAGE, Role::Triage, Mode::Triage {
            key_path: key_path.clone(),
        })?;
        ipc.store.with_state(|s| s.triage_pid = triage as i32)?;

        let generator = start(GENERATOR, Role::PatientGenerator, Mode::Generator {
            key_path: key_path.clone(),
        })?;
        ipc.store.with_state(|s| s.generator_pid = generator as i32)?;

        for specialty in Specialty::ALL {
            let pid = start(
                &specialist_name(specialty),
                Role::Specialist(specialty),
                Mode::Specialist {
                    key_path: key_path.clone(),
                    index: specialty.index() as u8,
                },
            )?;
            ipc.store
                .with_state(|s| s.specialist_pids[specialty.index()] = pid as i32)?;
        }
        Ok(())
    }

    async fn tick(
        &self,
        control: &mut Control,
        workers: &mut ProcessManager,
        ipc: &IpcHandles,
        events: &EventLogger,
        timing: &Timing,
    ) -> Result<(), IpcError> {
        for exit in workers.reap_exited() {
            warn!("{} (pid {}) exited unexpectedly with {:?}", exit.name, exit.pid, exit.code);
            events.log(format!("{} (pid {}) exited unexpectedly", exit.name, exit.pid));
            if exit.name == ELASTIC_REGISTRATION {
                ipc.store.with_state(|s| {
                    s.reg2_active = 0;
                    s.registration2_pid = 0;
                })?;
                if let Some(open) = control.elastic.last_mut() {
                    open.closed_at = Some(timing.elapsed_minutes());
                }
            }
        }

        self.scale_registration(control, workers, ipc, events, timing).await?;

        let now = Instant::now();
        if now >= control.next_leave {
            control.next_leave = now + Duration::from_millis(self.config.director.leave_period_ms);
            if control.rng.chance(self.config.director.leave_probability_percent) {
                if let Some(specialty) = Specialty::from_index(control.rng.index(Specialty::ALL.len())) {
                    match workers.signal(&specialist_name(specialty), Signal::SIGUSR1) {
                        Ok(()) => {
                            events.log(format!("{specialty} sent on temporary leave"));
                        }
                        Err(e) => warn!("Leave request failed: {}", e),
                    }
                }
            }
        }

        if now >= control.next_audit {
            control.next_audit = now + Duration::from_millis(self.config.director.audit_period_ms);
            if let Some(correction) =
                audit_gate(ipc, &mut control.reconciler, events, timing.elapsed_minutes())?
            {
                control.corrections.push(correction);
            }
        }
        Ok(())
    }

    async fn scale_registration(
        &self,
        control: &mut Control,
        workers: &mut ProcessManager,
        ipc: &IpcHandles,
        events: &EventLogger,
        timing: &Timing,
    ) -> Result<(), IpcError> {
        let backlog = ipc.registration_backlog();
        let active = workers.contains(ELASTIC_REGISTRATION);

        match control.policy.decide(backlog, active) {
            ScalingAction::Hold => Ok(()),
            ScalingAction::Open => {
                let key_path = self.config.resolve_key_path(&self.exe);
                let mode = Mode::Registration {
                    key_path,
                    elastic: true,
                };
                match workers.spawn(ELASTIC_REGISTRATION, Role::Registration { elastic: true }, &mode) {
                    Ok(pid) => {
                        ipc.store.with_state(|s| {
                            s.reg2_active = 1;
                            s.registration2_pid = pid as i32;
                        })?;
                        control.elastic.push(ElasticSpawn {
                            pid,
                            opened_at: timing.elapsed_minutes(),
                            closed_at: None,
                        });
                        events.log(format!("Second registration window opened (backlog {backlog})"));
                    }
                    Err(e) => {
                        warn!("Could not open second registration window: {}", e);
                        events.log(format!("Second registration window failed to open: {e}"));
                    }
                }
                Ok(())
            }
            ScalingAction::Close => {
                let timeout = self.config.director.drain_timeout();
                match workers.stop(ELASTIC_REGISTRATION, Signal::SIGUSR2, timeout).await {
                    Ok(StopOutcome::ForceKilled) => control.force_killed.push(ELASTIC_REGISTRATION.to_string()),
                    Ok(_) => {}
                    Err(e) => warn!("Closing second registration window: {}", e),
                }
                ipc.store.with_state(|s| {
                    s.reg2_active = 0;
                    s.registration2_pid = 0;
                })?;
                if let Some(open) = control.elastic.last_mut() {
                    open.closed_at = Some(timing.elapsed_minutes());
                }
                events.log(format!("Second registration window closed (backlog {backlog})"));
                Ok(())
            }
        }
    }

    async fn drain_workers(&self, workers: &mut ProcessManager, control: &mut Control, timeout: Duration) {
        // Arrivals stop first so the pipeline is not refilled while it drains.
        if workers.contains(GENERATOR) {
            match workers.stop(GENERATOR, Signal::SIGUSR2, timeout).await {
                Ok(StopOutcome::ForceKilled) => control.force_killed.push(GENERATOR.to_string()),
                Ok(outcome) => debug!("generator stopped: {:?}", outcome),
                Err(e) => warn!("{}", e),
            }
        }

        for (name, outcome) in workers.drain(&[LOGGER], Signal::SIGUSR2, timeout).await {
            if outcome == StopOutcome::ForceKilled {
                warn!("{} was killed after the drain timeout", name);
                control.force_killed.push(name);
            }
        }
    }

    async fn close_event_log(&self, workers: &mut ProcessManager, ipc: &IpcHandles, timeout: Duration) {
        let end = LogRecord::end(ipc.sim_minutes(), std::process::id() as i32);
        let mut queued = false;
        for _ in 0..END_MARKER_ATTEMPTS {
            match ipc.log.send_log(&end) {
                Ok(()) => {
                    queued = true;
                    break;
                }
                Err(IpcError::Full) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => {
                    warn!("Could not queue the log end marker: {}", e);
                    break;
                }
            }
        }
        if !queued {
            warn!("Log sink will be stopped by signal");
        }

        if workers.contains(LOGGER) {
            match workers.join(LOGGER, timeout).await {
                Ok(StopOutcome::ForceKilled) => warn!("Log sink was killed"),
                Ok(outcome) => debug!("Log sink stopped: {:?}", outcome),
                Err(e) => warn!("{}", e),
            }
        }
    }
}
