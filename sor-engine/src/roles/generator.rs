//! Patient generator: starts one patient process per arrival.

use super::{Role, RoleError, WorkerContext};
use crate::cli::Mode;
use crate::messages::PatientUnit;
use crate::process_manager::{ManagedProcess, StopOutcome};
use nix::sys::signal::Signal;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const SATURATION_BACKOFF: Duration = Duration::from_millis(50);
const SPAWN_BACKOFF: Duration = Duration::from_millis(100);
const PATIENT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Totals for one generator lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorReport {
    pub spawned: u32,
    pub spawn_failures: u32,
    pub saturation_episodes: u32,
    pub force_killed: u32,
}

/// Live patient processes.
#[derive(Debug, Default)]
pub struct PatientPool {
    live: Vec<ManagedProcess>,
}

impl PatientPool {
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn push(&mut self, patient: ManagedProcess) {
        self.live.push(patient);
    }

    /// Drop finished patients. Returns how many were reaped.
    pub fn reap(&mut self) -> usize {
        let before = self.live.len();
        self.live.retain_mut(|p| !matches!(p.try_reap(), Ok(Some(_))));
        before - self.live.len()
    }

    /// Ask every live patient to leave, then join them. Returns how many had to be killed.
    pub async fn stop_all(&mut self, timeout: Duration) -> u32 {
        for patient in &mut self.live {
            if let Err(e) = patient.signal(Signal::SIGUSR2) {
                debug!("{}", e);
            }
        }
        let mut killed = 0;
        for mut patient in self.live.drain(..) {
            match patient.stop(Signal::SIGUSR2, timeout).await {
                Ok(StopOutcome::ForceKilled) => killed += 1,
                Ok(_) => {}
                Err(e) => warn!("{}", e),
            }
        }
        killed
    }
}

fn patient_mode(key_path: &Path, unit: &PatientUnit) -> Mode {
    Mode::Patient {
        key_path: key_path.to_path_buf(),
        id: unit.id,
        age: unit.age,
        vip: u8::from(unit.vip),
        guardian: u8::from(unit.has_guardian),
        persons: unit.person_count,
    }
}

pub async fn run(mut ctx: WorkerContext, exe: &Path, key_path: &Path) -> Result<GeneratorReport, RoleError> {
    let mut rng = ctx.rng();
    let mut pool = PatientPool::default();
    let mut report = GeneratorReport::default();
    let cap = ctx.timing.max_live_patients.max(1) as usize;
    let mut saturated = false;
    let mut next_id = 1;
    ctx.log.log(format!("Generator started (cap {cap})"));

    while !ctx.shutdown.is_requested() && !ctx.timing.duration_elapsed() {
        pool.reap();

        if pool.len() >= cap {
            if !saturated {
                saturated = true;
                report.saturation_episodes += 1;
                ctx.log.log(format!("Patient cap {cap} reached, holding arrivals"));
            }
            if !ctx.pause(SATURATION_BACKOFF).await {
                break;
            }
            continue;
        }
        saturated = false;

        let unit = PatientUnit::synthesize(next_id, &mut rng);
        let name = format!("patient-{}", unit.id);
        match ManagedProcess::spawn(exe, name, Role::Patient, &patient_mode(key_path, &unit)) {
            Ok(patient) => {
                pool.push(patient);
                report.spawned += 1;
                next_id += 1;
            }
            Err(e) => {
                report.spawn_failures += 1;
                warn!("{}", e);
                ctx.log.log(format!("Could not start patient {}: {e}", unit.id));
                if !ctx.pause(SPAWN_BACKOFF).await {
                    break;
                }
                continue;
            }
        }

        let arrival = rng.duration_in(ctx.timing.arrival);
        if !ctx.pause(arrival).await {
            break;
        }
    }

    info!("Generator stopping; {} patients still live", pool.len());
    report.force_killed = pool.stop_all(PATIENT_STOP_TIMEOUT).await;
    ctx.log.log(format!(
        "Generator stopped: {} patients started, {} spawn failures",
        report.spawned, report.spawn_failures
    ));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[test]
    fn test_patient_mode_arguments() {
        let unit = PatientUnit::new(12, 4, true);
        let mode = patient_mode(Path::new("/tmp/sor"), &unit);
        assert_eq!(
            mode.to_args(),
            vec!["patient", "/tmp/sor", "12", "4", "1", "1", "2"]
        );
    }

    #[tokio::test]
    async fn test_pool_reaps_and_stops() -> Result<(), Box<dyn std::error::Error>> {
        let mut pool = PatientPool::default();
        let mut done = Command::new("sh");
        done.args(["-c", "exit 0"]);
        let mut waiting = Command::new("sh");
        waiting.args(["-c", "sleep 30"]);
        pool.push(ManagedProcess::spawn_command("patient-1", Role::Patient, done)?);
        pool.push(ManagedProcess::spawn_command("patient-2", Role::Patient, waiting)?);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pool.len() > 1 {
            pool.reap();
            assert!(tokio::time::Instant::now() < deadline, "patient never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // sh terminates on SIGUSR2 by default.
        assert_eq!(pool.stop_all(Duration::from_secs(5)).await, 0);
        assert!(pool.is_empty());
        Ok(())
    }
}
