//! Specialist doctors, one process per specialty.
//!
//! A specialist takes its most severe patient first (red, then yellow, then
//! green). SIGUSR1 sends it on a temporary leave after the current patient;
//! SIGUSR2 ends the shift, again only after the current patient.

use super::{RoleError, WorkerContext};
use crate::messages::{priority, Envelope, Outcome, Specialty};
use crate::random::RandomGenerator;
use crate::shutdown::LeaveRequests;
use tracing::{debug, info};

/// Examine a patient: service time, then draw the outcome.
pub async fn examine(ctx: &WorkerContext, envelope: &Envelope, rng: &mut RandomGenerator) -> Outcome {
    debug!("Examining patient {}", envelope.patient_id);
    tokio::time::sleep(rng.duration_in(ctx.timing.exam)).await;
    Outcome::from_roll(rng.per_mille())
}

/// Record the outcome and return whatever permits the unit still holds.
pub fn finish(ctx: &WorkerContext, specialty: Specialty, envelope: &Envelope, outcome: Outcome) -> Result<(), RoleError> {
    ctx.ipc
        .release_with(envelope.permits_owed(), |state| state.record_outcome(specialty, outcome))?;
    let colour = envelope.colour.map_or_else(|| "untriaged".to_string(), |c| c.to_string());
    ctx.log.log(format!(
        "{specialty}: patient {} ({colour}) -> {outcome}",
        envelope.patient_id
    ));
    Ok(())
}

/// Go on leave for a random interval. Returns `false` if shutdown cut it short.
pub async fn take_leave(ctx: &mut WorkerContext, specialty: Specialty, rng: &mut RandomGenerator) -> Result<bool, RoleError> {
    let index = specialty.index();
    ctx.ipc.store.with_state(|state| state.specialist_leaves[index] += 1)?;
    let duration = rng.duration_in(ctx.timing.leave);
    ctx.log.log(format!("{specialty} on temporary leave for {} ms", duration.as_millis()));
    let completed = ctx.pause(duration).await;
    if completed {
        ctx.log.log(format!("{specialty} back from leave"));
    }
    Ok(completed)
}

pub async fn run(mut ctx: WorkerContext, specialty: Specialty, leave: LeaveRequests) -> Result<(), RoleError> {
    let mut rng = ctx.rng();
    let ceiling = priority::specialist_ceiling(specialty);
    let channel = *ctx.ipc.specialist(specialty);
    let mut treated = 0u64;
    ctx.log.log(format!("{specialty} on duty"));

    loop {
        if ctx.shutdown.is_requested() {
            break;
        }
        if leave.take() && !take_leave(&mut ctx, specialty, &mut rng).await? {
            break;
        }

        let envelope = match channel.try_receive(ceiling) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                if !ctx.pause(ctx.timing.poll_interval).await {
                    break;
                }
                continue;
            }
            Err(e) if e.ends_loop() => break,
            Err(e) => return Err(e.into()),
        };

        let outcome = examine(&ctx, &envelope, &mut rng).await;
        match finish(&ctx, specialty, &envelope, outcome) {
            Ok(()) => treated += 1,
            Err(RoleError::Ipc(e)) if e.ends_loop() => break,
            Err(e) => return Err(e),
        }
    }

    info!("{} off duty after {} patients", specialty, treated);
    ctx.log.log(format!("{specialty} off duty"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{PatientUnit, TriageColour};
    use crate::roles::test_support::Harness;
    use crate::roles::Role;
    use crate::timing::ReleasePoint;
    use std::time::Duration;

    #[tokio::test]
    async fn test_finish_records_outcome_and_releases() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::new(10, ReleasePoint::Terminal)?;
        let ctx = harness.context(Role::Specialist(Specialty::Neurologist));
        let unit = PatientUnit::new(1, 12, false);
        assert!(harness.ipc().gate.try_acquire(2)?);
        harness.ipc().store.with_state(|s| s.admit(2))?;

        let envelope = Envelope::arrival(&unit)
            .for_triage(true)
            .for_specialist(Specialty::Neurologist, TriageColour::Yellow);
        finish(&ctx, Specialty::Neurologist, &envelope, Outcome::Ward)?;

        let state = harness.ipc().store.snapshot();
        assert_eq!(state.outcome_ward, 1);
        assert_eq!(state.specialist_handled[Specialty::Neurologist.index()], 1);
        assert_eq!(state.specialist_ward[Specialty::Neurologist.index()], 1);
        assert_eq!(state.current_in_waiting_room, 0);
        assert_eq!(harness.ipc().gate.value()?, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_finish_without_held_permits() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::new(10, ReleasePoint::Registration)?;
        let ctx = harness.context(Role::Specialist(Specialty::Surgeon));
        let envelope = Envelope::arrival(&PatientUnit::new(2, 30, false))
            .for_triage(false)
            .for_specialist(Specialty::Surgeon, TriageColour::Green);

        finish(&ctx, Specialty::Surgeon, &envelope, Outcome::Home)?;
        assert_eq!(harness.ipc().gate.value()?, 10);
        assert_eq!(harness.ipc().store.snapshot().outcome_home, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_leave_is_counted() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::new(10, ReleasePoint::Registration)?;
        let mut ctx = harness.context(Role::Specialist(Specialty::Ophthalmologist));
        let mut rng = ctx.rng();
        assert!(take_leave(&mut ctx, Specialty::Ophthalmologist, &mut rng).await?);
        assert_eq!(
            harness.ipc().store.snapshot().specialist_leaves[Specialty::Ophthalmologist.index()],
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_run_treats_red_before_green() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::new(10, ReleasePoint::Registration)?;
        let ctx = harness.context(Role::Specialist(Specialty::Paediatrician));
        let channel = *harness.ipc().specialist(Specialty::Paediatrician);
        let green = Envelope::arrival(&PatientUnit::new(1, 5, false))
            .for_triage(false)
            .for_specialist(Specialty::Paediatrician, TriageColour::Green);
        let red = Envelope::arrival(&PatientUnit::new(2, 6, false))
            .for_triage(false)
            .for_specialist(Specialty::Paediatrician, TriageColour::Red);
        channel.try_send(&green)?;
        channel.try_send(&red)?;

        let task = tokio::spawn(run(ctx, Specialty::Paediatrician, LeaveRequests::default()));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while harness.ipc().store.snapshot().specialist_handled[Specialty::Paediatrician.index()] < 2 {
            assert!(tokio::time::Instant::now() < deadline, "specialist did not drain its queue");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        harness.trigger.trigger();
        task.await??;

        let mut lines = Vec::new();
        while let Some(record) = harness.ipc().log.try_receive_log()? {
            lines.push(record.text);
        }
        let red_at = lines.iter().position(|l| l.contains("patient 2 (red)"));
        let green_at = lines.iter().position(|l| l.contains("patient 1 (green)"));
        assert!(red_at.is_some() && green_at.is_some());
        assert!(red_at < green_at);
        Ok(())
    }
}
