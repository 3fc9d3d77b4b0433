//! Triage: colour and specialist assignment, or straight home.

use super::{RoleError, WorkerContext};
use crate::messages::{priority, Envelope, Specialty, TriageColour, SPECIALIST_COUNT};
use crate::random::RandomGenerator;
use tracing::{debug, info};

/// Percentage of patients triage sends home without a specialist.
pub const SENT_HOME_PERCENT: u32 = 5;

/// The triage nurse's call for one patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageCall {
    SendHome,
    Route { specialty: Specialty, colour: TriageColour },
}

/// Result of applying a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageDecision {
    SentHome,
    Forwarded { specialty: Specialty, colour: TriageColour },
    Dropped,
}

#[must_use]
pub fn decide(rng: &mut RandomGenerator) -> TriageCall {
    if rng.chance(SENT_HOME_PERCENT) {
        return TriageCall::SendHome;
    }
    let colour = TriageColour::from_roll(rng.percent());
    let specialty = Specialty::from_index(rng.index(SPECIALIST_COUNT)).unwrap_or(Specialty::Cardiologist);
    TriageCall::Route { specialty, colour }
}

/// Carry out `call` for one patient.
pub async fn apply(ctx: &WorkerContext, envelope: Envelope, call: TriageCall) -> Result<TriageDecision, RoleError> {
    let patient_id = envelope.patient_id;
    let (specialty, colour) = match call {
        TriageCall::SendHome => {
            ctx.ipc
                .release_with(envelope.permits_owed(), |state| state.triage_sent_home += 1)?;
            ctx.log.log(format!("Patient {patient_id} sent home from triage"));
            return Ok(TriageDecision::SentHome);
        }
        TriageCall::Route { specialty, colour } => (specialty, colour),
    };

    ctx.ipc.store.with_state(|state| state.record_colour(colour))?;
    let owed = envelope.permits_owed();
    let forward = envelope.for_specialist(specialty, colour);

    match ctx
        .ipc
        .specialist(specialty)
        .send_with_retry(&forward, ctx.retry, &ctx.shutdown)
        .await
    {
        Ok(()) => {
            ctx.log.log(format!("Patient {patient_id} -> {colour}, {specialty}"));
            Ok(TriageDecision::Forwarded { specialty, colour })
        }
        Err(e) => {
            ctx.ipc.release_dropped(owed)?;
            ctx.log.log(format!("Patient {patient_id} dropped after triage ({e})"));
            Ok(TriageDecision::Dropped)
        }
    }
}

/// Examine one patient: service time, decision, routing.
pub async fn assess(
    ctx: &WorkerContext,
    envelope: Envelope,
    rng: &mut RandomGenerator,
) -> Result<TriageDecision, RoleError> {
    tokio::time::sleep(rng.duration_in(ctx.timing.triage)).await;
    let call = decide(rng);
    apply(ctx, envelope, call).await
}

pub async fn run(mut ctx: WorkerContext) -> Result<(), RoleError> {
    let mut rng = ctx.rng();
    let mut handled = 0u64;
    ctx.log.log("Triage open");

    loop {
        let envelope = match ctx.ipc.triage.receive(priority::TRIAGE_CEILING, &mut ctx.shutdown).await {
            Ok(envelope) => envelope,
            Err(e) if e.ends_loop() => {
                debug!("Triage loop ends: {}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        match assess(&ctx, envelope, &mut rng).await {
            Ok(_) => handled += 1,
            Err(RoleError::Ipc(e)) if e.ends_loop() => break,
            Err(e) => return Err(e),
        }
    }

    info!("Triage closing after {} patients", handled);
    ctx.log.log("Triage closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PatientUnit;
    use crate::roles::test_support::Harness;
    use crate::roles::Role;
    use crate::timing::ReleasePoint;

    fn admitted(harness: &Harness, unit: &PatientUnit, holds: bool) -> Result<Envelope, Box<dyn std::error::Error>> {
        assert!(harness.ipc().gate.try_acquire(unit.person_count)?);
        harness.ipc().store.with_state(|s| s.admit(unit.person_count))?;
        Ok(Envelope::arrival(unit).for_triage(holds))
    }

    #[test]
    fn test_decide_distribution() {
        let mut rng = RandomGenerator::seeded(99);
        let mut home = 0;
        let mut red = 0;
        for _ in 0..10_000 {
            match decide(&mut rng) {
                TriageCall::SendHome => home += 1,
                TriageCall::Route {
                    colour: TriageColour::Red, ..
                } => red += 1,
                TriageCall::Route { .. } => {}
            }
        }
        assert!((300..700).contains(&home), "sent home {home}");
        assert!((650..1250).contains(&red), "red {red}");
    }

    #[tokio::test]
    async fn test_send_home_releases_held_permits() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::new(10, ReleasePoint::Terminal)?;
        let ctx = harness.context(Role::Triage);
        let envelope = admitted(&harness, &PatientUnit::new(1, 9, false), true)?;
        assert_eq!(harness.ipc().gate.value()?, 8);

        assert_eq!(apply(&ctx, envelope, TriageCall::SendHome).await?, TriageDecision::SentHome);
        let state = harness.ipc().store.snapshot();
        assert_eq!(state.triage_sent_home, 1);
        assert_eq!(state.current_in_waiting_room, 0);
        assert_eq!(harness.ipc().gate.value()?, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_route_keeps_permits_with_message() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::new(10, ReleasePoint::Terminal)?;
        let ctx = harness.context(Role::Triage);
        let envelope = admitted(&harness, &PatientUnit::new(2, 40, false), true)?;
        let call = TriageCall::Route {
            specialty: Specialty::Surgeon,
            colour: TriageColour::Red,
        };

        let decision = apply(&ctx, envelope, call).await?;
        assert!(matches!(decision, TriageDecision::Forwarded { .. }));
        assert_eq!(harness.ipc().gate.value()?, 9);
        assert_eq!(harness.ipc().store.snapshot().triage_red, 1);

        let channel = harness.ipc().specialist(Specialty::Surgeon);
        let Some(forwarded) = channel.try_receive(priority::specialist_ceiling(Specialty::Surgeon))? else {
            panic!("expected a specialist message");
        };
        assert_eq!(forwarded.priority, priority::specialist(Specialty::Surgeon, TriageColour::Red));
        assert!(forwarded.holds_permits);
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_on_full_specialist_channel() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::new(10, ReleasePoint::Terminal)?;
        let ctx = harness.context(Role::Triage);
        let channel = *harness.ipc().specialist(Specialty::Cardiologist);
        channel.limit_to_one_envelope()?;
        channel.try_send(&Envelope::arrival(&PatientUnit::new(90, 70, false)).for_specialist(
            Specialty::Cardiologist,
            TriageColour::Green,
        ))?;

        let envelope = admitted(&harness, &PatientUnit::new(3, 50, false), true)?;
        let call = TriageCall::Route {
            specialty: Specialty::Cardiologist,
            colour: TriageColour::Yellow,
        };
        assert_eq!(apply(&ctx, envelope, call).await?, TriageDecision::Dropped);
        assert_eq!(harness.ipc().store.snapshot().dropped_units, 1);
        assert_eq!(harness.ipc().gate.value()?, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_when_specialist_channel_is_gone() -> Result<(), Box<dyn std::error::Error>> {
        let harness = Harness::new(10, ReleasePoint::Terminal)?;
        let ctx = harness.context(Role::Triage);
        harness.ipc().specialist(Specialty::Laryngologist).remove()?;

        let envelope = admitted(&harness, &PatientUnit::new(5, 33, false), true)?;
        let call = TriageCall::Route {
            specialty: Specialty::Laryngologist,
            colour: TriageColour::Red,
        };
        assert_eq!(apply(&ctx, envelope, call).await?, TriageDecision::Dropped);

        let state = harness.ipc().store.snapshot();
        assert_eq!(state.dropped_units, 1);
        assert_eq!(state.current_in_waiting_room, 0);
        assert_eq!(harness.ipc().gate.value()?, 10);
        Ok(())
    }
}
