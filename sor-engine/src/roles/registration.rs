//! Registration window. `reg1` runs for the whole simulation, `reg2` only
//! while the director keeps it open.

use super::{RoleError, WorkerContext};
use crate::messages::{priority, Envelope};
use crate::random::RandomGenerator;
use crate::timing::ReleasePoint;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const HEARTBEAT: Duration = Duration::from_secs(5);

/// What happened to a registered unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Forwarded,
    /// Triage was unreachable; permits were returned here.
    Dropped,
}

/// Register one unit taken off the registration channel and pass it to triage.
///
/// A triage channel that is full or gone costs the unit, not the worker:
/// its permits are returned and a drop is counted.
pub async fn register(
    ctx: &WorkerContext,
    envelope: Envelope,
    rng: &mut RandomGenerator,
) -> Result<Handoff, RoleError> {
    ctx.ipc.store.with_state(|state| state.dequeue_registration())?;
    ctx.log.log(format!("Registering patient {} ({})", envelope.patient_id, envelope.kind()));

    tokio::time::sleep(rng.duration_in(ctx.timing.registration)).await;

    let owed = envelope.permits_owed();
    let release_here = ctx.timing.release_point == ReleasePoint::Registration;
    let patient_id = envelope.patient_id;
    let forward = envelope.for_triage(owed > 0 && !release_here);

    match ctx.ipc.triage.send_with_retry(&forward, ctx.retry, &ctx.shutdown).await {
        Ok(()) => {
            if release_here && owed > 0 {
                ctx.ipc.release_with(owed, |_| {})?;
            }
            ctx.log.log(format!("Patient {patient_id} registered, sent to triage"));
            Ok(Handoff::Forwarded)
        }
        Err(e) => {
            ctx.ipc.release_dropped(owed)?;
            ctx.log.log(format!("Patient {patient_id} dropped after registration ({e})"));
            Ok(Handoff::Dropped)
        }
    }
}

fn heartbeat(ctx: &WorkerContext) {
    // Monitoring only; stale values are fine.
    let state = ctx.ipc.store.snapshot();
    let depth = ctx.ipc.registration.depth().unwrap_or(0);
    let gate = ctx.ipc.gate.value().unwrap_or(-1);
    debug!(
        role = %ctx.role(),
        depth,
        gate,
        inside = state.current_in_waiting_room,
        "registration heartbeat"
    );
    ctx.log.log(format!(
        "heartbeat queue={depth} gate={gate} inside={}",
        state.current_in_waiting_room
    ));
}

pub async fn run(mut ctx: WorkerContext) -> Result<(), RoleError> {
    let mut rng = ctx.rng();
    let mut last_beat = Instant::now();
    let mut handled = 0u64;
    ctx.log.log("Registration window open");

    loop {
        if last_beat.elapsed() >= HEARTBEAT {
            heartbeat(&ctx);
            last_beat = Instant::now();
        }

        let envelope = tokio::select! {
            received = ctx.ipc.registration.receive(priority::REGISTRATION_CEILING, &mut ctx.shutdown) => received,
            () = tokio::time::sleep(HEARTBEAT) => continue,
        };
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) if e.ends_loop() => {
                debug!("Registration loop ends: {}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        };

        match register(&ctx, envelope, &mut rng).await {
            Ok(_) => handled += 1,
            Err(RoleError::Ipc(e)) if e.ends_loop() => break,
            Err(e) => return Err(e),
        }
    }

    info!("{} closing after {} patients", ctx.role(), handled);
    ctx.log.log("Registration window closed");
    Ok(())
}
