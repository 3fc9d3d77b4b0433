//! One arriving unit: a patient, plus a guardian for minors.

use super::{RoleError, WorkerContext};
use crate::ipc::IpcError;
use crate::messages::{Envelope, PatientUnit};
use std::time::Duration;
use tracing::{debug, warn};

/// Where a patient process ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientState {
    Outside,
    Admitted,
    SentToRegistration,
    DroppedOnRegistrationFailure,
    /// Shutdown arrived before admission; nothing was held.
    Abandoned,
}

/// Wait for room for the whole unit and enter the waiting room.
///
/// Returns [`PatientState::Abandoned`] if shutdown arrives first.
pub async fn admit(ctx: &mut WorkerContext, unit: &PatientUnit) -> Result<PatientState, RoleError> {
    match ctx.ipc.gate.acquire(unit.person_count, &mut ctx.shutdown).await {
        Ok(()) => {}
        Err(e) if e.is_interrupted() => return Ok(PatientState::Abandoned),
        Err(e) => return Err(e.into()),
    }

    let persons = unit.person_count;
    if let Err(e) = ctx.ipc.store.with_state(|state| state.admit(persons)) {
        // Permits are useless if the state is gone, but give them back anyway.
        if let Err(release) = ctx.ipc.gate.release(persons) {
            warn!("Failed to return {} permits after a failed admission: {}", persons, release);
        }
        return Err(e.into());
    }
    Ok(PatientState::Admitted)
}

/// Queue an admitted unit for registration.
///
/// On a failed send the unit undoes its backlog entry and returns its
/// permits itself.
pub async fn hand_off(ctx: &WorkerContext, unit: &PatientUnit) -> Result<PatientState, RoleError> {
    let envelope = Envelope::arrival(unit);
    match ctx
        .ipc
        .registration
        .send_with_retry(&envelope, ctx.retry, &ctx.shutdown)
        .await
    {
        Ok(()) => {
            ctx.log.log(format!(
                "Patient {} ({}, age {}, persons {}) waiting for registration",
                unit.id,
                envelope.kind(),
                unit.age,
                unit.person_count
            ));
            Ok(PatientState::SentToRegistration)
        }
        Err(e) => {
            ctx.ipc.release_with(unit.person_count, |state| {
                state.dequeue_registration();
                state.dropped_units += 1;
            })?;
            ctx.log.log(format!("Patient {} dropped: registration unreachable ({e})", unit.id));
            Ok(PatientState::DroppedOnRegistrationFailure)
        }
    }
}

/// Log-only companion for a minor's guardian. Holds no permits.
async fn accompany(mut ctx: WorkerContext, patient_id: i32) {
    ctx.log.log(format!("Guardian of patient {patient_id} arrived"));
    while ctx.pause(Duration::from_secs(1)).await {}
    debug!("Guardian of patient {} leaving", patient_id);
}

/// Whole life of a patient process.
pub async fn run(mut ctx: WorkerContext, unit: PatientUnit) -> Result<PatientState, RoleError> {
    let companion = unit.has_guardian.then(|| tokio::spawn(accompany(ctx.clone(), unit.id)));

    let state = match admit(&mut ctx, &unit).await? {
        PatientState::Admitted => hand_off(&ctx, &unit).await,
        other => Ok(other),
    };

    if let Some(task) = companion {
        task.abort();
    }
    if let Err(RoleError::Ipc(IpcError::Removed { op })) = &state {
        warn!("Patient {} stopped: IPC object removed during {}", unit.id, op);
    }
    state
}
