//! Provisioning, opening and teardown of the full IPC object set.

use super::channel::{self, PriorityChannel};
use super::keys::{IpcKeys, ResourceTag};
use super::semaphore::{self, CapacityGate, Semaphore, StateMutex};
use super::shared_memory::{self, SharedSegment, SharedState, SharedStore};
use super::{IpcError, Result};
use crate::event_log::Metrics;
use crate::messages::{Specialty, SPECIALIST_COUNT};
use crate::timing::{elapsed_sim_minutes, monotonic_ms, Timing};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handles to every IPC object of a run.
#[derive(Debug)]
pub struct IpcHandles {
    pub log: PriorityChannel,
    pub registration: PriorityChannel,
    pub triage: PriorityChannel,
    pub specialists: [PriorityChannel; SPECIALIST_COUNT],
    pub gate: CapacityGate,
    pub store: SharedStore,
}

impl IpcHandles {
    /// Open the objects the director created for `keys`.
    pub fn open(keys: &IpcKeys) -> Result<Self> {
        let mutex = StateMutex::open(keys.mutex)?;
        let segment = SharedSegment::open(keys.state)?;
        let store = SharedStore::new(segment, mutex);
        // Timing constants are written before any worker exists.
        let poll = store.snapshot().timing().poll_interval;

        let mut specialists = [PriorityChannel::open(keys.specialists[0], poll)?; SPECIALIST_COUNT];
        for specialty in Specialty::ALL.iter().skip(1) {
            specialists[specialty.index()] = PriorityChannel::open(keys.specialists[specialty.index()], poll)?;
        }

        Ok(Self {
            log: PriorityChannel::open(keys.log, poll)?,
            registration: PriorityChannel::open(keys.registration, poll)?,
            triage: PriorityChannel::open(keys.triage, poll)?,
            specialists,
            gate: CapacityGate::open(keys.gate, poll)?,
            store,
        })
    }

    #[must_use]
    pub fn specialist(&self, specialty: Specialty) -> &PriorityChannel {
        &self.specialists[specialty.index()]
    }

    /// Timing constants from the state segment.
    #[must_use]
    pub fn timing(&self) -> Timing {
        self.store.snapshot().timing()
    }

    /// Simulated minutes since the run started.
    #[must_use]
    pub fn sim_minutes(&self) -> i64 {
        let state = self.store.snapshot();
        elapsed_sim_minutes(
            state.sim_start_monotonic_ms,
            monotonic_ms(),
            state.ms_per_sim_minute.max(0) as u64,
        )
    }

    /// Return `persons` permits and run `update`, in one critical section.
    ///
    /// Occupancy is decremented before the gate is posted so an observer
    /// holding the mutex never sees more permits than free places.
    pub fn release_with(&self, persons: i32, update: impl FnOnce(&mut SharedState)) -> Result<()> {
        self.store.with_state(|state| {
            update(state);
            state.leave_waiting_room(persons);
            self.gate.release(persons)
        })?
    }

    /// Release the permits of a unit that was lost in transit and count the drop.
    pub fn release_dropped(&self, persons: i32) -> Result<()> {
        self.release_with(persons, |state| state.dropped_units += 1)
    }

    /// Registration backlog: the larger of the queue depth and the shared
    /// counter; the counter alone if the queue cannot be probed.
    #[must_use]
    pub fn registration_backlog(&self) -> i32 {
        let counter = self.store.snapshot().queue_registration_len;
        crate::director::scaling::backlog_estimate(self.registration.depth().ok(), counter)
    }

    /// Unsynchronised metrics for one log line.
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        let state = self.store.snapshot();
        let depth = |channel: &PriorityChannel| channel.depth().unwrap_or(0);
        Metrics {
            inside: state.current_in_waiting_room,
            capacity: state.waiting_room_capacity,
            registration_queue: depth(&self.registration),
            triage_queue: depth(&self.triage),
            specialist_queue: self.specialists.iter().map(depth).sum(),
            gate: self.gate.value().unwrap_or(-1),
            mutex: self.store.mutex().value().unwrap_or(-1),
        }
    }
}

/// Parameters for creating the object set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionSettings {
    pub capacity: i32,
    pub queue_bytes: usize,
    pub poll: Duration,
}

#[derive(Debug, Default)]
struct Created {
    semaphores: Vec<Semaphore>,
    segment: Option<libc::c_int>,
    channels: Vec<PriorityChannel>,
}

impl Created {
    /// Remove everything recorded so far. Later calls find nothing to do.
    fn remove_all(&mut self) -> Vec<IpcError> {
        let mut errors = Vec::new();
        for channel in self.channels.drain(..) {
            if let Err(e) = channel.remove() {
                errors.push(e);
            }
        }
        if let Some(id) = self.segment.take() {
            if let Err(e) = shared_memory::remove_segment(id) {
                errors.push(e);
            }
        }
        for sem in self.semaphores.drain(..) {
            if let Err(e) = sem.remove() {
                errors.push(e);
            }
        }
        errors
    }

    fn is_empty(&self) -> bool {
        self.semaphores.is_empty() && self.segment.is_none() && self.channels.is_empty()
    }
}

/// The object set owned by the director.
///
/// Teardown runs on [`IpcResources::teardown`] or, failing that, on drop.
#[derive(Debug)]
pub struct IpcResources {
    handles: Arc<IpcHandles>,
    created: Created,
}

impl IpcResources {
    /// Remove objects left behind under `keys` by an earlier run.
    ///
    /// Best effort: a simulation still running with the same key path loses
    /// its objects. Returns how many were removed.
    pub fn reset_if_exists(keys: &IpcKeys) -> usize {
        let mut removed = 0;
        for (tag, key) in keys.all() {
            let outcome = match tag {
                ResourceTag::Gate | ResourceTag::Mutex => semaphore::remove_if_exists(key),
                ResourceTag::State => shared_memory::remove_if_exists(key),
                _ => channel::remove_if_exists(key),
            };
            match outcome {
                Ok(true) => {
                    removed += 1;
                    info!("Removed stale IPC object '{}' (key {:#x})", tag.as_char(), key);
                }
                Ok(false) => {}
                Err(e) => warn!("Could not reset IPC object '{}': {}", tag.as_char(), e),
            }
        }
        removed
    }

    /// Create every object. On failure, whatever was created is removed again.
    pub fn provision(keys: &IpcKeys, settings: &ProvisionSettings) -> Result<Self> {
        let mut created = Created::default();
        match Self::create_all(keys, settings, &mut created) {
            Ok(handles) => Ok(Self {
                handles: Arc::new(handles),
                created,
            }),
            Err(e) => {
                for err in created.remove_all() {
                    warn!("Cleanup after failed provisioning: {}", err);
                }
                Err(e)
            }
        }
    }

    fn create_all(keys: &IpcKeys, settings: &ProvisionSettings, created: &mut Created) -> Result<IpcHandles> {
        let gate = CapacityGate::create(keys.gate, settings.capacity, settings.poll)?;
        created.semaphores.push(gate.semaphore());

        let mutex = StateMutex::create(keys.mutex)?;
        created.semaphores.push(mutex.semaphore());

        let segment = SharedSegment::create(keys.state)?;
        created.segment = Some(segment.id());
        let store = SharedStore::new(segment, mutex);

        let mut open_channel = |key| -> Result<PriorityChannel> {
            let channel = PriorityChannel::create(key, settings.poll)?;
            created.channels.push(channel);
            if settings.queue_bytes > 0 {
                if let Err(e) = channel.tune_capacity(settings.queue_bytes) {
                    debug!("Keeping default queue size for channel {}: {}", channel.id(), e);
                }
            }
            Ok(channel)
        };

        let log = open_channel(keys.log)?;
        let registration = open_channel(keys.registration)?;
        let triage = open_channel(keys.triage)?;
        let mut specialists = [log; SPECIALIST_COUNT];
        for specialty in Specialty::ALL {
            specialists[specialty.index()] = open_channel(keys.specialists[specialty.index()])?;
        }

        Ok(IpcHandles {
            log,
            registration,
            triage,
            specialists,
            gate,
            store,
        })
    }

    #[must_use]
    pub fn handles(&self) -> &Arc<IpcHandles> {
        &self.handles
    }

    /// Remove every object, continuing past individual failures.
    ///
    /// A second call is a no-op and returns no errors.
    pub fn teardown(&mut self) -> Vec<IpcError> {
        self.created.remove_all()
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.created.is_empty()
    }
}

impl Drop for IpcResources {
    fn drop(&mut self) {
        for err in self.teardown() {
            warn!("IPC teardown: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(capacity: i32) -> ProvisionSettings {
        ProvisionSettings {
            capacity,
            queue_bytes: 0,
            poll: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_provision_private_set() -> Result<()> {
        let mut resources = IpcResources::provision(&IpcKeys::private(), &settings(10))?;
        let ipc = Arc::clone(resources.handles());

        assert_eq!(ipc.gate.value()?, 10);
        assert_eq!(ipc.store.mutex().value()?, 1);
        assert_eq!(ipc.store.snapshot(), SharedState::default());
        assert_eq!(ipc.registration_backlog(), 0);

        let metrics = ipc.metrics();
        assert_eq!(metrics.gate, 10);
        assert_eq!(metrics.mutex, 1);

        assert!(resources.teardown().is_empty());
        assert!(resources.is_torn_down());
        Ok(())
    }

    #[test]
    fn test_teardown_is_idempotent() -> Result<()> {
        let mut resources = IpcResources::provision(&IpcKeys::private(), &settings(4))?;
        let ipc = Arc::clone(resources.handles());
        assert!(resources.teardown().is_empty());
        assert!(resources.teardown().is_empty());

        assert!(ipc.gate.value().err().is_some_and(|e| e.is_removed()));
        assert!(ipc.triage.depth().err().is_some_and(|e| e.is_removed()));
        Ok(())
    }

    #[test]
    fn test_release_with_restores_gate_and_occupancy() -> Result<()> {
        let resources = IpcResources::provision(&IpcKeys::private(), &settings(10))?;
        let ipc = resources.handles();

        assert!(ipc.gate.try_acquire(2)?);
        ipc.store.with_state(|s| {
            s.waiting_room_capacity = 10;
            s.admit(2);
        })?;
        assert_eq!(ipc.gate.value()?, 8);

        ipc.release_dropped(2)?;
        let state = ipc.store.snapshot();
        assert_eq!(state.current_in_waiting_room, 0);
        assert_eq!(state.dropped_units, 1);
        assert_eq!(ipc.gate.value()?, 10);
        assert_eq!(ipc.gate.value()? + state.current_in_waiting_room, state.waiting_room_capacity);
        Ok(())
    }

    #[test]
    fn test_backlog_uses_queue_depth() -> Result<()> {
        let resources = IpcResources::provision(&IpcKeys::private(), &settings(10))?;
        let ipc = resources.handles();
        let unit = crate::messages::PatientUnit::new(1, 30, false);
        ipc.registration.try_send(&crate::messages::Envelope::arrival(&unit))?;
        ipc.registration.try_send(&crate::messages::Envelope::arrival(&unit))?;
        ipc.store.with_state(|s| s.queue_registration_len = 1)?;
        assert_eq!(ipc.registration_backlog(), 2);
        ipc.store.with_state(|s| s.queue_registration_len = 5)?;
        assert_eq!(ipc.registration_backlog(), 5);
        Ok(())
    }
}
