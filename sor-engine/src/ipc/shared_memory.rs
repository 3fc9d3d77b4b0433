//! The shared state segment and its mutex-guarded accessor.

use super::keys::{is_private, IpcKey};
use super::semaphore::StateMutex;
use super::{IpcError, Result, IPC_MODE};
use crate::messages::{Outcome, Specialty, TriageColour, SPECIALIST_COUNT};
use crate::timing::{MsRange, ReleasePoint, Timing};
use nix::errno::Errno;
use std::ptr::NonNull;
use std::time::Duration;
use tracing::warn;

/// Counters, tallies, timing constants and PIDs shared by all processes.
///
/// The layout is fixed (`repr(C)`) and the segment starts zeroed. Every
/// field except the timing constants is written under [`StateMutex`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedState {
    pub current_in_waiting_room: i32,
    pub waiting_room_capacity: i32,
    pub queue_registration_len: i32,
    pub reg2_active: i32,
    pub total_patients: i32,

    pub triage_red: i32,
    pub triage_yellow: i32,
    pub triage_green: i32,
    pub triage_sent_home: i32,

    pub outcome_home: i32,
    pub outcome_ward: i32,
    pub outcome_other: i32,
    pub dropped_units: i32,

    pub specialist_handled: [i32; SPECIALIST_COUNT],
    pub specialist_home: [i32; SPECIALIST_COUNT],
    pub specialist_ward: [i32; SPECIALIST_COUNT],
    pub specialist_other: [i32; SPECIALIST_COUNT],
    pub specialist_leaves: [i32; SPECIALIST_COUNT],

    pub director_pid: i32,
    pub logger_pid: i32,
    pub registration1_pid: i32,
    pub registration2_pid: i32,
    pub triage_pid: i32,
    pub generator_pid: i32,
    pub specialist_pids: [i32; SPECIALIST_COUNT],

    pub ms_per_sim_minute: i64,
    pub simulation_duration_minutes: i64,
    pub arrival_min_ms: i64,
    pub arrival_max_ms: i64,
    pub registration_min_ms: i64,
    pub registration_max_ms: i64,
    pub triage_min_ms: i64,
    pub triage_max_ms: i64,
    pub exam_min_ms: i64,
    pub exam_max_ms: i64,
    pub leave_min_ms: i64,
    pub leave_max_ms: i64,
    pub max_live_patients: i64,
    pub send_retry_limit: i64,
    pub send_backoff_ms: i64,
    pub poll_interval_ms: i64,
    pub seed: i64,
    pub release_point: i64,
    pub sim_start_monotonic_ms: i64,
}

fn range(min: i64, max: i64) -> MsRange {
    MsRange::new(min.max(0) as u64, max.max(0) as u64)
}

impl SharedState {
    /// Read the timing constants back.
    #[must_use]
    pub fn timing(&self) -> Timing {
        Timing {
            ms_per_sim_minute: self.ms_per_sim_minute.max(0) as u64,
            duration_minutes: self.simulation_duration_minutes.max(0) as u64,
            arrival: range(self.arrival_min_ms, self.arrival_max_ms),
            registration: range(self.registration_min_ms, self.registration_max_ms),
            triage: range(self.triage_min_ms, self.triage_max_ms),
            exam: range(self.exam_min_ms, self.exam_max_ms),
            leave: range(self.leave_min_ms, self.leave_max_ms),
            max_live_patients: self.max_live_patients.clamp(0, i64::from(u32::MAX)) as u32,
            send_retry_limit: self.send_retry_limit.clamp(0, i64::from(u32::MAX)) as u32,
            send_backoff: Duration::from_millis(self.send_backoff_ms.max(0) as u64),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1) as u64),
            seed: self.seed as u64,
            release_point: ReleasePoint::from_code(self.release_point),
            sim_start_ms: self.sim_start_monotonic_ms,
        }
    }

    /// Store the timing constants. Only the director calls this, before spawning.
    pub fn set_timing(&mut self, timing: &Timing) {
        self.ms_per_sim_minute = timing.ms_per_sim_minute as i64;
        self.simulation_duration_minutes = timing.duration_minutes as i64;
        self.arrival_min_ms = timing.arrival.min as i64;
        self.arrival_max_ms = timing.arrival.max as i64;
        self.registration_min_ms = timing.registration.min as i64;
        self.registration_max_ms = timing.registration.max as i64;
        self.triage_min_ms = timing.triage.min as i64;
        self.triage_max_ms = timing.triage.max as i64;
        self.exam_min_ms = timing.exam.min as i64;
        self.exam_max_ms = timing.exam.max as i64;
        self.leave_min_ms = timing.leave.min as i64;
        self.leave_max_ms = timing.leave.max as i64;
        self.max_live_patients = i64::from(timing.max_live_patients);
        self.send_retry_limit = i64::from(timing.send_retry_limit);
        self.send_backoff_ms = timing.send_backoff.as_millis() as i64;
        self.poll_interval_ms = timing.poll_interval.as_millis() as i64;
        self.seed = timing.seed as i64;
        self.release_point = timing.release_point.code();
        self.sim_start_monotonic_ms = timing.sim_start_ms;
    }

    /// A unit of `persons` entered the waiting room and joined the registration backlog.
    pub fn admit(&mut self, persons: i32) {
        self.current_in_waiting_room += persons;
        self.queue_registration_len += 1;
        self.total_patients += 1;
    }

    /// `persons` left the waiting room. Clamped at zero.
    pub fn leave_waiting_room(&mut self, persons: i32) {
        self.current_in_waiting_room = (self.current_in_waiting_room - persons).max(0);
    }

    /// A registration worker took one unit off the backlog. Clamped at zero.
    pub fn dequeue_registration(&mut self) {
        self.queue_registration_len = (self.queue_registration_len - 1).max(0);
    }

    pub fn record_colour(&mut self, colour: TriageColour) {
        match colour {
            TriageColour::Red => self.triage_red += 1,
            TriageColour::Yellow => self.triage_yellow += 1,
            TriageColour::Green => self.triage_green += 1,
        }
    }

    pub fn record_outcome(&mut self, specialty: Specialty, outcome: Outcome) {
        let i = specialty.index();
        self.specialist_handled[i] += 1;
        match outcome {
            Outcome::Home => {
                self.outcome_home += 1;
                self.specialist_home[i] += 1;
            }
            Outcome::Ward => {
                self.outcome_ward += 1;
                self.specialist_ward[i] += 1;
            }
            Outcome::OtherFacility => {
                self.outcome_other += 1;
                self.specialist_other[i] += 1;
            }
        }
    }

    /// Gate value implied by the occupancy counter.
    #[must_use]
    pub fn expected_gate_value(&self) -> i32 {
        self.waiting_room_capacity - self.current_in_waiting_room
    }

    /// Units that reached a terminal tally (sent home, treated or dropped).
    #[must_use]
    pub fn terminal_count(&self) -> i32 {
        self.triage_sent_home + self.outcome_home + self.outcome_ward + self.outcome_other + self.dropped_units
    }
}

/// An attached SysV shared memory segment holding one [`SharedState`].
#[derive(Debug)]
pub struct SharedSegment {
    id: libc::c_int,
    ptr: NonNull<SharedState>,
}

// SAFETY: the mapping stays valid until drop, and every mutation goes
// through `SharedStore::with_state`, serialised by the cross-process mutex.
unsafe impl Send for SharedSegment {}
// SAFETY: see above.
unsafe impl Sync for SharedSegment {}

const STATE_SIZE: usize = std::mem::size_of::<SharedState>();

impl SharedSegment {
    /// Create (or reuse) the segment for `key`, attach it and zero it.
    pub fn create(key: IpcKey) -> Result<Self> {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let id = unsafe { libc::shmget(key, STATE_SIZE, libc::IPC_CREAT | IPC_MODE) };
        if id == -1 {
            return Err(IpcError::Os {
                op: "shmget",
                source: Errno::last(),
            });
        }
        let segment = Self::attach(id)?;
        // SAFETY: the mapping is at least STATE_SIZE bytes and nobody else
        // uses it before the director spawns workers.
        unsafe { segment.ptr.as_ptr().write_bytes(0, 1) };
        Ok(segment)
    }

    /// Attach an existing segment.
    pub fn open(key: IpcKey) -> Result<Self> {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let id = unsafe { libc::shmget(key, STATE_SIZE, 0) };
        if id == -1 {
            return Err(match Errno::last() {
                Errno::ENOENT => IpcError::NotFound { key },
                source => IpcError::Os { op: "shmget", source },
            });
        }
        Self::attach(id)
    }

    fn attach(id: libc::c_int) -> Result<Self> {
        // SAFETY: a null address lets the kernel choose the mapping.
        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(IpcError::last("shmat"));
        }
        let ptr = NonNull::new(addr.cast::<SharedState>())
            .ok_or_else(|| IpcError::InvalidArgument("shmat returned null".to_string()))?;
        Ok(Self { id, ptr })
    }

    #[must_use]
    pub const fn id(&self) -> libc::c_int {
        self.id
    }

    /// Mark the segment for removal. The kernel frees it after the last detach.
    pub fn remove(&self) -> Result<()> {
        remove_segment(self.id)
    }

    fn as_ptr(&self) -> *mut SharedState {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr came from shmat and is detached exactly once.
        let rc = unsafe { libc::shmdt(self.ptr.as_ptr().cast::<libc::c_void>()) };
        if rc == -1 {
            warn!("Failed to detach shared segment {}: {}", self.id, Errno::last());
        }
    }
}

pub(crate) fn remove_segment(id: libc::c_int) -> Result<()> {
    // SAFETY: IPC_RMID ignores the buffer argument.
    let rc = unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
    if rc == -1 {
        return match IpcError::last("shmctl(IPC_RMID)") {
            IpcError::Removed { .. } => Ok(()),
            err => Err(err),
        };
    }
    Ok(())
}

/// Remove a leftover segment for `key`. Returns whether one existed.
pub fn remove_if_exists(key: IpcKey) -> Result<bool> {
    if is_private(key) {
        return Ok(false);
    }
    // SAFETY: plain syscall wrapper, no pointers involved.
    let id = unsafe { libc::shmget(key, 0, 0) };
    if id == -1 {
        return match Errno::last() {
            Errno::ENOENT => Ok(false),
            source => Err(IpcError::Os { op: "shmget", source }),
        };
    }
    remove_segment(id).map(|()| true)
}

/// The state segment paired with the mutex that guards it.
#[derive(Debug)]
pub struct SharedStore {
    segment: SharedSegment,
    mutex: StateMutex,
}

impl SharedStore {
    #[must_use]
    pub fn new(segment: SharedSegment, mutex: StateMutex) -> Self {
        Self { segment, mutex }
    }

    /// Run `f` on the state while holding the mutex.
    ///
    /// The lock is released on every exit path, including a panic in `f`.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> Result<R> {
        let _guard = self.mutex.lock()?;
        // SAFETY: the mutex serialises all writers across processes, and
        // within this process the guard prevents a second live &mut.
        let state = unsafe { &mut *self.segment.as_ptr() };
        Ok(f(state))
    }

    /// Unsynchronised copy of the state.
    ///
    /// Fields may be torn or stale; only for logging and monitoring.
    #[must_use]
    pub fn snapshot(&self) -> SharedState {
        // SAFETY: the mapping is valid and SharedState is plain old data.
        unsafe { std::ptr::read_volatile(self.segment.as_ptr()) }
    }

    #[must_use]
    pub fn mutex(&self) -> &StateMutex {
        &self.mutex
    }

    #[must_use]
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_store() -> Result<SharedStore> {
        let mutex = StateMutex::create(libc::IPC_PRIVATE)?;
        let segment = SharedSegment::create(libc::IPC_PRIVATE)?;
        Ok(SharedStore::new(segment, mutex))
    }

    fn destroy(store: SharedStore) -> Result<()> {
        store.segment().remove()?;
        store.mutex().remove()
    }

    #[test]
    fn test_segment_starts_zeroed() -> Result<()> {
        let store = private_store()?;
        assert_eq!(store.snapshot(), SharedState::default());
        destroy(store)
    }

    #[test]
    fn test_with_state_mutates_and_unlocks() -> Result<()> {
        let store = private_store()?;
        store.with_state(|s| {
            s.waiting_room_capacity = 10;
            s.admit(2);
        })?;
        assert_eq!(store.mutex().value()?, 1);

        let snap = store.snapshot();
        assert_eq!(snap.current_in_waiting_room, 2);
        assert_eq!(snap.queue_registration_len, 1);
        assert_eq!(snap.total_patients, 1);
        assert_eq!(snap.expected_gate_value(), 8);
        destroy(store)
    }

    #[test]
    fn test_counters_clamp_at_zero() {
        let mut state = SharedState::default();
        state.admit(1);
        state.leave_waiting_room(5);
        state.dequeue_registration();
        state.dequeue_registration();
        assert_eq!(state.current_in_waiting_room, 0);
        assert_eq!(state.queue_registration_len, 0);
    }

    #[test]
    fn test_outcome_tallies() {
        let mut state = SharedState::default();
        state.record_outcome(Specialty::Surgeon, Outcome::Ward);
        state.record_outcome(Specialty::Surgeon, Outcome::Home);
        state.record_colour(TriageColour::Red);
        assert_eq!(state.specialist_handled[4], 2);
        assert_eq!(state.specialist_ward[4], 1);
        assert_eq!(state.outcome_home, 1);
        assert_eq!(state.triage_red, 1);
        assert_eq!(state.terminal_count(), 2);
    }

    #[test]
    fn test_timing_round_trip() {
        let timing = Timing {
            arrival: MsRange::new(50, 250),
            exam: MsRange::new(50, 200),
            release_point: ReleasePoint::Terminal,
            sim_start_ms: 1234,
            ..Timing::default()
        };
        let mut state = SharedState::default();
        state.set_timing(&timing);
        assert_eq!(state.timing(), timing);
    }

    #[test]
    fn test_removed_segment_stays_attached() -> Result<()> {
        let store = private_store()?;
        store.segment().remove()?;
        // Removal is deferred until detach; the mapping is still usable.
        store.with_state(|s| s.total_patients = 3)?;
        assert_eq!(store.snapshot().total_patients, 3);
        store.segment().remove()?;
        store.mutex().remove()
    }
}
