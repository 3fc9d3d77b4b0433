//! Priority message channels over SysV message queues.
//!
//! A receive with ceiling `c` takes the lowest-keyed message whose key is
//! at most `c` (`msgrcv` with a negative type). Sends never block: a full
//! queue is reported as [`IpcError::Full`] and the caller decides whether
//! to retry.

use super::keys::{is_private, IpcKey};
use super::{IpcError, Result, IPC_MODE};
use crate::event_log::LogRecord;
use crate::messages::{priority, Envelope, Specialty, TriageColour};
use crate::shutdown::Shutdown;
use crate::timing::Timing;
use libc::{c_int, c_long};
use nix::errno::Errno;
use std::time::Duration;

/// Bytes reserved for the free-text tag of an envelope, NUL included.
pub const TAG_BYTES: usize = 64;

/// Bytes reserved for the text of a log record, NUL included.
pub const LOG_TEXT_BYTES: usize = 256;

#[repr(C)]
#[derive(Clone, Copy)]
struct RawEnvelope {
    mtype: c_long,
    patient_id: c_int,
    specialist_idx: c_int,
    triage_tier: c_int,
    is_vip: c_int,
    age: c_int,
    person_count: c_int,
    holds_permits: c_int,
    extra: [u8; TAG_BYTES],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawLogRecord {
    mtype: c_long,
    sim_time: i64,
    pid: c_int,
    text: [u8; LOG_TEXT_BYTES],
}

/// Fixed-layout message with a leading `mtype`.
trait RawMessage: Copy {
    fn empty() -> Self;
    fn mtype(&self) -> c_long;
}

impl RawMessage for RawEnvelope {
    fn empty() -> Self {
        Self {
            mtype: 0,
            patient_id: 0,
            specialist_idx: -1,
            triage_tier: 0,
            is_vip: 0,
            age: 0,
            person_count: 0,
            holds_permits: 0,
            extra: [0; TAG_BYTES],
        }
    }

    fn mtype(&self) -> c_long {
        self.mtype
    }
}

impl RawMessage for RawLogRecord {
    fn empty() -> Self {
        Self {
            mtype: 0,
            sim_time: 0,
            pid: 0,
            text: [0; LOG_TEXT_BYTES],
        }
    }

    fn mtype(&self) -> c_long {
        self.mtype
    }
}

/// Payload size as `msgsnd`/`msgrcv` count it: everything after `mtype`.
const fn payload_len<T>() -> usize {
    std::mem::size_of::<T>() - std::mem::size_of::<c_long>()
}

/// Copy `text` into a NUL-terminated fixed buffer, truncating on a char boundary.
fn write_text<const N: usize>(text: &str, buf: &mut [u8; N]) {
    let mut end = text.len().min(N - 1);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    buf[..end].copy_from_slice(&text.as_bytes()[..end]);
    buf[end..].fill(0);
}

fn read_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl From<&Envelope> for RawEnvelope {
    fn from(env: &Envelope) -> Self {
        let mut raw = Self::empty();
        raw.mtype = env.priority as c_long;
        raw.patient_id = env.patient_id;
        raw.specialist_idx = env.specialty.map_or(-1, |s| s.index() as c_int);
        raw.triage_tier = env.colour.map_or(0, |c| c.tier() as c_int);
        raw.is_vip = c_int::from(env.vip);
        raw.age = env.age;
        raw.person_count = env.person_count;
        raw.holds_permits = c_int::from(env.holds_permits);
        write_text(&env.tag, &mut raw.extra);
        raw
    }
}

impl From<&RawEnvelope> for Envelope {
    fn from(raw: &RawEnvelope) -> Self {
        Self {
            priority: i64::from(raw.mtype),
            patient_id: raw.patient_id,
            age: raw.age,
            vip: raw.is_vip != 0,
            colour: TriageColour::from_tier(i64::from(raw.triage_tier)),
            specialty: usize::try_from(raw.specialist_idx)
                .ok()
                .and_then(Specialty::from_index),
            person_count: raw.person_count,
            holds_permits: raw.holds_permits != 0,
            tag: read_text(&raw.extra),
        }
    }
}

/// Bounded retry for sends that hit a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_timing(timing: &Timing) -> Self {
        Self {
            limit: timing.send_retry_limit.max(1),
            backoff: timing.send_backoff,
        }
    }
}

/// Handle to one SysV message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityChannel {
    id: c_int,
    poll: Duration,
}

impl PriorityChannel {
    /// Create (or reuse) the queue for `key`.
    pub fn create(key: IpcKey, poll: Duration) -> Result<Self> {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let id = unsafe { libc::msgget(key, libc::IPC_CREAT | IPC_MODE) };
        if id == -1 {
            return Err(IpcError::Os {
                op: "msgget",
                source: Errno::last(),
            });
        }
        Ok(Self { id, poll })
    }

    /// Open an existing queue.
    pub fn open(key: IpcKey, poll: Duration) -> Result<Self> {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let id = unsafe { libc::msgget(key, 0) };
        if id == -1 {
            return Err(match Errno::last() {
                Errno::ENOENT => IpcError::NotFound { key },
                source => IpcError::Os { op: "msgget", source },
            });
        }
        Ok(Self { id, poll })
    }

    #[must_use]
    pub const fn id(&self) -> c_int {
        self.id
    }

    /// Remove the queue. Removing an already removed queue succeeds.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: IPC_RMID ignores the buffer argument.
        let rc = unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == -1 {
            return match IpcError::last("msgctl(IPC_RMID)") {
                IpcError::Removed { .. } => Ok(()),
                err => Err(err),
            };
        }
        Ok(())
    }

    fn stat(&self) -> Result<libc::msqid_ds> {
        // SAFETY: msqid_ds is a plain C struct; all-zero is a valid value.
        let mut ds: libc::msqid_ds = unsafe { std::mem::zeroed() };
        // SAFETY: ds is a valid, writable msqid_ds.
        let rc = unsafe { libc::msgctl(self.id, libc::IPC_STAT, &mut ds) };
        if rc == -1 {
            return Err(IpcError::last("msgctl(IPC_STAT)"));
        }
        Ok(ds)
    }

    /// Number of messages currently queued.
    pub fn depth(&self) -> Result<usize> {
        Ok(self.stat()?.msg_qnum as usize)
    }

    /// Set the queue's byte capacity (`msg_qbytes`).
    ///
    /// Raising it above the system limit needs privileges; callers treat
    /// failure as non-fatal.
    pub fn tune_capacity(&self, bytes: usize) -> Result<()> {
        let mut ds = self.stat()?;
        ds.msg_qbytes = bytes as libc::msglen_t;
        // SAFETY: ds is a valid msqid_ds obtained from IPC_STAT.
        let rc = unsafe { libc::msgctl(self.id, libc::IPC_SET, &mut ds) };
        if rc == -1 {
            return Err(IpcError::last("msgctl(IPC_SET)"));
        }
        Ok(())
    }

    /// Shrink the queue so it holds exactly one envelope.
    pub fn limit_to_one_envelope(&self) -> Result<()> {
        self.tune_capacity(payload_len::<RawEnvelope>())
    }

    fn send_raw<T: RawMessage>(&self, msg: &T) -> Result<()> {
        if msg.mtype() <= 0 {
            return Err(IpcError::InvalidArgument(format!("message key {} must be positive", msg.mtype())));
        }
        // SAFETY: msg points to a repr(C) struct starting with mtype, and the
        // size excludes mtype as msgsnd expects.
        let rc = unsafe {
            libc::msgsnd(
                self.id,
                (msg as *const T).cast::<libc::c_void>(),
                payload_len::<T>(),
                libc::IPC_NOWAIT,
            )
        };
        if rc == -1 {
            return Err(match Errno::last() {
                Errno::EAGAIN => IpcError::Full,
                errno => IpcError::from_errno("msgsnd", errno),
            });
        }
        Ok(())
    }

    fn receive_raw<T: RawMessage>(&self, msgtyp: c_long) -> Result<Option<T>> {
        let mut msg = T::empty();
        loop {
            // SAFETY: msg is a writable repr(C) struct large enough for the payload.
            let rc = unsafe {
                libc::msgrcv(
                    self.id,
                    (&mut msg as *mut T).cast::<libc::c_void>(),
                    payload_len::<T>(),
                    msgtyp,
                    libc::IPC_NOWAIT,
                )
            };
            if rc >= 0 {
                return Ok(Some(msg));
            }
            match Errno::last() {
                Errno::ENOMSG | Errno::EAGAIN => return Ok(None),
                Errno::EINTR => continue,
                errno => return Err(IpcError::from_errno("msgrcv", errno)),
            }
        }
    }

    /// Send without blocking.
    pub fn try_send(&self, envelope: &Envelope) -> Result<()> {
        self.send_raw(&RawEnvelope::from(envelope))
    }

    /// Send, retrying a full queue up to `policy.limit` attempts.
    ///
    /// Gives up with [`IpcError::Full`] when the attempts run out, or with
    /// [`IpcError::Interrupted`] if shutdown is requested while retrying.
    pub async fn send_with_retry(
        &self,
        envelope: &Envelope,
        policy: RetryPolicy,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let raw = RawEnvelope::from(envelope);
        let mut attempts = 0;
        loop {
            match self.send_raw(&raw) {
                Err(IpcError::Full) => {
                    attempts += 1;
                    if attempts >= policy.limit {
                        return Err(IpcError::Full);
                    }
                    if shutdown.is_requested() {
                        return Err(IpcError::Interrupted { op: "send" });
                    }
                    tokio::time::sleep(policy.backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Take the lowest-keyed message at or below `ceiling`, if any.
    pub fn try_receive(&self, ceiling: i64) -> Result<Option<Envelope>> {
        let raw: Option<RawEnvelope> = self.receive_raw(-(ceiling as c_long))?;
        Ok(raw.as_ref().map(Envelope::from))
    }

    /// Wait for the lowest-keyed message at or below `ceiling`.
    pub async fn receive(&self, ceiling: i64, shutdown: &mut Shutdown) -> Result<Envelope> {
        loop {
            if shutdown.is_requested() {
                return Err(IpcError::Interrupted { op: "receive" });
            }
            if let Some(envelope) = self.try_receive(ceiling)? {
                return Ok(envelope);
            }
            tokio::select! {
                () = shutdown.requested() => {}
                () = tokio::time::sleep(self.poll) => {}
            }
        }
    }

    /// Queue a log record without blocking.
    pub fn send_log(&self, record: &LogRecord) -> Result<()> {
        let mut raw = RawLogRecord::empty();
        raw.mtype = priority::LOG_RECORD as c_long;
        raw.sim_time = record.sim_time;
        raw.pid = record.pid;
        write_text(&record.text, &mut raw.text);
        self.send_raw(&raw)
    }

    pub fn try_receive_log(&self) -> Result<Option<LogRecord>> {
        let raw: Option<RawLogRecord> = self.receive_raw(0)?;
        Ok(raw.map(|raw| LogRecord {
            sim_time: raw.sim_time,
            pid: raw.pid,
            text: read_text(&raw.text),
        }))
    }

    /// Wait for the next log record.
    pub async fn receive_log(&self, shutdown: &mut Shutdown) -> Result<LogRecord> {
        loop {
            if shutdown.is_requested() {
                return Err(IpcError::Interrupted { op: "receive_log" });
            }
            if let Some(record) = self.try_receive_log()? {
                return Ok(record);
            }
            tokio::select! {
                () = shutdown.requested() => {}
                () = tokio::time::sleep(self.poll) => {}
            }
        }
    }
}

/// Remove a leftover queue for `key`. Returns whether one existed.
pub fn remove_if_exists(key: IpcKey) -> Result<bool> {
    if is_private(key) {
        return Ok(false);
    }
    match PriorityChannel::open(key, Duration::ZERO) {
        Ok(channel) => channel.remove().map(|()| true),
        Err(IpcError::NotFound { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PatientUnit;
    use crate::shutdown;

    const POLL: Duration = Duration::from_millis(2);

    fn private_channel() -> Result<PriorityChannel> {
        PriorityChannel::create(libc::IPC_PRIVATE, POLL)
    }

    fn arrival(id: i32, vip: bool) -> Envelope {
        Envelope::arrival(&PatientUnit::new(id, 40, vip))
    }

    #[test]
    fn test_vip_preempts_standard() -> Result<()> {
        let channel = private_channel()?;
        channel.try_send(&arrival(1, false))?;
        channel.try_send(&arrival(2, false))?;
        channel.try_send(&arrival(3, true))?;
        assert_eq!(channel.depth()?, 3);

        let order: Vec<i32> = std::iter::from_fn(|| channel.try_receive(priority::REGISTRATION_CEILING).ok().flatten())
            .map(|env| env.patient_id)
            .collect();
        // VIP first, then standard arrivals in FIFO order.
        assert_eq!(order, vec![3, 1, 2]);
        channel.remove()
    }

    #[test]
    fn test_red_before_green_for_same_specialist() -> Result<()> {
        let channel = private_channel()?;
        let surgeon = Specialty::Surgeon;
        channel.try_send(&arrival(1, false).for_specialist(surgeon, TriageColour::Green))?;
        channel.try_send(&arrival(2, false).for_specialist(surgeon, TriageColour::Yellow))?;
        channel.try_send(&arrival(3, false).for_specialist(surgeon, TriageColour::Red))?;

        let ceiling = priority::specialist_ceiling(surgeon);
        let first = channel.try_receive(ceiling)?.map(|e| e.colour);
        let second = channel.try_receive(ceiling)?.map(|e| e.colour);
        let third = channel.try_receive(ceiling)?.map(|e| e.colour);
        assert_eq!(first, Some(Some(TriageColour::Red)));
        assert_eq!(second, Some(Some(TriageColour::Yellow)));
        assert_eq!(third, Some(Some(TriageColour::Green)));
        assert!(channel.try_receive(ceiling)?.is_none());
        channel.remove()
    }

    #[test]
    fn test_ceiling_filters_higher_keys() -> Result<()> {
        let channel = private_channel()?;
        channel.try_send(&arrival(1, false).for_triage(true))?;
        assert!(channel.try_receive(priority::REGISTRATION_CEILING)?.is_none());
        assert!(channel.try_receive(priority::TRIAGE_CEILING)?.is_some());
        channel.remove()
    }

    #[test]
    fn test_envelope_fields_survive_the_queue() -> Result<()> {
        let channel = private_channel()?;
        let mut sent = Envelope::arrival(&PatientUnit::new(42, 9, true))
            .for_triage(false)
            .for_specialist(Specialty::Paediatrician, TriageColour::Yellow);
        sent.tag = "x".repeat(100);
        channel.try_send(&sent)?;

        let received = channel.try_receive(priority::specialist_ceiling(Specialty::Paediatrician))?;
        let Some(received) = received else {
            panic!("expected a message");
        };
        assert_eq!(received.tag.len(), TAG_BYTES - 1);
        sent.tag.truncate(TAG_BYTES - 1);
        assert_eq!(received, sent);
        channel.remove()
    }

    #[test]
    fn test_text_truncation_respects_char_boundaries() {
        let mut buf = [0u8; 4];
        write_text("aéé", &mut buf);
        assert_eq!(read_text(&buf), "aé");
    }

    #[tokio::test]
    async fn test_full_queue_bounded_retry() -> Result<()> {
        let channel = private_channel()?;
        channel.limit_to_one_envelope()?;
        channel.try_send(&arrival(1, false))?;
        assert!(matches!(channel.try_send(&arrival(2, false)), Err(IpcError::Full)));

        let (_trigger, stop) = shutdown::channel();
        let policy = RetryPolicy {
            limit: 3,
            backoff: Duration::from_millis(1),
        };
        let outcome = channel.send_with_retry(&arrival(3, false), policy, &stop).await;
        assert!(matches!(outcome, Err(IpcError::Full)));

        // Draining makes room again.
        assert!(channel.try_receive(priority::REGISTRATION_CEILING)?.is_some());
        channel.send_with_retry(&arrival(4, false), policy, &stop).await?;
        channel.remove()
    }

    #[tokio::test]
    async fn test_receive_interrupted_by_shutdown() -> Result<()> {
        let channel = private_channel()?;
        let (trigger, mut stop) = shutdown::channel();
        let waiter = tokio::spawn(async move { channel.receive(priority::TRIAGE_CEILING, &mut stop).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.trigger();

        let outcome = waiter.await.map_err(|e| IpcError::InvalidArgument(e.to_string()))?;
        assert!(outcome.err().is_some_and(|e| e.is_interrupted()));
        channel.remove()
    }

    #[tokio::test]
    async fn test_receive_on_removed_queue() -> Result<()> {
        let channel = private_channel()?;
        channel.remove()?;
        let (_trigger, mut stop) = shutdown::channel();
        let outcome = channel.receive(priority::TRIAGE_CEILING, &mut stop).await;
        assert!(outcome.err().is_some_and(|e| e.is_removed()));
        assert!(channel.try_send(&arrival(1, false)).err().is_some_and(|e| e.is_removed()));
        // Removing twice is fine.
        channel.remove()
    }

    #[tokio::test]
    async fn test_log_records() -> Result<()> {
        let channel = private_channel()?;
        let record = LogRecord {
            sim_time: 12,
            pid: 4242,
            text: "triage;Patient 1 -> red".to_string(),
        };
        channel.send_log(&record)?;

        let (_trigger, mut stop) = shutdown::channel();
        let received = channel.receive_log(&mut stop).await?;
        assert_eq!(received, record);
        assert!(channel.try_receive_log()?.is_none());
        channel.remove()
    }
}
