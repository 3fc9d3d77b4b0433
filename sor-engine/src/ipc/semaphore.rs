//! SysV semaphores: the waiting-room capacity gate and the state mutex.

use super::keys::{is_private, IpcKey};
use super::{IpcError, Result, IPC_MODE};
use crate::shutdown::Shutdown;
use nix::errno::Errno;
use std::time::Duration;
use tracing::warn;

/// A SysV semaphore set holding a single semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore {
    id: libc::c_int,
}

impl Semaphore {
    /// Create (or reuse) the set for `key` and force its value.
    pub fn create(key: IpcKey, initial: i32) -> Result<Self> {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | IPC_MODE) };
        if id == -1 {
            return Err(IpcError::Os {
                op: "semget",
                source: Errno::last(),
            });
        }
        let sem = Self { id };
        sem.set_value(initial)?;
        Ok(sem)
    }

    /// Open an existing set.
    pub fn open(key: IpcKey) -> Result<Self> {
        // SAFETY: plain syscall wrapper, no pointers involved.
        let id = unsafe { libc::semget(key, 0, 0) };
        if id == -1 {
            return Err(match Errno::last() {
                Errno::ENOENT => IpcError::NotFound { key },
                source => IpcError::Os { op: "semget", source },
            });
        }
        Ok(Self { id })
    }

    #[must_use]
    pub const fn id(&self) -> libc::c_int {
        self.id
    }

    /// Apply `delta` atomically. `Ok(false)` means `IPC_NOWAIT` would have blocked.
    fn apply(&self, delta: i32, flags: libc::c_int, op: &'static str) -> Result<bool> {
        let sem_op = libc::c_short::try_from(delta)
            .map_err(|_| IpcError::InvalidArgument(format!("semaphore delta {delta} out of range")))?;
        let mut buf = libc::sembuf {
            sem_num: 0,
            sem_op,
            sem_flg: flags as libc::c_short,
        };
        loop {
            // SAFETY: buf is a valid sembuf and nsops matches its length.
            let rc = unsafe { libc::semop(self.id, &mut buf, 1) };
            if rc == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::EAGAIN => return Ok(false),
                errno => return Err(IpcError::from_errno(op, errno)),
            }
        }
    }

    pub fn value(&self) -> Result<i32> {
        // SAFETY: GETVAL takes no fourth argument.
        let value = unsafe { libc::semctl(self.id, 0, libc::GETVAL) };
        if value == -1 {
            return Err(IpcError::last("semctl(GETVAL)"));
        }
        Ok(value)
    }

    pub fn set_value(&self, value: i32) -> Result<()> {
        // SAFETY: SETVAL reads the `val` member of semun, passed as an int.
        let rc = unsafe { libc::semctl(self.id, 0, libc::SETVAL, value) };
        if rc == -1 {
            return Err(IpcError::last("semctl(SETVAL)"));
        }
        Ok(())
    }

    /// Remove the set. Removing an already removed set succeeds.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: IPC_RMID takes no fourth argument.
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc == -1 {
            return match IpcError::last("semctl(IPC_RMID)") {
                IpcError::Removed { .. } => Ok(()),
                err => Err(err),
            };
        }
        Ok(())
    }
}

/// Remove a leftover set for `key`. Returns whether one existed.
///
/// Best effort: a live owner of that key loses its semaphore.
pub fn remove_if_exists(key: IpcKey) -> Result<bool> {
    if is_private(key) {
        return Ok(false);
    }
    match Semaphore::open(key) {
        Ok(sem) => sem.remove().map(|()| true),
        Err(IpcError::NotFound { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Counting semaphore bounding the number of persons in the waiting room.
#[derive(Debug, Clone, Copy)]
pub struct CapacityGate {
    sem: Semaphore,
    poll: Duration,
}

impl CapacityGate {
    pub fn create(key: IpcKey, permits: i32, poll: Duration) -> Result<Self> {
        Ok(Self {
            sem: Semaphore::create(key, permits)?,
            poll,
        })
    }

    pub fn open(key: IpcKey, poll: Duration) -> Result<Self> {
        Ok(Self {
            sem: Semaphore::open(key)?,
            poll,
        })
    }

    #[must_use]
    pub const fn semaphore(&self) -> Semaphore {
        self.sem
    }

    /// Reserve `n` permits if they are available right now.
    pub fn try_acquire(&self, n: i32) -> Result<bool> {
        self.sem.apply(-n, libc::IPC_NOWAIT, "semop(acquire)")
    }

    /// Wait until `n` permits can be reserved in one step.
    ///
    /// Returns [`IpcError::Interrupted`] without holding anything if shutdown
    /// is requested first.
    pub async fn acquire(&self, n: i32, shutdown: &mut Shutdown) -> Result<()> {
        loop {
            if shutdown.is_requested() {
                return Err(IpcError::Interrupted { op: "acquire" });
            }
            if self.try_acquire(n)? {
                return Ok(());
            }
            tokio::select! {
                () = shutdown.requested() => {}
                () = tokio::time::sleep(self.poll) => {}
            }
        }
    }

    pub fn release(&self, n: i32) -> Result<()> {
        if n <= 0 {
            return Ok(());
        }
        self.sem.apply(n, 0, "semop(release)").map(drop)
    }

    pub fn value(&self) -> Result<i32> {
        self.sem.value()
    }

    /// Force the permit count. Only the reconciliation guardrail does this.
    pub fn reset(&self, permits: i32) -> Result<()> {
        self.sem.set_value(permits)
    }

    pub fn remove(&self) -> Result<()> {
        self.sem.remove()
    }
}

/// Binary semaphore guarding [`super::SharedState`].
///
/// Uses `SEM_UNDO` so a holder that dies inside the critical section does
/// not leave the lock taken.
#[derive(Debug, Clone, Copy)]
pub struct StateMutex {
    sem: Semaphore,
}

impl StateMutex {
    pub fn create(key: IpcKey) -> Result<Self> {
        Ok(Self {
            sem: Semaphore::create(key, 1)?,
        })
    }

    pub fn open(key: IpcKey) -> Result<Self> {
        Ok(Self {
            sem: Semaphore::open(key)?,
        })
    }

    #[must_use]
    pub const fn semaphore(&self) -> Semaphore {
        self.sem
    }

    /// Block until the lock is held. Unlocks when the guard drops.
    pub fn lock(&self) -> Result<StateGuard<'_>> {
        self.sem.apply(-1, libc::SEM_UNDO, "semop(lock)")?;
        Ok(StateGuard { mutex: self })
    }

    pub fn value(&self) -> Result<i32> {
        self.sem.value()
    }

    pub fn remove(&self) -> Result<()> {
        self.sem.remove()
    }
}

/// Held lock on a [`StateMutex`].
#[derive(Debug)]
pub struct StateGuard<'a> {
    mutex: &'a StateMutex,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.sem.apply(1, libc::SEM_UNDO, "semop(unlock)") {
            warn!("Failed to release state mutex: {}", e);
        }
    }
}
