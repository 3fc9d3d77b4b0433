//! Key derivation for every IPC object of a run.

use super::{IpcError, Result};
use crate::messages::{Specialty, SPECIALIST_COUNT};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub type IpcKey = libc::key_t;

/// One IPC object, identified by its `ftok` project tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTag {
    Log,
    Registration,
    Triage,
    Specialist(Specialty),
    Gate,
    Mutex,
    State,
}

impl ResourceTag {
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Log => 'L',
            Self::Registration => 'R',
            Self::Triage => 'T',
            Self::Specialist(s) => (b'A' + s.index() as u8) as char,
            Self::Gate => 'W',
            Self::Mutex => 'M',
            Self::State => 'H',
        }
    }
}

/// Keys for every object of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcKeys {
    pub log: IpcKey,
    pub registration: IpcKey,
    pub triage: IpcKey,
    pub specialists: [IpcKey; SPECIALIST_COUNT],
    pub gate: IpcKey,
    pub mutex: IpcKey,
    pub state: IpcKey,
}

impl IpcKeys {
    /// Derive all keys from an existing path with `ftok`.
    pub fn derive(path: &Path) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| IpcError::InvalidArgument(format!("key path {} contains NUL", path.display())))?;

        let key = |tag: ResourceTag| -> Result<IpcKey> {
            // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
            let key = unsafe { libc::ftok(c_path.as_ptr(), tag.as_char() as libc::c_int) };
            if key == -1 {
                return Err(IpcError::KeyDerivation {
                    path: path.to_path_buf(),
                    tag: tag.as_char(),
                    source: nix::errno::Errno::last(),
                });
            }
            Ok(key)
        };

        let log = key(ResourceTag::Log)?;
        let registration = key(ResourceTag::Registration)?;
        let triage = key(ResourceTag::Triage)?;
        let mut specialists = [0; SPECIALIST_COUNT];
        for specialty in Specialty::ALL {
            specialists[specialty.index()] = key(ResourceTag::Specialist(specialty))?;
        }

        Ok(Self {
            log,
            registration,
            triage,
            specialists,
            gate: key(ResourceTag::Gate)?,
            mutex: key(ResourceTag::Mutex)?,
            state: key(ResourceTag::State)?,
        })
    }

    /// Private keys: every object created from them is fresh and unreachable
    /// by key from other processes.
    #[must_use]
    pub const fn private() -> Self {
        let p = libc::IPC_PRIVATE;
        Self {
            log: p,
            registration: p,
            triage: p,
            specialists: [p; SPECIALIST_COUNT],
            gate: p,
            mutex: p,
            state: p,
        }
    }

    /// Every key with its tag, in provisioning order.
    #[must_use]
    pub fn all(&self) -> Vec<(ResourceTag, IpcKey)> {
        let mut keys = vec![
            (ResourceTag::Gate, self.gate),
            (ResourceTag::Mutex, self.mutex),
            (ResourceTag::State, self.state),
            (ResourceTag::Log, self.log),
            (ResourceTag::Registration, self.registration),
            (ResourceTag::Triage, self.triage),
        ];
        for specialty in Specialty::ALL {
            keys.push((ResourceTag::Specialist(specialty), self.specialists[specialty.index()]));
        }
        keys
    }
}

/// Whether a key is `IPC_PRIVATE`.
#[must_use]
pub const fn is_private(key: IpcKey) -> bool {
    key == libc::IPC_PRIVATE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(ResourceTag::Specialist(Specialty::Cardiologist).as_char(), 'A');
        assert_eq!(ResourceTag::Specialist(Specialty::Paediatrician).as_char(), 'F');
        assert_eq!(ResourceTag::Gate.as_char(), 'W');
        assert_eq!(ResourceTag::State.as_char(), 'H');
    }

    #[test]
    fn test_derive_is_stable_and_distinct() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let file = tempfile::NamedTempFile::new()?;
        let first = IpcKeys::derive(file.path())?;
        let second = IpcKeys::derive(file.path())?;
        assert_eq!(first, second);

        let mut keys: Vec<IpcKey> = first.all().into_iter().map(|(_, k)| k).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 12);
        Ok(())
    }

    #[test]
    fn test_derive_missing_path_fails() {
        let err = IpcKeys::derive(Path::new("/definitely/not/here/sor")).err();
        assert!(matches!(err, Some(IpcError::KeyDerivation { tag: 'L', .. })));
    }

    #[test]
    fn test_private_keys() {
        let keys = IpcKeys::private();
        assert!(keys.all().iter().all(|(_, k)| is_private(*k)));
    }
}
