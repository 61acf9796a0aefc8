//! Persistent configuration collaborator
//!
//! The stack reads access profiles, device identity and the network
//! security key from the configuration store, and writes the local security
//! counters back after every transmission.

use std::collections::HashMap;

use rkyv::ser::serializers::AllocSerializer;
use rkyv::{check_archived_root, to_bytes, AlignedVec, Archive, Deserialize, Serialize};
use tracing::trace;

use crate::contracts::{AccessProfile, SecurityState, UID_LEN, VID_LEN, VID_NOT_SET};
use crate::errors::{D7aError, Result};
use crate::security::KEY_LEN;

/// Persistent configuration collaborator
pub trait ConfigStore {
    fn read_access_class(&self, access_class: u8) -> Result<AccessProfile>;

    /// Access class the local node scans with
    fn read_active_access_class(&self) -> Result<u8>;

    fn read_uid(&self) -> Result<[u8; UID_LEN]>;

    /// All-ones when no virtual id is configured
    fn read_vid(&self) -> Result<[u8; VID_LEN]>;

    fn read_security_key(&self) -> Result<[u8; KEY_LEN]>;

    fn read_security_state(&self) -> Result<SecurityState>;

    fn write_security_state(&mut self, state: &SecurityState) -> Result<()>;
}

const SCRATCH_SPACE: usize = 256;

fn archive<T>(record: &T, what: &str) -> Result<AlignedVec>
where
    T: Serialize<AllocSerializer<SCRATCH_SPACE>>,
{
    to_bytes::<_, SCRATCH_SPACE>(record)
        .map_err(|_| D7aError::SerializationError(format!("Failed to archive {what}")))
}

/// In-memory configuration store
///
/// Access profiles and the security state are kept as validated rkyv
/// archives, so every read goes through the same checks a flash-backed
/// store would apply.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    uid: [u8; UID_LEN],
    vid: [u8; VID_LEN],
    key: [u8; KEY_LEN],
    active_access_class: u8,
    access_profiles: HashMap<u8, AlignedVec>,
    security_state: AlignedVec,
    security_writes: usize,
}

impl MemoryStore {
    pub fn new(uid: [u8; UID_LEN]) -> Result<Self> {
        Ok(Self {
            uid,
            vid: VID_NOT_SET,
            key: [0; KEY_LEN],
            active_access_class: 0,
            access_profiles: HashMap::new(),
            security_state: archive(&SecurityState::default(), "security state")?,
            security_writes: 0,
        })
    }

    pub fn with_vid(mut self, vid: [u8; VID_LEN]) -> Self {
        self.vid = vid;
        self
    }

    pub fn with_key(mut self, key: [u8; KEY_LEN]) -> Self {
        self.key = key;
        self
    }

    pub fn with_active_access_class(mut self, access_class: u8) -> Self {
        self.active_access_class = access_class;
        self
    }

    pub fn with_access_profile(mut self, access_class: u8, profile: &AccessProfile) -> Result<Self> {
        self.set_access_profile(access_class, profile)?;
        Ok(self)
    }

    pub fn with_security_state(mut self, state: SecurityState) -> Result<Self> {
        self.security_state = archive(&state, "security state")?;
        Ok(self)
    }

    pub fn set_access_profile(&mut self, access_class: u8, profile: &AccessProfile) -> Result<()> {
        let bytes = archive(profile, "access profile")?;
        self.access_profiles.insert(access_class, bytes);
        Ok(())
    }

    /// Number of `write_security_state` calls so far
    pub fn security_writes(&self) -> usize {
        self.security_writes
    }
}

fn restore<T>(bytes: &AlignedVec, what: &str) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> rkyv::CheckBytes<rkyv::validation::validators::DefaultValidator<'a>>
        + Deserialize<T, rkyv::Infallible>,
{
    let archived = check_archived_root::<T>(bytes)
        .map_err(|_| D7aError::DeserializationError(format!("Corrupted {what} record")))?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| D7aError::DeserializationError(format!("Failed to restore {what}")))
}

impl ConfigStore for MemoryStore {
    fn read_access_class(&self, access_class: u8) -> Result<AccessProfile> {
        let bytes = self
            .access_profiles
            .get(&access_class)
            .ok_or_else(|| D7aError::Store(format!("no access profile for class {access_class}")))?;
        restore(bytes, "access profile")
    }

    fn read_active_access_class(&self) -> Result<u8> {
        Ok(self.active_access_class)
    }

    fn read_uid(&self) -> Result<[u8; UID_LEN]> {
        Ok(self.uid)
    }

    fn read_vid(&self) -> Result<[u8; VID_LEN]> {
        Ok(self.vid)
    }

    fn read_security_key(&self) -> Result<[u8; KEY_LEN]> {
        Ok(self.key)
    }

    fn read_security_state(&self) -> Result<SecurityState> {
        restore(&self.security_state, "security state")
    }

    fn write_security_state(&mut self, state: &SecurityState) -> Result<()> {
        self.security_state = archive(state, "security state")?;
        self.security_writes += 1;
        trace!(
            frame_counter = state.frame_counter,
            key_counter = state.key_counter,
            "security state persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ScanType, Subband};

    fn background_profile() -> AccessProfile {
        AccessProfile {
            scan_type: ScanType::Background,
            subnet: 0x05,
            scan_automation_period: 0x10,
            subbands: vec![Subband {
                channel_header: 0x20,
                channel_index_start: 0,
                channel_index_end: 100,
                eirp: 14,
                cca: 86,
            }],
            ..AccessProfile::default()
        }
    }

    #[test]
    fn test_access_profile_roundtrip() {
        let store = MemoryStore::new([0; UID_LEN])
            .unwrap()
            .with_access_profile(2, &background_profile())
            .unwrap();
        assert_eq!(store.read_access_class(2).unwrap(), background_profile());
    }

    #[test]
    fn test_missing_access_class() {
        let store = MemoryStore::new([0; UID_LEN]).unwrap();
        assert!(matches!(store.read_access_class(7), Err(D7aError::Store(_))));
    }

    #[test]
    fn test_security_state_persisted() {
        let mut store = MemoryStore::new([0; UID_LEN]).unwrap();
        assert_eq!(store.read_security_state().unwrap(), SecurityState::default());

        store.write_security_state(&SecurityState::new(5, 2)).unwrap();
        assert_eq!(store.read_security_state().unwrap(), SecurityState::new(5, 2));
        assert_eq!(store.security_writes(), 1);
    }

    #[test]
    fn test_vid_defaults_to_not_set() {
        let store = MemoryStore::new([1; UID_LEN]).unwrap();
        assert_eq!(store.read_vid().unwrap(), VID_NOT_SET);
        let store = store.with_vid([0x12, 0x34]);
        assert_eq!(store.read_vid().unwrap(), [0x12, 0x34]);
    }
}
