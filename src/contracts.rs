//! Core data structures shared by the network and transport layers
//!
//! Records that live in the configuration store (`SecurityState`,
//! `AccessProfile`) derive rkyv's archive traits with validation, so a store
//! can keep them as checked zero-copy blobs.
use rkyv::{Archive, Deserialize, Serialize};

use crate::errors::{D7aError, Result};
use crate::timing::Tick;

/// Length of a UID (and of every stored origin address)
pub const UID_LEN: usize = 8;

/// Length of a VID
pub const VID_LEN: usize = 2;

/// VID value meaning "no virtual id configured"
pub const VID_NOT_SET: [u8; VID_LEN] = [0xFF, 0xFF];

/// Frame counter value after which a key counter is used up
pub const FRAME_COUNTER_SENTINEL: u32 = u32::MAX;

/// Addressing mode of an addressee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdType {
    Broadcast = 1,
    Uid = 2,
    Vid = 3,
}

impl IdType {
    /// Number of id bytes carried on the wire for this type
    pub const fn id_len(self) -> usize {
        match self {
            IdType::Broadcast => 0,
            IdType::Uid => UID_LEN,
            IdType::Vid => VID_LEN,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Parse the 2-bit id type field
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            1 => Ok(IdType::Broadcast),
            2 => Ok(IdType::Uid),
            3 => Ok(IdType::Vid),
            other => Err(D7aError::InvalidIdType(other)),
        }
    }
}

/// Communication peer or broadcast target
///
/// `id` always holds 8 bytes; only the first `id_type.id_len()` are
/// significant and the rest stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addressee {
    pub id_type: IdType,
    pub access_class: u8,
    pub id: [u8; UID_LEN],
}

impl Addressee {
    pub fn broadcast(access_class: u8) -> Self {
        Self {
            id_type: IdType::Broadcast,
            access_class,
            id: [0; UID_LEN],
        }
    }

    pub fn uid(access_class: u8, uid: [u8; UID_LEN]) -> Self {
        Self {
            id_type: IdType::Uid,
            access_class,
            id: uid,
        }
    }

    pub fn vid(access_class: u8, vid: [u8; VID_LEN]) -> Self {
        let mut id = [0; UID_LEN];
        id[..VID_LEN].copy_from_slice(&vid);
        Self {
            id_type: IdType::Vid,
            access_class,
            id,
        }
    }

    /// Build an addressee from the id bytes found on the wire
    pub fn from_id_bytes(id_type: IdType, access_class: u8, bytes: &[u8]) -> Self {
        let mut id = [0; UID_LEN];
        let len = id_type.id_len().min(bytes.len());
        id[..len].copy_from_slice(&bytes[..len]);
        Self {
            id_type,
            access_class,
            id,
        }
    }

    /// Significant id bytes
    pub fn id_bytes(&self) -> &[u8] {
        &self.id[..self.id_type.id_len()]
    }

    pub fn is_broadcast(&self) -> bool {
        self.id_type == IdType::Broadcast
    }
}

impl Default for Addressee {
    fn default() -> Self {
        Self::broadcast(0)
    }
}

/// Local network-layer security counters
///
/// Persisted after every increment so a reset never reuses a frame counter
/// under the same key counter.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[archive(check_bytes)]
pub struct SecurityState {
    pub frame_counter: u32,
    pub key_counter: u8,
}

impl SecurityState {
    pub fn new(frame_counter: u32, key_counter: u8) -> Self {
        Self {
            frame_counter,
            key_counter,
        }
    }

    /// True once no further frame counter is available for this key counter
    pub fn is_exhausted(&self) -> bool {
        self.frame_counter == FRAME_COUNTER_SENTINEL
    }

    /// State after consuming the current frame counter
    pub fn advanced(&self) -> Option<Self> {
        if self.is_exhausted() {
            return None;
        }
        Some(Self {
            frame_counter: self.frame_counter + 1,
            key_counter: self.key_counter,
        })
    }
}

/// Scan type of an access profile
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[archive(check_bytes)]
pub enum ScanType {
    #[default]
    Foreground,
    Background,
}

/// Channel access mode applied by the data link layer before transmitting
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[archive(check_bytes)]
pub enum CsmaCaMode {
    #[default]
    Unc,
    Aind,
    Raind,
    Rigd,
}

/// Channel range an access profile may use
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[archive(check_bytes)]
pub struct Subband {
    pub channel_header: u8,
    pub channel_index_start: u16,
    pub channel_index_end: u16,
    pub eirp: i8,
    pub cca: u8,
}

/// Access profile selected by an access class
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[archive(check_bytes)]
pub struct AccessProfile {
    pub scan_type: ScanType,
    pub csma_ca_mode: CsmaCaMode,
    pub subnet: u8,
    pub scan_automation_period: u8,
    pub subbands: Vec<Subband>,
}

impl AccessProfile {
    pub fn is_foreground_scan(&self) -> bool {
        self.scan_type == ScanType::Foreground
    }

    /// Force the first subband onto a single channel
    ///
    /// Used when answering a request: the response goes out on the channel
    /// the request was received on, whatever the profile's default is.
    pub fn bind_channel(&mut self, channel: ChannelId) {
        if self.subbands.is_empty() {
            self.subbands.push(Subband::default());
        }
        let subband = &mut self.subbands[0];
        subband.channel_header = channel.channel_header;
        subband.channel_index_start = channel.center_freq_index;
        subband.channel_index_end = channel.center_freq_index;
    }
}

/// Physical channel a frame was received on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelId {
    pub channel_header: u8,
    pub center_freq_index: u16,
}

/// Reception metadata delivered by the data link layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxMeta {
    pub timestamp: Tick,
    pub channel: ChannelId,
}

/// Transmission metadata filled in on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxMeta {
    pub timestamp: Tick,
}

/// Responses a requester asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    None,
    OnError,
    #[default]
    Always,
}

/// Session QoS settings of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosSettings {
    pub response_mode: ResponseMode,
}

impl QosSettings {
    pub fn new(response_mode: ResponseMode) -> Self {
        Self { response_mode }
    }
}
