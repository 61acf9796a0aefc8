//! Trusted node table: replay protection for stream and CCM secured frames
//!
//! One entry per peer, keyed by its 8-byte origin address (VIDs zero
//! padded). The table is append-only: entries are never evicted, and once
//! every slot is used a new peer cannot be admitted.
use tracing::{debug, warn};

use crate::contracts::{SecurityState, FRAME_COUNTER_SENTINEL, UID_LEN};
use crate::errors::{D7aError, Result};

/// Last accepted security counters of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrustedNode {
    pub address: [u8; UID_LEN],
    pub frame_counter: u32,
    pub key_counter: u8,
    pub used: bool,
}

/// Fixed capacity peer table
#[derive(Debug, Clone)]
pub struct TrustedNodeTable {
    nodes: Vec<TrustedNode>,
}

impl TrustedNodeTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![TrustedNode::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in use
    pub fn iter(&self) -> impl Iterator<Item = &TrustedNode> {
        self.nodes.iter().filter(|node| node.used)
    }

    pub fn get(&self, address: &[u8; UID_LEN]) -> Option<&TrustedNode> {
        self.iter().find(|node| &node.address == address)
    }

    fn get_mut(&mut self, address: &[u8; UID_LEN]) -> Option<&mut TrustedNode> {
        self.nodes
            .iter_mut()
            .find(|node| node.used && &node.address == address)
    }

    /// Replay admission for `received` counters from `address`
    ///
    /// Unknown peers are admitted. A known peer is refused when the received
    /// frame counter is not newer than the stored one, or when its stored
    /// counter already reached the all-ones sentinel.
    pub fn check(&self, address: &[u8; UID_LEN], received: &SecurityState) -> Result<()> {
        let Some(node) = self.get(address) else {
            return Ok(());
        };
        if node.frame_counter == FRAME_COUNTER_SENTINEL
            || received.frame_counter <= node.frame_counter
        {
            warn!(
                address = %hex::encode(address),
                received = received.frame_counter,
                stored = node.frame_counter,
                "replay detected"
            );
            return Err(D7aError::ReplayDetected {
                received: received.frame_counter,
                stored: node.frame_counter,
            });
        }
        Ok(())
    }

    /// Store the counters of an authenticated frame
    ///
    /// Updates the peer's entry or claims a free slot for a new peer.
    pub fn record(&mut self, address: &[u8; UID_LEN], accepted: &SecurityState) -> Result<()> {
        if let Some(node) = self.get_mut(address) {
            node.frame_counter = accepted.frame_counter;
            node.key_counter = accepted.key_counter;
            debug!(
                address = %hex::encode(address),
                frame_counter = accepted.frame_counter,
                "trusted node updated"
            );
            return Ok(());
        }
        self.add(address, accepted)
    }

    fn add(&mut self, address: &[u8; UID_LEN], accepted: &SecurityState) -> Result<()> {
        let capacity = self.capacity();
        let Some(slot) = self.nodes.iter_mut().find(|node| !node.used) else {
            warn!(capacity, address = %hex::encode(address), "trusted node table full");
            return Err(D7aError::TrustedNodeTableFull { capacity });
        };
        *slot = TrustedNode {
            address: *address,
            frame_counter: accepted.frame_counter,
            key_counter: accepted.key_counter,
            used: true,
        };
        debug!(address = %hex::encode(address), "trusted node added");
        Ok(())
    }

    /// Whether `record` can succeed for `address`
    pub fn has_room_for(&self, address: &[u8; UID_LEN]) -> bool {
        self.get(address).is_some() || self.len() < self.capacity()
    }
}
