//! Network protocol (NP) layer
//!
//! Owns the foreground scan window, the local security counters and the
//! trusted node table. Outgoing frames are addressed, secured and handed to
//! the radio here; incoming frames are authenticated and checked for replay
//! before the transport layer sees them.
//!
//! State machine:
//!
//! | from                    | to             |
//! |-------------------------|----------------|
//! | Idle, ForegroundScan    | Transmit       |
//! | Transmit, ForegroundScan| Idle           |
//! | Transmit, Idle          | ForegroundScan |
//!
//! Any other transition panics.
use tracing::{debug, trace, warn};

use crate::contracts::{AccessProfile, Addressee, SecurityState, VID_NOT_SET};
use crate::errors::{D7aError, Result};
use crate::packet::{FrameReader, NpHeader, Packet, TpHeader};
use crate::scheduler::{rearm, TimerTask};
use crate::security::{NlsMethod, SecurityEnvelope};
use crate::stack::{Env, StackConfig};
use crate::store::ConfigStore;
use crate::timing::{adjust_timeout, Tick};
use crate::trusted_nodes::TrustedNodeTable;
use crate::MAX_FRAME_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpState {
    Idle,
    Transmit,
    ForegroundScan,
}

impl NpState {
    fn can_switch_to(self, next: NpState) -> bool {
        use NpState::*;
        matches!(
            (self, next),
            (Idle | ForegroundScan, Transmit)
                | (Transmit | ForegroundScan, Idle)
                | (Transmit | Idle, ForegroundScan)
        )
    }
}

/// Network layer state
#[derive(Debug)]
pub struct NetworkLayer {
    state: NpState,
    prev_state: NpState,
    /// A scan was requested while transmitting; the radio is asked to scan
    /// once the transmission completes
    scan_deferred: bool,
    own_access_profile: AccessProfile,
    fg_scan_timeout: Tick,
    nls_method: Option<NlsMethod>,
    envelope: Option<SecurityEnvelope>,
    security_state: SecurityState,
    trusted_nodes: TrustedNodeTable,
    pending_tx: Option<Packet>,
}

impl NetworkLayer {
    /// Load the own access profile and, with security enabled, the key and
    /// the persisted counters
    pub fn new(config: &StackConfig, store: &dyn ConfigStore) -> Result<Self> {
        let own_access_class = store.read_active_access_class()?;
        let own_access_profile = store.read_access_class(own_access_class)?;

        let (envelope, security_state) = match config.nls_method() {
            Some(method) if method.is_secured() => {
                let key = store.read_security_key()?;
                let state = store.read_security_state()?;
                debug!(
                    ?method,
                    key_counter = state.key_counter,
                    frame_counter = state.frame_counter,
                    "network layer security enabled"
                );
                (Some(SecurityEnvelope::new(&key)), state)
            }
            _ => (None, SecurityState::default()),
        };

        Ok(Self {
            state: NpState::Idle,
            prev_state: NpState::Idle,
            scan_deferred: false,
            own_access_profile,
            fg_scan_timeout: 0,
            nls_method: config.nls_method().filter(|method| method.is_secured()),
            envelope,
            security_state,
            trusted_nodes: TrustedNodeTable::new(config.trusted_node_table_size()),
            pending_tx: None,
        })
    }

    pub fn state(&self) -> NpState {
        self.state
    }

    pub fn own_access_profile(&self) -> &AccessProfile {
        &self.own_access_profile
    }

    pub fn security_state(&self) -> SecurityState {
        self.security_state
    }

    pub fn trusted_nodes(&self) -> &TrustedNodeTable {
        &self.trusted_nodes
    }

    pub fn foreground_scan_timeout(&self) -> Tick {
        self.fg_scan_timeout
    }

    fn switch_state(&mut self, next: NpState) {
        assert!(
            self.state.can_switch_to(next),
            "illegal NP transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "NP state switch");
        self.state = next;
    }

    pub fn set_foreground_scan_timeout(&mut self, timeout: Tick) {
        assert!(
            matches!(self.state, NpState::Idle | NpState::ForegroundScan),
            "foreground scan timeout set in {:?}",
            self.state
        );
        debug!(timeout, "set foreground scan timeout");
        self.fg_scan_timeout = timeout;
    }

    /// Arm the scan expiry and open the scan if it is not open yet
    ///
    /// Re-arming an open scan only moves its deadline.
    pub fn start_foreground_scan(&mut self, env: &mut Env<'_>) {
        trace!(ticks = self.fg_scan_timeout, "arming foreground scan expiry");
        rearm(env.scheduler, TimerTask::ForegroundScanExpired, self.fg_scan_timeout);
        self.enter_foreground_scan(env);
    }

    fn enter_foreground_scan(&mut self, env: &mut Env<'_>) {
        match self.state {
            NpState::ForegroundScan => {}
            NpState::Idle => {
                self.switch_state(NpState::ForegroundScan);
                env.radio.start_foreground_scan();
            }
            NpState::Transmit => {
                // resumed when the radio reports the end of the transmission
                self.prev_state = NpState::ForegroundScan;
                self.scan_deferred = true;
            }
        }
    }

    pub fn stop_foreground_scan(&mut self, auto_scan: bool, env: &mut Env<'_>) {
        match self.state {
            NpState::ForegroundScan => {
                env.scheduler.cancel(TimerTask::ForegroundScanExpired);
                self.switch_state(NpState::Idle);
            }
            NpState::Transmit if self.prev_state == NpState::ForegroundScan => {
                env.scheduler.cancel(TimerTask::ForegroundScanExpired);
                self.prev_state = NpState::Idle;
                self.scan_deferred = false;
            }
            _ => {}
        }
        env.radio.stop_foreground_scan(auto_scan);
    }

    /// Scan expiry task; the caller forwards the expiry to the transport layer
    pub fn foreground_scan_expired(&mut self, env: &mut Env<'_>) {
        debug!(state = ?self.state, "foreground scan expired");
        match self.state {
            NpState::ForegroundScan => self.switch_state(NpState::Idle),
            NpState::Transmit => {
                self.prev_state = NpState::Idle;
                self.scan_deferred = false;
            }
            NpState::Idle => panic!("foreground scan expired while idle"),
        }
        env.radio.stop_foreground_scan(true);
    }

    /// Arm the foreground scan that follows a background advertising period
    ///
    /// `eta` is the remaining advertising time announced by the frame
    /// received at `rx_timestamp`.
    pub fn schedule_foreground_scan_after_advertising(
        &mut self,
        eta: Tick,
        rx_timestamp: Tick,
        env: &mut Env<'_>,
    ) {
        let delay = adjust_timeout(eta, rx_timestamp, env.scheduler.now());
        debug!(eta, delay, "foreground scan scheduled after advertising");
        rearm(env.scheduler, TimerTask::StartForegroundScanAfterAdvertising, delay);
    }

    pub fn start_foreground_scan_after_advertising(&mut self, env: &mut Env<'_>) {
        debug!("advertising period over, starting foreground scan");
        self.enter_foreground_scan(env);
    }

    fn origin_template(&self, include_origin: bool, access_class: u8, env: &Env<'_>) -> Result<Addressee> {
        if !include_origin && self.nls_method.is_none() {
            return Ok(Addressee::broadcast(access_class));
        }
        let vid = env.store.read_vid()?;
        if vid == VID_NOT_SET {
            Ok(Addressee::uid(access_class, env.store.read_uid()?))
        } else {
            Ok(Addressee::vid(access_class, vid))
        }
    }

    /// Serialize a packet into a radio frame, securing its body
    pub fn assemble_frame(&self, packet: &Packet) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(MAX_FRAME_SIZE);
        packet.np.encode(&mut frame);
        let body_start = frame.len();
        packet.encode_body(&mut frame);

        if let Some(envelope) = &self.envelope {
            let mut body = frame.split_off(body_start);
            envelope.secure(&packet.np, &mut body);
            frame.extend_from_slice(&body);
        }

        if frame.len() > MAX_FRAME_SIZE {
            return Err(D7aError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(frame)
    }

    /// Address, secure and transmit a foreground frame
    ///
    /// On error nothing was transmitted and no counter was consumed.
    pub fn tx_foreground_frame(
        &mut self,
        mut packet: Packet,
        include_origin: bool,
        profile: &AccessProfile,
        slave_listen_timeout: u8,
        env: &mut Env<'_>,
    ) -> Result<()> {
        assert!(
            matches!(self.state, NpState::Idle | NpState::ForegroundScan),
            "foreground frame transmitted in {:?}",
            self.state
        );

        packet.np = NpHeader {
            listen_timeout: slave_listen_timeout,
            hop_enabled: false,
            origin: self.origin_template(include_origin, packet.addressee.access_class, env)?,
            nls_method: self.nls_method,
            security: None,
        };

        let mut next_state = None;
        if let Some(method) = self.nls_method {
            let current = self.security_state;
            let Some(advanced) = current.advanced() else {
                warn!(key_counter = current.key_counter, "frame counter exhausted");
                return Err(D7aError::FrameCounterExhausted {
                    key_counter: current.key_counter,
                });
            };
            if method.carries_counters() {
                packet.np.security = Some(current);
            }
            next_state = Some(advanced);
            trace!(frame_counter = current.frame_counter, "frame counter consumed");
        }

        let frame = self.assemble_frame(&packet)?;

        if let Some(next) = next_state {
            env.store.write_security_state(&next)?;
            self.security_state = next;
        }

        self.prev_state = self.state;
        self.switch_state(NpState::Transmit);
        debug!(len = frame.len(), origin = ?packet.np.origin.id_type, "transmitting foreground frame");
        env.radio.transmit(&frame, profile);
        self.pending_tx = Some(packet);
        Ok(())
    }

    fn restore_after_transmit(&mut self, env: &mut Env<'_>) {
        assert_eq!(
            self.state,
            NpState::Transmit,
            "transmission outcome reported outside of a transmission"
        );
        let prev = self.prev_state;
        self.switch_state(prev);
        if prev == NpState::ForegroundScan && self.scan_deferred {
            env.radio.start_foreground_scan();
        }
        self.scan_deferred = false;
    }

    /// Radio reported a completed transmission; returns the transmitted packet
    pub fn packet_transmitted(&mut self, timestamp: Tick, env: &mut Env<'_>) -> Packet {
        self.restore_after_transmit(env);
        let Some(mut packet) = self.pending_tx.take() else {
            panic!("transmission completed without a pending packet");
        };
        packet.tx_meta.timestamp = timestamp;
        packet
    }

    pub fn transmission_failure(&mut self, env: &mut Env<'_>) {
        debug!("CSMA-CA insertion failed");
        self.restore_after_transmit(env);
        self.pending_tx = None;
    }

    /// Whether the current scan state accepts inbound frames
    pub fn process_received_packet(&self) -> Result<()> {
        match self.state {
            NpState::ForegroundScan => Ok(()),
            NpState::Idle if self.own_access_profile.is_foreground_scan() => Ok(()),
            NpState::Idle => {
                debug!("foreground frame dropped during background scan");
                Err(D7aError::ForegroundFrameDuringBackgroundScan)
            }
            NpState::Transmit => panic!("frame received while transmitting"),
        }
    }

    /// Parse, authenticate and replay-check a received frame
    ///
    /// Returns the packet with NP and TP headers decoded and the origin as
    /// addressee. The trusted node table only changes once the frame has
    /// authenticated.
    pub fn receive_frame(&mut self, frame: &[u8]) -> Result<Packet> {
        let mut reader = FrameReader::new(frame);
        let np = NpHeader::read(&mut reader)?;
        if np.hop_enabled {
            debug!("hop enabled frame dropped");
            return Err(D7aError::UnsupportedHopping);
        }

        let body = match np.security_method() {
            None => reader.remaining().to_vec(),
            Some(method) => self.unsecure_body(&np, method, reader.remaining())?,
        };

        let mut reader = FrameReader::new(&body);
        let tp = TpHeader::read(&mut reader)?;
        let payload = reader.remaining().to_vec();

        Ok(Packet {
            np,
            tp,
            addressee: np.origin,
            payload,
            ..Packet::default()
        })
    }

    fn unsecure_body(&mut self, np: &NpHeader, method: NlsMethod, secured: &[u8]) -> Result<Vec<u8>> {
        let Some(envelope) = &self.envelope else {
            debug!(?method, "secured frame dropped, security disabled");
            return Err(D7aError::SecurityDisabled);
        };
        if np.origin.is_broadcast() {
            debug!(?method, "secured frame without origin id dropped");
            return Err(D7aError::UnauthenticatableOrigin);
        }

        let received = np.security.filter(|_| method.carries_counters());
        if let Some(received) = &received {
            trace!(
                key_counter = received.key_counter,
                frame_counter = received.frame_counter,
                "received security counters"
            );
            self.trusted_nodes.check(&np.origin.id, received)?;
            if !self.trusted_nodes.has_room_for(&np.origin.id) {
                let capacity = self.trusted_nodes.capacity();
                warn!(capacity, "no room to trust a new node");
                return Err(D7aError::TrustedNodeTableFull { capacity });
            }
        }

        let plaintext = envelope.unsecure(np, secured).inspect_err(|err| {
            warn!(?method, origin = %hex::encode(np.origin.id_bytes()), %err, "frame failed authentication");
        })?;

        if let Some(received) = &received {
            self.trusted_nodes.record(&np.origin.id, received)?;
        }
        Ok(plaintext)
    }
}
