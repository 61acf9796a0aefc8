//! Transport protocol (TP) layer
//!
//! Sequences dialogs and transactions between a requester (master) and its
//! responders (slaves), and derives the response period and listen windows
//! from the timers carried in received headers.
use tracing::{debug, warn};

use crate::contracts::{AccessProfile, Addressee, QosSettings, ResponseMode};
use crate::errors::{D7aError, Result};
use crate::network::NetworkLayer;
use crate::packet::{AckTemplate, Packet, TpControl};
use crate::scheduler::{rearm, TimerTask};
use crate::stack::Env;
use crate::timing::{adjust_compressed_timeout, to_ticks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpState {
    Idle,
    MasterRequestPeriod,
    MasterResponsePeriod,
    SlaveReceivedRequest,
    SlaveSendingResponse,
    SlaveResponsePeriod,
}

impl TpState {
    fn can_switch_to(self, next: TpState) -> bool {
        use TpState::*;
        match next {
            Idle => true,
            MasterRequestPeriod => matches!(self, Idle | MasterResponsePeriod),
            MasterResponsePeriod => self == MasterRequestPeriod,
            // SlaveSendingResponse only comes back here after a failed transmission
            SlaveReceivedRequest => matches!(self, Idle | SlaveResponsePeriod | SlaveSendingResponse),
            SlaveSendingResponse => self == SlaveReceivedRequest,
            SlaveResponsePeriod => self == SlaveSendingResponse,
        }
    }

    pub fn is_master(self) -> bool {
        matches!(self, TpState::MasterRequestPeriod | TpState::MasterResponsePeriod)
    }

    pub fn is_slave(self) -> bool {
        matches!(
            self,
            TpState::SlaveReceivedRequest
                | TpState::SlaveSendingResponse
                | TpState::SlaveResponsePeriod
        )
    }
}

/// Transport layer state
#[derive(Debug)]
pub struct TransportLayer {
    state: TpState,
    current_addressee: Addressee,
    current_dialog_id: u8,
    current_transaction_id: u8,
    /// Dialog and transaction ids held before the request in flight
    ids_before_request: (u8, u8),
    current_access_class: Option<u8>,
    active_addressee_access_profile: AccessProfile,
}

impl Default for TransportLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportLayer {
    pub fn new() -> Self {
        Self {
            state: TpState::Idle,
            current_addressee: Addressee::default(),
            current_dialog_id: 0,
            current_transaction_id: 0,
            ids_before_request: (0, 0),
            current_access_class: None,
            active_addressee_access_profile: AccessProfile::default(),
        }
    }

    pub fn state(&self) -> TpState {
        self.state
    }

    /// 0 when no dialog is open
    pub fn dialog_id(&self) -> u8 {
        self.current_dialog_id
    }

    pub fn transaction_id(&self) -> u8 {
        self.current_transaction_id
    }

    /// Peer of the last admitted frame
    pub fn current_addressee(&self) -> &Addressee {
        &self.current_addressee
    }

    pub fn active_access_profile(&self) -> &AccessProfile {
        &self.active_addressee_access_profile
    }

    fn assert_can_switch(&self, next: TpState) {
        assert!(
            self.state.can_switch_to(next),
            "illegal TP transition {:?} -> {:?}",
            self.state,
            next
        );
    }

    fn switch_state(&mut self, next: TpState) {
        self.assert_can_switch(next);
        debug!(from = ?self.state, to = ?next, "TP state switch");
        self.state = next;
    }

    /// Send the request of a new transaction
    ///
    /// `packet.addressee` selects the access class and `packet.tp.tc` holds
    /// the response period as compressed time. On error TP and NP are left
    /// as they were.
    ///
    /// # Panics
    /// When `dialog_id` differs from the dialog still in progress.
    pub fn send_request(
        &mut self,
        dialog_id: u8,
        transaction_id: u8,
        is_last_transaction: bool,
        mut packet: Packet,
        qos: QosSettings,
        np: &mut NetworkLayer,
        env: &mut Env<'_>,
    ) -> Result<()> {
        if self.current_dialog_id != 0 {
            assert_eq!(
                dialog_id, self.current_dialog_id,
                "a different dialog is still in progress"
            );
        }
        self.assert_can_switch(TpState::MasterRequestPeriod);
        debug!(dialog_id, transaction_id, "start transaction");

        let ack_not_void = qos.response_mode == ResponseMode::OnError;
        packet.tp.control = TpControl {
            start: true,
            stop: is_last_transaction,
            tc: true,
            ack_requested: qos.response_mode != ResponseMode::None,
            ack_not_void,
            ack_record: false,
        };
        packet.tp.dialog_id = dialog_id;
        packet.tp.transaction_id = transaction_id;
        packet.tp.ack_template = ack_not_void.then(|| AckTemplate::single(transaction_id));

        let access_class = packet.addressee.access_class;
        let profile = if self.current_access_class == Some(access_class) {
            self.active_addressee_access_profile.clone()
        } else {
            env.store.read_access_class(access_class)?
        };

        // the listen timeout of the responders equals the response period
        let slave_listen_timeout = packet.tp.tc;
        let previous_timeout = np.foreground_scan_timeout();
        np.set_foreground_scan_timeout(to_ticks(packet.tp.tc));

        if let Err(err) = np.tx_foreground_frame(packet, true, &profile, slave_listen_timeout, env) {
            np.set_foreground_scan_timeout(previous_timeout);
            return Err(err);
        }

        self.switch_state(TpState::MasterRequestPeriod);
        self.ids_before_request = (self.current_dialog_id, self.current_transaction_id);
        self.current_dialog_id = dialog_id;
        self.current_transaction_id = transaction_id;
        self.current_access_class = Some(access_class);
        self.active_addressee_access_profile = profile;
        Ok(())
    }

    /// Turn a received request into a response and send it
    pub fn send_response(&mut self, mut packet: Packet, np: &mut NetworkLayer, env: &mut Env<'_>) -> Result<()> {
        self.assert_can_switch(TpState::SlaveSendingResponse);

        // ack_requested keeps the requester's value
        let control = &mut packet.tp.control;
        control.ack_not_void = false;
        control.ack_record = false;
        control.tc = false;
        packet.tp.ack_template = None;

        // the origin template goes in every response to a broadcast request and
        // whenever the request opened a dialog and asked for an ack
        let include_origin = !packet.unicast || (control.start && control.ack_requested);

        let profile = self.active_addressee_access_profile.clone();
        np.tx_foreground_frame(packet, include_origin, &profile, 0, env)?;
        self.switch_state(TpState::SlaveSendingResponse);
        Ok(())
    }

    pub fn packet_transmitted(&mut self, packet: Packet, np: &mut NetworkLayer, env: &mut Env<'_>) {
        let control = packet.tp.control;
        let tc = packet.tp.tc;
        let tx_timestamp = packet.tx_meta.timestamp;
        env.session.packet_transmitted(packet);

        match self.state {
            TpState::MasterRequestPeriod if control.tc => {
                self.switch_state(TpState::MasterResponsePeriod);
                let response_period = adjust_compressed_timeout(tc, tx_timestamp, env.scheduler.now());
                np.set_foreground_scan_timeout(response_period);
                np.start_foreground_scan(env);
            }
            TpState::MasterRequestPeriod => {
                self.current_transaction_id = 0;
                self.switch_state(TpState::Idle);
                env.session.transaction_terminated();
            }
            TpState::SlaveSendingResponse => self.switch_state(TpState::SlaveResponsePeriod),
            state => debug!(?state, ack_requested = control.ack_requested, "transmission completed outside of a transaction"),
        }
    }

    /// Channel access failed; restore the state held before the transmission
    pub fn transmission_failure(&mut self, env: &mut Env<'_>) {
        assert!(
            matches!(self.state, TpState::MasterRequestPeriod | TpState::SlaveSendingResponse),
            "transmission failure reported in {:?}",
            self.state
        );
        debug!(state = ?self.state, "CSMA-CA insertion failed, stopping transaction");
        match self.state {
            TpState::MasterRequestPeriod => {
                (self.current_dialog_id, self.current_transaction_id) = self.ids_before_request;
                self.switch_state(TpState::Idle);
            }
            _ => self.switch_state(TpState::SlaveReceivedRequest),
        }
        env.session.transmission_failure();
    }

    fn terminate_dialog(&mut self, env: &mut Env<'_>) {
        debug!(dialog_id = self.current_dialog_id, "dialog terminated");
        env.scheduler.cancel(TimerTask::ResponsePeriodExpired);
        self.current_dialog_id = 0;
        env.session.dialog_terminated();
        self.switch_state(TpState::Idle);
    }

    pub fn foreground_scan_expired(&mut self, env: &mut Env<'_>) {
        match self.state {
            TpState::MasterRequestPeriod => {
                debug!("stale foreground scan expiry ignored while requesting");
            }
            TpState::MasterResponsePeriod => {
                self.current_transaction_id = 0;
                env.session.transaction_terminated();
            }
            _ => {
                self.current_transaction_id = 0;
                self.terminate_dialog(env);
            }
        }
    }

    /// Response period (`Tc`) of the request being answered elapsed
    pub fn response_period_expired(&mut self, np: &mut NetworkLayer, env: &mut Env<'_>) {
        assert!(
            self.state.is_slave(),
            "response period expired in {:?}",
            self.state
        );
        debug!("expiration of the response period");
        self.current_transaction_id = 0;
        self.switch_state(TpState::Idle);
        np.start_foreground_scan(env);
    }

    /// Upper layer closed the dialog
    pub fn signal_dialog_termination(&mut self, np: &mut NetworkLayer, env: &mut Env<'_>) {
        debug!("dialog is terminated by upper layer");
        self.switch_state(TpState::Idle);
        self.current_dialog_id = 0;
        self.current_transaction_id = 0;
        env.scheduler.cancel(TimerTask::ResponsePeriodExpired);
        np.stop_foreground_scan(true, env);
    }

    /// Upper layer gave up on the current transaction
    pub fn stop_transaction(&mut self, np: &mut NetworkLayer, env: &mut Env<'_>) {
        assert_eq!(
            self.state,
            TpState::MasterResponsePeriod,
            "transaction stopped outside of a response period"
        );
        debug!("current transaction is stopped by upper layer");
        self.current_transaction_id = 0;
        np.stop_foreground_scan(false, env);
    }

    /// Admit a frame that passed the network layer
    ///
    /// Frames of other dialogs or transactions are refused; an admitted
    /// frame goes up to the session layer.
    pub fn process_received_packet(
        &mut self,
        mut packet: Packet,
        np: &mut NetworkLayer,
        env: &mut Env<'_>,
    ) -> Result<()> {
        assert!(
            matches!(
                self.state,
                TpState::MasterResponsePeriod | TpState::SlaveResponsePeriod | TpState::Idle
            ),
            "frame received in {:?}",
            self.state
        );

        let tp = packet.tp;
        let now = env.scheduler.now();
        let rx_timestamp = packet.rx_meta.timestamp;
        debug!(
            dialog_id = tp.dialog_id,
            transaction_id = tp.transaction_id,
            current_dialog_id = self.current_dialog_id,
            current_transaction_id = self.current_transaction_id,
            "received segment"
        );

        let mut extension = false;
        if self.state.is_master() {
            if tp.dialog_id != self.current_dialog_id {
                debug!("unexpected dialog id, skipping segment");
                return Err(D7aError::DialogMismatch {
                    expected: self.current_dialog_id,
                    received: tp.dialog_id,
                });
            }
            if tp.transaction_id != self.current_transaction_id {
                debug!("unexpected transaction id, skipping segment");
                return Err(D7aError::TransactionMismatch {
                    expected: self.current_transaction_id,
                    received: tp.transaction_id,
                });
            }

            if tp.control.start {
                // a unicast response closing the dialog may append a new one
                if !(tp.control.stop && packet.unicast) {
                    debug!("start dialog not allowed in master transaction, skipping segment");
                    return Err(D7aError::UnexpectedDialogStart);
                }
                let listen = adjust_compressed_timeout(packet.np.listen_timeout, rx_timestamp, now);
                debug!(listen, "responder wants to append a new dialog");
                np.set_foreground_scan_timeout(listen);
                np.start_foreground_scan(env);
                self.current_dialog_id = 0;
                self.switch_state(TpState::Idle);
                extension = true;
            }
        } else {
            if self.current_dialog_id != 0 && self.current_dialog_id != tp.dialog_id {
                debug!("dialog id not matching the recorded one, skipping segment");
                return Err(D7aError::DialogMismatch {
                    expected: self.current_dialog_id,
                    received: tp.dialog_id,
                });
            }
            if self.current_dialog_id == 0 && !tp.control.start {
                debug!("segment with START cleared filtered");
                return Err(D7aError::StartFlagMissing);
            }

            let requester_class = packet.addressee.access_class;
            let mut profile = if self.current_access_class == Some(requester_class) {
                self.active_addressee_access_profile.clone()
            } else {
                env.store.read_access_class(requester_class)?
            };

            let listen_timeout = packet.np.listen_timeout;
            if listen_timeout != 0 {
                if !packet.unicast && tp.control.tc {
                    let response_period = adjust_compressed_timeout(tp.tc, rx_timestamp, now);
                    if response_period == 0 {
                        warn!(tc = tp.tc, rx_timestamp, now, "response period already expired, request discarded");
                        return Err(D7aError::ResponsePeriodExpired);
                    }
                    let Some(listen) = to_ticks(listen_timeout).checked_sub(to_ticks(tp.tc)) else {
                        panic!(
                            "listen timeout {listen_timeout:#04x} shorter than response period {:#04x}",
                            tp.tc
                        );
                    };

                    // no foreground scan during the response period of a
                    // broadcast request, only once it elapsed
                    rearm(env.scheduler, TimerTask::ResponsePeriodExpired, response_period);
                    np.set_foreground_scan_timeout(listen);
                    np.stop_foreground_scan(false, env);
                } else {
                    let listen = adjust_compressed_timeout(listen_timeout, rx_timestamp, now);
                    np.set_foreground_scan_timeout(listen);
                    np.start_foreground_scan(env);
                }
            }

            self.switch_state(TpState::SlaveReceivedRequest);
            self.current_dialog_id = tp.dialog_id;
            self.current_transaction_id = tp.transaction_id;

            // answer on the channel the request came in on
            profile.bind_channel(packet.rx_meta.channel);
            self.current_access_class = Some(requester_class);
            self.active_addressee_access_profile = profile;
        }

        self.current_addressee = packet.np.origin;
        packet.addressee = packet.np.origin;
        env.session.packet_received(packet, extension);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ScanType;
    use crate::stack::StackConfig;
    use crate::test_support::Harness;

    fn layers(harness: &Harness) -> (NetworkLayer, TransportLayer) {
        let np = NetworkLayer::new(&StackConfig::default(), &harness.store).unwrap();
        (np, TransportLayer::new())
    }

    fn request(tc: u8) -> Packet {
        Packet::new(Addressee::broadcast(1), b"read".to_vec()).with_tc(tc)
    }

    #[test]
    fn test_request_transmitted_opens_response_period() {
        let mut harness = Harness::new(ScanType::Foreground);
        let (mut np, mut tp) = layers(&harness);
        let qos = QosSettings::new(ResponseMode::Always);

        tp.send_request(4, 9, false, request(20), qos, &mut np, &mut harness.env())
            .unwrap();
        assert_eq!(tp.state(), TpState::MasterRequestPeriod);

        harness.scheduler.advance(5);
        let packet = np.packet_transmitted(2, &mut harness.env());
        tp.packet_transmitted(packet, &mut np, &mut harness.env());

        assert_eq!(tp.state(), TpState::MasterResponsePeriod);
        // 20 ticks measured from the transmission at tick 2
        assert_eq!(
            harness.scheduler.remaining(TimerTask::ForegroundScanExpired),
            Some(17)
        );
        assert_eq!(harness.session.transmitted.len(), 1);
    }

    #[test]
    fn test_transmitted_without_tc_terminates_transaction() {
        let mut harness = Harness::new(ScanType::Foreground);
        let (mut np, mut tp) = layers(&harness);
        tp.send_request(1, 1, true, request(8), QosSettings::default(), &mut np, &mut harness.env())
            .unwrap();

        let mut packet = np.packet_transmitted(0, &mut harness.env());
        packet.tp.control.tc = false;
        tp.packet_transmitted(packet, &mut np, &mut harness.env());

        assert_eq!(tp.state(), TpState::Idle);
        assert_eq!(tp.transaction_id(), 0);
        assert_eq!(harness.session.transactions_terminated, 1);
    }

    #[test]
    fn test_request_header_flags_follow_qos() {
        let mut harness = Harness::new(ScanType::Foreground);
        let (mut np, mut tp) = layers(&harness);
        tp.send_request(2, 5, true, request(8), QosSettings::new(ResponseMode::OnError), &mut np, &mut harness.env())
            .unwrap();

        let packet = np.packet_transmitted(0, &mut harness.env());
        let control = packet.tp.control;
        assert!(control.start && control.stop && control.tc);
        assert!(control.ack_requested && control.ack_not_void);
        assert_eq!(packet.tp.ack_template, Some(AckTemplate::single(5)));
        assert_eq!(packet.np.listen_timeout, 8);
    }

    #[test]
    fn test_failed_request_leaves_layers_untouched() {
        let mut harness = Harness::new(ScanType::Foreground);
        let (mut np, mut tp) = layers(&harness);
        // access class 9 has no profile in the store
        let packet = Packet::new(Addressee::broadcast(9), vec![]).with_tc(8);

        let err = tp
            .send_request(1, 1, false, packet, QosSettings::default(), &mut np, &mut harness.env())
            .unwrap_err();
        assert!(matches!(err, D7aError::Store(_)));
        assert_eq!(tp.state(), TpState::Idle);
        assert_eq!(tp.dialog_id(), 0);
        assert_eq!(np.foreground_scan_timeout(), 0);
        assert!(harness.radio.frames.is_empty());
    }

    #[test]
    fn test_failed_follow_up_request_keeps_open_dialog() {
        let mut harness = Harness::new(ScanType::Foreground);
        let (mut np, mut tp) = layers(&harness);
        let qos = QosSettings::default();
        tp.send_request(4, 9, false, request(8), qos, &mut np, &mut harness.env())
            .unwrap();
        let packet = np.packet_transmitted(0, &mut harness.env());
        tp.packet_transmitted(packet, &mut np, &mut harness.env());
        tp.foreground_scan_expired(&mut harness.env());
        assert_eq!((tp.dialog_id(), tp.transaction_id()), (4, 0));

        tp.send_request(4, 10, false, request(8), qos, &mut np, &mut harness.env())
            .unwrap();
        np.transmission_failure(&mut harness.env());
        tp.transmission_failure(&mut harness.env());

        assert_eq!(tp.state(), TpState::Idle);
        assert_eq!((tp.dialog_id(), tp.transaction_id()), (4, 0));
        assert_eq!(harness.session.failures, 1);
    }

    #[test]
    #[should_panic(expected = "a different dialog is still in progress")]
    fn test_second_dialog_is_defect() {
        let mut harness = Harness::new(ScanType::Foreground);
        let (mut np, mut tp) = layers(&harness);
        let qos = QosSettings::default();
        tp.send_request(1, 1, false, request(8), qos, &mut np, &mut harness.env())
            .unwrap();
        let packet = np.packet_transmitted(0, &mut harness.env());
        tp.packet_transmitted(packet, &mut np, &mut harness.env());

        let _ = tp.send_request(2, 1, false, request(8), qos, &mut np, &mut harness.env());
    }

    #[test]
    fn test_stale_expiry_ignored_while_requesting() {
        let mut harness = Harness::new(ScanType::Foreground);
        let (mut np, mut tp) = layers(&harness);
        tp.send_request(1, 3, false, request(8), QosSettings::default(), &mut np, &mut harness.env())
            .unwrap();

        tp.foreground_scan_expired(&mut harness.env());
        assert_eq!(tp.state(), TpState::MasterRequestPeriod);
        assert_eq!(tp.transaction_id(), 3);
        assert_eq!(harness.session.transactions_terminated, 0);
    }

    #[test]
    fn test_transition_table() {
        use TpState::*;
        assert!(Idle.can_switch_to(MasterRequestPeriod));
        assert!(MasterResponsePeriod.can_switch_to(MasterRequestPeriod));
        assert!(!MasterRequestPeriod.can_switch_to(MasterRequestPeriod));
        assert!(!Idle.can_switch_to(MasterResponsePeriod));
        assert!(SlaveResponsePeriod.can_switch_to(SlaveReceivedRequest));
        assert!(SlaveSendingResponse.can_switch_to(SlaveReceivedRequest));
        assert!(!Idle.can_switch_to(SlaveSendingResponse));
        assert!(!SlaveReceivedRequest.can_switch_to(SlaveResponsePeriod));
        for state in [
            Idle,
            MasterRequestPeriod,
            MasterResponsePeriod,
            SlaveReceivedRequest,
            SlaveSendingResponse,
            SlaveResponsePeriod,
        ] {
            assert!(state.can_switch_to(Idle));
        }
    }

    #[test]
    #[should_panic(expected = "illegal TP transition")]
    fn test_response_without_request_is_defect() {
        let mut tp = TransportLayer::new();
        tp.switch_state(TpState::SlaveSendingResponse);
    }

    #[test]
    fn test_master_and_slave_groups() {
        assert!(TpState::MasterResponsePeriod.is_master());
        assert!(!TpState::MasterResponsePeriod.is_slave());
        assert!(TpState::SlaveSendingResponse.is_slave());
        assert!(!TpState::Idle.is_master() && !TpState::Idle.is_slave());
    }
}
