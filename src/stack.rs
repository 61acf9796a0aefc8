//! The D7A stack context
//!
//! `D7aStack` owns both protocol layers and the collaborators they drive.
//! Every entry point (a session call, a radio event or a due task) runs to
//! completion before the next one starts, and the layers hand results back
//! through the stack instead of calling each other re-entrantly.
use tracing::{debug, trace};

use crate::contracts::{QosSettings, RxMeta};
use crate::errors::Result;
use crate::network::NetworkLayer;
use crate::packet::Packet;
use crate::radio::Radio;
use crate::scheduler::{Scheduler, TickScheduler, TimerTask};
use crate::security::NlsMethod;
use crate::session::SessionListener;
use crate::store::ConfigStore;
use crate::timing::Tick;
use crate::transport::TransportLayer;
use crate::TRUSTED_NODE_TABLE_SIZE;

/// Build-time options of the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    nls_method: Option<NlsMethod>,
    trusted_node_table_size: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            nls_method: None,
            trusted_node_table_size: TRUSTED_NODE_TABLE_SIZE,
        }
    }
}

impl StackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Secure every outgoing frame with `method`; `None` disables network
    /// layer security
    pub fn with_nls_method(mut self, method: impl Into<Option<NlsMethod>>) -> Self {
        self.nls_method = method.into();
        self
    }

    pub fn with_trusted_node_table_size(mut self, size: usize) -> Self {
        self.trusted_node_table_size = size;
        self
    }

    pub fn nls_method(&self) -> Option<NlsMethod> {
        self.nls_method
    }

    pub fn trusted_node_table_size(&self) -> usize {
        self.trusted_node_table_size
    }
}

/// Collaborators borrowed for the duration of one operation
pub struct Env<'a> {
    pub radio: &'a mut dyn Radio,
    pub scheduler: &'a mut dyn Scheduler,
    pub store: &'a mut dyn ConfigStore,
    pub session: &'a mut dyn SessionListener,
}

/// Network and transport layers bound to their collaborators
pub struct D7aStack<R, S, C, U> {
    np: NetworkLayer,
    tp: TransportLayer,
    radio: R,
    scheduler: S,
    store: C,
    session: U,
}

impl<R, S, C, U> D7aStack<R, S, C, U>
where
    R: Radio,
    S: Scheduler,
    C: ConfigStore,
    U: SessionListener,
{
    pub fn new(config: StackConfig, radio: R, scheduler: S, store: C, session: U) -> Result<Self> {
        let np = NetworkLayer::new(&config, &store)?;
        debug!(?config, "D7A stack initialized");
        Ok(Self {
            np,
            tp: TransportLayer::new(),
            radio,
            scheduler,
            store,
            session,
        })
    }

    fn split(&mut self) -> (&mut NetworkLayer, &mut TransportLayer, Env<'_>) {
        (
            &mut self.np,
            &mut self.tp,
            Env {
                radio: &mut self.radio,
                scheduler: &mut self.scheduler,
                store: &mut self.store,
                session: &mut self.session,
            },
        )
    }

    pub fn network(&self) -> &NetworkLayer {
        &self.np
    }

    pub fn transport(&self) -> &TransportLayer {
        &self.tp
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn session(&self) -> &U {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut U {
        &mut self.session
    }

    pub fn send_request(
        &mut self,
        dialog_id: u8,
        transaction_id: u8,
        is_last_transaction: bool,
        packet: Packet,
        qos: QosSettings,
    ) -> Result<()> {
        let (np, tp, mut env) = self.split();
        tp.send_request(dialog_id, transaction_id, is_last_transaction, packet, qos, np, &mut env)
    }

    pub fn send_response(&mut self, packet: Packet) -> Result<()> {
        let (np, tp, mut env) = self.split();
        tp.send_response(packet, np, &mut env)
    }

    pub fn signal_dialog_termination(&mut self) {
        let (np, tp, mut env) = self.split();
        tp.signal_dialog_termination(np, &mut env);
    }

    pub fn stop_transaction(&mut self) {
        let (np, tp, mut env) = self.split();
        tp.stop_transaction(np, &mut env);
    }

    /// Radio completed the pending transmission at `timestamp`
    pub fn on_packet_transmitted(&mut self, timestamp: Tick) {
        let (np, tp, mut env) = self.split();
        let packet = np.packet_transmitted(timestamp, &mut env);
        tp.packet_transmitted(packet, np, &mut env);
    }

    pub fn on_transmission_failure(&mut self) {
        let (np, tp, mut env) = self.split();
        np.transmission_failure(&mut env);
        tp.transmission_failure(&mut env);
    }

    /// Radio delivered a foreground frame
    ///
    /// `unicast` tells whether the data link header carried a target
    /// address. An `Err` means the frame was dropped; the session layer is
    /// only told about admitted frames.
    pub fn on_frame_received(&mut self, frame: &[u8], rx_meta: RxMeta, unicast: bool) -> Result<()> {
        let (np, tp, mut env) = self.split();
        np.process_received_packet()?;
        let mut packet = np.receive_frame(frame).inspect_err(|err| {
            debug!(%err, len = frame.len(), "frame dropped by network layer");
        })?;
        packet.rx_meta = rx_meta;
        packet.unicast = unicast;
        tp.process_received_packet(packet, np, &mut env)
    }

    /// Radio received a background advertising frame announcing a
    /// foreground frame `eta` ticks after `rx_timestamp`
    pub fn on_advertising_frame(&mut self, eta: Tick, rx_timestamp: Tick) {
        let (np, _, mut env) = self.split();
        np.schedule_foreground_scan_after_advertising(eta, rx_timestamp, &mut env);
    }

    /// Dispatch a due task
    pub fn run_task(&mut self, task: TimerTask) {
        trace!(?task, "running task");
        let (np, tp, mut env) = self.split();
        match task {
            TimerTask::ForegroundScanExpired => {
                np.foreground_scan_expired(&mut env);
                tp.foreground_scan_expired(&mut env);
            }
            TimerTask::StartForegroundScanAfterAdvertising => {
                np.start_foreground_scan_after_advertising(&mut env);
            }
            TimerTask::ResponsePeriodExpired => tp.response_period_expired(np, &mut env),
        }
    }
}

impl<R, C, U> D7aStack<R, TickScheduler, C, U>
where
    R: Radio,
    C: ConfigStore,
    U: SessionListener,
{
    /// Move the virtual clock forward and run every task that became due
    pub fn advance(&mut self, ticks: Tick) {
        self.scheduler.advance(ticks);
        while let Some(task) = self.scheduler.pop_ready() {
            self.run_task(task);
        }
    }

    /// Run tasks that are already due without moving the clock
    pub fn run_pending(&mut self) {
        self.advance(0);
    }
}
