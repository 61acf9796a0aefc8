#![allow(dead_code)]

use std::sync::Once;

use d7ap_core::contracts::{ChannelId, ScanType, Subband, UID_LEN};
use d7ap_core::{
    AccessProfile, D7aStack, MemoryStore, NlsMethod, Packet, Radio, RxMeta, SessionListener,
    StackConfig, TickScheduler,
};

pub const MASTER_UID: [u8; UID_LEN] = [0xAA, 0, 0, 0, 0, 0, 0, 0x01];
pub const SLAVE_UID: [u8; UID_LEN] = [0xBB, 0, 0, 0, 0, 0, 0, 0x02];
pub const NETWORK_KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];

pub type TestStack = D7aStack<RecordingRadio, TickScheduler, MemoryStore, RecordingSession>;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub bytes: Vec<u8>,
    pub profile: AccessProfile,
}

#[derive(Debug, Default)]
pub struct RecordingRadio {
    pub scans_started: usize,
    pub scans_stopped: Vec<bool>,
    pub sent: Vec<SentFrame>,
}

impl RecordingRadio {
    pub fn last_frame(&self) -> Vec<u8> {
        self.sent.last().map(|frame| frame.bytes.clone()).unwrap_or_default()
    }
}

impl Radio for RecordingRadio {
    fn start_foreground_scan(&mut self) {
        self.scans_started += 1;
    }

    fn stop_foreground_scan(&mut self, auto_scan: bool) {
        self.scans_stopped.push(auto_scan);
    }

    fn transmit(&mut self, frame: &[u8], profile: &AccessProfile) {
        self.sent.push(SentFrame {
            bytes: frame.to_vec(),
            profile: profile.clone(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Transmitted(Packet),
    TransmissionFailure,
    DialogTerminated,
    TransactionTerminated,
    Received { packet: Packet, extension: bool },
}

#[derive(Debug, Default)]
pub struct RecordingSession {
    pub events: Vec<SessionEvent>,
}

impl RecordingSession {
    pub fn received(&self) -> Vec<(&Packet, bool)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Received { packet, extension } => Some((packet, *extension)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &SessionEvent) -> usize {
        self.events.iter().filter(|event| *event == wanted).count()
    }
}

impl SessionListener for RecordingSession {
    fn packet_transmitted(&mut self, packet: Packet) {
        self.events.push(SessionEvent::Transmitted(packet));
    }

    fn transmission_failure(&mut self) {
        self.events.push(SessionEvent::TransmissionFailure);
    }

    fn dialog_terminated(&mut self) {
        self.events.push(SessionEvent::DialogTerminated);
    }

    fn transaction_terminated(&mut self) {
        self.events.push(SessionEvent::TransactionTerminated);
    }

    fn packet_received(&mut self, packet: Packet, is_dialog_extension: bool) {
        self.events.push(SessionEvent::Received {
            packet,
            extension: is_dialog_extension,
        });
    }
}

pub fn foreground_profile() -> AccessProfile {
    AccessProfile {
        scan_type: ScanType::Foreground,
        subnet: 0x01,
        scan_automation_period: 0,
        subbands: vec![Subband {
            channel_header: 0x20,
            channel_index_start: 0,
            channel_index_end: 270,
            eirp: 10,
            cca: 86,
        }],
        ..AccessProfile::default()
    }
}

pub fn store_for(uid: [u8; UID_LEN]) -> MemoryStore {
    let mut store = MemoryStore::new(uid)
        .expect("store")
        .with_key(NETWORK_KEY)
        .with_active_access_class(0);
    for access_class in 0..4 {
        store
            .set_access_profile(access_class, &foreground_profile())
            .expect("access profile");
    }
    store
}

pub fn stack_with(nls_method: Option<NlsMethod>, store: MemoryStore) -> TestStack {
    init_tracing();
    let config = StackConfig::new().with_nls_method(nls_method);
    D7aStack::new(
        config,
        RecordingRadio::default(),
        TickScheduler::new(),
        store,
        RecordingSession::default(),
    )
    .expect("stack")
}

pub fn master(nls_method: Option<NlsMethod>) -> TestStack {
    stack_with(nls_method, store_for(MASTER_UID))
}

pub fn slave(nls_method: Option<NlsMethod>) -> TestStack {
    stack_with(nls_method, store_for(SLAVE_UID))
}

pub fn rx_meta(timestamp: u32) -> RxMeta {
    RxMeta {
        timestamp,
        channel: ChannelId {
            channel_header: 0x22,
            center_freq_index: 42,
        },
    }
}
