//! Collaborators for unit tests of the protocol layers

use crate::contracts::{AccessProfile, ScanType, UID_LEN};
use crate::packet::Packet;
use crate::radio::Radio;
use crate::scheduler::TickScheduler;
use crate::session::SessionListener;
use crate::stack::Env;
use crate::store::MemoryStore;

pub const UID: [u8; UID_LEN] = [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17];
pub const KEY: [u8; 16] = [7; 16];

#[derive(Debug, Default)]
pub struct TestRadio {
    pub scans_started: usize,
    pub scans_stopped: Vec<bool>,
    pub frames: Vec<Vec<u8>>,
}

impl Radio for TestRadio {
    fn start_foreground_scan(&mut self) {
        self.scans_started += 1;
    }

    fn stop_foreground_scan(&mut self, auto_scan: bool) {
        self.scans_stopped.push(auto_scan);
    }

    fn transmit(&mut self, frame: &[u8], _profile: &AccessProfile) {
        self.frames.push(frame.to_vec());
    }
}

#[derive(Debug, Default)]
pub struct TestSession {
    pub transmitted: Vec<Packet>,
    pub failures: usize,
    pub dialogs_terminated: usize,
    pub transactions_terminated: usize,
    pub received: Vec<(Packet, bool)>,
}

impl SessionListener for TestSession {
    fn packet_transmitted(&mut self, packet: Packet) {
        self.transmitted.push(packet);
    }

    fn transmission_failure(&mut self) {
        self.failures += 1;
    }

    fn dialog_terminated(&mut self) {
        self.dialogs_terminated += 1;
    }

    fn transaction_terminated(&mut self) {
        self.transactions_terminated += 1;
    }

    fn packet_received(&mut self, packet: Packet, is_dialog_extension: bool) {
        self.received.push((packet, is_dialog_extension));
    }
}

pub struct Harness {
    pub radio: TestRadio,
    pub scheduler: TickScheduler,
    pub store: MemoryStore,
    pub session: TestSession,
}

impl Harness {
    /// Own access class 0 scanning with `scan_type`; classes 1-3 foreground
    pub fn new(scan_type: ScanType) -> Self {
        let own = AccessProfile {
            scan_type,
            ..AccessProfile::default()
        };
        let mut store = MemoryStore::new(UID)
            .unwrap()
            .with_key(KEY)
            .with_access_profile(0, &own)
            .unwrap();
        for access_class in 1..4 {
            store
                .set_access_profile(access_class, &AccessProfile::default())
                .unwrap();
        }
        Self {
            radio: TestRadio::default(),
            scheduler: TickScheduler::new(),
            store,
            session: TestSession::default(),
        }
    }

    pub fn env(&mut self) -> Env<'_> {
        Env {
            radio: &mut self.radio,
            scheduler: &mut self.scheduler,
            store: &mut self.store,
            session: &mut self.session,
        }
    }
}
