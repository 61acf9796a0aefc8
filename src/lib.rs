//! D7AP Core - DASH7 network and transport protocol engine
//!
//! This library implements the two protocol layers that sit between a
//! low-power radio and the session layer of a DASH7 (D7A) node:
//!
//! - the **network layer** (`network`): foreground scan windows, origin
//!   addressing, network layer security (AES-128 CTR, CBC-MAC and CCM) and
//!   replay protection through a trusted node table;
//! - the **transport layer** (`transport`): the dialog/transaction state
//!   machine, response period and listen window timing.
//!
//! Both layers are owned by a `D7aStack` together with the collaborators
//! they drive: a `Radio`, a `Scheduler`, a `ConfigStore` and a
//! `SessionListener`.
//!
//! # Design Principles
//! - Single-threaded and non-blocking: every wait is a scheduled task
//! - Contract violations between layers panic, rejected frames return errors
//! - Security counters are persisted before a frame leaves the node

pub mod errors;
pub mod contracts;
pub mod timing;
pub mod packet;
pub mod security;
pub mod trusted_nodes;
pub mod scheduler;
pub mod radio;
pub mod store;
pub mod session;
pub mod network;
pub mod transport;
pub mod stack;

pub use contracts::{AccessProfile, Addressee, IdType, QosSettings, ResponseMode, RxMeta, SecurityState};
pub use errors::{D7aError, Result};
pub use network::{NetworkLayer, NpState};
pub use packet::Packet;
pub use radio::Radio;
pub use scheduler::{ScheduleError, Scheduler, TickScheduler, TimerTask};
pub use security::{NlsMethod, SecurityEnvelope};
pub use session::SessionListener;
pub use stack::{D7aStack, StackConfig};
pub use store::{ConfigStore, MemoryStore};
pub use transport::{TpState, TransportLayer};

/// Maximum size of a radio frame (in bytes)
pub const MAX_FRAME_SIZE: usize = 255;

/// Default capacity of the trusted node table
pub const TRUSTED_NODE_TABLE_SIZE: usize = 16;

#[cfg(test)]
mod test_support;
