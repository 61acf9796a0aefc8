//! Data link / radio collaborator consumed by the network layer

use crate::contracts::AccessProfile;

/// Radio operations the network layer drives
///
/// Transmission is asynchronous: `transmit` only queues the frame, and the
/// outcome is reported back through `D7aStack::on_packet_transmitted` or
/// `D7aStack::on_transmission_failure`. Implementations must not call back
/// into the stack from these methods.
pub trait Radio {
    /// Open a foreground scan on the current channel
    fn start_foreground_scan(&mut self);

    /// Close the foreground scan and resume scan automation when `auto_scan`
    /// is set, otherwise put the radio to idle
    fn stop_foreground_scan(&mut self, auto_scan: bool);

    /// Queue an assembled frame using the channel access rules of `profile`
    fn transmit(&mut self, frame: &[u8], profile: &AccessProfile);
}
