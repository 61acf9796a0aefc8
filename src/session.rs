//! Upward signals to the session layer

use crate::packet::Packet;

/// Receiver of transport layer events
///
/// Called while the stack is mid-operation; implementations record or queue
/// the event and must not call back into the stack.
pub trait SessionListener {
    fn packet_transmitted(&mut self, packet: Packet);

    /// Channel access failed; the layer does not retry on its own
    fn transmission_failure(&mut self);

    fn dialog_terminated(&mut self);

    fn transaction_terminated(&mut self);

    /// An admitted frame. `is_dialog_extension` is set when the responder
    /// appended a new dialog to the one just closed.
    fn packet_received(&mut self, packet: Packet, is_dialog_extension: bool);
}
