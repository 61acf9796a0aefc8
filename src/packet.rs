//! D7A network and transport headers and the packet that carries them
//!
//! Wire layout, in order:
//!
//! ```text
//! NP  listen_timeout(1) np_ctrl(1) [origin id(2|8)] [ext(1) [key_counter(1) frame_counter(4, BE)]]
//! TP  tp_ctrl(1) [tc(1)] dialog_id(1) transaction_id(1) [ack_start(1) ack_stop(1)]
//!     payload ... [auth tag(0|4|8|16)]
//! ```
//!
//! `np_ctrl`: bits 0-3 origin access class, bits 4-5 origin id type,
//! bit 6 hop enabled, bit 7 extension present.
//! `tp_ctrl`: bit 7 start, bit 6 stop, bit 5 tc present, bit 3 ack requested,
//! bit 2 ack not void, bit 1 ack record.
//!
//! Encoders append to an owned buffer and return the number of bytes
//! written; decoders read through a `FrameReader` cursor and return the
//! number of bytes consumed.
use crate::contracts::{Addressee, IdType, RxMeta, SecurityState, TxMeta};
use crate::errors::{D7aError, Result};
use crate::security::NlsMethod;

const NP_CTRL_ACCESS_CLASS_MASK: u8 = 0x0F;
const NP_CTRL_ID_TYPE_SHIFT: u8 = 4;
const NP_CTRL_ID_TYPE_MASK: u8 = 0x03;
const NP_CTRL_HOP_ENABLED: u8 = 1 << 6;
const NP_CTRL_EXTENSION: u8 = 1 << 7;
const NP_EXT_NLS_MASK: u8 = 0x0F;

const TP_CTRL_START: u8 = 1 << 7;
const TP_CTRL_STOP: u8 = 1 << 6;
const TP_CTRL_TC: u8 = 1 << 5;
const TP_CTRL_ACK_REQUESTED: u8 = 1 << 3;
const TP_CTRL_ACK_NOT_VOID: u8 = 1 << 2;
const TP_CTRL_ACK_RECORD: u8 = 1 << 1;

/// Read cursor over a received frame
#[derive(Debug)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread tail of the frame
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(D7aError::InvalidPacketLength {
                expected: end,
                received: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

/// Network protocol header
///
/// `origin` holds the origin addressee template (id type, access class and
/// id). `nls_method` is `Some` when the extension byte is present;
/// `security` carries the counters of stream and CCM modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NpHeader {
    pub listen_timeout: u8,
    pub hop_enabled: bool,
    pub origin: Addressee,
    pub nls_method: Option<NlsMethod>,
    pub security: Option<SecurityState>,
}

impl NpHeader {
    pub fn control_byte(&self) -> u8 {
        let mut ctrl = self.origin.access_class & NP_CTRL_ACCESS_CLASS_MASK;
        ctrl |= self.origin.id_type.bits() << NP_CTRL_ID_TYPE_SHIFT;
        if self.hop_enabled {
            ctrl |= NP_CTRL_HOP_ENABLED;
        }
        if self.nls_method.is_some() {
            ctrl |= NP_CTRL_EXTENSION;
        }
        ctrl
    }

    /// NLS method if the frame is actually secured
    pub fn security_method(&self) -> Option<NlsMethod> {
        self.nls_method.filter(|method| method.is_secured())
    }

    /// Append the header to `out`
    ///
    /// # Panics
    /// Hop control is not supported; assembling a hop-enabled header is a
    /// defect in the calling layer.
    pub fn encode(&self, out: &mut Vec<u8>) -> usize {
        assert!(!self.hop_enabled, "hopping is not supported");

        let start = out.len();
        out.push(self.listen_timeout);
        out.push(self.control_byte());
        out.extend_from_slice(self.origin.id_bytes());

        if let Some(method) = self.nls_method {
            out.push(method.bits());
            if method.carries_counters() {
                let security = self.security.unwrap_or_default();
                out.push(security.key_counter);
                out.extend_from_slice(&security.frame_counter.to_be_bytes());
            }
        }

        out.len() - start
    }

    /// Parse a header from the start of `buf`
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = FrameReader::new(buf);
        let header = Self::read(&mut reader)?;
        Ok((header, reader.position()))
    }

    pub fn read(reader: &mut FrameReader<'_>) -> Result<Self> {
        let listen_timeout = reader.read_u8()?;
        let ctrl = reader.read_u8()?;

        let id_type = IdType::from_bits((ctrl >> NP_CTRL_ID_TYPE_SHIFT) & NP_CTRL_ID_TYPE_MASK)?;
        let access_class = ctrl & NP_CTRL_ACCESS_CLASS_MASK;
        let id = reader.read_bytes(id_type.id_len())?;
        let origin = Addressee::from_id_bytes(id_type, access_class, id);

        let mut nls_method = None;
        let mut security = None;
        if ctrl & NP_CTRL_EXTENSION != 0 {
            let ext = reader.read_u8()?;
            let method = NlsMethod::from_bits(ext & NP_EXT_NLS_MASK)?;
            if method.carries_counters() {
                let key_counter = reader.read_u8()?;
                let frame_counter = reader.read_u32_be()?;
                security = Some(SecurityState::new(frame_counter, key_counter));
            }
            nls_method = Some(method);
        }

        Ok(Self {
            listen_timeout,
            hop_enabled: ctrl & NP_CTRL_HOP_ENABLED != 0,
            origin,
            nls_method,
            security,
        })
    }
}

/// Transport protocol control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TpControl {
    pub start: bool,
    pub stop: bool,
    pub tc: bool,
    pub ack_requested: bool,
    pub ack_not_void: bool,
    pub ack_record: bool,
}

impl TpControl {
    pub fn to_byte(self) -> u8 {
        let mut ctrl = 0;
        for (set, bit) in [
            (self.start, TP_CTRL_START),
            (self.stop, TP_CTRL_STOP),
            (self.tc, TP_CTRL_TC),
            (self.ack_requested, TP_CTRL_ACK_REQUESTED),
            (self.ack_not_void, TP_CTRL_ACK_NOT_VOID),
            (self.ack_record, TP_CTRL_ACK_RECORD),
        ] {
            if set {
                ctrl |= bit;
            }
        }
        ctrl
    }

    pub fn from_byte(ctrl: u8) -> Self {
        Self {
            start: ctrl & TP_CTRL_START != 0,
            stop: ctrl & TP_CTRL_STOP != 0,
            tc: ctrl & TP_CTRL_TC != 0,
            ack_requested: ctrl & TP_CTRL_ACK_REQUESTED != 0,
            ack_not_void: ctrl & TP_CTRL_ACK_NOT_VOID != 0,
            ack_record: ctrl & TP_CTRL_ACK_RECORD != 0,
        }
    }

    /// Whether the ack range template follows the transaction id
    pub fn has_ack_template(self) -> bool {
        self.ack_requested && self.ack_not_void
    }
}

/// Range of acknowledged transaction ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckTemplate {
    pub transaction_id_start: u8,
    pub transaction_id_stop: u8,
}

impl AckTemplate {
    pub fn single(transaction_id: u8) -> Self {
        Self {
            transaction_id_start: transaction_id,
            transaction_id_stop: transaction_id,
        }
    }
}

/// Transport protocol header
///
/// `tc` is compressed time and only travels when `control.tc` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TpHeader {
    pub control: TpControl,
    pub tc: u8,
    pub dialog_id: u8,
    pub transaction_id: u8,
    pub ack_template: Option<AckTemplate>,
}

impl TpHeader {
    pub fn encode(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        out.push(self.control.to_byte());
        if self.control.tc {
            out.push(self.tc);
        }
        out.push(self.dialog_id);
        out.push(self.transaction_id);

        if self.control.has_ack_template() {
            let template = self
                .ack_template
                .unwrap_or_else(|| AckTemplate::single(self.transaction_id));
            out.push(template.transaction_id_start);
            out.push(template.transaction_id_stop);
        }

        out.len() - start
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = FrameReader::new(buf);
        let header = Self::read(&mut reader)?;
        Ok((header, reader.position()))
    }

    pub fn read(reader: &mut FrameReader<'_>) -> Result<Self> {
        let control = TpControl::from_byte(reader.read_u8()?);
        let tc = if control.tc { reader.read_u8()? } else { 0 };
        let dialog_id = reader.read_u8()?;
        let transaction_id = reader.read_u8()?;

        let ack_template = if control.has_ack_template() {
            Some(AckTemplate {
                transaction_id_start: reader.read_u8()?,
                transaction_id_stop: reader.read_u8()?,
            })
        } else {
            None
        };

        Ok(Self {
            control,
            tc,
            dialog_id,
            transaction_id,
            ack_template,
        })
    }
}

/// A frame travelling through the network and transport layers
///
/// Owned by whichever layer currently handles it: moved down on transmit,
/// handed back on completion, moved up to the session layer on reception.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub np: NpHeader,
    pub tp: TpHeader,
    /// Target of an outgoing packet, resolved origin of a received one
    pub addressee: Addressee,
    pub payload: Vec<u8>,
    /// The data link header carried a target address (unicast frame)
    pub unicast: bool,
    pub rx_meta: RxMeta,
    pub tx_meta: TxMeta,
}

impl Packet {
    /// Outgoing packet for `addressee`
    pub fn new(addressee: Addressee, payload: Vec<u8>) -> Self {
        Self {
            addressee,
            unicast: !addressee.is_broadcast(),
            payload,
            ..Self::default()
        }
    }

    /// Set the response period (compressed time) of a request
    pub fn with_tc(mut self, tc: u8) -> Self {
        self.tp.tc = tc;
        self
    }

    /// Append TP header and payload: the part of the frame NLS protects
    pub fn encode_body(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        self.tp.encode(out);
        out.extend_from_slice(&self.payload);
        out.len() - start
    }
}
