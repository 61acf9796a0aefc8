//! Network layer security (NLS) envelope
//!
//! The NP protects everything after its own header (TP header and payload)
//! with one of the AES-128 based NLS methods:
//!
//! | method          | confidentiality | tag length | first block  |
//! |-----------------|-----------------|------------|--------------|
//! | `AesCtr`        | yes             | 0          | IV           |
//! | `AesCbcMac*`    | no              | 16/8/4     | header block |
//! | `AesCcm*`       | yes             | 16/8/4     | IV           |
//!
//! Header block: `ext | listen_timeout | 0 0 0 0 | origin id (8) | np_ctrl | len`.
//! IV block: `nls | key_counter | frame_counter (BE) | origin id (8) | np_ctrl | len`.
//! The origin id starts at offset 6 and is zero padded for VIDs.
//!
//! Counter blocks are the IV incremented as a 128-bit big-endian integer. CCM
//! computes the CBC-MAC over the plaintext starting from the IV, encrypts the
//! tag with the keystream block of the IV itself and the payload with the
//! following ones.
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use subtle::ConstantTimeEq;
use tracing::{debug, trace};

use crate::errors::{D7aError, Result};
use crate::packet::NpHeader;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// Length of the NLS key
pub const KEY_LEN: usize = 16;

pub type Block = [u8; AES_BLOCK_SIZE];

const ORIGIN_OFFSET: usize = 6;
const CTRL_OFFSET: usize = 14;
const LEN_OFFSET: usize = 15;

/// Network layer security method, as carried in the NP extension byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NlsMethod {
    None = 0,
    AesCtr = 1,
    AesCbcMac128 = 2,
    AesCbcMac64 = 3,
    AesCbcMac32 = 4,
    AesCcm128 = 5,
    AesCcm64 = 6,
    AesCcm32 = 7,
}

impl NlsMethod {
    /// Every method that actually secures a frame
    pub const SECURED: [NlsMethod; 7] = [
        NlsMethod::AesCtr,
        NlsMethod::AesCbcMac128,
        NlsMethod::AesCbcMac64,
        NlsMethod::AesCbcMac32,
        NlsMethod::AesCcm128,
        NlsMethod::AesCcm64,
        NlsMethod::AesCcm32,
    ];

    pub fn from_bits(bits: u8) -> Result<Self> {
        Ok(match bits {
            0 => NlsMethod::None,
            1 => NlsMethod::AesCtr,
            2 => NlsMethod::AesCbcMac128,
            3 => NlsMethod::AesCbcMac64,
            4 => NlsMethod::AesCbcMac32,
            5 => NlsMethod::AesCcm128,
            6 => NlsMethod::AesCcm64,
            7 => NlsMethod::AesCcm32,
            other => return Err(D7aError::InvalidNlsMethod(other)),
        })
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Authentication tag length in bytes
    pub const fn tag_len(self) -> usize {
        match self {
            NlsMethod::None | NlsMethod::AesCtr => 0,
            NlsMethod::AesCbcMac128 | NlsMethod::AesCcm128 => 16,
            NlsMethod::AesCbcMac64 | NlsMethod::AesCcm64 => 8,
            NlsMethod::AesCbcMac32 | NlsMethod::AesCcm32 => 4,
        }
    }

    /// Stream and CCM modes carry key and frame counters in the NP header
    pub const fn carries_counters(self) -> bool {
        matches!(
            self,
            NlsMethod::AesCtr | NlsMethod::AesCcm128 | NlsMethod::AesCcm64 | NlsMethod::AesCcm32
        )
    }

    pub const fn is_secured(self) -> bool {
        !matches!(self, NlsMethod::None)
    }

    pub const fn is_mac_only(self) -> bool {
        matches!(
            self,
            NlsMethod::AesCbcMac128 | NlsMethod::AesCbcMac64 | NlsMethod::AesCbcMac32
        )
    }
}

fn write_origin(block: &mut Block, header: &NpHeader) {
    let id = header.origin.id_bytes();
    block[ORIGIN_OFFSET..ORIGIN_OFFSET + id.len()].copy_from_slice(id);
}

/// First CBC-MAC block of the MAC-only modes
pub fn header_block(header: &NpHeader, payload_len: usize) -> Block {
    let mut block = [0u8; AES_BLOCK_SIZE];
    block[0] = header.nls_method.map_or(0, NlsMethod::bits);
    block[1] = header.listen_timeout;
    write_origin(&mut block, header);
    block[CTRL_OFFSET] = header.control_byte();
    block[LEN_OFFSET] = payload_len as u8;
    block
}

/// Initialization vector of the CTR and CCM modes
pub fn iv_block(header: &NpHeader, payload_len: usize) -> Block {
    let security = header.security.unwrap_or_default();
    let mut block = [0u8; AES_BLOCK_SIZE];
    block[0] = header.nls_method.map_or(0, NlsMethod::bits);
    block[1] = security.key_counter;
    block[2..6].copy_from_slice(&security.frame_counter.to_be_bytes());
    write_origin(&mut block, header);
    block[CTRL_OFFSET] = header.control_byte();
    block[LEN_OFFSET] = payload_len as u8;
    block
}

fn increment_counter(block: &mut Block) {
    for byte in block.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// AES-128 keyed envelope applying the NLS methods to frame bodies
#[derive(Clone)]
pub struct SecurityEnvelope {
    cipher: Aes128,
}

impl SecurityEnvelope {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    /// Raw AES-128 block encryption
    pub fn encrypt_block(&self, block: &Block) -> Block {
        let mut buf = GenericArray::clone_from_slice(block);
        self.cipher.encrypt_block(&mut buf);
        let mut out = [0u8; AES_BLOCK_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    fn cbc_mac(&self, first: &Block, data: &[u8]) -> Block {
        let mut mac = self.encrypt_block(first);
        for chunk in data.chunks(AES_BLOCK_SIZE) {
            for (acc, byte) in mac.iter_mut().zip(chunk) {
                *acc ^= byte;
            }
            mac = self.encrypt_block(&mac);
        }
        mac
    }

    fn apply_keystream(&self, mut counter: Block, data: &mut [u8]) {
        for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
            let keystream = self.encrypt_block(&counter);
            for (byte, key) in chunk.iter_mut().zip(keystream.iter()) {
                *byte ^= key;
            }
            increment_counter(&mut counter);
        }
    }

    /// CCM tag and the counter block the payload keystream starts from
    fn ccm_tag(&self, iv: &Block, plaintext: &[u8], tag_len: usize) -> (Vec<u8>, Block) {
        let mac = self.cbc_mac(iv, plaintext);
        let s0 = self.encrypt_block(iv);
        let tag = mac
            .iter()
            .zip(s0.iter())
            .take(tag_len)
            .map(|(m, s)| m ^ s)
            .collect();
        let mut counter = *iv;
        increment_counter(&mut counter);
        (tag, counter)
    }

    /// Secure `body` in place according to `header.nls_method`
    ///
    /// Encrypts when the method provides confidentiality and appends the
    /// authentication tag. Returns the tag length. Unsecured headers leave
    /// the body untouched.
    pub fn secure(&self, header: &NpHeader, body: &mut Vec<u8>) -> usize {
        let Some(method) = header.security_method() else {
            return 0;
        };
        let payload_len = body.len();
        let tag_len = method.tag_len();

        match method {
            NlsMethod::AesCtr => {
                let iv = iv_block(header, payload_len);
                trace!(iv = %hex::encode(iv), "CTR initial counter block");
                self.apply_keystream(iv, body);
            }
            NlsMethod::AesCbcMac128 | NlsMethod::AesCbcMac64 | NlsMethod::AesCbcMac32 => {
                let first = header_block(header, payload_len);
                trace!(header = %hex::encode(first), "CBC-MAC header block");
                let mac = self.cbc_mac(&first, body);
                body.extend_from_slice(&mac[..tag_len]);
            }
            NlsMethod::AesCcm128 | NlsMethod::AesCcm64 | NlsMethod::AesCcm32 => {
                let iv = iv_block(header, payload_len);
                trace!(iv = %hex::encode(iv), "CCM initialization vector");
                let (tag, counter) = self.ccm_tag(&iv, body, tag_len);
                self.apply_keystream(counter, &mut body[..payload_len]);
                body.extend_from_slice(&tag);
            }
            NlsMethod::None => unreachable!("unsecured methods return early"),
        }

        tag_len
    }

    /// Verify and decrypt a secured body, returning the plaintext without tag
    ///
    /// Nothing is returned unless authentication succeeds.
    pub fn unsecure(&self, header: &NpHeader, secured: &[u8]) -> Result<Vec<u8>> {
        let Some(method) = header.security_method() else {
            return Ok(secured.to_vec());
        };
        let tag_len = method.tag_len();
        if secured.len() < tag_len {
            return Err(D7aError::InvalidPacketLength {
                expected: tag_len,
                received: secured.len(),
            });
        }
        let payload_len = secured.len() - tag_len;
        let (payload, tag) = secured.split_at(payload_len);
        if tag_len > 0 {
            trace!(tag = %hex::encode(tag), tag_len, "received authentication tag");
        }

        match method {
            NlsMethod::AesCtr => {
                let mut plaintext = payload.to_vec();
                self.apply_keystream(iv_block(header, payload_len), &mut plaintext);
                Ok(plaintext)
            }
            NlsMethod::AesCbcMac128 | NlsMethod::AesCbcMac64 | NlsMethod::AesCbcMac32 => {
                let mac = self.cbc_mac(&header_block(header, payload_len), payload);
                if !bool::from(mac[..tag_len].ct_eq(tag)) {
                    debug!(?method, "CBC-MAC: authentication mismatch");
                    return Err(D7aError::AuthenticationFailed);
                }
                Ok(payload.to_vec())
            }
            NlsMethod::AesCcm128 | NlsMethod::AesCcm64 | NlsMethod::AesCcm32 => {
                let iv = iv_block(header, payload_len);
                let mut counter = iv;
                increment_counter(&mut counter);
                let mut plaintext = payload.to_vec();
                self.apply_keystream(counter, &mut plaintext);

                let (expected, _) = self.ccm_tag(&iv, &plaintext, tag_len);
                if !bool::from(expected.as_slice().ct_eq(tag)) {
                    debug!(?method, "CCM: authentication mismatch");
                    return Err(D7aError::AuthenticationFailed);
                }
                Ok(plaintext)
            }
            NlsMethod::None => unreachable!("unsecured methods return early"),
        }
    }
}

impl std::fmt::Debug for SecurityEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEnvelope").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{Addressee, SecurityState};

    const KEY: [u8; KEY_LEN] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];

    fn header(method: NlsMethod) -> NpHeader {
        NpHeader {
            listen_timeout: 0x10,
            hop_enabled: false,
            origin: Addressee::uid(1, [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]),
            nls_method: Some(method),
            security: method
                .carries_counters()
                .then(|| SecurityState::new(42, 1)),
        }
    }

    #[test]
    fn test_aes_known_answer() {
        // FIPS-197 appendix C.1
        let envelope = SecurityEnvelope::new(&KEY);
        let plaintext: Block = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        assert_eq!(
            hex::encode(envelope.encrypt_block(&plaintext)),
            "69c4e0d86a7b0430d8cdb78070b4c55a"
        );
    }

    #[test]
    fn test_tag_lengths() {
        assert_eq!(NlsMethod::AesCtr.tag_len(), 0);
        assert_eq!(NlsMethod::AesCbcMac128.tag_len(), 16);
        assert_eq!(NlsMethod::AesCbcMac64.tag_len(), 8);
        assert_eq!(NlsMethod::AesCbcMac32.tag_len(), 4);
        assert_eq!(NlsMethod::AesCcm128.tag_len(), 16);
        assert_eq!(NlsMethod::AesCcm64.tag_len(), 8);
        assert_eq!(NlsMethod::AesCcm32.tag_len(), 4);
    }

    #[test]
    fn test_block_layouts() {
        let ccm = header(NlsMethod::AesCcm128);
        let iv = iv_block(&ccm, 20);
        assert_eq!(iv[0], 5);
        assert_eq!(iv[1], 1);
        assert_eq!(&iv[2..6], &[0, 0, 0, 42]);
        assert_eq!(&iv[6..14], &[0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]);
        assert_eq!(iv[14], ccm.control_byte());
        assert_eq!(iv[15], 20);

        let mut mac = header(NlsMethod::AesCbcMac64);
        mac.origin = Addressee::vid(1, [0xBE, 0xEF]);
        let block = header_block(&mac, 3);
        assert_eq!(block[0], 3);
        assert_eq!(block[1], 0x10);
        assert_eq!(&block[2..6], &[0; 4]);
        assert_eq!(&block[6..14], &[0xBE, 0xEF, 0, 0, 0, 0, 0, 0]);
        assert_eq!(block[15], 3);
    }

    #[test]
    fn test_every_method_roundtrips() {
        let envelope = SecurityEnvelope::new(&KEY);
        let plaintext: Vec<u8> = (0u8..37).collect();

        for method in NlsMethod::SECURED {
            let header = header(method);
            let mut body = plaintext.clone();
            let tag_len = envelope.secure(&header, &mut body);

            assert_eq!(tag_len, method.tag_len());
            assert_eq!(body.len(), plaintext.len() + tag_len);
            if method.is_mac_only() {
                assert_eq!(&body[..plaintext.len()], plaintext.as_slice());
            } else {
                assert_ne!(&body[..plaintext.len()], plaintext.as_slice());
            }
            assert_eq!(envelope.unsecure(&header, &body).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_corrupted_tag_rejected() {
        let envelope = SecurityEnvelope::new(&KEY);
        for method in [NlsMethod::AesCbcMac64, NlsMethod::AesCcm32, NlsMethod::AesCcm128] {
            let header = header(method);
            let mut body = b"sensor reading".to_vec();
            envelope.secure(&header, &mut body);

            let last = body.len() - 1;
            body[last] ^= 0x01;
            assert_eq!(
                envelope.unsecure(&header, &body),
                Err(D7aError::AuthenticationFailed)
            );
        }
    }

    #[test]
    fn test_ccm_binds_frame_counter() {
        let envelope = SecurityEnvelope::new(&KEY);
        let sent = header(NlsMethod::AesCcm64);
        let mut body = b"open valve".to_vec();
        envelope.secure(&sent, &mut body);

        let mut replayed = sent;
        replayed.security = Some(SecurityState::new(43, 1));
        assert_eq!(
            envelope.unsecure(&replayed, &body),
            Err(D7aError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_short_body_rejected() {
        let envelope = SecurityEnvelope::new(&KEY);
        let err = envelope
            .unsecure(&header(NlsMethod::AesCbcMac128), &[0u8; 8])
            .unwrap_err();
        assert!(matches!(err, D7aError::InvalidPacketLength { expected: 16, received: 8 }));
    }

    #[test]
    fn test_unsecured_header_passthrough() {
        let envelope = SecurityEnvelope::new(&KEY);
        let plain = header(NlsMethod::None);
        let mut body = vec![1, 2, 3];
        assert_eq!(envelope.secure(&plain, &mut body), 0);
        assert_eq!(body, vec![1, 2, 3]);
        assert_eq!(envelope.unsecure(&plain, &body).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_counter_increment_carries() {
        let mut block = [0u8; AES_BLOCK_SIZE];
        block[15] = 0xFF;
        block[14] = 0xFF;
        increment_counter(&mut block);
        assert_eq!(block[13], 1);
        assert_eq!(block[14], 0);
        assert_eq!(block[15], 0);
    }
}
