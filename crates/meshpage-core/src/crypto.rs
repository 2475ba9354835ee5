//! Channel encryption for Meshtastic packets.
//!
//! Meshtastic channels use AES in counter mode with a pre-shared key. The
//! 16-byte counter block is built from packet metadata:
//!
//!   nonce = LE64(packet_id) || LE64(sender_node_id)
//!
//! Sender-side firmware builds the nonce exactly this way. A different byte
//! order does not fail; it yields garbage plaintext. The layout here must
//! match the radios bit for bit.
//!
//! Key material is held in `Zeroizing` buffers and wiped on drop.

use aes::{Aes128, Aes256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use prost::Message;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::mesh::{Data, MeshPacket};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Well-known key behind the one-byte PSK shorthand (`AQ==` is index 1).
const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69,
    0x01,
];

// ── Key ───────────────────────────────────────────────────────────────────────

/// Pre-shared channel key. AES-128 or AES-256 depending on length.
///
/// Loaded once at startup and shared read-only across workers.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl ChannelKey {
    /// Build a key from raw bytes. Accepts 16 or 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        match bytes.len() {
            16 | 32 => Ok(Self {
                bytes: Zeroizing::new(bytes.to_vec()),
            }),
            n => Err(KeyError::InvalidLength(n)),
        }
    }

    /// Parse a base64 channel key as found in Meshtastic channel settings.
    ///
    /// URL-safe characters are normalised to the standard alphabet and
    /// missing `=` padding is restored before decoding. A single-byte key
    /// is the firmware's PSK shorthand: index 1 is the default key, index N
    /// bumps its last byte by N-1. Index 0 means "no encryption", which
    /// this relay cannot use.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let mut normalised: String = encoded
            .trim()
            .chars()
            .map(|c| match c {
                '-' => '+',
                '_' => '/',
                c => c,
            })
            .collect();
        while normalised.len() % 4 != 0 {
            normalised.push('=');
        }

        let raw = Zeroizing::new(
            STANDARD
                .decode(normalised.as_bytes())
                .map_err(|e| KeyError::InvalidBase64(e.to_string()))?,
        );

        match raw.as_slice() {
            [0] => Err(KeyError::Unencrypted),
            [index] => {
                let mut key = DEFAULT_PSK;
                key[15] = key[15].wrapping_add(index - 1);
                Self::from_bytes(&key)
            }
            bytes => Self::from_bytes(bytes),
        }
    }

    /// Key length in bytes (16 or 32).
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Apply the AES-CTR keystream in place. Encryption and decryption are
    /// the same operation.
    fn apply_keystream(&self, nonce: &[u8; 16], buf: &mut [u8]) -> Result<(), DecryptError> {
        match self.bytes.len() {
            16 => Aes128Ctr::new_from_slices(&self.bytes, nonce)
                .map_err(|e| DecryptError::CipherFailure(e.to_string()))?
                .try_apply_keystream(buf)
                .map_err(|e| DecryptError::CipherFailure(e.to_string())),
            32 => Aes256Ctr::new_from_slices(&self.bytes, nonce)
                .map_err(|e| DecryptError::CipherFailure(e.to_string()))?
                .try_apply_keystream(buf)
                .map_err(|e| DecryptError::CipherFailure(e.to_string())),
            n => Err(DecryptError::CipherFailure(format!(
                "unsupported key length {n}"
            ))),
        }
    }
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

// ── Nonce ─────────────────────────────────────────────────────────────────────

/// Build the 16-byte CTR nonce: LE64(packet_id) || LE64(sender).
pub fn packet_nonce(packet_id: u32, sender: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
    nonce[8..].copy_from_slice(&u64::from(sender).to_le_bytes());
    nonce
}

// ── Decrypt / encrypt ─────────────────────────────────────────────────────────

/// Decrypt a packet's encrypted body and parse it as a `Data` payload.
///
/// Pure: the packet is not modified. The caller decides what to do with
/// the decoded payload.
pub fn decrypt(packet: &MeshPacket, key: &ChannelKey) -> Result<Data, DecryptError> {
    let ciphertext = packet.encrypted().ok_or(DecryptError::MissingCiphertext)?;

    let nonce = packet_nonce(packet.id, packet.from);
    let mut plaintext = ciphertext.to_vec();
    key.apply_keystream(&nonce, &mut plaintext)?;

    Data::decode(plaintext.as_slice()).map_err(DecryptError::MalformedPlaintext)
}

/// Encrypt a plaintext body the way a radio would before transmission.
pub fn encrypt(
    packet_id: u32,
    sender: u32,
    plaintext: &[u8],
    key: &ChannelKey,
) -> Result<Vec<u8>, DecryptError> {
    let nonce = packet_nonce(packet_id, sender);
    let mut out = plaintext.to_vec();
    key.apply_keystream(&nonce, &mut out)?;
    Ok(out)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("channel key is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("channel key must be 16 or 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("channel key index 0 disables encryption")]
    Unencrypted,
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("packet carries no encrypted payload")]
    MissingCiphertext,
    #[error("cipher failure: {0}")]
    CipherFailure(String),
    #[error("decrypted bytes are not a valid Data payload: {0}")]
    MalformedPlaintext(prost::DecodeError),
}
