//! Link payload confidentiality and integrity.
//!
//! Payloads are XORed with an AES-128 keystream built from per-block counter blocks. The MIC is
//! the first four bytes of an AES-CMAC computed over a `B0` block, the encoded header and the
//! *encrypted* payload: senders encrypt then MAC, receivers verify then decrypt.
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use log::trace;

use super::frame::{LinkHeader, LinkPacket, HEADER_LENGTH};

pub const KEY_LENGTH: usize = 16;
const BLOCK_LENGTH: usize = 16;
/// Largest input accepted by the MIC computation (B0 excluded).
pub const MAX_AUTHENTICATED_LENGTH: usize = 256;

const KEYSTREAM_FLAG: u8 = 0x01;
const B0_FLAG: u8 = 0x49;
const B0_TRAILER: u8 = 0x0F;

/// Network key with its expanded AES schedule.
#[derive(Clone)]
pub struct LinkCipher {
    key: [u8; KEY_LENGTH],
    cipher: Aes128,
}

impl std::fmt::Debug for LinkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkCipher").finish_non_exhaustive()
    }
}

impl LinkCipher {
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            key: *key,
            cipher: Aes128::new(key.into()),
        }
    }

    /// XOR `payload` in place with the keystream of `header`. Applying it twice restores the
    /// input.
    pub fn apply_keystream(&self, header: &LinkHeader, payload: &mut [u8]) {
        let pan = header.pan_id.to_le_bytes();
        for (i, chunk) in payload.chunks_mut(BLOCK_LENGTH).enumerate() {
            let mut block = [0u8; BLOCK_LENGTH];
            block[0] = KEYSTREAM_FLAG;
            block[5] = pan[0];
            block[6] = pan[1];
            block[9] = header.dest;
            block[13] = header.source;
            block[15] = (i + 1) as u8;
            self.cipher.encrypt_block((&mut block).into());
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
    }

    /// MIC over `authenticated`, which must start with the encoded `header`.
    pub fn compute_mic(&self, header: &LinkHeader, authenticated: &[u8]) -> Result<u32, CryptoError> {
        if authenticated.len() > MAX_AUTHENTICATED_LENGTH {
            return Err(CryptoError::BufferSize {
                size: authenticated.len(),
            });
        }
        let pan = header.pan_id.to_le_bytes();
        let mut b0 = [0u8; BLOCK_LENGTH];
        b0[0] = B0_FLAG;
        b0[5] = (authenticated.len() & 0xFF) as u8;
        b0[6] = pan[0];
        b0[7] = pan[1];
        b0[10] = header.dest;
        b0[14] = header.source;
        b0[15] = B0_TRAILER;

        let mut mac = <Cmac<Aes128> as KeyInit>::new((&self.key).into());
        mac.update(&b0);
        mac.update(authenticated);
        let tag = mac.finalize().into_bytes();
        Ok(u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]))
    }

    /// Encrypt `plaintext` and seal it into a packet carrying its MIC.
    pub fn seal(&self, header: LinkHeader, plaintext: &[u8]) -> Result<LinkPacket, CryptoError> {
        if HEADER_LENGTH + plaintext.len() > MAX_AUTHENTICATED_LENGTH {
            return Err(CryptoError::BufferSize {
                size: HEADER_LENGTH + plaintext.len(),
            });
        }
        let mut packet = LinkPacket {
            header,
            payload: plaintext.to_vec(),
            mic: 0,
        };
        self.apply_keystream(&packet.header, &mut packet.payload);
        packet.mic = self.compute_mic(&packet.header, &packet.authenticated_bytes())?;
        Ok(packet)
    }

    /// Check the MIC of a received packet and return its plaintext. Nothing is decrypted when
    /// verification fails.
    pub fn open(&self, packet: &LinkPacket) -> Result<Vec<u8>, CryptoError> {
        let expected = self.compute_mic(&packet.header, &packet.authenticated_bytes())?;
        if expected != packet.mic {
            trace!("MIC mismatch (got: {:#010x}, expected: {:#010x})", packet.mic, expected);
            return Err(CryptoError::MicMismatch);
        }
        let mut plaintext = packet.payload.clone();
        self.apply_keystream(&packet.header, &mut plaintext);
        Ok(plaintext)
    }
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum CryptoError {
    #[error("Message integrity code mismatch.")]
    MicMismatch,

    #[error("Authenticated data is too long (is: {}B, max: {}B)!", .size, MAX_AUTHENTICATED_LENGTH)]
    BufferSize { size: usize },
}
