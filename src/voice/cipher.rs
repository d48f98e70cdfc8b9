use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use super::packet::{RtpHeader, VoicePacket, TAG_SIZE};
use crate::error::CipherError;

/// Samples per 20 ms Opus frame at 48 kHz.
pub const OPUS_FRAME_SAMPLES: u32 = 960;
/// Opus frame that decodes to silence. Sent a few times after speaking stops.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Encryption capability negotiated with the voice server.
pub trait VoiceCipher: Send + Sync {
    /// Mode name as it appears in the voice server's `select_protocol`.
    fn mode(&self) -> &'static str;

    fn seal(&self, header: RtpHeader, nonce: u32, audio: &[u8]) -> Result<VoicePacket, CipherError>;

    fn open(&self, packet: &VoicePacket) -> Result<Vec<u8>, CipherError>;
}

/// `aead_aes256_gcm_rtpsize`: the unencrypted header is the associated data
/// and the 4-byte counter, zero-padded to 12 bytes, is the nonce.
pub struct Aes256GcmRtpSize {
    cipher: Aes256Gcm,
}

impl Aes256GcmRtpSize {
    pub const MODE: &'static str = "aead_aes256_gcm_rtpsize";

    pub fn new(secret_key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret_key)),
        }
    }

    fn full_nonce(nonce: u32) -> [u8; 12] {
        let mut full = [0u8; 12];
        full[..4].copy_from_slice(&nonce.to_be_bytes());
        full
    }
}

impl std::fmt::Debug for Aes256GcmRtpSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes256GcmRtpSize").finish_non_exhaustive()
    }
}

impl VoiceCipher for Aes256GcmRtpSize {
    fn mode(&self) -> &'static str {
        Self::MODE
    }

    fn seal(&self, header: RtpHeader, nonce: u32, audio: &[u8]) -> Result<VoicePacket, CipherError> {
        let aad = header.to_bytes();
        let full = Self::full_nonce(nonce);
        let mut sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&full), Payload { msg: audio, aad: &aad })
            .map_err(|_| CipherError::EncryptionFailed)?;

        let split = sealed.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&sealed[split..]);
        sealed.truncate(split);

        Ok(VoicePacket {
            header,
            payload: sealed,
            tag,
            nonce,
        })
    }

    fn open(&self, packet: &VoicePacket) -> Result<Vec<u8>, CipherError> {
        let aad = packet.header.to_bytes();
        let full = Self::full_nonce(packet.nonce);
        let mut msg = Vec::with_capacity(packet.payload.len() + TAG_SIZE);
        msg.extend_from_slice(&packet.payload);
        msg.extend_from_slice(&packet.tag);

        self.cipher
            .decrypt(Nonce::from_slice(&full), Payload { msg: &msg, aad: &aad })
            .map_err(|_| CipherError::DecryptionFailed)
    }
}

/// Per-stream counters for outbound audio. The codec itself is stateless;
/// callers keep one of these per SSRC.
#[derive(Debug, Clone)]
pub struct VoiceSequencer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    nonce: u32,
}

impl VoiceSequencer {
    pub fn new(ssrc: u32) -> Self {
        Self::starting_at(ssrc, rand::random(), rand::random())
    }

    pub fn starting_at(ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence,
            timestamp,
            nonce: 0,
        }
    }

    /// Encrypts and frames one Opus frame, then advances the counters.
    pub fn next_datagram(
        &mut self,
        cipher: &dyn VoiceCipher,
        opus: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let header = RtpHeader::opus(self.sequence, self.timestamp, self.ssrc);
        let packet = cipher.seal(header, self.nonce, opus)?;
        let bytes = super::packet::encode(&packet)?;

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(OPUS_FRAME_SAMPLES);
        self.nonce = self.nonce.wrapping_add(1);
        Ok(bytes)
    }
}
