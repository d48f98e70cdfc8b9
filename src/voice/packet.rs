//! RTP framing for outbound and inbound voice datagrams.
//!
//! Wire format:
//! ```text
//! [flags:1][payload_type:1][sequence:2][timestamp:4][ssrc:4]
//! [extension preamble:4, only when flags & 0x10]
//! [payload:N][tag:16][nonce:4]
//! ```
//! All multi-byte integers are big-endian. The payload is already encrypted;
//! this module never touches key material.

use crate::error::CodecError;

/// RTP version 2, no padding, no CSRCs.
pub const RTP_VERSION_FLAGS: u8 = 0x80;
pub const EXTENSION_FLAG: u8 = 0x10;
const PADDING_FLAG: u8 = 0x20;
const CSRC_COUNT_MASK: u8 = 0x0F;
pub const OPUS_PAYLOAD_TYPE: u8 = 0x78;
/// Profile id of one-byte RTP header extensions (RFC 8285).
pub const ONE_BYTE_EXTENSION_PROFILE: u16 = 0xBEDE;

pub const HEADER_SIZE: usize = 12;
pub const EXTENSION_PREAMBLE_SIZE: usize = 4;
pub const TAG_SIZE: usize = 16;
pub const NONCE_SUFFIX_SIZE: usize = 4;
/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// The 4-byte extension preamble. The extension body itself (`length` 32-bit
/// words) travels encrypted at the start of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionPreamble {
    pub profile: u16,
    pub length: u16,
}

impl ExtensionPreamble {
    pub fn body_len(&self) -> usize {
        self.length as usize * 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub extension: Option<ExtensionPreamble>,
}

impl RtpHeader {
    pub fn opus(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            payload_type: OPUS_PAYLOAD_TYPE,
            sequence,
            timestamp,
            ssrc,
            extension: None,
        }
    }

    /// Length of the unencrypted header, including the extension preamble.
    pub fn size(&self) -> usize {
        match self.extension {
            Some(_) => HEADER_SIZE + EXTENSION_PREAMBLE_SIZE,
            None => HEADER_SIZE,
        }
    }

    fn flags(&self) -> u8 {
        match self.extension {
            Some(_) => RTP_VERSION_FLAGS | EXTENSION_FLAG,
            None => RTP_VERSION_FLAGS,
        }
    }

    /// Serializes the header. These bytes double as the AEAD associated data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.write_to(&mut buf);
        buf
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.flags());
        buf.push(self.payload_type);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        if let Some(ext) = self.extension {
            buf.extend_from_slice(&ext.profile.to_be_bytes());
            buf.extend_from_slice(&ext.length.to_be_bytes());
        }
    }
}

/// One framed voice datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub header: RtpHeader,
    /// Encrypted audio (and encrypted extension body, if any).
    pub payload: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
    /// Per-packet AEAD counter appended after the tag.
    pub nonce: u32,
}

impl VoicePacket {
    pub fn encoded_len(&self) -> usize {
        self.header.size() + self.payload.len() + TAG_SIZE + NONCE_SUFFIX_SIZE
    }
}

/// Frames `packet` into the exact datagram bytes.
///
/// # Errors
///
/// Returns [`CodecError::MalformedInput`] if the frame would not fit in a
/// single datagram.
pub fn encode(packet: &VoicePacket) -> Result<Vec<u8>, CodecError> {
    let total = packet.encoded_len();
    if total > MAX_DATAGRAM_SIZE {
        return Err(CodecError::MalformedInput(format!(
            "frame of {total} bytes exceeds datagram limit of {MAX_DATAGRAM_SIZE}"
        )));
    }

    let mut buf = Vec::with_capacity(total);
    packet.header.write_to(&mut buf);
    buf.extend_from_slice(&packet.payload);
    buf.extend_from_slice(&packet.tag);
    buf.extend_from_slice(&packet.nonce.to_be_bytes());
    Ok(buf)
}

/// Parses a received datagram without decrypting it.
///
/// # Errors
///
/// - [`CodecError::TruncatedFrame`] if the fixed header is incomplete.
/// - [`CodecError::LengthMismatch`] if the trailer or the declared extension
///   body does not fit in the remaining bytes.
/// - [`CodecError::MalformedInput`] for a version other than 2, or for
///   padding or CSRC entries, which voice frames never carry.
pub fn decode(bytes: &[u8]) -> Result<VoicePacket, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::TruncatedFrame {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let flags = bytes[0];
    if flags >> 6 != 2 {
        return Err(CodecError::MalformedInput(format!(
            "unsupported RTP version {}",
            flags >> 6
        )));
    }
    if flags & (PADDING_FLAG | CSRC_COUNT_MASK) != 0 {
        return Err(CodecError::MalformedInput(format!(
            "unsupported RTP flags {flags:#04x} (padding or CSRCs)"
        )));
    }

    let payload_type = bytes[1];
    let sequence = u16::from_be_bytes([bytes[2], bytes[3]]);
    let timestamp = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let ssrc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

    let mut offset = HEADER_SIZE;
    let extension = if flags & EXTENSION_FLAG != 0 {
        let needed = HEADER_SIZE + EXTENSION_PREAMBLE_SIZE;
        if bytes.len() < needed {
            return Err(CodecError::TruncatedFrame {
                needed,
                available: bytes.len(),
            });
        }
        offset = needed;
        Some(ExtensionPreamble {
            profile: u16::from_be_bytes([bytes[12], bytes[13]]),
            length: u16::from_be_bytes([bytes[14], bytes[15]]),
        })
    } else {
        None
    };

    let remaining = bytes.len() - offset;
    let trailer = TAG_SIZE + NONCE_SUFFIX_SIZE;
    let declared = trailer + extension.map(|e| e.body_len()).unwrap_or(0);
    if remaining < declared {
        return Err(CodecError::LengthMismatch {
            declared,
            available: remaining,
        });
    }

    let payload_end = bytes.len() - trailer;
    let payload = bytes[offset..payload_end].to_vec();
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&bytes[payload_end..payload_end + TAG_SIZE]);
    let n = &bytes[payload_end + TAG_SIZE..];
    let nonce = u32::from_be_bytes([n[0], n[1], n[2], n[3]]);

    Ok(VoicePacket {
        header: RtpHeader {
            payload_type,
            sequence,
            timestamp,
            ssrc,
            extension,
        },
        payload,
        tag,
        nonce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VoicePacket {
        VoicePacket {
            header: RtpHeader::opus(0x1234, 0xDEADBEEF, 42),
            payload: vec![1, 2, 3, 4, 5],
            tag: [0xAA; TAG_SIZE],
            nonce: 7,
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(bytes.len(), 12 + 5 + 16 + 4);
        assert_eq!(&bytes[..12], &[0x80, 0x78, 0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 42]);
        assert_eq!(&bytes[12..17], &[1, 2, 3, 4, 5]);
        assert_eq!(&bytes[17..33], &[0xAA; 16]);
        assert_eq!(&bytes[33..], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_round_trip_with_extension() {
        let mut packet = sample();
        packet.header.extension = Some(ExtensionPreamble {
            profile: ONE_BYTE_EXTENSION_PROFILE,
            length: 1,
        });
        let bytes = encode(&packet).unwrap();
        assert_eq!(bytes[0], 0x90);
        assert_eq!(&bytes[12..16], &[0xBE, 0xDE, 0x00, 0x01]);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let mut packet = sample();
        packet.payload.clear();
        let bytes = encode(&packet).unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_every_short_prefix_is_truncated() {
        let bytes = encode(&sample()).unwrap();
        for len in 0..HEADER_SIZE {
            assert_eq!(
                decode(&bytes[..len]),
                Err(CodecError::TruncatedFrame {
                    needed: HEADER_SIZE,
                    available: len
                })
            );
        }
    }

    #[test]
    fn test_missing_trailer_is_length_mismatch() {
        let bytes = encode(&sample()).unwrap();
        let err = decode(&bytes[..HEADER_SIZE + 10]).unwrap_err();
        assert_eq!(
            err,
            CodecError::LengthMismatch {
                declared: 20,
                available: 10
            }
        );
    }

    #[test]
    fn test_extension_body_longer_than_frame() {
        let mut packet = sample();
        packet.payload.clear();
        packet.header.extension = Some(ExtensionPreamble {
            profile: ONE_BYTE_EXTENSION_PROFILE,
            length: 4,
        });
        let bytes = encode(&packet).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::LengthMismatch { declared: 36, available: 20 })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut packet = sample();
        packet.payload = vec![0; MAX_DATAGRAM_SIZE];
        assert!(matches!(encode(&packet), Err(CodecError::MalformedInput(_))));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = 0x40;
        assert!(matches!(decode(&bytes), Err(CodecError::MalformedInput(_))));
    }

    #[test]
    fn test_padding_and_csrcs_rejected() {
        for flags in [0xA0, 0x81, 0x8F, 0xB0, 0x92] {
            let mut bytes = encode(&sample()).unwrap();
            bytes[0] = flags;
            assert!(
                matches!(decode(&bytes), Err(CodecError::MalformedInput(_))),
                "flags {flags:#04x} accepted"
            );
        }
    }

    #[test]
    fn test_marker_bit_survives() {
        let mut packet = sample();
        packet.header.payload_type = 0x80 | OPUS_PAYLOAD_TYPE;
        let bytes = encode(&packet).unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_sweep() {
        let headers = [(0, 0, 0), (1, 960, 1), (u16::MAX, u32::MAX, u32::MAX), (0x8000, 0x8000_0000, 0xFFFF_0000)];
        for (sequence, timestamp, ssrc) in headers {
            for len in 0..=96usize {
                for with_extension in [false, true] {
                    let mut header = RtpHeader::opus(sequence, timestamp, ssrc);
                    if with_extension {
                        header.extension = Some(ExtensionPreamble {
                            profile: ONE_BYTE_EXTENSION_PROFILE,
                            length: (len / 4) as u16,
                        });
                    }
                    let packet = VoicePacket {
                        header,
                        payload: (0..len).map(|i| i as u8).collect(),
                        tag: [len as u8; TAG_SIZE],
                        nonce: timestamp ^ len as u32,
                    };
                    let bytes = encode(&packet).unwrap();
                    assert_eq!(bytes.len(), packet.encoded_len());
                    assert_eq!(decode(&bytes).unwrap(), packet, "len {len}, ext {with_extension}");
                }
            }
        }
    }

    #[test]
    fn test_datagram_limit_edge() {
        for header in [
            RtpHeader::opus(u16::MAX, u32::MAX, u32::MAX),
            RtpHeader {
                extension: Some(ExtensionPreamble {
                    profile: ONE_BYTE_EXTENSION_PROFILE,
                    length: 0,
                }),
                ..RtpHeader::opus(u16::MAX, u32::MAX, u32::MAX)
            },
        ] {
            let fits = MAX_DATAGRAM_SIZE - header.size() - TAG_SIZE - NONCE_SUFFIX_SIZE;
            let mut packet = VoicePacket {
                header,
                payload: vec![0x5A; fits],
                tag: [0xFF; TAG_SIZE],
                nonce: u32::MAX,
            };
            let bytes = encode(&packet).unwrap();
            assert_eq!(bytes.len(), MAX_DATAGRAM_SIZE);
            assert_eq!(decode(&bytes).unwrap(), packet);

            packet.payload.push(0);
            assert!(matches!(encode(&packet), Err(CodecError::MalformedInput(_))));
        }
    }
}
