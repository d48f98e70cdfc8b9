pub mod cipher;
pub mod packet;

pub use cipher::{Aes256GcmRtpSize, VoiceCipher, VoiceSequencer};
pub use packet::{decode, encode, RtpHeader, VoicePacket};
