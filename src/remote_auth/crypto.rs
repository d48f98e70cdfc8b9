//! Key material for a pairing attempt.
//!
//! The client holds an X25519 key for receiving sealed data and an Ed25519
//! key for proving possession when exchanging the ticket. Neither secret is
//! ever serialized.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use data_encoding::{BASE64, BASE64URL_NOPAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::PairingError;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
const SEAL_LABEL: &[u8] = b"paicord remote-auth sealed box v1";

pub struct PairingKeys {
    agreement: StaticSecret,
    signing: SigningKey,
}

impl PairingKeys {
    pub fn generate() -> Self {
        Self::from_secret_bytes(rand::random(), rand::random())
    }

    /// Restores keys from raw secrets. Used for fixtures; real sessions call
    /// [`PairingKeys::generate`].
    pub fn from_secret_bytes(agreement: [u8; KEY_SIZE], signing: [u8; KEY_SIZE]) -> Self {
        Self {
            agreement: StaticSecret::from(agreement),
            signing: SigningKey::from_bytes(&signing),
        }
    }

    pub fn public_identity(&self) -> PublicIdentity {
        PublicIdentity {
            agreement: PublicKey::from(&self.agreement).to_bytes(),
            verifying: self.signing.verifying_key().to_bytes(),
        }
    }

    /// Opens a [`seal`]ed box addressed to these keys.
    pub fn open_sealed(&self, sealed: &[u8]) -> Result<Vec<u8>, PairingError> {
        if sealed.len() < KEY_SIZE + NONCE_SIZE {
            return Err(PairingError::DecryptionFailed(format!(
                "sealed box of {} bytes is too short",
                sealed.len()
            )));
        }
        let (ephemeral, rest) = sealed.split_at(KEY_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        let mut ephemeral_bytes = [0u8; KEY_SIZE];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let ephemeral = PublicKey::from(ephemeral_bytes);
        let shared = self.agreement.diffie_hellman(&ephemeral);
        let recipient = PublicKey::from(&self.agreement);
        let kek = seal_key(shared.as_bytes(), ephemeral.as_bytes(), recipient.as_bytes());

        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek))
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: ephemeral.as_bytes() })
            .map_err(|_| PairingError::DecryptionFailed("sealed box authentication failed".into()))
    }

    /// Signs `message`, encoded as unpadded base64url.
    pub fn prove(&self, message: &[u8]) -> String {
        BASE64URL_NOPAD.encode(&self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for PairingKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingKeys")
            .field("public", &self.public_identity())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// The public half of [`PairingKeys`], as sent in `init`.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    agreement: [u8; KEY_SIZE],
    verifying: [u8; KEY_SIZE],
}

impl PublicIdentity {
    pub fn to_bytes(&self) -> [u8; 2 * KEY_SIZE] {
        let mut out = [0u8; 2 * KEY_SIZE];
        out[..KEY_SIZE].copy_from_slice(&self.agreement);
        out[KEY_SIZE..].copy_from_slice(&self.verifying);
        out
    }

    pub fn encode(&self) -> String {
        BASE64.encode(&self.to_bytes())
    }

    pub fn decode(encoded: &str) -> Result<Self, PairingError> {
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| PairingError::ProtocolViolation(format!("bad public key encoding: {e}")))?;
        if bytes.len() != 2 * KEY_SIZE {
            return Err(PairingError::ProtocolViolation(format!(
                "public key is {} bytes, expected {}",
                bytes.len(),
                2 * KEY_SIZE
            )));
        }
        let mut agreement = [0u8; KEY_SIZE];
        let mut verifying = [0u8; KEY_SIZE];
        agreement.copy_from_slice(&bytes[..KEY_SIZE]);
        verifying.copy_from_slice(&bytes[KEY_SIZE..]);
        Ok(Self {
            agreement,
            verifying,
        })
    }

    /// Unpadded base64url of SHA-256 over the public key bytes. This is what
    /// the QR code carries.
    pub fn fingerprint(&self) -> String {
        BASE64URL_NOPAD.encode(&Sha256::digest(self.to_bytes()))
    }

    pub fn verify(&self, message: &[u8], proof: &str) -> bool {
        let Ok(sig) = BASE64URL_NOPAD.decode(proof.as_bytes()) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig) else {
            return false;
        };
        VerifyingKey::from_bytes(&self.verifying)
            .map(|key| key.verify(message, &sig).is_ok())
            .unwrap_or(false)
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", self.fingerprint())
    }
}

/// Seals `plaintext` to `recipient`. This is the companion device's side of
/// the exchange; the client only ever opens.
pub fn seal(
    recipient: &PublicIdentity,
    ephemeral_secret: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, PairingError> {
    let ephemeral = StaticSecret::from(ephemeral_secret);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.agreement));
    let kek = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), &recipient.agreement);

    let ciphertext = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek))
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ephemeral_public.as_bytes() })
        .map_err(|_| PairingError::ProtocolViolation("sealing failed".into()))?;

    let mut out = Vec::with_capacity(KEY_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn seal_key(shared: &[u8; KEY_SIZE], ephemeral: &[u8; KEY_SIZE], recipient: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_LABEL);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}

/// Symmetric key the companion device establishes for this pairing. Opens
/// the user preview and the final token, nothing else.
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PairingError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            PairingError::DecryptionFailed(format!("session key is {} bytes, expected {KEY_SIZE}", bytes.len()))
        })?;
        Ok(Self(key))
    }

    /// Opens `nonce | ciphertext+tag`.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, PairingError> {
        if sealed.len() < NONCE_SIZE {
            return Err(PairingError::DecryptionFailed("payload shorter than its nonce".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PairingError::DecryptionFailed("payload authentication failed".into()))
    }

    pub fn seal(&self, nonce: [u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, PairingError> {
        let ciphertext = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| PairingError::ProtocolViolation("sealing failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Decodes a standard base64 field from the signaling channel.
pub fn decode_field(field: &str, value: &str) -> Result<Vec<u8>, PairingError> {
    BASE64
        .decode(value.as_bytes())
        .map_err(|e| PairingError::DecryptionFailed(format!("{field} is not valid base64: {e}")))
}
