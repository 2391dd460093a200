//! Field-level ciphertext codec.
//!
//! A governed field value is serialized to JSON bytes and encrypted either
//! with ChaCha20-Poly1305 (randomized, fresh nonce per write) or
//! AES-256-SIV (deterministic, equality-queryable). The result is framed as
//!
//! ```text
//! [version:1][algorithm:1][key_id:16][body]
//! ```
//!
//! where body is `nonce || ciphertext` for randomized and the SIV ciphertext
//! for deterministic. In documents the frame travels base64-encoded inside a
//! `{"$ciphertext": "..."}` carrier object. The associated data binds
//! `namespace|field_path`, so ciphertext moved to another field or
//! collection fails authentication.

use aes_siv::Aes256SivAead;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::datakey::DataKeyId;
use crate::error::Error;
use crate::provider::DATA_KEY_MATERIAL_SIZE;
use crate::schema::Algorithm;
use crate::store::Namespace;

/// Ciphertext format version.
pub(crate) const FORMAT_VERSION: u8 = 1;

/// Carrier key marking an encrypted value inside a document.
pub(crate) const CIPHERTEXT_KEY: &str = "$ciphertext";

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// Split of the 96-byte data-key material.
const AEAD_KEY_LEN: usize = 32;

const ALGORITHM_RANDOMIZED: u8 = 0;
const ALGORITHM_DETERMINISTIC: u8 = 1;

/// Unwrapped data-key material, split into the two cipher keys.
pub(crate) struct DekMaterial {
    material: SecretVec<u8>,
}

impl DekMaterial {
    /// Wraps unwrapped material, validating its length.
    pub(crate) fn new(material: SecretVec<u8>) -> Result<Self, Error> {
        let len = material.expose_secret().len();
        if len != DATA_KEY_MATERIAL_SIZE {
            return Err(Error::EncryptionConfig(format!(
                "data key material must be {DATA_KEY_MATERIAL_SIZE} bytes, got {len}"
            )));
        }
        Ok(Self { material })
    }

    fn aead_key(&self) -> &[u8] {
        &self.material.expose_secret()[..AEAD_KEY_LEN]
    }

    fn siv_key(&self) -> &[u8] {
        &self.material.expose_secret()[AEAD_KEY_LEN..]
    }
}

impl Clone for DekMaterial {
    fn clone(&self) -> Self {
        Self { material: SecretVec::new(self.material.expose_secret().clone()) }
    }
}

/// Parsed ciphertext frame.
pub(crate) struct Frame {
    pub(crate) algorithm: Algorithm,
    pub(crate) key_id: DataKeyId,
    pub(crate) body: Vec<u8>,
}

impl Frame {
    fn to_bytes(&self) -> Vec<u8> {
        let algorithm = match self.algorithm {
            Algorithm::Randomized => ALGORITHM_RANDOMIZED,
            Algorithm::Deterministic => ALGORITHM_DETERMINISTIC,
        };
        let mut bytes = Vec::with_capacity(2 + 16 + self.body.len());
        bytes.push(FORMAT_VERSION);
        bytes.push(algorithm);
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 2 + 16 {
            return Err(Error::Decryption("ciphertext frame truncated".to_string()));
        }

        let version = data[0];
        if version != FORMAT_VERSION {
            return Err(Error::Decryption(format!(
                "unsupported ciphertext version: {version} (supported: {FORMAT_VERSION})"
            )));
        }

        let algorithm = match data[1] {
            ALGORITHM_RANDOMIZED => Algorithm::Randomized,
            ALGORITHM_DETERMINISTIC => Algorithm::Deterministic,
            other => {
                return Err(Error::Decryption(format!("unknown algorithm tag: {other}")))
            }
        };

        let mut key_id = [0u8; 16];
        key_id.copy_from_slice(&data[2..18]);

        Ok(Self { algorithm, key_id: DataKeyId::from_bytes(key_id), body: data[18..].to_vec() })
    }
}

/// Associated data binding a ciphertext to its collection and field.
pub(crate) fn field_aad(namespace: &Namespace, path: &str) -> String {
    format!("{namespace}|{path}")
}

/// Returns the base64 frame when `value` is a ciphertext carrier.
pub(crate) fn as_carrier(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(CIPHERTEXT_KEY)?.as_str()
}

/// Decodes a carrier payload into a frame.
pub(crate) fn decode_carrier(encoded: &str) -> Result<Frame, Error> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::Decryption(format!("invalid ciphertext encoding: {e}")))?;
    Frame::from_bytes(&bytes)
}

/// Encrypts a field value into its carrier form.
pub(crate) fn encrypt_value(
    dek: &DekMaterial,
    key_id: DataKeyId,
    algorithm: Algorithm,
    aad: &str,
    value: &Value,
) -> Result<Value, Error> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(value)
            .map_err(|e| Error::EncryptionConfig(format!("value serialization failed: {e}")))?,
    );

    let body = match algorithm {
        Algorithm::Randomized => {
            let cipher = ChaCha20Poly1305::new_from_slice(dek.aead_key())
                .map_err(|e| Error::EncryptionConfig(format!("invalid data key: {e}")))?;

            let mut nonce_bytes = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce_bytes);
            let nonce = Nonce::from(nonce_bytes);

            let ciphertext = cipher
                .encrypt(&nonce, Payload { msg: &plaintext, aad: aad.as_bytes() })
                .map_err(|e| Error::EncryptionConfig(format!("encryption failed: {e}")))?;

            let mut body = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
            body.extend_from_slice(&nonce_bytes);
            body.extend_from_slice(&ciphertext);
            body
        }
        Algorithm::Deterministic => {
            let cipher = Aes256SivAead::new_from_slice(dek.siv_key())
                .map_err(|e| Error::EncryptionConfig(format!("invalid data key: {e}")))?;

            // AES-SIV is deterministic, empty nonce
            cipher
                .encrypt(&Default::default(), Payload { msg: &plaintext, aad: aad.as_bytes() })
                .map_err(|e| Error::EncryptionConfig(format!("encryption failed: {e}")))?
        }
    };

    let frame = Frame { algorithm, key_id, body };
    let mut carrier = serde_json::Map::new();
    carrier.insert(CIPHERTEXT_KEY.to_string(), Value::String(BASE64.encode(frame.to_bytes())));
    Ok(Value::Object(carrier))
}

/// Decrypts a parsed frame back into the original field value.
pub(crate) fn decrypt_frame(dek: &DekMaterial, frame: &Frame, aad: &str) -> Result<Value, Error> {
    let plaintext = match frame.algorithm {
        Algorithm::Randomized => {
            if frame.body.len() < NONCE_SIZE {
                return Err(Error::Decryption("ciphertext too short".to_string()));
            }
            let (nonce_bytes, ciphertext) = frame.body.split_at(NONCE_SIZE);

            let cipher = ChaCha20Poly1305::new_from_slice(dek.aead_key())
                .map_err(|e| Error::Decryption(format!("invalid data key: {e}")))?;
            let nonce_bytes: [u8; NONCE_SIZE] = nonce_bytes
                .try_into()
                .map_err(|_| Error::Decryption("invalid nonce size".to_string()))?;
            let nonce = Nonce::from(nonce_bytes);

            cipher
                .decrypt(&nonce, Payload { msg: ciphertext, aad: aad.as_bytes() })
                .map_err(|_| {
                    Error::Decryption(
                        "authentication failed: ciphertext may be corrupted or moved".to_string(),
                    )
                })?
        }
        Algorithm::Deterministic => {
            let cipher = Aes256SivAead::new_from_slice(dek.siv_key())
                .map_err(|e| Error::Decryption(format!("invalid data key: {e}")))?;

            cipher
                .decrypt(&Default::default(), Payload { msg: &frame.body, aad: aad.as_bytes() })
                .map_err(|_| {
                    Error::Decryption(
                        "authentication failed: ciphertext may be corrupted or moved".to_string(),
                    )
                })?
        }
    };
    let plaintext = Zeroizing::new(plaintext);

    serde_json::from_slice(&plaintext)
        .map_err(|e| Error::Decryption(format!("decrypted value is not valid JSON: {e}")))
}
