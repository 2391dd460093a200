//! Local file-based master-key provider for `CloakDB`.
//!
//! The master key is 96 raw bytes, stored base64-encoded in a single key
//! file. Data keys are wrapped with ChaCha20-Poly1305 under a wrap key
//! derived from the master key with HKDF-SHA256; the provider name is bound
//! as associated data, so a blob wrapped by this provider can only be
//! unwrapped by a `local` provider holding the same master key.
//!
//! Suitable for development and single-machine deployments; production
//! setups should prefer a cloud KMS provider.

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use cloakdb::error::ProviderError;
use cloakdb::provider::MasterKeyProvider;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of the raw local master key in bytes.
pub const MASTER_KEY_SIZE: usize = 96;

/// Provider name recorded on data keys wrapped by this provider.
pub const PROVIDER_NAME: &str = "local";

const WRAP_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const WRAP_INFO: &[u8] = b"cloakdb/dek-wrap/v1";

/// Master-key provider backed by a local key file.
pub struct FileMasterKey {
    wrap_key: SecretVec<u8>,
}

impl FileMasterKey {
    /// Loads the master key from a base64-encoded key file.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Io` if the file cannot be read and
    /// `ProviderError::InvalidMasterKey` if its contents are not a
    /// base64-encoded 96-byte key.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let encoded = fs::read_to_string(path)?;
        let master = BASE64.decode(encoded.trim()).map_err(|e| {
            ProviderError::InvalidMasterKey(format!("key file is not valid base64: {e}"))
        })?;
        Self::from_master_key(SecretVec::new(master))
    }

    /// Creates a provider from raw master-key material.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidMasterKey` if the material is not
    /// exactly [`MASTER_KEY_SIZE`] bytes.
    pub fn from_master_key(master: SecretVec<u8>) -> Result<Self, ProviderError> {
        let len = master.expose_secret().len();
        if len != MASTER_KEY_SIZE {
            return Err(ProviderError::InvalidMasterKey(format!(
                "master key must be {MASTER_KEY_SIZE} bytes, got {len}"
            )));
        }

        let hkdf = Hkdf::<Sha256>::new(None, master.expose_secret());
        let mut wrap_key = vec![0u8; WRAP_KEY_SIZE];
        hkdf.expand(WRAP_INFO, &mut wrap_key).map_err(|_| {
            ProviderError::InvalidMasterKey("wrap key derivation failed".to_string())
        })?;

        Ok(Self { wrap_key: SecretVec::new(wrap_key) })
    }

    /// Generates a fresh master key and writes it to `path`
    /// (base64-encoded, mode 0600 on unix). Refuses to overwrite.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidMasterKey` if the file already exists
    /// and `ProviderError::Io` on write failure.
    pub fn init(path: impl Into<PathBuf>) -> Result<(), ProviderError> {
        let path = path.into();
        if path.exists() {
            return Err(ProviderError::InvalidMasterKey(format!(
                "key file already exists: {}",
                path.display()
            )));
        }

        let mut master = Zeroizing::new(vec![0u8; MASTER_KEY_SIZE]);
        OsRng.fill_bytes(&mut master);
        fs::write(&path, BASE64.encode(&*master))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

impl MasterKeyProvider for FileMasterKey {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn wrap_data_key(&self, material: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let cipher = ChaCha20Poly1305::new_from_slice(self.wrap_key.expose_secret())
            .map_err(|e| ProviderError::WrapFailed(format!("invalid wrap key: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: material, aad: PROVIDER_NAME.as_bytes() })
            .map_err(|e| ProviderError::WrapFailed(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<SecretVec<u8>, ProviderError> {
        if wrapped.len() < NONCE_SIZE {
            return Err(ProviderError::UnwrapFailed("wrapped key too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);

        let cipher = ChaCha20Poly1305::new_from_slice(self.wrap_key.expose_secret())
            .map_err(|e| ProviderError::UnwrapFailed(format!("invalid wrap key: {e}")))?;
        let nonce_bytes: [u8; NONCE_SIZE] = nonce_bytes
            .try_into()
            .map_err(|_| ProviderError::UnwrapFailed("invalid nonce size".to_string()))?;
        let nonce = Nonce::from(nonce_bytes);

        let material = cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad: PROVIDER_NAME.as_bytes() })
            .map_err(|_| {
                ProviderError::UnwrapFailed(
                    "wrong master key, wrong provider, or corrupt blob".to_string(),
                )
            })?;

        Ok(SecretVec::new(material))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider_from_fresh_key(dir: &TempDir) -> FileMasterKey {
        let path = dir.path().join("master-key.txt");
        FileMasterKey::init(&path).expect("init should succeed");
        FileMasterKey::load(&path).expect("load should succeed")
    }

    #[test]
    fn test_provider_name() {
        let dir = TempDir::new().unwrap();
        let provider = provider_from_fresh_key(&dir);
        assert_eq!(provider.name(), "local");
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let dir = TempDir::new().unwrap();
        let provider = provider_from_fresh_key(&dir);

        let material = vec![7u8; 96];
        let wrapped = provider.wrap_data_key(&material).unwrap();
        assert_ne!(wrapped, material);

        let unwrapped = provider.unwrap_data_key(&wrapped).unwrap();
        assert_eq!(unwrapped.expose_secret(), &material);
    }

    #[test]
    fn test_wrap_is_randomized() {
        let dir = TempDir::new().unwrap();
        let provider = provider_from_fresh_key(&dir);

        let material = vec![7u8; 96];
        let a = provider.wrap_data_key(&material).unwrap();
        let b = provider.wrap_data_key(&material).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unwrap_with_different_master_key_fails() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let provider_a = provider_from_fresh_key(&dir_a);
        let provider_b = provider_from_fresh_key(&dir_b);

        let wrapped = provider_a.wrap_data_key(&[7u8; 96]).unwrap();
        let result = provider_b.unwrap_data_key(&wrapped);
        assert!(matches!(result, Err(ProviderError::UnwrapFailed(_))));
    }

    #[test]
    fn test_unwrap_tampered_blob_fails() {
        let dir = TempDir::new().unwrap();
        let provider = provider_from_fresh_key(&dir);

        let mut wrapped = provider.wrap_data_key(&[7u8; 96]).unwrap();
        if let Some(byte) = wrapped.last_mut() {
            *byte ^= 0xFF;
        }
        let result = provider.unwrap_data_key(&wrapped);
        assert!(matches!(result, Err(ProviderError::UnwrapFailed(_))));
    }

    #[test]
    fn test_unwrap_truncated_blob_fails() {
        let dir = TempDir::new().unwrap();
        let provider = provider_from_fresh_key(&dir);
        let result = provider.unwrap_data_key(&[1, 2, 3]);
        assert!(matches!(result, Err(ProviderError::UnwrapFailed(_))));
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master-key.txt");
        FileMasterKey::init(&path).unwrap();

        let result = FileMasterKey::init(&path);
        assert!(matches!(result, Err(ProviderError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = FileMasterKey::load(dir.path().join("missing.txt"));
        assert!(matches!(result, Err(ProviderError::Io(_))));
    }

    #[test]
    fn test_load_rejects_invalid_base64() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master-key.txt");
        fs::write(&path, "!!not base64!!").unwrap();

        let result = FileMasterKey::load(&path);
        assert!(matches!(result, Err(ProviderError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_rejects_wrong_key_length() {
        let result = FileMasterKey::from_master_key(SecretVec::new(vec![0u8; 32]));
        assert!(matches!(result, Err(ProviderError::InvalidMasterKey(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master-key.txt");
        FileMasterKey::init(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
