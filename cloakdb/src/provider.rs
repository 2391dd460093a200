//! Master-key provider abstraction.
//!
//! A provider wraps and unwraps data-key material under a master key it
//! controls (a local raw key, or a key held by a cloud KMS). The provider
//! name is recorded on every data key it creates; a data key can only be
//! unwrapped by a provider reporting the same name.

use crate::error::ProviderError;
use secrecy::SecretVec;

/// Size of the data-key material handled by providers, in bytes.
///
/// Bytes `0..32` key the randomized AEAD cipher, bytes `32..96` key the
/// deterministic cipher.
pub const DATA_KEY_MATERIAL_SIZE: usize = 96;

/// Wraps and unwraps data-key material under a master key.
///
/// Implementations must be thread-safe (`Send + Sync`) so one provider can
/// back a data-key manager and any number of client handles.
///
/// # Example
///
/// ```rust,ignore
/// use cloakdb::provider::MasterKeyProvider;
///
/// struct MyProvider;
///
/// impl MasterKeyProvider for MyProvider {
///     fn name(&self) -> &str {
///         "my-kms"
///     }
///     // ... wrap_data_key / unwrap_data_key
/// }
/// ```
pub trait MasterKeyProvider: Send + Sync {
    /// Returns the stable provider name (`"local"`, `"aws"`, ...).
    ///
    /// The name recorded when a data key is created must match the name of
    /// the provider used to unwrap it later; implementations should treat a
    /// mismatch as an unwrap failure.
    fn name(&self) -> &str;

    /// Wraps (encrypts) plaintext data-key material under the master key.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::WrapFailed` if wrapping fails, or
    /// `ProviderError::Unreachable` if the provider backend is unavailable.
    fn wrap_data_key(&self, material: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Unwraps (decrypts) data-key material previously wrapped by this
    /// provider.
    ///
    /// # Returns
    ///
    /// The plaintext material in a `SecretVec` for memory safety.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::UnwrapFailed` if the blob was wrapped under a
    /// different master key or provider name, or is corrupt.
    fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<SecretVec<u8>, ProviderError>;
}
