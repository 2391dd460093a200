//! AWS KMS master-key provider for `CloakDB`.
//!
//! Data keys are wrapped and unwrapped through KMS Encrypt/Decrypt under a
//! caller-supplied key, so plaintext master-key material never enters the
//! process. The provider owns a current-thread tokio runtime and blocks on
//! the SDK futures, keeping the synchronous [`MasterKeyProvider`] seam.
//!
//! # Example
//!
//! ```rust,no_run
//! use cloakdb_kms_aws::AwsKmsMasterKey;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = AwsKmsMasterKey::new(
//!     "arn:aws:kms:us-east-1:123456789012:key/12345678-1234-1234-1234-123456789012",
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! The provider uses the AWS SDK's default credential chain:
//! - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY)
//! - AWS credentials file (~/.aws/credentials)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use aws_sdk_kms::{primitives::Blob, Client as KmsClient};
use cloakdb::error::ProviderError;
use cloakdb::provider::MasterKeyProvider;
use secrecy::SecretVec;
use thiserror::Error;
use tokio::runtime::Runtime;

/// Provider name recorded on data keys wrapped by this provider.
pub const PROVIDER_NAME: &str = "aws";

/// Errors specific to AWS KMS provider construction.
#[derive(Debug, Error)]
pub enum AwsKmsError {
    /// Invalid key ID, ARN, or alias
    #[error("invalid KMS key id: {0}")]
    InvalidKeyId(String),

    /// Runtime initialization failed
    #[error("runtime initialization failed: {0}")]
    Runtime(String),
}

impl From<AwsKmsError> for ProviderError {
    fn from(err: AwsKmsError) -> Self {
        match err {
            AwsKmsError::InvalidKeyId(msg) => Self::InvalidMasterKey(msg),
            AwsKmsError::Runtime(msg) => Self::Unreachable(msg),
        }
    }
}

/// Master-key provider backed by AWS KMS.
pub struct AwsKmsMasterKey {
    client: KmsClient,
    key_id: String,
    runtime: Runtime,
}

impl AwsKmsMasterKey {
    /// Creates a provider wrapping under the given KMS key (ID, ARN, or
    /// alias, e.g. `alias/cloakdb-master`), using the SDK's default
    /// credential and region resolution.
    ///
    /// # Errors
    ///
    /// Returns `AwsKmsError` if the key id is empty or the runtime cannot
    /// be initialized.
    pub fn new(key_id: impl Into<String>) -> Result<Self, AwsKmsError> {
        let key_id = key_id.into();
        if key_id.is_empty() {
            return Err(AwsKmsError::InvalidKeyId("key id must not be empty".to_string()));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AwsKmsError::Runtime(e.to_string()))?;
        let config = runtime.block_on(aws_config::load_from_env());

        Ok(Self { client: KmsClient::new(&config), key_id, runtime })
    }

    /// Returns the configured KMS key locator.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl MasterKeyProvider for AwsKmsMasterKey {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn wrap_data_key(&self, material: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .runtime
            .block_on(
                self.client
                    .encrypt()
                    .key_id(&self.key_id)
                    .plaintext(Blob::new(material.to_vec()))
                    .send(),
            )
            .map_err(|e| ProviderError::WrapFailed(format!("KMS encrypt failed: {e}")))?;

        let ciphertext_blob = response
            .ciphertext_blob()
            .ok_or_else(|| ProviderError::WrapFailed("no ciphertext returned".to_string()))?;
        Ok(ciphertext_blob.as_ref().to_vec())
    }

    fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<SecretVec<u8>, ProviderError> {
        let response = self
            .runtime
            .block_on(
                self.client
                    .decrypt()
                    .key_id(&self.key_id)
                    .ciphertext_blob(Blob::new(wrapped.to_vec()))
                    .send(),
            )
            .map_err(|e| ProviderError::UnwrapFailed(format!("KMS decrypt failed: {e}")))?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| ProviderError::UnwrapFailed("no plaintext returned".to_string()))?;
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_key_id() {
        let result = AwsKmsMasterKey::new("");
        assert!(matches!(result, Err(AwsKmsError::InvalidKeyId(_))));
    }

    #[test]
    fn test_provider_name_and_key_id() {
        let provider =
            AwsKmsMasterKey::new("arn:aws:kms:us-east-1:123456789012:key/test").unwrap();
        assert_eq!(provider.name(), "aws");
        assert_eq!(provider.key_id(), "arn:aws:kms:us-east-1:123456789012:key/test");
    }

    #[test]
    fn test_error_conversion() {
        let err: ProviderError = AwsKmsError::InvalidKeyId("empty".to_string()).into();
        assert!(matches!(err, ProviderError::InvalidMasterKey(_)));
    }
}
