//! Key management service capability.

use async_trait::async_trait;

use crate::encryption::cipher::Dek;
use crate::encryption::error::KmsError;

/// An external service that wraps and unwraps data encryption keys.
///
/// Failures are surfaced to the caller; nothing here retries.
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Wrap a plaintext DEK, returning the bytes to persist.
    async fn wrap_dek(&self, dek: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Unwrap a persisted WDEK back into the plaintext DEK.
    async fn unwrap_wdek(&self, wdek: &[u8]) -> Result<Vec<u8>, KmsError>;
}

/// A key management service backed by a master key held in process memory.
///
/// Suitable for standalone deployments where no external KMS is available.
#[derive(Debug)]
pub struct LocalKeyManagementService {
    master: Dek,
}

impl LocalKeyManagementService {
    pub fn new(master: Dek) -> Self {
        Self { master }
    }

    /// Creates a service with a randomly generated master key.
    pub fn generate() -> Self {
        Self::new(Dek::generate())
    }
}

#[async_trait]
impl KeyManagementService for LocalKeyManagementService {
    async fn wrap_dek(&self, dek: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.master.seal(dek).map_err(|e| KmsError::Wrap(e.to_string()))
    }

    async fn unwrap_wdek(&self, wdek: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.master.open(wdek).map_err(|e| KmsError::Unwrap(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wrap_then_unwrap() {
        let kms = LocalKeyManagementService::generate();
        let dek = Dek::generate();
        let wdek = kms.wrap_dek(dek.as_bytes()).await.unwrap();
        assert_ne!(&wdek[..], &dek.as_bytes()[..]);
        let unwrapped = kms.unwrap_wdek(&wdek).await.unwrap();
        assert_eq!(&unwrapped[..], &dek.as_bytes()[..]);
    }

    #[tokio::test]
    async fn unwrap_with_other_master_fails() {
        let wdek = LocalKeyManagementService::generate()
            .wrap_dek(Dek::generate().as_bytes())
            .await
            .unwrap();
        let result = LocalKeyManagementService::generate().unwrap_wdek(&wdek).await;
        assert!(matches!(result, Err(KmsError::Unwrap(_))));
    }
}
