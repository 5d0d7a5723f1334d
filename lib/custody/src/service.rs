//! Key custody service
//!
//! Generates and stores key pairs with the private half wrapped by the
//! [`KeyCipher`], and signs with a stored key after unwrapping it in memory.

use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::cipher::KeyCipher;
use crate::error::CustodyError;
use crate::model::Key;
use crate::repository::KeyRepository;
use crate::signing::{self, KeyAlgorithm, KeyType};

#[derive(Clone)]
pub struct KeyService {
    cipher: Arc<dyn KeyCipher>,
    repository: Arc<dyn KeyRepository>,
}

/// Run device or CPU-bound crypto work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, CustodyError>
where
    F: FnOnce() -> Result<T, CustodyError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CustodyError::Internal(format!("Blocking task failed: {}", e)))?
}

impl KeyService {
    pub fn new(cipher: Arc<dyn KeyCipher>, repository: Arc<dyn KeyRepository>) -> Self {
        Self { cipher, repository }
    }

    pub async fn find(&self, id: &str) -> Result<Key, CustodyError> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| CustodyError::KeyNotFound(id.to_string()))
    }

    /// Generate and store an ECDSA P-256 key.
    pub async fn generate(&self) -> Result<Key, CustodyError> {
        self.generate_with(KeyAlgorithm::Ecdsa).await
    }

    /// Generate and store an RSA-2048 key.
    pub async fn generate_rsa(&self) -> Result<Key, CustodyError> {
        self.generate_with(KeyAlgorithm::RSA_2048).await
    }

    pub async fn generate_with(&self, algorithm: KeyAlgorithm) -> Result<Key, CustodyError> {
        let pair = blocking(move || algorithm.generate()).await?;
        self.store(&pair.public_key_pem, &pair.private_key_pem, pair.key_type)
            .await
    }

    /// Wrap `private_key_pem`, persist a new record and return it as stored.
    pub async fn store(
        &self,
        public_key_pem: &str,
        private_key_pem: &str,
        key_type: KeyType,
    ) -> Result<Key, CustodyError> {
        let cipher = self.cipher.clone();
        let plaintext = Zeroizing::new(private_key_pem.as_bytes().to_vec());
        let encrypted = blocking(move || cipher.encrypt(&plaintext)).await?;

        let key = Key::new(public_key_pem.to_string(), encrypted, key_type);
        self.repository.create(&key).await?;
        info!(id = %key.id, key_type = %key_type, "Stored key");

        self.find(&key.id).await
    }

    /// Sign `message` with the stored key `id`, returning a hex signature.
    ///
    /// The private key is always unwrapped before the stored type is checked.
    pub async fn sign(&self, id: &str, message: &[u8]) -> Result<String, CustodyError> {
        let key = self.find(id).await?;
        let cipher = self.cipher.clone();
        let message = message.to_vec();

        let signature = blocking(move || {
            let private_key = cipher.decrypt(&key.private_key_encrypted)?;
            signing::sign(&key.key_type, &private_key, &message)
        })
        .await?;

        debug!(id = %id, "Signed message");
        Ok(signature)
    }

    pub async fn delete(&self, id: &str) -> Result<(), CustodyError> {
        if !self.repository.soft_delete(id).await? {
            return Err(CustodyError::KeyNotFound(id.to_string()));
        }
        info!(id = %id, "Deleted key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::ChunkedCipher;
    use crate::repository::MemoryKeyRepository;
    use crate::session::SessionManager;
    use crate::session::tests::{MockDevice, RecordingClock};
    use crate::signing::tests::{rsa_pair, verify_ecdsa, verify_rsa};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls through to a real chunked cipher.
    struct CountingCipher {
        inner: ChunkedCipher<Arc<MockDevice>>,
        decrypts: AtomicUsize,
    }

    impl KeyCipher for CountingCipher {
        fn encrypt(&self, plaintext: &[u8]) -> Result<String, CustodyError> {
            self.inner.encrypt(plaintext)
        }

        fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<Vec<u8>>, CustodyError> {
            self.decrypts.fetch_add(1, Ordering::SeqCst);
            self.inner.decrypt(ciphertext)
        }
    }

    struct FailingCipher;

    impl KeyCipher for FailingCipher {
        fn encrypt(&self, _plaintext: &[u8]) -> Result<String, CustodyError> {
            Err(CustodyError::Cryptography("CKR_DEVICE_ERROR".into()))
        }

        fn decrypt(&self, _ciphertext: &str) -> Result<Zeroizing<Vec<u8>>, CustodyError> {
            Err(CustodyError::Cryptography("CKR_DEVICE_ERROR".into()))
        }
    }

    struct FailingRepository;

    #[async_trait]
    impl KeyRepository for FailingRepository {
        async fn create(&self, _key: &Key) -> Result<(), CustodyError> {
            Err(CustodyError::Storage("connection refused".into()))
        }

        async fn get(&self, _id: &str) -> Result<Option<Key>, CustodyError> {
            Err(CustodyError::Storage("connection refused".into()))
        }

        async fn soft_delete(&self, _id: &str) -> Result<bool, CustodyError> {
            Err(CustodyError::Storage("connection refused".into()))
        }
    }

    fn counting_cipher() -> Arc<CountingCipher> {
        let sessions = SessionManager::connect(MockDevice::new(), 0, "1234")
            .unwrap()
            .with_clock(Arc::new(RecordingClock::default()));
        Arc::new(CountingCipher {
            inner: ChunkedCipher::new(Arc::new(sessions)),
            decrypts: AtomicUsize::new(0),
        })
    }

    fn service() -> (KeyService, Arc<CountingCipher>, Arc<MemoryKeyRepository>) {
        let cipher = counting_cipher();
        let repository = Arc::new(MemoryKeyRepository::new());
        let service = KeyService::new(cipher.clone(), repository.clone());
        (service, cipher, repository)
    }

    #[tokio::test]
    async fn test_store_wraps_private_key() {
        let (service, cipher, _) = service();
        let pair = KeyAlgorithm::Ecdsa.generate().unwrap();

        let key = service
            .store(&pair.public_key_pem, &pair.private_key_pem, KeyType::Ecdsa)
            .await
            .unwrap();

        assert_eq!(key.public_key, pair.public_key_pem);
        assert_eq!(key.key_type, "ECDSA");
        assert_ne!(key.private_key_encrypted, *pair.private_key_pem);
        assert!(!key.private_key_encrypted.contains("PRIVATE KEY"));

        let decrypted = cipher.decrypt(&key.private_key_encrypted).unwrap();
        assert_eq!(decrypted.as_slice(), pair.private_key_pem.as_bytes());
    }

    #[tokio::test]
    async fn test_generated_ecdsa_key_signs() {
        let (service, _, _) = service();
        let key = service.generate().await.unwrap();
        assert_eq!(key.key_type, "ECDSA");

        let signature = service.sign(&key.id, b"hello world").await.unwrap();

        assert!(verify_ecdsa(&key.public_key, b"hello world", &signature));
    }

    #[tokio::test]
    async fn test_stored_rsa_key_signs() {
        let (service, _, _) = service();
        let pair = rsa_pair();
        let key = service
            .store(&pair.public_key_pem, &pair.private_key_pem, KeyType::Rsa)
            .await
            .unwrap();

        let signature = service.sign(&key.id, b"hello world").await.unwrap();

        assert!(verify_rsa(&key.public_key, b"hello world", &signature));
    }

    #[tokio::test]
    async fn test_unknown_type_decrypts_once_then_fails() {
        let (service, cipher, repository) = service();
        let pair = KeyAlgorithm::Ecdsa.generate().unwrap();
        let encrypted = cipher.encrypt(pair.private_key_pem.as_bytes()).unwrap();
        let mut key = Key::new(pair.public_key_pem.clone(), encrypted, KeyType::Ecdsa);
        key.key_type = "Ed25519".into();
        repository.create(&key).await.unwrap();

        let err = service.sign(&key.id, b"hello").await.unwrap_err();

        assert!(matches!(err, CustodyError::UnsupportedAlgorithm(_)));
        assert_eq!(cipher.decrypts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_find_missing_is_key_not_found() {
        let (service, _, _) = service();
        let err = service.find("does-not-exist").await.unwrap_err();
        assert!(matches!(err, CustodyError::KeyNotFound(ref id) if id == "does-not-exist"));

        let err = service.sign("does-not-exist", b"m").await.unwrap_err();
        assert!(matches!(err, CustodyError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_storage_fault_is_not_key_not_found() {
        let service = KeyService::new(counting_cipher(), Arc::new(FailingRepository));

        let err = service.find("any").await.unwrap_err();
        assert!(matches!(err, CustodyError::Storage(_)));

        let err = service.generate().await.unwrap_err();
        assert!(matches!(err, CustodyError::Storage(_)));
    }

    #[tokio::test]
    async fn test_cipher_failure_is_surfaced() {
        let service = KeyService::new(
            Arc::new(FailingCipher),
            Arc::new(MemoryKeyRepository::new()),
        );

        let err = service
            .store("pub", "priv", KeyType::Ecdsa)
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::Cryptography(_)));
    }

    #[tokio::test]
    async fn test_generated_keys_are_distinct() {
        let (service, _, _) = service();

        let first = service.generate().await.unwrap();
        let second = service.generate().await.unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.public_key, second.public_key);
        assert_ne!(first.private_key_encrypted, second.private_key_encrypted);
    }

    #[tokio::test]
    async fn test_delete_hides_key() {
        let (service, _, _) = service();
        let key = service.generate().await.unwrap();

        service.delete(&key.id).await.unwrap();

        assert!(matches!(
            service.find(&key.id).await.unwrap_err(),
            CustodyError::KeyNotFound(_)
        ));
        assert!(matches!(
            service.delete(&key.id).await.unwrap_err(),
            CustodyError::KeyNotFound(_)
        ));
    }
}
