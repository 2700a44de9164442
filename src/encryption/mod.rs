//! At-rest encryption for repositories.
//!
//! Every encrypted repository has its own data-encryption key (DEK). Only the
//! wrapped form (WDEK) produced by the key management service is persisted.
//! All encrypted repositories share one key-value database with two
//! partitions:
//!
//! ```text
//!  metadata:  project/repo/{objs|refs|rev2sha}/<suffix>  ->  nonce [|| type tag]
//!  data:      encrypt(dek, nonce, logical key)           ->  nonce' || ciphertext
//! ```
//!
//! The metadata partition is keyed by the plaintext logical key so that a
//! repository's records can be enumerated and deleted with a prefix scan,
//! while the physical keys stay opaque without the DEK.

mod cipher;
mod error;
mod keys;
mod kms;
mod manager;

pub use cipher::{Dek, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{EncryptionStorageError, EncryptionStorageResult, KmsError};
pub use keys::{KeyKind, RepositoryKeys};
pub use kms::{KeyManagementService, LocalKeyManagementService};
pub use manager::{EncryptionStorageManager, StoredValue, WriteBatch};
