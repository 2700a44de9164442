//! storage layer for confstore
//!
//! this module owns everything that is durably written for one repository:
//! the commit graph in one of two backends and the revision index next to
//! it. The repository layer uses this API and never touches git2 or the
//! encrypted store directly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Repository                         │
//! │      (commit, get, find, history, diff, watch)           │
//! └──────────────────────────────────────────────────────────┘
//!               │                                  │
//!               ▼                                  ▼
//!   ┌───────────────────────┐          ┌──────────────────────┐
//!   │  tree / blob / commit │          │    CommitIdIndex     │
//!   │   (logical objects)   │          │  (revision -> id)    │
//!   └───────────────────────┘          └──────────────────────┘
//!               │                                  │
//!               ▼                                  ▼
//!   ┌─────────────────────────────────────────────────────────┐
//!   │            Backend::Git  |  Backend::Encrypted          │
//!   └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Write order is fixed: objects, then the branch ref, then the index. A
//! crash can leave the index behind the branch but never ahead of it.

pub mod backend;
mod blob;
mod commit;
mod error;
mod index;
mod refs;
mod revision;
mod tree;
mod types;

// Re-export public API
pub use backend::{is_encrypted, Backend, ENCRYPTION_MARKER, MAIN_REF};
pub use blob::{bytes_to_json, bytes_to_text, json_to_bytes, sanitize_text};
pub use commit::{create_initial_commit, history, Commit, CommitBuilder, CommitRecord, HistoryIterator};
pub use error::{StorageError, StorageResult};
pub use index::{CommitIdIndex, INDEX_FILE_NAME};
pub use revision::{Revision, RevisionRange};
pub use tree::{diff_trees, flatten, TreeChange, TreeMutator};
pub use types::{
    Author, BlobId, CommitId, InvalidNameError, Markup, ObjectKind, ProjectName, RepositoryName, TreeEntry,
    TreeId,
};

pub(crate) use types::{PURGED_SUFFIX, REMOVED_SUFFIX};
