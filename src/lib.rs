//! confstore - A Git-backed versioned configuration store
//!
//! Projects hold repositories; a repository is a tree of JSON and text files
//! whose every change is a commit with a dense revision number. Reads at any
//! revision are cached, paths can be watched, and repositories can be stored
//! encrypted at rest.
//!
//! # Example
//!
//! ```no_run
//! use confstore::config::StoreConfig;
//! use confstore::project::ProjectManager;
//! use confstore::repository::{Change, CommitRequest, Query};
//! use confstore::storage::{Author, ProjectName, RepositoryName, Revision};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let projects = ProjectManager::open(&StoreConfig::new("./data"), None).await?;
//! let project = projects.create(ProjectName::new("shop")?, Author::system()).await?;
//! let repo = project
//!     .repositories()
//!     .create(RepositoryName::new("settings")?, Author::system(), None)
//!     .await?;
//!
//! let change = Change::upsert_json("/checkout.json", json!({"enabled": true}))?;
//! repo.commit(CommitRequest::new(Revision::HEAD, vec![change])).await?;
//!
//! let entry = repo.get(Revision::HEAD, &Query::identity("/checkout.json")?).await?;
//! println!("{:?}", entry.as_json());
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod encryption;
pub mod project;
pub mod repository;
pub mod storage;

pub use command::{Command, CommandError, CommandExecutor, CommandOutcome, StandaloneCommandExecutor};
pub use config::StoreConfig;
pub use project::{Project, ProjectError, ProjectManager, PurgeWorker, RepositoryManager};
pub use repository::{Repository, RepositoryError};
pub use storage::{Revision, RevisionRange};
