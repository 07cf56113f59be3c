//! orgsync - keep a local mirror of a GitHub organization's repositories
//!
//! A run lists the organization page by page and, for every repository,
//! either pulls it in place or clones it into the local root. The whole run is
//! bounded by a single deadline.
//!
//! ## Pipeline
//!
//! - [`lister`]: paginated listing published onto a bounded channel
//! - [`reconcile`]: decides update vs acquire and dispatches tasks concurrently
//! - [`git`]: runs git with a per-repository deadline
//! - [`sync`]: owns the run deadline and the exit status
//!
//! ## Modules
//!
//! - [`config`]: credential resolution and optional YAML settings
//! - [`github`]: GitHub API integration
//! - [`inventory`]: snapshot of what already exists locally

pub mod config;
pub mod git;
pub mod github;
pub mod inventory;
pub mod lister;
pub mod reconcile;
pub mod sync;

pub use config::{CredentialArgs, Credentials, RunLimits, Settings};
pub use git::{GitExecutor, SyncExecutor, SyncKind, SyncOutcome, SyncReport, SyncTask};
pub use github::{GitHubClient, ListError, RemoteRepo, RepoPage, RepoSource};
pub use inventory::LocalInventory;
pub use lister::{ListingOutcome, RemoteLister, RetryPolicy};
pub use reconcile::{PageReport, Reconciler};
pub use sync::{RunOutcome, RunSummary, SyncEngine};
