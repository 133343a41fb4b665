//! stillmind-core - Core library for StillMind
//!
//! This crate contains the entry model, the local store, connectivity
//! tracking, the authenticated remote client and the sync engine shared by
//! every StillMind client.

pub mod auth;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use auth::AuthSession;
pub use config::ClientConfig;
pub use connectivity::ConnectivityMonitor;
pub use db::{open_local_store, LocalStore};
pub use error::{Error, Result};
pub use models::{Entry, EntryId, SyncStatus};
pub use remote::{HttpEntryService, RemoteEntryService};
pub use state::{SyncIndicator, SyncState};
pub use sync::{SyncEngine, SyncOutcome, SyncReport, SyncScheduler};
