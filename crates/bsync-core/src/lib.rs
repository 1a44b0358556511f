//! bsync-core: collaborative sync of reverse-engineering artifacts.
//!
//! Each user publishes full snapshots of their artifacts (function headers,
//! stack variables, structs, enums, globals, comments, patches) to their own
//! branch `bsync/<user>` of a shared repository. Nobody writes to anyone
//! else's branch; a deterministic merge combines the branches into one
//! view on demand.
//!
//! - [`artifact`]: the artifact model and its total order.
//! - [`snapshot`] / [`codec`]: artifact sets and their on-disk format.
//! - [`transport`] / [`store`]: versioned per-user branches.
//! - [`merge`] / [`view`]: per-key merging and merged views.
//! - [`client`] / [`scheduler`]: pull/push sessions and background sync.
//!
//! # Conventions
//!
//! - **Errors**: library code returns [`error::Result`] with [`error::SyncError`];
//!   configuration loading uses `anyhow::Result`.
//! - **Logging**: `tracing` macros; the binary installs the subscriber.

pub mod adapter;
pub mod artifact;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod merge;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod view;

pub use client::{CancelToken, PullReport, PushReport, StatusReport, SyncClient};
pub use error::{ErrorCode, Result, SyncError};
pub use merge::{Outcome, Resolution, merge_sets};
pub use view::{MergedView, Scope};
