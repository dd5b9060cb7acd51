//! Converges `Credential` custom resources into one shared configuration
//! object per namespace.
//!
//! Every live credential contributes a single entry to a well-known
//! config map (the "aggregate"), serialized as a YAML document under one
//! data key. The reconciler keeps the entry set identical to the set of
//! live credentials: the first credential creates the aggregate, updates
//! replace their entry in place, deletions prune it, and removing the
//! last entry deletes the aggregate itself. Each contributor also holds
//! an ownership marker on the aggregate, coupling its lifecycle to all
//! of its sources rather than to a single controller.
//!
//! The crate is a library: bring a `kube_client::Client`, pick
//! [`Settings`], and drive [`run`] from the embedding process.

pub mod api;
pub mod config;
pub use config::Settings;
pub mod document;
pub mod index;
pub mod owners;
pub mod reconciler;
pub use reconciler::{reconcile, Context, Error, ReconcileKey};
mod runner;
pub use runner::run;
