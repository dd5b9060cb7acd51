//! Custom resource schemas for the `ci.estafette.io/v1` API group.
//!
//! Only [`Credential`] is reconciled; [`TrustedImage`] is carried as a
//! schema for consumers that read it from the cluster.

pub mod credential;
pub use credential::{Credential, CredentialSpec, CredentialStatus};
pub mod trusted_image;
pub use trusted_image::{TrustedImage, TrustedImageSpec};

/// API group of the custom resources.
pub const GROUP: &str = "ci.estafette.io";
/// Served version of the custom resources.
pub const VERSION: &str = "v1";
