use std::collections::BTreeSet;

use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A container image granted elevated capabilities in CI jobs.
///
/// Schema only; nothing in this crate reconciles it.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "ci.estafette.io",
    version = "v1",
    kind = "TrustedImage",
    namespaced,
    crates(kube_core = "::kube_core")
)]
pub struct TrustedImageSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub image_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelisted_pipelines: Option<String>,
    pub path: String,
    #[serde(default)]
    pub run_privileged: bool,
    #[serde(default)]
    pub run_docker: bool,
    #[serde(default)]
    pub allow_commands: bool,
    /// Credential types injected into jobs running this image.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub injected_credential_types: BTreeSet<String>,
}
