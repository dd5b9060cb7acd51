use std::collections::BTreeMap;

use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single externally-defined secret or configuration entry.
///
/// The spec carries a small fixed schema plus an open
/// `additionalProperties` payload whose values may be scalars, lists or
/// nested maps; the payload is passed through to the aggregate document
/// without further validation.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "ci.estafette.io",
    version = "v1",
    kind = "Credential",
    namespaced,
    status = "CredentialStatus",
    crates(kube_core = "::kube_core")
)]
pub struct CredentialSpec {
    #[serde(rename = "type")]
    pub credential_type: String,
    /// Pattern over pipeline identifiers allowed to use this credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelisted_pipelines: Option<String>,
    /// Pattern over trusted image identifiers allowed to use this credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelisted_trusted_images: Option<String>,
    /// Schema-free payload flattened into the credential's aggregate entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_properties: BTreeMap<String, serde_json::Value>,
}

/// Written by the reconciler once the credential is reflected in an
/// aggregate object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    /// Name of the config map currently holding this credential's entry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_map: String,
}
