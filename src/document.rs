//! Codec for the aggregate credentials document.
//!
//! The aggregate config map stores all live credentials of a namespace as
//! a single YAML document under one data key:
//!
//! ```yaml
//! credentials:
//! - name: cred1
//!   type: container-registry
//!   whitelistedPipelines: github.com/estafette/.+
//!   repository: estafette
//! ```
//!
//! Entries are unique by `name`, which doubles as the key for upserts and
//! prunes. Encoding is deterministic: a decode of an encoded document
//! yields the same entries in the same order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::api::Credential;

/// The ordered list of credential entries held by an aggregate object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialsDocument {
    pub credentials: Vec<CredentialEntry>,
}

/// One credential's contribution to the document.
///
/// The open payload of the source resource is flattened into the entry,
/// so arbitrary scalar, list and nested-map values survive a round trip
/// without the codec knowing their schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelisted_pipelines: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelisted_trusted_images: Option<String>,
    #[serde(flatten)]
    pub additional_properties: BTreeMap<String, serde_json::Value>,
}

impl CredentialEntry {
    /// The entry a credential resource should contribute, keyed by the
    /// resource's name.
    pub fn for_credential(credential: &Credential) -> Self {
        Self {
            name: credential
                .metadata
                .name
                .clone()
                .unwrap_or_default(),
            credential_type: credential.spec.credential_type.clone(),
            whitelisted_pipelines: credential.spec.whitelisted_pipelines.clone(),
            whitelisted_trusted_images: credential.spec.whitelisted_trusted_images.clone(),
            additional_properties: credential.spec.additional_properties.clone(),
        }
    }
}

impl CredentialsDocument {
    /// Parses the serialized document. Malformed content or a missing
    /// `credentials` key is a hard error for the reconcile attempt.
    pub fn decode(raw: &str) -> Result<Self, DocumentError> {
        serde_yaml::from_str(raw).map_err(DocumentError::Decode)
    }

    /// Serializes the document back to its textual form.
    pub fn encode(&self) -> Result<String, DocumentError> {
        serde_yaml::to_string(self).map_err(DocumentError::Encode)
    }

    pub fn entry(&self, name: &str) -> Option<&CredentialEntry> {
        self.credentials.iter().find(|entry| entry.name == name)
    }

    /// Replaces the entry with the same name in place, preserving its
    /// position; appends when no entry matches.
    pub fn upsert(&mut self, entry: CredentialEntry) {
        match self
            .credentials
            .iter_mut()
            .find(|existing| existing.name == entry.name)
        {
            Some(existing) => *existing = entry,
            None => self.credentials.push(entry),
        }
    }

    /// Removes the entry with the given name, keeping the order of the
    /// remaining entries. Returns whether anything was removed.
    pub fn prune(&mut self, name: &str) -> bool {
        match self.credentials.iter().position(|entry| entry.name == name) {
            Some(position) => {
                self.credentials.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// Raised when the aggregate document cannot be read or written.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed credentials document: {0}")]
    Decode(#[source] serde_yaml::Error),
    #[error("failed to serialize credentials document: {0}")]
    Encode(#[source] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(name: &str) -> CredentialEntry {
        CredentialEntry {
            name: name.to_string(),
            credential_type: "container-registry".to_string(),
            whitelisted_pipelines: None,
            whitelisted_trusted_images: None,
            additional_properties: BTreeMap::new(),
        }
    }

    fn registry_entry() -> CredentialEntry {
        CredentialEntry {
            name: "cred1".to_string(),
            credential_type: "container-registry".to_string(),
            whitelisted_pipelines: Some("github.com/estafette/.+".to_string()),
            whitelisted_trusted_images: None,
            additional_properties: BTreeMap::from([
                ("repository".to_string(), json!("estafette")),
                ("private".to_string(), json!(false)),
                ("username".to_string(), json!("estafettesvc")),
                ("password".to_string(), json!("supersecretpassword")),
            ]),
        }
    }

    #[test]
    fn round_trip_preserves_entries_and_order() {
        let document = CredentialsDocument {
            credentials: vec![registry_entry(), entry("cred2")],
        };

        let encoded = document.encode().unwrap();
        let decoded = CredentialsDocument::decode(&encoded).unwrap();

        assert_eq!(decoded, document);
    }

    #[test]
    fn round_trip_preserves_nested_payload() {
        let mut gke = entry("gke");
        gke.credential_type = "kubernetes-engine".to_string();
        gke.whitelisted_trusted_images = Some("extensions/gke".to_string());
        gke.additional_properties = BTreeMap::from([
            ("project".to_string(), json!("estafette-project")),
            ("cluster".to_string(), json!("estafette-cluster")),
            ("defaults".to_string(), json!({"namespace": "estafette-ns"})),
        ]);
        let document = CredentialsDocument {
            credentials: vec![gke],
        };

        let decoded = CredentialsDocument::decode(&document.encode().unwrap()).unwrap();

        assert_eq!(decoded, document);
    }

    #[test]
    fn encode_flattens_payload_and_omits_unset_fields() {
        let document = CredentialsDocument {
            credentials: vec![registry_entry()],
        };

        let encoded = document.encode().unwrap();

        assert!(encoded.contains("name: cred1"));
        assert!(encoded.contains("type: container-registry"));
        assert!(encoded.contains("whitelistedPipelines: github.com/estafette/.+"));
        assert!(encoded.contains("password: supersecretpassword"));
        assert!(encoded.contains("private: false"));
        assert!(!encoded.contains("whitelistedTrustedImages"));
        assert!(!encoded.contains("additionalProperties"));
    }

    #[test]
    fn decode_without_credentials_key_fails() {
        assert!(CredentialsDocument::decode("other: value\n").is_err());
        assert!(CredentialsDocument::decode("not valid: [yaml").is_err());
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut document = CredentialsDocument {
            credentials: vec![entry("a"), entry("b"), entry("c")],
        };

        let mut replacement = entry("b");
        replacement.credential_type = "kubernetes-engine".to_string();
        document.upsert(replacement);

        let names: Vec<_> = document
            .credentials
            .iter()
            .map(|entry| entry.name.as_str())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(
            document.entry("b").unwrap().credential_type,
            "kubernetes-engine"
        );
    }

    #[test]
    fn upsert_appends_new_entries() {
        let mut document = CredentialsDocument {
            credentials: vec![entry("a")],
        };

        document.upsert(entry("b"));

        assert_eq!(document.credentials.len(), 2);
        assert_eq!(document.credentials[1].name, "b");
    }

    #[test]
    fn prune_removes_only_the_named_entry() {
        let mut document = CredentialsDocument {
            credentials: vec![entry("a"), entry("b"), entry("c")],
        };

        assert!(document.prune("b"));
        assert!(!document.prune("b"));

        let names: Vec<_> = document
            .credentials
            .iter()
            .map(|entry| entry.name.as_str())
            .collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn pruning_the_last_entry_empties_the_document() {
        let mut document = CredentialsDocument {
            credentials: vec![entry("only")],
        };

        assert!(document.prune("only"));
        assert!(document.is_empty());
    }
}
