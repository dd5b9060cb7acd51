//! Convergence of credentials into the per-namespace aggregate object.
//!
//! Each reconcile takes a (namespace, name) key and makes the aggregate
//! config map reflect the live credential set: create on first
//! credential, upsert on change, prune on deletion, delete the aggregate
//! with the last entry. All writes carry the version read at the start of
//! the attempt; a conflicting write triggers a bounded retry that
//! recomputes the full entry set from the authoritative list of live
//! credentials instead of patching incrementally, so two credentials
//! racing on the shared object both end up in the final document.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube_client::{Api, Client};
use kube_core::params::{DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube_core::Resource;

use crate::api::Credential;
use crate::config::Settings;
use crate::document::{CredentialEntry, CredentialsDocument, DocumentError};
use crate::index::CredentialIndex;
use crate::owners;

/// Identifies the credential a reconcile request refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        Self {
            namespace: resource.meta().namespace.clone().unwrap_or_default(),
            name: resource.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// State shared by every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub settings: Settings,
    pub index: Arc<CredentialIndex>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("api request failed: {0}")]
    Api(#[from] kube_client::Error),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("config map {config_map} has no {key} entry")]
    MissingDocument { config_map: String, key: String },
    #[error("{count} credential-owned config maps in namespace {namespace}, expected at most one")]
    AmbiguousAggregate { namespace: String, count: usize },
    #[error("write conflicts on config map {config_map} persisted through {attempts} attempts")]
    Conflicted { config_map: String, attempts: u32 },
}

enum Outcome {
    Created(String),
    Merged(String),
    /// Entry and marker removed; `None` when the aggregate went with them.
    Pruned(Option<String>),
    Unchanged(Option<String>),
    Resynced(Option<String>),
}

impl Outcome {
    /// Name of the aggregate now holding this credential's entry, if any.
    fn aggregate(&self) -> Option<&str> {
        match self {
            Outcome::Created(name) | Outcome::Merged(name) => Some(name),
            Outcome::Pruned(_) => None,
            Outcome::Unchanged(name) | Outcome::Resynced(name) => name.as_deref(),
        }
    }
}

/// Converges the aggregate state for one credential key.
///
/// A missing credential is a deletion signal, not an error. The
/// credential's status only ever advances after the aggregate write has
/// fully succeeded.
pub async fn reconcile(context: &Context, key: &ReconcileKey) -> Result<(), Error> {
    let credentials: Api<Credential> = Api::namespaced(context.client.clone(), &key.namespace);
    let config_maps: Api<ConfigMap> = Api::namespaced(context.client.clone(), &key.namespace);

    let credential = credentials.get_opt(&key.name).await?;

    let mut attempts = 0u32;
    let mut delay = context.settings.conflict_backoff;
    let outcome = loop {
        let result = if attempts == 0 {
            converge(context, &config_maps, key, credential.as_ref()).await
        } else {
            resync(context, &credentials, &config_maps, key).await
        };
        match result {
            Ok(outcome) => break outcome,
            Err(error) if needs_resync(&error) => {
                attempts += 1;
                if attempts > context.settings.conflict_retries {
                    return Err(Error::Conflicted {
                        config_map: context.settings.aggregate_name.clone(),
                        attempts,
                    });
                }
                log::debug!("reconcile of {key} interrupted ({error}), resyncing namespace");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(error) => return Err(error),
        }
    };

    match &outcome {
        Outcome::Created(name) => log::info!("created config map {name} for credential {key}"),
        Outcome::Merged(name) => log::info!("merged credential {key} into config map {name}"),
        Outcome::Pruned(Some(name)) => log::info!("removed credential {key} from config map {name}"),
        Outcome::Pruned(None) => {
            log::info!("removed last credential entry, deleted aggregate of namespace {}", key.namespace)
        }
        Outcome::Resynced(_) => log::info!("resynced credential aggregate of namespace {}", key.namespace),
        Outcome::Unchanged(_) => log::debug!("credential {key} already converged"),
    }

    if let (Some(credential), Some(aggregate)) = (credential.as_ref(), outcome.aggregate()) {
        publish_status(&credentials, credential, aggregate).await?;
    }
    Ok(())
}

/// One incremental get-decode-mutate-encode-write attempt.
async fn converge(
    context: &Context,
    config_maps: &Api<ConfigMap>,
    key: &ReconcileKey,
    credential: Option<&Credential>,
) -> Result<Outcome, Error> {
    let aggregate = find_aggregate(context, config_maps, &key.namespace).await?;
    match (credential, aggregate) {
        (Some(credential), None) => create_aggregate(context, config_maps, credential).await,
        (Some(credential), Some(existing)) => {
            merge_into(context, config_maps, credential, existing).await
        }
        (None, Some(existing)) => prune_from(context, config_maps, &key.name, existing).await,
        (None, None) => Ok(Outcome::Unchanged(None)),
    }
}

/// Lists the namespace and picks out the credential-owned config map.
/// Exactly zero or one is expected; more violate the invariant and abort
/// the incremental attempt without mutation.
async fn find_aggregate(
    context: &Context,
    config_maps: &Api<ConfigMap>,
    namespace: &str,
) -> Result<Option<ConfigMap>, Error> {
    let listed = config_maps.list(&ListParams::default()).await?;
    let mut owned: Vec<ConfigMap> = listed
        .items
        .into_iter()
        .filter(|config_map| context.index.is_credential_owned(config_map))
        .collect();
    match owned.len() {
        0 => Ok(None),
        1 => Ok(owned.pop()),
        count => Err(Error::AmbiguousAggregate {
            namespace: namespace.to_string(),
            count,
        }),
    }
}

async fn create_aggregate(
    context: &Context,
    config_maps: &Api<ConfigMap>,
    credential: &Credential,
) -> Result<Outcome, Error> {
    let document = CredentialsDocument {
        credentials: vec![CredentialEntry::for_credential(credential)],
    };
    let aggregate = new_aggregate(context, credential, &document)?;
    config_maps.create(&PostParams::default(), &aggregate).await?;
    Ok(Outcome::Created(context.settings.aggregate_name.clone()))
}

fn new_aggregate(
    context: &Context,
    creator: &Credential,
    document: &CredentialsDocument,
) -> Result<ConfigMap, Error> {
    let mut data = BTreeMap::new();
    data.insert(context.settings.document_key.clone(), document.encode()?);
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(context.settings.aggregate_name.clone()),
            namespace: creator.metadata.namespace.clone(),
            labels: creator.metadata.labels.clone(),
            owner_references: Some(vec![owners::owner_reference(creator, true)]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    })
}

async fn merge_into(
    context: &Context,
    config_maps: &Api<ConfigMap>,
    credential: &Credential,
    mut aggregate: ConfigMap,
) -> Result<Outcome, Error> {
    let aggregate_name = aggregate.metadata.name.clone().unwrap_or_default();
    let mut document = decode_document(context, &aggregate)?;
    let entry = CredentialEntry::for_credential(credential);

    let probe = owners::owner_reference(credential, false);
    let marker = owners::find_owner(&aggregate.metadata, &probe)
        .map(|existing| existing.controller.unwrap_or(false));

    if marker.is_some() && document.entry(&entry.name) == Some(&entry) {
        return Ok(Outcome::Unchanged(Some(aggregate_name)));
    }

    document.upsert(entry);
    owners::set_owner(
        &mut aggregate.metadata,
        owners::owner_reference(credential, marker.unwrap_or(false)),
    );
    merge_labels(&mut aggregate.metadata, credential);
    store_document(context, &mut aggregate, &document)?;
    config_maps
        .replace(&aggregate_name, &PostParams::default(), &aggregate)
        .await?;
    Ok(Outcome::Merged(aggregate_name))
}

async fn prune_from(
    context: &Context,
    config_maps: &Api<ConfigMap>,
    name: &str,
    mut aggregate: ConfigMap,
) -> Result<Outcome, Error> {
    let aggregate_name = aggregate.metadata.name.clone().unwrap_or_default();
    let mut document = decode_document(context, &aggregate)?;

    let removed_entry = document.prune(name);
    let removed_marker = owners::remove_owner(&mut aggregate.metadata, &Credential::kind(&()), name);
    if !removed_entry && !removed_marker {
        return Ok(Outcome::Unchanged(None));
    }

    if document.is_empty() {
        delete_aggregate(config_maps, &aggregate).await?;
        Ok(Outcome::Pruned(None))
    } else {
        store_document(context, &mut aggregate, &document)?;
        config_maps
            .replace(&aggregate_name, &PostParams::default(), &aggregate)
            .await?;
        Ok(Outcome::Pruned(Some(aggregate_name)))
    }
}

/// Rebuilds the namespace from scratch: the entry set and ownership set
/// are recomputed from the authoritative list of live credentials, and a
/// duplicated aggregate is healed by keeping the canonical object and
/// deleting the surplus.
async fn resync(
    context: &Context,
    credentials: &Api<Credential>,
    config_maps: &Api<ConfigMap>,
    key: &ReconcileKey,
) -> Result<Outcome, Error> {
    let live = credentials.list(&ListParams::default()).await?.items;
    let listed = config_maps.list(&ListParams::default()).await?;
    let owned: Vec<ConfigMap> = listed
        .items
        .into_iter()
        .filter(|config_map| context.index.is_credential_owned(config_map))
        .collect();
    let (canonical, surplus) = select_canonical(owned, &context.settings.aggregate_name);

    for aggregate in &surplus {
        log::warn!(
            "deleting surplus credential config map {} in namespace {}",
            aggregate.metadata.name.as_deref().unwrap_or_default(),
            key.namespace
        );
        delete_aggregate(config_maps, aggregate).await?;
    }

    let Some((creator, _)) = live.split_first() else {
        if let Some(aggregate) = &canonical {
            delete_aggregate(config_maps, aggregate).await?;
        }
        return Ok(Outcome::Resynced(None));
    };

    match canonical {
        None => {
            let document = rebuild_entries(&CredentialsDocument::default(), &live);
            let mut aggregate = new_aggregate(context, creator, &document)?;
            for credential in live.iter().skip(1) {
                owners::set_owner(
                    &mut aggregate.metadata,
                    owners::owner_reference(credential, false),
                );
                merge_labels(&mut aggregate.metadata, credential);
            }
            config_maps.create(&PostParams::default(), &aggregate).await?;
            Ok(Outcome::Resynced(held_aggregate(
                key,
                &live,
                &context.settings.aggregate_name,
            )))
        }
        Some(mut aggregate) => {
            let aggregate_name = aggregate.metadata.name.clone().unwrap_or_default();
            let existing = decode_document(context, &aggregate)?;
            let document = rebuild_entries(&existing, &live);
            let references = rebuild_owner_references(&aggregate.metadata, &live);

            let unchanged = document == existing
                && aggregate.metadata.owner_references.as_deref().unwrap_or_default()
                    == references.as_slice();
            if unchanged {
                return Ok(Outcome::Resynced(held_aggregate(key, &live, &aggregate_name)));
            }

            aggregate.metadata.owner_references = Some(references);
            for credential in &live {
                merge_labels(&mut aggregate.metadata, credential);
            }
            store_document(context, &mut aggregate, &document)?;
            config_maps
                .replace(&aggregate_name, &PostParams::default(), &aggregate)
                .await?;
            Ok(Outcome::Resynced(held_aggregate(key, &live, &aggregate_name)))
        }
    }
}

/// The aggregate to keep when more than one exists: the one bearing the
/// configured name, else the lexicographically first.
fn select_canonical(
    mut owned: Vec<ConfigMap>,
    configured: &str,
) -> (Option<ConfigMap>, Vec<ConfigMap>) {
    if owned.is_empty() {
        return (None, owned);
    }
    owned.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    let position = owned
        .iter()
        .position(|config_map| config_map.metadata.name.as_deref() == Some(configured))
        .unwrap_or(0);
    let canonical = owned.remove(position);
    (Some(canonical), owned)
}

/// The recomputed entry list: surviving entries keep their position in
/// the existing document, credentials without an entry are appended in
/// list order.
fn rebuild_entries(existing: &CredentialsDocument, live: &[Credential]) -> CredentialsDocument {
    let mut document = CredentialsDocument::default();
    for entry in &existing.credentials {
        if let Some(credential) = live
            .iter()
            .find(|credential| credential.metadata.name.as_deref() == Some(entry.name.as_str()))
        {
            document.credentials.push(CredentialEntry::for_credential(credential));
        }
    }
    for credential in live {
        let name = credential.metadata.name.clone().unwrap_or_default();
        if document.entry(&name).is_none() {
            document.credentials.push(CredentialEntry::for_credential(credential));
        }
    }
    document
}

/// The recomputed ownership set: markers of dead credentials are dropped,
/// surviving markers are refreshed in place (keeping a controller flag),
/// missing contributors are appended, and markers of foreign kinds are
/// left untouched.
fn rebuild_owner_references(meta: &ObjectMeta, live: &[Credential]) -> Vec<OwnerReference> {
    let mut references = Vec::new();
    for reference in meta.owner_references.as_deref().unwrap_or_default() {
        if !owners::is_credential_reference(reference) {
            references.push(reference.clone());
            continue;
        }
        if let Some(credential) = live
            .iter()
            .find(|credential| credential.metadata.name.as_deref() == Some(reference.name.as_str()))
        {
            references.push(owners::owner_reference(
                credential,
                reference.controller.unwrap_or(false),
            ));
        }
    }
    for credential in live {
        let reference = owners::owner_reference(credential, false);
        if !references.iter().any(|existing| {
            owners::is_credential_reference(existing) && existing.name == reference.name
        }) {
            references.push(reference);
        }
    }
    references
}

/// The aggregate name to publish in the key's credential status, when the
/// credential survived the resync.
fn held_aggregate(key: &ReconcileKey, live: &[Credential], aggregate_name: &str) -> Option<String> {
    live.iter()
        .any(|credential| credential.metadata.name.as_deref() == Some(key.name.as_str()))
        .then(|| aggregate_name.to_string())
}

async fn delete_aggregate(config_maps: &Api<ConfigMap>, aggregate: &ConfigMap) -> Result<(), Error> {
    let name = aggregate.metadata.name.clone().unwrap_or_default();
    let params = DeleteParams {
        preconditions: Some(Preconditions {
            resource_version: aggregate.metadata.resource_version.clone(),
            uid: aggregate.metadata.uid.clone(),
        }),
        ..DeleteParams::default()
    };
    match config_maps.delete(&name, &params).await {
        Ok(_) => Ok(()),
        Err(error) if is_not_found(&error) => Ok(()),
        Err(error) => Err(error.into()),
    }
}

async fn publish_status(
    credentials: &Api<Credential>,
    credential: &Credential,
    aggregate: &str,
) -> Result<(), Error> {
    let current = credential
        .status
        .as_ref()
        .map(|status| status.config_map.as_str());
    if current == Some(aggregate) {
        return Ok(());
    }
    let name = credential.metadata.name.clone().unwrap_or_default();
    let patch = serde_json::json!({ "status": { "configMap": aggregate } });
    credentials
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn decode_document(context: &Context, aggregate: &ConfigMap) -> Result<CredentialsDocument, Error> {
    let key = &context.settings.document_key;
    let raw = aggregate
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| Error::MissingDocument {
            config_map: aggregate.metadata.name.clone().unwrap_or_default(),
            key: key.clone(),
        })?;
    Ok(CredentialsDocument::decode(raw)?)
}

fn store_document(
    context: &Context,
    aggregate: &mut ConfigMap,
    document: &CredentialsDocument,
) -> Result<(), Error> {
    aggregate
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(context.settings.document_key.clone(), document.encode()?);
    Ok(())
}

fn merge_labels(meta: &mut ObjectMeta, credential: &Credential) {
    let Some(labels) = credential.metadata.labels.as_ref() else {
        return;
    };
    if labels.is_empty() {
        return;
    }
    let target = meta.labels.get_or_insert_with(BTreeMap::new);
    for (label, value) in labels {
        target.insert(label.clone(), value.clone());
    }
}

/// Faults the resync path recovers from: a conflicting write against a
/// stale version, and the duplicate-aggregate invariant violation.
fn needs_resync(error: &Error) -> bool {
    match error {
        Error::AmbiguousAggregate { .. } => true,
        Error::Api(kube_client::Error::Api(response)) => response.code == 409,
        _ => false,
    }
}

fn is_not_found(error: &kube_client::Error) -> bool {
    matches!(error, kube_client::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use kube_core::ErrorResponse;
    use serde_json::json;

    use crate::api::CredentialSpec;

    use super::*;

    fn credential(name: &str) -> Credential {
        let mut credential = Credential::new(
            name,
            CredentialSpec {
                credential_type: "container-registry".to_string(),
                whitelisted_pipelines: None,
                whitelisted_trusted_images: None,
                additional_properties: BTreeMap::new(),
            },
        );
        credential.metadata.namespace = Some("default".to_string());
        credential.metadata.uid = Some(format!("uid-{name}"));
        credential
    }

    fn aggregate(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[test]
    fn key_displays_as_namespaced_name() {
        let key = ReconcileKey {
            namespace: "default".to_string(),
            name: "cred1".to_string(),
        };
        assert_eq!(key.to_string(), "default/cred1");
    }

    #[test]
    fn entry_flattens_the_worked_example() {
        let mut source = credential("cred1");
        source.spec.whitelisted_pipelines = Some("github.com/estafette/.+".to_string());
        source.spec.additional_properties = BTreeMap::from([
            ("repository".to_string(), json!("estafette")),
            ("private".to_string(), json!(false)),
            ("username".to_string(), json!("estafettesvc")),
            ("password".to_string(), json!("supersecretpassword")),
        ]);

        let entry = CredentialEntry::for_credential(&source);

        assert_eq!(entry.name, "cred1");
        assert_eq!(entry.credential_type, "container-registry");
        assert_eq!(
            entry.whitelisted_pipelines.as_deref(),
            Some("github.com/estafette/.+")
        );
        assert_eq!(entry.whitelisted_trusted_images, None);
        assert_eq!(entry.additional_properties["password"], json!("supersecretpassword"));
        assert_eq!(entry.additional_properties["private"], json!(false));
    }

    #[test]
    fn rebuild_keeps_existing_order_and_appends_new() {
        let existing = CredentialsDocument {
            credentials: vec![
                CredentialEntry::for_credential(&credential("b")),
                CredentialEntry::for_credential(&credential("a")),
                CredentialEntry::for_credential(&credential("dead")),
            ],
        };
        let live = [credential("a"), credential("b"), credential("fresh")];

        let document = rebuild_entries(&existing, &live);

        let names: Vec<_> = document
            .credentials
            .iter()
            .map(|entry| entry.name.as_str())
            .collect();
        assert_eq!(names, ["b", "a", "fresh"]);
    }

    #[test]
    fn rebuild_yields_one_entry_per_live_credential() {
        let live = [credential("a"), credential("b"), credential("c")];

        let document = rebuild_entries(&CredentialsDocument::default(), &live);

        assert_eq!(document.credentials.len(), live.len());
        for credential in &live {
            assert!(document.entry(credential.metadata.name.as_deref().unwrap()).is_some());
        }
    }

    #[test]
    fn rebuild_owner_references_drops_dead_and_keeps_controller() {
        let mut meta = ObjectMeta::default();
        owners::set_owner(&mut meta, owners::owner_reference(&credential("a"), true));
        owners::set_owner(&mut meta, owners::owner_reference(&credential("dead"), false));
        let live = [credential("a"), credential("fresh")];

        let references = rebuild_owner_references(&meta, &live);

        assert_eq!(references.len(), 2);
        assert_eq!(references[0].name, "a");
        assert_eq!(references[0].controller, Some(true));
        assert_eq!(references[1].name, "fresh");
        assert_eq!(references[1].controller, Some(false));
    }

    #[test]
    fn rebuild_owner_references_refreshes_stale_uids() {
        let mut meta = ObjectMeta::default();
        let mut stale = owners::owner_reference(&credential("a"), false);
        stale.uid = "uid-before-recreate".to_string();
        owners::set_owner(&mut meta, stale);

        let references = rebuild_owner_references(&meta, &[credential("a")]);

        assert_eq!(references.len(), 1);
        assert_eq!(references[0].uid, "uid-a");
    }

    #[test]
    fn canonical_prefers_the_configured_name() {
        let owned = vec![
            aggregate("aaa-imposter"),
            aggregate("estafette-external-credentials"),
        ];

        let (canonical, surplus) = select_canonical(owned, "estafette-external-credentials");

        assert_eq!(
            canonical.unwrap().metadata.name.as_deref(),
            Some("estafette-external-credentials")
        );
        assert_eq!(surplus.len(), 1);
        assert_eq!(surplus[0].metadata.name.as_deref(), Some("aaa-imposter"));
    }

    #[test]
    fn canonical_falls_back_to_lexicographic_order() {
        let owned = vec![aggregate("zzz"), aggregate("aaa")];

        let (canonical, surplus) = select_canonical(owned, "estafette-external-credentials");

        assert_eq!(canonical.unwrap().metadata.name.as_deref(), Some("aaa"));
        assert_eq!(surplus[0].metadata.name.as_deref(), Some("zzz"));
    }

    #[test]
    fn conflicts_and_duplicates_route_to_resync() {
        let conflict = Error::Api(kube_client::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        let duplicates = Error::AmbiguousAggregate {
            namespace: "default".to_string(),
            count: 2,
        };
        let missing = Error::MissingDocument {
            config_map: "estafette-external-credentials".to_string(),
            key: "credentials-config.yaml".to_string(),
        };

        assert!(needs_resync(&conflict));
        assert!(needs_resync(&duplicates));
        assert!(!needs_resync(&missing));
    }

    #[test]
    fn not_found_is_distinguished_from_conflict() {
        let not_found = kube_client::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "configmaps not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });

        assert!(is_not_found(&not_found));
        assert!(!needs_resync(&Error::Api(not_found)));
    }
}
