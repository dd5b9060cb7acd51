//! Ownership bookkeeping on the shared aggregate object.
//!
//! The aggregate carries one owner reference per contributing credential,
//! deliberately breaking with the single-controller-owner convention: the
//! object must only be garbage collected once every contributor is gone.
//! Two references denote the same owner when their API group, kind and
//! name match; the namespace matches implicitly because owners and
//! aggregate are co-located.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube_core::Resource;

use crate::api::Credential;

/// Builds the owner reference a credential stamps onto the aggregate.
///
/// The credential that creates the aggregate is recorded as its
/// controller; later contributors are plain owners.
pub fn owner_reference(credential: &Credential, is_controller: bool) -> OwnerReference {
    OwnerReference {
        api_version: Credential::api_version(&()).into_owned(),
        kind: Credential::kind(&()).into_owned(),
        name: credential.metadata.name.clone().unwrap_or_default(),
        uid: credential.metadata.uid.clone().unwrap_or_default(),
        controller: Some(is_controller),
        block_owner_deletion: Some(is_controller),
    }
}

/// Adds the reference to the ownership set, replacing an existing marker
/// for the same owner. Replacement refreshes the recorded uid, so a
/// deleted-and-recreated owner with the same name repairs its marker.
pub fn set_owner(meta: &mut ObjectMeta, reference: OwnerReference) {
    let references = meta.owner_references.get_or_insert_with(Vec::new);
    match references
        .iter_mut()
        .find(|existing| same_owner(existing, &reference))
    {
        Some(existing) => *existing = reference,
        None => references.push(reference),
    }
}

/// Removes the first marker matching the kind and name.
///
/// Only the weak identity is available here: the owner may already be
/// gone, so its uid cannot be recovered.
pub fn remove_owner(meta: &mut ObjectMeta, kind: &str, name: &str) -> bool {
    let Some(references) = meta.owner_references.as_mut() else {
        return false;
    };
    match references
        .iter()
        .position(|reference| reference.kind == kind && reference.name == name)
    {
        Some(position) => {
            references.remove(position);
            true
        }
        None => false,
    }
}

/// Whether a marker for this owner is already present.
pub fn is_owned_by(meta: &ObjectMeta, reference: &OwnerReference) -> bool {
    find_owner(meta, reference).is_some()
}

/// The existing marker for this owner, if any.
pub fn find_owner<'a>(
    meta: &'a ObjectMeta,
    reference: &OwnerReference,
) -> Option<&'a OwnerReference> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|existing| same_owner(existing, reference))
}

/// Whether a reference points at a credential resource.
pub fn is_credential_reference(reference: &OwnerReference) -> bool {
    reference.kind == Credential::kind(&())
        && api_group(&reference.api_version) == Credential::group(&())
}

/// Names of all credentials holding a marker on this object.
pub fn credential_owner_names(meta: &ObjectMeta) -> Vec<String> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|reference| is_credential_reference(reference))
        .map(|reference| reference.name.clone())
        .collect()
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    api_group(&a.api_version) == api_group(&b.api_version) && a.kind == b.kind && a.name == b.name
}

/// The group part of an `apiVersion`, empty for the core group.
fn api_group(api_version: &str) -> &str {
    api_version.split_once('/').map_or("", |(group, _)| group)
}
