//! Objects as an operator installation lays them out
use aggregator_core::{kinds, Operator};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::json;

/// `v1 Namespace`
pub fn namespace_kind() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Namespace")
}

/// `v1 ServiceAccount`
pub fn service_account_kind() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "ServiceAccount")
}

/// `apiextensions.k8s.io/v1 CustomResourceDefinition`
pub fn crd_kind() -> GroupVersionKind {
    GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition")
}

/// The `Operator` aggregate kind
pub fn operator_kind() -> GroupVersionKind {
    let ar = ApiResource::erase::<Operator>(&());
    GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind)
}

fn object(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> DynamicObject {
    let obj = DynamicObject::new(name, &ApiResource::from_gvk(gvk)).data(json!({}));
    match namespace {
        Some(ns) => obj.within(ns),
        None => obj,
    }
}

/// A namespace
pub fn namespace(name: &str) -> DynamicObject {
    object(&namespace_kind(), None, name)
}

/// A service account in `namespace`
pub fn service_account(namespace: &str, name: &str) -> DynamicObject {
    object(&service_account_kind(), Some(namespace), name)
}

/// A custom resource definition
pub fn crd(name: &str) -> DynamicObject {
    object(&crd_kind(), None, name)
}

/// A subscription installing `package` into `namespace`
pub fn subscription(namespace: &str, name: &str, package: &str) -> DynamicObject {
    object(&kinds::subscription(), Some(namespace), name).data(json!({
        "spec": { "name": package, "channel": "stable" },
    }))
}

/// A cluster service version in `namespace`
pub fn csv(namespace: &str, name: &str) -> DynamicObject {
    object(&kinds::cluster_service_version(), Some(namespace), name).data(json!({
        "spec": {},
        "status": {
            "conditions": [{ "type": "Succeeded", "status": "True", "reason": "InstallSucceeded" }],
        },
    }))
}

/// An operator with an empty spec
pub fn operator(name: &str) -> DynamicObject {
    DynamicObject::new(name, &ApiResource::erase::<Operator>(&())).data(json!({ "spec": {} }))
}

/// `obj` carrying the label `key`
pub fn labeled(mut obj: DynamicObject, key: &str) -> DynamicObject {
    obj.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), String::new());
    obj
}

/// `obj` with a controller reference to the stored object `owner`
///
/// # Panics
///
/// When `owner` has no uid, which only stored objects have.
pub fn owned_by(mut obj: DynamicObject, owner: &DynamicObject) -> DynamicObject {
    let types = owner.types.clone().expect("owner has type meta");
    obj.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(OwnerReference {
            api_version: types.api_version,
            kind: types.kind,
            name: owner.metadata.name.clone().expect("owner is named"),
            uid: owner.metadata.uid.clone().expect("owner is stored"),
            controller: Some(true),
            block_owner_deletion: Some(true),
        });
    obj
}
