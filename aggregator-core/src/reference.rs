//! References to component objects, as published in operator status
use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::core::DynamicObject;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Identity of a cluster object belonging to an operator
///
/// Only `(apiVersion, kind, namespace, name)` form the value. Server-assigned
/// fields such as uid and resourceVersion are stripped on the way in, so the
/// same object always yields the same reference.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRef {
    /// `group/version` or `version` for the core group
    pub api_version: String,
    /// Kind of the object
    pub kind: String,
    /// Namespace of the object, absent for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Name of the object
    pub name: String,
}

impl ComponentRef {
    /// Reference an object read from the cluster
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or(Error::MissingField("type metadata"))?;
        let name = obj.metadata.name.clone().ok_or(Error::MissingField("metadata.name"))?;
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    /// Reference the owner named by an owner reference
    ///
    /// Owners live in the dependent's namespace unless they are cluster-scoped,
    /// which the owner reference alone cannot tell. Pass `None` for owners
    /// known to be cluster-scoped.
    #[must_use]
    pub fn from_owner_ref(namespace: Option<&str>, owner: &OwnerReference) -> Self {
        Self {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            namespace: namespace.map(String::from),
            name: owner.name.clone(),
        }
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.kind, self.api_version, self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}

impl TryFrom<ObjectReference> for ComponentRef {
    type Error = Error;

    fn try_from(value: ObjectReference) -> Result<Self> {
        Ok(Self {
            api_version: value.api_version.ok_or(Error::MissingField("apiVersion"))?,
            kind: value.kind.ok_or(Error::MissingField("kind"))?,
            namespace: value.namespace,
            name: value.name.ok_or(Error::MissingField("name"))?,
        })
    }
}

impl From<ComponentRef> for ObjectReference {
    fn from(value: ComponentRef) -> Self {
        ObjectReference {
            api_version: Some(value.api_version),
            kind: Some(value.kind),
            namespace: value.namespace,
            name: Some(value.name),
            ..ObjectReference::default()
        }
    }
}

/// A status condition copied from a component
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ComponentCondition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Read `status.conditions` off an arbitrary object
///
/// Entries that do not look like conditions are skipped.
#[must_use]
pub fn conditions_of(obj: &DynamicObject) -> Vec<ComponentCondition> {
    obj.data
        .pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .map(|conditions| {
            conditions
                .iter()
                .filter_map(|c| serde_json::from_value(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// A component reference together with the component's current conditions
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct RichReference {
    /// Identity of the component
    #[serde(flatten)]
    pub reference: ComponentRef,
    /// Conditions reported by the component
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ComponentCondition>,
}

impl From<ComponentRef> for RichReference {
    fn from(reference: ComponentRef) -> Self {
        Self {
            reference,
            conditions: vec![],
        }
    }
}
