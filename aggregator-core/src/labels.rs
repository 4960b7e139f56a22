//! Component label keys and the selector model used to match them
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Domain every component label key is namespaced under
pub const LABEL_DOMAIN: &str = "operators.coreos.com";

// Kubernetes caps the name segment of a qualified label key at 63 characters
const MAX_NAME_SEGMENT: usize = 63;

/// Derive the component label key for an operator instance
///
/// The key is `operators.coreos.com/<name>`. Names that cannot form a valid
/// label key name segment are rejected instead of truncated, so two operators
/// never share a key.
///
/// ```
/// use aggregator_core::labels::derive_label_key;
/// assert_eq!(derive_label_key("etcd").unwrap(), "operators.coreos.com/etcd");
/// assert!(derive_label_key("").is_err());
/// ```
pub fn derive_label_key(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::EmptyName);
    }
    let invalid = |reason| Error::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.len() > MAX_NAME_SEGMENT {
        return Err(invalid("must be no more than 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("may only contain alphanumerics, '-', '_' or '.'"));
    }
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err(invalid("must start and end with an alphanumeric character"));
    }
    Ok(format!("{LABEL_DOMAIN}/{name}"))
}

/// Build the published selector descriptor for a label key
#[must_use]
pub fn component_selector(key: &str) -> ComponentSelector {
    ComponentSelector {
        match_expressions: vec![SelectorRequirement {
            key: key.to_string(),
            operator: "Exists".to_string(),
            values: None,
        }],
    }
}

/// The label selector published in `status.components.labelSelector`
///
/// Same wire shape as a `meta/v1` `LabelSelector` restricted to expressions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSelector {
    /// Requirements that must all hold
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

/// A single `key operator values` requirement
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SelectorRequirement {
    /// Label key the requirement applies to
    pub key: String,
    /// One of `In`, `NotIn`, `Exists` and `DoesNotExist`
    pub operator: String,
    /// Values for `In` and `NotIn`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

impl ComponentSelector {
    /// Whether this selector requires exactly the presence of `key`
    #[must_use]
    pub fn requires_key(&self, key: &str) -> bool {
        self.match_expressions
            .iter()
            .any(|req| req.key == key && req.operator == "Exists")
    }
}

/// Selects objects carrying a label key, whatever its value
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Selector {
    key: String,
}

impl Selector {
    /// Selector matching any object that carries `key`
    #[must_use]
    pub fn exists(key: &str) -> Self {
        Self { key: key.to_string() }
    }

    /// Convert a selector to a string for the API
    #[must_use]
    pub fn to_selector_string(&self) -> String {
        self.key.clone()
    }

    /// Whether `labels` carry the key
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.contains_key(&self.key)
    }
}
