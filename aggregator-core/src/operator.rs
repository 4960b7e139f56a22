//! The cluster-scoped `Operator` aggregate and its status
use kube::{core::DynamicObject, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{labels::ComponentSelector, reference::RichReference};

/// Desired state of an operator; the aggregate is described by its status alone
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v2alpha1",
    kind = "Operator",
    plural = "operators",
    status = "OperatorStatus"
)]
pub struct OperatorSpec {}

/// Observed state of an operator
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct OperatorStatus {
    /// The components that make up the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Components>,
}

/// The label selector identifying components and the components found with it
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Components {
    /// Selects components labelled for this operator
    pub label_selector: ComponentSelector,
    /// Labelled and adopted components, sorted
    #[serde(default)]
    pub refs: Vec<RichReference>,
}

/// Name of the operator a package installed into a namespace belongs to
#[must_use]
pub fn package_operator_name(package: &str, namespace: &str) -> String {
    format!("{package}.{namespace}")
}

/// The components stored in an operator's status, if present and well formed
#[must_use]
pub fn components_of(obj: &DynamicObject) -> Option<Components> {
    let components = obj.data.pointer("/status/components")?;
    serde_json::from_value(components.clone()).ok()
}
