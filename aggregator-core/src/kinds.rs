//! The resource kinds operator components are drawn from
use kube::core::GroupVersionKind;

use crate::{Error, Result};

/// Kind of the adoption roots that install an operator package
pub fn subscription() -> GroupVersionKind {
    GroupVersionKind::gvk("operators.coreos.com", "v1alpha1", "Subscription")
}

/// Kind of the installed versions owning an operator's resources
pub fn cluster_service_version() -> GroupVersionKind {
    GroupVersionKind::gvk("operators.coreos.com", "v1alpha1", "ClusterServiceVersion")
}

/// The kinds an operator installation is built from
pub fn default_component_kinds() -> Vec<GroupVersionKind> {
    [
        ("", "v1", "Namespace"),
        ("", "v1", "ServiceAccount"),
        ("", "v1", "Secret"),
        ("", "v1", "ConfigMap"),
        ("", "v1", "Service"),
        ("apps", "v1", "Deployment"),
        ("rbac.authorization.k8s.io", "v1", "Role"),
        ("rbac.authorization.k8s.io", "v1", "RoleBinding"),
        ("rbac.authorization.k8s.io", "v1", "ClusterRole"),
        ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
        ("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
        ("apiregistration.k8s.io", "v1", "APIService"),
        ("operators.coreos.com", "v1alpha1", "Subscription"),
        ("operators.coreos.com", "v1alpha1", "InstallPlan"),
        ("operators.coreos.com", "v1alpha1", "ClusterServiceVersion"),
        ("operators.coreos.com", "v1alpha1", "CatalogSource"),
        ("operators.coreos.com", "v1", "OperatorGroup"),
    ]
    .into_iter()
    .map(|(g, v, k)| GroupVersionKind::gvk(g, v, k))
    .collect()
}

/// Parse a kind written as `group/version/Kind`, or `version/Kind` for the core group
///
/// ```
/// use aggregator_core::kinds::parse_kind;
/// let gvk = parse_kind("apps/v1/Deployment").unwrap();
/// assert_eq!((gvk.group.as_str(), gvk.kind.as_str()), ("apps", "Deployment"));
/// assert_eq!(parse_kind("v1/Namespace").unwrap().group, "");
/// ```
pub fn parse_kind(s: &str) -> Result<GroupVersionKind> {
    let parts = s.split('/').collect::<Vec<_>>();
    let (group, version, kind) = match *parts.as_slice() {
        [g, v, k] => (g, v, k),
        [v, k] => ("", v, k), // core group
        _ => return Err(Error::InvalidKind(s.into())),
    };
    if version.is_empty() || kind.is_empty() {
        return Err(Error::InvalidKind(s.into()));
    }
    Ok(GroupVersionKind::gvk(group, version, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_api_version_and_kind() {
        for kind in default_component_kinds() {
            let written = format!("{}/{}", kind.api_version(), kind.kind);
            assert_eq!(parse_kind(&written).unwrap(), kind);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "Deployment", "a/b/c/d", "apps//Deployment", "v1/"] {
            assert!(parse_kind(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn defaults_include_adoption_root() {
        assert!(default_component_kinds().contains(&subscription()));
        assert!(default_component_kinds().contains(&cluster_service_version()));
    }
}
