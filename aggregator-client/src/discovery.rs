//! Choosing which served resources to aggregate over
pub use kube::discovery::{verbs, ApiCapabilities, ApiResource, Scope};

/// How discovery decides what api groups to consider
#[derive(Clone, Debug)]
pub enum GroupFilter {
    /// Only allow explicitly listed apigroups
    Allow(Vec<String>),
    /// Allow all apigroups except the ones listed
    Block(Vec<String>),
}

impl Default for GroupFilter {
    fn default() -> Self {
        // high churn groups that never hold operator components
        Self::Block(vec![
            "events.k8s.io".into(),
            "coordination.k8s.io".into(),
            "metrics.k8s.io".into(),
        ])
    }
}

impl GroupFilter {
    /// Whether resources in `group` may be considered
    pub fn is_queryable(&self, group: &str) -> bool {
        match self {
            Self::Allow(allowed) => allowed.iter().any(|g| g == group),
            Self::Block(blocked) => !blocked.iter().any(|g| g == group),
        }
    }
}

/// Whether a resource can be list-watched
pub fn is_watchable(caps: &ApiCapabilities) -> bool {
    caps.supports_operation(verbs::LIST) && caps.supports_operation(verbs::WATCH)
}

/// Keep the watchable resources in queryable groups, sorted and deduplicated by kind
pub fn select_resources(
    filter: &GroupFilter,
    resources: impl IntoIterator<Item = (ApiResource, ApiCapabilities)>,
) -> Vec<ApiResource> {
    let mut selected = resources
        .into_iter()
        .filter(|(ar, caps)| filter.is_queryable(&ar.group) && is_watchable(caps))
        .map(|(ar, _)| ar)
        .collect::<Vec<_>>();
    selected.sort_by(|a, b| (&a.group, &a.kind, &a.version).cmp(&(&b.group, &b.kind, &b.version)));
    selected.dedup_by(|a, b| a.group == b.group && a.kind == b.kind);
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::GroupVersionKind;

    fn resource(group: &str, version: &str, kind: &str, verbs: &[&str]) -> (ApiResource, ApiCapabilities) {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        let caps = ApiCapabilities {
            scope: Scope::Namespaced,
            subresources: vec![],
            operations: verbs.iter().map(ToString::to_string).collect(),
        };
        (ar, caps)
    }

    #[test]
    fn filters_groups() {
        let block = GroupFilter::default();
        assert!(block.is_queryable(""));
        assert!(!block.is_queryable("events.k8s.io"));
        let allow = GroupFilter::Allow(vec!["apps".into()]);
        assert!(allow.is_queryable("apps"));
        assert!(!allow.is_queryable(""));
    }

    #[test]
    fn selects_watchable_resources_once_per_kind() {
        let lw = [verbs::LIST, verbs::WATCH];
        let selected = select_resources(&GroupFilter::default(), [
            resource("apps", "v1", "Deployment", &lw),
            resource("apps", "v1beta1", "Deployment", &lw),
            resource("", "v1", "Binding", &[verbs::CREATE]),
            resource("events.k8s.io", "v1", "Event", &lw),
            resource("", "v1", "ConfigMap", &lw),
        ]);
        let kinds = selected.iter().map(|ar| ar.kind.as_str()).collect::<Vec<_>>();
        assert_eq!(kinds, ["ConfigMap", "Deployment"]);
        assert_eq!(selected[1].version, "v1");
    }
}
