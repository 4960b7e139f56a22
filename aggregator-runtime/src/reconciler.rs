//! The authoritative reference set of one operator instance
use std::collections::{BTreeMap, HashMap};

use aggregator_core::{
    component_selector, conditions_of, ComponentCondition, ComponentRef, ComponentSelector, Components,
    RichReference,
};
use kube::core::{DynamicObject, GroupVersionKind};
use tracing::{trace, warn};

use crate::watcher::Event;

/// Component references with the conditions last seen on each
pub type Members = BTreeMap<ComponentRef, Vec<ComponentCondition>>;

/// Where the reconciler is in converging on the cluster state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Nothing observed yet
    Empty,
    /// Updates are arriving
    Converging,
    /// No updates for a quiescence window
    Settled,
}

/// Maintains labeled and adopted members and decides when status is stale
#[derive(Debug)]
pub struct Reconciler {
    key: String,
    selector: ComponentSelector,
    labeled: HashMap<GroupVersionKind, Members>,
    adopted: Members,
    phase: Phase,
    published: Option<Components>,
}

fn member(obj: &DynamicObject) -> Option<(ComponentRef, Vec<ComponentCondition>)> {
    match ComponentRef::from_object(obj) {
        Ok(reference) => Some((reference, conditions_of(obj))),
        Err(err) => {
            warn!(error = %err, "ignoring object that cannot be referenced");
            None
        }
    }
}

impl Reconciler {
    /// Start empty for an instance with label key `key`
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            selector: component_selector(key),
            labeled: HashMap::new(),
            adopted: Members::new(),
            phase: Phase::Empty,
            published: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Note that an update arrived
    pub fn touch(&mut self) {
        self.phase = Phase::Converging;
    }

    /// Note that no update arrived for a quiescence window
    pub fn settle(&mut self) {
        if self.phase == Phase::Converging {
            self.phase = Phase::Settled;
        }
    }

    fn bears_key(&self, obj: &DynamicObject) -> bool {
        obj.metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(&self.key))
    }

    /// Apply an event from the labeled watch of `kind`
    pub fn apply_labeled(&mut self, kind: &GroupVersionKind, event: &Event) {
        match event {
            Event::Restarted(objs) => {
                let members = objs
                    .iter()
                    .filter(|obj| self.bears_key(obj))
                    .filter_map(member)
                    .collect::<Members>();
                trace!(kind = %kind.kind, count = members.len(), "replacing labeled members");
                self.labeled.insert(kind.clone(), members);
            }
            Event::Applied(obj) => {
                let bears_key = self.bears_key(obj);
                let Some((reference, conditions)) = member(obj) else {
                    return;
                };
                let members = self.labeled.entry(kind.clone()).or_default();
                if bears_key {
                    members.insert(reference, conditions);
                } else {
                    members.remove(&reference);
                }
            }
            Event::Deleted(obj) => {
                if let (Some((reference, _)), Some(members)) = (member(obj), self.labeled.get_mut(kind)) {
                    members.remove(&reference);
                }
            }
        }
    }

    /// Forget everything learnt from the labeled watch of `kind`
    pub fn drop_kind(&mut self, kind: &GroupVersionKind) {
        self.labeled.remove(kind);
    }

    /// Replace the adopted members
    pub fn set_adopted(&mut self, members: Members) {
        self.adopted = members;
    }

    /// The union of labeled and adopted members
    pub fn current(&self) -> Members {
        let mut current = self.adopted.clone();
        for members in self.labeled.values() {
            current.extend(members.iter().map(|(r, c)| (r.clone(), c.clone())));
        }
        current
    }

    /// The status components for the current members, sorted by reference
    pub fn desired(&self) -> Components {
        let refs = self
            .current()
            .into_iter()
            .map(|(reference, conditions)| RichReference { reference, conditions })
            .collect();
        Components {
            label_selector: self.selector.clone(),
            refs,
        }
    }

    /// Whether the status last published differs from [`Reconciler::desired`]
    pub fn is_dirty(&self) -> bool {
        self.published.as_ref() != Some(&self.desired())
    }

    /// Record what the status now holds
    pub fn mark_published(&mut self, components: Components) {
        self.published = Some(components);
    }

    /// Take the status as last read from the cluster as what is published
    ///
    /// A status written by anyone else then shows up as dirty and is repaired.
    pub fn observe_stored(&mut self, stored: Option<Components>) {
        if self.published != stored {
            trace!(key = %self.key, "stored status differs from the last publish");
            self.published = stored;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "operators.coreos.com/o";

    fn kind() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ServiceAccount")
    }

    fn sa(ns: &str, name: &str, labeled: bool) -> DynamicObject {
        let labels = if labeled { json!({ KEY: "" }) } else { json!({}) };
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": { "name": name, "namespace": ns, "labels": labels },
        }))
        .unwrap()
    }

    fn names(r: &Reconciler) -> Vec<String> {
        r.current().keys().map(ToString::to_string).collect()
    }

    #[test]
    fn first_publish_is_always_dirty() {
        let mut r = Reconciler::new(KEY);
        assert_eq!(r.phase(), Phase::Empty);
        assert!(r.is_dirty());
        let desired = r.desired();
        assert!(desired.refs.is_empty());
        assert!(desired.label_selector.requires_key(KEY));
        r.mark_published(desired);
        assert!(!r.is_dirty());
    }

    #[test]
    fn phases_follow_updates() {
        let mut r = Reconciler::new(KEY);
        r.settle();
        assert_eq!(r.phase(), Phase::Empty);
        r.touch();
        assert_eq!(r.phase(), Phase::Converging);
        r.settle();
        assert_eq!(r.phase(), Phase::Settled);
        r.touch();
        assert_eq!(r.phase(), Phase::Converging);
    }

    #[test]
    fn label_changes_add_and_remove() {
        let mut r = Reconciler::new(KEY);
        r.apply_labeled(&kind(), &Event::Restarted(vec![sa("ns-a", "sa-a", true)]));
        r.apply_labeled(&kind(), &Event::Applied(sa("ns-b", "sa-b", true)));
        assert_eq!(names(&r), ["ServiceAccount.v1/sa-a.ns-a", "ServiceAccount.v1/sa-b.ns-b"]);

        r.apply_labeled(&kind(), &Event::Applied(sa("ns-b", "sa-b", false)));
        assert_eq!(names(&r), ["ServiceAccount.v1/sa-a.ns-a"]);

        r.apply_labeled(&kind(), &Event::Deleted(sa("ns-a", "sa-a", true)));
        assert!(names(&r).is_empty());
    }

    #[test]
    fn restart_replaces_kind_members() {
        let mut r = Reconciler::new(KEY);
        r.apply_labeled(&kind(), &Event::Applied(sa("ns-a", "sa-a", true)));
        r.apply_labeled(&kind(), &Event::Applied(sa("ns-a", "sa-b", true)));
        r.apply_labeled(&kind(), &Event::Restarted(vec![sa("ns-a", "sa-b", true)]));
        assert_eq!(names(&r), ["ServiceAccount.v1/sa-b.ns-a"]);
        r.drop_kind(&kind());
        assert!(names(&r).is_empty());
    }

    #[test]
    fn replaying_updates_is_idempotent() {
        let mut r = Reconciler::new(KEY);
        let events = [
            Event::Applied(sa("ns-a", "sa-a", true)),
            Event::Applied(sa("ns-b", "sa-b", true)),
            Event::Deleted(sa("ns-b", "sa-b", true)),
        ];
        for event in &events {
            r.apply_labeled(&kind(), event);
        }
        let once = r.current();
        for event in &events {
            r.apply_labeled(&kind(), event);
        }
        assert_eq!(r.current(), once);
    }

    #[test]
    fn labeled_and_adopted_appear_once() {
        let mut r = Reconciler::new(KEY);
        let obj = sa("ns-a", "sa-a", true);
        r.apply_labeled(&kind(), &Event::Applied(obj.clone()));
        let mut adopted = Members::new();
        adopted.insert(ComponentRef::from_object(&obj).unwrap(), vec![]);
        r.set_adopted(adopted);
        assert_eq!(r.desired().refs.len(), 1);
    }

    #[test]
    fn condition_changes_are_dirty() {
        let mut r = Reconciler::new(KEY);
        let mut obj = sa("ns-a", "sa-a", true);
        r.apply_labeled(&kind(), &Event::Applied(obj.clone()));
        r.mark_published(r.desired());

        obj.data = json!({ "status": { "conditions": [{ "type": "Ready", "status": "False" }] } });
        r.apply_labeled(&kind(), &Event::Applied(obj));
        assert!(r.is_dirty());
        assert_eq!(r.desired().refs.len(), 1);
        assert_eq!(r.desired().refs[0].conditions[0].status, "False");
    }

    #[test]
    fn same_name_in_two_namespaces_gives_two_refs() {
        let mut r = Reconciler::new(KEY);
        r.apply_labeled(&kind(), &Event::Restarted(vec![sa("ns-a", "sa", true), sa("ns-b", "sa", true)]));
        assert_eq!(names(&r), ["ServiceAccount.v1/sa.ns-a", "ServiceAccount.v1/sa.ns-b"]);
        assert_eq!(r.desired().refs.len(), 2);

        r.apply_labeled(&kind(), &Event::Deleted(sa("ns-a", "sa", true)));
        assert_eq!(names(&r), ["ServiceAccount.v1/sa.ns-b"]);
    }

    #[test]
    fn overwritten_status_is_dirty() {
        let mut r = Reconciler::new(KEY);
        r.apply_labeled(&kind(), &Event::Applied(sa("ns-a", "sa-a", true)));
        let desired = r.desired();
        r.mark_published(desired.clone());
        r.observe_stored(Some(desired.clone()));
        assert!(!r.is_dirty());

        r.observe_stored(None);
        assert!(r.is_dirty());
        let mut truncated = desired;
        truncated.refs.clear();
        r.observe_stored(Some(truncated));
        assert!(r.is_dirty());
        r.mark_published(r.desired());
        assert!(!r.is_dirty());
    }
}
