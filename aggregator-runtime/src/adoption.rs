//! Discovering components through owner references from adoption roots
//!
//! An owner graph indexes every object seen by the adoption watches by
//! uid, along with the reverse "owned by" edges. [`OwnerIndex`] keeps one
//! graph for all operators; for each it finds the subscriptions installing
//! the operator's package and walks everything that transitively depends on them.
use std::collections::{BTreeSet, HashMap, HashSet};

use aggregator_core::{conditions_of, package_operator_name, ComponentCondition, ComponentRef};
use kube::core::{DynamicObject, GroupVersionKind};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{reconciler::Members, watcher::Event};

/// Errors from walking the owner graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdoptionError {
    /// Following dependents led back to an object already on the path
    #[error("ownership cycle through {0}")]
    Cycle(ComponentRef),
}

/// Which objects adoption starts from
#[derive(Clone, Debug)]
pub struct AdoptionConfig {
    /// Kinds whose objects install a package, matched by `spec.name` and namespace
    pub root_kinds: Vec<GroupVersionKind>,
}

impl Default for AdoptionConfig {
    fn default() -> Self {
        Self {
            root_kinds: vec![aggregator_core::kinds::subscription()],
        }
    }
}

#[derive(Clone, Debug)]
struct Node {
    reference: ComponentRef,
    owners: Vec<String>,
    conditions: Vec<ComponentCondition>,
    kind: GroupVersionKind,
    /// Operator this object is a root for, when it is of a root kind
    installs: Option<String>,
}

/// Index of objects by uid and of dependents by owner uid
#[derive(Debug, Default)]
struct OwnerGraph {
    nodes: HashMap<String, Node>,
    dependents: HashMap<String, BTreeSet<String>>,
    by_kind: HashMap<GroupVersionKind, HashSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl OwnerGraph {
    fn node_for(kind: &GroupVersionKind, obj: &DynamicObject, root_kinds: &[GroupVersionKind]) -> Option<(String, Node)> {
        let uid = obj.metadata.uid.clone()?;
        let reference = ComponentRef::from_object(obj).ok()?;
        let owners = obj
            .metadata
            .owner_references
            .iter()
            .flatten()
            .map(|owner| owner.uid.clone())
            .collect();
        let installs = root_kinds.contains(kind).then(|| {
            let package = obj.data.pointer("/spec/name").and_then(|v| v.as_str())?;
            let namespace = obj.metadata.namespace.as_deref()?;
            Some(package_operator_name(package, namespace))
        });
        Some((uid, Node {
            reference,
            owners,
            conditions: conditions_of(obj),
            kind: kind.clone(),
            installs: installs.flatten(),
        }))
    }

    fn insert(&mut self, uid: String, node: Node) {
        self.remove(&uid);
        for owner in &node.owners {
            self.dependents.entry(owner.clone()).or_default().insert(uid.clone());
        }
        self.by_kind.entry(node.kind.clone()).or_default().insert(uid.clone());
        self.nodes.insert(uid, node);
    }

    fn remove(&mut self, uid: &str) -> Option<Node> {
        let node = self.nodes.remove(uid)?;
        for owner in &node.owners {
            if let Some(dependents) = self.dependents.get_mut(owner) {
                dependents.remove(uid);
                if dependents.is_empty() {
                    self.dependents.remove(owner);
                }
            }
        }
        if let Some(uids) = self.by_kind.get_mut(&node.kind) {
            uids.remove(uid);
        }
        Some(node)
    }

    /// Forget every object of `kind`
    fn clear_kind(&mut self, kind: &GroupVersionKind) {
        let uids = self.by_kind.remove(kind).unwrap_or_default();
        for uid in uids {
            self.remove(&uid);
        }
    }

    /// The roots plus everything reachable from them along "dependent of" edges
    ///
    /// Unknown roots and dependents are skipped, which prunes their branch.
    /// Shared dependents are visited once; an edge back onto the current path
    /// is a cycle.
    fn walk<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> Result<HashSet<String>, AdoptionError> {
        let mut marks = HashMap::<&str, Mark>::new();
        let mut reached = HashSet::new();

        for root in roots {
            let Some((root, _)) = self.nodes.get_key_value(root) else {
                continue;
            };
            if marks.contains_key(root.as_str()) {
                continue;
            }
            marks.insert(root.as_str(), Mark::Visiting);
            reached.insert(root.clone());
            let mut stack = vec![(root.as_str(), self.dependents_of(root))];
            while let Some((uid, children)) = stack.last_mut() {
                let Some(child) = children.next() else {
                    marks.insert(*uid, Mark::Done);
                    stack.pop();
                    continue;
                };
                match marks.get(child.as_str()) {
                    Some(Mark::Visiting) => {
                        if let Some(node) = self.nodes.get(child) {
                            return Err(AdoptionError::Cycle(node.reference.clone()));
                        }
                    }
                    Some(Mark::Done) => continue,
                    None if !self.nodes.contains_key(child) => continue,
                    None => {
                        marks.insert(child.as_str(), Mark::Visiting);
                        reached.insert(child.clone());
                        stack.push((child.as_str(), self.dependents_of(child)));
                    }
                }
            }
        }
        Ok(reached)
    }

    fn dependents_of<'s>(&'s self, uid: &str) -> impl Iterator<Item = &'s String> + 's {
        self.dependents.get(uid).into_iter().flatten()
    }

    fn members(&self, uids: &HashSet<String>) -> Members {
        uids.iter()
            .filter_map(|uid| self.nodes.get(uid))
            .map(|node| (node.reference.clone(), node.conditions.clone()))
            .collect()
    }
}

struct Adopted {
    uids: HashSet<String>,
    tx: watch::Sender<Members>,
}

/// The owner index shared by every operator instance
///
/// Fed by one unfiltered watch per kind. Each registered operator gets a
/// channel carrying its adopted members, which is only updated when an event
/// may have changed them and the walk finds a different set.
pub struct OwnerIndex {
    root_kinds: Vec<GroupVersionKind>,
    graph: OwnerGraph,
    operators: HashMap<String, Adopted>,
}

impl OwnerIndex {
    /// An empty index adopting from the roots in `config`
    pub fn new(config: &AdoptionConfig) -> Self {
        Self {
            root_kinds: config.root_kinds.clone(),
            graph: OwnerGraph::default(),
            operators: HashMap::new(),
        }
    }

    /// Start adopting for the operator named `operator`
    ///
    /// The returned channel already holds what the index knows now.
    pub fn register(&mut self, operator: &str) -> watch::Receiver<Members> {
        let (tx, rx) = watch::channel(Members::new());
        self.operators.insert(operator.to_string(), Adopted {
            uids: HashSet::new(),
            tx,
        });
        self.rewalk(operator);
        rx
    }

    /// Stop adopting for `operator`
    pub fn unregister(&mut self, operator: &str) {
        self.operators.remove(operator);
    }

    /// Operators whose adopted set an event of `kind` may change
    fn touched(&self, kind: &GroupVersionKind, event: &Event) -> Vec<String> {
        let (obj, applied) = match event {
            Event::Restarted(_) => return self.operators.keys().cloned().collect(),
            Event::Applied(obj) => (obj, true),
            Event::Deleted(obj) => (obj, false),
        };
        let Some(uid) = obj.metadata.uid.as_deref() else {
            return vec![];
        };
        let previous = self.graph.nodes.get(uid);
        let current = applied
            .then(|| OwnerGraph::node_for(kind, obj, &self.root_kinds))
            .flatten()
            .map(|(_, node)| node);
        let owners = previous
            .into_iter()
            .chain(current.iter())
            .flat_map(|node| node.owners.iter())
            .collect::<Vec<_>>();
        let installs = previous
            .into_iter()
            .chain(current.iter())
            .filter_map(|node| node.installs.as_deref())
            .collect::<HashSet<_>>();
        self.operators
            .iter()
            .filter(|(name, adopted)| {
                installs.contains(name.as_str())
                    || adopted.uids.contains(uid)
                    || (applied && owners.iter().any(|owner| adopted.uids.contains(*owner)))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Index an event from the adoption watch of `kind`, then update the
    /// operators it concerns
    pub fn observe(&mut self, kind: &GroupVersionKind, event: &Event) {
        let touched = self.touched(kind, event);
        match event {
            Event::Restarted(objs) => {
                self.graph.clear_kind(kind);
                for obj in objs {
                    if let Some((uid, node)) = OwnerGraph::node_for(kind, obj, &self.root_kinds) {
                        self.graph.insert(uid, node);
                    }
                }
            }
            Event::Applied(obj) => {
                if let Some((uid, node)) = OwnerGraph::node_for(kind, obj, &self.root_kinds) {
                    self.graph.insert(uid, node);
                }
            }
            Event::Deleted(obj) => {
                if let Some(uid) = obj.metadata.uid.as_deref() {
                    self.graph.remove(uid);
                }
            }
        }
        for operator in touched {
            self.rewalk(&operator);
        }
    }

    /// Forget every object of `kind`, updating the operators that adopted any
    pub fn drop_kind(&mut self, kind: &GroupVersionKind) {
        let uids = self.graph.by_kind.get(kind).cloned().unwrap_or_default();
        let is_root_kind = self.root_kinds.contains(kind);
        let affected = self
            .operators
            .iter()
            .filter(|(_, adopted)| is_root_kind || !adopted.uids.is_disjoint(&uids))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        self.graph.clear_kind(kind);
        for operator in affected {
            self.rewalk(&operator);
        }
    }

    fn roots(&self, operator: &str) -> Vec<&str> {
        let mut roots = self
            .root_kinds
            .iter()
            .filter_map(|kind| self.graph.by_kind.get(kind))
            .flatten()
            .filter(|uid| self.graph.nodes.get(*uid).and_then(|n| n.installs.as_deref()) == Some(operator))
            .map(String::as_str)
            .collect::<Vec<_>>();
        roots.sort_unstable();
        roots
    }

    /// Everything adopted by `operator` as the graph stands
    pub fn walk(&self, operator: &str) -> Result<HashSet<String>, AdoptionError> {
        self.graph.walk(self.roots(operator))
    }

    /// Walk for `operator` and publish its members if they changed
    ///
    /// On a cycle the previously adopted objects are kept.
    fn rewalk(&mut self, operator: &str) {
        let walked = self.walk(operator);
        let Some(adopted) = self.operators.get_mut(operator) else {
            return;
        };
        match walked {
            Ok(reached) => {
                debug!(%operator, adopted = reached.len(), "walked owner graph");
                adopted.uids = reached;
            }
            Err(err) => warn!(%operator, error = %err, "keeping previous adopted set"),
        }
        let members = self.graph.members(&adopted.uids);
        adopted.tx.send_if_modified(|current| {
            if *current == members {
                return false;
            }
            *current = members;
            true
        });
    }
}
