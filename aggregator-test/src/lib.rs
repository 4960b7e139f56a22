//! Test helpers for the operator component aggregator
//!
//! [`FakeCluster`] is an in-memory API server implementing [`ClusterClient`].
//! It keeps resource versions and a change history per kind, so watches can
//! resume, and it lets tests inject the failures a real cluster produces:
//! forbidden kinds, expired cursors, broken connections and status conflicts.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use aggregator_client::{api_error, ClusterClient, Error, ErrorResponse, Result, WatchStream};
use aggregator_core::{kinds::default_component_kinds, Operator, Selector};
use async_trait::async_trait;
use futures::{
    channel::mpsc::{unbounded, UnboundedSender},
    stream, StreamExt,
};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, ObjectList, WatchEvent};
use parking_lot::Mutex;
use serde_json::json;
use tracing::trace;

pub mod fixtures;

type ObjectKey = (Option<String>, String);
type Sender = UnboundedSender<Result<WatchEvent<DynamicObject>>>;

const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "APIService",
];

struct Watcher {
    selector: Option<Selector>,
    tx: Sender,
}

/// One recorded write, with the object before and after it
struct Revision {
    revision: u64,
    old: Option<DynamicObject>,
    new: Option<DynamicObject>,
}

struct Kind {
    resource: ApiResource,
    namespaced: bool,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    history: Vec<Revision>,
    watchers: Vec<Watcher>,
}

#[derive(Default)]
struct State {
    kinds: HashMap<GroupVersionKind, Kind>,
    revision: u64,
    compacted: u64,
    next_uid: u64,
    forbidden: HashSet<GroupVersionKind>,
    status_conflicts: usize,
    status_writes: usize,
}

fn kind_of(resource: &ApiResource) -> GroupVersionKind {
    GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind)
}

fn type_of(obj: &DynamicObject) -> GroupVersionKind {
    let types = obj.types.as_ref().expect("fixture objects carry type meta");
    let (group, version) = types.api_version.split_once('/').unwrap_or(("", &types.api_version));
    GroupVersionKind::gvk(group, version, &types.kind)
}

fn key_of(obj: &DynamicObject) -> ObjectKey {
    let name = obj.metadata.name.clone().expect("fixture objects are named");
    (obj.metadata.namespace.clone(), name)
}

fn matches(selector: Option<&Selector>, obj: Option<&DynamicObject>) -> bool {
    let Some(obj) = obj else { return false };
    selector.is_none_or(|selector| selector.matches(obj.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())))
}

/// The event a watcher with `selector` sees for a write
///
/// Objects entering the selection are added and objects leaving it are deleted.
fn event_for(selector: Option<&Selector>, change: &Revision) -> Option<WatchEvent<DynamicObject>> {
    let was = matches(selector, change.old.as_ref());
    let is = matches(selector, change.new.as_ref());
    match (was, is, &change.new) {
        (false, true, Some(new)) => Some(WatchEvent::Added(new.clone())),
        (true, true, Some(new)) => Some(WatchEvent::Modified(new.clone())),
        (true, false, Some(new)) => Some(WatchEvent::Deleted(new.clone())),
        (true, false, None) => {
            let mut old = change.old.clone()?;
            old.metadata.resource_version = Some(change.revision.to_string());
            Some(WatchEvent::Deleted(old))
        }
        _ => None,
    }
}

fn gone() -> ErrorResponse {
    ErrorResponse {
        status: "Failure".into(),
        message: "too old resource version".into(),
        reason: "Expired".into(),
        code: 410,
    }
}

impl Kind {
    fn record(&mut self, change: Revision) {
        self.watchers.retain(|watcher| match event_for(watcher.selector.as_ref(), &change) {
            Some(event) => watcher.tx.unbounded_send(Ok(event)).is_ok(),
            None => !watcher.tx.is_closed(),
        });
        self.history.push(change);
    }
}

impl State {
    fn kind(&self, gvk: &GroupVersionKind) -> Result<&Kind> {
        self.kinds
            .get(gvk)
            .ok_or_else(|| api_error(404, "NotFound", format!("the server could not find the requested resource {}", gvk.kind)))
    }

    fn kind_mut(&mut self, gvk: &GroupVersionKind) -> Result<&mut Kind> {
        self.kinds
            .get_mut(gvk)
            .ok_or_else(|| api_error(404, "NotFound", format!("the server could not find the requested resource {}", gvk.kind)))
    }

    fn readable(&self, gvk: &GroupVersionKind) -> Result<&Kind> {
        if self.forbidden.contains(gvk) {
            return Err(api_error(403, "Forbidden", format!("cannot list resource {}", gvk.kind)));
        }
        self.kind(gvk)
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn write(&mut self, gvk: &GroupVersionKind, mut obj: DynamicObject) -> DynamicObject {
        let revision = self.bump();
        let key = key_of(&obj);
        let old = self.kinds.get(gvk).and_then(|kind| kind.objects.get(&key)).cloned();
        obj.metadata.resource_version = Some(revision.to_string());
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = match old.as_ref().and_then(|o| o.metadata.uid.clone()) {
                Some(uid) => Some(uid),
                None => {
                    self.next_uid += 1;
                    Some(format!("uid-{}", self.next_uid))
                }
            };
        }
        let kind = self
            .kinds
            .get_mut(gvk)
            .unwrap_or_else(|| panic!("kind {} is not registered", gvk.kind));
        kind.objects.insert(key, obj.clone());
        kind.record(Revision {
            revision,
            old,
            new: Some(obj.clone()),
        });
        obj
    }

    fn remove(&mut self, gvk: &GroupVersionKind, key: &ObjectKey) -> Option<DynamicObject> {
        let revision = self.bump();
        let kind = self.kinds.get_mut(gvk)?;
        let old = kind.objects.remove(key)?;
        kind.record(Revision {
            revision,
            old: Some(old.clone()),
            new: None,
        });
        Some(old)
    }
}

/// An in-memory cluster
///
/// Clones share the same state, so a test can keep a handle while the code
/// under test owns another.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    /// A cluster serving no kinds
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster serving the default component kinds and the `Operator` kind
    pub fn with_default_kinds() -> Self {
        let cluster = Self::new();
        for gvk in default_component_kinds() {
            let namespaced = !CLUSTER_SCOPED.contains(&gvk.kind.as_str());
            cluster.register(gvk, namespaced);
        }
        cluster.register(fixtures::operator_kind(), false);
        cluster
    }

    /// Serve `gvk`
    pub fn register(&self, gvk: GroupVersionKind, namespaced: bool) {
        let resource = if gvk == fixtures::operator_kind() {
            ApiResource::erase::<Operator>(&())
        } else {
            ApiResource::from_gvk(&gvk)
        };
        self.state.lock().kinds.entry(gvk).or_insert(Kind {
            resource,
            namespaced,
            objects: BTreeMap::new(),
            history: Vec::new(),
            watchers: Vec::new(),
        });
    }

    /// The resource serving `gvk`, whether or not it is forbidden
    ///
    /// # Panics
    ///
    /// When `gvk` is not registered.
    pub fn resource(&self, gvk: &GroupVersionKind) -> ApiResource {
        match self.state.lock().kind(gvk) {
            Ok(kind) => kind.resource.clone(),
            Err(_) => panic!("kind {} is not registered", gvk.kind),
        }
    }

    /// Create or replace an object, keeping its stored status when it has none
    ///
    /// Returns the stored object with its uid and resource version.
    ///
    /// # Panics
    ///
    /// When `obj` lacks type meta or a name, or its kind is not registered.
    pub fn apply(&self, mut obj: DynamicObject) -> DynamicObject {
        let gvk = type_of(&obj);
        let mut state = self.state.lock();
        if let Some(existing) = state.kinds.get(&gvk).and_then(|kind| kind.objects.get(&key_of(&obj))) {
            if obj.data.get("status").is_none() {
                if let Some(status) = existing.data.get("status") {
                    if !obj.data.is_object() {
                        obj.data = json!({});
                    }
                    obj.data["status"] = status.clone();
                }
            }
        }
        trace!(kind = %gvk.kind, name = ?obj.metadata.name, "applying");
        state.write(&gvk, obj)
    }

    /// The stored object, if any
    pub fn get_object(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let state = self.state.lock();
        let key = (namespace.map(String::from), name.to_string());
        state.kinds.get(gvk)?.objects.get(&key).cloned()
    }

    /// Delete an object, and everything in it when it is a namespace
    pub fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let mut state = self.state.lock();
        let deleted = state.remove(gvk, &(namespace.map(String::from), name.to_string()))?;
        if gvk.group.is_empty() && gvk.kind == "Namespace" {
            let contents = state
                .kinds
                .iter()
                .filter(|(_, kind)| kind.namespaced)
                .flat_map(|(gvk, kind)| {
                    kind.objects
                        .keys()
                        .filter(|(ns, _)| ns.as_deref() == Some(name))
                        .map(move |key| (gvk.clone(), key.clone()))
                })
                .collect::<Vec<_>>();
            for (gvk, key) in contents {
                state.remove(&gvk, &key);
            }
        }
        Some(deleted)
    }

    /// Delete an object without any watch seeing it, as if the event was lost
    pub fn delete_unobserved(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) {
        let mut state = self.state.lock();
        if let Some(kind) = state.kinds.get_mut(gvk) {
            kind.objects.remove(&(namespace.map(String::from), name.to_string()));
        }
    }

    /// Compact all history, ending every watch with `410 Gone`
    pub fn expire_watches(&self) {
        let mut state = self.state.lock();
        state.compacted = state.revision;
        for kind in state.kinds.values_mut() {
            kind.history.clear();
            for watcher in kind.watchers.drain(..) {
                let _ = watcher.tx.unbounded_send(Ok(WatchEvent::Error(gone())));
            }
        }
    }

    /// Cut every watch connection with a transport error
    pub fn break_watches(&self) {
        let mut state = self.state.lock();
        for kind in state.kinds.values_mut() {
            for watcher in kind.watchers.drain(..) {
                let _ = watcher.tx.unbounded_send(Err(Error::Transport("connection reset by peer".into())));
            }
        }
    }

    /// Make list and watch of `gvk` fail with `403 Forbidden`
    pub fn forbid(&self, gvk: &GroupVersionKind) {
        self.state.lock().forbidden.insert(gvk.clone());
    }

    /// Undo [`FakeCluster::forbid`]
    pub fn allow(&self, gvk: &GroupVersionKind) {
        self.state.lock().forbidden.remove(gvk);
    }

    /// Fail the next `count` status writes with `409 Conflict`
    pub fn inject_status_conflicts(&self, count: usize) {
        self.state.lock().status_conflicts = count;
    }

    /// Number of status writes that succeeded
    pub fn status_writes(&self) -> usize {
        self.state.lock().status_writes
    }

    /// Number of open watches on `gvk`
    pub fn watch_count(&self, gvk: &GroupVersionKind) -> usize {
        let state = self.state.lock();
        state
            .kinds
            .get(gvk)
            .map_or(0, |kind| kind.watchers.iter().filter(|w| !w.tx.is_closed()).count())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource> {
        Ok(self.state.lock().kind(gvk)?.resource.clone())
    }

    async fn discover(&self) -> Result<Vec<ApiResource>> {
        let state = self.state.lock();
        let mut resources = state
            .kinds
            .values()
            .map(|kind| kind.resource.clone())
            .collect::<Vec<_>>();
        resources.sort_by(|a, b| (&a.group, &a.kind).cmp(&(&b.group, &b.kind)));
        Ok(resources)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        selector: Option<&Selector>,
    ) -> Result<ObjectList<DynamicObject>> {
        let state = self.state.lock();
        let kind = state.readable(&kind_of(resource))?;
        let items = kind
            .objects
            .values()
            .filter(|obj| matches(selector, Some(obj)))
            .map(|obj| {
                // list items come without type meta
                let mut obj = obj.clone();
                obj.types = None;
                obj
            })
            .collect::<Vec<_>>();
        let list = serde_json::from_value(json!({
            "apiVersion": resource.api_version,
            "kind": format!("{}List", resource.kind),
            "metadata": { "resourceVersion": state.revision.to_string() },
            "items": items,
        }))?;
        Ok(list)
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        selector: Option<&Selector>,
        resource_version: &str,
    ) -> Result<WatchStream> {
        let mut state = self.state.lock();
        state.readable(&kind_of(resource))?;
        let since = resource_version.parse::<u64>().unwrap_or(0);
        if since < state.compacted {
            return Ok(stream::iter([Ok(WatchEvent::Error(gone()))]).boxed());
        }
        let kind = state.kind_mut(&kind_of(resource))?;
        let (tx, rx) = unbounded();
        for change in kind.history.iter().filter(|change| change.revision > since) {
            if let Some(event) = event_for(selector, change) {
                let _ = tx.unbounded_send(Ok(event));
            }
        }
        kind.watchers.push(Watcher {
            selector: selector.cloned(),
            tx,
        });
        Ok(rx.boxed())
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let state = self.state.lock();
        let kind = state.kind(&kind_of(resource))?;
        Ok(kind
            .objects
            .get(&(namespace.map(String::from), name.to_string()))
            .cloned())
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let gvk = kind_of(resource);
        let mut state = self.state.lock();
        if state.kind(&gvk)?.objects.contains_key(&key_of(obj)) {
            return Err(api_error(409, "AlreadyExists", "object already exists"));
        }
        let mut obj = obj.clone();
        obj.metadata.uid = None;
        Ok(state.write(&gvk, obj))
    }

    async fn replace_status(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let gvk = kind_of(resource);
        let mut state = self.state.lock();
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(api_error(409, "Conflict", "the object has been modified"));
        }
        let Some(mut stored) = state.kind(&gvk)?.objects.get(&key_of(obj)).cloned() else {
            return Err(api_error(404, "NotFound", "object not found"));
        };
        if stored.metadata.resource_version != obj.metadata.resource_version {
            return Err(api_error(409, "Conflict", "the object has been modified"));
        }
        if !stored.data.is_object() {
            stored.data = json!({});
        }
        stored.data["status"] = obj.data.get("status").cloned().unwrap_or(json!({}));
        state.status_writes += 1;
        Ok(state.write(&gvk, stored))
    }
}
