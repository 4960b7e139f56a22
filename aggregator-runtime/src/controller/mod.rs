//! Runs one component tracking unit per `Operator` in the cluster
use std::{collections::HashMap, sync::Arc};

use aggregator_client::ClusterClient;
use aggregator_core::{components_of, derive_label_key, kinds, package_operator_name, Components, Operator};
use futures::{pin_mut, StreamExt};
use kube::{
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{utils::StreamBackoff, watcher::DefaultBackoff},
};
use serde_json::json;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    adoption::OwnerIndex,
    manager::{Change, Update, WatchManager},
    watcher::{watcher, Event},
};

mod config;
pub use config::{ControllerConfig, KindSelection};

mod instance;
use instance::{Identity, Inputs, Instance};

struct InstanceHandle {
    uid: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
    stored: watch::Sender<Option<Components>>,
}

// Pends forever when adoption is off
async fn next_update(rx: &mut Option<mpsc::Receiver<Update>>) -> Option<Update> {
    match rx {
        Some(inner) => inner.recv().await,
        None => std::future::pending().await,
    }
}

/// Keeps the `status.components` of every `Operator` current
///
/// Each operator gets its own unit, which watches the configured kinds for
/// objects labeled with the operator's key and publishes what it finds. With
/// adoption enabled, one unfiltered watch per kind feeds an owner index
/// shared by all units, and each unit is handed the objects owned by its
/// installation.
///
/// ```no_run
/// use aggregator_client::KubeClient;
/// use aggregator_runtime::{Controller, ControllerConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = KubeClient::try_default().await?;
/// let shutdown = CancellationToken::new();
/// Controller::new(client, ControllerConfig::default()).run(shutdown).await;
/// # Ok(())
/// # }
/// ```
pub struct Controller<C> {
    client: C,
    config: Arc<ControllerConfig>,
    operators: ApiResource,
    instances: HashMap<String, InstanceHandle>,
    kinds_tx: watch::Sender<Vec<ApiResource>>,
    adoption: Option<OwnerIndex>,
}

impl<C: ClusterClient> Controller<C> {
    /// Create a controller talking to the cluster through `client`
    pub fn new(client: C, config: ControllerConfig) -> Self {
        let (kinds_tx, _) = watch::channel(Vec::new());
        let adoption = config.adoption.as_ref().map(OwnerIndex::new);
        Self {
            client,
            config: Arc::new(config),
            operators: ApiResource::erase::<Operator>(&()),
            instances: HashMap::new(),
            kinds_tx,
            adoption,
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// All units are cancelled and awaited before this returns.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let operators = StreamBackoff::new(
            watcher(self.client.clone(), self.operators.clone(), None),
            DefaultBackoff::default(),
        );
        pin_mut!(operators);
        let (mut adoption_watches, mut adoption_updates) = match self.adoption {
            Some(_) => {
                let (manager, updates) = WatchManager::new(
                    self.client.clone(),
                    None,
                    self.config.watch_backoff,
                    shutdown.child_token(),
                );
                (Some(manager), Some(updates))
            }
            None => (None, None),
        };
        let mut refresh = interval(self.config.kind_refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                // the first tick completes immediately, so kinds are known before any unit starts
                _ = refresh.tick() => {
                    self.refresh_kinds().await;
                    if let Some(manager) = adoption_watches.as_mut() {
                        self.sync_adoption(manager);
                    }
                    if self.config.ensure_package_operators {
                        self.ensure_package_operators().await;
                    }
                }
                event = operators.next() => match event {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(err)) => warn!(error = %err, "operator watch failed, backing off"),
                    None => break,
                },
                update = next_update(&mut adoption_updates) => match update {
                    Some(update) => self.observe_adoption(update),
                    None => adoption_updates = None,
                },
            }
        }

        info!(units = self.instances.len(), "shutting down");
        for instance in self.instances.values() {
            instance.token.cancel();
        }
        for (name, instance) in self.instances.drain() {
            if let Err(err) = instance.handle.await {
                warn!(operator = %name, error = %err, "unit did not stop cleanly");
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Applied(obj) => self.ensure_instance(&obj),
            Event::Deleted(obj) => {
                let (Some(name), Some(uid)) = (obj.metadata.name.as_deref(), obj.metadata.uid.as_deref()) else {
                    return;
                };
                // a delete of an older incarnation leaves the current unit alone
                if self.instances.get(name).is_some_and(|running| running.uid == uid) {
                    self.stop_instance(name);
                }
            }
            Event::Restarted(objs) => {
                let listed = objs
                    .iter()
                    .filter_map(|obj| obj.metadata.name.clone())
                    .collect::<Vec<_>>();
                let gone = self
                    .instances
                    .keys()
                    .filter(|name| !listed.contains(name))
                    .cloned()
                    .collect::<Vec<_>>();
                for name in gone {
                    self.stop_instance(&name);
                }
                for obj in &objs {
                    self.ensure_instance(obj);
                }
            }
        }
    }

    fn ensure_instance(&mut self, obj: &DynamicObject) {
        let (Some(name), Some(uid)) = (obj.metadata.name.as_deref(), obj.metadata.uid.as_deref()) else {
            return;
        };
        let stored = components_of(obj);
        if let Some(running) = self.instances.get(name) {
            if running.uid == uid && !running.handle.is_finished() {
                running.stored.send_if_modified(|current| {
                    if *current == stored {
                        return false;
                    }
                    *current = stored;
                    true
                });
                return;
            }
            self.stop_instance(name);
        }
        let key = match derive_label_key(name) {
            Ok(key) => key,
            Err(err) => {
                warn!(operator = %name, error = %err, "ignoring operator");
                return;
            }
        };
        let identity = Identity {
            name: name.to_string(),
            uid: uid.to_string(),
            key,
        };
        let token = CancellationToken::new();
        let (stored_tx, stored_rx) = watch::channel(stored);
        let inputs = Inputs {
            kinds: self.kinds_tx.subscribe(),
            adopted: self.adoption.as_mut().map(|index| index.register(name)),
            stored: stored_rx,
        };
        let unit = Instance::new(
            identity,
            self.client.clone(),
            self.config.clone(),
            self.operators.clone(),
        );
        let handle = tokio::spawn(
            unit.run(token.clone(), inputs)
                .instrument(info_span!("operator", name = %name, uid = %uid)),
        );
        self.instances.insert(name.to_string(), InstanceHandle {
            uid: uid.to_string(),
            token,
            handle,
            stored: stored_tx,
        });
    }

    fn stop_instance(&mut self, name: &str) {
        if let Some(instance) = self.instances.remove(name) {
            debug!(operator = %name, "stopping unit");
            instance.token.cancel();
        }
        if let Some(index) = self.adoption.as_mut() {
            index.unregister(name);
        }
    }

    /// Point the shared adoption watches at the current kinds
    fn sync_adoption(&mut self, manager: &mut WatchManager<C>) {
        let kinds = self.kinds_tx.borrow().clone();
        let removed = manager.sync_kinds(&kinds);
        if let Some(index) = self.adoption.as_mut() {
            for kind in removed {
                index.drop_kind(&kind);
            }
        }
    }

    fn observe_adoption(&mut self, update: Update) {
        let Some(index) = self.adoption.as_mut() else {
            return;
        };
        match update.change {
            Change::Watch(event) => index.observe(&update.kind, &event),
            Change::Stopped => index.drop_kind(&update.kind),
        }
    }

    async fn refresh_kinds(&self) {
        let previous = self.kinds_tx.borrow().clone();
        let kinds = self.resolve_kinds(&previous).await;
        if kinds != previous {
            info!(count = kinds.len(), "watching component kinds");
        }
        // units retry kinds they stopped watching on every refresh
        self.kinds_tx.send_replace(kinds);
    }

    /// Resolve the configured kinds to resources, without the `Operator` kind itself
    ///
    /// Kinds that fail to resolve for reasons other than being unavailable keep
    /// their `previous` resolution.
    async fn resolve_kinds(&self, previous: &[ApiResource]) -> Vec<ApiResource> {
        let mut resolved = match &self.config.kinds {
            KindSelection::Static(kinds) => self.resolve_each(kinds, previous).await,
            KindSelection::Discover => match self.client.discover().await {
                Ok(resources) => resources,
                Err(err) => {
                    warn!(error = %err, "discovery failed, keeping previous kinds");
                    previous.to_vec()
                }
            },
        };
        let required = self
            .config
            .required_kinds()
            .into_iter()
            .filter(|gvk| !resolved.iter().any(|ar| same_kind(ar, gvk)))
            .collect::<Vec<_>>();
        resolved.extend(self.resolve_each(&required, previous).await);
        resolved.retain(|ar| !(ar.group == self.operators.group && ar.kind == self.operators.kind));
        resolved.sort_by(|a, b| (&a.group, &a.kind).cmp(&(&b.group, &b.kind)));
        resolved.dedup_by(|a, b| a.group == b.group && a.kind == b.kind);
        resolved
    }

    async fn resolve_each(&self, kinds: &[GroupVersionKind], previous: &[ApiResource]) -> Vec<ApiResource> {
        let mut resolved = Vec::with_capacity(kinds.len());
        for gvk in kinds {
            match self.client.resolve(gvk).await {
                Ok(resource) => resolved.push(resource),
                Err(err) if err.is_unavailable() => {
                    debug!(kind = %gvk.kind, group = %gvk.group, "kind is not served, skipping");
                }
                Err(err) => {
                    warn!(kind = %gvk.kind, group = %gvk.group, error = %err, "failed to resolve kind");
                    resolved.extend(previous.iter().find(|ar| same_kind(ar, gvk)).cloned());
                }
            }
        }
        resolved
    }

    /// Create the operator for every subscription that lacks one
    async fn ensure_package_operators(&self) {
        let subscriptions = match self.client.resolve(&kinds::subscription()).await {
            Ok(resource) => resource,
            Err(err) => {
                debug!(error = %err, "subscriptions are not served");
                return;
            }
        };
        let list = match self.client.list(&subscriptions, None).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "failed to list subscriptions");
                return;
            }
        };
        for sub in &list.items {
            let (Some(package), Some(namespace)) = (
                sub.data.pointer("/spec/name").and_then(|v| v.as_str()),
                sub.metadata.namespace.as_deref(),
            ) else {
                continue;
            };
            let name = package_operator_name(package, namespace);
            if self.instances.contains_key(&name) {
                continue;
            }
            let operator = DynamicObject::new(&name, &self.operators).data(json!({ "spec": {} }));
            match self.client.create(&self.operators, &operator).await {
                Ok(_) => info!(operator = %name, "created operator for subscription"),
                Err(err) if err.is_already_exists() => trace!(operator = %name, "operator exists"),
                Err(err) => warn!(operator = %name, error = %err, "failed to create operator"),
            }
        }
    }
}

fn same_kind(resource: &ApiResource, gvk: &GroupVersionKind) -> bool {
    resource.group == gvk.group && resource.kind == gvk.kind
}
