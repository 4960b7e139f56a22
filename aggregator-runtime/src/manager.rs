//! Registry of cancellable watch tasks feeding one queue
use std::collections::HashMap;

use aggregator_client::ClusterClient;
use aggregator_core::Selector;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{pin_mut, StreamExt};
use kube::core::{ApiResource, GroupVersionKind};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::watcher::{watcher, Event};

// Watch tasks block once this many updates are waiting on the consumer
const UPDATE_BUFFER: usize = 1024;

/// A single message from a watch task
#[derive(Debug)]
pub struct Update {
    /// Kind the task watches
    pub kind: GroupVersionKind,
    /// What happened
    pub change: Change,
}

/// The payload of an [`Update`]
#[derive(Debug)]
pub enum Change {
    /// A watch event, in the order the server sent it
    Watch(Event),
    /// The kind cannot be watched; everything learnt from it is void
    Stopped,
}

struct Task {
    resource: ApiResource,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one watch task per kind
///
/// Every task feeds the same ordered queue, handed out by [`WatchManager::new`].
/// Tasks are cancelled through child tokens of the owner's token, so
/// cancelling the owner stops them all.
///
/// An operator instance runs one with its label selector; the controller runs
/// a single unfiltered one for the owner index shared by all instances.
pub struct WatchManager<C> {
    client: C,
    selector: Option<Selector>,
    backoff: ExponentialBuilder,
    token: CancellationToken,
    tx: mpsc::Sender<Update>,
    tasks: HashMap<GroupVersionKind, Task>,
}

fn kind_of(resource: &ApiResource) -> GroupVersionKind {
    GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind)
}

impl<C: ClusterClient> WatchManager<C> {
    /// Create a manager and the queue its tasks feed
    ///
    /// Without a `selector` the tasks see every object of their kind.
    pub fn new(
        client: C,
        selector: Option<Selector>,
        backoff: ExponentialBuilder,
        token: CancellationToken,
    ) -> (Self, mpsc::Receiver<Update>) {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let manager = Self {
            client,
            selector,
            backoff,
            token,
            tx,
            tasks: HashMap::new(),
        };
        (manager, rx)
    }

    /// Make the running tasks match `resources`
    ///
    /// Starts tasks for new kinds, restarts tasks that have finished (such
    /// as kinds skipped as unavailable), and cancels tasks for kinds that are
    /// gone. Returns the cancelled kinds so what was learnt from them can be dropped.
    pub fn sync_kinds(&mut self, resources: &[ApiResource]) -> Vec<GroupVersionKind> {
        let wanted = resources
            .iter()
            .map(|ar| (kind_of(ar), ar))
            .collect::<HashMap<_, _>>();

        let removed = self
            .tasks
            .keys()
            .filter(|kind| !wanted.contains_key(*kind))
            .cloned()
            .collect::<Vec<_>>();
        for kind in &removed {
            if let Some(task) = self.tasks.remove(kind) {
                debug!(kind = %task.resource.kind, "stopping watch");
                task.token.cancel();
            }
        }

        for (kind, resource) in wanted {
            let stale = self.tasks.get(&kind).map(|task| {
                task.handle.is_finished() || task.resource.version != resource.version
            });
            if stale == Some(false) {
                continue;
            }
            if let Some(old) = self.tasks.remove(&kind) {
                old.token.cancel();
            }
            debug!(kind = %resource.kind, filtered = self.selector.is_some(), "starting watch");
            let task = self.spawn(kind.clone(), resource.clone());
            self.tasks.insert(kind, task);
        }
        removed
    }

    fn spawn(&self, kind: GroupVersionKind, resource: ApiResource) -> Task {
        let token = self.token.child_token();
        let handle = tokio::spawn(run_watch(
            self.client.clone(),
            kind,
            resource.clone(),
            self.selector.clone(),
            self.backoff,
            token.clone(),
            self.tx.clone(),
        ));
        Task {
            resource,
            token,
            handle,
        }
    }
}

impl<C> Drop for WatchManager<C> {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.token.cancel();
        }
    }
}

/// Forward the events of one kind until cancelled
///
/// A failing watch is retried after the next delay of `backoff`; the first
/// event that comes through starts the delays over.
async fn run_watch<C: ClusterClient>(
    client: C,
    kind: GroupVersionKind,
    resource: ApiResource,
    selector: Option<Selector>,
    backoff: ExponentialBuilder,
    token: CancellationToken,
    tx: mpsc::Sender<Update>,
) {
    let stream = watcher(client, resource, selector);
    pin_mut!(stream);
    let mut delays = None;
    let send = |change| {
        let update = Update {
            kind: kind.clone(),
            change,
        };
        let (tx, token) = (&tx, &token);
        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => false,
                sent = tx.send(update) => sent.is_ok(),
            }
        }
    };
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                delays = None;
                trace!(kind = %kind.kind, "forwarding watch event");
                if !send(Change::Watch(event)).await {
                    return;
                }
            }
            Some(Err(err)) if err.is_unavailable() => {
                warn!(kind = %kind.kind, group = %kind.group, error = %err, "skipping unavailable kind");
                send(Change::Stopped).await;
                return;
            }
            Some(Err(err)) => {
                let Some(delay) = delays.get_or_insert_with(|| backoff.build()).next() else {
                    warn!(kind = %kind.kind, error = %err, "watch failed, giving up");
                    send(Change::Stopped).await;
                    return;
                };
                warn!(kind = %kind.kind, error = %err, ?delay, "watch failed, backing off");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator_test::{fixtures, FakeCluster};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(rx: &mut mpsc::Receiver<Update>) -> Update {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no update")
            .expect("queue closed")
    }

    fn fast_backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20))
            .without_max_times()
    }

    #[tokio::test]
    async fn one_task_per_kind() {
        let cluster = FakeCluster::with_default_kinds();
        let token = CancellationToken::new();
        let (mut manager, mut rx) =
            WatchManager::new(cluster.clone(), Some(Selector::exists("k")), fast_backoff(), token.clone());
        let kinds = [
            cluster.resource(&fixtures::namespace_kind()),
            cluster.resource(&fixtures::service_account_kind()),
        ];
        assert!(manager.sync_kinds(&kinds).is_empty());
        // a second sync leaves running tasks alone
        assert!(manager.sync_kinds(&kinds).is_empty());

        let mut seen = vec![];
        for _ in 0..2 {
            let update = recv(&mut rx).await;
            assert!(matches!(update.change, Change::Watch(Event::Restarted(_))));
            seen.push(update.kind.kind);
        }
        seen.sort();
        assert_eq!(seen, ["Namespace", "ServiceAccount"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cluster.watch_count(&fixtures::namespace_kind()), 1);
        assert_eq!(cluster.watch_count(&fixtures::service_account_kind()), 1);

        let removed = manager.sync_kinds(&kinds[..1]);
        assert_eq!(removed, [fixtures::service_account_kind()]);

        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.watch_count(&fixtures::namespace_kind()), 0);
        assert_eq!(cluster.watch_count(&fixtures::service_account_kind()), 0);
    }

    #[tokio::test]
    async fn unavailable_kind_stops_without_affecting_others() {
        let cluster = FakeCluster::with_default_kinds();
        cluster.forbid(&fixtures::service_account_kind());
        let (mut manager, mut rx) = WatchManager::new(
            cluster.clone(),
            Some(Selector::exists("k")),
            fast_backoff(),
            CancellationToken::new(),
        );
        let kinds = [
            cluster.resource(&fixtures::namespace_kind()),
            cluster.resource(&fixtures::service_account_kind()),
        ];
        manager.sync_kinds(&kinds);
        let mut stopped = None;
        let mut listed = None;
        for _ in 0..2 {
            let update = recv(&mut rx).await;
            match update.change {
                Change::Stopped => stopped = Some(update.kind.kind),
                Change::Watch(Event::Restarted(_)) => listed = Some(update.kind.kind),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(stopped.as_deref(), Some("ServiceAccount"));
        assert_eq!(listed.as_deref(), Some("Namespace"));

        // a later sync retries the skipped kind
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster.allow(&fixtures::service_account_kind());
        manager.sync_kinds(&kinds);
        let update = recv(&mut rx).await;
        assert_eq!(update.kind.kind, "ServiceAccount");
        assert!(matches!(update.change, Change::Watch(Event::Restarted(_))));
    }

    #[tokio::test]
    async fn failed_watches_back_off_and_relist() {
        let cluster = FakeCluster::with_default_kinds();
        let (mut manager, mut rx) =
            WatchManager::new(cluster.clone(), None, fast_backoff(), CancellationToken::new());
        manager.sync_kinds(&[cluster.resource(&fixtures::namespace_kind())]);
        assert!(matches!(recv(&mut rx).await.change, Change::Watch(Event::Restarted(_))));
        cluster.apply(fixtures::namespace("ns-a"));
        assert!(matches!(recv(&mut rx).await.change, Change::Watch(Event::Applied(_))));

        cluster.break_watches();
        match recv(&mut rx).await.change {
            Change::Watch(Event::Restarted(objs)) => assert_eq!(objs.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn selected_tasks_filter_server_side() {
        let cluster = FakeCluster::with_default_kinds();
        let key = "operators.coreos.com/o";
        cluster.apply(fixtures::labeled(fixtures::namespace("ns-a"), key));
        cluster.apply(fixtures::namespace("ns-b"));
        let (mut manager, mut rx) = WatchManager::new(
            cluster.clone(),
            Some(Selector::exists(key)),
            fast_backoff(),
            CancellationToken::new(),
        );
        manager.sync_kinds(&[cluster.resource(&fixtures::namespace_kind())]);
        match recv(&mut rx).await.change {
            Change::Watch(Event::Restarted(objs)) => assert_eq!(objs.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
