use std::sync::Arc;

use aggregator_client::ClusterClient;
use aggregator_core::{Components, Selector};
use kube::core::ApiResource;
use tokio::{
    sync::watch,
    time::{sleep_until, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::ControllerConfig;
use crate::{
    manager::{Change, Update, WatchManager},
    publisher::{Outcome, StatusPublisher},
    reconciler::{Members, Phase, Reconciler},
};

/// The identity of one operator instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Identity {
    pub(crate) name: String,
    pub(crate) uid: String,
    pub(crate) key: String,
}

/// When an instance next needs to act
///
/// Settling waits for a quiet window; publishing waits for settling, unless
/// the status has been stale for `max_delay`, and never happens before a
/// pending retry time.
#[derive(Debug)]
struct Schedule {
    quiescence: Duration,
    max_delay: Duration,
    quiet_at: Option<Instant>,
    dirty_since: Option<Instant>,
    retry_at: Option<Instant>,
}

impl Schedule {
    fn new(quiescence: Duration, max_delay: Duration, now: Instant) -> Self {
        Self {
            quiescence,
            max_delay,
            quiet_at: Some(now + quiescence),
            dirty_since: None,
            retry_at: None,
        }
    }

    fn touched(&mut self, now: Instant, dirty: bool) {
        self.quiet_at = Some(now + self.quiescence);
        self.track_dirty(now, dirty);
    }

    fn track_dirty(&mut self, now: Instant, dirty: bool) {
        if !dirty {
            self.dirty_since = None;
        } else if self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
    }

    fn is_quiet(&self, now: Instant) -> bool {
        self.quiet_at.is_some_and(|at| at <= now)
    }

    fn settled(&mut self) {
        self.quiet_at = None;
    }

    fn publish_due(&self, now: Instant, settled: bool) -> bool {
        let Some(dirty_since) = self.dirty_since else {
            return false;
        };
        let waited_out = settled || dirty_since + self.max_delay <= now;
        waited_out && self.retry_at.is_none_or(|at| at <= now)
    }

    fn published(&mut self) {
        self.dirty_since = None;
        self.retry_at = None;
    }

    fn failed(&mut self, now: Instant, retry_after: Duration) {
        self.retry_at = Some(now + retry_after);
    }

    fn next_wake(&self, settled: bool) -> Option<Instant> {
        let publish_at = self.dirty_since.map(|since| {
            let due = if settled { since } else { since + self.max_delay };
            self.retry_at.map_or(due, |at| due.max(at))
        });
        [self.quiet_at, publish_at].into_iter().flatten().min()
    }
}

/// What an instance is fed from the controller
pub(crate) struct Inputs {
    /// The resolved kind set
    pub(crate) kinds: watch::Receiver<Vec<ApiResource>>,
    /// Members adopted through owner references, when adoption is on
    pub(crate) adopted: Option<watch::Receiver<Members>>,
    /// `status.components` as last seen on the operator
    pub(crate) stored: watch::Receiver<Option<Components>>,
}

/// Maintains the status of one operator until cancelled
pub(crate) struct Instance<C> {
    identity: Identity,
    client: C,
    config: Arc<ControllerConfig>,
    operators: ApiResource,
}

// Pends forever for a missing receiver; a closed channel is dropped
async fn maybe_changed<T>(rx: &mut Option<watch::Receiver<T>>) -> bool {
    match rx {
        Some(inner) => inner.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

impl<C: ClusterClient> Instance<C> {
    pub(crate) fn new(identity: Identity, client: C, config: Arc<ControllerConfig>, operators: ApiResource) -> Self {
        Self {
            identity,
            client,
            config,
            operators,
        }
    }

    /// Run until `token` is cancelled, the kind channel closes, or the operator is gone
    pub(crate) async fn run(self, token: CancellationToken, inputs: Inputs) {
        let Identity { name, uid, key } = &self.identity;
        let Inputs {
            mut kinds,
            mut adopted,
            mut stored,
        } = inputs;
        let config = &self.config;
        info!(operator = %name, %key, adoption = adopted.is_some(), "tracking components");

        let (mut manager, mut updates) = WatchManager::new(
            self.client.clone(),
            Some(Selector::exists(key)),
            config.watch_backoff,
            token.clone(),
        );
        let publisher = StatusPublisher::new(
            self.client.clone(),
            self.operators.clone(),
            name,
            uid,
            config.status_backoff(),
        );
        let mut reconciler = Reconciler::new(key);
        manager.sync_kinds(&kinds.borrow_and_update());
        if let Some(adopted) = adopted.as_mut() {
            reconciler.set_adopted(adopted.borrow_and_update().clone());
        }
        reconciler.observe_stored(stored.borrow_and_update().clone());
        // starting counts as an update so the selector is published without any kinds
        reconciler.touch();
        let mut schedule = Schedule::new(config.quiescence, config.max_publish_delay, Instant::now());
        schedule.track_dirty(Instant::now(), reconciler.is_dirty());

        loop {
            let settled = reconciler.phase() == Phase::Settled;
            let wake = schedule.next_wake(settled);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                update = updates.recv() => {
                    let Some(Update { kind, change }) = update else { break };
                    match change {
                        Change::Watch(event) => reconciler.apply_labeled(&kind, &event),
                        Change::Stopped => reconciler.drop_kind(&kind),
                    }
                    reconciler.touch();
                    schedule.touched(Instant::now(), reconciler.is_dirty());
                }
                open = maybe_changed(&mut adopted) => {
                    match adopted.as_mut().filter(|_| open) {
                        Some(rx) => {
                            reconciler.set_adopted(rx.borrow_and_update().clone());
                            reconciler.touch();
                            schedule.touched(Instant::now(), reconciler.is_dirty());
                        }
                        None => adopted = None,
                    }
                }
                changed = stored.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    reconciler.observe_stored(stored.borrow_and_update().clone());
                    schedule.track_dirty(Instant::now(), reconciler.is_dirty());
                }
                changed = kinds.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    for kind in manager.sync_kinds(&kinds.borrow_and_update()) {
                        reconciler.drop_kind(&kind);
                    }
                    schedule.track_dirty(Instant::now(), reconciler.is_dirty());
                }
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }

            let now = Instant::now();
            if schedule.is_quiet(now) {
                reconciler.settle();
                schedule.settled();
                schedule.track_dirty(now, reconciler.is_dirty());
            }
            if !schedule.publish_due(now, reconciler.phase() == Phase::Settled) {
                continue;
            }
            let desired = reconciler.desired();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                outcome = publisher.publish(&desired) => outcome,
            };
            match outcome {
                Ok(Outcome::Gone) => {
                    debug!(operator = %name, "operator is gone, stopping");
                    break;
                }
                Ok(outcome) => {
                    trace!(operator = %name, ?outcome, refs = desired.refs.len(), "status current");
                    reconciler.mark_published(desired);
                    schedule.published();
                    schedule.track_dirty(Instant::now(), reconciler.is_dirty());
                }
                Err(err) => {
                    error!(operator = %name, error = %err, "failed to publish status, will retry");
                    schedule.failed(Instant::now(), config.retry_after);
                }
            }
        }
        debug!(operator = %name, "stopped tracking components");
    }
}
