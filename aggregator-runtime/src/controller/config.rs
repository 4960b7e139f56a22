use std::time::Duration;

use aggregator_core::kinds::default_component_kinds;
use backon::ExponentialBuilder;
use kube::core::GroupVersionKind;

use crate::adoption::AdoptionConfig;

/// Backoff for failing watches
///
/// Starts at 800ms and doubles up to 30s with jitter, retrying forever.
pub(crate) fn default_watch_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(800))
        .with_max_delay(Duration::from_secs(30))
        .with_factor(2.0)
        .with_jitter()
        .without_max_times()
}

/// Which kinds are searched for components
#[derive(Clone, Debug)]
pub enum KindSelection {
    /// Exactly these kinds; unserved ones are skipped until they appear
    Static(Vec<GroupVersionKind>),
    /// Every listable and watchable kind the cluster serves
    Discover,
}

impl Default for KindSelection {
    fn default() -> Self {
        Self::Static(default_component_kinds())
    }
}

/// Settings for the [`Controller`](super::Controller)
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Kinds searched for labeled components and owner references
    pub kinds: KindSelection,
    /// Adoption through owner references, off when `None`
    pub adoption: Option<AdoptionConfig>,
    /// How long an instance must go without updates before it is settled
    pub quiescence: Duration,
    /// Longest a stale status waits under a continuous stream of updates
    pub max_publish_delay: Duration,
    /// Attempts made after a conflicting status write
    pub status_retries: usize,
    /// Wait before publishing again after a failed publish
    pub retry_after: Duration,
    /// Backoff between attempts of a failing component or adoption watch
    pub watch_backoff: ExponentialBuilder,
    /// How often the kind set is re-resolved
    pub kind_refresh_interval: Duration,
    /// Create an operator for every subscription that lacks one
    pub ensure_package_operators: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kinds: KindSelection::default(),
            adoption: Some(AdoptionConfig::default()),
            quiescence: Duration::from_millis(250),
            max_publish_delay: Duration::from_secs(2),
            status_retries: 5,
            retry_after: Duration::from_secs(5),
            watch_backoff: default_watch_backoff(),
            kind_refresh_interval: Duration::from_secs(60),
            ensure_package_operators: false,
        }
    }
}

impl ControllerConfig {
    /// The backoff for retrying conflicting status writes
    pub(crate) fn status_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_secs(2))
            .with_jitter()
            .with_max_times(self.status_retries)
    }

    /// Kinds that must be watched whatever the selection, such as adoption roots
    pub(crate) fn required_kinds(&self) -> Vec<GroupVersionKind> {
        self.adoption
            .as_ref()
            .map(|adoption| adoption.root_kinds.clone())
            .unwrap_or_default()
    }
}
