//! Waits for objects to reach desired states
use std::{future::Future, time::Duration};

use aggregator_client::ClusterClient;
use futures::{pin_mut, StreamExt};
use kube::{
    core::{ApiResource, DynamicObject},
    runtime::{utils::StreamBackoff, watcher::DefaultBackoff},
};
use thiserror::Error;
use tracing::trace;

use crate::watcher::{self, watcher, Event};

#[doc(no_inline)]
pub use kube::runtime::wait::Condition;

/// Errors from waiting on a condition
#[derive(Error, Debug)]
pub enum Error {
    /// The resource cannot be watched
    #[error("failed to watch for the condition: {0}")]
    WatchFailed(#[source] watcher::Error),
    /// The condition did not hold in time
    #[error("condition not fulfilled within {0:?}")]
    Timeout(Duration),
}

fn is_target(obj: &DynamicObject, namespace: Option<&str>, name: &str) -> bool {
    obj.metadata.name.as_deref() == Some(name) && obj.metadata.namespace.as_deref() == namespace
}

/// Watch an object, and wait for some condition `cond` to return `true`
///
/// `cond` is passed `Some` if the object is found, otherwise `None`. Returns
/// the object as it was when the condition first held.
///
/// # Caveats
///
/// Keep in mind that the condition is typically fulfilled by another
/// component, which might never do so. `await_condition` does *not* add a
/// timeout; use [`await_within`] for a bounded wait.
///
/// # Errors
///
/// Fails if the kind is not served, or cannot be listed and watched. Transient
/// watch failures are retried with backoff.
///
/// Does *not* fail if the object is not found.
pub async fn await_condition<C: ClusterClient>(
    client: C,
    resource: ApiResource,
    namespace: Option<&str>,
    name: &str,
    cond: impl Condition<DynamicObject>,
) -> Result<Option<DynamicObject>, Error> {
    let stream = StreamBackoff::new(watcher(client, resource, None), DefaultBackoff::default());
    pin_mut!(stream);
    let mut current: Option<DynamicObject> = None;
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Restarted(objs)) => {
                current = objs.into_iter().find(|obj| is_target(obj, namespace, name));
            }
            Ok(Event::Applied(obj)) if is_target(&obj, namespace, name) => current = Some(obj),
            Ok(Event::Deleted(obj)) if is_target(&obj, namespace, name) => current = None,
            Ok(_) => continue,
            Err(err) if err.is_unavailable() => return Err(Error::WatchFailed(err)),
            Err(err) => {
                trace!(error = %err, "watch for condition failed, retrying");
                continue;
            }
        }
        if cond.matches_object(current.as_ref()) {
            return Ok(current);
        }
    }
    Ok(current)
}

/// Bound a wait such as [`await_condition`] by `timeout`
///
/// ```no_run
/// use aggregator_client::KubeClient;
/// use aggregator_core::Operator;
/// use aggregator_runtime::wait::{await_condition, await_within, conditions};
/// use kube::core::ApiResource;
/// use std::time::Duration;
///
/// # async fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
/// let client = KubeClient::try_default().await?;
/// let operators = ApiResource::erase::<Operator>(&());
/// let wait = await_condition(client, operators, None, "etcd", conditions::has_components());
/// let operator = await_within(Duration::from_secs(10), wait).await?;
/// # Ok(())
/// # }
/// ```
pub async fn await_within<T>(
    timeout: Duration,
    wait: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

/// Common conditions to wait for
pub mod conditions {
    use std::collections::BTreeSet;

    use aggregator_core::ComponentRef;
    #[doc(no_inline)]
    pub use aggregator_core::components_of;
    use kube::core::DynamicObject;
    #[doc(no_inline)]
    pub use kube::runtime::wait::conditions::is_deleted;

    use super::Condition;

    fn refs_of(obj: Option<&DynamicObject>) -> Option<BTreeSet<ComponentRef>> {
        let components = components_of(obj?)?;
        Some(components.refs.into_iter().map(|r| r.reference).collect())
    }

    /// Holds once any components have been published
    #[must_use]
    pub fn has_components() -> impl Condition<DynamicObject> {
        |obj: Option<&DynamicObject>| obj.and_then(components_of).is_some()
    }

    /// Holds once the published selector requires `key`
    #[must_use]
    pub fn has_component_selector(key: &str) -> impl Condition<DynamicObject> + '_ {
        move |obj: Option<&DynamicObject>| {
            obj.and_then(components_of)
                .is_some_and(|c| c.label_selector.requires_key(key))
        }
    }

    /// Holds while the published components include `reference`
    #[must_use]
    pub fn references(reference: ComponentRef) -> impl Condition<DynamicObject> {
        move |obj: Option<&DynamicObject>| refs_of(obj).is_some_and(|refs| refs.contains(&reference))
    }

    /// Holds while the published components are exactly `expected`
    #[must_use]
    pub fn references_exactly(expected: impl IntoIterator<Item = ComponentRef>) -> impl Condition<DynamicObject> {
        let expected = expected.into_iter().collect::<BTreeSet<_>>();
        move |obj: Option<&DynamicObject>| refs_of(obj).as_ref() == Some(&expected)
    }
}
