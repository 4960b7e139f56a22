//! Writes the aggregated components into an operator's status
use aggregator_client::ClusterClient;
use aggregator_core::Components;
use backon::{ExponentialBuilder, Retryable};
use kube::core::{ApiResource, DynamicObject};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from publishing status
#[derive(Error, Debug)]
pub enum Error {
    /// The cluster rejected a read or write
    #[error("failed to write operator status: {0}")]
    Client(#[from] aggregator_client::Error),
    /// The components could not be serialized
    #[error("failed to serialize components: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl Error {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Client(err) if err.is_conflict())
    }
}

/// How a publish ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The status was written
    Published,
    /// The status already held the components
    Unchanged,
    /// The operator no longer exists, or was recreated under a new uid
    Gone,
}

/// Read-modify-write of `status.components` on one operator
#[derive(Clone)]
pub struct StatusPublisher<C> {
    client: C,
    resource: ApiResource,
    name: String,
    uid: String,
    backoff: ExponentialBuilder,
}

impl<C: ClusterClient> StatusPublisher<C> {
    /// Publish to the operator `name` with `uid`
    ///
    /// `backoff` bounds the attempts made on write conflicts.
    pub fn new(client: C, resource: ApiResource, name: &str, uid: &str, backoff: ExponentialBuilder) -> Self {
        Self {
            client,
            resource,
            name: name.to_string(),
            uid: uid.to_string(),
            backoff,
        }
    }

    /// Make the stored status hold `desired`
    ///
    /// Conflicting writes are retried after re-reading, until the backoff runs
    /// out and the last conflict is returned.
    pub async fn publish(&self, desired: &Components) -> Result<Outcome, Error> {
        let desired = serde_json::to_value(desired).map_err(Error::Serialize)?;
        let outcome = (|| self.try_publish(&desired))
            .retry(self.backoff)
            .sleep(tokio::time::sleep)
            .when(Error::is_conflict)
            .notify(|err, after| {
                warn!(operator = %self.name, error = %err, ?after, "status write conflicted, retrying");
            })
            .await?;
        debug!(operator = %self.name, ?outcome, "published components");
        Ok(outcome)
    }

    async fn try_publish(&self, desired: &Value) -> Result<Outcome, Error> {
        let Some(mut current) = self.client.get(&self.resource, None, &self.name).await? else {
            return Ok(Outcome::Gone);
        };
        if current.metadata.uid.as_deref() != Some(self.uid.as_str()) {
            return Ok(Outcome::Gone);
        }
        if stored_components(&current) == Some(desired) {
            return Ok(Outcome::Unchanged);
        }
        set_components(&mut current, desired.clone());
        match self.client.replace_status(&self.resource, &current).await {
            Ok(_) => Ok(Outcome::Published),
            Err(err) if err.is_not_found() => Ok(Outcome::Gone),
            Err(err) => Err(err.into()),
        }
    }
}

fn stored_components(obj: &DynamicObject) -> Option<&Value> {
    obj.data.pointer("/status/components")
}

// Replaces only `status.components`, keeping any other status fields
fn set_components(obj: &mut DynamicObject, components: Value) {
    if !obj.data.is_object() {
        obj.data = json!({});
    }
    match obj.data.get_mut("status").and_then(Value::as_object_mut) {
        Some(status) => {
            status.insert("components".into(), components);
        }
        None => obj.data["status"] = json!({ "components": components }),
    }
}
