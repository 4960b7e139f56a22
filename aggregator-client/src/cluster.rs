use aggregator_core::Selector;
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, ObjectList, WatchEvent};

use crate::Result;

/// Ordered stream of raw watch events for one resource
pub type WatchStream = BoxStream<'static, Result<WatchEvent<DynamicObject>>>;

/// The operations the aggregator needs from a cluster
///
/// Every call is against all namespaces: kinds are listed and watched cluster
/// wide, and single objects are addressed by their (optional) namespace.
#[async_trait]
pub trait ClusterClient: Clone + Send + Sync + 'static {
    /// Resolve a kind into the resource serving it
    ///
    /// Fails with an unavailable error when the kind is not served.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource>;

    /// Every listable and watchable resource the cluster serves
    async fn discover(&self) -> Result<Vec<ApiResource>>;

    /// Snapshot the objects of a resource
    ///
    /// The list metadata carries the resource version to resume watching from.
    async fn list(&self, resource: &ApiResource, selector: Option<&Selector>)
        -> Result<ObjectList<DynamicObject>>;

    /// Watch a resource for changes after `resource_version`
    ///
    /// An expired `resource_version` surfaces as a `410` error event. The
    /// stream ends when the server times the watch out.
    async fn watch(
        &self,
        resource: &ApiResource,
        selector: Option<&Selector>,
        resource_version: &str,
    ) -> Result<WatchStream>;

    /// Read a single object, `None` when it does not exist
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object
    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace the status of an object
    ///
    /// The object's `resourceVersion` is a precondition; a stale one fails
    /// with a `409` conflict.
    async fn replace_status(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;
}
