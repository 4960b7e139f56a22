use aggregator_core::Selector;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, PostParams, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, ObjectList},
    discovery::{self, Discovery},
    Client,
};
use tracing::debug;

use crate::{
    discovery::{select_resources, GroupFilter},
    ClusterClient, Error, Result, WatchStream,
};

// Servers close watches after this long, which resumes from the last cursor
const WATCH_TIMEOUT_SECS: u32 = 290;

/// [`ClusterClient`] backed by a real API server
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    groups: GroupFilter,
}

impl KubeClient {
    /// Wrap a connected kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            groups: GroupFilter::default(),
        }
    }

    /// Restrict which api groups [`ClusterClient::discover`] considers
    #[must_use]
    pub fn with_group_filter(mut self, groups: GroupFilter) -> Self {
        self.groups = groups;
        self
    }

    /// Infer a client from the environment, in-cluster config first
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn scoped(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String)> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Transport("object has no name".into()))?;
        Ok((self.api(resource, obj.metadata.namespace.as_deref()), name))
    }
}

fn list_params(selector: Option<&Selector>) -> ListParams {
    match selector {
        Some(selector) => ListParams::default().labels(&selector.to_selector_string()),
        None => ListParams::default(),
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource> {
        let (ar, _caps) = discovery::pinned_kind(&self.client, gvk).await?;
        Ok(ar)
    }

    async fn discover(&self) -> Result<Vec<ApiResource>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let resources = discovery
            .groups()
            .filter(|group| self.groups.is_queryable(group.name()))
            .flat_map(|group| group.recommended_resources())
            .collect::<Vec<_>>();
        let selected = select_resources(&self.groups, resources);
        debug!(count = selected.len(), "discovered watchable resources");
        Ok(selected)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        selector: Option<&Selector>,
    ) -> Result<ObjectList<DynamicObject>> {
        let api = self.api(resource, None);
        Ok(api.list(&list_params(selector)).await?)
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        selector: Option<&Selector>,
        resource_version: &str,
    ) -> Result<WatchStream> {
        let api = self.api(resource, None);
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(selector) = selector {
            params = params.labels(&selector.to_selector_string());
        }
        let stream = api.watch(&params, resource_version).await?;
        Ok(stream.map_err(Error::from).boxed())
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let (api, _) = self.scoped(resource, obj)?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace_status(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let (api, name) = self.scoped(resource, obj)?;
        let body = serde_json::to_vec(obj)?;
        Ok(api.replace_status(&name, &PostParams::default(), body).await?)
    }
}
