//! [`ClusterLister`] backed by `kube`'s dynamic-object API: lists every
//! object of a `GroupVersionResource`, optionally restricted to a
//! namespace, as identifiers the Folder Reconciler can diff.
//!
//! Discovery resolves a [`GroupVersionResource`] to the `ApiResource` kube
//! needs to build a dynamic `Api` without this crate hardcoding a type per
//! watched kind — the same reason the Admission Handler and Folder
//! Reconciler only ever deal in [`StructuredDocument`] rather than typed
//! Kubernetes structs.
//!
//! `reconcile_and_apply` calls the Folder Reconciler directly on the Branch
//! Worker's own async task, not inside `spawn_blocking`, so `list` can't
//! just `Handle::block_on` — that would deadlock the thread driving it.
//! `block_in_place` hands the blocking wait to another worker thread on the
//! same multi-thread runtime first.

use kube::{
    Client,
    api::{Api, DynamicObject, ListParams},
    discovery::Discovery,
};
use reverser_reconciler::{ClusterLister, ListError, ListedObject};
use reverser_types::{GroupVersionResource, ObjectIdentifier, StructuredDocument};

pub struct KubeClusterLister {
    client: Client,
    handle: tokio::runtime::Handle,
}

impl KubeClusterLister {
    pub fn new(client: Client, handle: tokio::runtime::Handle) -> Self {
        Self { client, handle }
    }

    async fn list_async(&self, gvr: &GroupVersionResource, namespace: Option<&str>) -> Result<Vec<ListedObject>, String> {
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(|e| e.to_string())?;
        let (ar, _caps) = discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .find(|(ar, _)| ar.group == gvr.group && ar.version == gvr.version && ar.plural == gvr.resource)
            .ok_or_else(|| format!("no API resource registered for {}/{}/{}", gvr.group, gvr.version, gvr.resource))?;

        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };

        let list = api.list(&ListParams::default()).await.map_err(|e| e.to_string())?;
        list.items
            .into_iter()
            .map(|obj| {
                let name = obj.metadata.name.clone().ok_or_else(|| "dynamic object has no name".to_string())?;
                let namespace = obj.metadata.namespace.clone();
                let labels = obj.metadata.labels.clone().unwrap_or_default();
                let identifier = match &namespace {
                    Some(ns) => ObjectIdentifier::namespaced(gvr.clone(), ns.clone(), name),
                    None => ObjectIdentifier::cluster_scoped(gvr.clone(), name),
                };
                let value = serde_json::to_value(&obj).map_err(|e| e.to_string())?;
                Ok(ListedObject { identifier, labels, object: StructuredDocument::new(value) })
            })
            .collect()
    }
}

impl ClusterLister for KubeClusterLister {
    fn list(&self, gvr: &GroupVersionResource, namespace: Option<&str>) -> Result<Vec<ListedObject>, ListError> {
        let handle = self.handle.clone();
        tokio::task::block_in_place(|| handle.block_on(self.list_async(gvr, namespace)))
            .map_err(|e| ListError::Backend(gvr.clone(), e))
    }
}
