//! Watch streams feeding the controller.
//!
//! One stream per resource kind. Each stream keeps a `uid -> object` cache so
//! that raw watcher events can be turned into add/update/delete calls; a
//! re-list is diffed against the cache so nothing is missed across
//! reconnects. Handler errors are fatal and bubble out of the stream loop.

use crate::metrics::Metrics;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Resource;
use rampart_npc::NetworkPolicyController;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Routes events for one resource kind to the controller.
pub trait EventHandler<K> {
    const KIND: &'static str;

    fn add(&self, npc: &NetworkPolicyController, obj: &K) -> rampart_core::Result<()>;
    fn update(&self, npc: &NetworkPolicyController, old: &K, new: &K) -> rampart_core::Result<()>;
    fn delete(&self, npc: &NetworkPolicyController, obj: &K) -> rampart_core::Result<()>;
}

pub struct NamespaceHandler;

impl EventHandler<Namespace> for NamespaceHandler {
    const KIND: &'static str = "namespace";

    fn add(&self, npc: &NetworkPolicyController, obj: &Namespace) -> rampart_core::Result<()> {
        npc.add_namespace(obj)
    }

    fn update(
        &self,
        npc: &NetworkPolicyController,
        old: &Namespace,
        new: &Namespace,
    ) -> rampart_core::Result<()> {
        npc.update_namespace(old, new)
    }

    fn delete(&self, npc: &NetworkPolicyController, obj: &Namespace) -> rampart_core::Result<()> {
        npc.delete_namespace(obj)
    }
}

pub struct PodHandler;

impl EventHandler<Pod> for PodHandler {
    const KIND: &'static str = "pod";

    fn add(&self, npc: &NetworkPolicyController, obj: &Pod) -> rampart_core::Result<()> {
        npc.add_pod(obj)
    }

    fn update(
        &self,
        npc: &NetworkPolicyController,
        old: &Pod,
        new: &Pod,
    ) -> rampart_core::Result<()> {
        npc.update_pod(old, new)
    }

    fn delete(&self, npc: &NetworkPolicyController, obj: &Pod) -> rampart_core::Result<()> {
        npc.delete_pod(obj)
    }
}

pub struct PolicyHandler;

impl EventHandler<NetworkPolicy> for PolicyHandler {
    const KIND: &'static str = "networkpolicy";

    fn add(&self, npc: &NetworkPolicyController, obj: &NetworkPolicy) -> rampart_core::Result<()> {
        npc.add_network_policy(obj)
    }

    fn update(
        &self,
        npc: &NetworkPolicyController,
        old: &NetworkPolicy,
        new: &NetworkPolicy,
    ) -> rampart_core::Result<()> {
        npc.update_network_policy(old, new)
    }

    fn delete(
        &self,
        npc: &NetworkPolicyController,
        obj: &NetworkPolicy,
    ) -> rampart_core::Result<()> {
        npc.delete_network_policy(obj)
    }
}

/// Watch one resource kind until the stream dies.
///
/// Watch transport errors are retried by the watcher and only logged here;
/// controller errors abort the loop.
pub async fn watch_resource<K, H>(
    api: Api<K>,
    npc: Arc<NetworkPolicyController>,
    handler: H,
) -> anyhow::Result<()>
where
    K: Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + 'static,
    H: EventHandler<K>,
{
    let mut cache: HashMap<String, K> = HashMap::new();
    let mut stream = watcher(api, watcher::Config::default()).boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => apply_event(&npc, &handler, &mut cache, event)?,
            Err(e) => warn!(kind = H::KIND, "watch error: {}", e),
        }
    }

    anyhow::bail!("{} watch stream ended", H::KIND)
}

fn cache_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    let meta = obj.meta();
    meta.uid.clone().unwrap_or_else(|| {
        format!(
            "{}/{}",
            meta.namespace.as_deref().unwrap_or(""),
            meta.name.as_deref().unwrap_or("")
        )
    })
}

fn observed<F>(kind: &'static str, op: &'static str, f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> rampart_core::Result<()>,
{
    let start = Instant::now();
    match f() {
        Ok(()) => {
            Metrics::global().record_event(kind, op, start.elapsed().as_secs_f64());
            Ok(())
        }
        Err(e) => {
            Metrics::global().record_error(kind, op);
            Err(e.into())
        }
    }
}

fn apply_event<K, H>(
    npc: &NetworkPolicyController,
    handler: &H,
    cache: &mut HashMap<String, K>,
    event: watcher::Event<K>,
) -> anyhow::Result<()>
where
    K: Resource<DynamicType = ()> + Clone,
    H: EventHandler<K>,
{
    match event {
        watcher::Event::Applied(obj) => {
            let key = cache_key(&obj);
            match cache.insert(key, obj.clone()) {
                Some(old) => observed(H::KIND, "update", || handler.update(npc, &old, &obj)),
                None => observed(H::KIND, "add", || handler.add(npc, &obj)),
            }
        }
        watcher::Event::Deleted(obj) => {
            let key = cache_key(&obj);
            cache.remove(&key);
            observed(H::KIND, "delete", || handler.delete(npc, &obj))
        }
        watcher::Event::Restarted(objects) => {
            // Full re-list after (re)connect: diff against what we believe
            // exists so missed deletions are applied too.
            let mut seen = HashSet::new();
            for obj in objects {
                let key = cache_key(&obj);
                seen.insert(key.clone());
                match cache.insert(key, obj.clone()) {
                    Some(old) => {
                        observed(H::KIND, "update", || handler.update(npc, &old, &obj))?;
                    }
                    None => observed(H::KIND, "add", || handler.add(npc, &obj))?,
                }
            }

            let stale: Vec<String> = cache
                .keys()
                .filter(|key| !seen.contains(*key))
                .cloned()
                .collect();
            for key in stale {
                if let Some(old) = cache.remove(&key) {
                    observed(H::KIND, "delete", || handler.delete(npc, &old))?;
                }
            }
            Ok(())
        }
    }
}
