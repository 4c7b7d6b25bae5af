//! Top-level event dispatcher.
//!
//! Serialises every mutation behind one process-wide mutex, routes events to
//! the namespace scope they belong to, and owns the cross-namespace
//! namespace-selector registry. Scopes are created lazily on first mention
//! and destroyed as soon as they hold nothing.

use crate::namespace::{NamespaceView, NsScope};
use crate::selector::SelectorSet;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rampart_core::{Error, Result};
use rampart_ipset::Ipset;
use rampart_iptables::Iptables;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub struct NetworkPolicyController {
    inner: Mutex<Inner>,
}

struct Inner {
    nss: HashMap<String, NsScope>,
    ns_selectors: SelectorSet,
    ipset: Arc<dyn Ipset>,
    ipt: Arc<dyn Iptables>,
}

fn object_namespace(meta: &ObjectMeta) -> Result<&str> {
    meta.namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Error::Invariant(format!("object {:?} has no namespace", meta.name)))
}

fn namespace_name(meta: &ObjectMeta) -> Result<&str> {
    meta.name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::Invariant("namespace object has no name".to_string()))
}

fn object_name(meta: &ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or("<unnamed>")
}

impl NetworkPolicyController {
    pub fn new(ipt: Arc<dyn Iptables>, ipset: Arc<dyn Ipset>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nss: HashMap::new(),
                ns_selectors: SelectorSet::new(ipset.clone()),
                ipset,
                ipt,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_namespace(&self, obj: &Namespace) -> Result<()> {
        let name = namespace_name(&obj.metadata)?;
        info!(namespace = name, "adding namespace");
        self.lock()
            .with_ns(name, |ns, registry, _| ns.add_namespace(obj, registry))
    }

    pub fn update_namespace(&self, old: &Namespace, new: &Namespace) -> Result<()> {
        let name = namespace_name(&old.metadata)?;
        info!(namespace = name, "updating namespace");
        self.lock()
            .with_ns(name, |ns, registry, _| ns.update_namespace(old, new, registry))
    }

    pub fn delete_namespace(&self, obj: &Namespace) -> Result<()> {
        let name = namespace_name(&obj.metadata)?;
        info!(namespace = name, "deleting namespace");
        self.lock()
            .with_ns(name, |ns, registry, _| ns.delete_namespace(obj, registry))
    }

    pub fn add_pod(&self, obj: &Pod) -> Result<()> {
        let namespace = object_namespace(&obj.metadata)?;
        debug!(namespace, pod = object_name(&obj.metadata), "adding pod");
        self.lock().with_ns(namespace, |ns, _, _| ns.add_pod(obj))
    }

    pub fn update_pod(&self, old: &Pod, new: &Pod) -> Result<()> {
        let namespace = object_namespace(&old.metadata)?;
        debug!(namespace, pod = object_name(&old.metadata), "updating pod");
        self.lock()
            .with_ns(namespace, |ns, _, _| ns.update_pod(old, new))
    }

    pub fn delete_pod(&self, obj: &Pod) -> Result<()> {
        let namespace = object_namespace(&obj.metadata)?;
        debug!(namespace, pod = object_name(&obj.metadata), "deleting pod");
        self.lock().with_ns(namespace, |ns, _, _| ns.delete_pod(obj))
    }

    pub fn add_network_policy(&self, obj: &NetworkPolicy) -> Result<()> {
        let namespace = object_namespace(&obj.metadata)?;
        info!(
            namespace,
            policy = object_name(&obj.metadata),
            "adding network policy"
        );
        self.lock().with_ns(namespace, |ns, registry, views| {
            ns.add_network_policy(obj, registry, views)
        })
    }

    pub fn update_network_policy(&self, old: &NetworkPolicy, new: &NetworkPolicy) -> Result<()> {
        let namespace = object_namespace(&old.metadata)?;
        info!(
            namespace,
            policy = object_name(&old.metadata),
            "updating network policy"
        );
        self.lock().with_ns(namespace, |ns, registry, views| {
            ns.update_network_policy(old, new, registry, views)
        })
    }

    pub fn delete_network_policy(&self, obj: &NetworkPolicy) -> Result<()> {
        let namespace = object_namespace(&obj.metadata)?;
        info!(
            namespace,
            policy = object_name(&obj.metadata),
            "deleting network policy"
        );
        self.lock().with_ns(namespace, |ns, registry, _| {
            ns.delete_network_policy(obj, registry)
        })
    }
}

impl Inner {
    /// Run `f` against the scope for `name`, creating the scope (and its
    /// members ipset) if this is the first mention of the namespace and
    /// tearing it down if it holds nothing afterwards.
    ///
    /// `f` also receives the namespace-selector registry and a snapshot of
    /// every namespace with a live namespace object, for back-filling newly
    /// created namespace selectors.
    fn with_ns<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut NsScope, &mut SelectorSet, &[NamespaceView]) -> Result<()>,
    {
        let mut scope = match self.nss.remove(name) {
            Some(scope) => scope,
            None => NsScope::new(name, self.ipset.clone(), self.ipt.clone())?,
        };

        let mut views: Vec<NamespaceView> =
            self.nss.values().filter_map(NsScope::view).collect();
        views.extend(scope.view());

        match f(&mut scope, &mut self.ns_selectors, &views) {
            Ok(()) => {
                if scope.is_empty() {
                    debug!(namespace = name, "namespace scope is empty, destroying");
                    scope.destroy()?;
                } else {
                    self.nss.insert(name.to_string(), scope);
                }
                Ok(())
            }
            Err(e) => {
                self.nss.insert(name.to_string(), scope);
                Err(e)
            }
        }
    }
}
