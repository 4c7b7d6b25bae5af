//! Per-namespace reconciliation scope.
//!
//! One [`NsScope`] bundles everything the controller tracks for a namespace:
//! the last-seen namespace object, its pods and policies, the `hash:ip`
//! members ipset of pod IPs, the namespace-local pod-selector set, and the
//! rule set. All per-namespace reconciliation happens here; the controller
//! only routes events.

use crate::analyser::{analyse_policy, PolicyAnalysis};
use crate::encode::short_name;
use crate::rule::RuleSet;
use crate::selector::SelectorSet;
use crate::{DEFAULT_CHAIN, IPSET_PREFIX};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rampart_core::{Error, Result};
use rampart_ipset::{Ipset, IpsetName, IpsetType};
use rampart_iptables::{Iptables, RulePosition, Table};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Annotation through which a namespace requests default-deny ingress.
pub const ISOLATION_ANNOTATION: &str = "net.beta.kubernetes.io/network-policy";

const DEFAULT_DENY: &str = "DefaultDeny";

#[derive(Deserialize)]
struct IsolationAnnotation {
    ingress: Option<IngressIsolation>,
}

#[derive(Deserialize)]
struct IngressIsolation {
    isolation: Option<String>,
}

/// Whether a namespace admits ingress by default.
///
/// Only an annotation decoding to `{"ingress":{"isolation":"DefaultDeny"}}`
/// turns the bypass off; an absent or undecodable annotation means
/// default-allow.
fn default_allow(meta: &ObjectMeta) -> bool {
    let Some(value) = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(ISOLATION_ANNOTATION))
    else {
        return true;
    };
    match serde_json::from_str::<IsolationAnnotation>(value) {
        Ok(doc) => !matches!(
            doc.ingress.and_then(|i| i.isolation).as_deref(),
            Some(DEFAULT_DENY)
        ),
        Err(_) => true,
    }
}

pub(crate) fn uid(meta: &ObjectMeta) -> Result<String> {
    meta.uid
        .clone()
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| Error::Invariant(format!("object {:?} has no uid", meta.name)))
}

pub(crate) fn labels(meta: &ObjectMeta) -> Option<&BTreeMap<String, String>> {
    meta.labels.as_ref()
}

/// A pod enters ipsets only once it has an IP of its own; host-network pods
/// never do.
fn eligible_ip(pod: &Pod) -> Option<&str> {
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false);
    if host_network {
        return None;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

/// A snapshot of one namespace for namespace-selector back-fill: its labels
/// and the name of its members ipset.
pub(crate) struct NamespaceView {
    pub labels: Option<BTreeMap<String, String>>,
    pub members: IpsetName,
}

pub(crate) struct NsScope {
    name: String,
    namespace: Option<Namespace>,
    pods: HashMap<String, Pod>,
    policies: HashMap<String, NetworkPolicy>,
    members: IpsetName,
    pod_selectors: SelectorSet,
    rules: RuleSet,
    ipset: Arc<dyn Ipset>,
    ipt: Arc<dyn Iptables>,
}

impl NsScope {
    pub(crate) fn new(name: &str, ipset: Arc<dyn Ipset>, ipt: Arc<dyn Iptables>) -> Result<Self> {
        let members = IpsetName::new(format!("{}{}", IPSET_PREFIX, short_name(name)));
        debug!(namespace = name, ipset = %members, "creating namespace members ipset");
        ipset.create(&members, IpsetType::HashIp)?;
        Ok(Self {
            name: name.to_string(),
            namespace: None,
            pods: HashMap::new(),
            policies: HashMap::new(),
            members,
            pod_selectors: SelectorSet::new(ipset.clone()),
            rules: RuleSet::new(ipt.clone()),
            ipset,
            ipt,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pods.is_empty() && self.policies.is_empty() && self.namespace.is_none()
    }

    pub(crate) fn destroy(self) -> Result<()> {
        debug!(namespace = %self.name, ipset = %self.members, "destroying namespace members ipset");
        self.ipset.destroy(&self.members)
    }

    pub(crate) fn view(&self) -> Option<NamespaceView> {
        self.namespace.as_ref().map(|ns| NamespaceView {
            labels: ns.metadata.labels.clone(),
            members: self.members.clone(),
        })
    }

    // ---- pods ----

    pub(crate) fn add_pod(&mut self, obj: &Pod) -> Result<()> {
        let uid = uid(&obj.metadata)?;
        self.pods.insert(uid, obj.clone());

        match eligible_ip(obj) {
            Some(ip) => self.add_to_matching(obj, ip),
            None => Ok(()),
        }
    }

    pub(crate) fn update_pod(&mut self, old: &Pod, new: &Pod) -> Result<()> {
        let old_uid = uid(&old.metadata)?;
        let new_uid = uid(&new.metadata)?;
        self.pods.remove(&old_uid);
        self.pods.insert(new_uid, new.clone());

        match (eligible_ip(old), eligible_ip(new)) {
            (None, None) => Ok(()),
            (Some(old_ip), None) => self.del_from_matching(old, old_ip),
            (None, Some(new_ip)) => self.add_to_matching(new, new_ip),
            (Some(old_ip), Some(new_ip)) => {
                if labels(&old.metadata) == labels(&new.metadata) && old_ip == new_ip {
                    return Ok(());
                }

                if old_ip != new_ip {
                    self.ipset.del_entry(&self.members, old_ip)?;
                    self.ipset.add_entry(&self.members, new_ip)?;
                }

                for sel in self.pod_selectors.selectors() {
                    let old_match = sel.matches(labels(&old.metadata));
                    let new_match = sel.matches(labels(&new.metadata));
                    if old_match == new_match && old_ip == new_ip {
                        continue;
                    }
                    if old_match {
                        self.ipset.del_entry(sel.ipset_name(), old_ip)?;
                    }
                    if new_match {
                        self.ipset.add_entry(sel.ipset_name(), new_ip)?;
                    }
                }
                Ok(())
            }
        }
    }

    pub(crate) fn delete_pod(&mut self, obj: &Pod) -> Result<()> {
        let uid = uid(&obj.metadata)?;
        if self.pods.remove(&uid).is_none() {
            return Err(Error::Invariant(format!(
                "no record of pod {} in namespace {}",
                uid, self.name
            )));
        }

        match eligible_ip(obj) {
            Some(ip) => self.del_from_matching(obj, ip),
            None => Ok(()),
        }
    }

    fn add_to_matching(&self, pod: &Pod, ip: &str) -> Result<()> {
        self.ipset.add_entry(&self.members, ip)?;

        for sel in self.pod_selectors.selectors() {
            if sel.matches(labels(&pod.metadata)) {
                self.ipset.add_entry(sel.ipset_name(), ip)?;
            }
        }
        Ok(())
    }

    fn del_from_matching(&self, pod: &Pod, ip: &str) -> Result<()> {
        self.ipset.del_entry(&self.members, ip)?;

        for sel in self.pod_selectors.selectors() {
            if sel.matches(labels(&pod.metadata)) {
                self.ipset.del_entry(sel.ipset_name(), ip)?;
            }
        }
        Ok(())
    }

    // ---- namespaces ----

    pub(crate) fn add_namespace(
        &mut self,
        obj: &Namespace,
        ns_selectors: &SelectorSet,
    ) -> Result<()> {
        self.namespace = Some(obj.clone());

        if default_allow(&obj.metadata) {
            self.ensure_bypass_rule()?;
        }

        for sel in ns_selectors.selectors() {
            if sel.matches(labels(&obj.metadata)) {
                self.ipset.add_entry(sel.ipset_name(), self.members.as_str())?;
            }
        }
        Ok(())
    }

    pub(crate) fn update_namespace(
        &mut self,
        old: &Namespace,
        new: &Namespace,
        ns_selectors: &SelectorSet,
    ) -> Result<()> {
        self.namespace = Some(new.clone());

        let old_allow = default_allow(&old.metadata);
        let new_allow = default_allow(&new.metadata);
        if old_allow != new_allow {
            if new_allow {
                self.ensure_bypass_rule()?;
            } else {
                self.delete_bypass_rule()?;
            }
        }

        if labels(&old.metadata) != labels(&new.metadata) {
            for sel in ns_selectors.selectors() {
                let old_match = sel.matches(labels(&old.metadata));
                let new_match = sel.matches(labels(&new.metadata));
                if old_match == new_match {
                    continue;
                }
                if old_match {
                    self.ipset.del_entry(sel.ipset_name(), self.members.as_str())?;
                }
                if new_match {
                    self.ipset.add_entry(sel.ipset_name(), self.members.as_str())?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn delete_namespace(
        &mut self,
        obj: &Namespace,
        ns_selectors: &SelectorSet,
    ) -> Result<()> {
        if self.namespace.take().is_none() {
            return Err(Error::Invariant(format!(
                "no record of namespace {}",
                self.name
            )));
        }

        if default_allow(&obj.metadata) {
            self.delete_bypass_rule()?;
        }

        for sel in ns_selectors.selectors() {
            if sel.matches(labels(&obj.metadata)) {
                self.ipset.del_entry(sel.ipset_name(), self.members.as_str())?;
            }
        }
        Ok(())
    }

    fn bypass_args(&self) -> Vec<String> {
        ["-m", "set", "--match-set", self.members.as_str(), "dst", "-j", "ACCEPT"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn ensure_bypass_rule(&self) -> Result<()> {
        debug!(namespace = %self.name, "ensuring default-allow bypass rule");
        self.ipt.ensure_rule(
            RulePosition::Append,
            Table::Filter,
            DEFAULT_CHAIN,
            &self.bypass_args(),
        )?;
        Ok(())
    }

    fn delete_bypass_rule(&self) -> Result<()> {
        debug!(namespace = %self.name, "deleting default-allow bypass rule");
        self.ipt
            .delete_rule(Table::Filter, DEFAULT_CHAIN, &self.bypass_args())
    }

    // ---- network policies ----

    pub(crate) fn add_network_policy(
        &mut self,
        obj: &NetworkPolicy,
        ns_selectors: &mut SelectorSet,
        views: &[NamespaceView],
    ) -> Result<()> {
        let owner = uid(&obj.metadata)?;
        self.policies.insert(owner.clone(), obj.clone());

        let desired = analyse_policy(&self.name, obj)?;
        self.apply_policy_delta(&owner, &PolicyAnalysis::default(), &desired, ns_selectors, views)
    }

    pub(crate) fn update_network_policy(
        &mut self,
        old: &NetworkPolicy,
        new: &NetworkPolicy,
        ns_selectors: &mut SelectorSet,
        views: &[NamespaceView],
    ) -> Result<()> {
        let old_owner = uid(&old.metadata)?;
        let new_owner = uid(&new.metadata)?;

        if old_owner != new_owner {
            // A replaced object, not an update: retire the old policy wholesale.
            self.delete_network_policy(old, ns_selectors)?;
            return self.add_network_policy(new, ns_selectors, views);
        }

        self.policies.insert(new_owner.clone(), new.clone());

        let current = analyse_policy(&self.name, old)?;
        let desired = analyse_policy(&self.name, new)?;
        self.apply_policy_delta(&new_owner, &current, &desired, ns_selectors, views)
    }

    pub(crate) fn delete_network_policy(
        &mut self,
        obj: &NetworkPolicy,
        ns_selectors: &mut SelectorSet,
    ) -> Result<()> {
        let owner = uid(&obj.metadata)?;
        if self.policies.remove(&owner).is_none() {
            return Err(Error::Invariant(format!(
                "no record of network policy {} in namespace {}",
                owner, self.name
            )));
        }

        let current = analyse_policy(&self.name, obj)?;
        self.apply_policy_delta(&owner, &current, &PolicyAnalysis::default(), ns_selectors, &[])
    }

    /// Move the kernel from `current` to `desired` for one policy. Rules are
    /// torn down first and built up last so that no iptables rule ever
    /// references a missing ipset.
    fn apply_policy_delta(
        &mut self,
        owner: &str,
        current: &PolicyAnalysis,
        desired: &PolicyAnalysis,
        ns_selectors: &mut SelectorSet,
        views: &[NamespaceView],
    ) -> Result<()> {
        let Self {
            pods,
            pod_selectors,
            rules,
            ipset,
            ..
        } = self;

        rules.deprovision_unused(owner, &current.rules, &desired.rules)?;
        ns_selectors.deprovision_unused(owner, &current.ns_selectors, &desired.ns_selectors)?;
        pod_selectors.deprovision_unused(owner, &current.pod_selectors, &desired.pod_selectors)?;

        ns_selectors.provision_new(
            owner,
            &current.ns_selectors,
            &desired.ns_selectors,
            |sel| {
                for view in views {
                    if sel.matches(view.labels.as_ref()) {
                        ipset.add_entry(sel.ipset_name(), view.members.as_str())?;
                    }
                }
                Ok(())
            },
        )?;

        pod_selectors.provision_new(
            owner,
            &current.pod_selectors,
            &desired.pod_selectors,
            |sel| {
                for pod in pods.values() {
                    if let Some(ip) = eligible_ip(pod) {
                        if sel.matches(labels(&pod.metadata)) {
                            ipset.add_entry(sel.ipset_name(), ip)?;
                        }
                    }
                }
                Ok(())
            },
        )?;

        rules.provision_new(owner, &current.rules, &desired.rules)
    }
}
