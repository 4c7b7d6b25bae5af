//! In-memory drivers and object builders shared by the integration tests.

use k8s_openapi::api::core::v1::{Namespace, Pod, PodSpec, PodStatus};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use rampart_core::{Error, Result};
use rampart_ipset::{Ipset, IpsetName, IpsetType};
use rampart_iptables::{Chain, Iptables, RulePosition, Table};
use rampart_npc::encode::short_name;
use rampart_npc::{bootstrap, NetworkPolicyController};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Records the ipsets the controller would create in the kernel, enforcing
/// the same constraints the kernel does: no duplicate creates, no operations
/// on unknown sets, no destroying a set still referenced by a `list:set`.
pub struct MockIpset {
    sets: Mutex<BTreeMap<String, (IpsetType, BTreeSet<String>)>>,
}

impl MockIpset {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sets: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.sets.lock().unwrap().keys().cloned().collect()
    }

    pub fn kind(&self, name: &str) -> Option<IpsetType> {
        self.sets.lock().unwrap().get(name).map(|(kind, _)| *kind)
    }

    pub fn entries(&self, name: &str) -> BTreeSet<String> {
        self.sets
            .lock()
            .unwrap()
            .get(name)
            .map(|(_, entries)| entries.clone())
            .unwrap_or_else(|| panic!("ipset {name} does not exist"))
    }

    pub fn dump(&self) -> BTreeMap<String, (IpsetType, BTreeSet<String>)> {
        self.sets.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.lock().unwrap().is_empty()
    }
}

impl Ipset for MockIpset {
    fn create(&self, name: &IpsetName, kind: IpsetType) -> Result<()> {
        let mut sets = self.sets.lock().unwrap();
        if sets.contains_key(name.as_str()) {
            return Err(Error::Ipset(format!("set {name} already exists")));
        }
        sets.insert(name.as_str().to_string(), (kind, BTreeSet::new()));
        Ok(())
    }

    fn destroy(&self, name: &IpsetName) -> Result<()> {
        let mut sets = self.sets.lock().unwrap();
        if !sets.contains_key(name.as_str()) {
            return Err(Error::Ipset(format!("set {name} does not exist")));
        }
        let referenced = sets.values().any(|(kind, entries)| {
            *kind == IpsetType::ListSet && entries.contains(name.as_str())
        });
        if referenced {
            return Err(Error::Ipset(format!("set {name} is still referenced")));
        }
        sets.remove(name.as_str());
        Ok(())
    }

    fn add_entry(&self, name: &IpsetName, entry: &str) -> Result<()> {
        let mut sets = self.sets.lock().unwrap();
        if let Some((kind, _)) = sets.get(name.as_str()) {
            if *kind == IpsetType::ListSet && !sets.contains_key(entry) {
                return Err(Error::Ipset(format!(
                    "cannot add unknown set {entry} to {name}"
                )));
            }
        } else {
            return Err(Error::Ipset(format!("set {name} does not exist")));
        }
        let Some((_, entries)) = sets.get_mut(name.as_str()) else {
            unreachable!()
        };
        entries.insert(entry.to_string());
        Ok(())
    }

    fn del_entry(&self, name: &IpsetName, entry: &str) -> Result<()> {
        let mut sets = self.sets.lock().unwrap();
        let Some((_, entries)) = sets.get_mut(name.as_str()) else {
            return Err(Error::Ipset(format!("set {name} does not exist")));
        };
        if !entries.remove(entry) {
            return Err(Error::Ipset(format!("entry {entry} not in set {name}")));
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        for (_, entries) in self.sets.lock().unwrap().values_mut() {
            entries.clear();
        }
        Ok(())
    }

    fn destroy_all(&self) -> Result<()> {
        self.sets.lock().unwrap().clear();
        Ok(())
    }
}

/// Records chains as ordered rule vectors.
pub struct MockIptables {
    chains: Mutex<BTreeMap<String, Vec<Vec<String>>>>,
}

impl MockIptables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chains: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn rules(&self, chain: Chain) -> Vec<Vec<String>> {
        self.chains
            .lock()
            .unwrap()
            .get(chain.as_str())
            .cloned()
            .unwrap_or_else(|| panic!("chain {chain} does not exist"))
    }

    pub fn has_rule(&self, chain: Chain, args: &[&str]) -> bool {
        self.rules(chain).iter().any(|rule| rule == args)
    }

    pub fn dump(&self) -> BTreeMap<String, Vec<Vec<String>>> {
        self.chains.lock().unwrap().clone()
    }
}

impl Iptables for MockIptables {
    fn ensure_chain(&self, _table: Table, chain: Chain) -> Result<bool> {
        let mut chains = self.chains.lock().unwrap();
        if chains.contains_key(chain.as_str()) {
            return Ok(false);
        }
        chains.insert(chain.as_str().to_string(), Vec::new());
        Ok(true)
    }

    fn flush_chain(&self, _table: Table, chain: Chain) -> Result<()> {
        let mut chains = self.chains.lock().unwrap();
        match chains.get_mut(chain.as_str()) {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(Error::Iptables(format!("chain {chain} does not exist"))),
        }
    }

    fn ensure_rule(
        &self,
        position: RulePosition,
        _table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<bool> {
        let mut chains = self.chains.lock().unwrap();
        let Some(rules) = chains.get_mut(chain.as_str()) else {
            return Err(Error::Iptables(format!("chain {chain} does not exist")));
        };
        if rules.iter().any(|rule| rule == args) {
            return Ok(false);
        }
        match position {
            RulePosition::Append => rules.push(args.to_vec()),
            RulePosition::Prepend => rules.insert(0, args.to_vec()),
        }
        Ok(true)
    }

    fn delete_rule(&self, _table: Table, chain: Chain, args: &[String]) -> Result<()> {
        let mut chains = self.chains.lock().unwrap();
        let Some(rules) = chains.get_mut(chain.as_str()) else {
            return Err(Error::Iptables(format!("chain {chain} does not exist")));
        };
        match rules.iter().position(|rule| rule == args) {
            Some(index) => {
                rules.remove(index);
                Ok(())
            }
            None => Err(Error::Iptables(format!("no such rule in chain {chain}"))),
        }
    }
}

pub struct Env {
    pub ipt: Arc<MockIptables>,
    pub ips: Arc<MockIpset>,
    pub npc: NetworkPolicyController,
}

/// Fresh mocks with the static chains already reset, as the agent would
/// leave them at startup.
pub fn setup() -> Env {
    let ipt = MockIptables::new();
    let ips = MockIpset::new();
    bootstrap::reset_iptables(ipt.as_ref(), true).expect("reset iptables");
    bootstrap::reset_ipsets(ips.as_ref()).expect("reset ipsets");

    let dyn_ipt: Arc<dyn Iptables> = ipt.clone();
    let dyn_ips: Arc<dyn Ipset> = ips.clone();
    let npc = NetworkPolicyController::new(dyn_ipt, dyn_ips);
    Env { ipt, ips, npc }
}

// ---- object builders ----

fn label_map(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    if pairs.is_empty() {
        None
    } else {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

pub fn label_selector(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: label_map(pairs),
        ..Default::default()
    }
}

pub fn mk_namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("ns-{name}")),
            labels: label_map(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn with_isolation_annotation(mut namespace: Namespace, value: &str) -> Namespace {
    namespace.metadata.annotations = Some(BTreeMap::from([(
        "net.beta.kubernetes.io/network-policy".to_string(),
        value.to_string(),
    )]));
    namespace
}

pub fn mk_pod(namespace: &str, name: &str, ip: Option<&str>, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("pod-{namespace}-{name}")),
            labels: label_map(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: ip.map(|ip| ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mk_host_network_pod(
    namespace: &str,
    name: &str,
    ip: Option<&str>,
    labels: &[(&str, &str)],
) -> Pod {
    let mut pod = mk_pod(namespace, name, ip, labels);
    pod.spec = Some(PodSpec {
        host_network: Some(true),
        ..Default::default()
    });
    pod
}

pub fn pods_peer(pairs: &[(&str, &str)]) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(label_selector(pairs)),
        ..Default::default()
    }
}

pub fn namespaces_peer(pairs: &[(&str, &str)]) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(label_selector(pairs)),
        ..Default::default()
    }
}

pub fn tcp_port(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some("TCP".to_string()),
        port: Some(IntOrString::Int(port)),
        end_port: None,
    }
}

pub fn ingress_rule(
    from: Option<Vec<NetworkPolicyPeer>>,
    ports: Option<Vec<NetworkPolicyPort>>,
) -> NetworkPolicyIngressRule {
    NetworkPolicyIngressRule { from, ports }
}

pub fn mk_policy(
    namespace: &str,
    name: &str,
    pod_selector: &[(&str, &str)],
    ingress: Vec<NetworkPolicyIngressRule>,
) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("np-{namespace}-{name}")),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: label_selector(pod_selector),
            ingress: Some(ingress),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ---- expected kernel names ----

/// Name of a namespace's members ipset.
pub fn members_name(namespace: &str) -> String {
    format!("weave-{}", short_name(namespace))
}

/// Name of the ipset realising a pod selector in a namespace.
pub fn pod_selector_name(namespace: &str, key: &str) -> String {
    format!("weave-{}", short_name(&format!("{namespace}:{key}")))
}

/// Name of the ipset realising a cluster-wide namespace selector.
pub fn ns_selector_name(key: &str) -> String {
    format!("weave-{}", short_name(&format!(":{key}")))
}
