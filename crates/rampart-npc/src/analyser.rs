//! Decomposition of one NetworkPolicy into selectors and ingress rules.
//!
//! The analyser is pure: it compiles selectors and assembles rule argument
//! vectors but allocates no kernel resources and performs no I/O.

use crate::rule::RuleSpec;
use crate::selector::Selector;
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use rampart_core::Result;
use rampart_ipset::IpsetType;
use std::collections::HashMap;

/// Everything one policy asks of the kernel: ingress rules, namespace
/// selectors, and pod selectors, each keyed by its deduplication key.
#[derive(Debug, Default)]
pub struct PolicyAnalysis {
    pub rules: HashMap<String, RuleSpec>,
    pub ns_selectors: HashMap<String, Selector>,
    pub pod_selectors: HashMap<String, Selector>,
}

/// Analyse `policy` in `namespace` following Kubernetes v1 ingress
/// semantics.
///
/// A rule whose `from` or `ports` list is present but empty matches no
/// traffic and produces nothing; an absent `from` leaves the source
/// unrestricted; an absent `ports` leaves protocol and port unrestricted.
/// Peers carrying only an `ipBlock` are skipped (CIDR sources are not
/// realised through ipsets).
pub fn analyse_policy(namespace: &str, policy: &NetworkPolicy) -> Result<PolicyAnalysis> {
    let mut analysis = PolicyAnalysis::default();

    let Some(spec) = &policy.spec else {
        return Ok(analysis);
    };

    let dst = Selector::new(&spec.pod_selector, namespace, IpsetType::HashIp)?;
    analysis
        .pod_selectors
        .insert(dst.key().to_string(), dst.clone());

    for ingress in spec.ingress.as_deref().unwrap_or_default() {
        if matches!(&ingress.ports, Some(ports) if ports.is_empty())
            || matches!(&ingress.from, Some(from) if from.is_empty())
        {
            continue;
        }

        match &ingress.from {
            None => emit_rules(&mut analysis.rules, &ingress.ports, None, &dst),
            Some(peers) => {
                for peer in peers {
                    let src = if let Some(pod_selector) = &peer.pod_selector {
                        Selector::new(pod_selector, namespace, IpsetType::HashIp)?
                    } else if let Some(ns_selector) = &peer.namespace_selector {
                        Selector::new(ns_selector, "", IpsetType::ListSet)?
                    } else {
                        continue;
                    };

                    match src.ipset_type() {
                        IpsetType::HashIp => analysis
                            .pod_selectors
                            .insert(src.key().to_string(), src.clone()),
                        IpsetType::ListSet => analysis
                            .ns_selectors
                            .insert(src.key().to_string(), src.clone()),
                    };

                    emit_rules(&mut analysis.rules, &ingress.ports, Some(&src), &dst);
                }
            }
        }
    }

    Ok(analysis)
}

fn emit_rules(
    rules: &mut HashMap<String, RuleSpec>,
    ports: &Option<Vec<NetworkPolicyPort>>,
    src: Option<&Selector>,
    dst: &Selector,
) {
    match ports {
        None => {
            let spec = RuleSpec::new(None, src, Some(dst), None);
            rules.insert(spec.key().to_string(), spec);
        }
        Some(entries) => {
            for port in entries {
                let (proto, dport) = normalise_port(port);
                let spec = RuleSpec::new(Some(&proto), src, Some(dst), Some(&dport));
                rules.insert(spec.key().to_string(), spec);
            }
        }
    }
}

/// Protocol defaults to TCP; an absent port means the whole range. Integer
/// ports are rendered in decimal, named ports pass through for iptables to
/// resolve.
fn normalise_port(port: &NetworkPolicyPort) -> (String, String) {
    let proto = port
        .protocol
        .clone()
        .unwrap_or_else(|| "TCP".to_string());
    let dport = match &port.port {
        None => "0:65535".to_string(),
        Some(IntOrString::Int(n)) => n.to_string(),
        Some(IntOrString::String(name)) => name.clone(),
    };
    (proto, dport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        IPBlock, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;

    fn label_selector(key: &str, value: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    fn policy(
        pod_selector: LabelSelector,
        ingress: Option<Vec<NetworkPolicyIngressRule>>,
    ) -> NetworkPolicy {
        NetworkPolicy {
            spec: Some(NetworkPolicySpec {
                pod_selector,
                ingress,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn port(protocol: Option<&str>, port: Option<IntOrString>) -> NetworkPolicyPort {
        NetworkPolicyPort {
            protocol: protocol.map(|p| p.to_string()),
            port,
            end_port: None,
        }
    }

    #[test]
    fn test_destination_selector_is_always_emitted() {
        let analysis = analyse_policy("prod", &policy(label_selector("app", "web"), None)).unwrap();
        assert_eq!(analysis.pod_selectors.len(), 1);
        assert!(analysis.pod_selectors.contains_key("app=web"));
        assert!(analysis.rules.is_empty());
        assert!(analysis.ns_selectors.is_empty());
    }

    #[test]
    fn test_peer_and_port() {
        let rule = NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                pod_selector: Some(label_selector("app", "client")),
                ..Default::default()
            }]),
            ports: Some(vec![port(Some("TCP"), Some(IntOrString::Int(80)))]),
        };
        let analysis =
            analyse_policy("prod", &policy(label_selector("app", "web"), Some(vec![rule])))
                .unwrap();

        assert_eq!(analysis.pod_selectors.len(), 2);
        assert_eq!(analysis.rules.len(), 1);

        let src = &analysis.pod_selectors["app=client"];
        let dst = &analysis.pod_selectors["app=web"];
        let key = format!(
            "-p TCP -m set --match-set {} src -m set --match-set {} dst --dport 80 -j ACCEPT",
            src.ipset_name(),
            dst.ipset_name()
        );
        assert!(analysis.rules.contains_key(key.as_str()), "missing {key}");
    }

    #[test]
    fn test_absent_from_is_source_unrestricted() {
        let rule = NetworkPolicyIngressRule {
            from: None,
            ports: None,
        };
        let analysis =
            analyse_policy("prod", &policy(label_selector("app", "web"), Some(vec![rule])))
                .unwrap();

        assert_eq!(analysis.rules.len(), 1);
        let dst = &analysis.pod_selectors["app=web"];
        let key = format!("-m set --match-set {} dst -j ACCEPT", dst.ipset_name());
        assert!(analysis.rules.contains_key(key.as_str()));
    }

    #[test]
    fn test_empty_from_or_ports_matches_nothing() {
        let empty_from = NetworkPolicyIngressRule {
            from: Some(Vec::new()),
            ports: None,
        };
        let empty_ports = NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                pod_selector: Some(label_selector("app", "client")),
                ..Default::default()
            }]),
            ports: Some(Vec::new()),
        };
        let analysis = analyse_policy(
            "prod",
            &policy(label_selector("app", "web"), Some(vec![empty_from, empty_ports])),
        )
        .unwrap();

        assert!(analysis.rules.is_empty());
        // only the destination selector remains
        assert_eq!(analysis.pod_selectors.len(), 1);
    }

    #[test]
    fn test_namespace_selector_peer() {
        let rule = NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                namespace_selector: Some(label_selector("env", "prod")),
                ..Default::default()
            }]),
            ports: None,
        };
        let analysis =
            analyse_policy("prod", &policy(label_selector("app", "web"), Some(vec![rule])))
                .unwrap();

        assert_eq!(analysis.ns_selectors.len(), 1);
        let src = &analysis.ns_selectors["env=prod"];
        assert_eq!(src.ipset_type(), IpsetType::ListSet);
        assert_eq!(analysis.rules.len(), 1);
    }

    #[test]
    fn test_ip_block_peer_is_skipped() {
        let rule = NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                ip_block: Some(IPBlock {
                    cidr: "10.0.0.0/8".to_string(),
                    except: None,
                }),
                ..Default::default()
            }]),
            ports: None,
        };
        let analysis =
            analyse_policy("prod", &policy(label_selector("app", "web"), Some(vec![rule])))
                .unwrap();

        assert!(analysis.rules.is_empty());
        assert!(analysis.ns_selectors.is_empty());
        assert_eq!(analysis.pod_selectors.len(), 1);
    }

    #[test]
    fn test_port_normalisation() {
        let rule = NetworkPolicyIngressRule {
            from: None,
            ports: Some(vec![
                port(None, Some(IntOrString::Int(8080))),
                port(Some("UDP"), None),
                port(Some("TCP"), Some(IntOrString::String("metrics".to_string()))),
            ]),
        };
        let analysis =
            analyse_policy("prod", &policy(label_selector("app", "web"), Some(vec![rule])))
                .unwrap();

        let dst = analysis.pod_selectors["app=web"].ipset_name().to_string();
        for expected in [
            format!("-p TCP -m set --match-set {dst} dst --dport 8080 -j ACCEPT"),
            format!("-p UDP -m set --match-set {dst} dst --dport 0:65535 -j ACCEPT"),
            format!("-p TCP -m set --match-set {dst} dst --dport metrics -j ACCEPT"),
        ] {
            assert!(
                analysis.rules.contains_key(expected.as_str()),
                "missing {expected}"
            );
        }
        assert_eq!(analysis.rules.len(), 3);
    }

    #[test]
    fn test_identical_peers_deduplicate() {
        let peer = NetworkPolicyPeer {
            pod_selector: Some(label_selector("app", "client")),
            ..Default::default()
        };
        let rule = NetworkPolicyIngressRule {
            from: Some(vec![peer.clone(), peer]),
            ports: None,
        };
        let analysis =
            analyse_policy("prod", &policy(label_selector("app", "web"), Some(vec![rule])))
                .unwrap();

        assert_eq!(analysis.pod_selectors.len(), 2);
        assert_eq!(analysis.rules.len(), 1);
    }
}
