//! Ingress rule specifications and the reference-counted rule set.

use crate::selector::Selector;
use crate::INGRESS_CHAIN;
use rampart_core::Result;
use rampart_iptables::{Iptables, RulePosition, Table};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// The canonical iptables argument vector for one ingress accept rule.
///
/// Arguments are assembled in a fixed order so that equal rules always
/// produce equal keys: protocol, source match-set, destination match-set,
/// destination port, accept verdict. Absent fields contribute nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    key: String,
    args: Vec<String>,
}

impl RuleSpec {
    pub fn new(
        proto: Option<&str>,
        src: Option<&Selector>,
        dst: Option<&Selector>,
        dport: Option<&str>,
    ) -> Self {
        let mut args: Vec<String> = Vec::new();
        if let Some(proto) = proto {
            args.push("-p".to_string());
            args.push(proto.to_string());
        }
        if let Some(src) = src {
            args.extend(
                ["-m", "set", "--match-set", src.ipset_name().as_str(), "src"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        if let Some(dst) = dst {
            args.extend(
                ["-m", "set", "--match-set", dst.ipset_name().as_str(), "dst"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        if let Some(dport) = dport {
            args.push("--dport".to_string());
            args.push(dport.to_string());
        }
        args.push("-j".to_string());
        args.push("ACCEPT".to_string());

        let key = args.join(" ");
        Self { key, args }
    }

    /// The argument vector joined by single spaces; equal keys denote the
    /// same rule.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Reference-counted set of ingress rules, keeping exactly one kernel rule
/// per distinct rule key regardless of how many policies produce it.
pub struct RuleSet {
    ipt: Arc<dyn Iptables>,
    users: HashMap<String, HashSet<String>>,
    entries: HashMap<String, RuleSpec>,
}

impl RuleSet {
    pub fn new(ipt: Arc<dyn Iptables>) -> Self {
        Self {
            ipt,
            users: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    /// Reference every rule in `desired` that is not in `current` on behalf
    /// of `owner`, appending rules not yet present on the ingress chain.
    pub fn provision_new(
        &mut self,
        owner: &str,
        current: &HashMap<String, RuleSpec>,
        desired: &HashMap<String, RuleSpec>,
    ) -> Result<()> {
        for (key, spec) in desired {
            if current.contains_key(key) {
                continue;
            }
            if !self.entries.contains_key(key) {
                debug!(rule = %key, "appending ingress rule");
                self.ipt
                    .ensure_rule(RulePosition::Append, Table::Filter, INGRESS_CHAIN, spec.args())?;
                self.entries.insert(key.clone(), spec.clone());
            }
            self.users
                .entry(key.clone())
                .or_default()
                .insert(owner.to_string());
        }
        Ok(())
    }

    /// Drop `owner`'s reference to every rule in `current` that is not in
    /// `desired`, deleting rules that lose their last owner.
    pub fn deprovision_unused(
        &mut self,
        owner: &str,
        current: &HashMap<String, RuleSpec>,
        desired: &HashMap<String, RuleSpec>,
    ) -> Result<()> {
        for key in current.keys() {
            if desired.contains_key(key) {
                continue;
            }
            let orphaned = match self.users.get_mut(key) {
                Some(owners) => {
                    owners.remove(owner);
                    owners.is_empty()
                }
                None => false,
            };
            if orphaned {
                if let Some(spec) = self.entries.remove(key) {
                    debug!(rule = %key, "deleting ingress rule");
                    self.ipt
                        .delete_rule(Table::Filter, INGRESS_CHAIN, spec.args())?;
                }
                self.users.remove(key);
            }
        }
        Ok(())
    }
}
