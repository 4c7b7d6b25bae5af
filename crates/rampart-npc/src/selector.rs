//! Selector identity and the reference-counted selector set.

use crate::encode::short_name;
use crate::labels::LabelMatcher;
use crate::IPSET_PREFIX;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use rampart_core::Result;
use rampart_ipset::{Ipset, IpsetName, IpsetType};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A compiled label selector together with the identity of the ipset that
/// realises it.
///
/// Pod selectors are scoped to their namespace and realised as `hash:ip`
/// sets of pod IPs; namespace selectors have an empty scope and are realised
/// as `list:set` sets of namespace members-ipset names. Two selectors with
/// equal key, scope, and type are interchangeable.
#[derive(Debug, Clone)]
pub struct Selector {
    matcher: LabelMatcher,
    ipset_name: IpsetName,
    ipset_type: IpsetType,
}

impl Selector {
    pub fn new(selector: &LabelSelector, scope: &str, ipset_type: IpsetType) -> Result<Self> {
        let matcher = LabelMatcher::compile(selector)?;
        let ipset_name = IpsetName::new(format!(
            "{}{}",
            IPSET_PREFIX,
            short_name(&format!("{}:{}", scope, matcher.as_str()))
        ));
        Ok(Self {
            matcher,
            ipset_name,
            ipset_type,
        })
    }

    /// The canonical selector string, used as the deduplication key.
    pub fn key(&self) -> &str {
        self.matcher.as_str()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.matcher.matches(labels)
    }

    pub fn ipset_name(&self) -> &IpsetName {
        &self.ipset_name
    }

    pub fn ipset_type(&self) -> IpsetType {
        self.ipset_type
    }
}

/// Reference-counted set of selectors, sharing one kernel ipset per distinct
/// selector key across all the policies that use it.
///
/// A key is present iff some policy owns it; its ipset is created when the
/// first owner appears and destroyed when the last one leaves.
pub struct SelectorSet {
    ipset: Arc<dyn Ipset>,
    users: HashMap<String, HashSet<String>>,
    entries: HashMap<String, Selector>,
}

impl SelectorSet {
    pub fn new(ipset: Arc<dyn Ipset>) -> Self {
        Self {
            ipset,
            users: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    /// The selectors currently realised.
    pub fn selectors(&self) -> impl Iterator<Item = &Selector> {
        self.entries.values()
    }

    /// Reference every selector in `desired` that is not in `current` on
    /// behalf of `owner`, creating ipsets for selectors not yet realised.
    ///
    /// `on_new` back-fills a freshly created ipset with the already-known
    /// matching entries; it runs before the selector becomes visible through
    /// [`SelectorSet::selectors`].
    pub fn provision_new<F>(
        &mut self,
        owner: &str,
        current: &HashMap<String, Selector>,
        desired: &HashMap<String, Selector>,
        mut on_new: F,
    ) -> Result<()>
    where
        F: FnMut(&Selector) -> Result<()>,
    {
        for (key, sel) in desired {
            if current.contains_key(key) {
                continue;
            }
            if !self.entries.contains_key(key) {
                debug!(ipset = %sel.ipset_name(), selector = %key, "creating selector ipset");
                self.ipset.create(sel.ipset_name(), sel.ipset_type())?;
                on_new(sel)?;
                self.entries.insert(key.clone(), sel.clone());
            }
            self.users
                .entry(key.clone())
                .or_default()
                .insert(owner.to_string());
        }
        Ok(())
    }

    /// Drop `owner`'s reference to every selector in `current` that is not in
    /// `desired`, destroying ipsets that lose their last owner.
    pub fn deprovision_unused(
        &mut self,
        owner: &str,
        current: &HashMap<String, Selector>,
        desired: &HashMap<String, Selector>,
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
                if let Some(sel) = self.entries.remove(key) {
                    debug!(ipset = %sel.ipset_name(), selector = %key, "destroying selector ipset");
                    self.ipset.destroy(sel.ipset_name())?;
                }
                self.users.remove(key);
            }
        }
        Ok(())
    }
}
