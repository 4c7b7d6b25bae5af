//! Rampart network policy engine
//!
//! Translates the declarative state of Namespaces, Pods, and NetworkPolicies
//! into kernel packet-filter state on one node: named ipsets of pod/namespace
//! addresses and iptables accept rules derived from policy ingress clauses.
//!
//! The engine is event driven: the embedding agent feeds it add/update/delete
//! events for the three resource kinds and the [`NetworkPolicyController`]
//! reconciles the kernel synchronously under a single lock.

pub mod analyser;
pub mod bootstrap;
pub mod controller;
pub mod encode;
pub mod labels;
pub mod namespace;
pub mod rule;
pub mod selector;

pub use analyser::{analyse_policy, PolicyAnalysis};
pub use controller::NetworkPolicyController;
pub use rule::RuleSpec;
pub use selector::Selector;

use rampart_iptables::Chain;

/// Top-level chain: static dispatch between the default and ingress chains.
pub const MAIN_CHAIN: Chain = Chain("WEAVE-NPC");

/// One default-allow bypass rule per non-isolated namespace.
pub const DEFAULT_CHAIN: Chain = Chain("WEAVE-NPC-DEFAULT");

/// Deduplicated per-policy accept rules.
pub const INGRESS_CHAIN: Chain = Chain("WEAVE-NPC-INGRESS");

/// Prefix of every ipset owned by the controller.
pub const IPSET_PREFIX: &str = "weave-";
