//! iptables driver
//!
//! Thin blocking interface over the host firewall: ensure/flush chains and
//! append/delete individual rules. Only the `filter` table is used by the
//! controller.

mod exec;

pub use exec::ExecIptables;

use rampart_core::Result;
use std::fmt;

/// An iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An iptables chain, named at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chain(pub &'static str);

impl Chain {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Where a rule is placed in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    Append,
    Prepend,
}

/// Blocking interface to the host iptables.
pub trait Iptables: Send + Sync {
    /// Create the chain if it does not exist. Returns whether it was created.
    fn ensure_chain(&self, table: Table, chain: Chain) -> Result<bool>;

    /// Remove every rule from the chain.
    fn flush_chain(&self, table: Table, chain: Chain) -> Result<()>;

    /// Install the rule if no identical rule exists in the chain. Returns
    /// whether it was installed by this call.
    fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<bool>;

    /// Delete one occurrence of the rule from the chain.
    fn delete_rule(&self, table: Table, chain: Chain, args: &[String]) -> Result<()>;
}
