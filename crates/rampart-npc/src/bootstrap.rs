//! Startup reset of the static chains and ipsets.
//!
//! Runs before any event is handled. Chains are flushed before ipsets are
//! touched so no rule still references a set about to go away; ipsets are
//! flushed before they are destroyed so `list:set` members are released
//! first. A failure here is fatal to the embedding process.

use crate::{DEFAULT_CHAIN, INGRESS_CHAIN, MAIN_CHAIN};
use rampart_core::Result;
use rampart_ipset::Ipset;
use rampart_iptables::{Chain, Iptables, RulePosition, Table};
use tracing::info;

fn ensure_flushed_chain(ipt: &dyn Iptables, chain: Chain) -> Result<()> {
    let created = ipt.ensure_chain(Table::Filter, chain)?;
    if !created {
        ipt.flush_chain(Table::Filter, chain)?;
    }
    Ok(())
}

fn static_rule(ipt: &dyn Iptables, chain: Chain, args: &[&str]) -> Result<()> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    ipt.ensure_rule(RulePosition::Append, Table::Filter, chain, &args)?;
    Ok(())
}

/// Recreate the three chains and install the static rules of the main chain:
/// accept established traffic, send new connections through the default and
/// ingress chains, and (unless `drop_unmatched` is off) drop whatever neither
/// chain accepted.
pub fn reset_iptables(ipt: &dyn Iptables, drop_unmatched: bool) -> Result<()> {
    ensure_flushed_chain(ipt, INGRESS_CHAIN)?;
    ensure_flushed_chain(ipt, DEFAULT_CHAIN)?;
    ensure_flushed_chain(ipt, MAIN_CHAIN)?;

    static_rule(
        ipt,
        MAIN_CHAIN,
        &["-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
    )?;
    static_rule(
        ipt,
        MAIN_CHAIN,
        &["-m", "state", "--state", "NEW", "-j", DEFAULT_CHAIN.as_str()],
    )?;
    static_rule(
        ipt,
        MAIN_CHAIN,
        &["-m", "state", "--state", "NEW", "-j", INGRESS_CHAIN.as_str()],
    )?;
    if drop_unmatched {
        static_rule(ipt, MAIN_CHAIN, &["-j", "DROP"])?;
    }

    info!("iptables chains reset");
    Ok(())
}

/// Flush, then destroy, every ipset.
pub fn reset_ipsets(ipset: &dyn Ipset) -> Result<()> {
    ipset.flush_all()?;
    ipset.destroy_all()?;

    info!("ipsets reset");
    Ok(())
}
