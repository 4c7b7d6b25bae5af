//! `iptables(8)` exec-backed driver.

use crate::{Chain, Iptables, RulePosition, Table};
use rampart_core::{Error, Result};
use std::process::{Command, Output};

/// Runs the `iptables` binary for every operation.
pub struct ExecIptables;

impl ExecIptables {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExecIptables {
    fn default() -> Self {
        Self::new()
    }
}

fn run_iptables(args: &[&str]) -> Result<Output> {
    tracing::debug!("Executing iptables command: {:?}", args);

    Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| Error::Iptables(format!("failed to execute iptables {:?}: {}", args, e)))
}

fn fail(args: &[&str], output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    Error::Iptables(format!("iptables {:?} failed: {}", args, stderr.trim()))
}

fn rule_args<'a>(
    flag: &'a str,
    table: Table,
    chain: Chain,
    args: &'a [String],
) -> Vec<&'a str> {
    let mut full = vec!["-t", table.as_str(), flag, chain.as_str()];
    full.extend(args.iter().map(String::as_str));
    full
}

impl Iptables for ExecIptables {
    fn ensure_chain(&self, table: Table, chain: Chain) -> Result<bool> {
        let args = ["-t", table.as_str(), "-N", chain.as_str()];
        let output = run_iptables(&args)?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            return Ok(false);
        }
        Err(fail(&args, &output))
    }

    fn flush_chain(&self, table: Table, chain: Chain) -> Result<()> {
        let args = ["-t", table.as_str(), "-F", chain.as_str()];
        let output = run_iptables(&args)?;
        if !output.status.success() {
            return Err(fail(&args, &output));
        }
        Ok(())
    }

    fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<bool> {
        let check = rule_args("-C", table, chain, args);
        let output = run_iptables(&check)?;
        if output.status.success() {
            return Ok(false);
        }

        let flag = match position {
            RulePosition::Append => "-A",
            RulePosition::Prepend => "-I",
        };
        let install = rule_args(flag, table, chain, args);
        let output = run_iptables(&install)?;
        if !output.status.success() {
            return Err(fail(&install, &output));
        }
        Ok(true)
    }

    fn delete_rule(&self, table: Table, chain: Chain, args: &[String]) -> Result<()> {
        let delete = rule_args("-D", table, chain, args);
        let output = run_iptables(&delete)?;
        if !output.status.success() {
            return Err(fail(&delete, &output));
        }
        Ok(())
    }
}
