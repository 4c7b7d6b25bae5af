//! `ipset(8)` exec-backed driver.

use crate::{Ipset, IpsetName, IpsetType};
use rampart_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

/// Runs the `ipset` binary for every mutation.
///
/// Keeps a per-set entry cache so that adding an entry twice (or deleting an
/// absent one) is a no-op instead of a kernel error.
pub struct ExecIpset {
    entries: Mutex<HashMap<String, HashSet<String>>>,
}

impl ExecIpset {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ExecIpset {
    fn default() -> Self {
        Self::new()
    }
}

fn run_ipset(args: &[&str]) -> Result<()> {
    tracing::debug!("Executing ipset command: {:?}", args);

    let output = Command::new("ipset")
        .args(args)
        .output()
        .map_err(|e| Error::Ipset(format!("failed to execute ipset {:?}: {}", args, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Ipset(format!(
            "ipset {:?} failed: {}",
            args,
            stderr.trim()
        )));
    }

    Ok(())
}

impl Ipset for ExecIpset {
    fn create(&self, name: &IpsetName, kind: IpsetType) -> Result<()> {
        run_ipset(&["create", name.as_str(), kind.as_str()])?;
        self.cache().insert(name.as_str().to_string(), HashSet::new());
        Ok(())
    }

    fn destroy(&self, name: &IpsetName) -> Result<()> {
        run_ipset(&["destroy", name.as_str()])?;
        self.cache().remove(name.as_str());
        Ok(())
    }

    fn add_entry(&self, name: &IpsetName, entry: &str) -> Result<()> {
        let mut cache = self.cache();
        let known = cache.entry(name.as_str().to_string()).or_default();
        if !known.contains(entry) {
            run_ipset(&["add", name.as_str(), entry])?;
            known.insert(entry.to_string());
        }
        Ok(())
    }

    fn del_entry(&self, name: &IpsetName, entry: &str) -> Result<()> {
        let mut cache = self.cache();
        let known = cache.entry(name.as_str().to_string()).or_default();
        if known.contains(entry) {
            run_ipset(&["del", name.as_str(), entry])?;
            known.remove(entry);
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        run_ipset(&["flush"])?;
        for known in self.cache().values_mut() {
            known.clear();
        }
        Ok(())
    }

    fn destroy_all(&self) -> Result<()> {
        run_ipset(&["destroy"])?;
        self.cache().clear();
        Ok(())
    }
}
