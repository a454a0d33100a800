//! Determine whether the pbis AD bridge runs correctly
//!
//! `pbis status` should report the agent as online and joined to the
//! expected domain; anything else flips the error scalar.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::extractors::Extractor;
use crate::facts::{self, write_fact, write_scalar};
use crate::fs::FileSystem;
use crate::util::shell_output;

const PBIS_EXECUTABLE: &str = "/usr/bin/pbis";
const FACT_FILE: &str = "pbis.fact";
const ERRORS_FILE: &str = "serverfacts.pbis.errors";
const EXPECTED_DOMAIN: &str = "ad.local";

pub const OK: u8 = 0;
pub const ERROR: u8 = 1;

#[derive(Debug, Serialize)]
struct PbisFact {
    exists: bool,
}

/// OK when the status output mentions both an online agent and the expected
/// domain.
pub fn check_status(output: &str, expected_domain: &str) -> u8 {
    let lines: Vec<String> = output.lines().map(|l| l.trim().to_lowercase()).collect();
    let online = lines.iter().any(|line| line.contains("online"));
    let domain_joined = lines.iter().any(|line| line.contains(expected_domain));
    if online && domain_joined {
        info!("Both 'online' and '{}' found", expected_domain);
        OK
    } else {
        error!("Not both of 'online' and '{}' found", expected_domain);
        ERROR
    }
}

/// Probes the pbis agent and writes the pbis fact file plus the error
/// scalar.
pub struct PbisExtractor {
    pub executable: PathBuf,
    pub facts_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for PbisExtractor {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(PBIS_EXECUTABLE),
            facts_dir: PathBuf::from(facts::FACTS_DIR),
            metrics_dir: PathBuf::from(facts::METRICS_DIR),
        }
    }
}

impl Extractor for PbisExtractor {
    fn name(&self) -> &'static str {
        "pbis"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        let mut status = OK;
        let pbis_exists = fs.exists(&self.executable);
        if pbis_exists {
            let command = format!("{} status", self.executable.display());
            debug!("Running '{}'...", command);
            let output = shell_output(&command, None)?;
            if let Some(stderr) = output.error_output() {
                warn!("Error output from pbis command: {}", stderr);
            }
            status = check_status(&output.stdout, EXPECTED_DOMAIN);
        } else {
            info!("No {} found, skipping the pbis check", self.executable.display());
        }

        write_fact(
            &self.facts_dir.join(FACT_FILE),
            &PbisFact {
                exists: pbis_exists,
            },
        )?;
        write_scalar(&self.metrics_dir.join(ERRORS_FILE), status)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFileSystem;

    #[test]
    fn test_check_status_healthy() {
        let output = "\
LSA Server Status:
    Agent version: 8.5.0
    Online check interval: 300 seconds
    [Authentication provider: lsa-activedirectory-provider]
        Status:        Online
        Domain:        AD.LOCAL
";
        assert_eq!(check_status(output, "ad.local"), OK);
    }

    #[test]
    fn test_check_status_offline() {
        let output = "Status: Offline\nDomain: ad.local\n";
        assert_eq!(check_status(output, "ad.local"), ERROR);
    }

    #[test]
    fn test_check_status_wrong_domain() {
        let output = "Status: Online\nDomain: other.example\n";
        assert_eq!(check_status(output, "ad.local"), ERROR);
    }

    #[test]
    fn test_run_without_pbis_writes_ok_scalar() {
        let fs = MockFileSystem::new();
        let out = tempfile::TempDir::new().unwrap();
        let extractor = PbisExtractor {
            executable: PathBuf::from("/usr/bin/pbis"),
            facts_dir: out.path().join("facts"),
            metrics_dir: out.path().join("metrics"),
        };
        extractor.run(&fs).unwrap();

        let fact = std::fs::read_to_string(out.path().join("facts/pbis.fact")).unwrap();
        assert!(fact.contains("\"exists\": false"));
        let errors =
            std::fs::read_to_string(out.path().join("metrics/serverfacts.pbis.errors")).unwrap();
        assert_eq!(errors, "0");
    }
}
