//! Extract queue depths from a rabbitmq broker
//!
//! Operators configure per-vhost limits in a small JSON file; the extractor
//! compares `rabbitmqctl` queue listings against those limits and flags
//! vhosts with too many queues or a queue holding too many messages.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::extractors::Extractor;
use crate::facts::{self, write_fact, write_scalar};
use crate::fs::FileSystem;
use crate::util::shell_output;

const CONFIG_FILE: &str = "/etc/serverscripts/rabbitmq_zabbix.json";
const RABBITMQ_FACTS_DIR: &str = "/var/local/rabbitmq-facts";
const FACT_FILE: &str = "rabbitmq.fact";
const QUEUES_WARNINGS_FILE: &str = "serverfacts.rabbitmq_queues.warnings";
const MESSAGES_WARNINGS_FILE: &str = "serverfacts.rabbitmq_messages.warnings";

/// Per-vhost monitoring limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VhostLimits {
    pub queues_limit: u64,
    pub messages_limit: i64,
}

pub type RabbitmqConfig = BTreeMap<String, VhostLimits>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("Faulty config file {path}: {source}")]
    Invalid {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Load and deserialize the vhost limits config.
pub fn load_config(fs: &dyn FileSystem, path: &Path) -> Result<RabbitmqConfig, ConfigError> {
    let content = fs
        .read_to_string(path)
        .map_err(|err| ConfigError::Unreadable {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

/// A usable config names at least one vhost and has positive limits.
pub fn validate_configuration(config: &RabbitmqConfig) -> bool {
    if config.is_empty() {
        warn!("Empty rabbitmq limits configuration");
        return false;
    }
    for (vhost, limits) in config {
        if limits.queues_limit == 0 || limits.messages_limit <= 0 {
            warn!(
                "Configuration for vhost {} has non-positive limits: {:?}",
                vhost, limits
            );
            return false;
        }
    }
    true
}

/// Vhost names out of `rabbitmqctl list_vhosts` output.
pub fn parse_vhosts_stdout(vhosts_stdout: &str) -> Vec<String> {
    vhosts_stdout
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("Listing") && !line.starts_with("...done")
        })
        .map(str::to_string)
        .collect()
}

/// Queue name/depth mapping out of `rabbitmqctl list_queues` output.
///
/// Data lines are `queuename\tmessage_count`; the "Listing queues" header
/// and "...done." footer have no tab and fall out naturally.
pub fn parse_queues_stdout(queues_stdout: &str) -> BTreeMap<String, i64> {
    let mut queues = BTreeMap::new();
    for line in queues_stdout.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 2 {
            continue;
        }
        match parts[1].trim().parse() {
            Ok(messages) => {
                queues.insert(parts[0].to_string(), messages);
            }
            Err(_) => warn!("Unparseable queue line: {}", line),
        }
    }
    queues
}

/// The queue holding the most messages.
pub fn get_max_queue(queues: &BTreeMap<String, i64>) -> Option<(&str, i64)> {
    queues
        .iter()
        .max_by_key(|(_, messages)| **messages)
        .map(|(name, messages)| (name.as_str(), *messages))
}

fn retrieve_vhosts() -> Result<Option<Vec<String>>> {
    let output = shell_output("rabbitmqctl list_vhosts", None)?;
    if !output.success {
        warn!("rabbitmqctl is not available: {}", output.stderr.trim());
        return Ok(None);
    }
    Ok(Some(parse_vhosts_stdout(&output.stdout)))
}

fn retrieve_queues(vhost: &str) -> Result<Option<BTreeMap<String, i64>>> {
    let output = shell_output(&format!("rabbitmqctl list_queues -p '{}'", vhost), None)?;
    if !output.success {
        warn!("{} vhost is not available or has no queues", vhost);
        return Ok(None);
    }
    Ok(Some(parse_queues_stdout(&output.stdout)))
}

#[derive(Debug, Serialize)]
pub struct MaxQueue {
    pub name: String,
    pub messages: i64,
}

#[derive(Debug, Serialize)]
pub struct VhostFact {
    pub num_queues: usize,
    pub total_messages: i64,
    pub queues: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue: Option<MaxQueue>,
}

/// Checks configured vhosts against their queue/message limits and writes
/// the rabbitmq fact file plus the two warning scalars.
pub struct RabbitmqExtractor {
    pub config_file: PathBuf,
    pub facts_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for RabbitmqExtractor {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(CONFIG_FILE),
            facts_dir: PathBuf::from(RABBITMQ_FACTS_DIR),
            metrics_dir: PathBuf::from(facts::METRICS_DIR),
        }
    }
}

impl Extractor for RabbitmqExtractor {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        facts::ensure_dir(&self.facts_dir)?;
        if !fs.is_file(&self.config_file) {
            debug!("No {} found, skipping", self.config_file.display());
            return Ok(());
        }
        let config = match load_config(fs, &self.config_file) {
            Ok(config) => config,
            Err(err) => {
                warn!("{}", err);
                return Ok(());
            }
        };
        if !validate_configuration(&config) {
            return Ok(());
        }

        let Some(vhosts) = retrieve_vhosts()? else {
            return Ok(());
        };

        let mut result = BTreeMap::new();
        let mut num_queues_warnings = 0u64;
        let mut num_messages_warnings = 0u64;
        for (vhost, limits) in &config {
            if !vhosts.contains(vhost) {
                warn!("Configured vhost {} not present on the broker", vhost);
                continue;
            }
            let Some(queues) = retrieve_queues(vhost)? else {
                continue;
            };

            if queues.len() as u64 > limits.queues_limit {
                warn!(
                    "Vhost {} has {} queues, more than the limit of {}",
                    vhost,
                    queues.len(),
                    limits.queues_limit
                );
                num_queues_warnings += 1;
            }
            let max_queue = get_max_queue(&queues).map(|(name, messages)| MaxQueue {
                name: name.to_string(),
                messages,
            });
            if let Some(max) = &max_queue {
                if max.messages > limits.messages_limit {
                    warn!(
                        "Queue {} on vhost {} holds {} messages, more than the limit of {}",
                        max.name, vhost, max.messages, limits.messages_limit
                    );
                    num_messages_warnings += 1;
                }
            }

            result.insert(
                vhost.clone(),
                VhostFact {
                    num_queues: queues.len(),
                    total_messages: queues.values().sum(),
                    queues,
                    max_queue,
                },
            );
        }

        write_fact(&self.facts_dir.join(FACT_FILE), &result)?;
        write_scalar(
            &self.metrics_dir.join(QUEUES_WARNINGS_FILE),
            num_queues_warnings,
        )?;
        write_scalar(
            &self.metrics_dir.join(MESSAGES_WARNINGS_FILE),
            num_messages_warnings,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFileSystem;

    const QUEUES_STDOUT: &str = "\
Listing queues ...
queuename1\t0
queuename2\t4
celery\t12
...done.
";

    const VHOSTS_STDOUT: &str = "\
Listing vhosts ...
/
flooding
lizard-nxt
...done.
";

    #[test]
    fn test_parse_vhosts_stdout() {
        let vhosts = parse_vhosts_stdout(VHOSTS_STDOUT);
        assert_eq!(vhosts, vec!["/", "flooding", "lizard-nxt"]);
    }

    #[test]
    fn test_parse_vhosts_stdout_empty() {
        assert!(parse_vhosts_stdout("").is_empty());
    }

    #[test]
    fn test_parse_queues_stdout() {
        let queues = parse_queues_stdout(QUEUES_STDOUT);
        assert_eq!(queues.len(), 3);
        assert_eq!(queues["queuename2"], 4);
        assert_eq!(queues["celery"], 12);
    }

    #[test]
    fn test_get_max_queue() {
        let mut queues = BTreeMap::new();
        queues.insert("q1".to_string(), 10);
        queues.insert("q2".to_string(), 3);
        queues.insert("z".to_string(), -1);
        assert_eq!(get_max_queue(&queues), Some(("q1", 10)));
    }

    #[test]
    fn test_get_max_queue_empty() {
        assert_eq!(get_max_queue(&BTreeMap::new()), None);
    }

    #[test]
    fn test_load_config_file() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "/etc/serverscripts/rabbitmq_zabbix.json",
            r#"{"flooding": {"queues_limit": 23, "messages_limit": 200}}"#,
        );
        let config = load_config(&fs, Path::new("/etc/serverscripts/rabbitmq_zabbix.json")).unwrap();
        assert_eq!(config.len(), 1);
        assert_eq!(config["flooding"].queues_limit, 23);
    }

    #[test]
    fn test_load_config_file_broken_content() {
        let fs = MockFileSystem::new();
        fs.add_file("/etc/serverscripts/rabbitmq_zabbix.json", "{not json");
        let result = load_config(&fs, Path::new("/etc/serverscripts/rabbitmq_zabbix.json"));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_load_config_rejects_missing_limit() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "/etc/serverscripts/rabbitmq_zabbix.json",
            r#"{"flooding": {"queues_limit": 23}}"#,
        );
        let result = load_config(&fs, Path::new("/etc/serverscripts/rabbitmq_zabbix.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_configuration_empty() {
        assert!(!validate_configuration(&RabbitmqConfig::new()));
    }

    #[test]
    fn test_validate_configuration_zero_limit() {
        let mut config = RabbitmqConfig::new();
        config.insert(
            "flooding".to_string(),
            VhostLimits {
                queues_limit: 0,
                messages_limit: 200,
            },
        );
        assert!(!validate_configuration(&config));
    }

    #[test]
    fn test_validate_configuration_valid() {
        let mut config = RabbitmqConfig::new();
        config.insert(
            "flooding".to_string(),
            VhostLimits {
                queues_limit: 22,
                messages_limit: 22,
            },
        );
        config.insert(
            "lizard-nxt".to_string(),
            VhostLimits {
                queues_limit: 1,
                messages_limit: 200,
            },
        );
        assert!(validate_configuration(&config));
    }
}
