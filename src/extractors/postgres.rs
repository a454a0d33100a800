//! Extract information from a local postgres server
//!
//! Everything comes from command output: the running version from `ps ax`,
//! database names and sizes from a `psql` query, login and connection
//! counts from the server logs.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::extractors::Extractor;
use crate::facts::{self, write_fact, write_scalar};
use crate::fs::FileSystem;
use crate::util::shell_output;

const POSTGRES_ETC: &str = "/etc/postgresql";
const FACT_FILE: &str = "databases.fact";
const SIZE_QUERY: &str = "select datname, pg_database_size(datname) from pg_database;";
const USAGE_COMMAND: &str = concat!(
    r#"zgrep "connection authorized" /var/log/postgresql/postgres*main.log*"#,
    r#"|grep -v "user=postgres"|cut -d= -f2,3|cut -d\  -f1,2|sort|uniq -c | sort -n"#,
);
const CONNECTIONS_COMMAND: &str = concat!(
    r#"zgrep "connection received: host=" /var/log/postgresql/postgres*main.log*"#,
    r#"|grep -v "local"|cut -d= -f2|cut -d\  -f1|sort|uniq -c | sort -n"#,
);

static POSTGRES_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/usr/lib/postgresql/(?P<version>[0-9.]+)/bin/postgres").expect("valid regex")
});
static USAGE_LINE: Lazy<Regex> = Lazy::new(|| {
    // '  23054 efcis_site database=efcis_site'
    Regex::new(r"^\s*(?P<num_logins>\d+).+database=(?P<database>[\w\-]+)").expect("valid regex")
});
static CONNECTION_LINE: Lazy<Regex> = Lazy::new(|| {
    // '   9805 10.100.57.16'
    Regex::new(r"^\s*(?P<num_connections>\d+)\s+(?P<ip_address>[\d.]+)").expect("valid regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_logins: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
pub struct PostgresInfo {
    pub version: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub databases: BTreeMap<String, DatabaseInfo>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub connections: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_databases: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_databases_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biggest_database_size: Option<i64>,
}

/// Running server version out of `ps ax` output, or empty when no postgres
/// process is found.
pub fn parse_version(ps_output: &str) -> String {
    for line in ps_output.lines() {
        if let Some(captures) = POSTGRES_VERSION.captures(line) {
            return captures["version"].to_string();
        }
    }
    String::new()
}

/// Database name/size mapping from the tuples-only `psql` size query output.
///
/// Lines look like ` efcis_site | 8613468`. Template databases and the
/// `postgres` bookkeeping database are omitted.
pub fn parse_database_sizes(psql_output: &str) -> BTreeMap<String, DatabaseInfo> {
    let mut result = BTreeMap::new();
    for line in psql_output.lines() {
        let Some((name, size)) = line.split_once('|') else {
            continue;
        };
        let name = name.trim();
        let size = size.trim();
        if name.starts_with("template") || name == "postgres" {
            debug!("Omitting database {}", name);
            continue;
        }
        let size: i64 = match size.parse() {
            Ok(size) => size,
            Err(_) => {
                warn!("Unparseable database size for {}: {}", name, size);
                continue;
            }
        };
        info!("Found database {} with size {}", name, size);
        result.insert(
            name.to_string(),
            DatabaseInfo {
                name: name.to_string(),
                size,
                num_logins: None,
            },
        );
    }
    result
}

/// Per-database login counts from the "connection authorized" zgrep pipeline.
pub fn parse_usage(output: &str) -> BTreeMap<String, u64> {
    let mut result = BTreeMap::new();
    for line in output.lines() {
        if let Some(captures) = USAGE_LINE.captures(line) {
            let num_logins = captures["num_logins"].parse().unwrap_or(0);
            result.insert(captures["database"].to_string(), num_logins);
        }
    }
    result
}

/// Per-client-IP connection counts from the "connection received" pipeline.
pub fn parse_connections(output: &str) -> BTreeMap<String, u64> {
    let mut result = BTreeMap::new();
    for line in output.lines() {
        if let Some(captures) = CONNECTION_LINE.captures(line) {
            let num_connections = captures["num_connections"].parse().unwrap_or(0);
            result.insert(captures["ip_address"].to_string(), num_connections);
        }
    }
    result
}

/// Attach login counts and summary fields to the database mapping.
pub fn assemble(
    version: String,
    mut databases: BTreeMap<String, DatabaseInfo>,
    usage: BTreeMap<String, u64>,
    connections: BTreeMap<String, u64>,
) -> PostgresInfo {
    if version.is_empty() {
        return PostgresInfo::default();
    }
    for (name, database) in databases.iter_mut() {
        database.num_logins = Some(usage.get(name).copied().unwrap_or(0));
    }

    let mut result = PostgresInfo {
        version,
        connections,
        ..Default::default()
    };
    if !databases.is_empty() {
        let sizes: Vec<i64> = databases.values().map(|d| d.size).collect();
        result.num_databases = Some(databases.len());
        result.total_databases_size = Some(sizes.iter().sum());
        result.biggest_database_size = sizes.iter().max().copied();
    }
    result.databases = databases;
    result
}

/// Queries the local postgres server and writes the databases fact file
/// plus size/count scalars.
pub struct PostgresExtractor {
    pub etc_dir: PathBuf,
    pub facts_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for PostgresExtractor {
    fn default() -> Self {
        Self {
            etc_dir: PathBuf::from(POSTGRES_ETC),
            facts_dir: PathBuf::from(facts::FACTS_DIR),
            metrics_dir: PathBuf::from(facts::METRICS_DIR),
        }
    }
}

impl PostgresExtractor {
    fn gather(&self) -> Result<PostgresInfo> {
        let version = parse_version(&shell_output("ps ax", None)?.stdout);
        if version.is_empty() {
            debug!("No running postgres process found");
            return Ok(PostgresInfo::default());
        }

        let command = format!("sudo -u postgres psql -c '{}' --tuples-only", SIZE_QUERY);
        let output = shell_output(&command, None)?;
        if let Some(stderr) = output.error_output() {
            warn!("Error output from psql command: {}", stderr);
        }
        let databases = parse_database_sizes(&output.stdout);

        let output = shell_output(USAGE_COMMAND, None)?;
        if let Some(stderr) = output.error_output() {
            warn!("Error output from usage zgrep command: {}", stderr);
        }
        let usage = parse_usage(&output.stdout);

        let output = shell_output(CONNECTIONS_COMMAND, None)?;
        if let Some(stderr) = output.error_output() {
            warn!("Error output from connections zgrep command: {}", stderr);
        }
        let connections = parse_connections(&output.stdout);

        Ok(assemble(version, databases, usage, connections))
    }
}

impl Extractor for PostgresExtractor {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        facts::ensure_dir(&self.facts_dir)?;
        if !fs.exists(&self.etc_dir) {
            debug!("No {} found, skipping", self.etc_dir.display());
            return Ok(());
        }

        let result = self.gather()?;
        write_fact(&self.facts_dir.join(FACT_FILE), &result)?;

        if let (Some(num), Some(total), Some(biggest)) = (
            result.num_databases,
            result.total_databases_size,
            result.biggest_database_size,
        ) {
            write_scalar(
                &self.metrics_dir.join("serverfacts.num_databases.info"),
                num,
            )?;
            write_scalar(
                &self
                    .metrics_dir
                    .join("serverfacts.total_databases_size.info"),
                total,
            )?;
            write_scalar(
                &self
                    .metrics_dir
                    .join("serverfacts.biggest_database_size.info"),
                biggest,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS_OUTPUT: &str = "\
  777 ?        S      0:00 sshd: waiting
  997 ?        S      1:13 /usr/lib/postgresql/9.5/bin/postgres -D /var/lib/postgresql/9.5/main
 1023 ?        Ss     0:00 cron
";

    const PSQL_OUTPUT: &str = "\
 template0 | 7234324
 template1 | 7234324
 postgres  | 7342899
 efcis_site | 8613468
 waterlabel_site | 7736868

";

    const USAGE_OUTPUT: &str = "\
      9 ror_export database=ror_export
     73 waterlabel_site database=waterlabel_site
  23054 efcis_site database=efcis_site
";

    const CONNECTIONS_OUTPUT: &str = "\
   1629 10.100.160.171
   2495 10.100.57.17
   9805 10.100.57.16
";

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version(PS_OUTPUT), "9.5");
    }

    #[test]
    fn test_parse_version_no_postgres() {
        assert_eq!(parse_version("  1 ?  Ss  0:00 /sbin/init\n"), "");
    }

    #[test]
    fn test_parse_database_sizes_skips_internal_databases() {
        let databases = parse_database_sizes(PSQL_OUTPUT);
        assert_eq!(databases.len(), 2);
        assert_eq!(databases["efcis_site"].size, 8613468);
        assert!(!databases.contains_key("postgres"));
        assert!(!databases.contains_key("template0"));
    }

    #[test]
    fn test_parse_usage() {
        let usage = parse_usage(USAGE_OUTPUT);
        assert_eq!(usage.len(), 3);
        assert_eq!(usage["efcis_site"], 23054);
    }

    #[test]
    fn test_parse_connections() {
        let connections = parse_connections(CONNECTIONS_OUTPUT);
        assert_eq!(connections.len(), 3);
        assert_eq!(connections["10.100.57.16"], 9805);
    }

    #[test]
    fn test_assemble_summary_fields() {
        let info = assemble(
            "9.5".to_string(),
            parse_database_sizes(PSQL_OUTPUT),
            parse_usage(USAGE_OUTPUT),
            parse_connections(CONNECTIONS_OUTPUT),
        );
        assert_eq!(info.version, "9.5");
        assert_eq!(info.num_databases, Some(2));
        assert_eq!(info.total_databases_size, Some(8613468 + 7736868));
        assert_eq!(info.biggest_database_size, Some(8613468));
        assert_eq!(info.databases["efcis_site"].num_logins, Some(23054));
        assert_eq!(info.databases["waterlabel_site"].num_logins, Some(73));
    }

    #[test]
    fn test_assemble_without_version_is_empty() {
        let info = assemble(
            String::new(),
            parse_database_sizes(PSQL_OUTPUT),
            BTreeMap::new(),
            BTreeMap::new(),
        );
        assert!(info.version.is_empty());
        assert!(info.databases.is_empty());
        assert_eq!(info.num_databases, None);
    }
}
