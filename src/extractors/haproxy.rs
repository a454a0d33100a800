//! Extract site information from the haproxy config file
//!
//! One site per acl/backend combination: `acl host_xyz ...` lines name the
//! sites, `backend xyz_cluster` blocks list the servers behind them.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::extractors::Extractor;
use crate::facts::{self, write_fact, write_scalar};
use crate::fs::FileSystem;
use crate::sites::{Protocol, SiteAggregator, SiteRecord};

const HAPROXY_CFG: &str = "/etc/haproxy/haproxy.cfg";
const FACT_FILE: &str = "haproxys.fact";
const WARNINGS_FILE: &str = "serverfacts.duplicate_haproxy_sites.warnings";

static SITE: Lazy<Regex> = Lazy::new(|| {
    // 'acl host_nxt ... sitename' ties 'sitename' to backend 'nxt'.
    Regex::new(r"^acl\s+host_(?P<backend>\S+)\s+.*\s+(?P<sitename>\S+)$").expect("valid regex")
});
static BACKEND_START: Lazy<Regex> = Lazy::new(|| {
    // 'backend nxt_cluster' starts the server list for backend 'nxt'.
    Regex::new(r"^backend\s+(?P<backend>\S+)_cluster$").expect("valid regex")
});
static SERVER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^server\s+(?P<server>\S+)\s+.*$").expect("valid regex"));

/// Site info per acl/backend-server combination in the haproxy config content
pub fn extract_sites(content: &str) -> Vec<SiteRecord> {
    let lines: Vec<String> = content
        .lines()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();

    // First grab the {sitename: backend} info.
    let mut sitenames_with_backend = BTreeMap::new();
    for line in &lines {
        if let Some(captures) = SITE.captures(line) {
            let sitename = captures["sitename"].to_string();
            let backend = captures["backend"].to_string();
            debug!("Found site {} with backend {}", sitename, backend);
            sitenames_with_backend.insert(sitename, backend);
        }
    }

    // Then collect the {backend: [servers]} info.
    let mut backends_with_servers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut backend: Option<String> = None;
    let mut servers = Vec::new();
    for line in &lines {
        if let Some(captures) = BACKEND_START.captures(line) {
            if let Some(finished) = backend.take() {
                debug!("Adding servers {:?} to backend {}", servers, finished);
                backends_with_servers.insert(finished, std::mem::take(&mut servers));
            }
            backend = Some(captures["backend"].to_string());
            debug!("Starting new backend '{}'", captures["backend"].to_string());
            continue;
        }
        if backend.is_none() {
            // Not ready to start yet.
            continue;
        }
        if let Some(captures) = SERVER.captures(line) {
            servers.push(captures["server"].to_string());
        }
        if line.starts_with("listen") {
            // The backend section is over.
            break;
        }
    }
    if let Some(finished) = backend.take() {
        debug!("Adding servers {:?} to backend {}", servers, finished);
        backends_with_servers.insert(finished, servers);
    }

    // One site per backend server.
    let mut records = Vec::new();
    for (sitename, backend) in &sitenames_with_backend {
        let Some(servers) = backends_with_servers.get(backend) else {
            warn!("Site {} points at unknown backend {}", sitename, backend);
            continue;
        };
        for server in servers {
            records.push(SiteRecord {
                name: sitename.clone(),
                protocol: Protocol::Http, // Hardcoded: TLS terminates before haproxy.
                related_checkout: None,
                proxy_to_local_port: None,
                proxy_to_other_server: Some(server.clone()),
                redirect_to: None,
                redirect_to_protocol: None,
            });
        }
    }
    records
}

/// Reads the haproxy config and writes the haproxy fact file plus the
/// duplicate count scalar.
pub struct HaproxyExtractor {
    pub config_file: PathBuf,
    pub facts_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for HaproxyExtractor {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(HAPROXY_CFG),
            facts_dir: PathBuf::from(facts::FACTS_DIR),
            metrics_dir: PathBuf::from(facts::METRICS_DIR),
        }
    }
}

impl Extractor for HaproxyExtractor {
    fn name(&self) -> &'static str {
        "haproxy"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        facts::ensure_dir(&self.facts_dir)?;
        if !fs.exists(&self.config_file) {
            debug!("No {} found, skipping", self.config_file.display());
            return Ok(());
        }
        debug!("Looking at {}", self.config_file.display());
        let content = fs.read_to_string(&self.config_file)?;

        let mut aggregator = SiteAggregator::new("Haproxy");
        let source = self
            .config_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        for site in extract_sites(&content) {
            aggregator.insert(site, &source);
        }

        let (sites, num_duplicates) = aggregator.into_parts();
        write_fact(&self.facts_dir.join(FACT_FILE), &sites)?;
        write_scalar(&self.metrics_dir.join(WARNINGS_FILE), num_duplicates)?;
        Ok(())
    }
}
