//! Extract site information from apache config files
//!
//! Scans `/etc/apache2/sites-enabled`. Apache config keywords are
//! case-insensitive, so every line is lowercased before scanning. The
//! `<VirtualHost *:443>` block opener carries the port itself.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::extractors::parsers::srv_checkout;
use crate::extractors::Extractor;
use crate::facts::{self, write_fact, write_scalar};
use crate::fs::FileSystem;
use crate::sites::{Protocol, SiteAggregator, SiteBuilder, SiteRecord};

const APACHE_DIR: &str = "/etc/apache2/sites-enabled";
const FACT_FILE: &str = "apaches.fact";
const WARNINGS_FILE: &str = "serverfacts.duplicate_apache_sites.warnings";

static VHOST_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<virtualhost").expect("valid regex"));

#[derive(Debug, PartialEq, Eq)]
enum LineKind<'a> {
    BlockStart,
    ServerName(&'a str),
    DocumentRoot,
    ProxyPass,
    Redirect,
    RewriteRule,
    Other,
}

fn classify(line: &str) -> LineKind<'_> {
    if VHOST_START.is_match(line) {
        LineKind::BlockStart
    } else if let Some(rest) = line
        .strip_prefix("servername")
        .or_else(|| line.strip_prefix("serveralias"))
    {
        LineKind::ServerName(rest)
    } else if line.starts_with("documentroot") || line.starts_with("customlog") {
        LineKind::DocumentRoot
    } else if line.starts_with("proxypass") {
        LineKind::ProxyPass
    } else if line.starts_with("redirect") {
        LineKind::Redirect
    } else if line.starts_with("rewriterule") {
        LineKind::RewriteRule
    } else {
        LineKind::Other
    }
}

/// Site info per `<VirtualHost>` block found in the apache config file content
pub fn extract_sites(content: &str) -> Vec<SiteRecord> {
    let mut records = Vec::new();
    let mut current: Option<SiteBuilder> = None;

    let lines = content
        .lines()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| !line.is_empty() && !line.starts_with('#'));

    for line in lines {
        let kind = classify(&line);
        if kind == LineKind::BlockStart {
            if let Some(block) = current.take() {
                records.extend(block.finalize());
            }
            debug!("Starting new site block");
            let mut site = SiteBuilder::new();
            apply_vhost_port(&mut site, &line);
            current = Some(site);
            continue;
        }
        let Some(site) = current.as_mut() else {
            // Not ready to start yet.
            continue;
        };
        match kind {
            LineKind::ServerName(rest) => site.names.extend(parse_server_names(rest)),
            LineKind::DocumentRoot => apply_document_root(site, &line),
            LineKind::ProxyPass => apply_proxy_pass(site, &line),
            LineKind::Redirect => apply_redirect(site, &line),
            LineKind::RewriteRule => apply_rewrite_rule(site, &line),
            LineKind::BlockStart | LineKind::Other => {}
        }
    }

    if let Some(block) = current {
        records.extend(block.finalize());
    }
    records
}

fn apply_vhost_port(site: &mut SiteBuilder, line: &str) {
    if line.contains("80") {
        site.protocol = Protocol::Http;
    } else if line.contains("443") {
        site.protocol = Protocol::Https;
    } else {
        error!("<VirtualHost> line without proper port: {}", line);
    }
}

fn parse_server_names(rest: &str) -> Vec<String> {
    rest.replace(',', " ")
        .split_whitespace()
        .map(|name| {
            name.trim_end_matches(":443")
                .trim_end_matches(":80")
                .to_string()
        })
        .collect()
}

fn apply_document_root(site: &mut SiteBuilder, line: &str) {
    // Assumption: doc root or custom log lives in the checkout directory
    // serving the site:
    //   CustomLog /srv/somewhere/var/log/access.log combined
    //   DocumentRoot /srv/serverinfo.example.org/var/info
    let Some(where_) = line.split_whitespace().nth(1) else {
        warn!("logfile or doc root line without a path: {}", line);
        return;
    };
    match srv_checkout(where_) {
        Some(directory) => {
            debug!("Found log or doc root pointing to a /srv dir: /srv/{}", directory);
            site.related_checkout = Some(directory);
        }
        None => warn!("logfile or doc root line without a dir inside /srv: {}", line),
    }
}

fn apply_proxy_pass(site: &mut SiteBuilder, line: &str) {
    let Some(proxied_to) = line.split_whitespace().find(|part| part.starts_with("http")) else {
        return;
    };
    let proxied_to = proxied_to.replace("$1", "");
    match Url::parse(&proxied_to) {
        Ok(url) => match url.host_str() {
            Some("localhost") => {
                let port = url
                    .port_or_known_default()
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                warn!("Proxy to localhost port {}, we'd expect mod_wsgi...", port);
                site.proxy_to_local_port = Some(port);
            }
            Some(host) => {
                debug!("Proxy to other server: {}", host);
                site.proxy_to_other_server = Some(host.to_string());
            }
            None => warn!("proxypass target without a host: {}", proxied_to),
        },
        Err(err) => warn!("Unparseable proxypass target {}: {}", proxied_to, err),
    }
}

fn apply_redirect(site: &mut SiteBuilder, line: &str) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        warn!("Redirect line with fewer than 3 parts: {}", line);
        return;
    }
    if parts[1].contains("410") || parts[1].contains("gone") {
        site.redirect_to = Some("GONE".to_string());
        return;
    }
    if parts[2] != "/" {
        info!("Redirect doesn't redirect the root: {}", line);
        return;
    }
    apply_redirect_target(site, &parts, line);
}

fn apply_rewrite_rule(site: &mut SiteBuilder, line: &str) {
    let parts: Vec<String> = line
        .split_whitespace()
        .map(|part| part.replace(['"', '\''], ""))
        .collect();
    if parts.len() < 3 {
        warn!("Rewriterule line with fewer than 3 parts: {}", line);
        return;
    }
    if parts[1] != "^(.*)" {
        info!("Rewriterule doesn't redirect the root: {}", line);
        return;
    }
    let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
    apply_redirect_target(site, &parts, line);
}

fn apply_redirect_target(site: &mut SiteBuilder, parts: &[&str], line: &str) {
    let Some(target) = parts.iter().find(|part| part.starts_with("http")) else {
        warn!("Redirect without recognizable http(s) target: {}", line);
        return;
    };
    let target = target.strip_suffix("$1").unwrap_or(target);
    match Url::parse(target) {
        Ok(url) => {
            site.redirect_to = url.host_str().map(str::to_string);
            site.redirect_to_protocol = Some(url.scheme().to_string());
        }
        Err(err) => warn!("Unparseable redirect target {}: {}", target, err),
    }
}

/// Reads every enabled site config and writes the apache fact file plus the
/// duplicate count scalar.
pub struct ApacheExtractor {
    pub config_dir: PathBuf,
    pub facts_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for ApacheExtractor {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(APACHE_DIR),
            facts_dir: PathBuf::from(facts::FACTS_DIR),
            metrics_dir: PathBuf::from(facts::METRICS_DIR),
        }
    }
}

impl Extractor for ApacheExtractor {
    fn name(&self) -> &'static str {
        "apache"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        facts::ensure_dir(&self.facts_dir)?;
        if !fs.exists(&self.config_dir) {
            debug!("No {} found, skipping", self.config_dir.display());
            return Ok(());
        }

        let mut aggregator = SiteAggregator::new("Apache");
        let mut num_errors = 0usize;
        let mut entries = fs.read_dir(&self.config_dir)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            if entry.name.starts_with('.') {
                continue;
            }
            debug!("Looking at {}", entry.path.display());
            match fs.read_to_string(&entry.path) {
                Ok(content) => {
                    for site in extract_sites(&content) {
                        aggregator.insert(site, &entry.name);
                    }
                }
                Err(err) => {
                    num_errors += 1;
                    error!("Something went wrong when reading {:?}: {}", entry.path, err);
                }
            }
        }

        let (sites, num_duplicates) = aggregator.into_parts();
        write_fact(&self.facts_dir.join(FACT_FILE), &sites)?;
        write_scalar(
            &self.metrics_dir.join(WARNINGS_FILE),
            num_errors + num_duplicates,
        )?;
        Ok(())
    }
}
