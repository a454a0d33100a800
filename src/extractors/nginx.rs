//! Extract site information from nginx config files
//!
//! Scans `/etc/nginx/sites-enabled`, one config file per site, and emits one
//! record per `server_name` alias per `server { ... }` block.

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

const NGINX_DIR: &str = "/etc/nginx/sites-enabled";
const FACT_FILE: &str = "nginxs.fact";
const WARNINGS_FILE: &str = "serverfacts.nginx_sites.warnings";

static SERVER_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^server\W*\{").expect("valid regex"));
static ACCESS_LOG_OFF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^access_log\s+off").expect("valid regex"));

/// What one normalized config line means to the block scanner
#[derive(Debug, PartialEq, Eq)]
enum LineKind<'a> {
    BlockStart,
    ServerName(&'a str),
    Listen,
    AccessLogOff,
    AccessLog(&'a str),
    ProxyPass(&'a str),
    Return,
    Other,
}

fn classify(line: &str) -> LineKind<'_> {
    if SERVER_START.is_match(line) {
        LineKind::BlockStart
    } else if let Some(rest) = line.strip_prefix("server_name") {
        LineKind::ServerName(rest)
    } else if line.starts_with("listen") {
        LineKind::Listen
    } else if ACCESS_LOG_OFF.is_match(line) {
        // Logging may be disabled (favicon.ico, robots.txt, etc.).
        LineKind::AccessLogOff
    } else if let Some(rest) = line.strip_prefix("access_log") {
        LineKind::AccessLog(rest)
    } else if let Some(rest) = line.strip_prefix("proxy_pass") {
        LineKind::ProxyPass(rest)
    } else if line.starts_with("return") {
        LineKind::Return
    } else {
        LineKind::Other
    }
}

fn normalized_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(|line| line.trim().trim_end_matches(';'))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Site info per `server` block found in the nginx config file content
pub fn extract_sites(content: &str) -> Vec<SiteRecord> {
    let mut records = Vec::new();
    let mut current: Option<SiteBuilder> = None;

    for line in normalized_lines(content) {
        let kind = classify(line);
        if kind == LineKind::BlockStart {
            if let Some(block) = current.take() {
                records.extend(block.finalize());
            }
            debug!("Starting new site block");
            current = Some(SiteBuilder::new());
            continue;
        }
        let Some(site) = current.as_mut() else {
            // Not inside a block yet.
            continue;
        };
        match kind {
            LineKind::ServerName(rest) => site.names = parse_server_names(rest),
            LineKind::Listen => apply_listen(site, line),
            LineKind::AccessLogOff => {}
            LineKind::AccessLog(rest) => apply_access_log(site, rest, line),
            LineKind::ProxyPass(rest) => apply_proxy_pass(site, rest),
            LineKind::Return => apply_return(site, line),
            LineKind::BlockStart | LineKind::Other => {}
        }
    }

    if let Some(block) = current {
        records.extend(block.finalize());
    }
    records
}

fn parse_server_names(rest: &str) -> Vec<String> {
    let mut line = rest.replace(',', " ");
    if line.contains(")$") {
        // Unpack a ~(one|two)\.example\.com$ regex alternation into plain names.
        line = line
            .replace("~(", " ")
            .replace(")$", " ")
            .replace(r"\.", ".")
            .replace('|', " ");
    }
    line.split_whitespace().map(str::to_string).collect()
}

fn apply_listen(site: &mut SiteBuilder, line: &str) {
    if line.contains("80") {
        site.protocol = Protocol::Http;
    } else if line.contains("443") {
        site.protocol = Protocol::Https;
    } else {
        error!("Listen line without proper port: {}", line);
    }
}

fn apply_access_log(site: &mut SiteBuilder, rest: &str, line: &str) {
    // Assumption: the access log lives in the checkout directory serving the
    // site, so something like /srv/DIRNAME/var/log/access.log.
    let Some(logfilename) = rest.split_whitespace().next() else {
        warn!("access_log line without a path: {}", line);
        return;
    };
    match srv_checkout(logfilename) {
        Some(directory) => {
            debug!("Found access_log pointing to a /srv dir: /srv/{}", directory);
            site.related_checkout = Some(directory);
        }
        None => warn!("access_log line without a dir inside /srv: {}", line),
    }
}

fn apply_proxy_pass(site: &mut SiteBuilder, rest: &str) {
    let Some(proxied_to) = rest.split_whitespace().next() else {
        warn!("proxy_pass line without a target");
        return;
    };
    match Url::parse(proxied_to) {
        Ok(url) => match url.host_str() {
            Some("localhost") => {
                let port = url
                    .port_or_known_default()
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                debug!("Proxy to localhost port {}", port);
                site.proxy_to_local_port = Some(port);
            }
            Some(host) => {
                debug!("Proxy to other server: {}", host);
                site.proxy_to_other_server = Some(host.to_string());
            }
            None => warn!("proxy_pass target without a host: {}", proxied_to),
        },
        Err(err) => warn!("Unparseable proxy_pass target {}: {}", proxied_to, err),
    }
}

fn apply_return(site: &mut SiteBuilder, line: &str) {
    if !line.contains("301") && !line.contains("302") {
        info!("Return line without 301/302 code: {}", line);
        return;
    }
    let Some(target) = line.split_whitespace().find(|part| part.starts_with("http")) else {
        return;
    };
    // Targets look like https://example.com$request_uri.
    let target = target.split('$').next().unwrap_or(target);
    match Url::parse(target) {
        Ok(url) => {
            site.redirect_to = url.host_str().map(str::to_string);
            site.redirect_to_protocol = Some(url.scheme().to_string());
        }
        Err(err) => warn!("Unparseable return target {}: {}", target, err),
    }
}

/// Reads every enabled site config and writes the nginx fact file plus the
/// duplicate/error count scalar.
pub struct NginxExtractor {
    pub config_dir: PathBuf,
    pub facts_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for NginxExtractor {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(NGINX_DIR),
            facts_dir: PathBuf::from(facts::FACTS_DIR),
            metrics_dir: PathBuf::from(facts::METRICS_DIR),
        }
    }
}

impl Extractor for NginxExtractor {
    fn name(&self) -> &'static str {
        "nginx"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        facts::ensure_dir(&self.facts_dir)?;
        if !fs.exists(&self.config_dir) {
            debug!("No {} found, skipping", self.config_dir.display());
            return Ok(());
        }

        let mut aggregator = SiteAggregator::new("Nginx");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFileSystem;
    use std::path::Path;

    const SINGLE: &str = "\
server {
    listen 80;
    server_name example.com;
    access_log /srv/example.com/var/log/access.log;
    # a comment
    location / {
        proxy_pass http://localhost:9000;
    }
}
";

    const MULTIPLE: &str = "\
server {
    listen 443 ssl;
    server_name a.example.com b.example.com;
    access_log /var/log/nginx/access.log;
}
server {
    listen 80;
    server_name c.example.com;
    proxy_pass http://localhost:9000;
}
";

    #[test]
    fn test_single_block_single_site() {
        let result = extract_sites(SINGLE);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "example.com");
        assert_eq!(result[0].protocol, Protocol::Http);
        assert_eq!(result[0].related_checkout.as_deref(), Some("example.com"));
        assert_eq!(result[0].proxy_to_local_port.as_deref(), Some("9000"));
    }

    #[test]
    fn test_one_record_per_alias_name() {
        let result = extract_sites(MULTIPLE);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].protocol, Protocol::Https);
        assert_eq!(result[1].protocol, Protocol::Https);
        let last = &result[2];
        assert_eq!(last.name, "c.example.com");
        assert_eq!(last.protocol, Protocol::Http);
        assert_eq!(last.proxy_to_local_port.as_deref(), Some("9000"));
    }

    #[test]
    fn test_listen_without_port_keeps_default() {
        let content = "server {\nlisten [::]:a;\nserver_name x.example.com;\n}\n";
        let result = extract_sites(content);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].protocol, Protocol::Http);
    }

    #[test]
    fn test_access_log_outside_srv_not_recorded() {
        let content = "\
server {
    listen 80;
    server_name x.example.com;
    access_log /var/log/nginx/x.log;
}
";
        let result = extract_sites(content);
        assert_eq!(result[0].related_checkout, None);
    }

    #[test]
    fn test_access_log_off_ignored() {
        let content = "\
server {
    listen 80;
    server_name x.example.com;
    access_log off;
}
";
        let result = extract_sites(content);
        assert_eq!(result[0].related_checkout, None);
    }

    #[test]
    fn test_proxy_to_other_server() {
        let content = "\
server {
    listen 80;
    server_name x.example.com;
    proxy_pass https://backend.internal:8443/app;
}
";
        let result = extract_sites(content);
        assert_eq!(
            result[0].proxy_to_other_server.as_deref(),
            Some("backend.internal")
        );
        assert_eq!(result[0].proxy_to_local_port, None);
    }

    #[test]
    fn test_redirect_target() {
        let content = "\
server {
    listen 443;
    server_name old.example.com;
    return 301 https://new.example.com$request_uri;
}
";
        let result = extract_sites(content);
        assert_eq!(result[0].redirect_to.as_deref(), Some("new.example.com"));
        assert_eq!(result[0].redirect_to_protocol.as_deref(), Some("https"));
    }

    #[test]
    fn test_return_without_redirect_code_ignored() {
        let content = "\
server {
    listen 80;
    server_name x.example.com;
    return 404;
}
";
        let result = extract_sites(content);
        assert_eq!(result[0].redirect_to, None);
    }

    #[test]
    fn test_regex_alternation_server_name() {
        let content = concat!(
            "server {\n",
            "listen 80;\n",
            r"server_name ~(one\.example\.com|two\.example\.com)$;",
            "\n}\n"
        );
        let result = extract_sites(content);
        let names: Vec<_> = result.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["one.example.com", "two.example.com"]);
    }

    #[test]
    fn test_block_without_names_yields_nothing() {
        let content = "server {\nlisten 80;\n}\nserver {\nlisten 80;\nserver_name x;\n}\n";
        let result = extract_sites(content);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_empty_and_malformed_input() {
        assert!(extract_sites("").is_empty());
        assert!(extract_sites("listen 80;\nserver_name ghost;\n").is_empty());
    }

    #[test]
    fn test_run_writes_fact_and_scalar() {
        let fs = MockFileSystem::new();
        fs.add_file("/etc/nginx/sites-enabled/a.conf", SINGLE);
        fs.add_file("/etc/nginx/sites-enabled/b.conf", SINGLE);
        fs.add_file("/etc/nginx/sites-enabled/.hidden", "server {");

        let out = tempfile::TempDir::new().unwrap();
        let extractor = NginxExtractor {
            config_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            facts_dir: out.path().join("facts"),
            metrics_dir: out.path().join("metrics"),
        };
        extractor.run(&fs).unwrap();

        let fact: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(out.path().join("facts/nginxs.fact")).unwrap(),
        )
        .unwrap();
        // Duplicate b.conf record was dropped; the first one survives.
        assert_eq!(fact.as_object().unwrap().len(), 1);
        assert!(fact.get("example.com_http").is_some());

        let warnings = std::fs::read_to_string(
            out.path()
                .join("metrics/serverfacts.nginx_sites.warnings"),
        )
        .unwrap();
        assert_eq!(warnings, "1");
    }

    #[test]
    fn test_run_without_config_dir_writes_nothing() {
        let fs = MockFileSystem::new();
        let out = tempfile::TempDir::new().unwrap();
        let extractor = NginxExtractor {
            config_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            facts_dir: out.path().join("facts"),
            metrics_dir: out.path().join("metrics"),
        };
        extractor.run(&fs).unwrap();
        assert!(!Path::new(&out.path().join("facts/nginxs.fact")).exists());
    }
}
