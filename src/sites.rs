//! Shared site model for the web/proxy config parsers
//!
//! The nginx, apache and haproxy extractors all emit the same record shape:
//! one entry per declared site name, keyed `name_protocol` in the fact file.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error};

/// Protocol a site is served over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One site as found in a server configuration block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteRecord {
    pub name: String,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_checkout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_to_local_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_to_other_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to_protocol: Option<String>,
}

impl SiteRecord {
    /// Composite key used for duplicate detection across files
    pub fn key(&self) -> String {
        format!("{}_{}", self.name, self.protocol)
    }
}

/// Attribute accumulator for the configuration block being scanned.
///
/// Fields are filled in line by line; `finalize` turns the builder into one
/// immutable record per accumulated alias name.
#[derive(Debug, Clone, Default)]
pub struct SiteBuilder {
    pub names: Vec<String>,
    pub protocol: Protocol,
    pub related_checkout: Option<String>,
    pub proxy_to_local_port: Option<String>,
    pub proxy_to_other_server: Option<String>,
    pub redirect_to: Option<String>,
    pub redirect_to_protocol: Option<String>,
}

impl SiteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// One complete record per declared name. A block that never declared a
    /// name yields nothing.
    pub fn finalize(self) -> Vec<SiteRecord> {
        self.names
            .iter()
            .map(|name| {
                debug!(site = name.as_str(), "Returning site");
                SiteRecord {
                    name: name.clone(),
                    protocol: self.protocol,
                    related_checkout: self.related_checkout.clone(),
                    proxy_to_local_port: self.proxy_to_local_port.clone(),
                    proxy_to_other_server: self.proxy_to_other_server.clone(),
                    redirect_to: self.redirect_to.clone(),
                    redirect_to_protocol: self.redirect_to_protocol.clone(),
                }
            })
            .collect()
    }
}

/// Merges records from multiple config files, keeping the first record per
/// `name_protocol` key and counting collisions for the monitoring scalar.
#[derive(Debug)]
pub struct SiteAggregator {
    server_kind: &'static str,
    sites: BTreeMap<String, SiteRecord>,
    num_duplicates: usize,
}

impl SiteAggregator {
    pub fn new(server_kind: &'static str) -> Self {
        Self {
            server_kind,
            sites: BTreeMap::new(),
            num_duplicates: 0,
        }
    }

    pub fn insert(&mut self, site: SiteRecord, source: &str) {
        let key = site.key();
        if self.sites.contains_key(&key) {
            error!(
                "{} {} site {} from {} is already known",
                self.server_kind, site.protocol, site.name, source
            );
            self.num_duplicates += 1;
            return;
        }
        self.sites.insert(key, site);
    }

    pub fn num_duplicates(&self) -> usize {
        self.num_duplicates
    }

    pub fn into_parts(self) -> (BTreeMap<String, SiteRecord>, usize) {
        (self.sites, self.num_duplicates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_site(name: &str, protocol: Protocol) -> SiteRecord {
        SiteRecord {
            name: name.to_string(),
            protocol,
            related_checkout: None,
            proxy_to_local_port: None,
            proxy_to_other_server: None,
            redirect_to: None,
            redirect_to_protocol: None,
        }
    }

    #[test]
    fn test_finalize_one_record_per_name() {
        let builder = SiteBuilder {
            names: vec!["a.example.com".to_string(), "b.example.com".to_string()],
            protocol: Protocol::Https,
            ..Default::default()
        };

        let records = builder.finalize();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.protocol == Protocol::Https));
        assert_eq!(records[0].name, "a.example.com");
        assert_eq!(records[1].name, "b.example.com");
    }

    #[test]
    fn test_finalize_without_names_yields_nothing() {
        let builder = SiteBuilder {
            protocol: Protocol::Https,
            ..Default::default()
        };
        assert!(builder.finalize().is_empty());
    }

    #[test]
    fn test_key_combines_name_and_protocol() {
        let site = plain_site("a.example.com", Protocol::Https);
        assert_eq!(site.key(), "a.example.com_https");
    }

    #[test]
    fn test_aggregator_keeps_first_and_counts_duplicates() {
        let mut aggregator = SiteAggregator::new("Nginx");
        let mut first = plain_site("a.example.com", Protocol::Http);
        first.proxy_to_local_port = Some("9000".to_string());
        aggregator.insert(first, "a.conf");
        aggregator.insert(plain_site("a.example.com", Protocol::Http), "b.conf");
        // Same name, different protocol: not a duplicate.
        aggregator.insert(plain_site("a.example.com", Protocol::Https), "b.conf");

        let (sites, num_duplicates) = aggregator.into_parts();
        assert_eq!(num_duplicates, 1);
        assert_eq!(sites.len(), 2);
        assert_eq!(
            sites["a.example.com_http"].proxy_to_local_port.as_deref(),
            Some("9000")
        );
    }

    #[test]
    fn test_protocol_serializes_lowercase() {
        let json = serde_json::to_string(&Protocol::Https).unwrap();
        assert_eq!(json, "\"https\"");
    }

    #[test]
    fn test_record_omits_empty_optionals() {
        let json = serde_json::to_string(&plain_site("a.example.com", Protocol::Http)).unwrap();
        assert!(!json.contains("related_checkout"));
        assert!(!json.contains("redirect_to"));
    }
}
