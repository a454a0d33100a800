//! Extract information from geoserver
//!
//! Usage per workspace comes from the web server access logs in front of
//! geoserver (GetMap request counts and top referers); the database behind
//! each workspace comes from the datastore descriptors in the geoserver
//! data directory. Expensive (reads whole rotated log collections), so it
//! only runs when invoked explicitly.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::extractors::parsers::clf::ClfRecord;
use crate::extractors::Extractor;
use crate::facts::{self, write_fact};
use crate::fs::FileSystem;

const CONFIG_FILE: &str = "/etc/serverscripts/geoserver.json";
const FACT_FILE: &str = "geoserver.fact";
const TOP_REFERERS: usize = 5;

/// One monitored geoserver instance
#[derive(Debug, Clone, Deserialize)]
pub struct GeoserverConfig {
    pub geoserver_name: String,
    pub logfile: PathBuf,
    pub data_dir: PathBuf,
}

/// One GetMap request seen in the access logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHit {
    pub workspace: String,
    pub referer: Option<String>,
}

/// Database info parsed from one datastore.xml
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatastoreInfo {
    pub store_type: Option<String>,
    pub enabled: Option<String>,
    pub database_server: Option<String>,
    pub database_name: Option<String>,
    pub database_user: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspaceRecord {
    pub workspace_name: String,
    pub geoserver_name: String,
    pub usage: usize,
    pub referer_list: Vec<String>,
    pub referers: String,
    pub enabled: String,
    #[serde(rename = "type")]
    pub store_type: String,
    pub database_server: String,
    pub database_name: String,
    pub database_user: String,
}

/// Load the geoserver config: a JSON list of instances to examine.
pub fn load_config(fs: &dyn FileSystem, path: &Path) -> Option<Vec<GeoserverConfig>> {
    if !fs.exists(path) {
        return None;
    }
    let content = match fs.read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!("Unreadable config file {}: {}", path.display(), err);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(config) => Some(config),
        Err(err) => {
            warn!("Faulty config file {}: {}", path.display(), err);
            None
        }
    }
}

/// Workspace and referer host for one access log line, if it is a valid
/// GetMap request.
pub fn extract_from_line(line: &str) -> Option<LogHit> {
    let clf = ClfRecord::parse(line)?;

    let referer = match clf.referer.as_str() {
        "" | "-" => None,
        // 'https://wpn.klimaatatlas.net/' keeps just the host.
        referer => Some(
            referer
                .split('/')
                .nth(2)
                .unwrap_or(referer)
                .to_string(),
        ),
    };

    // 'GET /geoserver/klimaatatlas/wms?service=WMS&... HTTP/1.1'
    let url = clf.request.split_whitespace().nth(1)?;
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let workspace = match path.split('/').nth(2) {
        Some(workspace) if !workspace.is_empty() => workspace.to_string(),
        // favicon.ico or something like that.
        _ => return None,
    };
    let has_layers = query
        .split('&')
        .any(|param| param.split('=').next() == Some("layers"));
    if !has_layers {
        return None;
    }

    Some(LogHit { workspace, referer })
}

/// GetMap hits from the logfile and its rotated siblings (`access.log`,
/// `access.log.1`, `access.log.2.gz`, ...).
pub fn extract_from_logfiles(fs: &dyn FileSystem, logfile: &Path) -> Result<Vec<LogHit>> {
    let dir = logfile.parent().context("logfile has no parent directory")?;
    let basename = logfile
        .file_name()
        .context("logfile has no file name")?
        .to_string_lossy()
        .into_owned();

    let mut entries = fs.read_dir(dir)?;
    entries.retain(|entry| entry.name.starts_with(&basename));
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut results = Vec::new();
    let mut num_lines = 0usize;
    for entry in entries {
        debug!("Reading logfile {}", entry.path.display());
        let raw = fs.read(&entry.path)?;
        let content = if entry.name.ends_with(".gz") {
            let mut decoded = String::new();
            GzDecoder::new(raw.as_slice())
                .read_to_string(&mut decoded)
                .with_context(|| format!("Failed to decompress {:?}", entry.path))?;
            decoded
        } else {
            String::from_utf8_lossy(&raw).into_owned()
        };

        for line in content.lines() {
            num_lines += 1;
            if !line.contains("/geoserver/") || !line.contains("GetMap") {
                continue;
            }
            if let Some(hit) = extract_from_line(line) {
                results.push(hit);
            }
        }
    }
    debug!("Grabbed {} lines, {} GetMap hits", num_lines, results.len());
    Ok(results)
}

/// Hosts shown in the fact file are shortened to their first label; IP
/// addresses stay as they are.
fn shorten_host(host: &str) -> String {
    let is_ip = host
        .split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    if is_ip {
        host.to_string()
    } else {
        host.split('.').next().unwrap_or(host).to_string()
    }
}

/// Database connection info from one datastore.xml document.
pub fn extract_datastore_info(xml: &str) -> Result<DatastoreInfo> {
    let document = roxmltree::Document::parse(xml).context("Unparseable datastore.xml")?;
    let root = document.root_element();
    let text_of = |tag: &str| {
        root.children()
            .find(|node| node.has_tag_name(tag))
            .and_then(|node| node.text())
            .map(str::to_string)
    };

    let mut result = DatastoreInfo {
        store_type: text_of("type"),
        enabled: text_of("enabled"),
        ..Default::default()
    };

    if let Some(connection) = root
        .children()
        .find(|node| node.has_tag_name("connectionParameters"))
    {
        let entry_of = |key: &str| {
            connection
                .children()
                .find(|node| {
                    node.has_tag_name("entry") && node.attribute("key") == Some(key)
                })
                .and_then(|node| node.text())
                .map(str::to_string)
        };
        result.database_server = entry_of("host").map(|host| shorten_host(&host));
        result.database_name = entry_of("database");
        result.database_user = entry_of("user");
    }

    Ok(result)
}

fn combine_with_comma<'a>(values: impl Iterator<Item = Option<&'a String>>) -> String {
    let unique: BTreeSet<&String> = values.flatten().collect();
    unique
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Datastore info per workspace from `data_dir/workspaces/*/*/datastore.xml`.
pub fn extract_from_dirs(
    fs: &dyn FileSystem,
    data_dir: &Path,
) -> Result<BTreeMap<String, Vec<DatastoreInfo>>> {
    let workspaces_dir = data_dir.join("workspaces");
    let mut result: BTreeMap<String, Vec<DatastoreInfo>> = BTreeMap::new();
    if !fs.is_dir(&workspaces_dir) {
        return Ok(result);
    }

    for workspace in fs.read_dir(&workspaces_dir)? {
        if !fs.is_dir(&workspace.path) {
            continue;
        }
        for store in fs.read_dir(&workspace.path)? {
            let datastore_file = store.path.join("datastore.xml");
            if !fs.is_file(&datastore_file) {
                continue;
            }
            let xml = fs.read_to_string(&datastore_file)?;
            match extract_datastore_info(&xml) {
                Ok(info) => result
                    .entry(workspace.name.clone())
                    .or_default()
                    .push(info),
                Err(err) => warn!("Skipping {}: {}", datastore_file.display(), err),
            }
        }
    }
    Ok(result)
}

/// Usage and datastore info per workspace for one geoserver instance.
pub fn extract_workspaces_info(
    fs: &dyn FileSystem,
    configuration: &GeoserverConfig,
) -> Result<Vec<WorkspaceRecord>> {
    let hits = extract_from_logfiles(fs, &configuration.logfile)?;

    let mut usage_per_workspace: HashMap<&str, usize> = HashMap::new();
    for hit in &hits {
        *usage_per_workspace.entry(hit.workspace.as_str()).or_default() += 1;
    }
    let mut workspaces: Vec<(&str, usize)> = usage_per_workspace.into_iter().collect();
    workspaces.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    let datastores = extract_from_dirs(fs, &configuration.data_dir)?;

    let mut result = Vec::new();
    for (workspace_name, usage) in workspaces {
        let mut referer_counts: HashMap<&str, usize> = HashMap::new();
        for hit in hits.iter().filter(|hit| hit.workspace == workspace_name) {
            if let Some(referer) = &hit.referer {
                *referer_counts.entry(referer.as_str()).or_default() += 1;
            }
        }
        let mut referers: Vec<(&str, usize)> = referer_counts.into_iter().collect();
        referers.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        let referer_list: Vec<String> = referers
            .into_iter()
            .take(TOP_REFERERS)
            .map(|(referer, _)| referer.to_string())
            .collect();

        let stores = datastores.get(workspace_name);
        let combine = |field: fn(&DatastoreInfo) -> Option<&String>| match stores {
            Some(stores) => combine_with_comma(stores.iter().map(field)),
            None => String::new(),
        };

        result.push(WorkspaceRecord {
            workspace_name: workspace_name.to_string(),
            geoserver_name: configuration.geoserver_name.clone(),
            usage,
            referers: referer_list.join(" + "),
            referer_list,
            enabled: combine(|info| info.enabled.as_ref()),
            store_type: combine(|info| info.store_type.as_ref()),
            database_server: combine(|info| info.database_server.as_ref()),
            database_name: combine(|info| info.database_name.as_ref()),
            database_user: combine(|info| info.database_user.as_ref()),
        });
    }
    Ok(result)
}

/// Examines every configured geoserver and writes the geoserver fact file.
pub struct GeoserverExtractor {
    pub config_file: PathBuf,
    pub facts_dir: PathBuf,
}

impl Default for GeoserverExtractor {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(CONFIG_FILE),
            facts_dir: PathBuf::from(facts::FACTS_DIR),
        }
    }
}

impl Extractor for GeoserverExtractor {
    fn name(&self) -> &'static str {
        "geoserver"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        let Some(configuration) = load_config(fs, &self.config_file) else {
            debug!("No usable {} found, skipping", self.config_file.display());
            return Ok(());
        };

        let mut result = BTreeMap::new();
        for geoserver_configuration in &configuration {
            let workspaces = extract_workspaces_info(fs, geoserver_configuration)?;
            result.insert(geoserver_configuration.geoserver_name.clone(), workspaces);
        }
        if result.is_empty() {
            return Ok(());
        }

        write_fact(&self.facts_dir.join(FACT_FILE), &result)?;
        Ok(())
    }
}
