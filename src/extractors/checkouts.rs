//! Extract information from the checkouts in /srv
//!
//! A checkout lives directly inside `/srv/`; its id is the directory name,
//! so `/srv/site.example.org/` has the id `site.example.org`. Per checkout
//! we record the git state, the installed python packages (buildout or
//! pipenv), the django settings that matter for the inventory, and whether
//! its supervisor-managed processes are running.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::extractors::parsers::freeze::{parse_freeze, parse_python_version};
use crate::extractors::Extractor;
use crate::facts::{self, write_fact, write_scalar};
use crate::fs::{FileSystem, FileType};
use crate::util::{shell_output, whereis};

const SRV_DIR: &str = "/srv";
const FACT_FILE: &str = "checkouts.fact";
const DJANGO_FAILURES_FILE: &str = "serverfacts.bin_django_failures.errors";
const NOT_RUNNING_FILE: &str = "serverfacts.num_not_running.warnings";

// Supervisor entries that are expected to be stopped most of the time
// (cronjob-style one-shot scripts).
const SUPERVISOR_CRONJOB_EXCEPTIONS: [&str; 1] = ["cron"];

static GIT_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        origin               # we want the origin remote
        \W*                  # whitespace
        .*                   # git@ or https://
        github\.com          # hosted on github
        [:/]                 # : (ssh) or / (https)
        (?P<user>[^/\s]+)    # user/org
        /
        (?P<project>\S+?)    # project
        (\.git)?             # optional .git
        \s*
        \(                   # '(fetch)' or '(push)'
        ",
    )
    .expect("valid regex")
});

static EGG_PATH: Lazy<Regex> = Lazy::new(|| {
    // '/srv/x/eggs/Django-1.6.11-py2.7.egg' ties Django to 1.6.11.
    Regex::new(r"/eggs/(?P<name>[^/]+?)-(?P<version>[0-9][^/-]*)-py[0-9.]+").expect("valid regex")
});

static SETTINGS_MODULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"SETTINGS_MODULE\s*=\s*['"](?P<module>[^'"]+)['"]"#).expect("valid regex")
});

static DICT_CHUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("valid regex"));

static DICT_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"'(?P<key>ENGINE|NAME|HOST|USER)':\s*'(?P<value>[^']*)'").expect("valid regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub release: String,
    pub has_local_modifications: bool,
    pub has_untracked_files: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseRef {
    pub name: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DjangoInfo {
    pub databases: Vec<DatabaseRef>,
    pub debug_mode: bool,
    pub settings_module: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutRecord {
    pub name: String,
    pub directory: String,
    pub git: Option<GitInfo>,
    pub eggs: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub django: Option<DjangoInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallMode {
    Buildout,
    Pipenv,
}

/// GitHub https URL out of `git remote -v` output.
pub fn parse_github_url(remote_output: &str) -> Option<String> {
    let mut url = None;
    for line in remote_output.lines() {
        if line.is_empty() {
            continue;
        }
        match GIT_URL.captures(line) {
            Some(captures) => {
                let found = format!(
                    "https://github.com/{}/{}",
                    &captures["user"], &captures["project"]
                );
                debug!("Git repo found: {}", found);
                url = Some(found);
            }
            None => warn!("Non-recognized 'git remote -v' line: {}", line),
        }
    }
    url
}

/// Egg name/version pairs out of a buildout-generated bin script.
///
/// The scripts hardcode their sys.path with one egg directory per line;
/// the directory names carry the versions.
pub fn parse_egg_paths(script_content: &str) -> BTreeMap<String, String> {
    let mut eggs = BTreeMap::new();
    for captures in EGG_PATH.captures_iter(script_content) {
        eggs.insert(captures["name"].to_string(), captures["version"].to_string());
    }
    eggs
}

/// The django settings the inventory cares about, from `diffsettings` output.
///
/// Only `DEBUG`, `DATABASES` and `SETTINGS_MODULE` lines are considered;
/// repr-ish lines (object addresses, datetimes) are dropped up front.
pub fn parse_django_settings(output: &str) -> Option<DjangoInfo> {
    let interesting = ["DEBUG", "DATABASES", "SETTINGS_MODULE"];
    let lines: Vec<&str> = output
        .lines()
        .filter(|line| !line.contains('<') && !line.contains("datetime") && !line.is_empty())
        .filter(|line| {
            line.split_whitespace()
                .next()
                .map(|first| interesting.contains(&first))
                .unwrap_or(false)
        })
        .collect();

    let settings_module = lines
        .iter()
        .find_map(|line| SETTINGS_MODULE.captures(line))
        .map(|captures| captures["module"].to_string());
    let Some(settings_module) = settings_module else {
        warn!("'diffsettings' output could not be parsed:\n{}", output);
        return None;
    };

    let mut databases = Vec::new();
    for line in &lines {
        if !line.starts_with("DATABASES") {
            continue;
        }
        for chunk in DICT_CHUNK.find_iter(line) {
            let mut engine = None;
            let mut name = None;
            let mut host = None;
            let mut user = None;
            for entry in DICT_ENTRY.captures_iter(chunk.as_str()) {
                let value = entry["value"].to_string();
                match &entry["key"] {
                    "ENGINE" => engine = Some(value),
                    "NAME" => name = Some(value),
                    "HOST" => host = Some(value),
                    "USER" => user = Some(value),
                    _ => {}
                }
            }
            let Some(engine) = engine else {
                continue;
            };
            if engine.contains("spatialite") || engine.contains("sqlite") {
                databases.push(DatabaseRef {
                    name: "local sqlite/spatialite file".to_string(),
                    host: "localhost".to_string(),
                    user: None,
                });
            } else if engine.contains("post") {
                databases.push(DatabaseRef {
                    name: name.unwrap_or_default(),
                    host: host
                        .filter(|h| !h.is_empty())
                        .unwrap_or_else(|| "localhost".to_string()),
                    user,
                });
            } else {
                warn!("Unknown db engine {}", engine);
            }
        }
    }

    Some(DjangoInfo {
        databases,
        debug_mode: lines
            .iter()
            .any(|line| line.split_whitespace().next() == Some("DEBUG")),
        settings_module,
    })
}

/// Number of not-running supervisor processes in `supervisorctl status`
/// output, ignoring the cronjob exceptions.
pub fn parse_supervisor_status(output: &str) -> usize {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            !SUPERVISOR_CRONJOB_EXCEPTIONS
                .iter()
                .any(|exception| line.contains(exception))
        })
        .collect();
    let not_running: Vec<&&str> = lines
        .iter()
        .filter(|line| !line.to_lowercase().contains("running"))
        .collect();
    if !not_running.is_empty() {
        warn!("Some supervisor processes aren't running:");
        for line in &not_running {
            warn!("    {}", line);
        }
    }
    not_running.len()
}

fn git_info(fs: &dyn FileSystem, directory: &Path) -> Result<Option<GitInfo>> {
    debug!("Looking in {}...", directory.display());
    if !fs.exists(&directory.join(".git")) {
        warn!("No .git directory found in {}", directory.display());
        return Ok(None);
    }

    let remote = shell_output("git remote -v", Some(directory))?;
    let url = parse_github_url(&remote.stdout);

    let status = shell_output("git status", Some(directory))?;
    let status_output = status.stdout.to_lowercase();
    let release = if status_output.contains("master") {
        debug!("It is a master checkout");
        "master".to_string()
    } else {
        let describe = shell_output("git describe", Some(directory))?;
        let release = describe.stdout.lines().next().unwrap_or("").trim().to_string();
        debug!("We're on a tag or branch: {}", release);
        release
    };

    Ok(Some(GitInfo {
        url,
        release,
        has_local_modifications: status_output.contains("changes not staged"),
        has_untracked_files: status_output.contains("untracked"),
    }))
}

fn buildout_eggs(fs: &dyn FileSystem, directory: &Path) -> Result<Option<BTreeMap<String, String>>> {
    let bin_dir = directory.join("bin");
    if !fs.exists(&bin_dir) {
        return Ok(None);
    }

    for file in ["django", "test", "python"] {
        let script = bin_dir.join(file);
        if !fs.is_file(&script) {
            continue;
        }
        debug!("Looking in bin/{} for eggs+versions", file);
        let content = fs.read_to_string(&script)?;
        let mut eggs = parse_egg_paths(&content);
        if eggs.is_empty() {
            continue;
        }

        // The shebang names the interpreter this buildout runs with.
        let python_executable = content
            .lines()
            .next()
            .unwrap_or("")
            .trim_start_matches("#!")
            .trim();
        let mut python_version = "UNKNOWN".to_string();
        if !python_executable.is_empty() {
            let output = shell_output(
                &format!("{} --version", python_executable),
                Some(directory),
            )?;
            python_version = parse_python_version(&output.stdout, &output.stderr);
        }
        eggs.insert("python".to_string(), python_version);
        return Ok(Some(eggs));
    }
    Ok(None)
}

fn pipenv_eggs(directory: &Path) -> Result<Option<BTreeMap<String, String>>> {
    let output = shell_output("pipenv --where", Some(directory))?;
    if Path::new(output.stdout.trim()) != directory {
        error!("No pipenv found in {}", directory.display());
        return Ok(None);
    }

    let output = shell_output("pipenv run python --version", Some(directory))?;
    let python_version = parse_python_version(&output.stdout, &output.stderr);

    let output = shell_output("pipenv run pip freeze", Some(directory))?;
    let mut packages = parse_freeze(&output.stdout);
    packages.insert("python".to_string(), python_version);
    Ok(Some(packages))
}

fn django_info(command: &str, cwd: Option<&Path>) -> Result<Option<DjangoInfo>> {
    // MPLCONFIGDIR covers the corner case of matplotlib imports in settings.
    let command = format!("sudo -u buildout MPLCONFIGDIR=/tmp {} diffsettings", command);
    debug!("Running {}...", command);
    let output = shell_output(&command, cwd)?;
    if let Some(stderr) = output.error_output() {
        warn!("Error output from diffsettings command: {}", stderr);
        if output.stdout.is_empty() {
            return Ok(None);
        }
    }
    Ok(parse_django_settings(&output.stdout))
}

fn supervisorctl_warnings(supervisorctl_command: &str) -> Result<usize> {
    let command = format!("{} status", supervisorctl_command);
    debug!("Running '{}'...", command);
    let output = shell_output(&command, None)?;
    if let Some(stderr) = output.error_output() {
        warn!("Error output from supervisorctl command: {}", stderr);
    }
    Ok(parse_supervisor_status(&output.stdout))
}

/// Scans /srv and writes the checkouts fact file plus the django-failure
/// and processes-not-running scalars.
pub struct CheckoutsExtractor {
    pub srv_dir: PathBuf,
    pub facts_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for CheckoutsExtractor {
    fn default() -> Self {
        Self {
            srv_dir: PathBuf::from(SRV_DIR),
            facts_dir: PathBuf::from(facts::FACTS_DIR),
            metrics_dir: PathBuf::from(facts::METRICS_DIR),
        }
    }
}

impl CheckoutsExtractor {
    fn detect_mode(&self, fs: &dyn FileSystem, directory: &Path) -> Option<InstallMode> {
        if fs.exists(&directory.join("Pipfile")) && whereis("pipenv").is_some() {
            Some(InstallMode::Pipenv)
        } else if fs.exists(&directory.join("buildout.cfg")) {
            Some(InstallMode::Buildout)
        } else {
            warn!(
                "/srv directory without buildout.cfg or Pipfile: {}",
                directory.display()
            );
            None
        }
    }

    fn examine(
        &self,
        fs: &dyn FileSystem,
        name: &str,
        directory: &Path,
        num_django_failures: &mut u64,
        num_not_running: &mut u64,
    ) -> Result<CheckoutRecord> {
        let mode = self.detect_mode(fs, directory);

        let eggs = match mode {
            Some(InstallMode::Buildout) => buildout_eggs(fs, directory)?,
            Some(InstallMode::Pipenv) => pipenv_eggs(directory)?,
            None => None,
        };

        let mut django = None;
        match mode {
            Some(InstallMode::Buildout) => {
                let bin_django = directory.join("bin").join("django");
                if fs.exists(&bin_django) {
                    django = django_info(&bin_django.display().to_string(), None)?;
                    if django.is_none() {
                        *num_django_failures += 1;
                    }
                } else {
                    debug!("bin/django not found in {}", directory.display());
                }
            }
            Some(InstallMode::Pipenv) => {
                if fs.exists(&directory.join("manage.py")) {
                    django = django_info("pipenv run python manage.py", Some(directory))?;
                    if django.is_none() {
                        *num_django_failures += 1;
                    }
                } else {
                    debug!("manage.py not found in {}", directory.display());
                }
            }
            None => {}
        }

        match mode {
            Some(InstallMode::Buildout) => {
                let bin_supervisor = directory.join("bin").join("supervisorctl");
                if fs.exists(&bin_supervisor) {
                    match supervisorctl_warnings(&bin_supervisor.display().to_string()) {
                        Ok(count) => *num_not_running += count as u64,
                        Err(err) => error!("Error calling {}: {}", bin_supervisor.display(), err),
                    }
                } else {
                    debug!("bin/supervisorctl not found in {}", directory.display());
                }
            }
            Some(InstallMode::Pipenv) => {
                if whereis("supervisorctl").is_some() {
                    // The supervisor conf file is expected in the etc directory.
                    self.pipenv_supervisor(fs, directory, num_not_running)?;
                }
            }
            None => {}
        }

        Ok(CheckoutRecord {
            name: name.to_string(),
            directory: directory.display().to_string(),
            git: git_info(fs, directory)?,
            eggs,
            django,
        })
    }

    fn pipenv_supervisor(
        &self,
        fs: &dyn FileSystem,
        directory: &Path,
        num_not_running: &mut u64,
    ) -> Result<()> {
        let etc_directory = directory.join("etc");
        if !fs.exists(&etc_directory) {
            return Ok(());
        }
        let confs: Vec<_> = fs
            .read_dir(&etc_directory)?
            .into_iter()
            .filter(|entry| entry.name.contains("supervisor") && entry.name.ends_with(".conf"))
            .collect();
        match confs.as_slice() {
            [conf] => {
                let command = format!("supervisorctl -c '{}'", conf.path.display());
                match supervisorctl_warnings(&command) {
                    Ok(count) => *num_not_running += count as u64,
                    Err(err) => error!("Error calling {}: {}", command, err),
                }
            }
            [] => error!(
                "No supervisorctl configuration found in {}",
                etc_directory.display()
            ),
            _ => error!(
                "Multiple supervisorctl configurations found in {}",
                etc_directory.display()
            ),
        }
        Ok(())
    }
}

impl Extractor for CheckoutsExtractor {
    fn name(&self) -> &'static str {
        "checkouts"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        facts::ensure_dir(&self.facts_dir)?;
        if !fs.is_dir(&self.srv_dir) {
            debug!("No {} found, skipping", self.srv_dir.display());
            return Ok(());
        }

        let mut result = BTreeMap::new();
        let mut num_django_failures = 0u64;
        let mut num_not_running = 0u64;
        let mut entries = fs.read_dir(&self.srv_dir)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            if entry.file_type == FileType::Symlink {
                info!("Ignoring {}, it is a symlink", entry.path.display());
                continue;
            }
            if entry.file_type == FileType::File {
                info!(
                    "Ignoring {}, it is a file (*.tgz, for instance)",
                    entry.path.display()
                );
                continue;
            }
            if entry.name == "lost+found" {
                info!("Ignoring /srv/lost+found dir");
                continue;
            }
            let record = self.examine(
                fs,
                &entry.name,
                &entry.path,
                &mut num_django_failures,
                &mut num_not_running,
            )?;
            result.insert(entry.name, record);
        }

        write_fact(&self.facts_dir.join(FACT_FILE), &result)?;
        write_scalar(
            &self.metrics_dir.join(DJANGO_FAILURES_FILE),
            num_django_failures,
        )?;
        write_scalar(&self.metrics_dir.join(NOT_RUNNING_FILE), num_not_running)?;
        Ok(())
    }
}
