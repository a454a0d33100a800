//! Extract info on docker
//!
//! Counts come from `docker system df`, the container list from
//! `docker ps`, and python-based containers get their interpreter version
//! and package list probed through `docker exec`.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::extractors::parsers::freeze::{parse_freeze, parse_python_version};
use crate::extractors::Extractor;
use crate::facts::{self, write_fact, write_scalar};
use crate::fs::FileSystem;
use crate::util::shell_output;

const DOCKER_ETC: &str = "/etc/docker";
const FACT_FILE: &str = "docker.fact";
const DOCKER_PS_FIELDS: [&str; 11] = [
    "ID",
    "Image",
    "Command",
    "CreatedAt",
    "RunningFor",
    "Ports",
    // "State" errors on older docker, "Labels" is a very long field.
    "Status",
    "Size",
    "Names",
    "Mounts",
    "Networks",
];
// Recognize a python interpreter by the presence of one of these in the
// container command:
const PYTHON_EXEC_OPTIONS: [&str; 6] = [
    "python",
    "python3",
    "bin/python",
    ".venv/bin/python",
    "/usr/bin/python",
    "/usr/bin/python3",
];
const DOCKER_EXEC_ERROR: &str = "OCI runtime exec failed:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PythonInfo {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub eggs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub command: String,
    pub createdat: String,
    pub runningfor: String,
    pub ports: String,
    pub status: String,
    pub size: String,
    pub names: String,
    pub mounts: String,
    pub networks: String,
    pub python: PythonInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DockerCounts {
    pub active_images: i64,
    pub active_containers: i64,
    pub active_volumes: i64,
}

#[derive(Debug, Serialize)]
pub struct DockerFact {
    pub available: bool,
    pub active: bool,
    pub containers: Vec<ContainerInfo>,
}

/// Active images/containers/volumes from `docker system df` output.
///
/// The output is column-aligned::
///
///   TYPE                TOTAL               ACTIVE              SIZE
///   Images              50                  2                   16.66 GB
///   Containers          2                   2                   70 B
///   Local Volumes       3                   3                   123 MB
///
/// Counts are read from the column under the ACTIVE header. Returns None
/// when the header is missing (docker errored or output format changed).
pub fn parse_system_df(output: &str) -> Option<DockerCounts> {
    let lines: Vec<String> = output
        .lines()
        .map(|line| line.trim_end().to_lowercase())
        .filter(|line| !line.is_empty())
        .collect();
    let header = lines.first()?;
    let start_column = header.find("active")?;

    let mut counts = DockerCounts::default();
    for line in &lines[1..] {
        let end = (start_column + 4).min(line.len());
        let cell = line.get(start_column..end).unwrap_or("").trim();
        let count: i64 = match cell.parse() {
            Ok(count) => count,
            Err(_) => {
                warn!("Couldn't parse active count {:?} in line: {}", cell, line);
                continue;
            }
        };
        if line.contains("images") {
            counts.active_images = count;
        }
        if line.contains("containers") {
            counts.active_containers = count;
        }
        if line.contains("volumes") {
            counts.active_volumes = count;
        }
    }
    Some(counts)
}

/// One container record per `docker ps` output line (tab-separated fields in
/// DOCKER_PS_FIELDS order).
pub fn parse_containers(output: &str) -> Vec<ContainerInfo> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            let field = |i: usize| parts.get(i).copied().unwrap_or("").to_string();
            ContainerInfo {
                id: field(0),
                image: field(1),
                command: field(2),
                createdat: field(3),
                runningfor: field(4),
                ports: field(5),
                status: field(6),
                size: field(7),
                names: field(8),
                mounts: field(9),
                networks: field(10),
                python: PythonInfo::default(),
            }
        })
        .collect()
}

/// The python interpreter to try inside a container, guessed from its
/// command line.
pub fn guess_python_exec(command: &str) -> String {
    let split_command: Vec<&str> = command.trim_matches('"').split(' ').collect();
    for python_exec in PYTHON_EXEC_OPTIONS {
        if split_command.contains(&python_exec) {
            return python_exec.to_string();
        }
    }
    // Some other command (gunicorn; bin/gunicorn): try a python next to it.
    let first = split_command.first().copied().unwrap_or_default();
    match first.rsplit_once('/') {
        Some((dirname, _)) => format!("{}/python", dirname),
        None => "python3".to_string(),
    }
}

fn python_details(container: &ContainerInfo) -> Result<PythonInfo> {
    let python_exec = guess_python_exec(&container.command);
    let python_in_docker = format!("docker exec {} {}", container.id, python_exec);

    debug!(
        "Running {} --version in container '{}'..",
        python_exec, container.names
    );
    let output = shell_output(&format!("{} --version", python_in_docker), None)?;
    if output.stdout.starts_with(DOCKER_EXEC_ERROR) || output.stdout.starts_with("Traceback") {
        info!("Did not find Python in docker {}", container.names);
        return Ok(PythonInfo::default());
    }
    let python_version = parse_python_version(&output.stdout, &output.stderr);
    info!(
        "Found Python {} ('{}') in container '{}'..",
        python_version, python_exec, container.names
    );

    debug!(
        "Running {} -m pip freeze --all in container '{}'..",
        python_exec, container.names
    );
    let output = shell_output(&format!("{} -m pip freeze --all", python_in_docker), None)?;
    if output.stdout.starts_with(DOCKER_EXEC_ERROR) {
        warn!("Error output from pip freeze in docker: {}", output.stdout);
    }
    let mut eggs = parse_freeze(&output.stdout);
    eggs.insert("python".to_string(), python_version);

    Ok(PythonInfo { eggs })
}

/// Queries the docker daemon and writes the docker fact file plus the
/// active image/container/volume scalars.
pub struct DockerExtractor {
    pub etc_dir: PathBuf,
    pub facts_dir: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for DockerExtractor {
    fn default() -> Self {
        Self {
            etc_dir: PathBuf::from(DOCKER_ETC),
            facts_dir: PathBuf::from(facts::FACTS_DIR),
            metrics_dir: PathBuf::from(facts::METRICS_DIR),
        }
    }
}

impl DockerExtractor {
    fn gather(&self) -> Result<(Option<DockerCounts>, Vec<ContainerInfo>)> {
        debug!("Running 'docker system df'...");
        let output = shell_output("docker system df", None)?;
        if let Some(stderr) = output.error_output() {
            warn!("Error output from docker command: {}", stderr);
        }
        let counts = parse_system_df(&output.stdout);

        let format: String = DOCKER_PS_FIELDS
            .iter()
            .map(|field| format!("{{{{.{}}}}}", field))
            .collect::<Vec<_>>()
            .join("\t");
        debug!("Running 'docker ps'...");
        let output = shell_output(
            &format!("docker ps --no-trunc --format '{}'", format),
            None,
        )?;
        let mut containers = Vec::new();
        if let Some(stderr) = output.error_output() {
            warn!("Error output from docker command: {}", stderr);
        } else {
            containers = parse_containers(&output.stdout);
        }

        for container in containers.iter_mut() {
            let python = python_details(container)?;
            container.python = python;
        }
        Ok((counts, containers))
    }
}

impl Extractor for DockerExtractor {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn run(&self, fs: &dyn FileSystem) -> Result<()> {
        facts::ensure_dir(&self.facts_dir)?;
        if !fs.exists(&self.etc_dir) {
            debug!("No {} found, skipping", self.etc_dir.display());
            return Ok(());
        }

        let (counts, containers) = self.gather()?;
        let active = counts
            .map(|c| c.active_images > 0 || c.active_containers > 0 || c.active_volumes > 0)
            .unwrap_or(false)
            || !containers.is_empty();
        if let Some(counts) = counts {
            info!("Found {} active docker containers", counts.active_containers);
        }

        let fact = DockerFact {
            available: true,
            active,
            containers,
        };
        write_fact(&self.facts_dir.join(FACT_FILE), &fact)?;

        if let Some(counts) = counts {
            write_scalar(
                &self
                    .metrics_dir
                    .join("serverfacts.num_active_docker_images.info"),
                counts.active_images,
            )?;
            write_scalar(
                &self
                    .metrics_dir
                    .join("serverfacts.num_active_docker_containers.info"),
                counts.active_containers,
            )?;
            write_scalar(
                &self
                    .metrics_dir
                    .join("serverfacts.num_active_docker_volumes.info"),
                counts.active_volumes,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM_DF: &str = "\
TYPE                TOTAL               ACTIVE              SIZE                RECLAIMABLE
Images              50                  2                   16.66 GB            16.13 GB (96%)
Containers          2                   2                   70 B                0 B (0%)
Local Volumes       3                   3                   123 MB              0 B (0%)
";

    #[test]
    fn test_parse_system_df() {
        let counts = parse_system_df(SYSTEM_DF).unwrap();
        assert_eq!(counts.active_images, 2);
        assert_eq!(counts.active_containers, 2);
        assert_eq!(counts.active_volumes, 3);
    }

    #[test]
    fn test_parse_system_df_without_header() {
        assert_eq!(parse_system_df(""), None);
        assert_eq!(parse_system_df("Cannot connect to the Docker daemon\n"), None);
    }

    #[test]
    fn test_parse_system_df_unparsable_count_skipped() {
        let output = "\
TYPE                TOTAL               ACTIVE              SIZE
Images              50                  ??                  16.66 GB
Containers          2                   2                   70 B
";
        let counts = parse_system_df(output).unwrap();
        assert_eq!(counts.active_images, 0);
        assert_eq!(counts.active_containers, 2);
    }

    #[test]
    fn test_parse_containers() {
        let line = [
            "abc123",
            "example/image:latest",
            "\"python manage.py runserver\"",
            "2026-01-12 10:00:00 +0100 CET",
            "3 weeks ago",
            "0.0.0.0:8000->8000/tcp",
            "Up 3 weeks",
            "70B",
            "web_1",
            "/srv/data",
            "bridge",
        ]
        .join("\t");
        let containers = parse_containers(&format!("{}\n", line));
        assert_eq!(containers.len(), 1);
        let container = &containers[0];
        assert_eq!(container.id, "abc123");
        assert_eq!(container.names, "web_1");
        assert_eq!(container.networks, "bridge");
        assert_eq!(container.python, PythonInfo::default());
    }

    #[test]
    fn test_parse_containers_short_line() {
        let containers = parse_containers("abc123\timage\n");
        assert_eq!(containers[0].id, "abc123");
        assert_eq!(containers[0].command, "");
    }

    #[test]
    fn test_guess_python_exec_direct() {
        assert_eq!(guess_python_exec("\"python manage.py\""), "python");
        assert_eq!(
            guess_python_exec("\".venv/bin/python -m gunicorn\""),
            ".venv/bin/python"
        );
    }

    #[test]
    fn test_guess_python_exec_sibling_of_command() {
        assert_eq!(guess_python_exec("\"bin/gunicorn app\""), "bin/python");
    }

    #[test]
    fn test_guess_python_exec_fallback() {
        assert_eq!(guess_python_exec("\"gunicorn app\""), "python3");
    }
}
