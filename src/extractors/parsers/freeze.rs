//! Parse `pip freeze` and `python --version` output
//!
//! Used for the package inventory of /srv checkouts and of python-based
//! docker containers.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

static EDITABLE_PKG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^-e                  # editable install
        \W*                  # whitespace
        .*                   # git@ or https://
        github\.com          # hosted on github
        [:/]                 # : (ssh) or / (https)
        (?P<user>.+)         # user/org
        /
        (?P<project>\S+?)    # project
        (\.git)?             # optional .git
        @(?P<ref>.+)         # branch or revision
        \#egg=
        (?P<module>.+)$      # module name
        ",
    )
    .expect("valid regex")
});

static PYTHON_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Python\W*(?P<version>[0-9][0-9.]*)").expect("valid regex")
});

/// Package name/version mapping from `pip freeze` output.
///
/// Regular lines look like `name==version`; editable github checkouts are
/// recorded as `project: ref`. Anything else is skipped.
pub fn parse_freeze(output: &str) -> BTreeMap<String, String> {
    let mut packages = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("-e") {
            if let Some(captures) = EDITABLE_PKG.captures(line) {
                packages.insert(captures["project"].to_string(), captures["ref"].to_string());
            }
            continue;
        }
        let mut parts = line.splitn(2, "==");
        match (parts.next(), parts.next()) {
            (Some(name), Some(version)) if !name.is_empty() => {
                packages.insert(name.to_string(), version.to_string());
            }
            _ => {
                // Not a name==version pin.
                continue;
            }
        }
    }
    packages
}

/// Python version number from `python --version` output.
///
/// Old interpreters print the version on stderr, new ones on stdout, so both
/// streams are passed in. Returns "UNKNOWN" when no version is recognized.
pub fn parse_python_version(stdout: &str, stderr: &str) -> String {
    let combined = format!("{} {}", stdout, stderr).replace('\n', " ");
    match PYTHON_VERSION.captures(&combined) {
        Some(captures) => {
            let version = captures["version"].to_string();
            debug!("Python version used: {}", version);
            version
        }
        None => "UNKNOWN".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_freeze_plain_pins() {
        let output = "Django==1.11.29\nrequests==2.25.1\n";
        let packages = parse_freeze(output);
        assert_eq!(packages.len(), 2);
        assert_eq!(packages["Django"], "1.11.29");
        assert_eq!(packages["requests"], "2.25.1");
    }

    #[test]
    fn test_parse_freeze_skips_invalid_lines() {
        let output = "Django==1.11.29\nnot-a-pin\n\n# comment-ish\n";
        let packages = parse_freeze(output);
        assert_eq!(packages.len(), 1);
    }

    #[test]
    fn test_parse_freeze_editable_github() {
        let output = "-e git+git@github.com:example/widget.git@1.2#egg=widget\n";
        let packages = parse_freeze(output);
        assert_eq!(packages["widget"], "1.2");
    }

    #[test]
    fn test_parse_python_version_stdout() {
        assert_eq!(parse_python_version("Python 3.8.10\n", ""), "3.8.10");
    }

    #[test]
    fn test_parse_python_version_stderr() {
        // Python 2 printed its version on stderr.
        assert_eq!(parse_python_version("", "Python 2.7.10\n"), "2.7.10");
    }

    #[test]
    fn test_parse_python_version_unknown() {
        assert_eq!(parse_python_version("sh: not found", ""), "UNKNOWN");
    }
}
