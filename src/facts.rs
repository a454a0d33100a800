//! Fact and scalar file output
//!
//! Every extractor writes one JSON "fact" file for the inventory system and
//! zero or more single-value "scalar" files for the monitoring agent. The
//! fact format is a compatibility contract: mapping with sorted keys,
//! 4-space indentation, written atomically (temp file + rename) so the
//! inventory system never reads a half-written document.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use tracing::info;

/// Directory where fact files for the inventory system live
pub const FACTS_DIR: &str = "/var/local/serverinfo-facts";

/// Directory where scalar files for the monitoring agent live
pub const METRICS_DIR: &str = "/var/local/serverscripts";

/// Create `dir` (and parents) if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        info!("Created {}", dir.display());
    }
    Ok(())
}

/// Serialize `value` as the fact-file JSON dialect: sorted keys, 4-space
/// indent, trailing newline.
pub fn to_fact_json<T: Serialize>(value: &T) -> Result<String> {
    // Round-trip through Value so every mapping comes out sorted, not just
    // the top-level BTreeMap.
    let value = serde_json::to_value(value).context("Failed to serialize facts")?;

    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .context("Failed to render facts as JSON")?;
    out.push(b'\n');

    String::from_utf8(out).context("Fact JSON was not valid UTF-8")
}

/// Write a fact file atomically.
pub fn write_fact<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = to_fact_json(value)?;
    write_atomic(path, json.as_bytes())
}

/// Write a single-value scalar file atomically.
pub fn write_scalar<V: Display>(path: &Path, value: V) -> Result<()> {
    write_atomic(path, value.to_string().as_bytes())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    fs::write(tmp, contents).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(tmp, path).with_context(|| format!("Failed to move {:?} into place", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[derive(Serialize)]
    struct Record {
        zeta: u32,
        alpha: &'static str,
    }

    #[test]
    fn test_keys_are_sorted_recursively() {
        let mut mapping = BTreeMap::new();
        mapping.insert("b".to_string(), Record { zeta: 1, alpha: "x" });
        mapping.insert("a".to_string(), Record { zeta: 2, alpha: "y" });

        let json = to_fact_json(&mapping).unwrap();
        let a = json.find("\"a\"").unwrap();
        let b = json.find("\"b\"").unwrap();
        assert!(a < b);
        // Struct fields are sorted too, not emitted in declaration order.
        let alpha = json.find("\"alpha\"").unwrap();
        let zeta = json.find("\"zeta\"").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_four_space_indent() {
        let mut mapping = BTreeMap::new();
        mapping.insert("site".to_string(), "value");
        let json = to_fact_json(&mapping).unwrap();
        assert!(json.contains("\n    \"site\""));
        assert!(json.ends_with("}\n"));
    }

    #[test]
    fn test_json_roundtrip_is_stable() {
        let mut mapping = BTreeMap::new();
        mapping.insert("b_http".to_string(), Record { zeta: 1, alpha: "x" });
        mapping.insert("a_https".to_string(), Record { zeta: 2, alpha: "y" });

        let json = to_fact_json(&mapping).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(to_fact_json(&parsed).unwrap(), json);
    }

    #[test]
    fn test_write_fact_atomic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facts").join("test.fact");

        let mut mapping = BTreeMap::new();
        mapping.insert("key".to_string(), 42);
        write_fact(&path, &mapping).unwrap();

        let read_back: BTreeMap<String, u32> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read_back["key"], 42);
        // No temp file left behind.
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_write_scalar() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metric.warnings");
        write_scalar(&path, 3).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "3");
    }
}
