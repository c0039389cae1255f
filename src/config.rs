use serde::{Deserialize, Serialize};

/// Top-level run configuration, loaded from JSON or built up from CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub confirm: bool,

    #[serde(default)]
    pub max_image_size_mib: Option<u64>,

    #[serde(default)]
    pub vuln_severity_threshold: Option<String>,

    #[serde(default)]
    pub delete_extra_tags: bool,

    #[serde(default)]
    pub minimal_snapshot: bool,

    #[serde(default)]
    pub snapshot_tag: Option<String>,

    #[serde(default)]
    pub output_format: OutputFormat,

    #[serde(default)]
    pub budget_shares: std::collections::BTreeMap<String, f64>,
}

fn default_threads() -> usize {
    10
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            threads: default_threads(),
            confirm: false,
            max_image_size_mib: None,
            vuln_severity_threshold: None,
            delete_extra_tags: false,
            minimal_snapshot: false,
            snapshot_tag: None,
            output_format: OutputFormat::default(),
            budget_shares: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Csv,
}

impl RunConfig {
    pub fn parse_file(path: impl AsRef<std::path::Path>) -> Result<RunConfig, anyhow::Error> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let cfg: RunConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse run config {:?}: {}", path.as_ref(), e))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_dry_run_and_ten_threads() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.threads, 10);
        assert!(!cfg.confirm);
        assert_eq!(cfg.output_format, OutputFormat::Yaml);
    }

    #[test]
    fn parses_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"confirm": true, "threads": 4}"#).unwrap();
        let cfg = RunConfig::parse_file(&path).unwrap();
        assert!(cfg.confirm);
        assert_eq!(cfg.threads, 4);
        assert!(!cfg.delete_extra_tags);
    }
}
