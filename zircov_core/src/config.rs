use crate::cover::{DEFAULT_PC_FIXUP, MAX_COVSZ};
use crate::report::ReportFlags;
use crate::snapshot::DEFAULT_PCS_FILE;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub collect_cover: bool,
    #[serde(default = "default_pcs_file")]
    pub pcs_file: PathBuf,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_pc_fixup")]
    pub pc_fixup: u64,
}

fn default_enabled() -> bool {
    true
}

pub fn default_pcs_file() -> PathBuf {
    PathBuf::from(DEFAULT_PCS_FILE)
}

pub fn default_capacity() -> usize {
    MAX_COVSZ
}

fn default_pc_fixup() -> u64 {
    DEFAULT_PC_FIXUP
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            collect_cover: false,
            pcs_file: default_pcs_file(),
            capacity: default_capacity(),
            pc_fixup: default_pc_fixup(),
        }
    }
}

impl CoverageSettings {
    pub fn report_flags(&self) -> ReportFlags {
        ReportFlags {
            coverage: self.enabled,
            collect_cover: self.enabled && self.collect_cover,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    /// Reply stream destination; stdout when absent.
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub coverage: CoverageSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl ExecutorConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))
    }

    pub fn from_toml(content: &str) -> Result<Self, anyhow::Error> {
        let config: ExecutorConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.coverage.capacity == 0 {
            anyhow::bail!("coverage.capacity must be at least 1");
        }
        Ok(())
    }
}
