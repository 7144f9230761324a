//! Pipeline configuration stored under `.porter/state/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::plan::EngineKind;
use crate::core::semantics::DriftThresholds;

/// Pipeline configuration (TOML).
///
/// This file is edited by humans and must stay stable and automatable.
/// Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PorterConfig {
    /// Per-engine wall-clock budget in seconds for one invocation.
    pub engine_timeout_secs: u64,

    /// Wall-clock budget in seconds for a task's validation command.
    pub validation_timeout_secs: u64,

    /// Truncate captured engine stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Source files at or below this size are inlined into prompts;
    /// larger files are snapshotted and referenced by path.
    pub inline_source_limit_bytes: usize,

    /// Maximum bytes for a prompt pack before dropping sections.
    pub prompt_budget_bytes: usize,

    pub thresholds: DriftThresholds,

    pub arbitration: ArbitrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Candidate engines tried for each arbitrated task.
    pub engines: Vec<EngineKind>,
    pub judge_engine: EngineKind,
    pub max_candidates: usize,
    pub use_judge: bool,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            engines: vec![EngineKind::Qwen, EngineKind::Claude],
            judge_engine: EngineKind::Codex,
            max_candidates: 2,
            use_judge: true,
        }
    }
}

impl Default for PorterConfig {
    fn default() -> Self {
        Self {
            engine_timeout_secs: 300,
            validation_timeout_secs: 30,
            output_limit_bytes: 100_000,
            inline_source_limit_bytes: 10_000,
            prompt_budget_bytes: 40_000,
            thresholds: DriftThresholds::default(),
            arbitration: ArbitrationConfig::default(),
        }
    }
}

impl PorterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engine_timeout_secs == 0 {
            return Err(anyhow!("engine_timeout_secs must be > 0"));
        }
        if self.validation_timeout_secs == 0 {
            return Err(anyhow!("validation_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.arbitration.max_candidates == 0 {
            return Err(anyhow!("arbitration.max_candidates must be > 0"));
        }
        if self.arbitration.engines.is_empty() {
            return Err(anyhow!("arbitration.engines must not be empty"));
        }
        if self
            .arbitration
            .engines
            .iter()
            .any(|engine| engine.is_mechanical())
        {
            return Err(anyhow!("arbitration.engines must not contain mechanical engines"));
        }
        Ok(())
    }
}

/// Load config from a TOML file. Missing file returns defaults.
pub fn load_config(path: &Path) -> Result<PorterConfig> {
    if !path.exists() {
        let cfg = PorterConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PorterConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PorterConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
