use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_BASELINE_SCALE: f32 = 1.0;
pub const DEFAULT_PLACEHOLDER_PREFIX: &str = "Group";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub render: RenderConfig,
    pub layers: LayerConfig,
    pub navigation: NavigationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub baseline_scale: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            baseline_scale: DEFAULT_BASELINE_SCALE,
        }
    }
}

impl RenderConfig {
    pub fn effective_scale(&self) -> f32 {
        if self.baseline_scale.is_finite() && self.baseline_scale > 0.0 {
            self.baseline_scale
        } else {
            DEFAULT_BASELINE_SCALE
        }
    }
}

/// How a section title that is present but blank is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlankTitlePolicy {
    /// An empty title counts as absent.
    #[default]
    Placeholder,
    /// A whitespace-only title counts as absent.
    Trim,
    /// Any present title is used verbatim, even an empty one.
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub placeholder_prefix: String,
    pub blank_titles: BlankTitlePolicy,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            placeholder_prefix: DEFAULT_PLACEHOLDER_PREFIX.to_string(),
            blank_titles: BlankTitlePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Let previous/next step from the in-flight target instead of being
    /// ignored while a render is running.
    pub step_while_rendering: bool,
}

impl ViewerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ViewerConfig = toml::from_str(raw).context("invalid viewer configuration")?;
        if config.render.effective_scale() != config.render.baseline_scale {
            warn!(
                scale = config.render.baseline_scale,
                "ignoring invalid baseline scale, using {}", DEFAULT_BASELINE_SCALE
            );
        }
        Ok(config)
    }

    /// Reads the config at `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("failed to parse {:?}", path))
    }
}
