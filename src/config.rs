//! Compilation options.
//!
//! Everything here can come from a JSON file; absent keys take the defaults below.
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default bound on one weight artifact.
pub const DEFAULT_CHUNK_SIZE: usize = 5_000_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Class name used for the generated network and the weight symbol prefix.
    pub net_name: String,
    pub chunk_size: usize,
    /// Compute offsets without keeping any weight bytes.
    pub skip_weights: bool,
    /// Name prefixes of two-channel score heads that load with `FOLD`.
    pub fold_layers: Vec<String>,
    /// Layers compiled out when `SPEEDUP_RPN` is defined.
    pub speedup_disabled_layers: Vec<String>,
    /// Reshapes whose channel dim collapses to one when `SPEEDUP_RPN` is defined.
    pub speedup_folded_reshapes: Vec<String>,
    /// Sigmoid layers dropped without emission.
    pub skip_layers: Vec<String>,
    /// Traffic-sign region, selects the class name prefix.
    pub region: Option<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            net_name: "Net".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_weights: false,
            fold_layers: strings(&[
                "rpn_cls_score",
                "seg_score",
                "seg-seg_score",
                "fsd-seg_score",
                "fsd_seg_score",
                "lane-seg_score",
                "lane_seg_score",
                "vp_seg_score",
                "ld_seg_score",
                "boundary_seg_score",
                "ld_vp_seg_score",
            ]),
            speedup_disabled_layers: strings(&[
                "rpn_bbox_pred",
                "rpn_cls_score_reshape",
                "rpn_cls_prob_reshape",
                "rpn_cls_prob",
                "seg_prob",
                "seg-seg_prob",
                "fsd-seg_prob",
                "fsd_seg_prob",
                "lane-seg_prob",
                "lane_seg_prob",
            ]),
            speedup_folded_reshapes: strings(&[
                "seg_score_reshape",
                "seg-seg_score_reshape",
                "fsd-seg_score_reshape",
                "fsd_seg_score_reshape",
                "lane-seg_score_reshape",
                "lane_seg_score_reshape",
            ]),
            skip_layers: strings(&["af_rpn_cls_prob"]),
            region: None,
        }
    }
}

fn listed(names: &[String], layer: &str) -> bool {
    let trimmed = layer
        .char_indices()
        .last()
        .map_or("", |(i, _)| &layer[..i]);
    names.iter().any(|l| l == layer || l == trimmed)
}

impl CompileOptions {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".to_string()));
        }
        if self.net_name.is_empty()
            || !self
                .net_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "net_name `{}` is not a valid identifier",
                self.net_name
            )));
        }
        Ok(())
    }

    /// Exact name, or the name without its last character (`rpn_bbox_pred1`).
    pub fn is_speedup_disabled(&self, layer: &str) -> bool {
        listed(&self.speedup_disabled_layers, layer)
    }

    /// Same name rule as [`Self::is_speedup_disabled`].
    pub fn is_folded_reshape(&self, layer: &str) -> bool {
        listed(&self.speedup_folded_reshapes, layer)
    }

    pub fn is_skipped(&self, layer: &str) -> bool {
        self.skip_layers.iter().any(|l| l == layer)
    }

    /// Configured fold prefixes that `layer` starts with.
    pub fn fold_prefixes<'a>(&'a self, layer: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fold_layers
            .iter()
            .filter(move |p| layer.starts_with(p.as_str()))
            .map(String::as_str)
    }
}
