//! Configuration: command-line flags and the JSON model catalog.
//!
//! The catalog file declares the model descriptors, the named modes, the
//! memory budget, and the selection knobs. It is read once at startup; the
//! registry built from it is immutable for the life of the process.

use crate::modes::ModeDefinition;
use crate::registry::{
    BackendKind, ComplexityBucket, ModelDescriptor, ModelPurpose, ModelRegistry,
};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Command-line options for the gantry server.
#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// The port on which the control/status API will listen.
    #[arg(short = 'p', long, default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The model catalog file.
    #[arg(short = 'f', long)]
    pub catalog: PathBuf,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "gantry")]
    pub metrics_prefix: String,
}

impl Cli {
    pub fn validate(self) -> Result<Self> {
        if !self.catalog.exists() {
            return Err(anyhow!(
                "Catalog file '{}' does not exist",
                self.catalog.display()
            ));
        }
        Ok(self)
    }
}

/// One model entry in the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub backend: BackendKind,
    pub purpose: ModelPurpose,
    pub memory_cost_gb: f64,
    pub max_context_tokens: u32,
    pub endpoint: Url,
    #[serde(default)]
    pub latency_estimates_ms: HashMap<ComplexityBucket, f64>,
}

/// Memory budget section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSpec {
    pub total_capacity_gb: f64,
    #[serde(default = "default_reserved_margin_gb")]
    pub reserved_margin_gb: f64,
    /// Telemetry is polled at most this often.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_reserved_margin_gb() -> f64 {
    1.0
}

fn default_refresh_interval_secs() -> u64 {
    5
}

/// Selection knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSpec {
    /// Contexts above this many tokens prefer a long-context model.
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: u32,
}

impl Default for SelectionSpec {
    fn default() -> Self {
        Self {
            long_context_threshold: default_long_context_threshold(),
        }
    }
}

fn default_long_context_threshold() -> u32 {
    16_384
}

/// The whole catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub models: HashMap<String, ModelSpec>,
    pub modes: HashMap<String, ModeDefinition>,
    /// Mode active at startup. Defaults to "standard" when present, else the
    /// catalog must name one explicitly.
    #[serde(default)]
    pub default_mode: Option<String>,
    pub budget: BudgetSpec,
    #[serde(default)]
    pub selection: SelectionSpec,
}

impl Catalog {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;

        let catalog: Catalog = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse catalog file: {}", path.display()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Cross-field validation: mode membership, solo arity, budget sanity.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(anyhow!("catalog declares no models"));
        }
        if self.modes.is_empty() {
            return Err(anyhow!("catalog declares no modes"));
        }
        if self.budget.total_capacity_gb <= self.budget.reserved_margin_gb {
            return Err(anyhow!(
                "budget: total capacity ({} GB) must exceed the reserved margin ({} GB)",
                self.budget.total_capacity_gb,
                self.budget.reserved_margin_gb
            ));
        }

        for (mode_name, mode) in &self.modes {
            if mode.models.is_empty() {
                return Err(anyhow!("mode '{mode_name}' has no members"));
            }
            if mode.solo && mode.models.len() != 1 {
                return Err(anyhow!(
                    "solo mode '{mode_name}' must have exactly one member, has {}",
                    mode.models.len()
                ));
            }
            for member in &mode.models {
                if !self.models.contains_key(member) {
                    return Err(anyhow!(
                        "mode '{mode_name}' references unknown model '{member}'"
                    ));
                }
            }
            if let Some(primary) = &mode.primary {
                if !mode.models.contains(primary) {
                    return Err(anyhow!(
                        "mode '{mode_name}' primary '{primary}' is not a member"
                    ));
                }
            }
        }

        let initial = self.initial_mode();
        if !self.modes.contains_key(&initial) {
            return Err(anyhow!("default mode '{initial}' is not defined"));
        }
        Ok(())
    }

    /// The mode to start in.
    pub fn initial_mode(&self) -> String {
        match &self.default_mode {
            Some(mode) => mode.clone(),
            None if self.modes.contains_key("standard") => "standard".to_string(),
            // Falls back to any mode; validate() rejects the empty case.
            None => self.modes.keys().next().cloned().unwrap_or_default(),
        }
    }

    /// Build the immutable registry from the catalog.
    pub fn build_registry(&self) -> ModelRegistry {
        let mut descriptors: Vec<ModelDescriptor> = self
            .models
            .iter()
            .map(|(name, spec)| {
                ModelDescriptor::builder()
                    .name(name.clone())
                    .backend(spec.backend)
                    .purpose(spec.purpose)
                    .memory_cost_gb(spec.memory_cost_gb)
                    .max_context_tokens(spec.max_context_tokens)
                    .endpoint(spec.endpoint.clone())
                    .latency_estimates_ms(spec.latency_estimates_ms.clone())
                    .build()
            })
            .collect();
        // HashMap iteration order is arbitrary; keep the catalog deterministic.
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        ModelRegistry::new(descriptors)
    }
}
