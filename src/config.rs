use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

use crate::category::{CategoryNormalizer, DEFAULT_TOP_CATEGORIES, DEFAULT_UNCATEGORIZED};
use crate::error::{PipelineError, PipelineResult};
use crate::official::{sources_from_yaml_str, OfficialSource};
use crate::resolver::TOPK_PRED;
use crate::scoring::{ConcernRules, TOPK_PER_PRODUCT};
use crate::snapshot::{today, validate_run_date, OutputFormat, SnapshotStore};

pub const DEFAULT_CONFIG_PATH: &str = "./config/pipeline.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleMethod {
    #[default]
    Head,
    Random,
}

/// Optional down-sampling of the canonical universe for trial runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub enabled: bool,
    pub n: usize,
    pub method: SampleMethod,
    pub seed: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            n: 0,
            method: SampleMethod::Head,
            seed: 42,
        }
    }
}

impl SampleConfig {
    /// Applies the sample to ids in universe order. Randomly picked ids stay
    /// in universe order.
    pub fn apply(&self, ids: Vec<i64>) -> Vec<i64> {
        if !self.enabled {
            return ids;
        }
        let n = self.n.min(ids.len());
        match self.method {
            SampleMethod::Head => ids.into_iter().take(n).collect(),
            SampleMethod::Random => {
                let mut rng = fastrand::Rng::with_seed(self.seed);
                let mut positions: Vec<usize> = (0..ids.len()).collect();
                rng.shuffle(&mut positions);
                let mut picked: Vec<usize> = positions.into_iter().take(n).collect();
                picked.sort_unstable();
                picked.into_iter().map(|idx| ids[idx]).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Brand recorded on listed products that carry no brand name.
    pub brand: Option<String>,
    pub top_categories: Vec<String>,
    pub uncategorized_label: String,
    pub concern_rules_path: PathBuf,
    pub official_sources_path: PathBuf,
    pub output_format: OutputFormat,
    pub run_date: Option<String>,
    pub top_k_per_product: usize,
    pub top_k_pred: usize,
    pub sample: SampleConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            brand: None,
            top_categories: DEFAULT_TOP_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            uncategorized_label: DEFAULT_UNCATEGORIZED.to_string(),
            concern_rules_path: PathBuf::from("./config/concern_pred_rules.yaml"),
            official_sources_path: PathBuf::from("./config/concerns_filter_urls.yaml"),
            output_format: OutputFormat::Parquet,
            run_date: None,
            top_k_per_product: TOPK_PER_PRODUCT,
            top_k_pred: TOPK_PRED,
            sample: SampleConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> PipelineResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(format!("pipeline config: {}", e)))
    }

    /// Loads the YAML file when it exists, falls back to defaults otherwise,
    /// then applies environment overrides.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let mut config = if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {:?}", path))?;
            Self::from_yaml_str(&text)?
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `RUN_DATE`, `OUTPUT_FORMAT` and `DATA_DIR` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> PipelineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(date) = lookup("RUN_DATE").filter(|v| !v.trim().is_empty()) {
            self.run_date = Some(date.trim().to_string());
        }
        if let Some(format) = lookup("OUTPUT_FORMAT").filter(|v| !v.trim().is_empty()) {
            self.output_format = format.parse()?;
        }
        if let Some(dir) = lookup("DATA_DIR").filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.top_k_per_product == 0 || self.top_k_pred == 0 {
            return Err(PipelineError::InvalidConfig(
                "top-k limits must be at least 1".into(),
            ));
        }
        if self.uncategorized_label.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "uncategorized_label must not be blank".into(),
            ));
        }
        if let Some(date) = &self.run_date {
            validate_run_date(date)?;
        }
        Ok(())
    }

    pub fn run_date(&self) -> String {
        self.run_date.clone().unwrap_or_else(today)
    }

    pub fn normalizer(&self) -> CategoryNormalizer {
        CategoryNormalizer::new(self.top_categories.iter().cloned())
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.data_dir.clone(), self.output_format, self.run_date())
    }

    pub fn load_concern_rules(&self) -> PipelineResult<ConcernRules> {
        let text = fs::read_to_string(&self.concern_rules_path).with_context(|| {
            format!("failed to read concern rules {:?}", self.concern_rules_path)
        })?;
        ConcernRules::from_yaml_str(&text)
    }

    pub fn load_official_sources(&self) -> PipelineResult<Vec<OfficialSource>> {
        let text = fs::read_to_string(&self.official_sources_path).with_context(|| {
            format!(
                "failed to read official sources {:?}",
                self.official_sources_path
            )
        })?;
        sources_from_yaml_str(&text)
    }
}
