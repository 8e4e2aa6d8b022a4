use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ConcernPrediction, ConcernTrigger, KeywordRow, RankScore, ScoredConcern};

/// Upper bound on predicted concerns kept per product.
pub const TOPK_PER_PRODUCT: usize = 3;
/// Evidence keywords retained per predicted concern.
pub const MAX_EVIDENCE: usize = 5;

#[derive(Debug, Deserialize)]
struct RuleSpec {
    name: Option<String>,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    triggers: Vec<String>,
}

fn default_weight() -> f64 {
    1.0
}

/// Ordered concern trigger configuration. Iteration order is the order the
/// rules were declared in and doubles as the scoring tie-break.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcernRules {
    rules: Vec<ConcernTrigger>,
}

impl ConcernRules {
    pub fn new(rules: Vec<ConcernTrigger>) -> PipelineResult<Self> {
        if rules.is_empty() {
            return Err(PipelineError::EmptyRules);
        }
        for rule in &rules {
            if !rule.weight.is_finite() || rule.weight < 0.0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "concern {} has invalid weight {}",
                    rule.concern_type, rule.weight
                )));
            }
        }
        let rules = rules
            .into_iter()
            .map(|rule| ConcernTrigger {
                triggers: rule
                    .triggers
                    .iter()
                    .map(|t| normalize_keyword(t))
                    .filter(|t| !t.is_empty())
                    .collect(),
                ..rule
            })
            .collect();
        Ok(Self { rules })
    }

    /// Parses a YAML mapping of `concern_type -> {name, weight, triggers}`.
    pub fn from_yaml_str(text: &str) -> PipelineResult<Self> {
        let mapping: serde_yaml::Mapping = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(format!("concern rules: {}", e)))?;
        let mut rules = Vec::with_capacity(mapping.len());
        for (key, value) in &mapping {
            let concern_type = key
                .as_str()
                .map(str::to_string)
                .or_else(|| key.as_i64().map(|n| n.to_string()))
                .ok_or_else(|| {
                    PipelineError::InvalidConfig(format!("concern rule key {:?} is not a string", key))
                })?;
            let spec: RuleSpec = serde_yaml::from_value(value.clone()).map_err(|e| {
                PipelineError::InvalidConfig(format!("concern rule {}: {}", concern_type, e))
            })?;
            rules.push(ConcernTrigger {
                name: spec.name.unwrap_or_else(|| concern_type.clone()),
                concern_type,
                weight: spec.weight,
                triggers: spec.triggers,
            });
        }
        Self::new(rules)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConcernTrigger> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

pub fn normalize_keyword(keyword: &str) -> String {
    keyword.trim().to_lowercase()
}

/// Scores one product's OCR keywords against every rule and keeps the
/// `TOPK_PER_PRODUCT` best concern types.
pub fn score_product<S: AsRef<str>>(keywords: &[S], rules: &ConcernRules) -> Vec<ScoredConcern> {
    score_product_top_k(keywords, rules, TOPK_PER_PRODUCT)
}

/// Triggers match as substrings of any normalized keyword. Rules with no
/// hits are left out entirely. Ties in score keep rule declaration order.
pub fn score_product_top_k<S: AsRef<str>>(
    keywords: &[S],
    rules: &ConcernRules,
    top_k: usize,
) -> Vec<ScoredConcern> {
    let keywords: Vec<String> = keywords
        .iter()
        .map(|k| normalize_keyword(k.as_ref()))
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<ScoredConcern> = Vec::new();
    for rule in rules.iter() {
        let mut hits: Vec<String> = Vec::new();
        for trigger in &rule.triggers {
            if hits.contains(trigger) {
                continue;
            }
            if keywords.iter().any(|k| k.contains(trigger.as_str())) {
                hits.push(trigger.clone());
            }
        }
        if hits.is_empty() {
            continue;
        }
        let score = RankScore(hits.len() as f64 * rule.weight);
        hits.truncate(MAX_EVIDENCE);
        scored.push(ScoredConcern {
            concern_type: rule.concern_type.clone(),
            concern_name: rule.name.clone(),
            rank: 0,
            score,
            evidence_keywords: hits,
        });
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(top_k);
    for (idx, item) in scored.iter_mut().enumerate() {
        item.rank = idx as u32 + 1;
    }
    scored
}

/// Builds the prediction table for every product in `universe`; products
/// without keyword rows are scored against an empty list. Fails when no
/// product produced a single prediction.
pub fn predict_concerns(
    universe: &[i64],
    keywords: &[KeywordRow],
    rules: &ConcernRules,
    top_k: usize,
) -> PipelineResult<Vec<ConcernPrediction>> {
    if rules.is_empty() {
        return Err(PipelineError::EmptyRules);
    }

    let mut by_product: HashMap<i64, &[String]> = HashMap::with_capacity(keywords.len());
    for row in keywords {
        by_product
            .entry(row.product_id)
            .or_insert(row.keywords.as_slice());
    }

    let mut predictions = Vec::new();
    let mut seen: HashMap<(i64, String), usize> = HashMap::new();
    for product_id in universe {
        let product_keywords = by_product.get(product_id).copied().unwrap_or(&[]);
        let scored = score_product_top_k(product_keywords, rules, top_k);
        debug!(product_id, hits = scored.len(), "scored product");
        for item in scored {
            let key = (*product_id, item.concern_type.clone());
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key, predictions.len());
            predictions.push(ConcernPrediction {
                product_id: *product_id,
                concern_type: item.concern_type,
                concern_name: item.concern_name,
                rank: item.rank,
                score: item.score,
                evidence_keywords: item.evidence_keywords,
            });
        }
    }

    if predictions.is_empty() {
        return Err(PipelineError::empty_result("product_concern_pred_map"));
    }
    info!(
        products = universe.len(),
        rows = predictions.len(),
        "built concern predictions"
    );
    Ok(predictions)
}
