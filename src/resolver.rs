use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ConcernFinal, ConcernPrediction, ConcernSource, OfficialConcerns};

/// Predicted concerns carried into the final table when no official entry exists.
pub const TOPK_PRED: usize = 3;

/// Counts per source, logged after the final table is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCounts {
    pub official: usize,
    pub predicted: usize,
    pub none: usize,
}

impl SourceCounts {
    pub fn tally(rows: &[ConcernFinal]) -> Self {
        rows.iter().fold(Self::default(), |mut counts, row| {
            match row.source {
                ConcernSource::Official => counts.official += 1,
                ConcernSource::Predicted => counts.predicted += 1,
                ConcernSource::None => counts.none += 1,
            }
            counts
        })
    }
}

/// Merges official and predicted concerns into one row per canonical
/// product. Official entries always win; predictions fill in up to
/// `top_k` concerns by ascending rank; anything else resolves to `none`.
pub fn resolve_concerns(
    universe: &[i64],
    official: &[OfficialConcerns],
    predictions: &[ConcernPrediction],
    top_k: usize,
) -> PipelineResult<Vec<ConcernFinal>> {
    if universe.is_empty() {
        return Err(PipelineError::EmptyUniverse);
    }

    let mut official_by_product: HashMap<i64, &OfficialConcerns> = HashMap::new();
    for entry in official {
        if entry.concerns.is_empty() {
            continue;
        }
        official_by_product.entry(entry.product_id).or_insert(entry);
    }

    let mut predicted_by_product: HashMap<i64, Vec<&ConcernPrediction>> = HashMap::new();
    for prediction in predictions {
        predicted_by_product
            .entry(prediction.product_id)
            .or_default()
            .push(prediction);
    }
    for entries in predicted_by_product.values_mut() {
        entries.sort_by_key(|p| p.rank);
    }

    let mut seen = HashSet::with_capacity(universe.len());
    let mut rows = Vec::with_capacity(universe.len());
    for product_id in universe {
        if !seen.insert(*product_id) {
            continue;
        }

        if let Some(entry) = official_by_product.get(product_id) {
            rows.push(ConcernFinal {
                product_id: *product_id,
                source: ConcernSource::Official,
                concerns: entry.concerns.clone(),
                concern_types: entry.concern_types.clone(),
            });
            continue;
        }

        let picked: Vec<&ConcernPrediction> = predicted_by_product
            .get(product_id)
            .map(|entries| entries.iter().take(top_k).copied().collect())
            .unwrap_or_default();
        if picked.is_empty() {
            rows.push(ConcernFinal {
                product_id: *product_id,
                source: ConcernSource::None,
                concerns: Vec::new(),
                concern_types: Vec::new(),
            });
        } else {
            rows.push(ConcernFinal {
                product_id: *product_id,
                source: ConcernSource::Predicted,
                concerns: picked.iter().map(|p| p.concern_name.clone()).collect(),
                concern_types: picked.iter().map(|p| p.concern_type.clone()).collect(),
            });
        }
    }

    let counts = SourceCounts::tally(&rows);
    info!(
        official = counts.official,
        predicted = counts.predicted,
        none = counts.none,
        "resolved final concerns"
    );
    Ok(rows)
}
