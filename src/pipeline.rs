//! Stage orchestration over the snapshot store.
//!
//! Every stage loads the latest snapshots it depends on, runs a pure
//! transform, and only then saves its own snapshot, so a failing stage
//! persists nothing.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use polars::prelude::*;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::category::{aggregate_categories, align_to_products};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::frames::{
    category_rows_frame, detail_rows_frame, enrich_products, final_frame,
    official_aggregate_frame, official_rows_frame, predictions_frame, products_frame,
    read_category_rows, read_keyword_rows, read_official_aggregate, read_official_rows,
    read_predictions, read_product_ids, require_columns, stamp_columns, unique_ids, PRODUCT_ID,
};
use crate::official::{aggregate_official, official_coverage, official_rows_from_listings, read_listing_csv};
use crate::payload::{
    category_rows_from_items, detail_rows_from_items, extract_items, product_rows_from_items,
};
use crate::resolver::{resolve_concerns, SourceCounts};
use crate::scoring::predict_concerns;
use crate::snapshot::{latest_snapshot, SnapshotStore};

/// Location of one table family inside the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    pub dir: &'static str,
    pub prefix: &'static str,
}

impl Table {
    pub const DETAIL_URLS: Table = Table {
        dir: "raw/detail_urls",
        prefix: "detail_urls_all",
    };
    pub const PRODUCTS: Table = Table {
        dir: "raw/products",
        prefix: "products",
    };
    pub const CATEGORY_MAP: Table = Table {
        dir: "raw/category_map",
        prefix: "category_map",
    };
    pub const CONCERN_MAP: Table = Table {
        dir: "raw/product_concern_map",
        prefix: "product_concern_map",
    };
    pub const KEYWORDS: Table = Table {
        dir: "raw/product_keywords",
        prefix: "product_keywords",
    };
    pub const PRODUCT_CONCERNS: Table = Table {
        dir: "derived/product_concerns",
        prefix: "product_concerns",
    };
    pub const PREDICTIONS: Table = Table {
        dir: "derived/product_concern_pred_map",
        prefix: "product_concern_pred_map",
    };
    pub const FINAL: Table = Table {
        dir: "derived/product_concern_final",
        prefix: "product_concern_final",
    };
    pub const ENRICHED: Table = Table {
        dir: "processed/products_enriched",
        prefix: "products_enriched",
    };
}

/// Columns `validate` requires, and the ones whose null ratio it reports.
const TABLE_CHECKS: [(Table, &[&str], &[&str]); 9] = [
    (Table::DETAIL_URLS, &["detail_url"], &["detail_url"]),
    (Table::PRODUCTS, &["product_url", "product_name"], &["product_name", "price"]),
    (
        Table::CATEGORY_MAP,
        &["category_path", "category_depth1", "category_depth2", "category_depth3"],
        &["category_depth1", "category_depth2", "category_depth3"],
    ),
    (Table::CONCERN_MAP, &["concern_type", "concern_name"], &["concern_name"]),
    (Table::KEYWORDS, &["keywords"], &["keywords"]),
    (Table::PRODUCT_CONCERNS, &["concern_types", "concerns"], &[]),
    (
        Table::PREDICTIONS,
        &["concern_type", "concern_name", "rank", "confidence"],
        &["evidence_keywords"],
    ),
    (Table::FINAL, &["source", "concerns", "concern_types"], &[]),
    (
        Table::ENRICHED,
        &["category_depth1_primary", "category_paths_all_json", "category_names_all_json"],
        &["category_depth2_primary", "category_depth3_primary"],
    ),
];

/// Row count and null ratios of one latest snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TableReport {
    pub table: &'static str,
    pub path: Option<PathBuf>,
    pub rows: usize,
    pub null_ratios: Vec<(String, f64)>,
}

/// Output paths of a full derivation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub product_concerns: PathBuf,
    pub predictions: PathBuf,
    pub final_concerns: PathBuf,
    pub features: PathBuf,
}

fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Reads a saved listing response. A top-level array is taken as a list of
/// page payloads.
fn read_pages(path: &Path) -> anyhow::Result<Vec<Value>> {
    let file = File::open(path).with_context(|| format!("failed to open payload file {:?}", path))?;
    let value: Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse payload file {:?}", path))?;
    Ok(match value {
        Value::Array(pages) => pages,
        page => vec![page],
    })
}

fn read_listing_json(path: &Path) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let file = File::open(path).with_context(|| format!("failed to open listing file {:?}", path))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse listing file {:?}", path))
}

fn null_ratio(df: &DataFrame, column: &str) -> Option<f64> {
    let series = df.column(column).ok()?;
    if df.height() == 0 {
        return Some(0.0);
    }
    Some(series.null_count() as f64 / df.height() as f64)
}

pub struct Pipeline {
    config: PipelineConfig,
    store: SnapshotStore,
    run_id: Uuid,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let store = config.snapshot_store();
        Self {
            config,
            store,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn load(&self, table: Table) -> PipelineResult<DataFrame> {
        self.store.load_latest_table(table.dir, table.prefix)
    }

    pub fn save(&self, df: &mut DataFrame, table: Table) -> PipelineResult<PathBuf> {
        Ok(self.store.save_table(df, table.dir, table.prefix)?)
    }

    /// Canonical product ids in first-appearance order.
    pub fn universe(&self) -> PipelineResult<Vec<i64>> {
        let df = self.load(Table::DETAIL_URLS)?;
        let ids = read_product_ids(&df, Table::DETAIL_URLS.prefix)?;
        if ids.is_empty() {
            return Err(PipelineError::EmptyUniverse);
        }
        Ok(ids)
    }

    fn read_payload_pages(&self, payloads: &[PathBuf]) -> PipelineResult<Vec<Value>> {
        let mut pages = Vec::new();
        for path in payloads {
            let file_pages = read_pages(path)?;
            info!(path = %path.display(), pages = file_pages.len(), "read payload file");
            pages.extend(file_pages);
        }
        Ok(pages)
    }

    /// Builds the canonical universe and the product table from saved
    /// listing responses. The configured sample is applied here so every
    /// later stage sees the sampled universe.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn ingest_products(&self, payloads: &[PathBuf]) -> PipelineResult<(PathBuf, PathBuf)> {
        let pages = self.read_payload_pages(payloads)?;
        let items: Vec<_> = pages.iter().flat_map(extract_items).collect();
        let collected_at = now_stamp();

        let details = detail_rows_from_items(&items, &collected_at);
        let keep: HashSet<i64> = self
            .config
            .sample
            .apply(details.iter().map(|row| row.product_id).collect())
            .into_iter()
            .collect();
        let details: Vec<_> = details
            .into_iter()
            .filter(|row| keep.contains(&row.product_id))
            .collect();
        if details.is_empty() {
            return Err(PipelineError::empty_result(Table::DETAIL_URLS.prefix));
        }

        let products: Vec<_> = product_rows_from_items(&items, &collected_at, self.config.brand.as_deref())
            .into_iter()
            .filter(|row| keep.contains(&row.product_id))
            .collect();

        let mut detail_df = detail_rows_frame(&details)?;
        let mut products_df = products_frame(&products)?;
        let detail_path = self.save(&mut detail_df, Table::DETAIL_URLS)?;
        let products_path = self.save(&mut products_df, Table::PRODUCTS)?;
        info!(
            items = items.len(),
            universe = details.len(),
            products = products.len(),
            sampled = self.config.sample.enabled,
            "QA: product ingestion"
        );
        Ok((detail_path, products_path))
    }

    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn ingest_categories(&self, payloads: &[PathBuf]) -> PipelineResult<PathBuf> {
        let pages = self.read_payload_pages(payloads)?;
        let items: Vec<_> = pages.iter().flat_map(extract_items).collect();
        let rows = category_rows_from_items(&items, &now_stamp(), &self.config.normalizer());
        if rows.is_empty() {
            return Err(PipelineError::empty_result(Table::CATEGORY_MAP.prefix));
        }

        let mut df = category_rows_frame(&rows)?;
        let path = self.save(&mut df, Table::CATEGORY_MAP)?;
        let uncategorized = rows.iter().filter(|row| row.depths.is_empty()).count();
        let products = unique_ids(rows.iter().map(|row| row.product_id)).len();
        info!(
            rows = rows.len(),
            products,
            without_labels = uncategorized,
            "QA: category ingestion"
        );
        Ok(path)
    }

    /// Builds the official concern map from scraped listing links, given as
    /// a JSON object `{concern_type: [href, ...]}` or a `concern_type,href`
    /// CSV file.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn ingest_official(&self, listing: &Path) -> PipelineResult<PathBuf> {
        let listings = match listing.extension().and_then(|ext| ext.to_str()) {
            Some("csv") => read_listing_csv(listing)?,
            _ => read_listing_json(listing)?,
        };
        let sources = self.config.load_official_sources()?;
        let universe = self.universe()?;
        let rows = official_rows_from_listings(&sources, &listings, &universe, &now_stamp())?;

        let mut df = official_rows_frame(&rows)?;
        let path = self.save(&mut df, Table::CONCERN_MAP)?;
        let coverage = official_coverage(&rows, &universe);
        info!(
            total = coverage.total_products,
            mapped = coverage.mapped_products,
            unmapped = coverage.total_products - coverage.mapped_products,
            multi_concern = coverage.multi_concern.len(),
            unmapped_sample = ?coverage.unmapped_sample,
            "QA: official concern map"
        );
        Ok(path)
    }

    /// Aggregates official concern rows into one row per canonical product.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn derive_official(&self) -> PipelineResult<PathBuf> {
        let universe = self.universe()?;
        let rows = read_official_rows(&self.load(Table::CONCERN_MAP)?)?;
        let aggregated = aggregate_official(&rows, &universe);

        let mut df = official_aggregate_frame(&aggregated)?;
        let stamp = now_stamp();
        stamp_columns(&mut df, &[("collected_at", stamp.as_str())])?;
        let path = self.save(&mut df, Table::PRODUCT_CONCERNS)?;
        let with_concern = aggregated.iter().filter(|row| !row.concerns.is_empty()).count();
        info!(
            total = aggregated.len(),
            with_concern,
            without = aggregated.len() - with_concern,
            "QA: official concern aggregate"
        );
        Ok(path)
    }

    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn derive_predictions(&self) -> PipelineResult<PathBuf> {
        let rules = self.config.load_concern_rules()?;
        let universe = self.universe()?;
        let keywords = read_keyword_rows(&self.load(Table::KEYWORDS)?)?;
        let predictions = predict_concerns(&universe, &keywords, &rules, self.config.top_k_per_product)?;

        let mut df = predictions_frame(&predictions)?;
        let stamp = now_stamp();
        stamp_columns(&mut df, &[("created_at", stamp.as_str())])?;
        let path = self.save(&mut df, Table::PREDICTIONS)?;
        let predicted = unique_ids(predictions.iter().map(|p| p.product_id)).len();
        info!(
            rules = rules.len(),
            total = universe.len(),
            keyword_rows = keywords.len(),
            predicted,
            unpredicted = universe.len().saturating_sub(predicted),
            rows = predictions.len(),
            "QA: concern predictions"
        );
        Ok(path)
    }

    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn derive_final(&self) -> PipelineResult<PathBuf> {
        let universe = self.universe()?;
        let official = read_official_aggregate(&self.load(Table::PRODUCT_CONCERNS)?)?;
        let predictions = read_predictions(&self.load(Table::PREDICTIONS)?)?;
        let rows = resolve_concerns(&universe, &official, &predictions, self.config.top_k_pred)?;

        let mut df = final_frame(&rows)?;
        let stamp = now_stamp();
        stamp_columns(&mut df, &[("created_at", stamp.as_str())])?;
        let path = self.save(&mut df, Table::FINAL)?;
        let counts = SourceCounts::tally(&rows);
        info!(
            total = rows.len(),
            official = counts.official,
            predicted = counts.predicted,
            none = counts.none,
            "QA: final concerns"
        );
        Ok(path)
    }

    /// Joins category aggregates onto the product table. A missing or empty
    /// category table only downgrades every product to the fallback.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn build_features(&self) -> PipelineResult<PathBuf> {
        let products = self.load(Table::PRODUCTS)?;
        let product_ids = read_product_ids(&products, Table::PRODUCTS.prefix)?;
        if product_ids.is_empty() {
            return Err(PipelineError::EmptyUniverse);
        }

        let category_rows = match self.load(Table::CATEGORY_MAP) {
            Ok(df) => read_category_rows(&df)?,
            Err(PipelineError::SnapshotNotFound { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        if category_rows.is_empty() {
            warn!("category_map empty, every product falls back to the uncategorized label");
        }

        let aggregates = align_to_products(
            &product_ids,
            &aggregate_categories(&category_rows),
            &self.config.uncategorized_label,
        );
        let mapped = aggregates.iter().filter(|agg| !agg.paths_all.is_empty()).count();

        let mut df = enrich_products(&products, &aggregates)?;
        let stamp = now_stamp();
        stamp_columns(&mut df, &[("enriched_at", stamp.as_str())])?;
        let path = self.save(&mut df, Table::ENRICHED)?;
        info!(
            total = product_ids.len(),
            mapped,
            unmapped = product_ids.len() - mapped,
            "QA: product features"
        );
        Ok(path)
    }

    /// Loads every latest snapshot, checks its required columns, and reports
    /// row counts with null ratios. Absent snapshots are reported, not fatal.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn validate(&self) -> PipelineResult<Vec<TableReport>> {
        let mut reports = Vec::with_capacity(TABLE_CHECKS.len());
        for (table, required, nullable) in TABLE_CHECKS {
            let df = match self.load(table) {
                Ok(df) => df,
                Err(PipelineError::SnapshotNotFound { .. }) => {
                    warn!(table = table.prefix, "no snapshot to validate");
                    reports.push(TableReport {
                        table: table.prefix,
                        path: None,
                        rows: 0,
                        null_ratios: Vec::new(),
                    });
                    continue;
                }
                Err(err) => return Err(err),
            };
            let mut columns: Vec<&str> = required.to_vec();
            let legacy_id = df.get_column_names().contains(&"prod_sn");
            if !legacy_id {
                columns.push(PRODUCT_ID);
            }
            require_columns(&df, table.prefix, &columns)?;

            let null_ratios: Vec<(String, f64)> = nullable
                .iter()
                .filter_map(|column| null_ratio(&df, column).map(|ratio| (column.to_string(), ratio)))
                .collect();
            info!(
                table = table.prefix,
                rows = df.height(),
                nulls = ?null_ratios,
                "QA: snapshot validated"
            );
            reports.push(TableReport {
                table: table.prefix,
                path: latest_snapshot(&self.store.dir(table.dir), table.prefix).ok(),
                rows: df.height(),
                null_ratios,
            });
        }
        Ok(reports)
    }

    /// Runs every derivation stage in dependency order.
    pub fn run_all(&self) -> PipelineResult<RunSummary> {
        info!(run_id = %self.run_id, run_date = self.store.run_date(), "starting derivation run");
        let summary = RunSummary {
            product_concerns: self.derive_official()?,
            predictions: self.derive_predictions()?,
            final_concerns: self.derive_final()?,
            features: self.build_features()?,
        };
        info!(run_id = %self.run_id, "derivation run finished");
        Ok(summary)
    }
}
