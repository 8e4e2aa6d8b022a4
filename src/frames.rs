//! Conversions between polars frames and the typed rows the transforms use.
//!
//! Input frames come from parquet or CSV snapshots, so cells are read through
//! `AnyValue` and coerced leniently. Output list columns are JSON-encoded
//! strings so the same frame can be written to either format.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use polars::prelude::*;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    CategoryAggregate, CategoryPath, CategoryRow, ConcernFinal, ConcernPrediction, DetailRow,
    KeywordRow, OfficialConcernRow, OfficialConcerns, ProductRow, RankScore,
};
use crate::value_utils::{
    anyvalue_to_f64, anyvalue_to_i64, anyvalue_to_string_list, anyvalue_to_text,
    json_text_to_list, to_json_list,
};

pub const PRODUCT_ID: &str = "product_id";
const LEGACY_PRODUCT_ID: &str = "prod_sn";

/// Fails with every missing column listed, sorted.
pub fn require_columns(df: &DataFrame, table: &str, required: &[&str]) -> PipelineResult<()> {
    let present: HashSet<&str> = df.get_column_names().into_iter().collect();
    let mut missing: Vec<String> = required
        .iter()
        .filter(|name| !present.contains(**name))
        .map(|name| name.to_string())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();
    Err(PipelineError::MissingColumns {
        table: table.to_string(),
        columns: missing,
    })
}

fn id_column(df: &DataFrame, table: &str) -> PipelineResult<&'static str> {
    let names = df.get_column_names();
    if names.contains(&PRODUCT_ID) {
        Ok(PRODUCT_ID)
    } else if names.contains(&LEGACY_PRODUCT_ID) {
        Ok(LEGACY_PRODUCT_ID)
    } else {
        Err(PipelineError::MissingColumns {
            table: table.to_string(),
            columns: vec![PRODUCT_ID.to_string()],
        })
    }
}

fn optional_column<'a>(df: &'a DataFrame, name: &str) -> Option<&'a Series> {
    df.column(name).ok()
}

fn text_at(series: Option<&Series>, idx: usize) -> PipelineResult<Option<String>> {
    match series {
        Some(series) => Ok(anyvalue_to_text(&series.get(idx)?)),
        None => Ok(None),
    }
}

/// Ids of every row with a usable product id; unusable ids are skipped.
fn row_ids(df: &DataFrame, table: &str) -> PipelineResult<Vec<Option<i64>>> {
    let series = df.column(id_column(df, table)?)?;
    let mut ids = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        ids.push(anyvalue_to_i64(&series.get(idx)?));
    }
    Ok(ids)
}

/// Distinct ids in first-appearance order.
pub fn unique_ids<I: IntoIterator<Item = i64>>(ids: I) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// Keeps the last row for every key, at that row's position.
pub fn dedupe_keep_last<T, K, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut last: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        last.insert(key(row), idx);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(idx, row)| last.get(&key(row)) == Some(idx))
        .map(|(_, row)| row)
        .collect()
}

pub fn read_product_ids(df: &DataFrame, table: &str) -> PipelineResult<Vec<i64>> {
    Ok(unique_ids(row_ids(df, table)?.into_iter().flatten()))
}

pub fn read_category_rows(df: &DataFrame) -> PipelineResult<Vec<CategoryRow>> {
    const TABLE: &str = "category_map";
    let id_col = id_column(df, TABLE)?;
    require_columns(
        df,
        TABLE,
        &[
            id_col,
            "category_path",
            "category_depth1",
            "category_depth2",
            "category_depth3",
        ],
    )?;
    let ids = row_ids(df, TABLE)?;
    let path = df.column("category_path")?;
    let d1 = df.column("category_depth1")?;
    let d2 = df.column("category_depth2")?;
    let d3 = df.column("category_depth3")?;
    let collected = optional_column(df, "collected_at");

    let mut rows = Vec::with_capacity(df.height());
    for (idx, id) in ids.into_iter().enumerate() {
        let Some(product_id) = id else { continue };
        rows.push(CategoryRow {
            product_id,
            category_path: anyvalue_to_text(&path.get(idx)?),
            depths: CategoryPath::new(
                anyvalue_to_text(&d1.get(idx)?),
                anyvalue_to_text(&d2.get(idx)?),
                anyvalue_to_text(&d3.get(idx)?),
            ),
            collected_at: text_at(collected, idx)?,
        });
    }
    Ok(rows)
}

pub fn read_official_rows(df: &DataFrame) -> PipelineResult<Vec<OfficialConcernRow>> {
    const TABLE: &str = "product_concern_map";
    let id_col = id_column(df, TABLE)?;
    require_columns(df, TABLE, &[id_col, "concern_type", "concern_name"])?;
    let ids = row_ids(df, TABLE)?;
    let types = df.column("concern_type")?;
    let names = df.column("concern_name")?;
    let urls = optional_column(df, "source_url");
    let collected = optional_column(df, "collected_at");

    let mut rows = Vec::with_capacity(df.height());
    for (idx, id) in ids.into_iter().enumerate() {
        let Some(product_id) = id else { continue };
        let (Some(concern_type), Some(concern_name)) = (
            anyvalue_to_text(&types.get(idx)?),
            anyvalue_to_text(&names.get(idx)?),
        ) else {
            continue;
        };
        rows.push(OfficialConcernRow {
            product_id,
            concern_type,
            concern_name,
            source_url: text_at(urls, idx)?,
            collected_at: text_at(collected, idx)?,
        });
    }
    Ok(rows)
}

pub fn read_official_aggregate(df: &DataFrame) -> PipelineResult<Vec<OfficialConcerns>> {
    const TABLE: &str = "product_concerns";
    let id_col = id_column(df, TABLE)?;
    require_columns(df, TABLE, &[id_col, "concern_types", "concerns"])?;
    let ids = row_ids(df, TABLE)?;
    let types = df.column("concern_types")?;
    let names = df.column("concerns")?;

    let mut rows = Vec::with_capacity(df.height());
    for (idx, id) in ids.into_iter().enumerate() {
        let Some(product_id) = id else { continue };
        rows.push(OfficialConcerns {
            product_id,
            concern_types: anyvalue_to_string_list(&types.get(idx)?),
            concerns: anyvalue_to_string_list(&names.get(idx)?),
        });
    }
    Ok(rows)
}

/// At most one keyword row per product; later duplicates are ignored.
pub fn read_keyword_rows(df: &DataFrame) -> PipelineResult<Vec<KeywordRow>> {
    const TABLE: &str = "product_keywords";
    let id_col = id_column(df, TABLE)?;
    require_columns(df, TABLE, &[id_col, "keywords"])?;
    let ids = row_ids(df, TABLE)?;
    let keywords = df.column("keywords")?;

    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(df.height());
    for (idx, id) in ids.into_iter().enumerate() {
        let Some(product_id) = id else { continue };
        if !seen.insert(product_id) {
            continue;
        }
        rows.push(KeywordRow {
            product_id,
            keywords: anyvalue_to_string_list(&keywords.get(idx)?),
        });
    }
    Ok(rows)
}

pub fn read_predictions(df: &DataFrame) -> PipelineResult<Vec<ConcernPrediction>> {
    const TABLE: &str = "product_concern_pred_map";
    let id_col = id_column(df, TABLE)?;
    require_columns(df, TABLE, &[id_col, "concern_type", "concern_name", "rank"])?;
    let ids = row_ids(df, TABLE)?;
    let types = df.column("concern_type")?;
    let names = df.column("concern_name")?;
    let ranks = df.column("rank")?;
    let scores = optional_column(df, "confidence");
    let evidence = optional_column(df, "evidence_keywords");

    let mut rows = Vec::with_capacity(df.height());
    for (idx, id) in ids.into_iter().enumerate() {
        let Some(product_id) = id else { continue };
        let Some(concern_type) = anyvalue_to_text(&types.get(idx)?) else {
            continue;
        };
        let Some(rank) = anyvalue_to_i64(&ranks.get(idx)?).and_then(|r| u32::try_from(r).ok())
        else {
            continue;
        };
        let score = match scores {
            Some(series) => anyvalue_to_f64(&series.get(idx)?).unwrap_or_default(),
            None => 0.0,
        };
        let evidence_keywords = match evidence {
            Some(series) => anyvalue_to_string_list(&series.get(idx)?),
            None => Vec::new(),
        };
        rows.push(ConcernPrediction {
            product_id,
            concern_name: anyvalue_to_text(&names.get(idx)?).unwrap_or_else(|| concern_type.clone()),
            concern_type,
            rank,
            score: RankScore(score),
            evidence_keywords,
        });
    }
    Ok(rows)
}

fn constant_column(name: &str, value: &str, height: usize) -> Series {
    Series::new(name, vec![value.to_string(); height])
}

/// Appends columns holding the same text on every row.
pub fn stamp_columns(df: &mut DataFrame, columns: &[(&str, &str)]) -> PipelineResult<()> {
    let height = df.height();
    for (name, value) in columns {
        df.with_column(constant_column(name, value, height))?;
    }
    Ok(())
}

pub fn category_rows_frame(rows: &[CategoryRow]) -> PipelineResult<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(PRODUCT_ID, rows.iter().map(|r| r.product_id).collect::<Vec<_>>()),
        Series::new(
            "category_depth1",
            rows.iter().map(|r| r.depths.depth1.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "category_depth2",
            rows.iter().map(|r| r.depths.depth2.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "category_depth3",
            rows.iter().map(|r| r.depths.depth3.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "category_path",
            rows.iter().map(|r| r.category_path.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "collected_at",
            rows.iter().map(|r| r.collected_at.clone()).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

pub fn detail_rows_frame(rows: &[DetailRow]) -> PipelineResult<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(PRODUCT_ID, rows.iter().map(|r| r.product_id).collect::<Vec<_>>()),
        Series::new(
            "online_prod_code",
            rows.iter().map(|r| r.online_prod_code.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "detail_url",
            rows.iter().map(|r| r.detail_url.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "collected_at",
            rows.iter().map(|r| r.collected_at.clone()).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

pub fn products_frame(rows: &[ProductRow]) -> PipelineResult<DataFrame> {
    let text = |pick: fn(&ProductRow) -> Option<String>| -> Vec<Option<String>> {
        rows.iter().map(pick).collect()
    };
    let df = DataFrame::new(vec![
        Series::new(PRODUCT_ID, rows.iter().map(|r| r.product_id).collect::<Vec<_>>()),
        Series::new("brand", text(|r| r.brand.clone())),
        Series::new("product_name", text(|r| r.product_name.clone())),
        Series::new("price", rows.iter().map(|r| r.price).collect::<Vec<_>>()),
        Series::new("sale_price", rows.iter().map(|r| r.sale_price).collect::<Vec<_>>()),
        Series::new("capacity", text(|r| r.capacity.clone())),
        Series::new(
            "product_url",
            rows.iter().map(|r| r.product_url.clone()).collect::<Vec<_>>(),
        ),
        Series::new("image_url", text(|r| r.image_url.clone())),
        Series::new(
            "collected_at",
            rows.iter().map(|r| r.collected_at.clone()).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

pub fn official_rows_frame(rows: &[OfficialConcernRow]) -> PipelineResult<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(PRODUCT_ID, rows.iter().map(|r| r.product_id).collect::<Vec<_>>()),
        Series::new(
            "concern_type",
            rows.iter().map(|r| r.concern_type.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "concern_name",
            rows.iter().map(|r| r.concern_name.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "source_url",
            rows.iter().map(|r| r.source_url.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "collected_at",
            rows.iter().map(|r| r.collected_at.clone()).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

pub fn official_aggregate_frame(rows: &[OfficialConcerns]) -> PipelineResult<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(PRODUCT_ID, rows.iter().map(|r| r.product_id).collect::<Vec<_>>()),
        Series::new(
            "concern_types",
            rows.iter()
                .map(|r| to_json_list(&r.concern_types))
                .collect::<Vec<_>>(),
        ),
        Series::new(
            "concerns",
            rows.iter().map(|r| to_json_list(&r.concerns)).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

/// The score column keeps its historical name `confidence`; values are raw
/// ranking scores.
pub fn predictions_frame(rows: &[ConcernPrediction]) -> PipelineResult<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(PRODUCT_ID, rows.iter().map(|r| r.product_id).collect::<Vec<_>>()),
        Series::new(
            "concern_type",
            rows.iter().map(|r| r.concern_type.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "concern_name",
            rows.iter().map(|r| r.concern_name.clone()).collect::<Vec<_>>(),
        ),
        Series::new("rank", rows.iter().map(|r| r.rank).collect::<Vec<_>>()),
        Series::new(
            "confidence",
            rows.iter().map(|r| r.score.value()).collect::<Vec<_>>(),
        ),
        Series::new(
            "evidence_keywords",
            rows.iter()
                .map(|r| to_json_list(&r.evidence_keywords))
                .collect::<Vec<_>>(),
        ),
        constant_column("source", "ocr_keywords", rows.len()),
    ])?;
    Ok(df)
}

pub fn final_frame(rows: &[ConcernFinal]) -> PipelineResult<DataFrame> {
    let df = DataFrame::new(vec![
        Series::new(PRODUCT_ID, rows.iter().map(|r| r.product_id).collect::<Vec<_>>()),
        Series::new(
            "source",
            rows.iter().map(|r| r.source.as_str()).collect::<Vec<_>>(),
        ),
        Series::new(
            "concerns",
            rows.iter().map(|r| to_json_list(&r.concerns)).collect::<Vec<_>>(),
        ),
        Series::new(
            "concern_types",
            rows.iter()
                .map(|r| to_json_list(&r.concern_types))
                .collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

/// Column names added to the product table by `enrich_products`.
pub const ENRICHED_COLUMNS: [&str; 5] = [
    "category_depth1_primary",
    "category_depth2_primary",
    "category_depth3_primary",
    "category_paths_all_json",
    "category_names_all_json",
];

/// Left-joins category aggregates onto the product table. Rows without a
/// usable product id are dropped; every remaining row gets the aggregate for
/// its id, so `aggregates` must already contain fallbacks for uncategorized
/// products.
pub fn enrich_products(
    products: &DataFrame,
    aggregates: &[CategoryAggregate],
) -> PipelineResult<DataFrame> {
    let ids = row_ids(products, "products")?;
    let keep: Vec<bool> = ids.iter().map(Option::is_some).collect();
    let mask = BooleanChunked::from_slice("keep", &keep);
    let mut df = products.filter(&mask)?;
    for name in ENRICHED_COLUMNS {
        if let Ok(next) = df.drop(name) {
            df = next;
        }
    }

    let by_id: HashMap<i64, &CategoryAggregate> =
        aggregates.iter().map(|agg| (agg.product_id, agg)).collect();
    let joined: Vec<Option<&CategoryAggregate>> = ids
        .iter()
        .flatten()
        .map(|id| by_id.get(id).copied())
        .collect();

    let level = |pick: fn(&CategoryPath) -> Option<String>| -> Vec<Option<String>> {
        joined
            .iter()
            .map(|agg| agg.and_then(|a| pick(&a.primary)))
            .collect()
    };
    let depth1 = level(|p| p.depth1.clone());
    let depth2 = level(|p| p.depth2.clone());
    let depth3 = level(|p| p.depth3.clone());
    let paths: Vec<String> = joined
        .iter()
        .map(|agg| agg.map(|a| to_json_list(&a.paths_all)).unwrap_or_else(|| "[]".into()))
        .collect();
    let names: Vec<String> = joined
        .iter()
        .map(|agg| agg.map(|a| to_json_list(&a.names_all)).unwrap_or_else(|| "[]".into()))
        .collect();

    df.with_column(Series::new(ENRICHED_COLUMNS[0], depth1))?;
    df.with_column(Series::new(ENRICHED_COLUMNS[1], depth2))?;
    df.with_column(Series::new(ENRICHED_COLUMNS[2], depth3))?;
    df.with_column(Series::new(ENRICHED_COLUMNS[3], paths))?;
    df.with_column(Series::new(ENRICHED_COLUMNS[4], names))?;
    Ok(df)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConcernSource;

    #[test]
    fn missing_columns_are_listed_sorted() {
        let df = df!("product_id" => &[1i64], "zeta" => &["z"]).unwrap();
        let err = require_columns(&df, "t", &["zeta", "b", "a"]).unwrap_err();
        match err {
            PipelineError::MissingColumns { table, columns } => {
                assert_eq!(table, "t");
                assert_eq!(columns, vec!["a", "b"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn legacy_id_column_is_accepted() {
        let df = df!("prod_sn" => &[3i64, 1, 3], "detail_url" => &["a", "b", "c"]).unwrap();
        assert_eq!(read_product_ids(&df, "detail_urls_all").unwrap(), vec![3, 1]);
    }

    #[test]
    fn string_ids_and_nulls_are_tolerated() {
        let df = df!("product_id" => &[Some("10"), None, Some("x"), Some("11")]).unwrap();
        assert_eq!(read_product_ids(&df, "u").unwrap(), vec![10, 11]);
    }

    #[test]
    fn table_without_id_is_structural_error() {
        let df = df!("url" => &["a"]).unwrap();
        assert!(matches!(
            read_product_ids(&df, "u"),
            Err(PipelineError::MissingColumns { .. })
        ));
    }

    #[test]
    fn keywords_accept_json_text_and_skip_duplicates() {
        let df = df!(
            "product_id" => &[1i64, 2, 1],
            "keywords" => &[Some(r#"["보습","진정"]"#), None, Some(r#"["ignored"]"#)]
        )
        .unwrap();
        let rows = read_keyword_rows(&df).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].keywords, vec!["보습", "진정"]);
        assert!(rows[1].keywords.is_empty());
    }

    #[test]
    fn category_rows_without_timestamp_column() {
        let df = df!(
            "prod_sn" => &[5i64],
            "category_path" => &["스킨케어>클렌징"],
            "category_depth1" => &[Some("스킨케어")],
            "category_depth2" => &[Some("클렌징")],
            "category_depth3" => &[None::<&str>]
        )
        .unwrap();
        let rows = read_category_rows(&df).unwrap();
        assert_eq!(rows[0].product_id, 5);
        assert_eq!(rows[0].depths.depth3, None);
        assert_eq!(rows[0].collected_at, None);
    }

    #[test]
    fn predictions_survive_a_frame_round_trip() {
        let preds = vec![ConcernPrediction {
            product_id: 4,
            concern_type: "dryness".into(),
            concern_name: "건조".into(),
            rank: 1,
            score: RankScore(2.0),
            evidence_keywords: vec!["보습".into()],
        }];
        let df = predictions_frame(&preds).unwrap();
        assert_eq!(read_predictions(&df).unwrap(), preds);
    }

    #[test]
    fn final_frame_encodes_lists_as_json() {
        let rows = vec![ConcernFinal {
            product_id: 1,
            source: ConcernSource::None,
            concerns: vec![],
            concern_types: vec![],
        }];
        let df = final_frame(&rows).unwrap();
        let cell = df.column("concerns").unwrap().get(0).unwrap();
        assert_eq!(anyvalue_to_text(&cell).as_deref(), Some("[]"));
        assert_eq!(
            anyvalue_to_text(&df.column("source").unwrap().get(0).unwrap()).as_deref(),
            Some("none")
        );
    }

    #[test]
    fn enrichment_replaces_stale_columns() {
        let products = df!(
            "product_id" => &[Some(2i64), None, Some(1)],
            "product_name" => &["b", "ghost", "a"],
            "category_depth1_primary" => &["stale", "stale", "stale"]
        )
        .unwrap();
        let aggs = vec![
            crate::category::uncategorized(2, "미분류"),
            CategoryAggregate {
                product_id: 1,
                primary: CategoryPath::new(Some("향수".into()), None, None),
                paths_all: vec!["향수".into()],
                names_all: vec!["향수".into()],
            },
        ];
        let df = enrich_products(&products, &aggs).unwrap();
        assert_eq!(df.height(), 2);
        let d1 = df.column("category_depth1_primary").unwrap();
        assert_eq!(anyvalue_to_text(&d1.get(0).unwrap()).as_deref(), Some("미분류"));
        assert_eq!(anyvalue_to_text(&d1.get(1).unwrap()).as_deref(), Some("향수"));
        let names = df.column("category_names_all_json").unwrap();
        assert_eq!(
            json_text_to_list(&anyvalue_to_text(&names.get(0).unwrap()).unwrap()),
            vec!["미분류"]
        );
    }

    #[test]
    fn dedupe_keeps_last_occurrence_in_place() {
        let rows = vec![(1, "a"), (2, "b"), (1, "c")];
        let out = dedupe_keep_last(rows, |r| r.0);
        assert_eq!(out, vec![(2, "b"), (1, "c")]);
    }
}
