use std::fs;
use std::path::{Path, PathBuf};

use catalog_concerns::frames::PRODUCT_ID;
use catalog_concerns::snapshot::OutputFormat;
use catalog_concerns::value_utils::{anyvalue_to_i64, anyvalue_to_text, json_text_to_list};
use catalog_concerns::{Pipeline, PipelineConfig, PipelineError, Table};
use polars::prelude::*;
use rstest::{fixture, rstest};
use serde_json::json;
use tempfile::TempDir;

const RULES: &str = r#"
dryness:
  name: 건조
  weight: 1.0
  triggers: [수분, 보습]
sensitivity:
  name: 민감
  weight: 1.5
  triggers: [진정, 시카]
"#;

const SOURCES: &str = r#"
concerns:
  dryness:
    name: 건조
    url: https://example.com/dryness
"#;

struct Workspace {
    dir: TempDir,
    pipeline: Pipeline,
}

impl Workspace {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write_json(&self, name: &str, value: serde_json::Value) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, value.to_string()).unwrap();
        path
    }
}

fn workspace_with(format: OutputFormat) -> Workspace {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("rules.yaml"), RULES).unwrap();
    fs::write(dir.path().join("sources.yaml"), SOURCES).unwrap();
    let config = PipelineConfig {
        data_dir: dir.path().join("data"),
        concern_rules_path: dir.path().join("rules.yaml"),
        official_sources_path: dir.path().join("sources.yaml"),
        output_format: format,
        run_date: Some("2024-06-01".into()),
        ..PipelineConfig::default()
    };
    Workspace {
        pipeline: Pipeline::new(config),
        dir,
    }
}

#[fixture]
fn ws() -> Workspace {
    workspace_with(OutputFormat::Parquet)
}

fn ingest_inputs(ws: &Workspace) {
    let products = ws.write_json(
        "products.json",
        json!([
            {"data": {"list": [
                {"onlineProdSn": 101, "onlineProdName": "수분 크림", "standardPrice": 30000},
                {"onlineProdSn": 102, "onlineProdName": "보습 토너"}
            ]}},
            {"data": {"list": [
                {"onlineProdSn": "103", "onlineProdName": "시카 세럼"},
                {"onlineProdSn": 104, "onlineProdName": "향수"}
            ]}}
        ]),
    );
    ws.pipeline.ingest_products(&[products]).unwrap();

    let categories = ws.write_json(
        "categories.json",
        json!({"products": [
            {"onlineProdSn": 101, "displayCateNames": ["스킨케어", "크림"]},
            {"onlineProdSn": 101, "displayCateNames": ["클렌징", "스킨케어"]},
            {"onlineProdSn": 102, "displayCateNames": ["토너", "스킨케어"]}
        ]}),
    );
    ws.pipeline.ingest_categories(&[categories]).unwrap();

    let listing = ws.write_json(
        "listing.json",
        json!({"dryness": [
            "/kr/ko/product/detail?onlineProdSn=101&onlineProdCode=A",
            "/kr/ko/product/detail?onlineProdSn=999"
        ]}),
    );
    ws.pipeline.ingest_official(&listing).unwrap();

    let mut keywords = df!(
        PRODUCT_ID => &[102i64, 103, 101],
        "keywords" => &[r#"["수분 가득"]"#, r#"["진정", "시카 성분"]"#, r#"["보습"]"#]
    )
    .unwrap();
    ws.pipeline.save(&mut keywords, Table::KEYWORDS).unwrap();
}

fn text_column(df: &DataFrame, name: &str) -> Vec<Option<String>> {
    let series = df.column(name).unwrap();
    (0..df.height())
        .map(|idx| anyvalue_to_text(&series.get(idx).unwrap()))
        .collect()
}

fn id_column(df: &DataFrame) -> Vec<i64> {
    let series = df.column(PRODUCT_ID).unwrap();
    (0..df.height())
        .map(|idx| anyvalue_to_i64(&series.get(idx).unwrap()).unwrap())
        .collect()
}

fn assert_full_run(ws: &Workspace) {
    ingest_inputs(ws);
    let summary = ws.pipeline.run_all().unwrap();
    assert!(summary.final_concerns.exists());

    let final_df = ws.pipeline.load(Table::FINAL).unwrap();
    assert_eq!(id_column(&final_df), vec![101, 102, 103, 104]);
    let sources: Vec<_> = text_column(&final_df, "source").into_iter().flatten().collect();
    assert_eq!(sources, vec!["official", "predicted", "predicted", "none"]);
    let concerns: Vec<Vec<String>> = text_column(&final_df, "concerns")
        .into_iter()
        .map(|cell| json_text_to_list(&cell.unwrap_or_default()))
        .collect();
    assert_eq!(concerns[0], vec!["건조"]);
    assert_eq!(concerns[1], vec!["건조"]);
    assert_eq!(concerns[2], vec!["민감"]);
    assert!(concerns[3].is_empty());

    let enriched = ws.pipeline.load(Table::ENRICHED).unwrap();
    assert_eq!(enriched.height(), 4);
    let depth1 = text_column(&enriched, "category_depth1_primary");
    assert_eq!(depth1[0].as_deref(), Some("스킨케어"));
    assert_eq!(depth1[2].as_deref(), Some("미분류"));
    assert!(enriched.column("enriched_at").is_ok());
    assert!(enriched.column("product_name").is_ok());
}

#[rstest]
fn full_run_covers_every_canonical_product(ws: Workspace) {
    assert_full_run(&ws);

    let preds = ws.pipeline.load(Table::PREDICTIONS).unwrap();
    assert!(preds.column("confidence").is_ok());
    assert!(preds.column("created_at").is_ok());
    let concerns = ws.pipeline.load(Table::PRODUCT_CONCERNS).unwrap();
    assert_eq!(concerns.height(), 4);
}

#[test]
fn full_run_with_csv_snapshots() {
    let ws = workspace_with(OutputFormat::Csv);
    assert_full_run(&ws);
    assert!(ws
        .path("data/derived/product_concern_final/product_concern_final_2024-06-01.csv")
        .exists());
}

#[rstest]
fn rerun_on_the_same_day_keeps_earlier_snapshots(ws: Workspace) {
    ingest_inputs(&ws);
    let first = ws.pipeline.derive_official().unwrap();
    let second = ws.pipeline.derive_official().unwrap();
    assert_ne!(first, second);
    assert!(first.exists());
    assert!(second
        .to_string_lossy()
        .ends_with("product_concerns_2024-06-01_01.parquet"));
}

#[rstest]
fn empty_listing_is_a_run_level_error(ws: Workspace) {
    let payload = ws.write_json("empty.json", json!({"data": {"list": []}}));
    let err = ws.pipeline.ingest_products(&[payload]).unwrap_err();
    assert!(matches!(err, PipelineError::EmptyResult { .. }));
    assert!(!ws.path("data/raw/detail_urls").exists());
}

#[rstest]
fn failed_stage_persists_nothing(ws: Workspace) {
    ingest_inputs(&ws);
    let mut broken = df!(PRODUCT_ID => &[101i64], "tags" => &["x"]).unwrap();
    ws.pipeline.save(&mut broken, Table::KEYWORDS).unwrap();

    let err = ws.pipeline.derive_predictions().unwrap_err();
    match err {
        PipelineError::MissingColumns { table, columns } => {
            assert_eq!(table, "product_keywords");
            assert_eq!(columns, vec!["keywords"]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!ws.path("data/derived/product_concern_pred_map").exists());
}

#[rstest]
fn stages_need_a_canonical_universe(ws: Workspace) {
    assert!(matches!(
        ws.pipeline.derive_final(),
        Err(PipelineError::SnapshotNotFound { .. })
    ));
}

#[rstest]
fn features_without_category_snapshot_fall_back(ws: Workspace) {
    let products = ws.write_json(
        "products.json",
        json!({"products": [{"onlineProdSn": 1}, {"onlineProdSn": 2}]}),
    );
    ws.pipeline.ingest_products(&[products]).unwrap();
    ws.pipeline.build_features().unwrap();

    let enriched = ws.pipeline.load(Table::ENRICHED).unwrap();
    let depth1: Vec<_> = text_column(&enriched, "category_depth1_primary")
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(depth1, vec!["미분류", "미분류"]);
    let paths = text_column(&enriched, "category_paths_all_json");
    assert_eq!(paths[0].as_deref(), Some("[]"));
}

#[rstest]
fn official_links_from_csv(ws: Workspace) {
    let products = ws.write_json(
        "products.json",
        json!({"products": [{"onlineProdSn": 7}, {"onlineProdSn": 8}]}),
    );
    ws.pipeline.ingest_products(&[products]).unwrap();
    let listing: &Path = &ws.path("listing.csv");
    fs::write(
        listing,
        "concern_type,href\ndryness,/detail?onlineProdSn=8\ndryness,/detail?onlineProdSn=8\n",
    )
    .unwrap();
    ws.pipeline.ingest_official(listing).unwrap();

    let map = ws.pipeline.load(Table::CONCERN_MAP).unwrap();
    assert_eq!(id_column(&map), vec![8]);
}

#[rstest]
fn validate_reports_present_and_missing_tables(ws: Workspace) {
    ingest_inputs(&ws);
    let reports = ws.pipeline.validate().unwrap();
    assert_eq!(reports.len(), 9);

    let products = reports.iter().find(|r| r.table == "products").unwrap();
    assert_eq!(products.rows, 4);
    assert!(products.path.is_some());
    let final_report = reports
        .iter()
        .find(|r| r.table == "product_concern_final")
        .unwrap();
    assert!(final_report.path.is_none());
}
