use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::frames::dedupe_keep_last;
use crate::models::{OfficialConcernRow, OfficialConcerns};

/// A curated listing page whose products all carry one concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfficialSource {
    pub concern_type: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct SourceSpec {
    name: String,
    #[serde(default)]
    url: String,
}

/// Parses `{concerns: {type: {name, url}}}`, keeping declaration order.
pub fn sources_from_yaml_str(text: &str) -> PipelineResult<Vec<OfficialSource>> {
    let root: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| PipelineError::InvalidConfig(format!("official sources: {}", e)))?;
    let Some(concerns) = root.get("concerns").and_then(|v| v.as_mapping()) else {
        return Err(PipelineError::InvalidConfig(
            "official sources: missing `concerns` mapping".into(),
        ));
    };
    let mut sources = Vec::with_capacity(concerns.len());
    for (key, value) in concerns {
        let concern_type = key.as_str().map(str::to_string).ok_or_else(|| {
            PipelineError::InvalidConfig(format!("official source key {:?} is not a string", key))
        })?;
        let spec: SourceSpec = serde_yaml::from_value(value.clone()).map_err(|e| {
            PipelineError::InvalidConfig(format!("official source {}: {}", concern_type, e))
        })?;
        sources.push(OfficialSource {
            concern_type,
            name: spec.name,
            url: spec.url,
        });
    }
    Ok(sources)
}

fn product_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[?&]onlineProdSn=(\d+)").expect("static regex"))
}

/// Pulls the product id out of a detail-page link.
pub fn extract_product_id(href: &str) -> Option<i64> {
    product_link_re()
        .captures(href)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Turns scraped listing links into official concern rows. Only products in
/// `universe` are kept; sources with no scraped links contribute nothing.
pub fn official_rows_from_listings(
    sources: &[OfficialSource],
    listings: &HashMap<String, Vec<String>>,
    universe: &[i64],
    collected_at: &str,
) -> PipelineResult<Vec<OfficialConcernRow>> {
    let valid: HashSet<i64> = universe.iter().copied().collect();
    let mut rows = Vec::new();

    for source in sources {
        let hrefs = listings
            .get(&source.concern_type)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut seen = HashSet::new();
        let scraped: Vec<i64> = hrefs
            .iter()
            .filter_map(|href| extract_product_id(href))
            .filter(|id| seen.insert(*id))
            .collect();
        let in_scope: Vec<i64> = scraped
            .iter()
            .copied()
            .filter(|id| valid.contains(id))
            .collect();
        info!(
            concern = %source.concern_type,
            scraped = scraped.len(),
            in_scope = in_scope.len(),
            "collected official listing"
        );
        rows.extend(in_scope.into_iter().map(|product_id| OfficialConcernRow {
            product_id,
            concern_type: source.concern_type.clone(),
            concern_name: source.name.clone(),
            source_url: Some(source.url.clone()).filter(|url| !url.is_empty()),
            collected_at: Some(collected_at.to_string()),
        }));
    }

    let rows = dedupe_keep_last(rows, |row| (row.product_id, row.concern_type.clone()));
    if rows.is_empty() {
        return Err(PipelineError::empty_result("product_concern_map"));
    }
    Ok(rows)
}

fn push_unique(out: &mut Vec<String>, value: &str) {
    if !out.iter().any(|existing| existing == value) {
        out.push(value.to_string());
    }
}

/// Aggregates official rows per product and left-joins them onto the
/// universe, so every canonical product gets exactly one entry.
pub fn aggregate_official(rows: &[OfficialConcernRow], universe: &[i64]) -> Vec<OfficialConcerns> {
    let mut sorted: Vec<&OfficialConcernRow> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        a.product_id
            .cmp(&b.product_id)
            .then_with(|| a.concern_type.cmp(&b.concern_type))
            .then_with(|| a.concern_name.cmp(&b.concern_name))
    });

    let mut grouped: HashMap<i64, OfficialConcerns> = HashMap::new();
    for row in sorted {
        let entry = grouped
            .entry(row.product_id)
            .or_insert_with(|| OfficialConcerns {
                product_id: row.product_id,
                concern_types: Vec::new(),
                concerns: Vec::new(),
            });
        push_unique(&mut entry.concern_types, &row.concern_type);
        push_unique(&mut entry.concerns, &row.concern_name);
    }

    let mut seen = HashSet::new();
    universe
        .iter()
        .filter(|id| seen.insert(**id))
        .map(|id| {
            grouped.get(id).cloned().unwrap_or_else(|| OfficialConcerns {
                product_id: *id,
                concern_types: Vec::new(),
                concerns: Vec::new(),
            })
        })
        .collect()
}

/// Coverage figures logged after the official map is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfficialCoverage {
    pub total_products: usize,
    pub mapped_products: usize,
    pub multi_concern: Vec<(i64, usize)>,
    pub unmapped_sample: Vec<i64>,
}

pub fn official_coverage(rows: &[OfficialConcernRow], universe: &[i64]) -> OfficialCoverage {
    let valid: HashSet<i64> = universe.iter().copied().collect();
    let mut per_product: BTreeMap<i64, HashSet<&str>> = BTreeMap::new();
    for row in rows {
        per_product
            .entry(row.product_id)
            .or_default()
            .insert(row.concern_type.as_str());
    }

    let mut multi_concern: Vec<(i64, usize)> = per_product
        .iter()
        .map(|(id, types)| (*id, types.len()))
        .filter(|(_, count)| *count >= 2)
        .collect();
    multi_concern.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut unmapped: Vec<i64> = valid
        .iter()
        .copied()
        .filter(|id| !per_product.contains_key(id))
        .collect();
    unmapped.sort_unstable();
    unmapped.truncate(10);

    debug!(products = per_product.len(), "computed official coverage");
    OfficialCoverage {
        total_products: valid.len(),
        mapped_products: per_product.len(),
        multi_concern,
        unmapped_sample: unmapped,
    }
}

/// Reads a scraped link export with `concern_type,href` records.
pub fn read_listing_csv(path: &Path) -> Result<HashMap<String, Vec<String>>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open listing CSV {:?}", path))?;
    let mut listings: HashMap<String, Vec<String>> = HashMap::new();
    for record in reader.records() {
        let record = record.with_context(|| "failed to read listing CSV record")?;
        let concern_type = record.get(0).unwrap_or("").trim().to_string();
        let href = record.get(1).unwrap_or("").trim().to_string();
        if concern_type.is_empty() || href.is_empty() {
            continue;
        }
        listings.entry(concern_type).or_default().push(href);
    }
    Ok(listings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sources() -> Vec<OfficialSource> {
        sources_from_yaml_str(
            r#"
brand: innisfree
concerns:
  dryness:
    name: 건조
    url: https://example.com/dry
  trouble:
    name: 트러블
    url: https://example.com/trouble
"#,
        )
        .unwrap()
    }

    fn row(id: i64, ty: &str, name: &str) -> OfficialConcernRow {
        OfficialConcernRow {
            product_id: id,
            concern_type: ty.into(),
            concern_name: name.into(),
            source_url: None,
            collected_at: None,
        }
    }

    #[rstest]
    #[case("https://shop/kr/ko/product/detail?onlineProdSn=12345", Some(12345))]
    #[case("/product/detail?foo=1&onlineprodsn=77&x=2", Some(77))]
    #[case("/product/detail?onlineProdCode=111", None)]
    #[case("", None)]
    fn extracts_ids_from_links(#[case] href: &str, #[case] expected: Option<i64>) {
        assert_eq!(extract_product_id(href), expected);
    }

    #[test]
    fn source_order_follows_yaml() {
        let types: Vec<String> = sources().into_iter().map(|s| s.concern_type).collect();
        assert_eq!(types, vec!["dryness", "trouble"]);
    }

    #[test]
    fn listing_rows_are_restricted_to_universe() {
        let mut listings = HashMap::new();
        listings.insert(
            "dryness".to_string(),
            vec![
                "?onlineProdSn=1".to_string(),
                "?onlineProdSn=1".to_string(),
                "?onlineProdSn=99".to_string(),
                "?onlineProdSn=2".to_string(),
            ],
        );
        listings.insert("trouble".to_string(), vec!["?onlineProdSn=2".to_string()]);
        let rows =
            official_rows_from_listings(&sources(), &listings, &[1, 2, 3], "2024-01-01").unwrap();
        let keys: Vec<(i64, &str)> = rows
            .iter()
            .map(|r| (r.product_id, r.concern_type.as_str()))
            .collect();
        assert_eq!(keys, vec![(1, "dryness"), (2, "dryness"), (2, "trouble")]);
        assert_eq!(rows[0].source_url.as_deref(), Some("https://example.com/dry"));
    }

    #[test]
    fn no_in_scope_listing_is_fatal() {
        let mut listings = HashMap::new();
        listings.insert("dryness".to_string(), vec!["?onlineProdSn=99".to_string()]);
        let err = official_rows_from_listings(&sources(), &listings, &[1], "now").unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResult { .. }));
    }

    #[test]
    fn aggregation_sorts_by_type_and_covers_universe() {
        let rows = vec![
            row(2, "trouble", "트러블"),
            row(2, "dryness", "건조"),
            row(2, "dryness", "건조"),
            row(8, "pore", "모공"),
        ];
        let agg = aggregate_official(&rows, &[5, 2, 5]);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg[0].product_id, 5);
        assert!(agg[0].concerns.is_empty());
        assert_eq!(agg[1].concern_types, vec!["dryness", "trouble"]);
        assert_eq!(agg[1].concerns, vec!["건조", "트러블"]);
    }

    #[test]
    fn coverage_reports_multi_and_unmapped() {
        let rows = vec![row(1, "a", "A"), row(1, "b", "B"), row(2, "a", "A")];
        let coverage = official_coverage(&rows, &[1, 2, 3, 4]);
        assert_eq!(coverage.total_products, 4);
        assert_eq!(coverage.mapped_products, 2);
        assert_eq!(coverage.multi_concern, vec![(1, 2)]);
        assert_eq!(coverage.unmapped_sample, vec![3, 4]);
    }
}
