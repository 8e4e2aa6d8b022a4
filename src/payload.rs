//! Tolerant decoding of listing-API responses saved by the collectors.
//!
//! The upstream response shape has moved between releases, so items are
//! looked up under a fixed list of known paths first and only then found by
//! scanning for the first array of objects.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::category::CategoryNormalizer;
use crate::frames::dedupe_keep_last;
use crate::models::{CategoryRow, DetailRow, ProductRow};
use crate::value_utils::float_to_i64;

const KNOWN_ITEM_PATHS: [&[&str]; 10] = [
    &["data", "list"],
    &["data", "items"],
    &["data", "products"],
    &["data", "onlineProducts"],
    &["data", "contents"],
    &["list"],
    &["items"],
    &["products"],
    &["onlineProducts"],
    &["contents"],
];

const DETAIL_URL_BASE: &str = "https://www.amoremall.com/kr/ko/product/detail";

fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(payload, |cur, key| cur.get(*key))
}

fn first_list_of_objects(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => {
            if !items.is_empty() && items.iter().all(Value::is_object) {
                return Some(items);
            }
            items.iter().find_map(first_list_of_objects)
        }
        Value::Object(map) => map.values().find_map(first_list_of_objects),
        _ => None,
    }
}

/// Returns the product items of a listing response, or an empty list when
/// the payload holds none.
pub fn extract_items(payload: &Value) -> Vec<&Map<String, Value>> {
    if !payload.is_object() {
        return Vec::new();
    }

    for path in KNOWN_ITEM_PATHS {
        if let Some(Value::Array(items)) = lookup(payload, path) {
            if items.first().map_or(true, Value::is_object) {
                debug!(path = %path.join("."), items = items.len(), "listing items found");
                return items.iter().filter_map(Value::as_object).collect();
            }
        }
    }

    match first_list_of_objects(payload) {
        Some(items) => {
            warn!(items = items.len(), "listing items found by fallback scan");
            items.iter().filter_map(Value::as_object).collect()
        }
        None => Vec::new(),
    }
}

/// Accepts both numeric and numeric-string serials.
fn product_serial(item: &Map<String, Value>) -> Option<i64> {
    let serial = match item.get("onlineProdSn")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    serial.filter(|sn| *sn != 0)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn detail_url(product_id: i64, online_prod_code: Option<&str>) -> String {
    match online_prod_code {
        Some(code) => format!(
            "{}?onlineProdSn={}&onlineProdCode={}",
            DETAIL_URL_BASE, product_id, code
        ),
        None => format!("{}?onlineProdSn={}", DETAIL_URL_BASE, product_id),
    }
}

/// One category row per item placement, deduplicated on
/// `(product_id, category_path)` keeping the last observation.
pub fn category_rows_from_items(
    items: &[&Map<String, Value>],
    collected_at: &str,
    normalizer: &CategoryNormalizer,
) -> Vec<CategoryRow> {
    let rows: Vec<CategoryRow> = items
        .iter()
        .filter_map(|item| {
            let product_id = product_serial(item)?;
            let names = string_list(item.get("displayCateNames"));
            let (depths, path) = normalizer.normalize_with_path(&names);
            Some(CategoryRow {
                product_id,
                category_path: Some(path),
                depths,
                collected_at: Some(collected_at.to_string()),
            })
        })
        .collect();
    dedupe_keep_last(rows, |row| (row.product_id, row.category_path.clone()))
}

/// Canonical universe rows, deduplicated on product id keeping the last.
pub fn detail_rows_from_items(items: &[&Map<String, Value>], collected_at: &str) -> Vec<DetailRow> {
    let rows: Vec<DetailRow> = items
        .iter()
        .filter_map(|item| {
            let product_id = product_serial(item)?;
            let code = text_field(item, "onlineProdCode");
            Some(DetailRow {
                product_id,
                detail_url: detail_url(product_id, code.as_deref()),
                online_prod_code: code,
                collected_at: collected_at.to_string(),
            })
        })
        .collect();
    dedupe_keep_last(rows, |row| row.product_id)
}

fn text_field(item: &Map<String, Value>, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn amount_field(item: &Map<String, Value>, key: &str) -> Option<i64> {
    match item.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(float_to_i64)),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

/// Product table rows, deduplicated on product id keeping the last.
/// `default_brand` fills in items that carry no brand name.
pub fn product_rows_from_items(
    items: &[&Map<String, Value>],
    collected_at: &str,
    default_brand: Option<&str>,
) -> Vec<ProductRow> {
    let rows: Vec<ProductRow> = items
        .iter()
        .filter_map(|item| {
            let product_id = product_serial(item)?;
            Some(ProductRow {
                product_id,
                brand: text_field(item, "brandName").or_else(|| default_brand.map(str::to_string)),
                product_name: text_field(item, "onlineProdName"),
                price: amount_field(item, "standardPrice"),
                sale_price: amount_field(item, "discountedPrice"),
                capacity: text_field(item, "lineDesc"),
                product_url: detail_url(product_id, None),
                image_url: text_field(item, "imgUrl"),
                collected_at: collected_at.to_string(),
            })
        })
        .collect();
    dedupe_keep_last(rows, |row| row.product_id)
}
