use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::debug;

use crate::models::{CategoryAggregate, CategoryPath, CategoryRow};

/// Storefront depth-1 names used when no configuration overrides them.
pub const DEFAULT_TOP_CATEGORIES: [&str; 10] = [
    "스킨케어",
    "메이크업",
    "향수",
    "생활용품",
    "소품&도구",
    "뷰티푸드",
    "남성",
    "베이비",
    "뷰티디바이스",
    "반려동물용품",
];

pub const DEFAULT_UNCATEGORIZED: &str = "미분류";

/// Turns unordered category label lists into 3-level paths.
#[derive(Debug, Clone)]
pub struct CategoryNormalizer {
    top_level: HashSet<String>,
}

impl Default for CategoryNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_CATEGORIES.iter().copied())
    }
}

impl CategoryNormalizer {
    pub fn new<I, S>(top_level: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            top_level: top_level.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_top_level(&self, label: &str) -> bool {
        self.top_level.contains(label)
    }

    /// Picks depth1 from the first known top-level label (or the first label
    /// when none is known). Of the remaining labels the last one lands in
    /// depth2 and the first one in depth3; this asymmetric order is part of
    /// the output contract.
    pub fn normalize_depths<S: AsRef<str>>(&self, labels: &[S]) -> CategoryPath {
        if labels.is_empty() {
            return CategoryPath::default();
        }

        let mut depth1: Option<&str> = None;
        let mut rest: Vec<&str> = Vec::with_capacity(labels.len());
        for label in labels {
            let label = label.as_ref();
            if depth1.is_none() && self.is_top_level(label) {
                depth1 = Some(label);
            } else {
                rest.push(label);
            }
        }

        let depth1 = match depth1 {
            Some(found) => found,
            None => {
                rest.remove(0);
                labels[0].as_ref()
            }
        };

        let (depth2, depth3) = match rest.as_slice() {
            [] => (None, None),
            [only] => (Some(*only), None),
            [first, .., last] => (Some(*last), Some(*first)),
        };

        CategoryPath::new(
            Some(depth1.to_string()),
            depth2.map(str::to_string),
            depth3.map(str::to_string),
        )
    }

    /// Normalizes labels and returns the depths together with the joined path.
    pub fn normalize_with_path<S: AsRef<str>>(&self, labels: &[S]) -> (CategoryPath, String) {
        let depths = self.normalize_depths(labels);
        let path = depths.path();
        (depths, path)
    }
}

/// Trimmed text or `None` when blank.
fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn push_unique(out: &mut Vec<String>, value: Option<&str>) {
    if let Some(text) = clean(value) {
        if !out.contains(&text) {
            out.push(text);
        }
    }
}

/// Ascending, nulls last.
fn cmp_nulls_last(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn observation_order(a: &CategoryRow, b: &CategoryRow) -> Ordering {
    a.product_id
        .cmp(&b.product_id)
        .then_with(|| cmp_nulls_last(a.collected_at.as_deref(), b.collected_at.as_deref()))
        .then_with(|| cmp_nulls_last(a.category_path.as_deref(), b.category_path.as_deref()))
        .then_with(|| {
            let left = a.depths.levels();
            let right = b.depths.levels();
            left.into_iter()
                .zip(right)
                .map(|(x, y)| cmp_nulls_last(x, y))
                .find(|ord| ord.is_ne())
                .unwrap_or(Ordering::Equal)
        })
}

fn aggregate_group(group: &[CategoryRow]) -> CategoryAggregate {
    let first = &group[0];
    let primary = CategoryPath::new(
        clean(first.depths.depth1.as_deref()),
        clean(first.depths.depth2.as_deref()),
        clean(first.depths.depth3.as_deref()),
    );

    let mut paths_all = Vec::new();
    for row in group {
        push_unique(&mut paths_all, row.category_path.as_deref());
    }

    let mut names_all = Vec::new();
    for level in 0..3 {
        for row in group {
            let levels = row.depths.levels();
            push_unique(&mut names_all, levels[level]);
        }
    }

    CategoryAggregate {
        product_id: first.product_id,
        primary,
        paths_all,
        names_all,
    }
}

/// Collapses per-placement category rows into one aggregate per product,
/// ordered by product id. The first row after sorting by
/// `(product_id, collected_at, category_path)` supplies the primary depths.
pub fn aggregate_categories(rows: &[CategoryRow]) -> Vec<CategoryAggregate> {
    let mut sorted: Vec<CategoryRow> = rows.to_vec();
    sorted.sort_by(observation_order);

    let aggregates: Vec<CategoryAggregate> = sorted
        .chunk_by(|a, b| a.product_id == b.product_id)
        .map(aggregate_group)
        .collect();
    debug!(
        rows = rows.len(),
        products = aggregates.len(),
        "aggregated category rows"
    );
    aggregates
}

/// Aggregate used for products that never showed up in any category listing.
pub fn uncategorized(product_id: i64, sentinel: &str) -> CategoryAggregate {
    CategoryAggregate {
        product_id,
        primary: CategoryPath::new(Some(sentinel.to_string()), None, None),
        paths_all: Vec::new(),
        names_all: vec![sentinel.to_string()],
    }
}

/// Lines aggregates up with `product_ids`, filling gaps with the sentinel
/// fallback. The result has exactly one entry per requested id, in order.
pub fn align_to_products(
    product_ids: &[i64],
    aggregates: &[CategoryAggregate],
    sentinel: &str,
) -> Vec<CategoryAggregate> {
    product_ids
        .iter()
        .map(|id| {
            aggregates
                .binary_search_by_key(id, |agg| agg.product_id)
                .map(|idx| aggregates[idx].clone())
                .unwrap_or_else(|_| uncategorized(*id, sentinel))
        })
        .collect()
}
