use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator used between category levels in a canonical path.
pub const PATH_SEPARATOR: &str = ">";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPath {
    pub depth1: Option<String>,
    pub depth2: Option<String>,
    pub depth3: Option<String>,
}

impl CategoryPath {
    pub fn new(depth1: Option<String>, depth2: Option<String>, depth3: Option<String>) -> Self {
        Self {
            depth1,
            depth2,
            depth3,
        }
    }

    /// Joins the populated levels with `>`; null levels are skipped, not left blank.
    pub fn path(&self) -> String {
        [&self.depth1, &self.depth2, &self.depth3]
            .into_iter()
            .filter_map(|level| level.as_deref())
            .filter(|level| !level.is_empty())
            .collect::<Vec<_>>()
            .join(PATH_SEPARATOR)
    }

    pub fn is_empty(&self) -> bool {
        self.depth1.is_none() && self.depth2.is_none() && self.depth3.is_none()
    }

    pub fn levels(&self) -> [Option<&str>; 3] {
        [
            self.depth1.as_deref(),
            self.depth2.as_deref(),
            self.depth3.as_deref(),
        ]
    }
}

/// One observed listing placement of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRow {
    pub product_id: i64,
    pub category_path: Option<String>,
    #[serde(flatten)]
    pub depths: CategoryPath,
    pub collected_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAggregate {
    pub product_id: i64,
    pub primary: CategoryPath,
    pub paths_all: Vec<String>,
    pub names_all: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcernTrigger {
    pub concern_type: String,
    pub name: String,
    pub weight: f64,
    pub triggers: Vec<String>,
}

/// Relative ranking signal produced by keyword scoring: hit count times rule
/// weight. It is not calibrated and not bounded to `[0, 1]`; only its order
/// within one product carries meaning.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankScore(pub f64);

impl RankScore {
    pub fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for RankScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A concern type that at least one trigger hit for a single product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredConcern {
    pub concern_type: String,
    pub concern_name: String,
    /// Dense 1-based position after sorting by score.
    pub rank: u32,
    pub score: RankScore,
    pub evidence_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcernPrediction {
    pub product_id: i64,
    pub concern_type: String,
    pub concern_name: String,
    pub rank: u32,
    pub score: RankScore,
    pub evidence_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficialConcernRow {
    pub product_id: i64,
    pub concern_type: String,
    pub concern_name: String,
    pub source_url: Option<String>,
    pub collected_at: Option<String>,
}

/// Official concerns aggregated for one product; empty lists when the product
/// never appeared on a curated listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficialConcerns {
    pub product_id: i64,
    pub concern_types: Vec<String>,
    pub concerns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcernSource {
    Official,
    Predicted,
    None,
}

impl ConcernSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcernSource::Official => "official",
            ConcernSource::Predicted => "predicted",
            ConcernSource::None => "none",
        }
    }
}

impl fmt::Display for ConcernSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcernFinal {
    pub product_id: i64,
    pub source: ConcernSource,
    pub concerns: Vec<String>,
    pub concern_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRow {
    pub product_id: i64,
    pub keywords: Vec<String>,
}

/// A member of the canonical product universe as collected from the listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRow {
    pub product_id: i64,
    pub online_prod_code: Option<String>,
    pub detail_url: String,
    pub collected_at: String,
}

/// Product attributes as listed by the brand listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRow {
    pub product_id: i64,
    pub brand: Option<String>,
    pub product_name: Option<String>,
    pub price: Option<i64>,
    pub sale_price: Option<i64>,
    pub capacity: Option<String>,
    pub product_url: String,
    pub image_url: Option<String>,
    pub collected_at: String,
}
