//! Core domain records shared by the specialty-crop price pipeline.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "scpd-core";

/// Market types carried by USDA report rows.
pub const MARKET_TERMINAL: &str = "Terminal";
pub const MARKET_SHIPPING_POINT: &str = "Shipping Point";
pub const MARKET_RETAIL: &str = "Retail";
pub const MARKET_RETAIL_SPECIALTY: &str = "Retail - Specialty Crops";

/// Retail reports carry a `region` column that stands in for `origin`.
pub fn is_retail_market(market_type: &str) -> bool {
    market_type.eq_ignore_ascii_case(MARKET_RETAIL)
        || market_type.eq_ignore_ascii_case(MARKET_RETAIL_SPECIALTY)
}

/// One row of a raw report file: column name -> cell text.
///
/// The column set varies by report slug (Terminal and Shipping Point reports
/// use `variety`/`package`/`district`, some use `var`/`pkg`/`region`, Retail
/// adds `wtd_avg_price`), so rows are a mapping with optional keys rather
/// than a fixed struct. Blank cells and the literal "N/A" count as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRow(BTreeMap<String, String>);

impl RawRow {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.0.insert(column.into(), value.into());
    }

    /// Value of `column` if present and meaningful.
    pub fn get(&self, column: &str) -> Option<&str> {
        let value = self.0.get(column)?.trim();
        if value.is_empty() || value == "N/A" {
            None
        } else {
            Some(value)
        }
    }

    /// Probe an ordered list of alias column names, taking the first
    /// present, non-blank, non-"N/A" value.
    pub fn first(&self, aliases: &[&str]) -> Option<&str> {
        aliases.iter().find_map(|alias| self.get(alias))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, String)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The four partially-populated price observations on one report row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceFields {
    pub low_price: Option<f64>,
    pub high_price: Option<f64>,
    pub mostly_low_price: Option<f64>,
    pub mostly_high_price: Option<f64>,
}

impl PriceFields {
    /// The populated values, in field order.
    pub fn present(&self) -> Vec<f64> {
        [
            self.low_price,
            self.high_price,
            self.mostly_low_price,
            self.mostly_high_price,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// One observation of a commodity's price at a market on a date
/// (the price-history target shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropPriceRecord {
    pub report_date: NaiveDate,
    pub market_type: Option<String>,
    pub market_location_name: Option<String>,
    pub district: Option<String>,
    pub origin: Option<String>,
    pub category: String,
    pub commodity: String,
    pub variety: Option<String>,
    pub package: Option<String>,
    pub item_size: Option<String>,
    pub organic: String,
    pub low_price: Option<f64>,
    pub high_price: Option<f64>,
    pub mostly_low_price: Option<f64>,
    pub mostly_high_price: Option<f64>,
    pub wtd_avg_price: Option<f64>,
    pub market_tone_comments: Option<String>,
    pub supply_tone_comments: Option<String>,
    pub demand_tone_comments: Option<String>,
}

/// One row per (date, market, district, commodity, variety, package)
/// carrying a single representative price (the time-series target shape).
///
/// `weight_lbs`/`weight_kgs`/`units` start empty and are filled by the
/// package-weight enrichment pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedPriceRecord {
    pub report_date: NaiveDate,
    pub market_type: Option<String>,
    pub district: Option<String>,
    pub commodity: String,
    pub variety: Option<String>,
    pub package: Option<String>,
    pub origin: Option<String>,
    pub weight_lbs: Option<f64>,
    pub weight_kgs: Option<f64>,
    pub units: Option<i64>,
    pub price_avg: Option<i64>,
    pub market_tone_comments: Option<String>,
    pub supply_tone_comments: Option<String>,
    pub demand_tone_comments: Option<String>,
}

/// Reference mapping (crop, package_size) -> physical weight or unit count,
/// with a provenance string describing where the figure came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageWeightEntry {
    pub crop: String,
    pub package_size: String,
    pub weight_lbs: Option<f64>,
    pub weight_kg: Option<f64>,
    pub units: Option<i64>,
    pub source: String,
}
