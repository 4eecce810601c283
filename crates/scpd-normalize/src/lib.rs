//! Record normalizer + field resolvers for raw USDA report rows.

use chrono::NaiveDate;
use scpd_core::{
    is_retail_market, CropPriceRecord, PriceFields, RawRow, UnifiedPriceRecord,
};
use thiserror::Error;

pub const CRATE_NAME: &str = "scpd-normalize";

/// Alias column names probed in order, first meaningful value wins.
pub const CATEGORY_ALIASES: &[&str] = &["category", "community", "grp", "group"];
pub const VARIETY_ALIASES: &[&str] = &["variety", "var"];
pub const PACKAGE_ALIASES: &[&str] = &["package", "pkg", "size"];
pub const DATE_ALIASES: &[&str] = &["report_date", "report_end_date"];

/// Case-insensitive substring rules mapping a raw category to its canonical
/// bucket, evaluated top to bottom, first match wins.
const CATEGORY_RULES: &[(&str, &str)] = &[
    ("veg", "Vegetables"),
    ("fruit", "Fruits"),
    ("nut", "Nuts"),
    ("onion", "Potatoes & Onions"),
    ("potato", "Potatoes & Onions"),
];

const CATEGORY_OTHER: &str = "Other";

/// Raw values that mean "organically grown".
const ORGANIC_YES: &[&str] = &["y", "yes", "organic", "true", "1"];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Parse a price cell. Blank, "N/A", and non-numeric text all degrade to
/// `None`; this never fails.
pub fn clean_price(value: Option<&str>) -> Option<f64> {
    let value = value?.trim();
    if value.is_empty() || value == "N/A" {
        return None;
    }
    value.parse::<f64>().ok()
}

/// Parse an `MM/DD/YYYY` date cell, truncating an optional trailing time
/// component (`MM/DD/YYYY HH:MM:SS`). Anything else is `None`.
pub fn parse_report_date(value: Option<&str>) -> Option<NaiveDate> {
    let value = value?.trim();
    let date_part = value.split(' ').next()?;
    NaiveDate::parse_from_str(date_part, "%m/%d/%Y").ok()
}

/// Title-case free text: each letter run starts uppercase, the rest lowered.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_alpha = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

/// Map a raw category value onto one of the five canonical buckets.
/// Total and idempotent: canonical outputs re-normalize to themselves.
pub fn normalize_category(value: Option<&str>) -> &'static str {
    let Some(value) = value else {
        return CATEGORY_OTHER;
    };
    let lowered = value.to_lowercase();
    for (needle, bucket) in CATEGORY_RULES {
        if lowered.contains(needle) {
            return bucket;
        }
    }
    CATEGORY_OTHER
}

/// Collapse the organic flag to `"yes"`/`"no"`. Total over any input.
pub fn normalize_organic(value: Option<&str>) -> &'static str {
    match value {
        Some(v) if ORGANIC_YES.contains(&v.trim().to_lowercase().as_str()) => "yes",
        _ => "no",
    }
}

/// Representative price for one row: the integer part of the mean of
/// whichever of the four price fields are populated. `None` when all are.
pub fn price_avg(fields: &PriceFields) -> Option<i64> {
    let present = fields.present();
    if present.is_empty() {
        return None;
    }
    let mean = present.iter().sum::<f64>() / present.len() as f64;
    Some(mean as i64)
}

/// Mean value of each price field across many rows, ignoring empty cells.
pub fn field_means(rows: &[PriceFields]) -> PriceFields {
    fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
        let values: Vec<f64> = values.collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
    PriceFields {
        low_price: mean(rows.iter().filter_map(|r| r.low_price)),
        high_price: mean(rows.iter().filter_map(|r| r.high_price)),
        mostly_low_price: mean(rows.iter().filter_map(|r| r.mostly_low_price)),
        mostly_high_price: mean(rows.iter().filter_map(|r| r.mostly_high_price)),
    }
}

/// Aggregate representative price across rows: each price field is averaged
/// independently first, then the per-field means are averaged. Fields get
/// equal weight regardless of how many rows populate them; this is not a
/// flat mean of all values.
pub fn aggregate_price_avg(rows: &[PriceFields]) -> Option<f64> {
    let means = field_means(rows).present();
    if means.is_empty() {
        return None;
    }
    Some(means.iter().sum::<f64>() / means.len() as f64)
}

/// Output of normalizing one raw report file.
#[derive(Debug, Default)]
pub struct NormalizedReport {
    pub crop_prices: Vec<CropPriceRecord>,
    pub unified: Vec<UnifiedPriceRecord>,
    pub rows_read: usize,
    pub rows_dropped: usize,
}

/// Read one report file into raw rows. Individual unreadable records are
/// dropped; only a broken header aborts the file.
pub fn read_raw_rows<R: std::io::Read>(reader: R) -> Result<Vec<RawRow>, NormalizeError> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let Ok(record) = record else {
            continue;
        };
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(header, value)| (header.to_string(), value.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

/// Normalize one report file's rows into both target shapes.
pub fn normalize_rows(rows: &[RawRow]) -> NormalizedReport {
    let mut report = NormalizedReport {
        rows_read: rows.len(),
        ..NormalizedReport::default()
    };
    for row in rows {
        match normalize_row(row) {
            Some((crop_price, unified)) => {
                report.crop_prices.push(crop_price);
                report.unified.push(unified);
            }
            None => report.rows_dropped += 1,
        }
    }
    report
}

/// Read + normalize in one step.
pub fn normalize_reader<R: std::io::Read>(reader: R) -> Result<NormalizedReport, NormalizeError> {
    Ok(normalize_rows(&read_raw_rows(reader)?))
}

/// Normalize one raw row, or `None` when the row is inadmissible (no
/// commodity, or no parseable date): header/footer rows mixed into the data.
fn normalize_row(row: &RawRow) -> Option<(CropPriceRecord, UnifiedPriceRecord)> {
    let commodity = title_case(row.get("commodity")?);
    let report_date = DATE_ALIASES
        .iter()
        .find_map(|alias| parse_report_date(row.get(alias)))?;

    let market_type = row.get("market_type").map(title_case);
    let district = row.get("district").map(title_case);
    let variety = row.first(VARIETY_ALIASES).map(title_case);
    let package = row.first(PACKAGE_ALIASES).map(title_case);

    // Retail reports publish origin under `region`.
    let retail = market_type.as_deref().is_some_and(is_retail_market);
    let origin = row
        .get("origin")
        .or_else(|| if retail { row.get("region") } else { None })
        .map(title_case);

    let prices = PriceFields {
        low_price: clean_price(row.get("low_price")),
        high_price: clean_price(row.get("high_price")),
        mostly_low_price: clean_price(row.get("mostly_low_price")),
        mostly_high_price: clean_price(row.get("mostly_high_price")),
    };

    let market_tone_comments = row.get("market_tone_comments").map(str::to_string);
    let supply_tone_comments = row.get("supply_tone_comments").map(str::to_string);
    let demand_tone_comments = row.get("demand_tone_comments").map(str::to_string);

    let crop_price = CropPriceRecord {
        report_date,
        market_type: market_type.clone(),
        market_location_name: row.get("market_location_name").map(str::to_string),
        district: district.clone(),
        origin: origin.clone(),
        category: normalize_category(row.first(CATEGORY_ALIASES)).to_string(),
        commodity: commodity.clone(),
        variety: variety.clone(),
        package: package.clone(),
        item_size: row.get("item_size").map(str::to_string),
        organic: normalize_organic(row.get("organic")).to_string(),
        low_price: prices.low_price,
        high_price: prices.high_price,
        mostly_low_price: prices.mostly_low_price,
        mostly_high_price: prices.mostly_high_price,
        wtd_avg_price: clean_price(row.get("wtd_avg_price")),
        market_tone_comments: market_tone_comments.clone(),
        supply_tone_comments: supply_tone_comments.clone(),
        demand_tone_comments: demand_tone_comments.clone(),
    };

    let unified = UnifiedPriceRecord {
        report_date,
        market_type,
        district,
        commodity,
        variety,
        package,
        origin,
        weight_lbs: None,
        weight_kgs: None,
        units: None,
        price_avg: price_avg(&prices),
        market_tone_comments,
        supply_tone_comments,
        demand_tone_comments,
    };

    Some((crop_price, unified))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn price_cleaning_degrades_to_none() {
        assert_eq!(clean_price(None), None);
        assert_eq!(clean_price(Some("")), None);
        assert_eq!(clean_price(Some("N/A")), None);
        assert_eq!(clean_price(Some("approx twelve")), None);
        assert_eq!(clean_price(Some("12.50")), Some(12.5));
        assert_eq!(clean_price(Some(" 34 ")), Some(34.0));
    }

    #[test]
    fn date_parsing_truncates_time_component() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        assert_eq!(parse_report_date(Some("03/14/2025")), Some(expected));
        assert_eq!(parse_report_date(Some("03/14/2025 08:30:00")), Some(expected));
        assert_eq!(parse_report_date(Some("2025-03-14")), None);
        assert_eq!(parse_report_date(Some("NA")), None);
        assert_eq!(parse_report_date(None), None);
    }

    #[test]
    fn category_rules_fire_in_priority_order() {
        assert_eq!(normalize_category(Some("VEGETABLES")), "Vegetables");
        assert_eq!(normalize_category(Some("Fruit & Berries")), "Fruits");
        assert_eq!(normalize_category(Some("Tree Nuts")), "Nuts");
        assert_eq!(normalize_category(Some("onions dry")), "Potatoes & Onions");
        assert_eq!(normalize_category(Some("POTATOES")), "Potatoes & Onions");
        assert_eq!(normalize_category(Some("herbs")), "Other");
        assert_eq!(normalize_category(None), "Other");
    }

    #[test]
    fn category_normalization_is_idempotent() {
        for canonical in ["Vegetables", "Fruits", "Potatoes & Onions", "Nuts", "Other"] {
            assert_eq!(normalize_category(Some(canonical)), canonical);
        }
    }

    #[test]
    fn organic_flag_is_total() {
        for yes in ["y", "YES", "Organic", "true", "1"] {
            assert_eq!(normalize_organic(Some(yes)), "yes");
        }
        for no in ["n", "no", "N/A", "", "0", "conventional"] {
            assert_eq!(normalize_organic(Some(no)), "no");
        }
        assert_eq!(normalize_organic(None), "no");
    }

    #[test]
    fn title_case_matches_report_conventions() {
        assert_eq!(title_case("GREEN LEAF LETTUCE"), "Green Leaf Lettuce");
        assert_eq!(title_case("shipping point"), "Shipping Point");
        assert_eq!(title_case("RETAIL - SPECIALTY CROPS"), "Retail - Specialty Crops");
        assert_eq!(title_case("red-leaf"), "Red-Leaf");
    }

    #[test]
    fn price_avg_truncates_instead_of_rounding() {
        let two = PriceFields {
            low_price: Some(10.0),
            high_price: Some(20.0),
            ..PriceFields::default()
        };
        assert_eq!(price_avg(&two), Some(15));

        assert_eq!(price_avg(&PriceFields::default()), None);

        let skewed = PriceFields {
            low_price: Some(10.0),
            high_price: Some(10.0),
            mostly_low_price: Some(10.0),
            mostly_high_price: Some(13.0),
        };
        // mean 10.75 truncates to 10
        assert_eq!(price_avg(&skewed), Some(10));
    }

    #[test]
    fn aggregate_average_weighs_fields_not_observations() {
        let rows = vec![
            PriceFields {
                low_price: Some(10.0),
                high_price: Some(20.0),
                ..PriceFields::default()
            },
            PriceFields {
                low_price: Some(30.0),
                ..PriceFields::default()
            },
        ];
        let rows_uneven = vec![
            PriceFields {
                low_price: Some(10.0),
                high_price: Some(40.0),
                ..PriceFields::default()
            },
            PriceFields {
                low_price: Some(20.0),
                ..PriceFields::default()
            },
        ];
        assert_eq!(aggregate_price_avg(&rows), Some(20.0));
        // low mean = 15, high mean = 40 -> 27.5 (flat mean would be 23.33..)
        assert_eq!(aggregate_price_avg(&rows_uneven), Some(27.5));
        assert_eq!(aggregate_price_avg(&[]), None);
    }

    #[test]
    fn rows_without_commodity_or_date_are_dropped() {
        let rows = vec![
            row(&[("commodity", "Tomatoes"), ("report_date", "01/02/2025")]),
            row(&[("commodity", ""), ("report_date", "01/02/2025")]),
            row(&[("commodity", "N/A"), ("report_date", "01/02/2025")]),
            row(&[("commodity", "Peppers"), ("report_date", "not a date")]),
            row(&[("commodity", "Squash")]),
        ];
        let report = normalize_rows(&rows);
        assert_eq!(report.rows_read, 5);
        assert_eq!(report.rows_dropped, 4);
        assert_eq!(report.crop_prices.len(), 1);
        assert_eq!(report.unified.len(), 1);
        assert_eq!(report.crop_prices[0].commodity, "Tomatoes");
    }

    #[test]
    fn report_end_date_fallback_applies_when_primary_is_unparseable() {
        let rows = vec![row(&[
            ("commodity", "carrots"),
            ("report_date", "NA"),
            ("report_end_date", "05/06/2025"),
        ])];
        let report = normalize_rows(&rows);
        assert_eq!(
            report.unified[0].report_date,
            NaiveDate::from_ymd_opt(2025, 5, 6).unwrap()
        );
    }

    #[test]
    fn shipping_dialect_resolves_var_and_pkg_aliases() {
        let rows = vec![row(&[
            ("commodity", "LETTUCE, ICEBERG"),
            ("var", "iceberg"),
            ("pkg", "cartons 24s"),
            ("grp", "VEGETABLES"),
            ("district", "SALINAS DISTRICT"),
            ("market_type", "Shipping Point"),
            ("report_date", "04/01/2025"),
            ("low_price", "18.50"),
            ("high_price", "21.50"),
        ])];
        let report = normalize_rows(&rows);
        let cp = &report.crop_prices[0];
        assert_eq!(cp.commodity, "Lettuce, Iceberg");
        assert_eq!(cp.variety.as_deref(), Some("Iceberg"));
        assert_eq!(cp.package.as_deref(), Some("Cartons 24S"));
        assert_eq!(cp.category, "Vegetables");
        assert_eq!(cp.district.as_deref(), Some("Salinas District"));
        assert_eq!(report.unified[0].price_avg, Some(20));
    }

    #[test]
    fn region_feeds_origin_only_for_retail_rows() {
        let retail = row(&[
            ("commodity", "apples"),
            ("market_type", "Retail - Specialty Crops"),
            ("region", "northeast"),
            ("wtd_avg_price", "2.99"),
            ("report_date", "04/01/2025"),
        ]);
        let terminal = row(&[
            ("commodity", "apples"),
            ("market_type", "Terminal"),
            ("region", "northeast"),
            ("report_date", "04/01/2025"),
        ]);
        let report = normalize_rows(&[retail, terminal]);
        assert_eq!(report.crop_prices[0].origin.as_deref(), Some("Northeast"));
        assert_eq!(report.crop_prices[0].wtd_avg_price, Some(2.99));
        assert_eq!(report.crop_prices[1].origin, None);
    }

    #[test]
    fn csv_reader_builds_rows_from_headers() {
        let csv_text = "commodity,report_date,low_price\nTomatoes,01/02/2025,12.00\n,01/02/2025,9.00\n";
        let report = normalize_reader(csv_text.as_bytes()).unwrap();
        assert_eq!(report.rows_read, 2);
        assert_eq!(report.crop_prices.len(), 1);
        assert_eq!(report.crop_prices[0].low_price, Some(12.0));
    }
}
