//! Package-weight resolution: reference-table lookup with fuzzy fallback,
//! plus the offline rule-based guesser for uncovered (crop, package) pairs.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use scpd_core::PackageWeightEntry;
use serde::Serialize;

pub const CRATE_NAME: &str = "scpd-weights";

pub const KG_PER_LB: f64 = 0.453592;
pub const LB_PER_KG: f64 = 2.20462;

/// How a (commodity, package) pair was resolved against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchKind {
    Exact,
    Fuzzy,
    Unmatched,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightResolution {
    pub weight_lbs: Option<f64>,
    pub weight_kg: Option<f64>,
    pub units: Option<i64>,
    pub matched: MatchKind,
}

impl WeightResolution {
    fn unmatched() -> Self {
        Self {
            weight_lbs: None,
            weight_kg: None,
            units: None,
            matched: MatchKind::Unmatched,
        }
    }
}

/// The curated reference table. Entries are re-sorted on load so the fuzzy
/// substring scan visits longer (more specific) crops and packages first,
/// keeping first-match-wins reproducible no matter how the file is ordered.
#[derive(Debug, Clone)]
pub struct WeightTable {
    entries: Vec<PackageWeightEntry>,
    exact: HashMap<(String, String), usize>,
}

impl WeightTable {
    pub fn from_entries(mut entries: Vec<PackageWeightEntry>) -> Self {
        entries.sort_by(|a, b| {
            b.crop
                .len()
                .cmp(&a.crop.len())
                .then(b.package_size.len().cmp(&a.package_size.len()))
                .then_with(|| a.crop.cmp(&b.crop))
                .then_with(|| a.package_size.cmp(&b.package_size))
        });
        let mut exact = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            exact
                .entry((entry.crop.to_lowercase(), entry.package_size.to_lowercase()))
                .or_insert(idx);
        }
        Self { entries, exact }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading package weight table {}", path.display()))?;
        let entries: Vec<PackageWeightEntry> = serde_json::from_str(&text)
            .with_context(|| format!("parsing package weight table {}", path.display()))?;
        Ok(Self::from_entries(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PackageWeightEntry] {
        &self.entries
    }

    /// Resolve a pair: exact lowercase lookup, then the fuzzy substring scan.
    /// Never fails; uncovered pairs come back as `MatchKind::Unmatched` for
    /// the caller to record.
    pub fn resolve(&self, commodity: &str, package: &str) -> WeightResolution {
        let commodity = commodity.to_lowercase();
        let package = package.to_lowercase();

        if let Some(&idx) = self.exact.get(&(commodity.clone(), package.clone())) {
            return self.resolution(idx, MatchKind::Exact);
        }

        for (idx, entry) in self.entries.iter().enumerate() {
            let crop = entry.crop.to_lowercase();
            let pkg = entry.package_size.to_lowercase();
            let crop_match = commodity.contains(&crop) || crop.contains(&commodity);
            let pkg_match = pkg == package || package.contains(&pkg) || pkg.contains(&package);
            if crop_match && pkg_match {
                return self.resolution(idx, MatchKind::Fuzzy);
            }
        }

        WeightResolution::unmatched()
    }

    fn resolution(&self, idx: usize, matched: MatchKind) -> WeightResolution {
        let entry = &self.entries[idx];
        WeightResolution {
            weight_lbs: entry.weight_lbs,
            weight_kg: entry.weight_kg,
            units: entry.units,
            matched,
        }
    }
}

/// A rule-based weight estimate with the provenance of the rule that fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightGuess {
    pub weight_lbs: f64,
    pub weight_kg: f64,
    pub units: Option<i64>,
    pub source: &'static str,
}

impl WeightGuess {
    /// Materialize the guess as a table entry for the merge workflow.
    pub fn into_entry(self, commodity: &str, package: &str) -> PackageWeightEntry {
        PackageWeightEntry {
            crop: commodity.to_string(),
            package_size: package.to_string(),
            weight_lbs: Some(self.weight_lbs),
            weight_kg: Some(self.weight_kg),
            units: self.units,
            source: self.source.to_string(),
        }
    }
}

static LB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(?:lb|lbs)").unwrap());
static KG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*kg").unwrap());
static UNIT_LB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s+1-lb").unwrap());
static MULTI_LB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s+(\d+)-lb").unwrap());
static OZ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s+(\d+(?:\.\d+)?)-oz").unwrap());
static PINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+(?:\d+/\d+-)?(?:pint|1-pint)").unwrap());
static HALF_PINT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s+1/2-pint").unwrap());

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn capture_f64(caps: &regex::Captures<'_>, group: usize) -> Option<f64> {
    caps.get(group)?.as_str().parse().ok()
}

/// Pull an explicit quantity out of the package description, converting to
/// both pounds and kilograms. Patterns are tried in a fixed order; the pint
/// pattern's optional `N/M-` prefix intentionally captures `1/2-pint`
/// strings ahead of the half-pint pattern, matching the reference dataset.
pub fn extract_package_weight(package: &str) -> Option<WeightGuess> {
    let pkg = package.to_lowercase();
    let derived = |lbs: f64, kg: f64| {
        Some(WeightGuess {
            weight_lbs: lbs,
            weight_kg: kg,
            units: None,
            source: "Derived from package name",
        })
    };

    if let Some(caps) = LB_RE.captures(&pkg) {
        let lbs = capture_f64(&caps, 1)?;
        return derived(lbs, round1(lbs * KG_PER_LB));
    }
    if let Some(caps) = KG_RE.captures(&pkg) {
        let kg = capture_f64(&caps, 1)?;
        return derived(round1(kg * LB_PER_KG), kg);
    }
    if let Some(caps) = UNIT_LB_RE.captures(&pkg) {
        let count = capture_f64(&caps, 1)?;
        return derived(count, round1(count * KG_PER_LB));
    }
    if let Some(caps) = MULTI_LB_RE.captures(&pkg) {
        let total = capture_f64(&caps, 1)? * capture_f64(&caps, 2)?;
        return derived(total, round1(total * KG_PER_LB));
    }
    if let Some(caps) = OZ_RE.captures(&pkg) {
        let lbs = capture_f64(&caps, 1)? * capture_f64(&caps, 2)? / 16.0;
        return derived(round1(lbs), round1(lbs * KG_PER_LB));
    }
    if let Some(caps) = PINT_RE.captures(&pkg) {
        let lbs = capture_f64(&caps, 1)? * 0.9;
        return derived(round1(lbs), round1(lbs * KG_PER_LB));
    }
    if let Some(caps) = HALF_PINT_RE.captures(&pkg) {
        let lbs = capture_f64(&caps, 1)? * 0.45;
        return derived(round1(lbs), round1(lbs * KG_PER_LB));
    }
    None
}

/// Light herb crops packed bunched.
const HERBS: &[&str] = &[
    "basil",
    "bay leaves",
    "chervil",
    "chives",
    "cilantro",
    "dill",
    "epasote",
    "epazote",
    "fenugreek",
    "marjoram",
    "mint",
    "oregano",
    "parsley",
    "rosemary",
    "sage",
    "savory",
    "sorrel",
    "tarragon",
    "thyme",
    "watercress",
    "verdolaga",
];

/// Heavier bunched leafy greens.
const LEAFY_GREENS: &[&str] = &["greens", "collard", "dandelion", "kale", "mustard", "swiss chard"];

/// Commodity-side predicate of a guess rule.
#[derive(Debug, Clone, Copy)]
enum CommodityMatch {
    Any,
    Contains(&'static str),
    ContainsAnyOf(&'static [&'static str]),
}

impl CommodityMatch {
    fn matches(&self, commodity: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Contains(needle) => commodity.contains(needle),
            Self::ContainsAnyOf(needles) => needles.iter().any(|n| commodity.contains(n)),
        }
    }
}

/// One row of the USDA standard-weight decision table.
#[derive(Debug, Clone, Copy)]
struct GuessRule {
    package_needles: &'static [&'static str],
    package_excludes: &'static [&'static str],
    commodity: CommodityMatch,
    weight_lbs: f64,
    weight_kg: f64,
    source: &'static str,
}

impl GuessRule {
    fn matches(&self, commodity: &str, package: &str) -> bool {
        self.package_needles.iter().any(|n| package.contains(n))
            && !self.package_excludes.iter().any(|n| package.contains(n))
            && self.commodity.matches(commodity)
    }
}

macro_rules! rule {
    ($needles:expr, $excludes:expr, $commodity:expr, $lbs:expr, $kg:expr, $source:expr) => {
        GuessRule {
            package_needles: $needles,
            package_excludes: $excludes,
            commodity: $commodity,
            weight_lbs: $lbs,
            weight_kg: $kg,
            source: $source,
        }
    };
}

/// USDA Handbook 697 standard weights and container estimates, evaluated top
/// to bottom, first match wins. Order is the priority.
const GUESS_RULES: &[GuessRule] = &[
    rule!(
        &["1 1/9 bushel", "1-1/9 bushel"],
        &[],
        CommodityMatch::Contains("pepper"),
        28.0,
        12.7,
        "USDA Handbook 697 - 1 1/9 bushel peppers"
    ),
    rule!(
        &["1 1/9 bushel", "1-1/9 bushel"],
        &[],
        CommodityMatch::Contains("pea"),
        28.0,
        12.7,
        "USDA Handbook 697 - 1 1/9 bushel peas"
    ),
    rule!(
        &["1 1/9 bushel", "1-1/9 bushel"],
        &[],
        CommodityMatch::Contains("squash"),
        35.0,
        15.9,
        "USDA Handbook 697 - 1 1/9 bushel squash"
    ),
    rule!(
        &["1 1/9 bushel", "1-1/9 bushel"],
        &[],
        CommodityMatch::Contains("eggplant"),
        33.0,
        15.0,
        "USDA Handbook 697 - 1 1/9 bushel eggplant"
    ),
    rule!(
        &["1 1/9 bushel", "1-1/9 bushel"],
        &[],
        CommodityMatch::Any,
        30.0,
        13.6,
        "USDA Handbook 697 - 1 1/9 bushel default"
    ),
    rule!(
        &["4/7 bushel"],
        &[],
        CommodityMatch::Any,
        21.0,
        9.5,
        "USDA Handbook 697 - 4/7 bushel"
    ),
    rule!(
        &["bushel"],
        &[],
        CommodityMatch::Any,
        30.0,
        13.6,
        "USDA Handbook 697 - standard bushel"
    ),
    rule!(
        &["cartons bunched", "crates bunched"],
        &[],
        CommodityMatch::ContainsAnyOf(HERBS),
        5.0,
        2.3,
        "Herb bunched carton estimate"
    ),
    rule!(
        &["cartons bunched", "crates bunched"],
        &[],
        CommodityMatch::ContainsAnyOf(LEAFY_GREENS),
        25.0,
        11.3,
        "Leafy greens bunched carton - USDA standard"
    ),
    rule!(
        &["cartons bunched", "crates bunched"],
        &[],
        CommodityMatch::Any,
        12.0,
        5.4,
        "Bunched carton estimate"
    ),
    rule!(
        &["film bags bunched"],
        &[],
        CommodityMatch::Any,
        5.0,
        2.3,
        "Film bags bunched estimate"
    ),
    rule!(
        &["1 lb film bags"],
        &[],
        CommodityMatch::Any,
        1.0,
        0.45,
        "Single 1 lb film bag"
    ),
    rule!(
        &["cartons film lined"],
        &[],
        CommodityMatch::Contains("lettuce"),
        24.0,
        10.9,
        "USDA Handbook 697 - Lettuce cartons"
    ),
    rule!(
        &["cartons film lined"],
        &[],
        CommodityMatch::Any,
        24.0,
        10.9,
        "Film-lined carton estimate"
    ),
    rule!(
        &["cartons"],
        &["bunched"],
        CommodityMatch::Contains("lettuce"),
        24.0,
        10.9,
        "USDA Handbook 697 - Lettuce cartons"
    ),
    rule!(
        &["cartons"],
        &["bunched"],
        CommodityMatch::ContainsAnyOf(&["endive", "escarole"]),
        18.0,
        8.2,
        "Endive/Escarole carton estimate"
    ),
    rule!(
        &["cartons"],
        &["bunched"],
        CommodityMatch::Contains("mushroom"),
        10.0,
        4.5,
        "Mushroom carton estimate"
    ),
    rule!(
        &["cartons"],
        &["bunched"],
        CommodityMatch::Contains("artichoke"),
        22.0,
        10.0,
        "Artichoke carton - USDA standard"
    ),
    rule!(
        &["cartons"],
        &["bunched"],
        CommodityMatch::Contains("anise"),
        20.0,
        9.1,
        "Anise carton estimate"
    ),
    rule!(
        &["cartons"],
        &["bunched"],
        CommodityMatch::Contains("tomato"),
        25.0,
        11.3,
        "USDA Handbook 697 - Tomato cartons"
    ),
    rule!(
        &["cartons"],
        &["bunched"],
        CommodityMatch::Any,
        25.0,
        11.3,
        "Generic carton estimate"
    ),
    rule!(
        &["layer"],
        &[],
        CommodityMatch::Contains("radicchio"),
        12.0,
        5.4,
        "Radicchio layer container estimate"
    ),
    rule!(
        &["layer"],
        &[],
        CommodityMatch::Contains("tomato"),
        20.0,
        9.1,
        "Tomato flat layer estimate"
    ),
    rule!(
        &["layer"],
        &[],
        CommodityMatch::Any,
        15.0,
        6.8,
        "Layer container estimate"
    ),
    rule!(&["flats"], &[], CommodityMatch::Any, 12.0, 5.4, "Flat estimate"),
    rule!(&["crate"], &[], CommodityMatch::Any, 35.0, 15.9, "Crate estimate"),
    rule!(
        &["container"],
        &[],
        CommodityMatch::Any,
        25.0,
        11.3,
        "Generic container estimate"
    ),
    rule!(&["sack"], &[], CommodityMatch::Any, 50.0, 22.7, "Sack estimate"),
    rule!(
        &["rpc", "reusable plastic"],
        &[],
        CommodityMatch::Any,
        30.0,
        13.6,
        "RPC estimate"
    ),
    rule!(&["lug"], &[], CommodityMatch::Any, 25.0, 11.3, "Lug estimate"),
];

const DEFAULT_GUESS: WeightGuess = WeightGuess {
    weight_lbs: 25.0,
    weight_kg: 11.3,
    units: None,
    source: "Default estimate",
};

/// Estimate a weight for a pair absent from the reference table: explicit
/// quantity extraction first, then the standard-weight decision table, then
/// the fixed default. Never fails.
pub fn guess_weight(commodity: &str, package: &str) -> WeightGuess {
    if let Some(guess) = extract_package_weight(package) {
        return guess;
    }

    let commodity = commodity.to_lowercase();
    let package = package.to_lowercase();
    for rule in GUESS_RULES {
        if rule.matches(&commodity, &package) {
            return WeightGuess {
                weight_lbs: rule.weight_lbs,
                weight_kg: rule.weight_kg,
                units: None,
                source: rule.source,
            };
        }
    }

    DEFAULT_GUESS
}
