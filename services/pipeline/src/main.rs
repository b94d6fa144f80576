//! Pipeline Service - Normalizes raw finance extracts into the dashboard dataset
//!
//! Responsibilities:
//! - Read the raw tax and population source files (Census JSON rows or CSV)
//! - Resolve configurable column aliases to canonical fields
//! - Map tax codes and free-text labels to canonical revenue categories
//! - Select the top-N states by population for the target year
//! - Aggregate revenue per state and category, compute per-capita figures
//! - Write the dataset JSON consumed by the API service
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same inputs + same config = same dataset (modulo generatedAt)

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

#[derive(Parser, Debug)]
#[command(
    name = "pipeline",
    about = "Normalizes and aggregates state tax revenue into the dashboard dataset"
)]
struct Args {
    /// Tax revenue source file (Census JSON rows or delimited text)
    #[arg(long, default_value = "data/raw/census-tax.json")]
    tax: String,

    /// Population source file (same formats)
    #[arg(long, default_value = "data/raw/population.csv")]
    population: String,

    /// Pipeline config file (falls back to PIPELINE_CONFIG, then built-in defaults)
    #[arg(long)]
    config: Option<String>,

    /// Output dataset path
    #[arg(long, default_value = "data/dataset.json")]
    out: String,

    /// Compute and report without writing the dataset
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Errors
// =============================================================================
// Fatal whole-run conditions only. Row-level anomalies (unrecognized state,
// off-year rows, unknown codes, zero-amount buckets) are excluded from
// aggregation instead of raising.

#[derive(thiserror::Error, Debug)]
enum PipelineError {
    /// A required source file does not exist.
    #[error("required {role} input is missing: {path} (run the collector or pass the file explicitly)")]
    MissingInput { role: &'static str, path: String },

    /// A source file exists but is blank after trimming.
    #[error("source file {path} is empty")]
    EmptySource { path: String },

    /// Malformed delimited or JSON structure, with offending-row context.
    #[error("failed to parse {path}: {detail}")]
    Parse { path: String, detail: String },

    /// Normalization produced zero usable rows for one side of the join.
    #[error("no usable {side} rows for year {year} after normalization")]
    InsufficientData { side: &'static str, year: i32 },

    /// A required alias list or lookup entry is absent from the config.
    #[error("pipeline configuration is missing required entry '{key}'")]
    Configuration { key: String },
}

// =============================================================================
// State Roster
// =============================================================================
// The 50 recognized jurisdictions. Rows naming anything else (territories,
// "United States" aggregates, district rows) are excluded during
// normalization.

const STATE_ROSTER: [&str; 50] = [
    "Alabama",
    "Alaska",
    "Arizona",
    "Arkansas",
    "California",
    "Colorado",
    "Connecticut",
    "Delaware",
    "Florida",
    "Georgia",
    "Hawaii",
    "Idaho",
    "Illinois",
    "Indiana",
    "Iowa",
    "Kansas",
    "Kentucky",
    "Louisiana",
    "Maine",
    "Maryland",
    "Massachusetts",
    "Michigan",
    "Minnesota",
    "Mississippi",
    "Missouri",
    "Montana",
    "Nebraska",
    "Nevada",
    "New Hampshire",
    "New Jersey",
    "New Mexico",
    "New York",
    "North Carolina",
    "North Dakota",
    "Ohio",
    "Oklahoma",
    "Oregon",
    "Pennsylvania",
    "Rhode Island",
    "South Carolina",
    "South Dakota",
    "Tennessee",
    "Texas",
    "Utah",
    "Vermont",
    "Virginia",
    "Washington",
    "West Virginia",
    "Wisconsin",
    "Wyoming",
];

static STATE_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STATE_ROSTER.iter().copied().collect());

fn is_recognized_state(name: &str) -> bool {
    STATE_SET.contains(name.trim())
}

// =============================================================================
// Pipeline Configuration
// =============================================================================
// The data-shaped configuration surface: target year, top-N, column alias
// lists per logical field, tax-code lookups, and display labels. Every field
// has a built-in default so the pipeline runs without a config file.

const LICENSES_CATEGORY: &str = "licenses";

/// Logical fields that must have at least one column alias configured.
const REQUIRED_FIELDS: [&str; 9] = [
    "state",
    "year",
    "tax_code",
    "gov_level",
    "amount",
    "tax_type",
    "state_amount",
    "local_amount",
    "population",
];

#[derive(Debug, Deserialize)]
struct PipelineConfig {
    #[serde(default = "default_target_year")]
    target_year: i32,
    #[serde(default = "default_top_n")]
    top_n: usize,
    /// Ordered candidate column names per logical field, resolved first-match.
    #[serde(default = "default_columns")]
    columns: HashMap<String, Vec<String>>,
    /// Level-indicator values meaning state-level collection.
    #[serde(default = "default_state_level_values")]
    state_level_values: Vec<String>,
    /// Level-indicator values meaning local-level collection.
    #[serde(default = "default_local_level_values")]
    local_level_values: Vec<String>,
    /// Statistical tax code -> canonical category key.
    #[serde(default = "default_tax_codes")]
    tax_codes: HashMap<String, String>,
    /// Codes that all collapse into the "licenses" category.
    #[serde(default = "default_license_codes")]
    license_codes: Vec<String>,
    /// Category key -> display label.
    #[serde(default = "default_category_labels")]
    category_labels: HashMap<String, String>,
    /// Free-text tax-type label -> category key (pre-normalized sources).
    #[serde(default)]
    category_overrides: HashMap<String, String>,
}

fn default_target_year() -> i32 {
    2023
}

fn default_top_n() -> usize {
    10
}

fn default_columns() -> HashMap<String, Vec<String>> {
    [
        ("state", &["NAME", "state", "State", "GEO_NAME"][..]),
        ("year", &["YEAR", "year", "Year"][..]),
        ("tax_code", &["AGG_DESC", "agg_desc"][..]),
        ("gov_level", &["GOVTYPE", "govtype"][..]),
        ("amount", &["AMOUNT", "amount"][..]),
        ("tax_type", &["tax_type", "Tax Type", "TAX_TYPE"][..]),
        ("state_amount", &["state_amount", "State Amount", "STATE_AMOUNT"][..]),
        ("local_amount", &["local_amount", "Local Amount", "LOCAL_AMOUNT"][..]),
        ("population", &["POP", "B01003_001E", "population", "Population"][..]),
    ]
    .into_iter()
    .map(|(field, names)| {
        (
            field.to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        )
    })
    .collect()
}

fn default_state_level_values() -> Vec<String> {
    vec!["002".to_string()]
}

fn default_local_level_values() -> Vec<String> {
    vec!["003".to_string()]
}

fn default_tax_codes() -> HashMap<String, String> {
    [
        ("LF0002", "general-sales"),
        ("LF0003", "selective-sales"),
        ("LF0004", "selective-sales"),
        ("LF0009", "property"),
        ("LF0016", "income-individual"),
        ("LF0017", "income-corporate"),
        ("LF0022", "other"),
        ("LF0023", "other"),
    ]
    .into_iter()
    .map(|(code, category)| (code.to_string(), category.to_string()))
    .collect()
}

fn default_license_codes() -> Vec<String> {
    ["LF0012", "LF0013", "LF0014"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_category_labels() -> HashMap<String, String> {
    [
        ("property", "Property Taxes"),
        ("general-sales", "General Sales Taxes"),
        ("selective-sales", "Selective Sales Taxes"),
        ("income-individual", "Individual Income Taxes"),
        ("income-corporate", "Corporate Income Taxes"),
        ("licenses", "License Taxes"),
        ("other", "Other Taxes"),
    ]
    .into_iter()
    .map(|(key, label)| (key.to_string(), label.to_string()))
    .collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_year: default_target_year(),
            top_n: default_top_n(),
            columns: default_columns(),
            state_level_values: default_state_level_values(),
            local_level_values: default_local_level_values(),
            tax_codes: default_tax_codes(),
            license_codes: default_license_codes(),
            category_labels: default_category_labels(),
            category_overrides: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    fn aliases(&self, field: &str) -> Result<&[String], PipelineError> {
        self.columns
            .get(field)
            .filter(|candidates| !candidates.is_empty())
            .map(|candidates| candidates.as_slice())
            .ok_or_else(|| PipelineError::Configuration {
                key: format!("columns.{field}"),
            })
    }

    /// Every alias list must be present and every category the code map can
    /// produce must have a display label.
    fn validate(&self) -> Result<(), PipelineError> {
        for field in REQUIRED_FIELDS {
            self.aliases(field)?;
        }
        let mapped = self
            .tax_codes
            .values()
            .map(String::as_str)
            .chain([LICENSES_CATEGORY]);
        for category in mapped {
            if !self.category_labels.contains_key(category) {
                return Err(PipelineError::Configuration {
                    key: format!("category_labels.{category}"),
                });
            }
        }
        Ok(())
    }
}

/// Alias lists resolved once up front so per-row lookups never re-consult
/// the config map.
struct FieldAliases<'a> {
    state: &'a [String],
    year: &'a [String],
    tax_code: &'a [String],
    gov_level: &'a [String],
    amount: &'a [String],
    tax_type: &'a [String],
    state_amount: &'a [String],
    local_amount: &'a [String],
    population: &'a [String],
}

impl<'a> FieldAliases<'a> {
    fn from_config(config: &'a PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            state: config.aliases("state")?,
            year: config.aliases("year")?,
            tax_code: config.aliases("tax_code")?,
            gov_level: config.aliases("gov_level")?,
            amount: config.aliases("amount")?,
            tax_type: config.aliases("tax_type")?,
            state_amount: config.aliases("state_amount")?,
            local_amount: config.aliases("local_amount")?,
            population: config.aliases("population")?,
        })
    }
}

fn load_config(explicit_path: Option<&str>) -> Result<PipelineConfig> {
    let resolved = explicit_path
        .map(str::to_string)
        .or_else(|| std::env::var("PIPELINE_CONFIG").ok());

    match resolved {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read pipeline config {path}"))?;
            let config: PipelineConfig = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse pipeline config {path}"))?;
            Ok(config)
        }
        None => Ok(PipelineConfig::default()),
    }
}

// =============================================================================
// Numeric Coercion
// =============================================================================
// Source amounts arrive as JSON numbers, bare digit strings, or accounting
// text ("$1,234", "(500)"). Invalid input degrades to zero rather than
// erroring; the never-raises contract is what keeps row handling simple.

fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => {
            let v = n.as_f64().unwrap_or(0.0);
            if v.is_finite() {
                v
            } else {
                0.0
            }
        }
        Value::String(s) => coerce_text(s),
        _ => 0.0,
    }
}

fn coerce_text(raw: &str) -> f64 {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ','))
        .collect();
    let stripped = stripped.trim();

    // Accounting-style negative: (X) means -X
    let candidate = if stripped.len() >= 2 && stripped.starts_with('(') && stripped.ends_with(')') {
        format!("-{}", &stripped[1..stripped.len() - 1])
    } else {
        stripped.to_string()
    };

    match candidate.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Text view of a cell, for state names, codes, and labels.
fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// =============================================================================
// Source Row Reader
// =============================================================================
// Two source encodings feed the same record type: Census-API style JSON
// (array of arrays, first row = header labels) and delimited text with a
// header row. The format tag is decided once per file.

type RawRecord = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFormat {
    JsonRows,
    Delimited,
}

fn detect_format(content: &str) -> SourceFormat {
    if content.trim_start().starts_with('[') {
        SourceFormat::JsonRows
    } else {
        SourceFormat::Delimited
    }
}

fn read_records(path_label: &str, content: &str) -> Result<Vec<RawRecord>, PipelineError> {
    // Strip UTF-8 BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    if content.trim().is_empty() {
        return Err(PipelineError::EmptySource {
            path: path_label.to_string(),
        });
    }

    match detect_format(content) {
        SourceFormat::JsonRows => read_json_rows(path_label, content),
        SourceFormat::Delimited => read_delimited(path_label, content),
    }
}

fn read_json_rows(path_label: &str, content: &str) -> Result<Vec<RawRecord>, PipelineError> {
    let rows: Vec<Vec<Value>> =
        serde_json::from_str(content).map_err(|e| PipelineError::Parse {
            path: path_label.to_string(),
            detail: format!("expected a JSON array of arrays: {e}"),
        })?;

    let mut iter = rows.into_iter();
    let header_row = iter.next().ok_or_else(|| PipelineError::Parse {
        path: path_label.to_string(),
        detail: "JSON source decoded to an empty array".to_string(),
    })?;
    if header_row.is_empty() {
        return Err(PipelineError::Parse {
            path: path_label.to_string(),
            detail: "JSON header row is empty".to_string(),
        });
    }

    let headers: Vec<String> = header_row.iter().map(cell_text).collect();

    let records = iter
        .map(|row| headers.iter().cloned().zip(row).collect::<RawRecord>())
        .collect();
    Ok(records)
}

fn read_delimited(path_label: &str, content: &str) -> Result<Vec<RawRecord>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PipelineError::Parse {
            path: path_label.to_string(),
            detail: format!("failed to read header row: {e}"),
        })?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut records = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        // +2: 1-indexed plus the header line
        let record = result.map_err(|e| PipelineError::Parse {
            path: path_label.to_string(),
            detail: format!("row {}: {}", idx + 2, e),
        })?;

        let fields = record.iter().map(|field| Value::String(field.to_string()));
        records.push(headers.iter().cloned().zip(fields).collect::<RawRecord>());
    }
    Ok(records)
}

// =============================================================================
// Column Alias Resolver
// =============================================================================

/// First configured candidate present as a key wins. Exact, case-sensitive
/// match; `None` is the explicit absent marker, callers decide defaults.
fn resolve<'a>(record: &'a RawRecord, candidates: &[String]) -> Option<&'a Value> {
    candidates.iter().find_map(|name| record.get(name))
}

// =============================================================================
// Tax Category Normalizer
// =============================================================================
// Two input shapes, distinguished per record: statistical-code rows carry a
// tax code, a government-level indicator, and a single amount; pre-normalized
// rows carry direct state/local amounts and a free-text tax-type label.

#[derive(Debug, Clone, PartialEq)]
struct TaxRow {
    state: String,
    year: i32,
    category: String,
    state_amount: f64,
    local_amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct PopulationRow {
    state: String,
    year: i32,
    population: i64,
}

/// (state, category) buckets for the target year, merged by addition,
/// first-encounter order preserved.
struct TaxBuckets {
    rows: Vec<TaxRow>,
    index: HashMap<(String, String), usize>,
}

impl TaxBuckets {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn add(&mut self, state: &str, year: i32, category: &str, state_amount: f64, local_amount: f64) {
        let key = (state.to_string(), category.to_string());
        match self.index.get(&key) {
            Some(&i) => {
                self.rows[i].state_amount += state_amount;
                self.rows[i].local_amount += local_amount;
            }
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(TaxRow {
                    state: state.to_string(),
                    year,
                    category: category.to_string(),
                    state_amount,
                    local_amount,
                });
            }
        }
    }

    /// Buckets whose combined amount is exactly zero carry no information
    /// and would clutter category membership.
    fn into_rows(self) -> Vec<TaxRow> {
        self.rows
            .into_iter()
            .filter(|row| row.state_amount + row.local_amount != 0.0)
            .collect()
    }
}

/// Category key from a free-text label: lowercased, non-alphanumeric runs
/// collapsed to a single dash, leading/trailing dashes trimmed.
fn slugify(label: &str) -> String {
    let mut out = String::new();
    let mut pending_separator = false;
    for c in label.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('-');
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }
    out
}

fn normalize_tax_records(
    records: &[RawRecord],
    aliases: &FieldAliases,
    config: &PipelineConfig,
) -> (Vec<TaxRow>, usize) {
    let mut buckets = TaxBuckets::new();
    let mut skipped = 0usize;

    for record in records {
        let state = match resolve(record, aliases.state) {
            Some(value) => cell_text(value),
            None => {
                skipped += 1;
                continue;
            }
        };
        if !is_recognized_state(&state) {
            skipped += 1;
            continue;
        }

        let year = match resolve(record, aliases.year) {
            Some(value) => coerce_number(value) as i32,
            None => 0,
        };
        if year != config.target_year {
            skipped += 1;
            continue;
        }

        let code = resolve(record, aliases.tax_code);
        let level = resolve(record, aliases.gov_level);
        let amount = resolve(record, aliases.amount);

        if let (Some(code), Some(level), Some(amount)) = (code, level, amount) {
            // Statistical-code shape
            let code = cell_text(code);
            let category = if config.license_codes.iter().any(|c| *c == code) {
                LICENSES_CATEGORY.to_string()
            } else if let Some(category) = config.tax_codes.get(&code) {
                category.clone()
            } else {
                skipped += 1;
                continue;
            };

            let level = cell_text(level);
            let value = coerce_number(amount);
            if config.state_level_values.iter().any(|v| *v == level) {
                buckets.add(&state, year, &category, value, 0.0);
            } else if config.local_level_values.iter().any(|v| *v == level) {
                buckets.add(&state, year, &category, 0.0, value);
            } else {
                skipped += 1;
            }
        } else {
            // Pre-normalized shape
            let label = match resolve(record, aliases.tax_type) {
                Some(value) => cell_text(value),
                None => {
                    skipped += 1;
                    continue;
                }
            };
            if label.is_empty() {
                skipped += 1;
                continue;
            }

            let category = config
                .category_overrides
                .get(&label)
                .cloned()
                .unwrap_or_else(|| slugify(&label));

            let state_amount = resolve(record, aliases.state_amount)
                .map(coerce_number)
                .unwrap_or(0.0);
            let local_amount = resolve(record, aliases.local_amount)
                .map(coerce_number)
                .unwrap_or(0.0);
            buckets.add(&state, year, &category, state_amount, local_amount);
        }
    }

    (buckets.into_rows(), skipped)
}

// =============================================================================
// Population Resolver
// =============================================================================

fn normalize_population(
    records: &[RawRecord],
    aliases: &FieldAliases,
    config: &PipelineConfig,
) -> (Vec<PopulationRow>, usize) {
    let mut rows: Vec<PopulationRow> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut skipped = 0usize;

    for record in records {
        let state = match resolve(record, aliases.state) {
            Some(value) => cell_text(value),
            None => {
                skipped += 1;
                continue;
            }
        };
        if !is_recognized_state(&state) {
            skipped += 1;
            continue;
        }

        let year = match resolve(record, aliases.year) {
            Some(value) => coerce_number(value) as i32,
            None => 0,
        };
        if year != config.target_year {
            skipped += 1;
            continue;
        }

        let population = resolve(record, aliases.population)
            .map(coerce_number)
            .unwrap_or(0.0) as i64;
        if population <= 0 {
            skipped += 1;
            continue;
        }

        // Duplicate states: last valid value wins, first-encounter position
        // is kept for stable tie ordering.
        match index.get(&state) {
            Some(&i) => rows[i].population = population,
            None => {
                index.insert(state.clone(), rows.len());
                rows.push(PopulationRow {
                    state,
                    year,
                    population,
                });
            }
        }
    }

    (rows, skipped)
}

/// Rank descending by population (ties keep input order) and keep the
/// first N as the comparison set.
fn select_top_states(
    mut rows: Vec<PopulationRow>,
    config: &PipelineConfig,
) -> Result<Vec<PopulationRow>, PipelineError> {
    if rows.is_empty() {
        return Err(PipelineError::InsufficientData {
            side: "population",
            year: config.target_year,
        });
    }
    rows.sort_by(|a, b| b.population.cmp(&a.population));
    rows.truncate(config.top_n);
    Ok(rows)
}

// =============================================================================
// Aggregation Engine
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateEntry {
    state: String,
    population: i64,
    total_revenue: f64,
    per_capita_total: f64,
    breakdown: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TaxType {
    key: String,
    label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    year: i32,
    currency: String,
    scope: String,
    top_n: usize,
    generated_at: String,
    notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputPayload {
    metadata: Metadata,
    tax_types: Vec<TaxType>,
    states: Vec<StateEntry>,
}

const DATASET_SCOPE: &str =
    "State and local government tax revenue for the most populous US states";

const DATASET_NOTES: [&str; 3] = [
    "Amounts are nominal dollars in thousands of USD; multiply by 1000 for display.",
    "States are selected by resident population for the target year (top-N).",
    "Per-capita figures divide total revenue by resident population.",
];

fn display_label(config: &PipelineConfig, key: &str) -> String {
    if let Some(label) = config.category_labels.get(key) {
        return label.clone();
    }
    // Slug-derived categories fall back to title-casing the key
    key.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn aggregate(
    tax_rows: &[TaxRow],
    selected: &[PopulationRow],
    config: &PipelineConfig,
) -> OutputPayload {
    let positions: HashMap<&str, usize> = selected
        .iter()
        .enumerate()
        .map(|(i, row)| (row.state.as_str(), i))
        .collect();

    let mut totals = vec![0.0f64; selected.len()];
    let mut breakdowns: Vec<BTreeMap<String, f64>> = vec![BTreeMap::new(); selected.len()];
    // First-seen order across all states drives the display category list
    let mut category_order: Vec<String> = Vec::new();

    for row in tax_rows {
        let Some(&i) = positions.get(row.state.as_str()) else {
            continue;
        };
        let amount = row.state_amount + row.local_amount;
        if !category_order.iter().any(|c| *c == row.category) {
            category_order.push(row.category.clone());
        }
        *breakdowns[i].entry(row.category.clone()).or_insert(0.0) += amount;
        totals[i] += amount;
    }

    let mut states: Vec<StateEntry> = Vec::with_capacity(selected.len());
    for ((row, total), breakdown) in selected.iter().zip(totals).zip(breakdowns) {
        let total_revenue = total.round();
        let per_capita_total = if row.population > 0 {
            (total_revenue / row.population as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };
        states.push(StateEntry {
            state: row.state.clone(),
            population: row.population,
            total_revenue,
            per_capita_total,
            breakdown,
        });
    }

    // Descending by total revenue; sort_by is stable so ties keep the
    // population-rank encounter order
    states.sort_by(|a, b| b.total_revenue.total_cmp(&a.total_revenue));

    let tax_types = category_order
        .iter()
        .map(|key| TaxType {
            key: key.clone(),
            label: display_label(config, key),
        })
        .collect();

    OutputPayload {
        metadata: Metadata {
            year: config.target_year,
            currency: "USD".to_string(),
            scope: DATASET_SCOPE.to_string(),
            top_n: config.top_n,
            generated_at: Utc::now().to_rfc3339(),
            notes: DATASET_NOTES.iter().map(|n| n.to_string()).collect(),
        },
        tax_types,
        states,
    }
}

// =============================================================================
// Main
// =============================================================================

fn read_source(path: &str, role: &'static str) -> Result<Vec<RawRecord>> {
    if !Path::new(path).exists() {
        return Err(PipelineError::MissingInput {
            role,
            path: path.to_string(),
        }
        .into());
    }
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    Ok(read_records(path, &content)?)
}

/// The payload is fully serialized before anything touches the output path,
/// so a failed run leaves the previous dataset intact.
fn write_dataset(path: &str, payload: &OutputPayload) -> Result<()> {
    let body = serde_json::to_string_pretty(payload).context("failed to serialize dataset")?;
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    fs::write(path, body).with_context(|| format!("failed to write {path}"))?;
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== State Revenue Pipeline ===");

    let config = load_config(args.config.as_deref())?;
    config.validate()?;
    let aliases = FieldAliases::from_config(&config)?;

    println!("Target year: {}", config.target_year);
    println!("Top N states: {}", config.top_n);

    // Tax side
    println!("\nReading tax source: {}", args.tax);
    let tax_records = read_source(&args.tax, "tax")?;
    println!("  {} raw rows", tax_records.len());

    let (tax_rows, tax_skipped) = normalize_tax_records(&tax_records, &aliases, &config);
    if tax_rows.is_empty() {
        return Err(PipelineError::InsufficientData {
            side: "tax",
            year: config.target_year,
        }
        .into());
    }
    println!(
        "  {} (state, category) buckets, {} rows excluded",
        tax_rows.len(),
        tax_skipped
    );

    // Population side
    println!("\nReading population source: {}", args.population);
    let population_records = read_source(&args.population, "population")?;
    println!("  {} raw rows", population_records.len());

    let (population_rows, population_skipped) =
        normalize_population(&population_records, &aliases, &config);
    println!(
        "  {} states with valid population, {} rows excluded",
        population_rows.len(),
        population_skipped
    );

    let selected = select_top_states(population_rows, &config)?;
    println!("\nSelected {} states by population:", selected.len());
    for row in &selected {
        println!("  {:<15} {}", row.state, row.population);
    }

    // Aggregate and write
    let payload = aggregate(&tax_rows, &selected, &config);
    println!("\nCategories: {}", payload.tax_types.len());
    for tax_type in &payload.tax_types {
        println!("  {} ({})", tax_type.label, tax_type.key);
    }

    if args.dry_run {
        println!("\nDry run - dataset not written");
        return Ok(());
    }

    write_dataset(&args.out, &payload)?;

    println!("\n=== Pipeline Complete ===");
    println!("States: {}", payload.states.len());
    println!("Dataset: {}", args.out);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[(&str, &str)]) -> RawRecord {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    // -------------------------------------------------------------------------
    // NUMERIC COERCION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_coerce_currency_and_separators() {
        assert_eq!(coerce_text("$1,234"), 1234.0);
        assert_eq!(coerce_text("$ 1,234.56"), 1234.56);
        assert_eq!(coerce_text("  42  "), 42.0);
    }

    #[test]
    fn test_coerce_parenthesized_negative() {
        assert_eq!(coerce_text("(500)"), -500.0);
        assert_eq!(coerce_text("($1,500)"), -1500.0);
    }

    #[test]
    fn test_coerce_invalid_degrades_to_zero() {
        assert_eq!(coerce_text(""), 0.0);
        assert_eq!(coerce_text("abc"), 0.0);
        assert_eq!(coerce_text("()"), 0.0);
    }

    #[test]
    fn test_coerce_json_values() {
        assert_eq!(coerce_number(&serde_json::json!(1500)), 1500.0);
        assert_eq!(coerce_number(&serde_json::json!(12.5)), 12.5);
        assert_eq!(coerce_number(&serde_json::json!("1,000")), 1000.0);
        assert_eq!(coerce_number(&serde_json::json!(true)), 0.0);
        assert_eq!(coerce_number(&Value::Null), 0.0);
    }

    // -------------------------------------------------------------------------
    // STATE ROSTER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_roster_recognizes_states() {
        assert!(is_recognized_state("Texas"));
        assert!(is_recognized_state("  New Hampshire "));
    }

    #[test]
    fn test_roster_rejects_non_states() {
        assert!(!is_recognized_state("Puerto Rico"));
        assert!(!is_recognized_state("District of Columbia"));
        assert!(!is_recognized_state("United States"));
        assert!(!is_recognized_state("texas"));
    }

    // -------------------------------------------------------------------------
    // SOURCE ROW READER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("[[\"a\"],[\"b\"]]"), SourceFormat::JsonRows);
        assert_eq!(detect_format("  \n [[1]]"), SourceFormat::JsonRows);
        assert_eq!(detect_format("a,b\n1,2\n"), SourceFormat::Delimited);
    }

    #[test]
    fn test_read_json_rows() {
        let content = r#"[["NAME","AMOUNT"],["Texas",1000],["Ohio","2,000"]]"#;
        let records = read_records("tax.json", content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["NAME"], Value::String("Texas".to_string()));
        assert_eq!(coerce_number(&records[0]["AMOUNT"]), 1000.0);
        assert_eq!(coerce_number(&records[1]["AMOUNT"]), 2000.0);
    }

    #[test]
    fn test_read_json_rows_not_arrays_fails() {
        let err = read_records("tax.json", r#"[{"NAME":"Texas"}]"#).unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }

    #[test]
    fn test_read_json_rows_empty_array_fails() {
        let err = read_records("tax.json", "[]").unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }

    #[test]
    fn test_read_blank_source_fails() {
        let err = read_records("tax.csv", "   \n  ").unwrap_err();
        assert!(matches!(err, PipelineError::EmptySource { .. }));
    }

    #[test]
    fn test_read_delimited() {
        let content = "state,year,population\nTexas,2023,30000000\n";
        let records = read_records("pop.csv", content).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["state"], Value::String("Texas".to_string()));
    }

    #[test]
    fn test_read_delimited_quoted_fields() {
        let content = "state,tax_type,state_amount\nTexas,\"Sales, General\",100\n";
        let records = read_records("tax.csv", content).unwrap();
        assert_eq!(
            records[0]["tax_type"],
            Value::String("Sales, General".to_string())
        );
    }

    #[test]
    fn test_read_delimited_ragged_row_fails() {
        let content = "state,year,population\nTexas,2023\n";
        let err = read_records("pop.csv", content).unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }

    #[test]
    fn test_read_delimited_with_bom() {
        let content = "\u{feff}state,year,population\nTexas,2023,100\n";
        let records = read_records("pop.csv", content).unwrap();
        assert_eq!(records[0]["state"], Value::String("Texas".to_string()));
    }

    // -------------------------------------------------------------------------
    // COLUMN ALIAS RESOLVER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_resolve_first_candidate_wins() {
        let rec = record(&[("NAME", "Texas"), ("state", "Ohio")]);
        let candidates = vec!["NAME".to_string(), "state".to_string()];
        assert_eq!(
            resolve(&rec, &candidates),
            Some(&Value::String("Texas".to_string()))
        );
    }

    #[test]
    fn test_resolve_absent_returns_none() {
        let rec = record(&[("NAME", "Texas")]);
        let candidates = vec!["population".to_string()];
        assert_eq!(resolve(&rec, &candidates), None);
    }

    #[test]
    fn test_resolve_is_case_sensitive() {
        let rec = record(&[("name", "Texas")]);
        let candidates = vec!["NAME".to_string()];
        assert_eq!(resolve(&rec, &candidates), None);
    }

    // -------------------------------------------------------------------------
    // TAX CATEGORY NORMALIZER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Individual Income Tax"), "individual-income-tax");
        assert_eq!(slugify("  Motor Fuels!! "), "motor-fuels");
        assert_eq!(slugify("(Other)"), "other");
    }

    #[test]
    fn test_statistical_shape_merges_levels() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![
            record(&[
                ("NAME", "Texas"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF0009"),
                ("GOVTYPE", "002"),
                ("AMOUNT", "1,000"),
            ]),
            record(&[
                ("NAME", "Texas"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF0009"),
                ("GOVTYPE", "003"),
                ("AMOUNT", "500"),
            ]),
        ];

        let (rows, skipped) = normalize_tax_records(&records, &aliases, &cfg);
        assert_eq!(skipped, 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "Texas");
        assert_eq!(rows[0].category, "property");
        assert_eq!(rows[0].state_amount, 1000.0);
        assert_eq!(rows[0].local_amount, 500.0);
    }

    #[test]
    fn test_statistical_shape_license_codes_collapse() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![
            record(&[
                ("NAME", "Ohio"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF0012"),
                ("GOVTYPE", "002"),
                ("AMOUNT", "10"),
            ]),
            record(&[
                ("NAME", "Ohio"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF0013"),
                ("GOVTYPE", "002"),
                ("AMOUNT", "20"),
            ]),
        ];

        let (rows, _) = normalize_tax_records(&records, &aliases, &cfg);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, "licenses");
        assert_eq!(rows[0].state_amount, 30.0);
    }

    #[test]
    fn test_statistical_shape_drops_unknown_code_and_level() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![
            record(&[
                ("NAME", "Texas"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF9999"),
                ("GOVTYPE", "002"),
                ("AMOUNT", "100"),
            ]),
            record(&[
                ("NAME", "Texas"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF0009"),
                ("GOVTYPE", "001"),
                ("AMOUNT", "100"),
            ]),
        ];

        let (rows, skipped) = normalize_tax_records(&records, &aliases, &cfg);
        assert!(rows.is_empty());
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_normalizer_excludes_off_year_and_off_roster() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![
            record(&[
                ("NAME", "Texas"),
                ("YEAR", "2022"),
                ("AGG_DESC", "LF0009"),
                ("GOVTYPE", "002"),
                ("AMOUNT", "100"),
            ]),
            record(&[
                ("NAME", "Puerto Rico"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF0009"),
                ("GOVTYPE", "002"),
                ("AMOUNT", "100"),
            ]),
        ];

        let (rows, skipped) = normalize_tax_records(&records, &aliases, &cfg);
        assert!(rows.is_empty());
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_zero_combined_buckets_are_dropped() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![
            record(&[
                ("NAME", "Texas"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF0009"),
                ("GOVTYPE", "002"),
                ("AMOUNT", "500"),
            ]),
            record(&[
                ("NAME", "Texas"),
                ("YEAR", "2023"),
                ("AGG_DESC", "LF0009"),
                ("GOVTYPE", "003"),
                ("AMOUNT", "(500)"),
            ]),
        ];

        let (rows, _) = normalize_tax_records(&records, &aliases, &cfg);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_pre_normalized_shape_slugifies_label() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![record(&[
            ("state", "Texas"),
            ("year", "2023"),
            ("tax_type", "Severance Tax"),
            ("state_amount", "$2,000"),
            ("local_amount", "0"),
        ])];

        let (rows, skipped) = normalize_tax_records(&records, &aliases, &cfg);
        assert_eq!(skipped, 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].category, "severance-tax");
        assert_eq!(rows[0].state_amount, 2000.0);
        assert_eq!(rows[0].local_amount, 0.0);
    }

    #[test]
    fn test_pre_normalized_shape_applies_override() {
        let mut cfg = config();
        cfg.category_overrides.insert(
            "Individual Income".to_string(),
            "income-individual".to_string(),
        );
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![record(&[
            ("state", "Texas"),
            ("year", "2023"),
            ("tax_type", "Individual Income"),
            ("state_amount", "100"),
            ("local_amount", "50"),
        ])];

        let (rows, _) = normalize_tax_records(&records, &aliases, &cfg);
        assert_eq!(rows[0].category, "income-individual");
    }

    #[test]
    fn test_pre_normalized_shape_sums_duplicate_categories() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![
            record(&[
                ("state", "Texas"),
                ("year", "2023"),
                ("tax_type", "Property Tax"),
                ("state_amount", "100"),
                ("local_amount", "10"),
            ]),
            record(&[
                ("state", "Texas"),
                ("year", "2023"),
                ("tax_type", "Property Tax"),
                ("state_amount", "200"),
                ("local_amount", "20"),
            ]),
        ];

        // Merge must sum, never overwrite
        let (rows, _) = normalize_tax_records(&records, &aliases, &cfg);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state_amount, 300.0);
        assert_eq!(rows[0].local_amount, 30.0);
    }

    // -------------------------------------------------------------------------
    // POPULATION RESOLVER TESTS
    // -------------------------------------------------------------------------

    fn population_record(state: &str, year: &str, population: &str) -> RawRecord {
        record(&[("state", state), ("year", year), ("population", population)])
    }

    #[test]
    fn test_population_filters_year_roster_and_nonpositive() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![
            population_record("Texas", "2023", "30000000"),
            population_record("Texas", "2022", "29000000"),
            population_record("Puerto Rico", "2023", "3200000"),
            population_record("Ohio", "2023", "0"),
            population_record("Maine", "2023", "-5"),
        ];

        let (rows, skipped) = normalize_population(&records, &aliases, &cfg);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "Texas");
        assert_eq!(skipped, 4);
    }

    #[test]
    fn test_population_last_write_wins() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let records = vec![
            population_record("Texas", "2023", "100"),
            population_record("Ohio", "2023", "200"),
            population_record("Texas", "2023", "300"),
        ];

        let (rows, _) = normalize_population(&records, &aliases, &cfg);
        assert_eq!(rows.len(), 2);
        // Value updated, first-encounter position kept
        assert_eq!(rows[0].state, "Texas");
        assert_eq!(rows[0].population, 300);
        assert_eq!(rows[1].state, "Ohio");
    }

    #[test]
    fn test_select_top_states_ranks_descending() {
        let mut cfg = config();
        cfg.top_n = 2;
        let rows = vec![
            PopulationRow {
                state: "Vermont".to_string(),
                year: 2023,
                population: 100,
            },
            PopulationRow {
                state: "Texas".to_string(),
                year: 2023,
                population: 300,
            },
            PopulationRow {
                state: "Ohio".to_string(),
                year: 2023,
                population: 200,
            },
        ];

        let selected = select_top_states(rows, &cfg).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].state, "Texas");
        assert_eq!(selected[1].state, "Ohio");
    }

    #[test]
    fn test_select_top_states_ties_keep_input_order() {
        let mut cfg = config();
        cfg.top_n = 3;
        let rows = vec![
            PopulationRow {
                state: "Iowa".to_string(),
                year: 2023,
                population: 200,
            },
            PopulationRow {
                state: "Utah".to_string(),
                year: 2023,
                population: 200,
            },
            PopulationRow {
                state: "Ohio".to_string(),
                year: 2023,
                population: 500,
            },
        ];

        let selected = select_top_states(rows, &cfg).unwrap();
        assert_eq!(selected[0].state, "Ohio");
        assert_eq!(selected[1].state, "Iowa");
        assert_eq!(selected[2].state, "Utah");
    }

    #[test]
    fn test_select_top_states_empty_is_insufficient() {
        let cfg = config();
        let err = select_top_states(Vec::new(), &cfg).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientData {
                side: "population",
                ..
            }
        ));
    }

    // -------------------------------------------------------------------------
    // AGGREGATION ENGINE TESTS
    // -------------------------------------------------------------------------

    fn tax_row(state: &str, category: &str, state_amount: f64, local_amount: f64) -> TaxRow {
        TaxRow {
            state: state.to_string(),
            year: 2023,
            category: category.to_string(),
            state_amount,
            local_amount,
        }
    }

    fn pop_row(state: &str, population: i64) -> PopulationRow {
        PopulationRow {
            state: state.to_string(),
            year: 2023,
            population,
        }
    }

    #[test]
    fn test_aggregate_breakdown_sums_to_total() {
        let cfg = config();
        let tax_rows = vec![
            tax_row("Texas", "property", 1000.0, 500.0),
            tax_row("Texas", "general-sales", 2000.0, 0.0),
            tax_row("Texas", "property", 250.0, 0.0),
        ];
        let selected = vec![pop_row("Texas", 30_000_000)];

        let payload = aggregate(&tax_rows, &selected, &cfg);
        let state = &payload.states[0];
        assert_eq!(state.total_revenue, 3750.0);
        let breakdown_sum: f64 = state.breakdown.values().sum();
        assert!((breakdown_sum - state.total_revenue).abs() <= 1.0);
        assert_eq!(state.breakdown["property"], 1750.0);
        assert_eq!(state.breakdown["general-sales"], 2000.0);
    }

    #[test]
    fn test_aggregate_per_capita_rounds_to_cents() {
        let cfg = config();
        let tax_rows = vec![tax_row("Texas", "property", 1000.0, 0.0)];
        let selected = vec![pop_row("Texas", 3)];

        let payload = aggregate(&tax_rows, &selected, &cfg);
        assert_eq!(payload.states[0].per_capita_total, 333.33);
    }

    #[test]
    fn test_aggregate_ignores_unselected_states() {
        let cfg = config();
        let tax_rows = vec![
            tax_row("Texas", "property", 100.0, 0.0),
            tax_row("Vermont", "property", 999.0, 0.0),
        ];
        let selected = vec![pop_row("Texas", 100)];

        let payload = aggregate(&tax_rows, &selected, &cfg);
        assert_eq!(payload.states.len(), 1);
        assert_eq!(payload.states[0].state, "Texas");
        assert_eq!(payload.states[0].total_revenue, 100.0);
    }

    #[test]
    fn test_aggregate_orders_states_by_total_descending() {
        let cfg = config();
        let tax_rows = vec![
            tax_row("California", "property", 100.0, 0.0),
            tax_row("Texas", "property", 500.0, 0.0),
            tax_row("Florida", "property", 300.0, 0.0),
        ];
        let selected = vec![
            pop_row("California", 39_000_000),
            pop_row("Texas", 30_000_000),
            pop_row("Florida", 22_000_000),
        ];

        let payload = aggregate(&tax_rows, &selected, &cfg);
        let order: Vec<&str> = payload.states.iter().map(|s| s.state.as_str()).collect();
        assert_eq!(order, ["Texas", "Florida", "California"]);
    }

    #[test]
    fn test_aggregate_tax_types_first_seen_order() {
        let cfg = config();
        let tax_rows = vec![
            tax_row("Texas", "general-sales", 100.0, 0.0),
            tax_row("Texas", "property", 100.0, 0.0),
            tax_row("Ohio", "general-sales", 100.0, 0.0),
            tax_row("Ohio", "licenses", 100.0, 0.0),
        ];
        let selected = vec![pop_row("Texas", 200), pop_row("Ohio", 100)];

        let payload = aggregate(&tax_rows, &selected, &cfg);
        let keys: Vec<&str> = payload.tax_types.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, ["general-sales", "property", "licenses"]);
        assert_eq!(payload.tax_types[1].label, "Property Taxes");
    }

    #[test]
    fn test_aggregate_state_with_no_tax_rows_keeps_zero_totals() {
        let cfg = config();
        let tax_rows = vec![tax_row("Texas", "property", 100.0, 0.0)];
        let selected = vec![pop_row("Texas", 100), pop_row("Ohio", 50)];

        let payload = aggregate(&tax_rows, &selected, &cfg);
        assert_eq!(payload.states.len(), 2);
        let ohio = payload.states.iter().find(|s| s.state == "Ohio").unwrap();
        assert_eq!(ohio.total_revenue, 0.0);
        assert_eq!(ohio.per_capita_total, 0.0);
        assert!(ohio.breakdown.is_empty());
    }

    #[test]
    fn test_display_label_falls_back_to_title_case() {
        let cfg = config();
        assert_eq!(display_label(&cfg, "property"), "Property Taxes");
        assert_eq!(display_label(&cfg, "severance-tax"), "Severance Tax");
    }

    // -------------------------------------------------------------------------
    // DETERMINISM TESTS - Same input MUST produce same output
    // -------------------------------------------------------------------------

    #[test]
    fn test_pipeline_is_deterministic() {
        let cfg = config();
        let aliases = FieldAliases::from_config(&cfg).unwrap();
        let tax_content = r#"[["NAME","YEAR","AGG_DESC","GOVTYPE","AMOUNT"],
            ["Texas","2023","LF0009","002","1,000"],
            ["Texas","2023","LF0009","003","500"],
            ["Ohio","2023","LF0002","002","800"],
            ["Texas","2023","LF0016","002","2,500"]]"#;
        let pop_content = "state,year,population\nTexas,2023,30000000\nOhio,2023,11000000\n";

        let run = || {
            let tax_records = read_records("tax.json", tax_content).unwrap();
            let (tax_rows, _) = normalize_tax_records(&tax_records, &aliases, &cfg);
            let pop_records = read_records("pop.csv", pop_content).unwrap();
            let (pop_rows, _) = normalize_population(&pop_records, &aliases, &cfg);
            let selected = select_top_states(pop_rows, &cfg).unwrap();
            aggregate(&tax_rows, &selected, &cfg)
        };

        let first = run();
        let second = run();
        // Identical modulo generatedAt
        assert_eq!(first.tax_types, second.tax_types);
        assert_eq!(first.states, second.states);
    }

    // -------------------------------------------------------------------------
    // CONFIG VALIDATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_config_validate_reports_missing_alias() {
        let mut cfg = config();
        cfg.columns.remove("population");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("columns.population"));
    }

    #[test]
    fn test_config_validate_reports_missing_label() {
        let mut cfg = config();
        cfg.category_labels.remove("property");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("category_labels.property"));
    }
}
