use crate::extract::values::{is_null_like, map_to_allowed, normalize_text};
use crate::extract::ExtractionResult;
use crate::keys::{is_canonical_key, slugify};
use crate::taxonomy::AttributeDef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// Spreadsheet columns that describe the product rather than an attribute.
pub const BASE_COLUMNS: &[&str] = &[
    "Title",
    "Handle",
    "Product ID",
    "Product Type",
    "Vendor",
    "Price Range",
    "Status",
];

/// Resolves display names and keys to canonical keys. Keys win over names
/// when the two collide.
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    exact: HashMap<String, String>,
    folded: HashMap<String, String>,
    columns: Vec<(String, String)>,
}

impl KeyMap {
    pub fn build(defs: &[AttributeDef]) -> Self {
        let mut map = KeyMap::default();
        for def in defs {
            map.exact.entry(def.key.clone()).or_insert_with(|| def.key.clone());
            map.folded
                .entry(normalize_text(&def.key))
                .or_insert_with(|| def.key.clone());
            if !map.columns.iter().any(|(key, _)| key == &def.key) {
                map.columns.push((def.key.clone(), def.name.clone()));
            }
        }
        for def in defs {
            map.exact
                .entry(def.name.trim().to_string())
                .or_insert_with(|| def.key.clone());
            map.folded
                .entry(normalize_text(&def.name))
                .or_insert_with(|| def.key.clone());
        }
        map
    }

    pub fn lookup(&self, raw: &str) -> Option<&str> {
        let trimmed = raw.trim();
        self.exact
            .get(trimmed)
            .or_else(|| self.folded.get(&normalize_text(trimmed)))
            .map(String::as_str)
    }

    /// Canonical key for `raw`. Names unknown to the schema (columns added
    /// by an editor) fall back to their slug instead of failing.
    pub fn normalize(&self, raw: &str) -> String {
        if let Some(key) = self.lookup(raw) {
            return key.to_string();
        }
        let slug = slugify(raw);
        self.lookup(&slug).map(str::to_string).unwrap_or(slug)
    }

    pub fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.columns
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, name)| name.as_str())
            .unwrap_or(key)
    }

}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(
        default,
        alias = "metafields",
        alias = "category_metafields",
        alias = "categoryMetafields"
    )]
    pub attributes: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditedRecord {
    #[serde(alias = "Title")]
    pub title: String,
    #[serde(default, alias = "metafields")]
    pub attributes: Map<String, Value>,
}

impl EditedRecord {
    /// Splits a parsed spreadsheet row into title and attribute columns.
    /// Rows without a title cannot be matched and yield `None`.
    pub fn from_row(row: &Map<String, Value>) -> Option<Self> {
        let title = row
            .iter()
            .find(|(column, _)| column.trim().eq_ignore_ascii_case("title"))
            .and_then(|(_, value)| clean_cell(value))
            .map(|value| match value {
                Value::String(text) => text,
                other => other.to_string(),
            })?;
        let attributes = row
            .iter()
            .filter(|(column, _)| !column.trim().is_empty() && !is_base_column(column))
            .filter_map(|(column, value)| clean_cell(value).map(|v| (column.trim().to_string(), v)))
            .collect();
        Some(Self { title, attributes })
    }
}

fn is_base_column(column: &str) -> bool {
    let column = column.trim();
    BASE_COLUMNS
        .iter()
        .any(|base| base.eq_ignore_ascii_case(column))
}

/// Blank, `null` and `N/A` cells are absent. Cells holding a JSON list
/// are parsed so list attributes survive the spreadsheet round trip.
pub fn clean_cell(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || is_null_like(trimmed) {
                return None;
            }
            if trimmed.starts_with('[')
                && trimmed.ends_with(']')
                && let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed)
            {
                let items: Vec<Value> = items.iter().filter_map(clean_cell).collect();
                return (!items.is_empty()).then_some(Value::Array(items));
            }
            Some(Value::String(trimmed.to_string()))
        }
        Value::Array(items) => {
            let items: Vec<Value> = items.iter().filter_map(clean_cell).collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        Value::Number(number) => number
            .as_f64()
            .filter(|n| n.is_finite())
            .map(|_| value.clone()),
        other => Some(other.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "issue", rename_all = "camelCase")]
pub enum ReconcileIssue {
    UnmatchedTitle { title: String },
    AmbiguousTitle { title: String, matches: usize },
    RejectedValue { title: String, key: String, value: Value },
    MissingProductId { title: String },
    InvalidKey { title: String, column: String },
    DuplicateEditedTitle { title: String, rows: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub edited: usize,
    pub canonical: usize,
    pub matched: usize,
    pub total_values: usize,
    pub issues: Vec<ReconcileIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncOutcome {
    pub records: Vec<CanonicalRecord>,
    pub report: ReconcileReport,
}

/// Writes edited attribute maps back onto canonical records matched by
/// title. A matched record's attributes are replaced wholesale, so values
/// deleted in the edited copy stay deleted. When `defs` is given, values
/// outside an enumerated attribute's allowed list are dropped and reported.
/// Columns that do not normalize to a canonical key are dropped and
/// reported. When several edited rows share a title the last one wins and
/// the title is reported once.
pub fn resync(
    edited: &[EditedRecord],
    canonical: &[CanonicalRecord],
    keys: &KeyMap,
    defs: Option<&[AttributeDef]>,
) -> ResyncOutcome {
    let mut by_title: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, record) in canonical.iter().enumerate() {
        by_title.entry(record.title.trim()).or_default().push(idx);
    }
    let defs_by_key: HashMap<&str, &AttributeDef> = defs
        .unwrap_or_default()
        .iter()
        .map(|def| (def.key.as_str(), def))
        .collect();

    let mut records = canonical.to_vec();
    let mut report = ReconcileReport {
        edited: edited.len(),
        canonical: canonical.len(),
        ..Default::default()
    };

    let mut applied: HashMap<&str, (usize, usize)> = HashMap::new();
    for row in edited {
        let title = row.title.trim();
        let Some(positions) = by_title.get(title) else {
            warn!(target = "metafield.reconcile", title = %title, "edited title has no canonical match");
            report.issues.push(ReconcileIssue::UnmatchedTitle {
                title: title.to_string(),
            });
            continue;
        };
        if positions.len() > 1 {
            report.issues.push(ReconcileIssue::AmbiguousTitle {
                title: title.to_string(),
                matches: positions.len(),
            });
        }

        let mut attributes = Map::new();
        for (raw_key, raw_value) in &row.attributes {
            let Some(value) = clean_cell(raw_value) else {
                continue;
            };
            let key = keys.normalize(raw_key);
            if key.is_empty() || !is_canonical_key(&key) {
                warn!(target = "metafield.reconcile", title = %title, column = %raw_key, "column has no canonical key");
                report.issues.push(ReconcileIssue::InvalidKey {
                    title: title.to_string(),
                    column: raw_key.clone(),
                });
                continue;
            }
            let value = match defs_by_key.get(key.as_str()) {
                Some(def) if def.is_enum() => {
                    match enforce_enum(def, value, title, &mut report.issues) {
                        Some(value) => value,
                        None => continue,
                    }
                }
                _ => value,
            };
            attributes.insert(key, value);
        }

        match applied.get_mut(title) {
            Some((rows, values)) => {
                *rows += 1;
                report.total_values -= *values;
                *values = attributes.len();
            }
            None => {
                report.matched += 1;
                applied.insert(title, (1, attributes.len()));
            }
        }
        report.total_values += attributes.len();
        for pos in positions {
            records[*pos].attributes = attributes.clone();
        }
    }

    let mut duplicates: Vec<(&str, usize)> = applied
        .into_iter()
        .filter(|(_, (rows, _))| *rows > 1)
        .map(|(title, (rows, _))| (title, rows))
        .collect();
    duplicates.sort_unstable();
    for (title, rows) in duplicates {
        warn!(target = "metafield.reconcile", title = %title, rows, "title edited in several rows, last row kept");
        report.issues.push(ReconcileIssue::DuplicateEditedTitle {
            title: title.to_string(),
            rows,
        });
    }

    info!(
        target = "metafield.reconcile",
        edited = report.edited,
        matched = report.matched,
        values = report.total_values,
        issues = report.issues.len(),
        "resync finished"
    );
    ResyncOutcome { records, report }
}

fn enforce_enum(
    def: &AttributeDef,
    value: Value,
    title: &str,
    issues: &mut Vec<ReconcileIssue>,
) -> Option<Value> {
    let mut accept = |item: Value| -> Option<Value> {
        let text = match &item {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        match map_to_allowed(&text, &def.allowed_values) {
            Some(allowed) => Some(Value::String(allowed)),
            None => {
                issues.push(ReconcileIssue::RejectedValue {
                    title: title.to_string(),
                    key: def.key.clone(),
                    value: item,
                });
                None
            }
        }
    };
    match value {
        Value::Array(items) => {
            let kept: Vec<Value> = items.into_iter().filter_map(&mut accept).collect();
            (!kept.is_empty()).then_some(Value::Array(kept))
        }
        scalar => accept(scalar),
    }
}

/// Renders canonical records with display names, the inverse of
/// [`resync`]. Every schema column is present; unknown keys are kept
/// under their key.
pub fn display_rows(records: &[CanonicalRecord], keys: &KeyMap) -> Vec<Map<String, Value>> {
    records
        .iter()
        .map(|record| {
            let mut row = Map::new();
            row.insert("Title".into(), Value::String(record.title.clone()));
            if let Some(id) = &record.id {
                row.insert("Product ID".into(), Value::String(id.clone()));
            }
            for (key, name) in &keys.columns {
                let value = record.attributes.get(key).cloned().unwrap_or(Value::Null);
                row.insert(name.clone(), value);
            }
            for (key, value) in &record.attributes {
                let column = keys.display_name(key);
                if !row.contains_key(column) {
                    row.insert(column.to_string(), value.clone());
                }
            }
            row
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPayload {
    pub products: BTreeMap<String, Map<String, Value>>,
    pub issues: Vec<ReconcileIssue>,
}

/// `productId -> canonicalKey -> value`, skipping nulls and empty values.
pub fn upload_payload(records: &[CanonicalRecord]) -> UploadPayload {
    let mut payload = UploadPayload::default();
    for record in records {
        let Some(id) = record.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) else {
            payload.issues.push(ReconcileIssue::MissingProductId {
                title: record.title.clone(),
            });
            continue;
        };
        let values = uploadable(&record.attributes, None, &record.title, &mut payload.issues);
        if !values.is_empty() {
            payload.products.insert(id.to_string(), values);
        }
    }
    payload
}

/// Same contract as [`upload_payload`], straight from an extraction run.
/// Keys are passed through the key map in case the model echoed names.
pub fn upload_payload_from_results(results: &[ExtractionResult], keys: &KeyMap) -> UploadPayload {
    let mut payload = UploadPayload::default();
    for result in results {
        if result.product_id.trim().is_empty() {
            payload.issues.push(ReconcileIssue::MissingProductId {
                title: String::new(),
            });
            continue;
        }
        let values = uploadable(&result.values, Some(keys), &result.product_id, &mut payload.issues);
        if !values.is_empty() {
            payload.products.insert(result.product_id.clone(), values);
        }
    }
    payload
}

/// Blank keys are reported under `title` and never reach the payload.
fn uploadable(
    values: &Map<String, Value>,
    keys: Option<&KeyMap>,
    title: &str,
    issues: &mut Vec<ReconcileIssue>,
) -> Map<String, Value> {
    let mut kept = Map::new();
    for (raw_key, value) in values {
        let Some(value) = clean_cell(value) else {
            continue;
        };
        let key = match keys {
            Some(keys) => keys.normalize(raw_key),
            None => raw_key.trim().to_string(),
        };
        if key.is_empty() {
            issues.push(ReconcileIssue::InvalidKey {
                title: title.to_string(),
                column: raw_key.clone(),
            });
            continue;
        }
        kept.insert(key, value);
    }
    kept
}
