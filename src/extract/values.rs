use crate::extract::ExtractError;
use crate::llm::parse_json_reply;
use crate::reconcile::KeyMap;
use crate::taxonomy::AttributeDef;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

static PIXEL_DIMENSIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d{3,5})\s*[x×*]\s*(\d{3,5})").expect("pixel dimension pattern")
});

/// Display-resolution families, most specific label first.
const RESOLUTION_FAMILIES: &[(&[&str], &[&str])] = &[
    (&["8k", "4320p", "8kuhd"], &["8K", "8K UHD", "4320p"]),
    (
        &["4k", "uhd", "ultrahd", "2160p", "4kuhd", "4kultrahd"],
        &["4K", "4K UHD", "UHD", "Ultra HD", "2160p"],
    ),
    (&["qhd", "wqhd", "1440p", "2k", "quadhd"], &["QHD", "WQHD", "1440p", "2K"]),
    (&["fhd", "fullhd", "1080p", "1080i"], &["Full HD", "FHD", "1080p"]),
    (&["hd", "720p", "hdready"], &["HD", "HD Ready", "720p"]),
];

pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lowercase alphanumerics only, so `Full-HD`, `full hd` and `FullHD` compare equal.
fn loose(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn is_null_like(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "null" | "n/a" | "nil"
    )
}

fn is_unknown(value: &str) -> bool {
    is_null_like(value)
        || matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "unknown" | "not specified" | "not available" | "not stated" | "none specified"
        )
}

/// Maps a free-form value onto one of `allowed`, or `None` when no
/// deterministic mapping exists. The returned string is the allowed value
/// exactly as defined.
pub fn map_to_allowed(raw: &str, allowed: &[String]) -> Option<String> {
    let wanted = normalize_text(raw);
    if wanted.is_empty() {
        return None;
    }
    if let Some(hit) = allowed.iter().find(|value| normalize_text(value) == wanted) {
        return Some(hit.clone());
    }
    let wanted_loose = loose(raw);
    if !wanted_loose.is_empty()
        && let Some(hit) = allowed.iter().find(|value| loose(value) == wanted_loose)
    {
        return Some(hit.clone());
    }
    resolution_alias(raw).and_then(|labels| {
        labels.iter().find_map(|label| {
            let label = loose(label);
            allowed.iter().find(|value| loose(value) == label).cloned()
        })
    })
}

fn resolution_alias(raw: &str) -> Option<&'static [&'static str]> {
    if let Some(caps) = PIXEL_DIMENSIONS.captures(raw) {
        let a: u32 = caps[1].parse().ok()?;
        let b: u32 = caps[2].parse().ok()?;
        let width = a.max(b);
        let family = match width {
            w if w >= 7680 => 0,
            w if w >= 3840 => 1,
            w if w >= 2560 => 2,
            w if w >= 1920 => 3,
            w if w >= 1280 => 4,
            _ => return None,
        };
        return Some(RESOLUTION_FAMILIES[family].1);
    }
    let key = loose(raw);
    RESOLUTION_FAMILIES
        .iter()
        .find(|(aliases, _)| aliases.contains(&key.as_str()))
        .map(|(_, labels)| *labels)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Cleans one returned value against its definition. Unknown markers and
/// empties become null; enumerated attributes keep only allowed members.
pub fn normalize_value(def: &AttributeDef, raw: &Value) -> Value {
    match raw {
        Value::Array(items) => {
            let mut seen = HashSet::new();
            let kept: Vec<Value> = items
                .iter()
                .filter_map(|item| normalize_scalar(def, item))
                .filter(|item| seen.insert(item.to_lowercase()))
                .map(Value::String)
                .collect();
            if kept.is_empty() {
                Value::Null
            } else {
                Value::Array(kept)
            }
        }
        Value::Object(_) | Value::Null => Value::Null,
        scalar => {
            if let Some(value) = normalize_scalar(def, scalar) {
                return Value::String(value);
            }
            // "Black / White" for an enum: accept when every part is allowed.
            let Some(text) = scalar_text(scalar).filter(|_| def.is_enum()) else {
                return Value::Null;
            };
            let parts: Vec<&str> = text
                .split(['/', '|', ',', '&', '\n'])
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect();
            if parts.len() < 2 {
                return Value::Null;
            }
            let mapped: Option<Vec<Value>> = parts
                .iter()
                .map(|part| map_to_allowed(part, &def.allowed_values).map(Value::String))
                .collect();
            mapped.map(Value::Array).unwrap_or(Value::Null)
        }
    }
}

fn normalize_scalar(def: &AttributeDef, raw: &Value) -> Option<String> {
    let text = scalar_text(raw)?;
    if text.is_empty() || is_unknown(&text) {
        return None;
    }
    if def.is_enum() {
        map_to_allowed(&text, &def.allowed_values)
    } else {
        Some(text)
    }
}

/// Parses a model response into a value for every schema key. Fields are
/// judged one at a time: keys outside the schema are dropped and invalid
/// values become null without discarding the rest.
pub fn parse_response(
    text: &str,
    defs: &[AttributeDef],
    keys: &KeyMap,
) -> Result<Map<String, Value>, ExtractError> {
    let parsed: Value = parse_json_reply(text)
        .map_err(|err| ExtractError::MalformedResponse(err.to_string()))?;
    let Value::Object(mut root) = parsed else {
        return Err(ExtractError::MalformedResponse(
            "response is not a JSON object".into(),
        ));
    };
    let body = match ["metafields", "attributes", "values"]
        .iter()
        .find(|wrapper| root.get(**wrapper).is_some_and(Value::is_object))
        .and_then(|wrapper| root.remove(*wrapper))
    {
        Some(Value::Object(inner)) => inner,
        _ => root,
    };

    let mut values: Map<String, Value> = defs
        .iter()
        .map(|def| (def.key.clone(), Value::Null))
        .collect();
    for (raw_key, raw_value) in &body {
        let key = keys.normalize(raw_key);
        let Some(def) = defs.iter().find(|def| def.key == key) else {
            debug!(target = "metafield.extract", key = %raw_key, "dropping key outside schema");
            continue;
        };
        let value = normalize_value(def, raw_value);
        if value.is_null() {
            continue;
        }
        if let Some(slot) = values.get_mut(&def.key)
            && slot.is_null()
        {
            *slot = value;
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn resolution() -> AttributeDef {
        AttributeDef::new(
            "Display resolution",
            Some("display-resolution"),
            vec!["4K".into(), "8K".into(), "HD".into(), "Full HD".into()],
            "",
        )
    }

    fn screen_size() -> AttributeDef {
        AttributeDef::new("Screen size", None, Vec::new(), "")
    }

    fn colors() -> AttributeDef {
        AttributeDef::new("Color", None, vec!["Black".into(), "White".into(), "Silver".into()], "")
    }

    #[test]
    fn maps_pixels_and_aliases_onto_allowed_values() {
        let allowed = resolution().allowed_values;
        assert_eq!(map_to_allowed("3840x2160", &allowed).as_deref(), Some("4K"));
        assert_eq!(map_to_allowed("3840 × 2160 pixels", &allowed).as_deref(), Some("4K"));
        assert_eq!(map_to_allowed("Ultra HD", &allowed).as_deref(), Some("4K"));
        assert_eq!(map_to_allowed("2160p", &allowed).as_deref(), Some("4K"));
        assert_eq!(map_to_allowed("7680x4320", &allowed).as_deref(), Some("8K"));
        assert_eq!(map_to_allowed("1920x1080", &allowed).as_deref(), Some("Full HD"));
        assert_eq!(map_to_allowed("fhd", &allowed).as_deref(), Some("Full HD"));
        assert_eq!(map_to_allowed("720p", &allowed).as_deref(), Some("HD"));
        assert_eq!(map_to_allowed("full-hd", &allowed).as_deref(), Some("Full HD"));
        assert_eq!(map_to_allowed("4k", &allowed).as_deref(), Some("4K"));
        assert_eq!(map_to_allowed("Retina", &allowed), None);
        assert_eq!(map_to_allowed("640x480", &allowed), None);
    }

    #[test]
    fn enum_values_are_members_or_null() {
        let def = colors();
        assert_eq!(normalize_value(&def, &json!("black")), json!("Black"));
        assert_eq!(normalize_value(&def, &json!("Chartreuse")), Value::Null);
        assert_eq!(normalize_value(&def, &json!(["white", "Teal", "WHITE"])), json!(["White"]));
        assert_eq!(normalize_value(&def, &json!(["Teal"])), Value::Null);
        assert_eq!(normalize_value(&def, &json!("Black / Silver")), json!(["Black", "Silver"]));
        assert_eq!(normalize_value(&def, &json!("Black / Teal")), Value::Null);
    }

    #[test]
    fn text_values_are_cleaned_not_mapped() {
        let def = screen_size();
        assert_eq!(normalize_value(&def, &json!(" 55 inches ")), json!("55 inches"));
        assert_eq!(normalize_value(&def, &json!(55)), json!("55"));
        assert_eq!(normalize_value(&def, &json!("")), Value::Null);
        assert_eq!(normalize_value(&def, &json!("N/A")), Value::Null);
        assert_eq!(normalize_value(&def, &json!("unknown")), Value::Null);
        assert_eq!(normalize_value(&def, &json!({"value": 55})), Value::Null);
    }

    #[test]
    fn parses_wrapped_fenced_responses_per_field() {
        let defs = vec![resolution(), screen_size(), colors()];
        let keys = KeyMap::build(&defs);
        let text = "```json\n{\"metafields\": {\"display-resolution\": \"3840x2160\", \"Screen size\": null, \"Color\": \"Purple\", \"weight\": \"3 kg\"}}\n```";
        let values = parse_response(text, &defs, &keys).unwrap();
        assert_eq!(
            Value::Object(values),
            json!({"display-resolution": "4K", "screen-size": null, "color": null})
        );
    }

    #[test]
    fn accepts_bare_and_attributes_shapes() {
        let defs = vec![colors()];
        let keys = KeyMap::build(&defs);
        let bare = parse_response(r#"{"color": "White"}"#, &defs, &keys).unwrap();
        assert_eq!(bare["color"], "White");
        let wrapped = parse_response(r#"{"attributes": {"Color": "silver"}}"#, &defs, &keys).unwrap();
        assert_eq!(wrapped["color"], "Silver");
    }

    #[test]
    fn tolerates_lead_in_text_and_one_line_fences() {
        let defs = vec![colors(), AttributeDef::new("Material", None, Vec::new(), "")];
        let keys = KeyMap::build(&defs);
        let lead_in = parse_response(
            "Here are the values:\n{\"color\":\"White\",\"material\":\"Steel\"}",
            &defs,
            &keys,
        )
        .unwrap();
        assert_eq!(Value::Object(lead_in), json!({"color": "White", "material": "Steel"}));

        let fenced = parse_response("```{\"color\":\"White\"}```", &defs, &keys).unwrap();
        assert_eq!(Value::Object(fenced), json!({"color": "White", "material": null}));
    }

    #[test]
    fn rejects_non_json() {
        let defs = vec![colors()];
        let keys = KeyMap::build(&defs);
        assert!(matches!(
            parse_response("The color is black.", &defs, &keys),
            Err(ExtractError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response("[\"Black\"]", &defs, &keys),
            Err(ExtractError::MalformedResponse(_))
        ));
    }
}
