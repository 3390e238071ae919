use crate::catalog::ProductRecord;
use crate::llm::LlmMessage;
use crate::taxonomy::AttributeDef;
use serde_json::{Value, json};

const SYSTEM_PROMPT: &str = r#"
You fill structured attribute values for one product of a known category.
Rules:
- Use only information explicitly stated in the product data: title first, then description,
  variants and their options, tags and product type. Never infer from the category or from
  similar products.
- Return null for any attribute the data does not state. null is the correct answer when the
  information is missing; never guess a default.
- Never convert units. If the product says "12 inches", return "12 inches" or "12", never 30.48.
- For attributes with allowed values, answer with one of the allowed values exactly as written
  (or a list of them when several are explicitly stated), otherwise null.
- Return a JSON list only when several values are explicitly stated.
Respond with JSON only: {"metafields": {"<attribute key>": <value | [values] | null>}}
"#;

/// Builds the prompt for one product. Descriptions and variants are sent in
/// full; every enumerated attribute carries its complete value list.
pub fn build_messages(
    product: &ProductRecord,
    category_path: &str,
    defs: &[AttributeDef],
) -> Vec<LlmMessage> {
    let payload = json!({
        "category": category_path,
        "product": product_payload(product),
        "attributes": defs.iter().map(attribute_payload).collect::<Vec<_>>(),
    });
    vec![
        LlmMessage::system(SYSTEM_PROMPT.trim()),
        LlmMessage::user(payload.to_string()),
    ]
}

fn product_payload(product: &ProductRecord) -> Value {
    let variants: Vec<Value> = product
        .variants
        .iter()
        .map(|variant| {
            json!({
                "title": variant.title,
                "sku": variant.sku,
                "price": variant.price,
                "options": variant
                    .selected_options
                    .iter()
                    .map(|option| format!("{}: {}", option.name, option.value))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    let mut payload = json!({
        "id": product.id,
        "title": product.title,
        "vendor": product.vendor,
        "productType": product.product_type,
        "tags": product.tags,
        "priceRange": product.price_range,
        "description": product.description_text(),
        "variants": variants,
    });
    if !product.existing_attributes.is_empty()
        && let Some(obj) = payload.as_object_mut()
    {
        obj.insert(
            "existingAttributes".into(),
            Value::Object(product.existing_attributes.clone()),
        );
    }
    payload
}

fn attribute_payload(def: &AttributeDef) -> Value {
    let mut entry = json!({
        "key": def.key,
        "name": def.name,
        "type": def.kind,
    });
    if let Some(obj) = entry.as_object_mut() {
        if !def.description.is_empty() {
            obj.insert("description".into(), Value::String(def.description.clone()));
        }
        if def.is_enum() {
            obj.insert("allowedValues".into(), json!(def.allowed_values));
        }
    }
    entry
}
