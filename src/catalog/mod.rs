pub mod text;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

pub use text::clean_description;

/// A product as supplied by the catalog fetch collaborator. Read-only input
/// to matching and extraction.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub price_range: Option<Value>,
    #[serde(default)]
    pub description_html: Option<String>,
    #[serde(default, deserialize_with = "variants_list_or_connection")]
    pub variants: Vec<VariantRecord>,
    #[serde(
        default,
        alias = "metafields",
        alias = "category_metafields",
        alias = "categoryMetafields"
    )]
    pub existing_attributes: Map<String, Value>,
}

impl ProductRecord {
    pub fn description_text(&self) -> String {
        self.description_html
            .as_deref()
            .map(clean_description)
            .unwrap_or_default()
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<Value>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub selected_options: Vec<SelectedOption>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectedOption {
    pub name: String,
    pub value: String,
}

/// Storefront exports carry variants either as a plain list or as a
/// GraphQL connection (`{"edges": [{"node": {...}}]}`).
#[derive(Deserialize)]
#[serde(untagged)]
enum VariantsShape {
    List(Vec<VariantRecord>),
    Connection { edges: Vec<VariantEdge> },
    Nodes { nodes: Vec<VariantRecord> },
}

#[derive(Deserialize)]
struct VariantEdge {
    node: VariantRecord,
}

fn variants_list_or_connection<'de, D>(deserializer: D) -> Result<Vec<VariantRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let shape = Option::<VariantsShape>::deserialize(deserializer)?;
    Ok(match shape {
        None => Vec::new(),
        Some(VariantsShape::List(list)) => list,
        Some(VariantsShape::Connection { edges }) => edges.into_iter().map(|e| e.node).collect(),
        Some(VariantsShape::Nodes { nodes }) => nodes,
    })
}
