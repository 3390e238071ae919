use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Top-level shape of a cached taxonomy snapshot.
///
/// Accepted forms:
/// - the published `categories.json`, grouped by vertical. Categories may
///   be nested or listed flat with `{id, name}` child stubs;
/// - the flattened cache written by the taxonomy fetch job, where
///   attribute values live in `categories_with_metafields`;
/// - a bare list of root nodes, as hand-made fixtures usually are.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SnapshotDocument {
    Verticals {
        verticals: Vec<SnapshotVertical>,
    },
    Cache {
        all_categories: Vec<SnapshotNode>,
        #[serde(default)]
        categories_with_metafields: Vec<SnapshotNode>,
    },
    Nodes(Vec<SnapshotNode>),
}

impl SnapshotDocument {
    /// Top-level entries in document order. For the cache form, each
    /// category takes its attribute list from `categories_with_metafields`
    /// when present there, since only that list carries allowed values.
    pub fn into_roots(self) -> Vec<SnapshotNode> {
        match self {
            SnapshotDocument::Verticals { verticals } => verticals
                .into_iter()
                .flat_map(|vertical| vertical.categories)
                .collect(),
            SnapshotDocument::Cache {
                all_categories,
                categories_with_metafields,
            } => {
                let mut detailed: HashMap<String, Vec<SnapshotAttribute>> =
                    categories_with_metafields
                        .into_iter()
                        .filter_map(|node| Some((node.id?.to_string(), node.attributes)))
                        .collect();
                all_categories
                    .into_iter()
                    .map(|mut node| {
                        if let Some(id) = &node.id
                            && let Some(attributes) = detailed.remove(&id.to_string())
                        {
                            node.attributes = attributes;
                        }
                        node
                    })
                    .collect()
            }
            SnapshotDocument::Nodes(nodes) => nodes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotVertical {
    #[serde(default)]
    pub categories: Vec<SnapshotNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotNode {
    #[serde(default)]
    pub id: Option<RawId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "fullName", alias = "full_path", alias = "fullPath")]
    pub full_name: Option<String>,
    #[serde(default, alias = "parentId")]
    pub parent_id: Option<RawId>,
    #[serde(default, alias = "metafields")]
    pub attributes: Vec<SnapshotAttribute>,
    #[serde(default)]
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    /// A bare `{id, name}` entry. Inside `children` this may be a pointer to
    /// a category listed in full elsewhere in the document.
    pub fn is_stub(&self) -> bool {
        self.full_name.is_none()
            && self.parent_id.is_none()
            && self.attributes.is_empty()
            && self.children.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotAttribute {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "key")]
    pub handle: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "allowedValues", alias = "allowed_values")]
    pub values: Vec<SnapshotValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SnapshotValue {
    Label(String),
    Named { name: String },
}

impl SnapshotValue {
    pub fn label(&self) -> &str {
        match self {
            SnapshotValue::Label(value) => value,
            SnapshotValue::Named { name } => name,
        }
    }
}

/// Category ids appear as strings in the published taxonomy and as bare
/// numbers in older exports.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(u64),
}

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawId::Text(value) => f.write_str(value.trim()),
            RawId::Number(value) => write!(f, "{value}"),
        }
    }
}
