use crate::keys::{is_canonical_key, slugify};
use crate::taxonomy::snapshot::{SnapshotAttribute, SnapshotDocument, SnapshotNode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub const PATH_SEPARATOR: &str = " > ";

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("taxonomy node `{0}` not found")]
    NotFound(String),
    #[error("corrupt taxonomy snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("unable to read taxonomy snapshot: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeType {
    Text,
    EnumText,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDef {
    pub name: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl AttributeDef {
    /// Builds a definition, deriving the key from `name` when the supplied
    /// key is missing or not a canonical slug. The type follows the value
    /// list: any allowed values make it `EnumText`.
    pub fn new(
        name: &str,
        key: Option<&str>,
        allowed_values: impl IntoIterator<Item = String>,
        description: &str,
    ) -> Self {
        let name = name.trim().to_string();
        let key = match key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(k) if is_canonical_key(k) => k.to_string(),
            Some(k) => slugify(k),
            None => slugify(&name),
        };
        let mut seen = HashSet::new();
        let allowed_values: Vec<String> = allowed_values
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .filter(|value| seen.insert(value.to_lowercase()))
            .collect();
        let kind = if allowed_values.is_empty() {
            AttributeType::Text
        } else {
            AttributeType::EnumText
        };
        Self {
            name,
            key,
            kind,
            allowed_values,
            description: description.trim().to_string(),
        }
    }

    pub fn is_enum(&self) -> bool {
        self.kind == AttributeType::EnumText
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyNode {
    pub id: String,
    pub name: String,
    pub full_path: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub attribute_defs: Vec<AttributeDef>,
}

impl TaxonomyNode {
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.full_path
            .split('>')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
    }

    /// Number of ancestors above this node.
    pub fn depth(&self) -> usize {
        self.path_segments().count().saturating_sub(1)
    }
}

/// Strips a GID prefix (`gid://shopify/TaxonomyCategory/el-17-4`) down to the
/// bare category id.
pub fn normalize_category_id(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed.rsplit('/').next().unwrap_or(trimmed).trim()
}

/// Read-only view over the category taxonomy. Built once, then shared
/// behind an `Arc`.
#[derive(Debug, Default)]
pub struct TaxonomyIndex {
    nodes: Vec<TaxonomyNode>,
    by_id: HashMap<String, usize>,
    child_counts: Vec<usize>,
}

impl TaxonomyIndex {
    /// Builds the index from any accepted snapshot shape. Parents come from
    /// nesting, an explicit `parent_id`, or failing both the `full_name`
    /// prefix. A `{id, name}` child stub names a category that may be
    /// listed in full elsewhere; the full entry wins and the stub only
    /// contributes the parent link.
    pub fn load(document: SnapshotDocument) -> Result<Self, TaxonomyError> {
        let roots = document.into_roots();
        if roots.is_empty() {
            return Err(TaxonomyError::CorruptSnapshot("snapshot has no categories".into()));
        }
        let mut entries = EntryCollector::default();
        for root in roots {
            entries.visit(root, None)?;
        }
        entries.link()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, TaxonomyError> {
        let document: SnapshotDocument = serde_json::from_str(raw)
            .map_err(|err| TaxonomyError::CorruptSnapshot(err.to_string()))?;
        Self::load(document)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, TaxonomyError> {
        let document: SnapshotDocument = serde_yaml::from_str(raw)
            .map_err(|err| TaxonomyError::CorruptSnapshot(err.to_string()))?;
        Self::load(document)
    }

    /// Loads a snapshot file, picking the parser from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "yaml" | "yml"))
            .unwrap_or(false);
        let index = if is_yaml {
            Self::from_yaml_str(&raw)?
        } else {
            Self::from_json_str(&raw)?
        };
        info!(
            target = "metafield.taxonomy",
            path = %path.display(),
            nodes = index.len(),
            leaves = index.leaf_count(),
            "taxonomy snapshot loaded"
        );
        Ok(index)
    }

    pub fn lookup_by_id(&self, id: &str) -> Result<&TaxonomyNode, TaxonomyError> {
        let normalized = normalize_category_id(id);
        self.by_id
            .get(normalized)
            .map(|pos| &self.nodes[*pos])
            .ok_or_else(|| TaxonomyError::NotFound(normalized.to_string()))
    }

    /// Nodes with no children, i.e. the categories assignable to products.
    pub fn all_leaf(&self) -> impl Iterator<Item = &TaxonomyNode> {
        self.nodes
            .iter()
            .zip(self.child_counts.iter())
            .filter(|(_, children)| **children == 0)
            .map(|(node, _)| node)
    }

    pub fn is_leaf(&self, id: &str) -> bool {
        self.by_id
            .get(normalize_category_id(id))
            .map(|pos| self.child_counts[*pos] == 0)
            .unwrap_or(false)
    }

    pub fn parent(&self, node: &TaxonomyNode) -> Option<&TaxonomyNode> {
        node.parent_id
            .as_deref()
            .and_then(|id| self.by_id.get(id))
            .map(|pos| &self.nodes[*pos])
    }

    /// Walks from the node's parent up to its root.
    pub fn ancestors<'a>(&'a self, node: &'a TaxonomyNode) -> impl Iterator<Item = &'a TaxonomyNode> {
        std::iter::successors(self.parent(node), move |current| self.parent(current))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.child_counts.iter().filter(|count| **count == 0).count()
    }
}

/// A category as read from the document, before parents are resolved.
struct RawEntry {
    id: String,
    name: String,
    full_name: Option<String>,
    parent: Option<String>,
    attributes: Vec<SnapshotAttribute>,
    stub: bool,
}

#[derive(Default)]
struct EntryCollector {
    entries: Vec<RawEntry>,
    by_id: HashMap<String, usize>,
}

impl EntryCollector {
    fn visit(&mut self, raw: SnapshotNode, parent: Option<&str>) -> Result<(), TaxonomyError> {
        let id = raw
            .id
            .as_ref()
            .map(|id| normalize_category_id(&id.to_string()).to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TaxonomyError::CorruptSnapshot("category without id".into()))?;
        let name = raw
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TaxonomyError::CorruptSnapshot(format!("category `{id}` has no name")))?;
        let declared_parent = raw
            .parent_id
            .as_ref()
            .map(|parent| normalize_category_id(&parent.to_string()).to_string())
            .filter(|parent| !parent.is_empty());
        let entry = RawEntry {
            id: id.clone(),
            name,
            full_name: raw
                .full_name
                .as_deref()
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(str::to_string),
            parent: declared_parent.or_else(|| parent.map(str::to_string)),
            stub: parent.is_some() && raw.is_stub(),
            attributes: raw.attributes,
        };
        match self.by_id.get(&id).copied() {
            Some(position) => self.merge(position, entry)?,
            None => {
                self.by_id.insert(id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
        for child in raw.children {
            self.visit(child, Some(&id))?;
        }
        Ok(())
    }

    fn merge(&mut self, position: usize, incoming: RawEntry) -> Result<(), TaxonomyError> {
        let existing = &mut self.entries[position];
        match (existing.stub, incoming.stub) {
            (_, true) => {
                if existing.parent.is_none() {
                    existing.parent = incoming.parent;
                }
                Ok(())
            }
            (true, false) => {
                let parent = incoming.parent.clone().or_else(|| existing.parent.take());
                *existing = RawEntry { parent, ..incoming };
                Ok(())
            }
            (false, false) => Err(TaxonomyError::CorruptSnapshot(format!(
                "duplicate category id `{}`",
                incoming.id
            ))),
        }
    }

    fn link(self) -> Result<TaxonomyIndex, TaxonomyError> {
        let EntryCollector { entries, by_id } = self;
        let by_path: HashMap<&str, usize> = entries
            .iter()
            .enumerate()
            .filter_map(|(pos, entry)| entry.full_name.as_deref().map(|path| (path, pos)))
            .collect();

        let mut parents: Vec<Option<usize>> = Vec::with_capacity(entries.len());
        for entry in &entries {
            let parent = match entry.parent.as_deref() {
                Some(parent_id) => Some(by_id.get(parent_id).copied().ok_or_else(|| {
                    TaxonomyError::CorruptSnapshot(format!(
                        "category `{}` references unknown parent `{parent_id}`",
                        entry.id
                    ))
                })?),
                None => entry
                    .full_name
                    .as_deref()
                    .and_then(|path| path.rsplit_once(PATH_SEPARATOR))
                    .and_then(|(parent_path, _)| by_path.get(parent_path.trim()).copied()),
            };
            parents.push(parent);
        }

        for start in 0..entries.len() {
            let mut current = parents[start];
            let mut steps = 0;
            while let Some(pos) = current {
                steps += 1;
                if pos == start || steps > entries.len() {
                    return Err(TaxonomyError::CorruptSnapshot(format!(
                        "category `{}` is its own ancestor",
                        entries[start].id
                    )));
                }
                current = parents[pos];
            }
        }

        let mut paths: Vec<Option<String>> = vec![None; entries.len()];
        for pos in 0..entries.len() {
            full_path(pos, &entries, &parents, &mut paths);
        }

        let mut index = TaxonomyIndex {
            child_counts: vec![0; entries.len()],
            ..TaxonomyIndex::default()
        };
        for (pos, (entry, path)) in entries.iter().zip(paths).enumerate() {
            if let Some(parent) = parents[pos] {
                index.child_counts[parent] += 1;
            }
            index.by_id.insert(entry.id.clone(), pos);
            index.nodes.push(TaxonomyNode {
                id: entry.id.clone(),
                name: entry.name.clone(),
                full_path: path.unwrap_or_else(|| entry.name.clone()),
                parent_id: parents[pos].map(|parent| entries[parent].id.clone()),
                attribute_defs: attribute_defs(&entry.id, &entry.attributes)?,
            });
        }
        Ok(index)
    }
}

/// Explicit `full_name` wins; otherwise the parent's path plus the name.
/// Callers must have rejected parent cycles.
fn full_path(
    pos: usize,
    entries: &[RawEntry],
    parents: &[Option<usize>],
    paths: &mut [Option<String>],
) -> String {
    if let Some(path) = &paths[pos] {
        return path.clone();
    }
    let entry = &entries[pos];
    let path = match (&entry.full_name, parents[pos]) {
        (Some(path), _) => path.clone(),
        (None, Some(parent)) => format!(
            "{}{PATH_SEPARATOR}{}",
            full_path(parent, entries, parents, paths),
            entry.name
        ),
        (None, None) => entry.name.clone(),
    };
    paths[pos] = Some(path.clone());
    path
}

fn attribute_defs(
    category_id: &str,
    raw: &[SnapshotAttribute],
) -> Result<Vec<AttributeDef>, TaxonomyError> {
    let mut defs: Vec<AttributeDef> = Vec::with_capacity(raw.len());
    for attribute in raw {
        let name = attribute
            .name
            .as_deref()
            .or(attribute.handle.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                TaxonomyError::CorruptSnapshot(format!(
                    "attribute without name on category `{category_id}`"
                ))
            })?;
        let def = AttributeDef::new(
            name,
            attribute.handle.as_deref(),
            attribute.values.iter().map(|value| value.label().to_string()),
            attribute.description.as_deref().unwrap_or_default(),
        );
        if defs.iter().any(|existing| existing.key == def.key) {
            continue;
        }
        defs.push(def);
    }
    Ok(defs)
}
