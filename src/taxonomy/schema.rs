use crate::taxonomy::index::{AttributeDef, TaxonomyIndex, TaxonomyNode};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("category `{0}` has no attribute definitions")]
    NoAttributesForCategory(String),
}

/// Attribute definitions for a category, in snapshot order.
pub fn resolve(node: &TaxonomyNode) -> Result<Vec<AttributeDef>, SchemaError> {
    if node.attribute_defs.is_empty() {
        return Err(SchemaError::NoAttributesForCategory(node.id.clone()));
    }
    Ok(node.attribute_defs.clone())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSchema {
    pub category_id: String,
    /// Node the definitions were taken from; differs from `category_id`
    /// when they were inherited.
    pub source_id: String,
    pub source_path: String,
    pub inherited: bool,
    pub attributes: Vec<AttributeDef>,
}

/// Like [`resolve`], but walks up the ancestor chain when the node itself
/// carries no definitions. Fails only when no ancestor has any either.
pub fn resolve_inherited(
    index: &TaxonomyIndex,
    node: &TaxonomyNode,
) -> Result<ResolvedSchema, SchemaError> {
    std::iter::once(node)
        .chain(index.ancestors(node))
        .find(|candidate| !candidate.attribute_defs.is_empty())
        .map(|source| ResolvedSchema {
            category_id: node.id.clone(),
            source_id: source.id.clone(),
            source_path: source.full_path.clone(),
            inherited: source.id != node.id,
            attributes: source.attribute_defs.clone(),
        })
        .ok_or_else(|| SchemaError::NoAttributesForCategory(node.id.clone()))
}

/// Direct resolution wrapped in the same shape as [`resolve_inherited`].
pub fn resolve_direct(node: &TaxonomyNode) -> Result<ResolvedSchema, SchemaError> {
    let attributes = resolve(node)?;
    Ok(ResolvedSchema {
        category_id: node.id.clone(),
        source_id: node.id.clone(),
        source_path: node.full_path.clone(),
        inherited: false,
        attributes,
    })
}
