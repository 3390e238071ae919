pub mod index;
pub mod schema;
pub mod snapshot;

pub use index::{AttributeDef, TaxonomyError, TaxonomyIndex, TaxonomyNode};
pub use schema::ResolvedSchema;
