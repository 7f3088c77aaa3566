//! Shared data model for PolyDB.
//!
//! Everything the storage layer and its backends agree on lives here: the
//! record [`Value`] model, typed primary/index [`Key`]s with their total
//! order, half-open [`KeyRange`]s, store and database [`schema`]s, and the
//! [`DbError`] type used across the workspace.

pub mod error;
pub mod keyrange;
pub mod schema;
pub mod value;

pub use error::{DbError, Result};
pub use keyrange::{KeyRange, SqlFragment};
pub use schema::{
    DatabaseSchema, IndexSchema, KeyPath, KeyType, SchemaDelta, SchemaMode, StoreSchema,
};
pub use value::{Key, Value};
