//! PolyDB: client-side structured storage.
//!
//! One key-value-plus-index database API over heterogeneous backends: a
//! native object-store engine with secondary indexes, a relational engine
//! driven through generated SQL, and plain key-value stores. A connection
//! picks its backend once, reconciles the declared schema, and serializes
//! every transaction through a FIFO queue; queries written in a restricted
//! SQL grammar compile to whichever backend is active with identical
//! result semantics.
//!
//! # Example
//!
//! ```no_run
//! use polydb::{DatabaseSchema, IndexSchema, KeyType, Storage, StorageOptions, StoreSchema};
//! use polydb_common::record;
//!
//! #[tokio::main]
//! async fn main() -> polydb::Result<()> {
//!     let schema = DatabaseSchema::fixed(vec![StoreSchema::new("orders")
//!         .with_key_path("id", KeyType::Number)
//!         .with_index(IndexSchema::new("price", KeyType::Number))]);
//!
//!     let db = Storage::open("shop", schema, StorageOptions::default())?;
//!     db.put("orders", record! { "id" => 1i64, "price" => 9.5 }).await?;
//!
//!     let total = db.execute_sql("SELECT SUM(price) FROM \"orders\"").await?;
//!     println!("total: {total}");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod query;

mod textstore;
mod txqueue;

pub use backend::{CursorRow, Direction, Driver, Mechanism, ScanPlan, StoreTx, TxKind, TxMode};
pub use config::StorageOptions;
pub use connection::{ConnState, CursorAction, ScanStep, Storage, TEXT_STORE_NAME};
pub use cursor::SqlCursor;
pub use query::{parse_query, CursorDescriptor, MapExpr, QueryIr, ReduceExpr, WhereClause};

pub use polydb_common::{
    DatabaseSchema, DbError, IndexSchema, Key, KeyPath, KeyRange, KeyType, Result, SchemaMode,
    StoreSchema, Value,
};
