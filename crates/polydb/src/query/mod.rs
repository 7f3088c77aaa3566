//! The declarative query surface: a restricted SQL parser, the query IR,
//! and compilation to either a native cursor descriptor or a generated SQL
//! statement plus post-processing pipeline.
//!
//! Both compilation targets must agree: for any IR that compiles to both
//! backends, results are equal as multisets, and as ordered sequences when
//! an index is named.

pub mod ir;
pub mod native;
pub mod parser;
pub mod sql;

pub use ir::{MapExpr, QueryIr, ReduceExpr, WhereClause};
pub use native::CursorDescriptor;
pub use parser::parse_query;

use polydb_common::{Result, Value};

use crate::backend::{Mechanism, StoreTx};

/// Execute a query IR inside a transaction, dispatching on the mechanism
/// the connection selected.
pub fn run_query(tx: &mut dyn StoreTx, ir: &QueryIr) -> Result<Value> {
    let schema = tx.schema();
    ir.validate(&schema)?;
    match tx.mechanism() {
        Mechanism::RelationalSql => sql::execute(tx, ir, &schema),
        _ => native::execute(tx, ir, &schema),
    }
}
