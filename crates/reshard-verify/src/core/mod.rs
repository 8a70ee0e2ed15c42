//! Core types shared by every stage of the diff pipeline.
//!
//! - [`Table`]: the table being diffed
//! - [`Key`], [`PkValue`], [`Row`], [`SqlValue`]: what backends return
//! - [`RowSource`]: the read seam every backend implements

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::Table;
pub use traits::RowSource;
pub use value::{Key, PkValue, Row, SqlValue};
