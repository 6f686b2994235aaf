//! Data structures shared by the compiler, reconciler and stores

pub mod rows;
pub mod value;

pub use rows::RowSet;
pub use value::{Value, ValueKind};
