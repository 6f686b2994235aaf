//! Validation of names that are interpolated into SQL or written to the audit log

pub mod identifier;
pub mod username;

pub use identifier::{validate_identifier, validate_identifiers};
pub use username::validate_username;
