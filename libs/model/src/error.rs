//! Error types for record validation and filter parsing.

use thiserror::Error;

/// Errors raised while validating records or parsing filter expressions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A filter term is not of the form `field:pattern`.
    #[error("invalid filter term '{0}': expected field:pattern")]
    InvalidTerm(String),

    /// A filter term names a field the inventory does not index.
    #[error("unknown filter field '{0}'")]
    UnknownField(String),

    /// The filter expression has no terms.
    #[error("filter expression cannot be empty")]
    EmptyQuery,

    /// A record returned by the inventory lacks a required field.
    #[error("record '{record}' rejected: missing {field}")]
    MissingField { record: String, field: &'static str },

    /// A record attribute has a type the controller cannot interpret.
    #[error("record '{record}' rejected: attribute {field} has unexpected type")]
    InvalidAttribute { record: String, field: &'static str },
}

impl ModelError {
    /// Returns true if this error came from rejecting an inventory record.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            ModelError::MissingField { .. } | ModelError::InvalidAttribute { .. }
        )
    }
}
