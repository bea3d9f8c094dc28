// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for routing table operations

use thiserror::Error;

/// Result type alias for routing table operations
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors produced while validating or minimising routing tables
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// A table could not be made small enough
    #[error(
        "Could not minimise routing table{} to fit in {target_length} entries, best managed was {final_length} entries",
        chip_suffix(.chip)
    )]
    MinimisationFailed {
        /// Requested maximum number of entries
        target_length: usize,
        /// Smallest table achieved (always greater than the target)
        final_length: usize,
        /// Chip whose table failed, when minimising many tables
        chip: Option<(u8, u8)>,
    },

    /// An entry has key bits set outside its mask
    #[error("Malformed entry {index}: key {key:#010x} has bits outside mask {mask:#010x}")]
    MalformedEntry {
        /// Position in the input table
        index: usize,
        /// Entry key
        key: u32,
        /// Entry mask
        mask: u32,
    },

    /// Two entries match a common key with different routes and their
    /// precedence cannot be preserved
    #[error("Table is not orthogonal: entries {first} and {second} both match key {key:#010x} with different routes")]
    NonOrthogonal {
        /// Earlier entry
        first: usize,
        /// Later entry
        second: usize,
        /// A key matched by both
        key: u32,
    },

    /// Text table could not be parsed
    #[error("Parse error on line {line}: {reason}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// Reason for failure
        reason: String,
    },
}

fn chip_suffix(chip: &Option<(u8, u8)>) -> String {
    chip.map(|(x, y)| format!(" for ({x}, {y})")).unwrap_or_default()
}

impl RoutingError {
    /// Create a minimisation failure with no chip attached
    pub fn minimisation_failed(target_length: usize, final_length: usize) -> Self {
        Self::MinimisationFailed {
            target_length,
            final_length,
            chip: None,
        }
    }

    /// Create a parse error
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }

    /// Attach the failing chip to a minimisation failure
    #[must_use]
    pub fn with_chip(self, x: u8, y: u8) -> Self {
        match self {
            Self::MinimisationFailed {
                target_length,
                final_length,
                ..
            } => Self::MinimisationFailed {
                target_length,
                final_length,
                chip: Some((x, y)),
            },
            other => other,
        }
    }

    /// True when the table simply does not fit (a capacity problem rather
    /// than bad input)
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::MinimisationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimisation_failed_message() {
        let err = RoutingError::minimisation_failed(5, 10);
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains("10"));
        assert!(err.is_capacity());

        let err = err.with_chip(3, 4);
        assert!(err.to_string().contains("(3, 4)"));
    }

    #[test]
    fn with_chip_leaves_other_errors() {
        let err = RoutingError::parse(2, "bad key");
        assert_eq!(err.clone().with_chip(0, 0), err);
        assert!(!err.is_capacity());
    }
}
