//! Error types for dygraph.

use thiserror::Error;

/// Errors raised while tracing operators or running control-flow blocks.
///
/// Every error is fatal to the trace or loop iteration that raised it.
#[derive(Debug, Error)]
pub enum FrameworkError {
    /// An operand was missing or not initialized.
    #[error("invalid operand `{name}` for operator `{op_type}`: {reason}")]
    InvalidOperand {
        op_type: String,
        name: String,
        reason: String,
    },

    /// The registry has no usable entry for this operator type.
    #[error("unknown operator `{op_type}`: {reason}")]
    UnknownOperator { op_type: String, reason: String },

    /// The gradient maker did not produce exactly one backward descriptor.
    #[error("operator `{op_type}` produced {count} backward descriptors, expected exactly 1")]
    UnsupportedGradient { op_type: String, count: usize },

    /// Dims or list lengths disagree.
    #[error("shape mismatch for `{name}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A tensor lives on a device the operation cannot read from.
    #[error("`{name}` must reside in host memory, found on {place}")]
    UnsupportedDevice { name: String, place: String },

    /// Variable lookup failed in the scope chain or block chain.
    #[error("variable `{name}` not found")]
    VariableNotFound { name: String },

    /// A variable holds a different kind of value than requested.
    #[error("variable `{name}` has type {actual}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A required operator attribute is absent or has the wrong type.
    #[error("operator `{op_type}` is missing attribute `{attr}`")]
    MissingAttribute { op_type: String, attr: String },

    /// A block index or scope handle does not refer to a live entry.
    #[error("invalid block or scope reference: {message}")]
    InvalidBlock { message: String },
}

impl FrameworkError {
    pub(crate) fn not_found(name: impl Into<String>) -> Self {
        Self::VariableNotFound { name: name.into() }
    }

    pub(crate) fn shape_mismatch(
        name: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}
