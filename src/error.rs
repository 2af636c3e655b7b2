use thiserror::Error;

/// Errors raised by computation-local operations.
///
/// Training-level conditions (non-convergence, degenerate cases, committee
/// member failures) are not errors; they are reported on the respective
/// result types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A product-unit node hit an invalid base/exponent combination.
    #[error("domain error in layer {layer} node {node}: base {base} with exponent {exponent}")]
    Domain {
        layer: usize,
        node: usize,
        base: f64,
        exponent: f64,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("i/o error on {path}: {message}")]
    Io { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::ShapeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// True for errors raised by a product unit outside its domain.
    #[inline]
    pub fn is_domain(&self) -> bool {
        matches!(self, Error::Domain { .. })
    }
}
