use std::fmt;

/// Errors surfaced at the public engine boundary.
///
/// Each kind maps onto one of the integer return codes of the classic C
/// likelihood-library interface via [`EngineError::code`]; `0` is success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An index addressed a buffer, matrix, eigen-decomposition, partition,
    /// or scale slot that does not exist in this instance.
    OutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },
    /// Allocation failed while creating the instance.
    OutOfMemory,
    /// A kernel-internal invariant was violated, or a worker died without
    /// reporting a result.
    UnidentifiedException,
    /// A site likelihood came out non-finite or non-positive after scaling.
    FloatingPointError,
    /// The requested option is not supported by this implementation.
    NoImplementation { what: &'static str },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Negative integer return code for foreign-interface consumers.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::OutOfMemory => -2,
            EngineError::UnidentifiedException => -3,
            EngineError::OutOfRange { .. } => -5,
            EngineError::NoImplementation { .. } => -7,
            EngineError::FloatingPointError => -8,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::OutOfRange { what, index, limit } => {
                write!(f, "{what} index {index} out of range (limit {limit})")
            }
            EngineError::OutOfMemory => write!(f, "buffer allocation failed"),
            EngineError::UnidentifiedException => {
                write!(f, "internal invariant violated during evaluation")
            }
            EngineError::FloatingPointError => {
                write!(f, "non-finite or non-positive site likelihood")
            }
            EngineError::NoImplementation { what } => {
                write!(f, "{what} is not supported by this implementation")
            }
        }
    }
}

impl std::error::Error for EngineError {}

#[inline]
pub(crate) fn check_index(what: &'static str, index: usize, limit: usize) -> Result<()> {
    if index < limit {
        Ok(())
    } else {
        Err(EngineError::OutOfRange { what, index, limit })
    }
}
