//! Error taxonomy for the type system.
//!
//! Recoverable failures surface as [`TypeError`] values; the runtime
//! guarantees that any partially constructed object state has been fully
//! unwound before an error becomes visible to the caller. Invariant
//! breaches (mutating a referenced descriptor, forming an inheritance
//! cycle, a panicking destructor) are not representable here: they are
//! asserted, because no caller can meaningfully recover from them.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type TypeResult<T> = Result<T, TypeError>;

/// Errors reported by type registration and object lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TypeError {
    /// A sibling type with this name already exists under the same parent.
    #[error("a type named `{0}` already exists under the requested parent")]
    NameConflict(String),

    /// Attempted to construct or copy-construct an abstract type.
    #[error("abstract types cannot be instantiated")]
    AbstractConstruction,

    /// The payload type does not support the requested operation,
    /// e.g. copying a non-copyable payload.
    #[error("the payload type does not define the requested operation")]
    UndefinedMethod,

    /// The user-supplied payload constructor failed.
    #[error("payload construction failed: {0}")]
    PayloadConstruction(String),

    /// A plugin constructor or assignment rejected the object. All plugin
    /// and payload state constructed so far has been destroyed again.
    #[error("a plugin rejected construction or assignment of the object")]
    PluginConstruction,

    /// The allocator returned no memory.
    #[error("object memory allocation failed")]
    AllocationFailure,

    /// The payload reports zero size, which marks the type unconstructible.
    #[error("the payload reports zero size; the type cannot be instantiated")]
    Unconstructible,

    /// The handle does not name a live registered type. The slot was never
    /// used, or the type behind it has been deleted since.
    #[error("stale or unknown type handle")]
    UnknownType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TypeError::NameConflict("Vehicle".into());
        assert!(err.to_string().contains("Vehicle"));

        let err = TypeError::PayloadConstruction("bad params".into());
        assert!(err.to_string().contains("bad params"));
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(TypeError::UnknownType, TypeError::UnknownType);
        assert_ne!(
            TypeError::AbstractConstruction,
            TypeError::UndefinedMethod
        );
    }
}
