//! Internal: Declare an Error type for rmi-bytes

use std::borrow::Cow;

use thiserror::Error;

/// Error type for decoding rmi objects from bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to read something, but we didn't find enough bytes.
    ///
    /// This can mean that the object is truncated, or that we need to
    /// read more and try again.
    #[error("object truncated (or not fully present), at least {deficit} more bytes needed")]
    Truncated {
        /// Lower bound on the number of additional bytes needed.
        deficit: usize,
    },
    /// Called Reader::should_be_exhausted(), but found bytes anyway.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// Invalid length value.
    #[error("object length too large to represent as usize")]
    BadLengthValue,
    /// An attempt to parse an object failed for some reason related to its
    /// contents.
    #[error("bad object: {0}")]
    InvalidMessage(Cow<'static, str>),
    /// A length-prefixed string was not valid UTF-8.
    #[error("string field was not valid UTF-8")]
    BadUtf8,
}

/// Error type for encoding rmi objects to bytes.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum EncodeError {
    /// We tried to encode an object with an attached length, but the length
    /// was too large to encode in the available space.
    #[error("object length too large to encode")]
    BadLengthValue,
}
