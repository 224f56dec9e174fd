//! Define an error type for the rmi-msg crate.
use thiserror::Error;

/// An error type for the rmi-msg crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in the rmi_bytes crate while decoding an
    /// object.
    #[error("error while parsing {parsed}")]
    BytesErr {
        /// The error that occurred.
        #[source]
        err: rmi_bytes::Error,
        /// The thing that was being parsed.
        parsed: &'static str,
    },
    /// We encountered an error while encoding an outgoing message.
    ///
    /// This is likely to be a bug in somebody's code: either the code in
    /// this crate, or in the calling code that provided an unencodable
    /// message.
    #[error("error while encoding message")]
    EncodeErr(#[from] rmi_bytes::EncodeError),
    /// Protocol violation at the message-framing level.
    #[error("message protocol violation: {0}")]
    Proto(String),
    /// A frame declared a body longer than the frame size limit.
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLong(usize),
}
