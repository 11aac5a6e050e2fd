use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Most failures against target memory are *not* errors: a failed read yields `None`, and a
/// structurally inconsistent object is reported as an [`crate::heap::ObjectCorruption`]. The
/// variants here are reserved for conditions which make further queries untrustworthy, or for
/// invalid input handed in by the caller.
///
/// # Error Categories
///
/// ## Session Errors
/// - [`Error::ProtocolVersionMismatch`] - The data access layer speaks a protocol we do not support
/// - [`Error::NotInitialized`] - The runtime in the target has not been initialized
///
/// ## Caller Errors
/// - [`Error::InvalidArgument`] - An invalid handle, index or budget was supplied
///
/// ## Decoding Errors
/// - [`Error::Malformed`] - A signature or encoded structure could not be decoded
/// - [`Error::OutOfBounds`] - A decoder attempted to read past the end of its buffer
/// - [`Error::RecursionLimit`] - A nested structure exceeded the maximum depth
/// - [`Error::NotSupported`] - The requested feature is unavailable on this runtime
///
/// # Examples
///
/// ```rust,no_run
/// use clrscope::Error;
///
/// fn describe(err: &Error) -> &'static str {
///     match err {
///         Error::ProtocolVersionMismatch { .. } => "wrong dac version",
///         Error::InvalidArgument(_) => "bad input",
///         _ => "other",
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The structured query gateway reported a protocol version this crate cannot talk to.
    ///
    /// This is only ever returned while constructing a [`crate::ClrRuntime`]. Once a session
    /// has been established no query will produce it.
    #[error("The data access layer reported protocol version {actual}, expected {expected}")]
    ProtocolVersionMismatch {
        /// The protocol version this crate understands
        expected: u32,
        /// The protocol version the gateway reported
        actual: u32,
    },

    /// The runtime in the target either has not been initialized or contains no data.
    #[error("The runtime is not initialized - {0}")]
    NotInitialized(String),

    /// An argument supplied by the caller was invalid.
    ///
    /// Returned immediately, before any memory is read. Examples are an empty verification
    /// budget or an unknown handle.
    #[error("Invalid argument - {0}")]
    InvalidArgument(String),

    /// The encoded data is damaged and could not be decoded.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while decoding a buffer.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The requested operation is not supported by the target runtime.
    #[error("This operation is not supported by the target runtime")]
    NotSupported,

    /// Recursion limit reached.
    ///
    /// Signature decoding is recursive, a crafted or corrupted signature could otherwise
    /// exhaust the stack. The associated value shows the limit that was reached.
    #[error("Reach the maximum recursion level allowed - {0}")]
    RecursionLimit(usize),
}
