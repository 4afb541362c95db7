//! Error type shared across the playback engine.

/// Errors surfaced by the platform host and playback instances.
///
/// End-of-stream is deliberately *not* an error; the read paths report it
/// through their result enums ([`crate::instance::VideoFrameRead`],
/// [`crate::source::SampleRead`]).
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerError {
    /// The operation requires `platform::initialize` or an open media.
    NotInitialized,
    /// Redundant call to `platform::initialize`.
    AlreadyInitialized,
    /// Out-of-range numeric argument or otherwise unusable input.
    InvalidParameter(String),
    /// A backend reported an allocation failure.
    OutOfMemory,
    /// `platform::shutdown` was called while instances are still alive.
    InstancesActive(usize),
    /// An underlying framework call failed; the opaque code is preserved.
    Platform {
        /// Backend-specific status code.
        code: i64,
        /// Human-readable context for logs.
        context: String,
    },
}

impl PlayerError {
    /// Convenience constructor for backend failures.
    pub fn platform(code: i64, context: impl Into<String>) -> Self {
        PlayerError::Platform {
            code,
            context: context.into(),
        }
    }

    /// Convenience constructor for invalid arguments.
    pub fn invalid(context: impl Into<String>) -> Self {
        PlayerError::InvalidParameter(context.into())
    }
}

impl std::fmt::Display for PlayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerError::NotInitialized => write!(f, "player platform not initialized"),
            PlayerError::AlreadyInitialized => write!(f, "player platform already initialized"),
            PlayerError::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            PlayerError::OutOfMemory => write!(f, "allocation failed"),
            PlayerError::InstancesActive(count) => {
                write!(f, "{count} playback instance(s) still alive")
            }
            PlayerError::Platform { code, context } => {
                write!(f, "platform failure {code:#x}: {context}")
            }
        }
    }
}

impl std::error::Error for PlayerError {}
