//! Error types shared by the whole engine.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::host::HostError;

/// Result alias used throughout arbor.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The tree or a component broke an invariant (keys, hook order, handles).
    Structural,
    /// User code failed while rendering or running a lifecycle callback.
    UserRender,
    /// An invalid configuration value was supplied.
    Configuration,
    /// The host object model rejected an operation.
    Host,
}

/// Errors reported by the reconciler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate child key `{key}` among siblings")]
    DuplicateKey { key: String },

    #[error(
        "hook count mismatch in `{component}`: previous render had {previous} hooks, \
         current render has {current}"
    )]
    HookCountMismatch {
        component: String,
        previous: usize,
        current: usize,
    },

    #[error(
        "hook order mismatch in `{component}` at index {index}: previous render called \
         `{previous}`, current render called `{current}`"
    )]
    HookOrderMismatch {
        component: String,
        index: usize,
        previous: String,
        current: String,
    },

    #[error("`{hook}` called outside of a function component render")]
    HookOutsideRender { hook: &'static str },

    #[error("tree has already been unmounted")]
    TreeAlreadyUnmounted,

    #[error("tree handle does not belong to this reconciler")]
    UnknownTree,

    #[error("updates did not settle after {passes} flush passes")]
    UpdateLoop { passes: usize },

    #[error("expected at most one child, found {count}")]
    MultipleChildren { count: usize },

    #[error("`{component}` failed to render: {message}{}", at(.location))]
    Render {
        component: String,
        message: String,
        location: Option<&'static Location<'static>>,
    },

    #[error("lifecycle callback of `{component}` failed: {message}")]
    Effect { component: String, message: String },

    #[error("invalid props for `{component}`: {message}{}", at(.location))]
    InvalidProps {
        component: String,
        message: String,
        location: Option<&'static Location<'static>>,
    },

    #[error("type check failed: {0}")]
    TypeCheck(String),

    #[error("invalid configuration `{key}`: {reason}")]
    Config { key: String, reason: String },

    #[error("global configuration has already been installed")]
    ConfigAlreadyInstalled,

    #[error("internal consistency check failed: {0}")]
    Internal(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

fn at(location: &Option<&'static Location<'static>>) -> String {
    match location {
        Some(location) => format!(" (element created at {location})"),
        None => String::new(),
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateKey { .. }
            | Error::HookCountMismatch { .. }
            | Error::HookOrderMismatch { .. }
            | Error::HookOutsideRender { .. }
            | Error::TreeAlreadyUnmounted
            | Error::UnknownTree
            | Error::UpdateLoop { .. }
            | Error::MultipleChildren { .. }
            | Error::TypeCheck(_)
            | Error::Internal(_) => ErrorKind::Structural,
            Error::Render { .. } | Error::Effect { .. } | Error::InvalidProps { .. } => {
                ErrorKind::UserRender
            }
            Error::Config { .. } | Error::ConfigAlreadyInstalled => ErrorKind::Configuration,
            Error::Host(_) => ErrorKind::Host,
        }
    }

    /// Whether this is a fatal structural violation.
    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::Structural
    }
}

/// Failure raised by user render code.
///
/// Any `std::error::Error` converts into it, so `?` works inside render
/// functions. Plain messages go through [`RenderError::msg`].
pub struct RenderError {
    message: String,
}

impl RenderError {
    /// Create a render error from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl<E: std::error::Error> From<E> for RenderError {
    fn from(error: E) -> Self {
        Self::msg(error)
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RenderError").field(&self.message).finish()
    }
}
