//! Error types for the Griddle client layer.
//!
//! Engine-side evaluation failures are carried through unchanged: the engine
//! produced the message, this layer only transports it.

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, GriddleError>;

/// Errors raised while resolving and loading the native engine binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// A package request could not be resolved to an installed module
    #[error("Cannot find module '{request}'")]
    ModuleNotFound {
        /// The package request that failed to resolve
        request: String,
    },

    /// An optional platform package is not installed on this host.
    ///
    /// Raised fail-fast while optional-package interception is active, so the
    /// entry loader can skip the candidate instead of aborting on a generic
    /// resolution failure.
    #[error("Optional platform package '{request}' is not installed")]
    OptionalPackageUnavailable {
        /// The optional package request that was intercepted
        request: String,
    },

    /// No prebuilt engine package exists for the current target
    #[error("No prebuilt engine package for platform '{platform}'")]
    NoPlatformSupport {
        /// Human-readable target description
        platform: String,
    },

    /// The resolved shared library could not be opened
    #[error("Failed to load engine library: {message}")]
    Library {
        /// Loader-reported failure text
        message: String,
    },

    /// A required C ABI symbol is missing from the engine library
    #[error("Engine library is missing symbol '{symbol}'")]
    MissingSymbol {
        /// Name of the absent symbol
        symbol: String,
    },
}

impl LoadError {
    /// Create a module-not-found error
    pub fn module_not_found(request: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            request: request.into(),
        }
    }

    /// Create an optional-package-unavailable error
    pub fn optional_package_unavailable(request: impl Into<String>) -> Self {
        Self::OptionalPackageUnavailable {
            request: request.into(),
        }
    }

    /// Create a no-platform-support error
    pub fn no_platform_support(platform: impl Into<String>) -> Self {
        Self::NoPlatformSupport {
            platform: platform.into(),
        }
    }

    /// Create a library-open error
    pub fn library(message: impl Into<String>) -> Self {
        Self::Library {
            message: message.into(),
        }
    }

    /// Create a missing-symbol error
    pub fn missing_symbol(symbol: impl Into<String>) -> Self {
        Self::MissingSymbol {
            symbol: symbol.into(),
        }
    }

    /// The package request whose resolution failed, if this error carries one
    pub fn failing_request(&self) -> Option<&str> {
        match self {
            Self::ModuleNotFound { request } | Self::OptionalPackageUnavailable { request } => {
                Some(request)
            }
            _ => None,
        }
    }
}

/// Errors surfaced to callers of the client
#[derive(Error, Debug)]
pub enum GriddleError {
    /// The engine binding could not be loaded
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Engine-side evaluation failure; the message is the engine's, verbatim
    #[error("{message}")]
    Evaluation {
        /// Failure text as reported by the engine
        message: String,
    },

    /// A custom function registration was rejected
    #[error("Failed to register function '{name}': {message}")]
    Registration {
        /// Name the registration was attempted under
        name: String,
        /// Rejection reason
        message: String,
    },

    /// Input could not be handed to the engine at all
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Why the input was unusable
        message: String,
    },
}

impl GriddleError {
    /// Create an evaluation error from engine-reported text
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Create a registration error
    pub fn registration(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Registration {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_request_is_present_for_resolution_errors() {
        let err = LoadError::module_not_found("@griddle/engine-linux-x64-gnu");
        assert_eq!(err.failing_request(), Some("@griddle/engine-linux-x64-gnu"));

        let err = LoadError::optional_package_unavailable("@griddle/engine-darwin-arm64");
        assert_eq!(err.failing_request(), Some("@griddle/engine-darwin-arm64"));
    }

    #[test]
    fn failing_request_is_absent_for_other_errors() {
        assert_eq!(LoadError::library("dlopen failed").failing_request(), None);
        assert_eq!(
            LoadError::missing_symbol("griddle_eval").failing_request(),
            None
        );
    }

    #[test]
    fn evaluation_error_displays_engine_message_verbatim() {
        let err = GriddleError::evaluation("Unknown function: FOO");
        assert_eq!(err.to_string(), "Unknown function: FOO");
    }
}
