use std::fmt;

/// Which collaborator an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    Metadata,
    Availability,
    Storage,
}

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::Metadata => "metadata",
            Dependency::Availability => "availability",
            Dependency::Storage => "storage",
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict with reservation: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("{which} timed out")]
    DependencyTimeout { which: Dependency },
    #[error("{which} failed: {cause}")]
    DependencyFailure { which: Dependency, cause: Box<Error> },
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("unsupported on this node: {0}")]
    Unsupported(String),
}

impl Error {
    /// Wrap an error coming back from a dependency. Timeouts stay timeouts so
    /// callers can tell a slow backend from a failing one.
    pub fn dependency(which: Dependency, cause: Error) -> Self {
        match cause {
            Error::DependencyTimeout { .. } => Error::DependencyTimeout { which },
            cause => Error::DependencyFailure {
                which,
                cause: Box::new(cause),
            },
        }
    }

    /// The innermost cause, looking through dependency wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::DependencyFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Error::NotFound(_))
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::StorageUnavailable(_) | Error::DependencyTimeout { .. } | Error::NotReady(_)
        )
    }

    /// SQLSTATE reported to clients over the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Error::Validation(_) => "22023",
            Error::NotFound(_) => "P0002",
            Error::AlreadyExists(_) => "23505",
            Error::Conflict(_) => "23P01",
            Error::StorageUnavailable(_) => "58030",
            Error::DependencyTimeout { .. } => "57014",
            Error::DependencyFailure { .. } if self.is_not_found() => "P0002",
            Error::DependencyFailure { .. } => "58000",
            Error::IntegrityViolation(_) => "XX001",
            Error::NotReady(_) => "57P03",
            Error::Unsupported(_) => "0A000",
        }
    }

    /// Rebuild an error received from a remote node. `which` names the
    /// dependency the remote node was serving for us.
    pub fn from_sqlstate(code: &str, message: &str, which: Dependency) -> Self {
        let message = message.to_string();
        match code {
            "22023" => Error::Validation(message),
            "P0002" => Error::NotFound(message),
            "23505" => Error::AlreadyExists(message),
            "23P01" => Error::Conflict(message),
            "57014" => Error::DependencyTimeout { which },
            "XX001" => Error::IntegrityViolation(message),
            "57P03" => Error::NotReady(message),
            "0A000" => Error::Unsupported(message),
            _ => Error::StorageUnavailable(message),
        }
    }
}
