use std::fmt;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a request was refused. The `Display` text is what clients see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    MissingAuthorization,
    SessionNotFound,
    SessionExpired,
    CsrfMismatch,
    NoState,
    StateExpired,
    StateMismatch,
    NotLinked,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Denial::MissingAuthorization => "missing authorization",
            Denial::SessionNotFound => "session not found",
            Denial::SessionExpired => "session expired",
            Denial::CsrfMismatch => "csrf token mismatch",
            Denial::NoState => "unidentified state",
            Denial::StateExpired => "expired state",
            Denial::StateMismatch => "state mismatch",
            Denial::NotLinked => "account not linked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(Denial),

    #[error("forbidden: {0}")]
    Forbidden(Denial),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("configuration fault: {0}")]
    Configuration(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("spotify account already linked")]
    AlreadyLinked,
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::AlreadyAuthenticated | Error::AlreadyLinked => 308,
            Error::Upstream(_) | Error::Configuration(_) | Error::Store(_) => 500,
        }
    }

    /// Session denials mean the browser holds dead cookies
    pub fn clears_session(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized(Denial::SessionNotFound)
                | Error::Unauthorized(Denial::SessionExpired)
        )
    }

    /// Message safe to hand to a client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(msg) | Error::NotFound(msg) => msg.clone(),
            Error::Unauthorized(d) | Error::Forbidden(d) => d.to_string(),
            Error::AlreadyAuthenticated | Error::AlreadyLinked => self.to_string(),
            Error::Upstream(_) => "error communicating with spotify".to_string(),
            Error::Configuration(_) | Error::Store(_) => "internal server error".to_string(),
        }
    }
}
