/*!
Double-submit CSRF check.

The `Csrf` cookie is readable by the frontend, which copies it into the
`csrf_` field of every mutating request body. A forged cross-site request
carries the cookies but cannot read them, so it cannot fill in the body.
*/
use crate::crypto;
use crate::models::Session;
use crate::{Denial, Error, Result, LOG};

/// JSON body field carrying the submitted token
pub const BODY_FIELD: &str = "csrf_";

#[derive(Debug, Default, Clone)]
pub struct CsrfGuard;

impl CsrfGuard {
    pub fn new() -> Self {
        Self
    }

    /// `session` must already be resolved and active. A missing token is
    /// treated the same as a wrong one.
    pub fn verify(&self, session: &Session, submitted: Option<&str>, op: &str) -> Result<()> {
        let ok = submitted
            .map(|token| crypto::constant_time_eq(&session.csrf_token, token))
            .unwrap_or(false);
        if ok {
            return Ok(());
        }
        // request was possibly forged
        slog::warn!(
            LOG, "potential csrf attempt: csrf token mismatch";
            "user_id" => session.user_id,
            "session_id" => session.id,
            "op" => op,
            "token_present" => submitted.is_some(),
        );
        Err(Error::Forbidden(Denial::CsrfMismatch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(csrf: &str) -> Session {
        Session {
            id: 1,
            user_id: 7,
            token_hash: "hash".into(),
            csrf_token: csrf.into(),
            expiration: Utc::now(),
            created: Utc::now(),
        }
    }

    #[test]
    fn matching_token_passes() {
        let guard = CsrfGuard::new();
        assert!(guard
            .verify(&session("abc-123"), Some("abc-123"), "test")
            .is_ok());
    }

    #[test]
    fn mismatch_and_missing_are_forbidden() {
        let guard = CsrfGuard::new();
        let s = session("abc-123");
        for submitted in [Some("abc-124"), Some(""), Some("abc-1234"), None] {
            match guard.verify(&s, submitted, "test") {
                Err(Error::Forbidden(Denial::CsrfMismatch)) => {}
                other => panic!("expected forbidden for {:?}, got {:?}", submitted, other),
            }
        }
    }
}
