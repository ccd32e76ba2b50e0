/*!
Request guards.

Every protected route resolves the session first. Mutating routes then
check the csrf token, and spotify routes then check link state or fetch an
access token. Each step returns the typed error the service maps to a
response.
*/
use std::sync::Arc;

use crate::csrf::CsrfGuard;
use crate::models::Session;
use crate::oauth::OAuthLinkFlow;
use crate::session::{Resolved, SessionManager};
use crate::tokens::TokenRefreshManager;
use crate::{Denial, Error, Result, LOG};

pub struct AuthPipeline {
    sessions: Arc<SessionManager>,
    csrf: CsrfGuard,
    oauth: Arc<OAuthLinkFlow>,
    tokens: Arc<TokenRefreshManager>,
}

impl AuthPipeline {
    pub fn new(
        sessions: Arc<SessionManager>,
        csrf: CsrfGuard,
        oauth: Arc<OAuthLinkFlow>,
        tokens: Arc<TokenRefreshManager>,
    ) -> Self {
        Self {
            sessions,
            csrf,
            oauth,
            tokens,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn oauth(&self) -> &OAuthLinkFlow {
        &self.oauth
    }

    pub fn tokens(&self) -> &TokenRefreshManager {
        &self.tokens
    }

    /// For register and login: a caller who already holds an active
    /// session is sent on instead of creating another one.
    ///
    /// A dead session lets the request through but is returned, so the
    /// caller clears both cookies unless it issues new ones.
    pub async fn redirect_authorized(&self, bearer: Option<&str>) -> Result<Option<Denial>> {
        let bearer = match bearer {
            Some(b) if !b.is_empty() => b,
            _ => return Ok(None),
        };
        match self.sessions.resolve(bearer).await? {
            Resolved::Active(_) => Err(Error::AlreadyAuthenticated),
            Resolved::Expired(session) => {
                slog::debug!(
                    LOG, "stale session presented to sign in";
                    "user_id" => session.user_id,
                    "session_id" => session.id,
                );
                Ok(Some(Denial::SessionExpired))
            }
            Resolved::NotFound => {
                slog::info!(LOG, "unknown session presented to sign in");
                Ok(Some(Denial::SessionNotFound))
            }
        }
    }

    pub async fn authorize(&self, bearer: Option<&str>) -> Result<Session> {
        let bearer = match bearer {
            Some(b) if !b.is_empty() => b,
            _ => return Err(Error::Unauthorized(Denial::MissingAuthorization)),
        };
        match self.sessions.resolve(bearer).await? {
            Resolved::Active(session) => Ok(session),
            Resolved::Expired(session) => {
                slog::debug!(
                    LOG, "session expired";
                    "user_id" => session.user_id,
                    "session_id" => session.id,
                );
                Err(Error::Unauthorized(Denial::SessionExpired))
            }
            Resolved::NotFound => {
                // logged out elsewhere, reaped, or a forged cookie
                slog::info!(LOG, "session not found for presented token");
                Err(Error::Unauthorized(Denial::SessionNotFound))
            }
        }
    }

    /// `authorize` followed by the csrf check, in that order
    pub async fn authorize_mutation(
        &self,
        bearer: Option<&str>,
        csrf: Option<&str>,
        op: &str,
    ) -> Result<Session> {
        let session = self.authorize(bearer).await?;
        self.csrf.verify(&session, csrf, op)?;
        Ok(session)
    }

    pub async fn require_unlinked(&self, session: &Session) -> Result<()> {
        if self.oauth.is_linked(session.user_id).await? {
            return Err(Error::AlreadyLinked);
        }
        Ok(())
    }

    pub async fn require_linked(&self, session: &Session) -> Result<()> {
        if !self.oauth.is_linked(session.user_id).await? {
            return Err(Error::Forbidden(Denial::NotLinked));
        }
        Ok(())
    }

    pub async fn access_token(&self, session: &Session) -> Result<String> {
        self.tokens.access_token(session.user_id).await
    }
}
