/*!
Session issuance and lookup.

A session is `Active` strictly before its expiration, `Expired` from then
on (noticed lazily on lookup), and gone once logged out or reaped.
*/
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::clock::Clock;
use crate::crypto::Vault;
use crate::models::{NewSession, Session};
use crate::store::CredentialStore;
use crate::{Result, LOG};

pub fn session_lifetime() -> Duration {
    Duration::days(7)
}

/// Raw tokens for a freshly created session. The bearer token only
/// exists here and in the client's cookie.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub bearer: String,
    pub csrf: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Resolved {
    Active(Session),
    Expired(Session),
    NotFound,
}

fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    vault: Vault,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>, vault: Vault) -> Self {
        Self {
            store,
            clock,
            vault,
        }
    }

    pub async fn create_session(&self, user_id: i64) -> Result<IssuedSession> {
        let bearer = new_token();
        let mut csrf = new_token();
        while csrf == bearer {
            csrf = new_token();
        }
        let expires_at = self.clock.now() + session_lifetime();
        let session = self
            .store
            .insert_session(NewSession {
                user_id,
                token_hash: self.vault.hmac_sign(&bearer),
                csrf_token: csrf.clone(),
                expiration: expires_at,
            })
            .await?;
        slog::debug!(LOG, "created session"; "user_id" => user_id, "session_id" => session.id);
        Ok(IssuedSession {
            session,
            bearer,
            csrf,
            expires_at,
        })
    }

    pub async fn resolve(&self, bearer: &str) -> Result<Resolved> {
        let hash = self.vault.hmac_sign(bearer);
        let session = match self.store.find_session_by_token_hash(&hash).await? {
            None => return Ok(Resolved::NotFound),
            Some(s) => s,
        };
        if session.is_expired(self.clock.now()) {
            return Ok(Resolved::Expired(session));
        }
        Ok(Resolved::Active(session))
    }

    /// Push the expiration out another full lifetime. Returns the new expiration,
    /// the caller re-issues both cookies with the same token values.
    pub async fn renew(&self, session: &mut Session) -> Result<DateTime<Utc>> {
        let expiration = self.clock.now() + session_lifetime();
        self.store
            .update_session_expiration(session.id, expiration)
            .await?;
        session.expiration = expiration;
        Ok(expiration)
    }

    /// Deletion failures are logged only: the client clears its cookies
    /// and the reaper removes the row once it expires.
    pub async fn destroy(&self, session: &Session) {
        match self.store.delete_session(session.id).await {
            Ok(_) => {
                slog::debug!(LOG, "destroyed session"; "user_id" => session.user_id, "session_id" => session.id)
            }
            Err(e) => slog::error!(
                LOG, "error deleting session, continuing";
                "user_id" => session.user_id,
                "session_id" => session.id,
                "error" => e.to_string(),
            ),
        }
    }
}
