use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::crypto;
use crate::models::{NewUser, Session, User};
use crate::session::{IssuedSession, SessionManager};
use crate::store::{CredentialStore, StoreError};
use crate::{se, validate, Error, Result, LOG};

/// Public view of a user
#[derive(serde::Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub username: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotify: Option<bool>,
}

impl Profile {
    fn of(user: &User, spotify: Option<bool>) -> Self {
        Self {
            username: user.username.clone(),
            email: user.email.clone(),
            spotify,
        }
    }
}

/// A user paired with the session just issued to them
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub profile: Profile,
    pub issued: IssuedSession,
}

/// Result of a heartbeat: the session now lives until `expires_at`
#[derive(Debug, Clone)]
pub struct Renewed {
    pub profile: Profile,
    pub expires_at: DateTime<Utc>,
}

pub struct Accounts {
    store: Arc<dyn CredentialStore>,
    sessions: Arc<SessionManager>,
}

impl Accounts {
    pub fn new(store: Arc<dyn CredentialStore>, sessions: Arc<SessionManager>) -> Self {
        Self { store, sessions }
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<SignedIn> {
        validate::new_user(username, email, password)?;
        let email = email.to_lowercase();

        if self.store.username_exists(username).await? {
            return Err(Error::Validation("username already exists".into()));
        }
        if self.store.email_exists(&email).await? {
            return Err(Error::Validation("email already exists".into()));
        }

        let password_hash = crypto::hash_password(password)?;
        let user = self
            .store
            .insert_user(NewUser {
                username: username.to_string(),
                email,
                password_hash,
            })
            .await
            .map_err(|e| match e {
                // lost a race with a concurrent registration
                StoreError::Conflict(ref c) if c.contains("username") => {
                    Error::Validation("username already exists".into())
                }
                StoreError::Conflict(ref c) if c.contains("email") => {
                    Error::Validation("email already exists".into())
                }
                e => Error::from(e),
            })?;
        slog::info!(LOG, "registered user"; "user_id" => user.id);

        let issued = self.sessions.create_session(user.id).await?;
        Ok(SignedIn {
            profile: Profile::of(&user, None),
            issued,
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<SignedIn> {
        let user = self
            .store
            .find_user_by_username(username)
            .await?
            .ok_or_else(|| Error::Validation("username does not exist".into()))?;
        if !crypto::verify_password(password, &user.password_hash) {
            slog::info!(LOG, "failed login"; "user_id" => user.id);
            return Err(Error::Validation("incorrect password".into()));
        }
        let issued = self.sessions.create_session(user.id).await?;
        slog::info!(LOG, "logged in"; "user_id" => user.id, "session_id" => issued.session.id);
        Ok(SignedIn {
            profile: Profile::of(&user, None),
            issued,
        })
    }

    pub async fn logout(&self, session: &Session) {
        self.sessions.destroy(session).await;
    }

    /// Heartbeat: renew the session and report who is signed in
    pub async fn authenticate(&self, mut session: Session) -> Result<Renewed> {
        let user = self
            .store
            .find_user(session.user_id)
            .await?
            .ok_or_else(|| Error::NotFound(se!("user {} not found", session.user_id)))?;
        let expires_at = self.sessions.renew(&mut session).await?;
        let linked = self.store.find_link_for_user(user.id).await?.is_some();
        Ok(Renewed {
            profile: Profile::of(&user, Some(linked)),
            expires_at,
        })
    }
}
