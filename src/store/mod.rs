/*!
Persistence contract for the four record kinds the auth flows touch.

Every call is an independent round trip. Single-flight guarantees
(one oauth state per user, one spotify link per user) come from the
store's unique constraints, not from locks held by callers.
*/
use chrono::{DateTime, Utc};

use crate::models::{
    LinkTokens, NewOAuthState, NewSession, NewUser, OAuthState, Session, SpotifyLink, User,
};

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store failure: {0}")]
    Other(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    // users
    async fn insert_user(&self, user: NewUser) -> StoreResult<User>;
    async fn find_user(&self, id: i64) -> StoreResult<Option<User>>;
    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;
    async fn username_exists(&self, username: &str) -> StoreResult<bool>;
    async fn email_exists(&self, email: &str) -> StoreResult<bool>;
    /// Cascades to the user's sessions, oauth state and spotify link
    async fn delete_user(&self, id: i64) -> StoreResult<bool>;

    // sessions
    async fn insert_session(&self, session: NewSession) -> StoreResult<Session>;
    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>>;
    async fn update_session_expiration(
        &self,
        id: i64,
        expiration: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn delete_session(&self, id: i64) -> StoreResult<bool>;
    async fn delete_sessions_expired_before(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // oauth states
    async fn delete_oauth_states_for_user(&self, user_id: i64) -> StoreResult<u64>;
    async fn insert_oauth_state(&self, state: NewOAuthState) -> StoreResult<OAuthState>;
    async fn find_oauth_state_for_user(&self, user_id: i64) -> StoreResult<Option<OAuthState>>;
    async fn delete_oauth_state(&self, id: i64) -> StoreResult<bool>;
    async fn delete_oauth_states_expired_before(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // spotify links
    async fn find_link_for_user(&self, user_id: i64) -> StoreResult<Option<SpotifyLink>>;
    /// Insert, or replace the tokens of the user's existing link
    async fn upsert_link(&self, user_id: i64, tokens: LinkTokens) -> StoreResult<SpotifyLink>;
    async fn update_link_tokens(&self, id: i64, tokens: LinkTokens) -> StoreResult<SpotifyLink>;
    async fn delete_link(&self, id: i64) -> StoreResult<bool>;
}
