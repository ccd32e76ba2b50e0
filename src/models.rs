use chrono::{DateTime, Utc};

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct User {
    pub id: i64,
    // unique, 4-16 chars
    pub username: String,
    // unique, stored lowercased
    pub email: String,
    // pbkdf2 encoded hash, see `crypto::hash_password`
    #[serde(skip)]
    pub password_hash: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    // hmac (hex encoded) of the bearer token set in the
    // `Authorization` cookie. The raw token is never stored.
    pub token_hash: String,
    // returned to the browser in the readable `Csrf` cookie and
    // expected back in the body of every mutating request.
    pub csrf_token: String,
    pub expiration: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

impl Session {
    /// A session is only usable strictly before its expiration
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub token_hash: String,
    pub csrf_token: String,
    pub expiration: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct OAuthState {
    pub id: i64,
    // at most one live state per user
    pub user_id: i64,
    pub state: String,
    pub expiration: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOAuthState {
    pub user_id: i64,
    pub state: String,
    pub expiration: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct SpotifyLink {
    pub id: i64,
    // at most one link per user
    pub user_id: i64,
    // a spotify access token that can be used to access
    // the spotify user's info. This value is AES_256_GCM
    // encrypted using the application secret set in the
    // current environment and the `access_nonce` generated
    // when the value was originally encrypted.
    pub access_token: String,
    pub access_nonce: String,
    // a spotify token that can be used to refresh the spotify
    // user's access_token. This is encrypted and stored the
    // same way as the actual access_token.
    pub refresh_token: String,
    pub refresh_nonce: String,
    // when the current access_token should be considered dead,
    // a couple minutes ahead of spotify's own expiry.
    pub access_token_expiration: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Encrypted token material for inserting or refreshing a link
#[derive(Debug, Clone)]
pub struct LinkTokens {
    pub access_token: String,
    pub access_nonce: String,
    pub refresh_token: String,
    pub refresh_nonce: String,
    pub access_token_expiration: DateTime<Utc>,
}
