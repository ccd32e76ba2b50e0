/*!
Fixtures shared by unit and integration tests
*/
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SpotifySettings;
use crate::crypto::{self, Vault};
use crate::models::{NewUser, SpotifyLink, User};
use crate::spotify::{ApiResponse, Method, SpotifyAccess, SpotifyClient};
use crate::store::CredentialStore;
use crate::{se, Error, Result};

pub use crate::clock::ManualClock;

pub const PASSWORD: &str = "Passw0rd1";
const KEY: &[u8; 32] = b"01234567890123456789012345678901";

pub fn vault() -> Vault {
    match Vault::new(KEY) {
        Ok(v) => v,
        Err(e) => panic!("test key rejected: {}", e),
    }
}

pub fn spotify_settings() -> SpotifySettings {
    SpotifySettings {
        client_id: "client-id".into(),
        client_secret: "client-secret".into(),
        accounts_url: "https://accounts.example.test".into(),
        api_url: "https://api.example.test/v1".into(),
        redirect_url: "http://localhost:3030/api/spotify/callback".into(),
        timeout: Duration::from_secs(5),
    }
}

/// Insert `name` with password `PASSWORD` and email `<name>@example.com`
pub async fn insert_user(store: &dyn CredentialStore, name: &str) -> User {
    let password_hash = match crypto::hash_password(PASSWORD) {
        Ok(h) => h,
        Err(e) => panic!("hash error {}", e),
    };
    match store
        .insert_user(NewUser {
            username: name.to_string(),
            email: format!("{}@example.com", name),
            password_hash,
        })
        .await
    {
        Ok(u) => u,
        Err(e) => panic!("insert user error {}", e),
    }
}

/// Store an encrypted spotify link for `user_id`
pub async fn link_user(
    store: &dyn CredentialStore,
    user_id: i64,
    access_token: &str,
    refresh_token: &str,
    expiration: DateTime<Utc>,
) -> SpotifyLink {
    let tokens = match crate::oauth::seal_tokens(&vault(), access_token, refresh_token, expiration) {
        Ok(t) => t,
        Err(e) => panic!("seal error {}", e),
    };
    match store.upsert_link(user_id, tokens).await {
        Ok(l) => l,
        Err(e) => panic!("upsert link error {}", e),
    }
}

/// A playlist edit sent to the fake
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    pub method: String,
    pub path: String,
    pub access_token: String,
    pub body: serde_json::Value,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted stand-in for the spotify accounts and web api.
///
/// Every grant hands out a fresh `access-N` token. Refreshes keep the
/// refresh token unless `rotate_refresh_tokens` is set.
#[derive(Default)]
pub struct FakeSpotify {
    exchanges: AtomicUsize,
    refreshes: AtomicUsize,
    issued: AtomicUsize,
    fail_exchange: AtomicBool,
    fail_refresh: AtomicBool,
    omit_refresh_token: AtomicBool,
    rotate: AtomicBool,
    last_access: Mutex<String>,
    refreshed_with: Mutex<Vec<String>>,
    requests: Mutex<Vec<(String, String)>>,
    edits: Mutex<Vec<Edit>>,
    responses: Mutex<HashMap<String, ApiResponse>>,
}

impl FakeSpotify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn fail_next_exchange(&self) {
        self.fail_exchange.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_refresh(&self) {
        self.fail_refresh.store(true, Ordering::SeqCst);
    }

    /// Code exchanges respond without a refresh token
    pub fn omit_refresh_token(&self) {
        self.omit_refresh_token.store(true, Ordering::SeqCst);
    }

    pub fn rotate_refresh_tokens(&self) {
        self.rotate.store(true, Ordering::SeqCst);
    }

    /// Most recently granted access token
    pub fn last_access_token(&self) -> String {
        lock(&self.last_access).clone()
    }

    /// Refresh tokens presented, in order
    pub fn refreshed_with(&self) -> Vec<String> {
        lock(&self.refreshed_with).clone()
    }

    /// `(path, access token)` of every api call, in order
    pub fn requests(&self) -> Vec<(String, String)> {
        lock(&self.requests).clone()
    }

    /// Every `send`, in order
    pub fn edits(&self) -> Vec<Edit> {
        lock(&self.edits).clone()
    }

    /// Script the reply to `method` on `path`. `respond` scripts GETs.
    pub fn respond_to(&self, method: Method, path: &str, status: u16, body: &str) {
        self.respond(&format!("{} {}", method, path), status, body);
    }

    pub fn respond(&self, path: &str, status: u16, body: &str) {
        lock(&self.responses).insert(
            path.to_string(),
            ApiResponse {
                status,
                body: body.as_bytes().to_vec(),
            },
        );
    }

    fn scripted(&self, key: &str) -> ApiResponse {
        lock(&self.responses)
            .get(key)
            .cloned()
            .unwrap_or(ApiResponse {
                status: 404,
                body: br#"{"error":{"status":404,"message":"Not found."}}"#.to_vec(),
            })
    }

    fn grant(&self, refresh_token: Option<String>) -> SpotifyAccess {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let access_token = format!("access-{}", n);
        *lock(&self.last_access) = access_token.clone();
        SpotifyAccess {
            access_token,
            token_type: Some("Bearer".into()),
            scope: Some(crate::spotify::SCOPES.join(" ")),
            expires_in: Some(3600),
            refresh_token,
        }
    }
}

#[async_trait::async_trait]
impl SpotifyClient for FakeSpotify {
    async fn exchange_code(&self, code: &str) -> Result<SpotifyAccess> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if self.fail_exchange.swap(false, Ordering::SeqCst) {
            return Err(Error::Upstream(se!("400: invalid_grant for code {}", code)));
        }
        let refresh = if self.omit_refresh_token.load(Ordering::SeqCst) {
            None
        } else {
            Some(format!("refresh-for-{}", code))
        };
        Ok(self.grant(refresh))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<SpotifyAccess> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        lock(&self.refreshed_with).push(refresh_token.to_string());
        if self.fail_refresh.swap(false, Ordering::SeqCst) {
            return Err(Error::Upstream(se!("400: invalid refresh token")));
        }
        let rotated = if self.rotate.load(Ordering::SeqCst) {
            Some(format!("{}-r", refresh_token))
        } else {
            None
        };
        Ok(self.grant(rotated))
    }

    async fn get(&self, path: &str, access_token: &str) -> Result<ApiResponse> {
        lock(&self.requests).push((path.to_string(), access_token.to_string()));
        Ok(self.scripted(path))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        access_token: &str,
        body: serde_json::Value,
    ) -> Result<ApiResponse> {
        lock(&self.edits).push(Edit {
            method: method.to_string(),
            path: path.to_string(),
            access_token: access_token.to_string(),
            body,
        });
        Ok(self.scripted(&format!("{} {}", method, path)))
    }
}
