/*!
Spotify account linking.

Per user: no state -> state pending (`initiate`) -> state consumed
(`complete`) -> no state. Issuing a new state deletes the previous one,
so only the most recent link attempt can complete.
*/
use chrono::Duration;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::SpotifySettings;
use crate::crypto::{self, Vault};
use crate::models::{LinkTokens, NewOAuthState, SpotifyLink};
use crate::spotify::{self, SpotifyClient};
use crate::store::CredentialStore;
use crate::{se, Denial, Error, Result, LOG};

pub const STATE_LEN: usize = 16;

pub fn state_lifetime() -> Duration {
    Duration::minutes(30)
}

/// Spotify access tokens live for an hour, treat them as dead a
/// couple minutes early.
pub fn access_token_lifetime() -> Duration {
    Duration::minutes(58)
}

fn new_state() -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(STATE_LEN);
    s
}

/// Encrypt freshly granted tokens for storage
pub(crate) fn seal_tokens(
    vault: &Vault,
    access_token: &str,
    refresh_token: &str,
    expiration: chrono::DateTime<chrono::Utc>,
) -> Result<LinkTokens> {
    let access = vault.encrypt(access_token)?;
    let refresh = vault.encrypt(refresh_token)?;
    Ok(LinkTokens {
        access_token: access.value,
        access_nonce: access.nonce,
        refresh_token: refresh.value,
        refresh_nonce: refresh.nonce,
        access_token_expiration: expiration,
    })
}

pub struct OAuthLinkFlow {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    spotify: Arc<dyn SpotifyClient>,
    vault: Vault,
    settings: SpotifySettings,
}

impl OAuthLinkFlow {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        spotify: Arc<dyn SpotifyClient>,
        vault: Vault,
        settings: SpotifySettings,
    ) -> Self {
        Self {
            store,
            clock,
            spotify,
            vault,
            settings,
        }
    }

    /// Start a link attempt, returning the spotify authorization url
    /// the browser should be sent to.
    pub async fn initiate(&self, user_id: i64) -> Result<String> {
        // invalidate any previous state for this user
        self.store.delete_oauth_states_for_user(user_id).await?;

        let state = new_state();
        self.store
            .insert_oauth_state(NewOAuthState {
                user_id,
                state: state.clone(),
                expiration: self.clock.now() + state_lifetime(),
            })
            .await?;
        slog::info!(LOG, "issued spotify link state"; "user_id" => user_id);
        spotify::authorize_url(&self.settings, &state)
    }

    /// Finish a link attempt from spotify's redirect back to us.
    pub async fn complete(&self, user_id: i64, code: &str, state: &str) -> Result<SpotifyLink> {
        let stored = self
            .store
            .find_oauth_state_for_user(user_id)
            .await?
            .ok_or(Error::Unauthorized(Denial::NoState))?;

        if stored.expiration < self.clock.now() {
            return Err(Error::Unauthorized(Denial::StateExpired));
        }

        if !crypto::constant_time_eq(&stored.state, state) {
            slog::warn!(
                LOG, "potential csrf attempt: oauth state mismatch";
                "user_id" => user_id,
                "op" => "spotify_callback",
            );
            return Err(Error::Forbidden(Denial::StateMismatch));
        }

        // single use. If this fails the reaper removes it after expiry.
        if let Err(e) = self.store.delete_oauth_state(stored.id).await {
            slog::error!(
                LOG, "error deleting consumed oauth state, continuing";
                "user_id" => user_id,
                "error" => e.to_string(),
            );
        }

        let access = self.spotify.exchange_code(code).await.map_err(|e| {
            slog::error!(LOG, "spotify code exchange failed"; "user_id" => user_id, "error" => e.to_string());
            e
        })?;
        let refresh_token = access
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Upstream(se!("code exchange returned no refresh token")))?;
        let tokens = seal_tokens(
            &self.vault,
            &access.access_token,
            refresh_token,
            self.clock.now() + access_token_lifetime(),
        )?;
        let link = self.store.upsert_link(user_id, tokens).await?;
        slog::info!(LOG, "linked spotify account"; "user_id" => user_id, "link_id" => link.id);
        Ok(link)
    }

    pub async fn unlink(&self, user_id: i64) -> Result<()> {
        let link = self
            .store
            .find_link_for_user(user_id)
            .await?
            .ok_or(Error::Unauthorized(Denial::NotLinked))?;
        self.store.delete_link(link.id).await?;
        slog::info!(LOG, "unlinked spotify account"; "user_id" => user_id);
        Ok(())
    }

    pub async fn is_linked(&self, user_id: i64) -> Result<bool> {
        Ok(self.store.find_link_for_user(user_id).await?.is_some())
    }
}
