/*!
Spotify access token upkeep.

Stored access tokens are handed out as-is until their recorded expiration.
Past that, the refresh token is traded for a new access token which is
written back before being returned.
*/
use std::sync::Arc;

use crate::clock::Clock;
use crate::crypto::{Enc, Vault};
use crate::models::SpotifyLink;
use crate::oauth::{access_token_lifetime, seal_tokens};
use crate::spotify::SpotifyClient;
use crate::store::CredentialStore;
use crate::{se, Error, Result, LOG};

pub struct TokenRefreshManager {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    spotify: Arc<dyn SpotifyClient>,
    vault: Vault,
    default_link_user_id: i64,
}

impl TokenRefreshManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        spotify: Arc<dyn SpotifyClient>,
        vault: Vault,
        default_link_user_id: i64,
    ) -> Self {
        Self {
            store,
            clock,
            spotify,
            vault,
            default_link_user_id,
        }
    }

    /// Fail fast at startup when the service level link is missing
    pub async fn ensure_default_link(&self) -> Result<()> {
        self.default_link().await.map(|_| ())
    }

    async fn default_link(&self) -> Result<SpotifyLink> {
        self.store
            .find_link_for_user(self.default_link_user_id)
            .await?
            .ok_or_else(|| {
                Error::Configuration(se!(
                    "default spotify link for user {} does not exist",
                    self.default_link_user_id
                ))
            })
    }

    pub async fn is_linked(&self, user_id: i64) -> Result<bool> {
        Ok(self.store.find_link_for_user(user_id).await?.is_some())
    }

    /// A usable access token for `user_id`, falling back to the default
    /// link when the user hasn't linked an account.
    pub async fn access_token(&self, user_id: i64) -> Result<String> {
        let link = match self.store.find_link_for_user(user_id).await? {
            Some(link) => link,
            None => {
                slog::debug!(LOG, "using default spotify link"; "user_id" => user_id);
                self.default_link().await?
            }
        };

        if link.access_token_expiration > self.clock.now() {
            return self.vault.decrypt(&Enc {
                value: link.access_token,
                nonce: link.access_nonce,
            });
        }
        self.refresh(link).await
    }

    /// The link row is only rewritten once spotify has answered, so a
    /// failed refresh leaves it as it was for the next request to retry.
    async fn refresh(&self, link: SpotifyLink) -> Result<String> {
        let refresh_token = self.vault.decrypt(&Enc {
            value: link.refresh_token.clone(),
            nonce: link.refresh_nonce.clone(),
        })?;
        let access = self.spotify.refresh(&refresh_token).await.map_err(|e| {
            slog::error!(
                LOG, "spotify token refresh failed";
                "user_id" => link.user_id,
                "link_id" => link.id,
                "error" => e.to_string(),
            );
            e
        })?;
        let refresh_token = access.refresh_token.as_deref().unwrap_or(&refresh_token);
        let tokens = seal_tokens(
            &self.vault,
            &access.access_token,
            refresh_token,
            self.clock.now() + access_token_lifetime(),
        )?;
        self.store.update_link_tokens(link.id, tokens).await?;
        slog::info!(
            LOG, "refreshed spotify access token";
            "user_id" => link.user_id,
            "link_id" => link.id,
        );
        Ok(access.access_token)
    }
}
