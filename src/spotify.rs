use std::future::Future;

use crate::config::SpotifySettings;
use crate::{se, Error, Result, LOG};

pub use surf::http::Method;

/// Scopes requested when linking an account
pub const SCOPES: &[&str] = &[
    "playlist-read-private",
    "playlist-read-collaborative",
    "playlist-modify-public",
    "playlist-modify-private",
    "user-library-read",
    "user-library-modify",
];

/// Ask for a refresh token alongside the access token
const ACCESS_TYPE: &str = "offline";

/// Token endpoint payload for both the code exchange and refresh grants.
/// Spotify omits `refresh_token` on refresh when it doesn't rotate it.
#[derive(serde::Deserialize, Debug, Clone)]
pub struct SpotifyAccess {
    pub access_token: String,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
}

/// Raw response from the web api, passed through to our clients
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(serde::Serialize)]
struct SpotifyAccessParams<'a> {
    grant_type: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
}

#[derive(serde::Serialize)]
struct RefreshParams<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[async_trait::async_trait]
pub trait SpotifyClient: Send + Sync {
    /// Trade a one-time authorization `code` for access and refresh tokens
    async fn exchange_code(&self, code: &str) -> Result<SpotifyAccess>;

    /// `grant_type=refresh_token`
    async fn refresh(&self, refresh_token: &str) -> Result<SpotifyAccess>;

    /// GET `path` (relative to the web api root) as the owner of `access_token`
    async fn get(&self, path: &str, access_token: &str) -> Result<ApiResponse>;

    /// Send a json `body` to `path` with `method`, for playlist edits
    async fn send(
        &self,
        method: Method,
        path: &str,
        access_token: &str,
        body: serde_json::Value,
    ) -> Result<ApiResponse>;
}

/// The spotify authorization page we send the browser to
pub fn authorize_url(settings: &SpotifySettings, state: &str) -> Result<String> {
    let scope = SCOPES.join(" ");
    let url = surf::Url::parse_with_params(
        &format!("{}/authorize", settings.accounts_url),
        &[
            ("response_type", "code"),
            ("client_id", settings.client_id.as_str()),
            ("scope", scope.as_str()),
            ("redirect_uri", settings.redirect_url.as_str()),
            ("state", state),
            ("access_type", ACCESS_TYPE),
        ],
    )
    .map_err(|e| Error::Configuration(se!("invalid spotify accounts url {}", e)))?;
    Ok(url.to_string())
}

/// surf backed client. Every call is bounded by `settings.timeout`.
pub struct SurfSpotify {
    client: surf::Client,
    settings: SpotifySettings,
}

impl SurfSpotify {
    pub fn new(settings: SpotifySettings) -> Self {
        Self {
            client: surf::Client::new(),
            settings,
        }
    }

    fn basic_auth(&self) -> String {
        let auth = base64::encode(
            format!("{}:{}", self.settings.client_id, self.settings.client_secret).as_bytes(),
        );
        format!("Basic {}", auth)
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        async_std::future::timeout(self.settings.timeout, fut)
            .await
            .map_err(|_| {
                Error::Upstream(se!(
                    "{} timed out after {:?}",
                    what,
                    self.settings.timeout
                ))
            })?
    }

    async fn api_request(
        &self,
        method: Method,
        path: &str,
        access_token: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse> {
        let url = format!("{}{}", self.settings.api_url, path);
        self.bounded("api request", async {
            let mut req = self
                .client
                .request(method, &url)
                .header("authorization", format!("Bearer {}", access_token))
                .header("accept", "application/json");
            if let Some(body) = body {
                let body = surf::Body::from_json(&body)
                    .map_err(|e| Error::Upstream(se!("api body error {} {}", url, e)))?;
                req = req.body(body);
            }
            let mut resp = req
                .send()
                .await
                .map_err(|e| Error::Upstream(se!("api request error {} {} {}", method, url, e)))?;
            let status = resp.status() as u16;
            let body = resp
                .body_bytes()
                .await
                .map_err(|e| Error::Upstream(se!("api response read error {} {}", url, e)))?;
            Ok::<_, Error>(ApiResponse { status, body })
        })
        .await
    }

    async fn token_request<P: serde::Serialize>(&self, params: &P) -> Result<SpotifyAccess> {
        let body = surf::Body::from_form(params)
            .map_err(|e| Error::Upstream(se!("form error {}", e)))?;
        let mut resp = self
            .client
            .post(format!("{}/api/token", self.settings.accounts_url))
            .body(body)
            .header("authorization", self.basic_auth())
            .send()
            .await
            .map_err(|e| Error::Upstream(se!("account request error {}", e)))?;
        let status = resp.status();
        let text = resp
            .body_string()
            .await
            .map_err(|e| Error::Upstream(se!("account response read error {}", e)))?;
        if status != surf::StatusCode::Ok {
            return Err(Error::Upstream(se!("{}: {}", status as u16, text)));
        }
        serde_json::from_str::<SpotifyAccess>(&text)
            .map_err(|e| Error::Upstream(se!("account json parse error {}", e)))
    }
}

#[async_trait::async_trait]
impl SpotifyClient for SurfSpotify {
    async fn exchange_code(&self, code: &str) -> Result<SpotifyAccess> {
        let params = SpotifyAccessParams {
            grant_type: "authorization_code",
            code,
            redirect_uri: &self.settings.redirect_url,
        };
        self.bounded("code exchange", self.token_request(&params))
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<SpotifyAccess> {
        let params = RefreshParams {
            grant_type: "refresh_token",
            refresh_token,
        };
        let access = self
            .bounded("token refresh", self.token_request(&params))
            .await?;
        slog::debug!(
            LOG, "refreshed spotify access token";
            "expires_in" => access.expires_in,
            "rotated_refresh_token" => access.refresh_token.is_some(),
        );
        Ok(access)
    }

    async fn get(&self, path: &str, access_token: &str) -> Result<ApiResponse> {
        self.api_request(Method::Get, path, access_token, None).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        access_token: &str,
        body: serde_json::Value,
    ) -> Result<ApiResponse> {
        self.api_request(method, path, access_token, Some(body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> SpotifySettings {
        SpotifySettings {
            client_id: "client-id".into(),
            client_secret: "secret".into(),
            accounts_url: "https://accounts.spotify.com".into(),
            api_url: "https://api.spotify.com/v1".into(),
            redirect_url: "http://localhost:3030/api/spotify/callback".into(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn authorize_url_carries_every_parameter() {
        let url = authorize_url(&settings(), "0123456789abcdef").unwrap();
        let parsed = surf::Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/authorize");
        let pairs: std::collections::HashMap<String, String> =
            parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client-id");
        assert_eq!(pairs["scope"], SCOPES.join(" "));
        assert_eq!(
            pairs["redirect_uri"],
            "http://localhost:3030/api/spotify/callback"
        );
        assert_eq!(pairs["state"], "0123456789abcdef");
        assert_eq!(pairs["access_type"], "offline");
    }

    #[test]
    fn refresh_payload_may_omit_refresh_token() {
        let access: SpotifyAccess = serde_json::from_str(
            r#"{"access_token":"a","token_type":"Bearer","expires_in":3600,"scope":"x"}"#,
        )
        .unwrap();
        assert_eq!(access.access_token, "a");
        assert!(access.refresh_token.is_none());
    }
}
