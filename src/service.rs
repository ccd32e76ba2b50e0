use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::accounts::Accounts;
use crate::clock::Clock;
use crate::config::{Config, CookieSettings, SpotifySettings};
use crate::cookies;
use crate::crypto::Vault;
use crate::csrf::CsrfGuard;
use crate::models::Session;
use crate::oauth::OAuthLinkFlow;
use crate::pipeline::AuthPipeline;
use crate::session::SessionManager;
use crate::spotify::{ApiResponse, Method, SpotifyClient};
use crate::store::CredentialStore;
use crate::tokens::TokenRefreshManager;
use crate::{resp, se, Denial, Error, LOG};

/// What the http layer needs beyond the injected services
#[derive(Debug, Clone)]
pub struct Settings {
    pub cookies: CookieSettings,
    pub spotify: SpotifySettings,
    pub frontend_url: String,
    pub default_link_user_id: i64,
}

impl Settings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let default_link_user_id = config
            .default_link_user_id
            .ok_or_else(|| anyhow::anyhow!("DEFAULT_LINK_USER_ID is not set"))?;
        Ok(Self {
            cookies: config.cookies(),
            spotify: config.spotify(),
            frontend_url: config.frontend_url.trim_end_matches('/').to_string(),
            default_link_user_id,
        })
    }
}

#[derive(Clone)]
pub struct Context {
    accounts: Arc<Accounts>,
    pipeline: Arc<AuthPipeline>,
    spotify: Arc<dyn SpotifyClient>,
    clock: Arc<dyn Clock>,
    cookies: CookieSettings,
    frontend_url: String,
}

impl Context {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        spotify: Arc<dyn SpotifyClient>,
        vault: Vault,
        settings: Settings,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            clock.clone(),
            vault.clone(),
        ));
        let oauth = Arc::new(OAuthLinkFlow::new(
            store.clone(),
            clock.clone(),
            spotify.clone(),
            vault.clone(),
            settings.spotify,
        ));
        let tokens = Arc::new(TokenRefreshManager::new(
            store.clone(),
            clock.clone(),
            spotify.clone(),
            vault,
            settings.default_link_user_id,
        ));
        let pipeline = Arc::new(AuthPipeline::new(
            sessions.clone(),
            CsrfGuard::new(),
            oauth,
            tokens,
        ));
        Self {
            accounts: Arc::new(Accounts::new(store, sessions)),
            pipeline,
            spotify,
            clock,
            cookies: settings.cookies,
            frontend_url: settings.frontend_url,
        }
    }

    pub fn tokens(&self) -> &TokenRefreshManager {
        self.pipeline.tokens()
    }

    fn set_session_cookies(
        &self,
        resp: &mut tide::Response,
        bearer: &str,
        csrf: &str,
        expires: DateTime<Utc>,
    ) {
        for c in cookies::session_cookies(bearer, csrf, expires, &self.cookies).iter() {
            resp.append_header("set-cookie", c.as_str());
        }
    }

    fn clear_session_cookies(&self, resp: &mut tide::Response) {
        for c in cookies::clear_session_cookies(self.clock.now(), &self.cookies).iter() {
            resp.append_header("set-cookie", c.as_str());
        }
    }

    /// A dead session was presented to register or login. Unless the
    /// response issues fresh cookies, expire the stale pair.
    fn forget_stale_session(
        &self,
        stale: Option<Denial>,
        mut resp: tide::Response,
    ) -> tide::Response {
        if let Some(denial) = stale {
            if resp.status() != tide::StatusCode::Created {
                slog::debug!(LOG, "clearing stale session cookies"; "reason" => denial.to_string());
                self.clear_session_cookies(&mut resp);
            }
        }
        resp
    }

    /// Map a failed operation to its response
    fn error_response(&self, err: Error) -> tide::Response {
        let status = err.status();
        if status >= 500 {
            slog::error!(LOG, "request error"; "status" => status, "error" => err.to_string());
        }
        let mut resp = if status == 308 {
            resp!(status => 308)
        } else {
            resp!(status => status, message => err.public_message())
        };
        if err.clears_session() {
            self.clear_session_cookies(&mut resp);
        }
        resp
    }
}

/// Unwrap an operation's result or return its error response
macro_rules! or_respond {
    ($ctx:expr, $e:expr) => {{
        match $e {
            Ok(v) => v,
            Err(err) => return Ok($ctx.error_response(err)),
        }
    }};
}

type Request = tide::Request<Context>;

pub fn build_app(ctx: Context) -> tide::Server<Context> {
    let mut app = tide::with_state(ctx);
    app.with(crate::logging::LogMiddleware::new());
    app.at("/api/health").get(health);
    app.at("/api/register").post(register);
    app.at("/api/login").post(login);
    app.at("/api/logout").post(logout);
    app.at("/api/authenticate").post(authenticate);
    app.at("/api/spotify/link").post(link);
    app.at("/api/spotify/callback").get(callback);
    app.at("/api/spotify/unlink").post(unlink);
    app.at("/api/spotify/me").get(me);
    app.at("/api/spotify/albums/:id").get(album);
    app.at("/api/spotify/albums/:id/tracks").get(album_tracks);
    app.at("/api/spotify/artists/:id").get(artist);
    app.at("/api/spotify/artists/:id/related-artists").get(related_artists);
    app.at("/api/spotify/artists/:id/top-tracks").get(artist_top_tracks);
    app.at("/api/spotify/artists/:id/albums").get(artist_albums);
    app.at("/api/spotify/tracks/:id").get(track);
    app.at("/api/spotify/search/:query").get(search);
    app.at("/api/spotify/playlists").get(playlists);
    app.at("/api/spotify/playlists/:id").get(playlist);
    app.at("/api/spotify/playlists/:id/load-more").get(more_playlist_tracks);
    app.at("/api/spotify/playlists/:id/track")
        .post(add_playlist_track)
        .delete(remove_playlist_track);
    app
}

pub async fn start(ctx: Context, listen_addr: String) -> anyhow::Result<()> {
    let app = build_app(ctx);
    slog::info!(LOG, "running at {}", listen_addr);
    app.listen(listen_addr).await?;
    Ok(())
}

fn bearer(req: &Request) -> Option<String> {
    req.cookie(cookies::AUTHORIZATION)
        .map(|c| c.value().to_string())
}

#[derive(serde::Deserialize)]
struct CsrfBody {
    csrf_: Option<String>,
}

/// The submitted csrf token. An absent or unreadable body counts as no token.
async fn submitted_csrf(req: &mut Request) -> Option<String> {
    req.body_json::<CsrfBody>()
        .await
        .ok()
        .and_then(|b| b.csrf_)
}

async fn health(_req: Request) -> tide::Result {
    Ok(tide::Response::builder(200).body("OK").build())
}

#[derive(serde::Deserialize)]
struct RegisterBody {
    username: String,
    email: String,
    password: String,
}

async fn register(mut req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let stale = or_respond!(
        ctx,
        ctx.pipeline.redirect_authorized(bearer(&req).as_deref()).await
    );
    let resp = create_account(&ctx, &mut req).await?;
    Ok(ctx.forget_stale_session(stale, resp))
}

async fn create_account(ctx: &Context, req: &mut Request) -> tide::Result {
    let body: RegisterBody = match req.body_json().await {
        Ok(b) => b,
        Err(_) => return Ok(resp!(status => 400, message => "invalid request body")),
    };
    let signed = or_respond!(
        ctx,
        ctx.accounts
            .register(&body.username, &body.email, &body.password)
            .await
    );
    let mut resp = resp!(status => 201, json => serde_json::json!({
        "acknowledged": true,
        "message": se!("user {} created", signed.profile.username),
        "user": &signed.profile,
    }));
    let issued = &signed.issued;
    ctx.set_session_cookies(&mut resp, &issued.bearer, &issued.csrf, issued.expires_at);
    Ok(resp)
}

#[derive(serde::Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(mut req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let stale = or_respond!(
        ctx,
        ctx.pipeline.redirect_authorized(bearer(&req).as_deref()).await
    );
    let resp = sign_in(&ctx, &mut req).await?;
    Ok(ctx.forget_stale_session(stale, resp))
}

async fn sign_in(ctx: &Context, req: &mut Request) -> tide::Result {
    let body: LoginBody = match req.body_json().await {
        Ok(b) => b,
        Err(_) => return Ok(resp!(status => 400, message => "invalid request body")),
    };
    let signed = or_respond!(ctx, ctx.accounts.login(&body.username, &body.password).await);
    let mut resp = resp!(status => 201, json => serde_json::json!({
        "acknowledged": true,
        "user": &signed.profile,
    }));
    let issued = &signed.issued;
    ctx.set_session_cookies(&mut resp, &issued.bearer, &issued.csrf, issued.expires_at);
    Ok(resp)
}

async fn logout(mut req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let bearer = bearer(&req);
    let csrf = submitted_csrf(&mut req).await;
    let session = or_respond!(
        ctx,
        ctx.pipeline
            .authorize_mutation(bearer.as_deref(), csrf.as_deref(), "logout")
            .await
    );
    ctx.accounts.logout(&session).await;
    let mut resp = resp!(status => 204);
    ctx.clear_session_cookies(&mut resp);
    Ok(resp)
}

/// Heartbeat. Renews the session and re-issues both cookies
/// with their existing values.
async fn authenticate(mut req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let bearer = bearer(&req);
    let csrf = submitted_csrf(&mut req).await;
    let session = or_respond!(
        ctx,
        ctx.pipeline
            .authorize_mutation(bearer.as_deref(), csrf.as_deref(), "authenticate")
            .await
    );
    let csrf_token = session.csrf_token.clone();
    let renewed = or_respond!(ctx, ctx.accounts.authenticate(session).await);
    let mut resp = resp!(json => serde_json::json!({ "user": &renewed.profile }));
    ctx.set_session_cookies(
        &mut resp,
        bearer.as_deref().unwrap_or_default(),
        &csrf_token,
        renewed.expires_at,
    );
    Ok(resp)
}

async fn link(mut req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let bearer = bearer(&req);
    let csrf = submitted_csrf(&mut req).await;
    let session = or_respond!(
        ctx,
        ctx.pipeline
            .authorize_mutation(bearer.as_deref(), csrf.as_deref(), "spotify_link")
            .await
    );
    or_respond!(ctx, ctx.pipeline.require_unlinked(&session).await);
    let url = or_respond!(ctx, ctx.pipeline.oauth().initiate(session.user_id).await);
    Ok(tide::Response::builder(200).body(url).build())
}

#[derive(serde::Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
}

/// Spotify sends the browser back here after the user approves (or
/// declines) the link. `state` is checked against the one we issued.
async fn callback(req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let session = or_respond!(ctx, ctx.pipeline.authorize(bearer(&req).as_deref()).await);
    let params: CallbackParams = match req.query() {
        Ok(p) => p,
        Err(_) => return Ok(resp!(status => 400, message => "invalid query parameters")),
    };
    let (code, state) = match (params.code, params.state) {
        (Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => (code, state),
        _ => return Ok(resp!(status => 400, message => "missing code or state")),
    };
    or_respond!(
        ctx,
        ctx.pipeline
            .oauth()
            .complete(session.user_id, &code, &state)
            .await
    );
    Ok(tide::Redirect::new(format!("{}/dashboard/profile", ctx.frontend_url)).into())
}

async fn unlink(mut req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let bearer = bearer(&req);
    let csrf = submitted_csrf(&mut req).await;
    let session = or_respond!(
        ctx,
        ctx.pipeline
            .authorize_mutation(bearer.as_deref(), csrf.as_deref(), "spotify_unlink")
            .await
    );
    or_respond!(ctx, ctx.pipeline.oauth().unlink(session.user_id).await);
    Ok(resp!(status => 204))
}

fn passthrough(api: ApiResponse) -> tide::Response {
    tide::Response::builder(200)
        .body(tide::Body::from_bytes(api.body))
        .content_type(tide::http::mime::JSON)
        .build()
}

async fn me(req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let session = or_respond!(ctx, ctx.pipeline.authorize(bearer(&req).as_deref()).await);
    or_respond!(ctx, ctx.pipeline.require_linked(&session).await);
    let token = or_respond!(ctx, ctx.pipeline.access_token(&session).await);
    let api = or_respond!(ctx, ctx.spotify.get("/me", &token).await);
    if api.status != 200 {
        return Ok(ctx.error_response(Error::Upstream(se!(
            "/me responded {}: {}",
            api.status,
            String::from_utf8_lossy(&api.body)
        ))));
    }
    Ok(passthrough(api))
}

async fn album(req: Request) -> tide::Result {
    catalog(req, "album", "?market=US").await
}

async fn album_tracks(req: Request) -> tide::Result {
    catalog(req, "album", "/tracks?limit=50&market=US").await
}

async fn artist(req: Request) -> tide::Result {
    catalog(req, "artist", "?market=US").await
}

async fn related_artists(req: Request) -> tide::Result {
    catalog(req, "artist", "/related-artists").await
}

async fn artist_top_tracks(req: Request) -> tide::Result {
    catalog(req, "artist", "/top-tracks?market=US").await
}

async fn artist_albums(req: Request) -> tide::Result {
    catalog(req, "artist", "/albums?market=US&limit=50&include_groups=album").await
}

async fn track(req: Request) -> tide::Result {
    catalog(req, "track", "?market=US").await
}

/// spotify ids are base62
fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Map a spotify lookup of a `kind` resource to our response
fn lookup_response(ctx: &Context, kind: &str, path: &str, api: ApiResponse) -> tide::Response {
    let err = match api.status {
        200 => return passthrough(api),
        400 => Error::Validation(se!("invalid {}-id", kind)),
        404 => Error::NotFound(se!("{} not found", kind)),
        other => Error::Upstream(se!(
            "{} responded {}: {}",
            path,
            other,
            String::from_utf8_lossy(&api.body)
        )),
    };
    ctx.error_response(err)
}

/// Public catalog lookups. Unlinked users browse with the default link.
async fn catalog(req: Request, kind: &str, resource: &str) -> tide::Result {
    let ctx = req.state().clone();
    let session = or_respond!(ctx, ctx.pipeline.authorize(bearer(&req).as_deref()).await);
    let id = req.param("id").unwrap_or_default();
    if !valid_id(id) {
        return Ok(ctx.error_response(Error::Validation(se!("invalid {}-id", kind))));
    }
    let token = or_respond!(ctx, ctx.pipeline.access_token(&session).await);
    let path = format!("/{}s/{}{}", kind, id, resource);
    let api = or_respond!(ctx, ctx.spotify.get(&path, &token).await);
    Ok(lookup_response(&ctx, kind, &path, api))
}

#[derive(serde::Deserialize)]
struct SearchParams {
    #[serde(rename = "type")]
    kinds: Option<String>,
    market: Option<String>,
    limit: Option<u32>,
}

async fn search(req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let session = or_respond!(ctx, ctx.pipeline.authorize(bearer(&req).as_deref()).await);
    let query = req.param("query").unwrap_or_default().to_string();
    let params: SearchParams = match req.query() {
        Ok(p) => p,
        Err(_) => return Ok(resp!(status => 400, message => "invalid search")),
    };
    let kinds = match params.kinds {
        Some(k) if !k.is_empty() => k,
        _ => return Ok(resp!(status => 400, message => "type is required")),
    };
    let market = params.market.unwrap_or_else(|| "US".to_string());
    let limit = params.limit.unwrap_or(18).to_string();
    let url = or_respond!(
        ctx,
        surf::Url::parse_with_params(
            "https://api.spotify.com/search",
            &[
                ("q", query.as_str()),
                ("type", kinds.as_str()),
                ("market", market.as_str()),
                ("limit", limit.as_str()),
            ],
        )
        .map_err(|e| Error::Validation(se!("invalid search {}", e)))
    );
    let path = format!("/search?{}", url.query().unwrap_or_default());

    let token = or_respond!(ctx, ctx.pipeline.access_token(&session).await);
    let api = or_respond!(ctx, ctx.spotify.get(&path, &token).await);
    let err = match api.status {
        200 => return Ok(passthrough(api)),
        400 => Error::Validation(se!("invalid search")),
        other => Error::Upstream(se!(
            "{} responded {}: {}",
            path,
            other,
            String::from_utf8_lossy(&api.body)
        )),
    };
    Ok(ctx.error_response(err))
}

/// Playlists belong to the user, so these require their own link
async fn linked_access(ctx: &Context, session: &Session) -> crate::Result<String> {
    ctx.pipeline.require_linked(session).await?;
    ctx.pipeline.access_token(session).await
}

async fn playlists(req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let session = or_respond!(ctx, ctx.pipeline.authorize(bearer(&req).as_deref()).await);
    let token = or_respond!(ctx, linked_access(&ctx, &session).await);
    let path = "/me/playlists?limit=50";
    let api = or_respond!(ctx, ctx.spotify.get(path, &token).await);
    Ok(lookup_response(&ctx, "playlist", path, api))
}

async fn playlist(req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let session = or_respond!(ctx, ctx.pipeline.authorize(bearer(&req).as_deref()).await);
    let token = or_respond!(ctx, linked_access(&ctx, &session).await);
    let id = req.param("id").unwrap_or_default();
    if !valid_id(id) {
        return Ok(ctx.error_response(Error::Validation(se!("invalid playlist-id"))));
    }
    let path = format!("/playlists/{}?market=US&limit=100", id);
    let api = or_respond!(ctx, ctx.spotify.get(&path, &token).await);
    Ok(lookup_response(&ctx, "playlist", &path, api))
}

#[derive(serde::Deserialize)]
struct PageParams {
    offset: Option<u32>,
}

/// The next hundred tracks of a playlist, starting at `?offset=`
async fn more_playlist_tracks(req: Request) -> tide::Result {
    let ctx = req.state().clone();
    let session = or_respond!(ctx, ctx.pipeline.authorize(bearer(&req).as_deref()).await);
    let token = or_respond!(ctx, linked_access(&ctx, &session).await);
    let id = req.param("id").unwrap_or_default();
    if !valid_id(id) {
        return Ok(ctx.error_response(Error::Validation(se!("invalid playlist-id"))));
    }
    let offset = match req.query::<PageParams>().ok().and_then(|p| p.offset) {
        Some(o) if o > 0 => o,
        _ => return Ok(resp!(status => 400, message => "invalid offset")),
    };
    let path = format!(
        "/playlists/{}/tracks?market=US&limit=100&offset={}",
        id, offset
    );
    let api = or_respond!(ctx, ctx.spotify.get(&path, &token).await);
    Ok(lookup_response(&ctx, "playlist", &path, api))
}

#[derive(serde::Deserialize)]
struct TrackParams {
    id: Option<String>,
}

async fn add_playlist_track(req: Request) -> tide::Result {
    edit_playlist(req, Method::Post).await
}

async fn remove_playlist_track(req: Request) -> tide::Result {
    edit_playlist(req, Method::Delete).await
}

/// Add (POST) or remove (DELETE) the `?id=` track. Runs the full guard
/// chain: session, csrf, link, then a possibly refreshed access token.
async fn edit_playlist(mut req: Request, method: Method) -> tide::Result {
    let ctx = req.state().clone();
    let bearer = bearer(&req);
    let csrf = submitted_csrf(&mut req).await;
    let (op, done, message) = match method {
        Method::Delete => ("playlist_remove_track", 200, "track removed from playlist"),
        _ => ("playlist_add_track", 201, "track added to playlist"),
    };
    let session = or_respond!(
        ctx,
        ctx.pipeline
            .authorize_mutation(bearer.as_deref(), csrf.as_deref(), op)
            .await
    );
    or_respond!(ctx, ctx.pipeline.require_linked(&session).await);

    let playlist_id = req.param("id").unwrap_or_default().to_string();
    if !valid_id(&playlist_id) {
        return Ok(ctx.error_response(Error::Validation(se!("invalid playlist-id"))));
    }
    let track_id = match req.query::<TrackParams>().ok().and_then(|p| p.id) {
        Some(id) if !id.is_empty() => id,
        _ => return Ok(resp!(status => 400, message => "track-id is required")),
    };
    if !valid_id(&track_id) {
        return Ok(ctx.error_response(Error::Validation(se!("invalid track-id"))));
    }

    let token = or_respond!(ctx, ctx.pipeline.access_token(&session).await);
    let uri = format!("spotify:track:{}", track_id);
    let body = match method {
        Method::Delete => serde_json::json!({ "tracks": [{ "uri": uri }] }),
        _ => serde_json::json!({ "uris": [uri] }),
    };
    let path = format!("/playlists/{}/tracks", playlist_id);
    let api = or_respond!(ctx, ctx.spotify.send(method, &path, &token, body).await);
    let err = match api.status {
        s if s == done => {
            return Ok(resp!(status => done, json => serde_json::json!({
                "acknowledged": true,
                "message": message,
            })))
        }
        400 => Error::Validation(se!("invalid track-id")),
        403 => Error::Validation(se!("playlist is not collaborative")),
        404 => Error::NotFound(se!("playlist not found")),
        other => Error::Upstream(se!(
            "{} {} responded {}: {}",
            method,
            path,
            other,
            String::from_utf8_lossy(&api.body)
        )),
    };
    Ok(ctx.error_response(err))
}
