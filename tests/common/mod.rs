#![allow(dead_code)]

use chrono::Duration;
use std::sync::Arc;
use tide::http::{Method, Request, Response, Url};

use groove::clock::Clock;
use groove::config::{CookieSettings, SameSite};
use groove::service::{self, Context, Settings};
use groove::store::MemoryStore;
use groove::testing::{self, FakeSpotify, ManualClock};

pub const FRONTEND: &str = "http://localhost:5173";

/// The groove app wired to in-process fakes
pub struct Harness {
    pub app: tide::Server<Context>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub spotify: Arc<FakeSpotify>,
    pub default_user: i64,
}

/// Cookies a browser would hold after signing in
#[derive(Debug, Clone)]
pub struct Browser {
    pub bearer: String,
    pub csrf: String,
}

pub struct Reply {
    pub status: u16,
    pub set_cookies: Vec<String>,
    pub location: Option<String>,
    pub body: String,
}

impl Reply {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }

    pub fn message(&self) -> String {
        self.json()["message"].as_str().unwrap().to_string()
    }

    /// Value set for cookie `name`, if this reply set it
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.set_cookies.iter().find_map(|c| {
            let pair = c.split(';').next()?;
            let mut kv = pair.splitn(2, '=');
            if kv.next()? == name {
                kv.next().map(|v| v.to_string())
            } else {
                None
            }
        })
    }

    pub fn set_cookie_line(&self, name: &str) -> Option<&String> {
        self.set_cookies
            .iter()
            .find(|c| c.starts_with(&format!("{}=", name)))
    }

    /// Both session cookies were expired by this reply
    pub fn cleared_session(&self) -> bool {
        self.cookie("Authorization").as_deref() == Some("")
            && self.cookie("Csrf").as_deref() == Some("")
    }

    pub fn browser(&self) -> Browser {
        Browser {
            bearer: self.cookie("Authorization").unwrap(),
            csrf: self.cookie("Csrf").unwrap(),
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let spotify = Arc::new(FakeSpotify::new());
        let default_user = testing::insert_user(store.as_ref(), "groove").await.id;
        testing::link_user(
            store.as_ref(),
            default_user,
            "default-access",
            "default-refresh",
            clock.now() + Duration::minutes(58),
        )
        .await;
        let settings = Settings {
            cookies: CookieSettings {
                secure: false,
                same_site: SameSite::Lax,
            },
            spotify: testing::spotify_settings(),
            frontend_url: FRONTEND.to_string(),
            default_link_user_id: default_user,
        };
        let ctx = Context::new(
            store.clone(),
            clock.clone(),
            spotify.clone(),
            testing::vault(),
            settings,
        );
        ctx.tokens().ensure_default_link().await.unwrap();
        Self {
            app: service::build_app(ctx),
            store,
            clock,
            spotify,
            default_user,
        }
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        browser: Option<&Browser>,
        body: Option<serde_json::Value>,
    ) -> Reply {
        let url = Url::parse(&format!("http://localhost:3030{}", path)).unwrap();
        let mut req = Request::new(method, url);
        if let Some(b) = browser {
            req.insert_header(
                "cookie",
                format!("Authorization={}; Csrf={}", b.bearer, b.csrf),
            );
        }
        if let Some(body) = body {
            req.set_body(body);
        }
        let mut res: Response = self.app.respond(req).await.unwrap();
        let set_cookies: Vec<String> = res
            .header("set-cookie")
            .map(|values| values.iter().map(|v| v.as_str().to_string()).collect())
            .unwrap_or_default();
        let location = res.header("location").map(|v| v.last().as_str().to_string());
        let body = res.body_string().await.unwrap();
        Reply {
            status: res.status() as u16,
            set_cookies,
            location,
            body,
        }
    }

    pub async fn get(&self, path: &str, browser: Option<&Browser>) -> Reply {
        self.send(Method::Get, path, browser, None).await
    }

    /// POST with `csrf_` filled in from the browser's cookie
    pub async fn post_with_csrf(&self, path: &str, browser: &Browser) -> Reply {
        self.with_csrf(Method::Post, path, browser).await
    }

    pub async fn with_csrf(&self, method: Method, path: &str, browser: &Browser) -> Reply {
        let body = serde_json::json!({ "csrf_": browser.csrf });
        self.send(method, path, Some(browser), Some(body)).await
    }

    pub async fn register(&self, username: &str) -> Browser {
        let reply = self
            .send(
                Method::Post,
                "/api/register",
                None,
                Some(serde_json::json!({
                    "username": username,
                    "email": format!("{}@example.com", username),
                    "password": testing::PASSWORD,
                })),
            )
            .await;
        assert_eq!(reply.status, 201, "register failed: {}", reply.body);
        reply.browser()
    }

    /// Run the whole link dance for a signed in browser
    pub async fn link(&self, browser: &Browser) {
        let reply = self.post_with_csrf("/api/spotify/link", browser).await;
        assert_eq!(reply.status, 200, "link failed: {}", reply.body);
        let state = state_param(&reply.body);
        let reply = self
            .get(
                &format!("/api/spotify/callback?code=abc&state={}", state),
                Some(browser),
            )
            .await;
        assert_eq!(reply.status, 302, "callback failed: {}", reply.body);
    }
}

pub fn state_param(authorize_url: &str) -> String {
    Url::parse(authorize_url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}
