/*!
`Set-Cookie` values for the session cookie pair.

Browsers only drop a cookie when the clearing `Set-Cookie` carries the same
attributes it was created with, so issuing and clearing share one builder.
*/
use chrono::{DateTime, Duration, Utc};

use crate::config::CookieSettings;

pub const AUTHORIZATION: &str = "Authorization";
pub const CSRF: &str = "Csrf";

fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn cookie(
    name: &str,
    value: &str,
    expires: DateTime<Utc>,
    http_only: bool,
    settings: &CookieSettings,
) -> String {
    let mut s = format!(
        "{name}={value}; Path=/; Expires={expires}; SameSite={same_site}",
        name = name,
        value = value,
        expires = http_date(expires),
        same_site = settings.same_site,
    );
    if http_only {
        s.push_str("; HttpOnly");
    }
    if settings.secure {
        s.push_str("; Secure");
    }
    s
}

/// `Authorization` (script hidden) and `Csrf` (script readable) cookies
pub fn session_cookies(
    bearer: &str,
    csrf: &str,
    expires: DateTime<Utc>,
    settings: &CookieSettings,
) -> [String; 2] {
    [
        cookie(AUTHORIZATION, bearer, expires, true, settings),
        cookie(CSRF, csrf, expires, false, settings),
    ]
}

/// Expire both session cookies
pub fn clear_session_cookies(now: DateTime<Utc>, settings: &CookieSettings) -> [String; 2] {
    let past = now - Duration::hours(1);
    [
        cookie(AUTHORIZATION, "", past, true, settings),
        cookie(CSRF, "", past, false, settings),
    ]
}
