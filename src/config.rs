use anyhow::{anyhow, Context};
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use crate::LOG;

pub(crate) fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(k: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_or(k, default)
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow!("invalid {}: {}", k, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl FromStr for SameSite {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            other => Err(format!("unknown SameSite value {:?}", other)),
        }
    }
}

impl std::fmt::Display for SameSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        })
    }
}

/// Cookie attributes shared by every cookie the service sets
#[derive(Debug, Clone, Copy)]
pub struct CookieSettings {
    pub secure: bool,
    pub same_site: SameSite,
}

/// Where and how to talk to spotify
#[derive(Debug, Clone)]
pub struct SpotifySettings {
    pub client_id: String,
    pub client_secret: String,
    pub accounts_url: String,
    pub api_url: String,
    pub redirect_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub db_url: String,
    pub enc_key: String,
    pub spotify_client_id: String,
    pub spotify_secret_id: String,
    pub spotify_accounts_url: String,
    pub spotify_api_url: String,
    pub backend_url: String,
    pub frontend_url: String,
    pub cookie_secure: bool,
    pub cookie_same_site: SameSite,
    pub default_link_user_id: Option<i64>,
    pub http_timeout_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).map(|_| s.trim().to_string())
            })
            .unwrap_or_else(|_| Ok("unknown".to_string()))
            .context("error reading commit_hash.txt")?;
        let default_link_user_id = match env::var("DEFAULT_LINK_USER_ID") {
            Ok(v) if !v.trim().is_empty() => Some(
                v.trim()
                    .parse()
                    .map_err(|e| anyhow!("invalid DEFAULT_LINK_USER_ID: {}", e))?,
            ),
            _ => None,
        };
        let same_site: SameSite = env_or("COOKIE_SAME_SITE", "Lax")
            .parse()
            .map_err(|e| anyhow!("invalid COOKIE_SAME_SITE: {}", e))?;
        Ok(Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            port: env_parse("PORT", "3030")?,
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            db_url: env_or("DATABASE_URL", ""),
            enc_key: env_or("ENC_KEY", ""),
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", ""),
            spotify_secret_id: env_or("SPOTIFY_SECRET_ID", ""),
            spotify_accounts_url: env_or("SPOTIFY_ACCOUNTS_URL", "https://accounts.spotify.com"),
            spotify_api_url: env_or("SPOTIFY_API_URL", "https://api.spotify.com/v1"),
            backend_url: env_or("BACKEND_URL", ""),
            frontend_url: env_or("FRONTEND_URL", "http://localhost:5173"),
            cookie_secure: env_or("COOKIE_SECURE", "false") == "true",
            cookie_same_site: same_site,
            default_link_user_id,
            http_timeout_seconds: env_parse("HTTP_TIMEOUT_SECONDS", "10")?,
            reaper_interval_seconds: env_parse("REAPER_INTERVAL_SECONDS", "86400")?,
            shutdown_grace_seconds: env_parse("SHUTDOWN_GRACE_SECONDS", "30")?,
        })
    }

    /// Validate required settings and log the effective config.
    /// Secrets are never logged.
    pub fn initialize(&self) -> anyhow::Result<()> {
        let mut missing = vec![];
        for (name, value) in [
            ("DATABASE_URL", &self.db_url),
            ("ENC_KEY", &self.enc_key),
            ("SPOTIFY_CLIENT_ID", &self.spotify_client_id),
            ("SPOTIFY_SECRET_ID", &self.spotify_secret_id),
            ("BACKEND_URL", &self.backend_url),
        ] {
            if value.trim().is_empty() {
                missing.push(format!("{} is not set", name));
            }
        }
        if self.default_link_user_id.is_none() {
            missing.push("DEFAULT_LINK_USER_ID is not set".to_string());
        }
        if !missing.is_empty() {
            return Err(anyhow!("environment error(s): {}", missing.join(", ")));
        }
        if self.enc_key.as_bytes().len() != 32 {
            return Err(anyhow!("ENC_KEY must be exactly 32 bytes"));
        }
        if self.cookie_same_site == SameSite::None && !self.cookie_secure {
            slog::warn!(
                LOG,
                "COOKIE_SAME_SITE=None without COOKIE_SECURE=true will be rejected by browsers"
            );
        }
        slog::info!(
            LOG, "initialized config";
            "version" => &self.version,
            "ssl" => &self.ssl,
            "host" => &self.host,
            "port" => &self.port,
            "log_format" => &self.log_format,
            "log_level" => &self.log_level,
            "backend_url" => &self.backend_url,
            "frontend_url" => &self.frontend_url,
            "cookie_secure" => self.cookie_secure,
            "cookie_same_site" => self.cookie_same_site.to_string(),
            "http_timeout_seconds" => self.http_timeout_seconds,
            "reaper_interval_seconds" => self.reaper_interval_seconds,
        );
        Ok(())
    }

    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn spotify_redirect_url(&self) -> String {
        format!("{}/api/spotify/callback", self.backend_url.trim_end_matches('/'))
    }

    pub fn cookies(&self) -> CookieSettings {
        CookieSettings {
            secure: self.cookie_secure,
            same_site: self.cookie_same_site,
        }
    }

    pub fn spotify(&self) -> SpotifySettings {
        SpotifySettings {
            client_id: self.spotify_client_id.clone(),
            client_secret: self.spotify_secret_id.clone(),
            accounts_url: self.spotify_accounts_url.trim_end_matches('/').to_string(),
            api_url: self.spotify_api_url.trim_end_matches('/').to_string(),
            redirect_url: self.spotify_redirect_url(),
            timeout: Duration::from_secs(self.http_timeout_seconds),
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_site_parses_case_insensitively() {
        assert_eq!("lax".parse::<SameSite>().unwrap(), SameSite::Lax);
        assert_eq!("None".parse::<SameSite>().unwrap(), SameSite::None);
        assert_eq!("STRICT".parse::<SameSite>().unwrap(), SameSite::Strict);
        assert!("sometimes".parse::<SameSite>().is_err());
    }
}
