use slog::o;
use slog::Drain;
use std::time::Instant;

use crate::config::env_or;

lazy_static::lazy_static! {
    // The "base" logger that all modules should branch off of
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = env_or("LOG_LEVEL", "INFO")
                .parse()
                .unwrap_or(slog::Level::Info);
        if env_or("LOG_FORMAT", "json").trim().to_lowercase() == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "groove"));
}

/// Request logging for the tide service
#[derive(Debug, Default, Clone)]
pub struct LogMiddleware {
    _priv: (),
}

impl LogMiddleware {
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(&self, req: tide::Request<State>, next: tide::Next<'_, State>) -> tide::Result {
        let path = req.url().path().to_owned();
        let method = req.method().to_string();
        let start = Instant::now();
        let resp = next.run(req).await;
        let status = resp.status() as u16;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if let Some(err) = resp.error() {
            slog::error!(
                LOG, "request failed";
                "method" => &method,
                "path" => &path,
                "status" => status,
                "elapsed_ms" => elapsed_ms,
                "error" => format!("{:?}", err),
            );
        } else if status >= 500 {
            slog::error!(
                LOG, "request";
                "method" => &method,
                "path" => &path,
                "status" => status,
                "elapsed_ms" => elapsed_ms,
            );
        } else {
            slog::info!(
                LOG, "request";
                "method" => &method,
                "path" => &path,
                "status" => status,
                "elapsed_ms" => elapsed_ms,
            );
        }
        Ok(resp)
    }
}
