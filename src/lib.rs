/*!
groove backend

Session, CSRF and Spotify-link lifecycle for the groove web app, plus the
tide service that exposes them.
*/

pub mod accounts;
pub mod clock;
pub mod config;
pub mod cookies;
pub mod crypto;
pub mod csrf;
pub mod error;
pub mod logging;
pub mod models;
pub mod oauth;
pub mod pipeline;
pub mod reaper;
pub mod service;
pub mod session;
pub mod spotify;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tokens;
pub mod utils;
pub mod validate;

pub use error::{Denial, Error, Result};
pub use logging::LOG;
