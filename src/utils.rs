/// Format a string error
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {{ format!($($arg)*) }};
}

/// Build tide responses
///
/// - `resp!(json => value)` 200 with a json body
/// - `resp!(status => 201, json => value)`
/// - `resp!(status => 400, message => "...")` the `{error, message}` envelope
/// - `resp!(status => 204)`
#[macro_export]
macro_rules! resp {
    (json => $obj:expr) => {{
        tide::Response::builder(200)
            .body(tide::Body::from_json(&$obj)?)
            .build()
    }};
    (status => $status:expr, json => $obj:expr) => {{
        tide::Response::builder($status)
            .body(tide::Body::from_json(&$obj)?)
            .build()
    }};
    (status => $status:expr, message => $msg:expr) => {{
        let status: u16 = $status;
        tide::Response::builder(status)
            .body(serde_json::json!({
                "error": $crate::utils::reason(status),
                "message": $msg,
            }))
            .build()
    }};
    (status => $status:expr) => {{
        tide::Response::builder($status).build()
    }};
}

/// Lowercase reason phrase used in the error envelope
pub fn reason(status: u16) -> &'static str {
    match status {
        400 => "bad request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not found",
        308 => "permanent redirect",
        _ => "internal server error",
    }
}
