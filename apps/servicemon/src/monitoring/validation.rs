//! Checker argument parsing.
//!
//! Argument values come straight from the property table as strings; these
//! helpers turn them into typed values or a [`CheckerError`] that names the
//! offending argument.

use std::time::Duration;

use url::{Host, ParseError, Url};

use crate::error::CheckerError;

/// Where an HTTP request goes, as described by the `url` argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    /// Host embedded in the URL; sent as the virtual host
    pub host: Option<Host<String>>,
    pub port: Option<u16>,
    /// Path plus query string, always starting with `/`
    pub path: String,
}

/// Parse the `url` argument of the HTTP checkers.
///
/// Absolute URLs must use `http` or `https`. Anything without a scheme is
/// taken as a path on the monitored address.
pub fn parse_http_url(raw: &str) -> Result<HttpTarget, CheckerError> {
    let raw = raw.trim();
    let raw = if raw.is_empty() { "/" } else { raw };

    match Url::parse(raw) {
        Ok(url) => {
            match url.scheme() {
                "http" | "https" => {}
                other => {
                    return Err(CheckerError::invalid("url", raw, format!("unsupported scheme {other}")));
                }
            }
            Ok(HttpTarget {
                host: url.host().map(|host| host.to_owned()),
                port: url.port(),
                path: path_and_query(&url),
            })
        }
        Err(ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse("http://relative.invalid/").map_err(|e| CheckerError::invalid("url", raw, e))?;
            let url = base.join(raw).map_err(|e| CheckerError::invalid("url", raw, e))?;
            Ok(HttpTarget { host: None, port: None, path: path_and_query(&url) })
        }
        Err(e) => Err(CheckerError::invalid("url", raw, e)),
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Validate port is in valid range
pub fn parse_port(raw: &str) -> Result<u16, CheckerError> {
    let port: u16 = raw.trim().parse().map_err(|e| CheckerError::invalid("port", raw, e))?;
    if port == 0 {
        return Err(CheckerError::invalid("port", raw, "port 0 is not valid"));
    }
    Ok(port)
}

/// Longest timeout a checker may be given
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Parse a timeout given in (possibly fractional) seconds
pub fn parse_timeout(raw: &str) -> Result<Duration, CheckerError> {
    let seconds: f64 = raw.trim().parse().map_err(|e| CheckerError::invalid("timeout", raw, e))?;
    match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) if timeout.is_zero() => {
            Err(CheckerError::invalid("timeout", raw, "must be a positive number of seconds"))
        }
        Ok(timeout) if timeout <= MAX_TIMEOUT => Ok(timeout),
        Ok(_) => Err(CheckerError::invalid(
            "timeout",
            raw,
            format!("must not exceed {} seconds", MAX_TIMEOUT.as_secs()),
        )),
        Err(e) => Err(CheckerError::invalid("timeout", raw, e)),
    }
}
