//! Gateway endpoint construction.
//!
//! The stream lives at `/ws/market` on the gateway host and authenticates
//! with the access token as a `token` query parameter.

use url::Url;

use crate::application::ports::TransportError;
use crate::domain::session::AccessToken;

/// Path of the market stream on the gateway.
pub const STREAM_PATH: &str = "/ws/market";

/// Validated gateway base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEndpoint {
    base: Url,
}

impl GatewayEndpoint {
    /// Parse a base URL. `http`/`https` are mapped to `ws`/`wss`.
    ///
    /// A base that already ends in the stream path is accepted as-is.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidEndpoint`] for unparseable URLs,
    /// unsupported schemes, or URLs without a host.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let mut base =
            Url::parse(raw.trim()).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        let scheme = match base.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme: {other}"
                )));
            }
        };
        if base.scheme() != scheme && base.set_scheme(scheme).is_err() {
            return Err(TransportError::InvalidEndpoint(format!(
                "cannot use scheme {scheme}"
            )));
        }
        if base.host_str().is_none() {
            return Err(TransportError::InvalidEndpoint("missing host".to_string()));
        }

        base.set_query(None);
        base.set_fragment(None);
        Ok(Self { base })
    }

    /// Full stream URL for `token`. The token is percent-encoded.
    #[must_use]
    pub fn stream_url(&self, token: &AccessToken) -> Url {
        let mut url = self.base.clone();

        let path = url.path().trim_end_matches('/').to_string();
        if !path.ends_with(STREAM_PATH) {
            url.set_path(&format!("{path}{STREAM_PATH}"));
        }

        url.query_pairs_mut().append_pair("token", token.expose());
        url
    }

    /// Base URL with no credentials, safe to log.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.base.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(raw: &str) -> AccessToken {
        AccessToken::new(raw).unwrap()
    }

    #[test]
    fn appends_stream_path_and_token() {
        let endpoint = GatewayEndpoint::parse("wss://api.example.com").unwrap();

        let url = endpoint.stream_url(&token("abc"));

        assert_eq!(url.as_str(), "wss://api.example.com/ws/market?token=abc");
    }

    #[test]
    fn maps_http_schemes() {
        let plain = GatewayEndpoint::parse("http://localhost:8000/").unwrap();
        let tls = GatewayEndpoint::parse("https://api.example.com").unwrap();

        assert!(plain.as_str().starts_with("ws://localhost:8000"));
        assert!(tls.as_str().starts_with("wss://"));
    }

    #[test]
    fn keeps_existing_stream_path() {
        let endpoint = GatewayEndpoint::parse("wss://api.example.com/ws/market").unwrap();

        let url = endpoint.stream_url(&token("abc"));

        assert_eq!(url.path(), "/ws/market");
    }

    #[test]
    fn keeps_base_path_prefix() {
        let endpoint = GatewayEndpoint::parse("wss://api.example.com/v1/").unwrap();

        assert_eq!(endpoint.stream_url(&token("t")).path(), "/v1/ws/market");
    }

    #[test]
    fn encodes_token() {
        let endpoint = GatewayEndpoint::parse("wss://api.example.com").unwrap();

        let url = endpoint.stream_url(&token("a b&c=d"));

        assert!(url.as_str().ends_with("?token=a+b%26c%3Dd"));
        let (_, value) = url.query_pairs().next().unwrap();
        assert_eq!(value, "a b&c=d");
    }

    #[test]
    fn drops_configured_query() {
        let endpoint = GatewayEndpoint::parse("wss://api.example.com?token=stale").unwrap();

        let url = endpoint.stream_url(&token("fresh"));

        assert_eq!(url.query(), Some("token=fresh"));
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(GatewayEndpoint::parse("not a url").is_err());
        assert!(GatewayEndpoint::parse("ftp://example.com").is_err());
    }
}
