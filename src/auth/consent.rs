//! Interactive OAuth2 consent flow for installed applications.
//!
//! A loopback listener receives the redirect of the browser after the user
//! granted access. The authorization code of the redirect is then traded for
//! tokens at the token endpoint.

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

use super::token::{exchange_code, TokenResponse};
use super::{AuthError, ClientKeys, OAuthEndpoints};

/// Path of the redirect URI on the loopback listener.
pub const CALLBACK_PATH: &str = "/oauth2callback";

const SUCCESS_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n\
    <html><body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
    <h1>Authorization complete</h1><p>You may close this window.</p>\
    </body></html>";

const FAILURE_RESPONSE: &str = "HTTP/1.1 400 Bad Request\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n\
    <html><body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
    <h1>Authorization failed</h1><p>Return to the terminal for details.</p>\
    </body></html>";

const NOT_FOUND_RESPONSE: &str =
    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Outcome of a request hitting the loopback listener.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Callback {
    /// The redirect carried an authorization code.
    Code(String),
    /// The redirect carried an error or no code at all.
    Denied(String),
    /// Some other request, e.g. for a favicon.
    Ignored,
}

/// Parses the request line of an HTTP request received by the listener.
pub(crate) fn parse_callback(request_line: &str) -> Callback {
    let Some(target) = request_line.split_whitespace().nth(1) else {
        return Callback::Ignored;
    };
    let Ok(url) = Url::parse(&format!("http://127.0.0.1{target}")) else {
        return Callback::Ignored;
    };
    if url.path() != CALLBACK_PATH {
        return Callback::Ignored;
    }

    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => return Callback::Code(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }
    Callback::Denied(error.unwrap_or_else(|| "no authorization code in redirect".to_string()))
}

/// A consent flow waiting for its redirect.
#[derive(Debug)]
pub struct ConsentFlow {
    listener: TcpListener,
    redirect_uri: String,
}

impl ConsentFlow {
    /// Binds the loopback listener on an ephemeral port.
    pub async fn bind() -> Result<Self, AuthError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(AuthError::Callback)?;
        let port = listener.local_addr().map_err(AuthError::Callback)?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}{CALLBACK_PATH}");
        log::debug!(target: "auth", "Listening for the OAuth redirect at {redirect_uri}");

        Ok(Self {
            listener,
            redirect_uri,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// URL the user has to visit to grant access.
    pub fn authorization_url(
        &self,
        endpoints: &OAuthEndpoints,
        keys: &ClientKeys,
        scopes: &[&str],
    ) -> Result<Url, AuthError> {
        let scope = scopes.join(" ");
        let params = [
            ("client_id", keys.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ];
        Url::parse_with_params(&endpoints.auth_uri, &params).map_err(AuthError::InvalidEndpoint)
    }

    /// Waits for the redirect and trades its code for tokens.
    pub async fn finish(
        self,
        http: &reqwest::Client,
        endpoints: &OAuthEndpoints,
        keys: &ClientKeys,
    ) -> Result<TokenResponse, AuthError> {
        let code = self.wait_for_code().await?;
        log::debug!(target: "auth", "Received authorization code");
        exchange_code(http, &endpoints.token_uri, keys, &code, &self.redirect_uri).await
    }

    async fn wait_for_code(&self) -> Result<String, AuthError> {
        loop {
            let (mut stream, peer) = self.listener.accept().await.map_err(AuthError::Callback)?;
            let mut buffer = [0u8; 4096];
            let read = stream.read(&mut buffer).await.map_err(AuthError::Callback)?;
            let request = String::from_utf8_lossy(&buffer[..read]);
            let request_line = request.lines().next().unwrap_or_default();

            let (outcome, response) = match parse_callback(request_line) {
                Callback::Ignored => {
                    log::trace!(target: "auth", "Ignoring request from {peer}: {request_line}");
                    (None, NOT_FOUND_RESPONSE)
                }
                Callback::Code(code) => (Some(Ok(code)), SUCCESS_RESPONSE),
                Callback::Denied(error) => {
                    (Some(Err(AuthError::ConsentDenied(error))), FAILURE_RESPONSE)
                }
            };

            if let Err(e) = stream.write_all(response.as_bytes()).await {
                log::warn!(target: "auth", "Answering the OAuth redirect failed: {e}");
            }
            let _ = stream.shutdown().await;

            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use tokio::net::TcpStream;

    use super::*;

    fn keys() -> ClientKeys {
        ClientKeys {
            client_id: "client-123".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    #[test]
    fn callback_with_code() {
        assert_eq!(
            parse_callback("GET /oauth2callback?code=4%2F0Ab&scope=drive HTTP/1.1"),
            Callback::Code("4/0Ab".to_string())
        );
    }

    #[test]
    fn callback_with_error() {
        assert_eq!(
            parse_callback("GET /oauth2callback?error=access_denied HTTP/1.1"),
            Callback::Denied("access_denied".to_string())
        );
        assert!(matches!(
            parse_callback("GET /oauth2callback HTTP/1.1"),
            Callback::Denied(_)
        ));
    }

    #[test]
    fn unrelated_requests_are_ignored() {
        assert_eq!(parse_callback("GET /favicon.ico HTTP/1.1"), Callback::Ignored);
        assert_eq!(parse_callback(""), Callback::Ignored);
    }

    #[tokio::test]
    async fn authorization_url_requests_offline_access() {
        let flow = ConsentFlow::bind().await.unwrap();
        let url = flow
            .authorization_url(&OAuthEndpoints::default(), &keys(), &[crate::auth::DRIVE_SCOPE])
            .unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("access_type".into(), "offline".into())));
        assert!(pairs.contains(&("scope".into(), "https://www.googleapis.com/auth/drive".into())));
        assert!(pairs.contains(&("redirect_uri".into(), flow.redirect_uri().into())));
        assert!(flow.redirect_uri().ends_with(CALLBACK_PATH));
    }

    #[tokio::test]
    async fn redirect_code_is_exchanged() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("grant_type=authorization_code")
                .body_contains("code=auth-code");
            then.status(200).json_body(serde_json::json!({
                "access_token": "ya29.access",
                "expires_in": 3599,
                "refresh_token": "1//refresh",
                "token_type": "Bearer",
            }));
        });
        let endpoints = OAuthEndpoints {
            auth_uri: server.url("/auth"),
            token_uri: server.url("/token"),
        };

        let flow = ConsentFlow::bind().await.unwrap();
        let address = flow
            .redirect_uri()
            .trim_start_matches("http://")
            .trim_end_matches(CALLBACK_PATH)
            .to_string();

        let browser = tokio::spawn(async move {
            // a stray request first, then the actual redirect
            for target in ["/favicon.ico", "/oauth2callback?code=auth-code"] {
                let mut stream = TcpStream::connect(&address).await.unwrap();
                let request = format!("GET {target} HTTP/1.1\r\nHost: {address}\r\n\r\n");
                stream.write_all(request.as_bytes()).await.unwrap();
                let mut response = String::new();
                stream.read_to_string(&mut response).await.unwrap();
                if target.starts_with(CALLBACK_PATH) {
                    assert!(response.starts_with("HTTP/1.1 200"));
                }
            }
        });

        let token = flow
            .finish(&reqwest::Client::new(), &endpoints, &keys())
            .await
            .unwrap();
        browser.await.unwrap();

        assert_eq!(token.refresh_token.as_deref(), Some("1//refresh"));
        mock.assert();
    }
}
