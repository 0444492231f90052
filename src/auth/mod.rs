//! OAuth2 credentials for the Google Drive API.
//!
//! The [CredentialStore] persists the refresh token in a token file next to
//! the OAuth client credentials file downloaded from the Google Cloud
//! console. Without a token file an interactive [consent] flow is run once.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::drive::{classify_transport, Retryability};

pub mod consent;
mod token;

pub use token::TokenResponse;

/// Full access to the files of the user, shared drives included.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Value of the `type` field of a token file.
const AUTHORIZED_USER: &str = "authorized_user";

/// Access tokens expiring within this margin are refreshed ahead of use.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// OAuth2 endpoints of the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub auth_uri: String,
    pub token_uri: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            auth_uri: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on obtaining, persisting or refreshing credentials.
pub enum AuthError {
    /// The OAuth client credentials file can't be read.
    #[display("Unable to read credentials file {}: {source}", path.display())]
    CredentialsFile { path: PathBuf, source: io::Error },
    /// The OAuth client credentials file is no valid JSON.
    #[display("Credentials file {} is malformed: {source}", path.display())]
    MalformedCredentials {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The OAuth client credentials file has neither an `installed` nor a `web` client.
    #[display("Credentials file {} holds neither an `installed` nor a `web` client", path.display())]
    MissingClientKeys { path: PathBuf },
    /// The token file can't be written.
    #[display("Unable to write token file {}: {source}", path.display())]
    TokenFile { path: PathBuf, source: io::Error },
    /// The loopback listener of the consent flow failed.
    #[display("OAuth callback listener failed: {_0}")]
    Callback(io::Error),
    /// The authorization URL can't be built.
    #[display("Invalid authorization endpoint: {_0}")]
    InvalidEndpoint(url::ParseError),
    /// The user denied access or the callback carried no code.
    #[display("Authorization was not granted: {_0}")]
    ConsentDenied(#[error(ignore)] String),
    /// The token endpoint answered with an OAuth error, e.g. a revoked refresh token.
    #[display("Token endpoint rejected the request ({status}): {error}")]
    TokenRejected { status: u16, error: String },
    /// The consent flow yielded no refresh token.
    #[display("Token endpoint returned no refresh token, revoke the access of the app and authorize again")]
    MissingRefreshToken,
    /// Sending a request to the token endpoint failed.
    #[from]
    #[display("Token request failed: {_0}")]
    Transport(reqwest::Error),
}

impl AuthError {
    pub fn retryability(&self) -> Retryability {
        match self {
            Self::Transport(e) => classify_transport(e),
            Self::TokenRejected { status, .. } if *status >= 500 => Retryability::Retryable,
            _ => Retryability::Fatal,
        }
    }
}

/// An OAuth2 credential of an authorized user.
///
/// Only the client keys and the refresh token are persisted, the access
/// token is obtained on first use.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl Credential {
    fn from_token(keys: &ClientKeys, token: TokenResponse) -> Result<Self, AuthError> {
        let now = Utc::now();
        let refresh_token = token.refresh_token.ok_or(AuthError::MissingRefreshToken)?;

        Ok(Self {
            client_id: keys.client_id.clone(),
            client_secret: keys.client_secret.clone(),
            refresh_token,
            access_token: Some(token.access_token),
            expiry: Some(now + Duration::seconds(token.expires_in)),
        })
    }

    /// Whether the access token is usable at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expiry) {
            (Some(_), Some(expiry)) => expiry > now + Duration::seconds(EXPIRY_MARGIN_SECS),
            _ => false,
        }
    }

    /// Returns a valid access token, refreshing it first if necessary.
    pub async fn bearer(
        &mut self,
        http: &reqwest::Client,
        token_uri: &str,
    ) -> Result<String, AuthError> {
        if let (true, Some(token)) = (self.is_fresh(Utc::now()), &self.access_token) {
            return Ok(token.clone());
        }

        log::debug!(target: "auth", "Refreshing access token");
        let token = token::refresh_access_token(http, token_uri, self).await?;
        if let Some(refresh_token) = token.refresh_token {
            // rotated by the provider
            self.refresh_token = refresh_token;
        }
        self.expiry = Some(Utc::now() + Duration::seconds(token.expires_in));
        self.access_token = Some(token.access_token.clone());
        log::debug!(target: "auth", "Access token valid for {} seconds", token.expires_in);

        Ok(token.access_token)
    }
}

/// OAuth client keys of a credentials file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientKeys {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientKeys>,
    web: Option<ClientKeys>,
}

/// On-disk format of the token file.
#[derive(Debug, Serialize, Deserialize)]
struct AuthorizedUser {
    #[serde(rename = "type")]
    kind: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

/// Loads, saves and obtains [Credential]s.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    token_path: PathBuf,
    credentials_path: PathBuf,
    endpoints: OAuthEndpoints,
}

impl CredentialStore {
    pub fn new(token_path: &Path, credentials_path: &Path) -> Self {
        Self::with_endpoints(token_path, credentials_path, OAuthEndpoints::default())
    }

    pub fn with_endpoints(
        token_path: &Path,
        credentials_path: &Path,
        endpoints: OAuthEndpoints,
    ) -> Self {
        Self {
            token_path: token_path.to_path_buf(),
            credentials_path: credentials_path.to_path_buf(),
            endpoints,
        }
    }

    /// Reads previously saved credentials.
    ///
    /// A missing or unparsable token file yields [None].
    pub async fn load_saved(&self) -> Option<Credential> {
        let content = match tokio::fs::read(&self.token_path).await {
            Ok(content) => content,
            Err(e) => {
                log::debug!(target: "auth", "No saved token at {}: {e}", self.token_path.display());
                return None;
            }
        };

        let saved: AuthorizedUser = match serde_json::from_slice(&content) {
            Ok(saved) => saved,
            Err(e) => {
                log::debug!(target: "auth", "Ignoring unparsable token file {}: {e}", self.token_path.display());
                return None;
            }
        };
        if saved.kind != AUTHORIZED_USER {
            log::debug!(target: "auth", "Ignoring token file of type {}", saved.kind);
            return None;
        }

        Some(Credential {
            client_id: saved.client_id,
            client_secret: saved.client_secret,
            refresh_token: saved.refresh_token,
            access_token: None,
            expiry: None,
        })
    }

    /// Persists the refresh token of `credential` together with the client
    /// keys of the credentials file.
    pub async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        let keys = self.client_keys().await?;
        let payload = AuthorizedUser {
            kind: AUTHORIZED_USER.to_string(),
            client_id: keys.client_id,
            client_secret: keys.client_secret,
            refresh_token: credential.refresh_token.clone(),
        };
        let payload = serde_json::to_vec(&payload).map_err(|e| AuthError::TokenFile {
            path: self.token_path.clone(),
            source: e.into(),
        })?;

        tokio::fs::write(&self.token_path, payload)
            .await
            .map_err(|source| AuthError::TokenFile {
                path: self.token_path.clone(),
                source,
            })?;
        log::debug!(target: "auth", "Saved token to {}", self.token_path.display());

        Ok(())
    }

    /// Loads saved credentials or runs the interactive consent flow.
    pub async fn authorize(&self, http: &reqwest::Client) -> Result<Credential, AuthError> {
        if let Some(credential) = self.load_saved().await {
            log::debug!(target: "auth", "Using saved credentials of {}", self.token_path.display());
            return Ok(credential);
        }

        log::info!(target: "auth", "No saved credentials, starting OAuth consent flow");
        let keys = self.client_keys().await?;
        let flow = consent::ConsentFlow::bind().await?;
        let url = flow.authorization_url(&self.endpoints, &keys, &[DRIVE_SCOPE])?;
        println!("Authorize access to Google Drive by visiting:\n\n{url}\n");
        let token = flow.finish(http, &self.endpoints, &keys).await?;

        let credential = Credential::from_token(&keys, token)?;
        self.save(&credential).await?;
        log::info!(target: "auth", "Authorization complete, token saved to {}", self.token_path.display());

        Ok(credential)
    }

    /// Returns a valid access token of `credential` like [Credential::bearer].
    ///
    /// A refresh token rotated by the provider is saved right away. Failing
    /// to save it is logged, the access token is still usable.
    pub async fn bearer(
        &self,
        credential: &mut Credential,
        http: &reqwest::Client,
    ) -> Result<String, AuthError> {
        let previous = credential.refresh_token.clone();
        let token = credential.bearer(http, &self.endpoints.token_uri).await?;

        if credential.refresh_token != previous {
            log::info!(target: "auth", "Refresh token was rotated, saving it");
            if let Err(e) = self.save(credential).await {
                log::warn!(target: "auth", "Saving the rotated refresh token failed: {e}");
            }
        }

        Ok(token)
    }

    /// Reads the client keys from the credentials file.
    pub async fn client_keys(&self) -> Result<ClientKeys, AuthError> {
        let content = tokio::fs::read(&self.credentials_path)
            .await
            .map_err(|source| AuthError::CredentialsFile {
                path: self.credentials_path.clone(),
                source,
            })?;
        let secrets: ClientSecretsFile =
            serde_json::from_slice(&content).map_err(|source| AuthError::MalformedCredentials {
                path: self.credentials_path.clone(),
                source,
            })?;

        secrets
            .installed
            .or(secrets.web)
            .ok_or_else(|| AuthError::MissingClientKeys {
                path: self.credentials_path.clone(),
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use httpmock::prelude::*;

    use super::*;

    pub(crate) const CREDENTIALS_JSON: &str = r#"{
        "installed": {
            "client_id": "client-123.apps.googleusercontent.com",
            "project_id": "uapa-backups",
            "client_secret": "GOCSPX-secret",
            "redirect_uris": ["http://localhost"]
        }
    }"#;

    pub(crate) fn credential(refresh_token: &str) -> Credential {
        Credential {
            client_id: "client-123.apps.googleusercontent.com".to_string(),
            client_secret: "GOCSPX-secret".to_string(),
            refresh_token: refresh_token.to_string(),
            access_token: None,
            expiry: None,
        }
    }

    fn store(dir: &Path) -> CredentialStore {
        CredentialStore::new(&dir.join("token.json"), &dir.join("credentials.json"))
    }

    #[tokio::test]
    async fn save_then_load_keeps_latest_refresh_token() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("credentials.json"), CREDENTIALS_JSON).unwrap();
        let store = store(tmp.path());

        store.save(&credential("first")).await.unwrap();
        store.save(&credential("second")).await.unwrap();

        let loaded = store.load_saved().await.unwrap();
        assert_eq!(loaded.refresh_token, "second");
        assert_eq!(loaded.client_id, "client-123.apps.googleusercontent.com");
        assert_eq!(loaded.access_token, None);
    }

    #[tokio::test]
    async fn token_file_is_authorized_user() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("credentials.json"), CREDENTIALS_JSON).unwrap();
        store(tmp.path()).save(&credential("rt")).await.unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("token.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "authorized_user",
                "client_id": "client-123.apps.googleusercontent.com",
                "client_secret": "GOCSPX-secret",
                "refresh_token": "rt",
            })
        );
    }

    #[tokio::test]
    async fn web_client_keys_are_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("credentials.json"),
            r#"{"web": {"client_id": "web-id", "client_secret": "web-secret"}}"#,
        )
        .unwrap();

        let keys = store(tmp.path()).client_keys().await.unwrap();
        assert_eq!(keys.client_id, "web-id");
        assert_eq!(keys.client_secret, "web-secret");
    }

    #[tokio::test]
    async fn save_fails_without_credentials_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = store(tmp.path()).save(&credential("rt")).await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialsFile { .. }), "{err}");
        assert!(!tmp.path().join("token.json").exists());
    }

    #[tokio::test]
    async fn load_fails_soft() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        assert!(store.load_saved().await.is_none());

        std::fs::write(tmp.path().join("token.json"), "{not json").unwrap();
        assert!(store.load_saved().await.is_none());

        std::fs::write(
            tmp.path().join("token.json"),
            r#"{"type": "service_account", "client_id": "a", "client_secret": "b", "refresh_token": "c"}"#,
        )
        .unwrap();
        assert!(store.load_saved().await.is_none());
    }

    #[tokio::test]
    async fn authorize_prefers_saved_token() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("credentials.json"), CREDENTIALS_JSON).unwrap();
        let store = store(tmp.path());
        store.save(&credential("saved")).await.unwrap();

        let credential = store.authorize(&reqwest::Client::new()).await.unwrap();
        assert_eq!(credential.refresh_token, "saved");
    }

    #[tokio::test]
    async fn bearer_refreshes_once() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("grant_type=refresh_token")
                .body_contains("refresh_token=rt");
            then.status(200).json_body(serde_json::json!({
                "access_token": "ya29.access",
                "expires_in": 3599,
                "token_type": "Bearer",
            }));
        });

        let http = reqwest::Client::new();
        let mut credential = credential("rt");
        let token_uri = server.url("/token");

        assert_eq!(credential.bearer(&http, &token_uri).await.unwrap(), "ya29.access");
        assert!(credential.is_fresh(Utc::now()));
        // cached until close to expiry
        assert_eq!(credential.bearer(&http, &token_uri).await.unwrap(), "ya29.access");
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_saved() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("credentials.json"), CREDENTIALS_JSON).unwrap();
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("refresh_token=old");
            then.status(200).json_body(serde_json::json!({
                "access_token": "ya29.access",
                "expires_in": 3599,
                "refresh_token": "rotated",
                "token_type": "Bearer",
            }));
        });
        let store = CredentialStore::with_endpoints(
            &tmp.path().join("token.json"),
            &tmp.path().join("credentials.json"),
            OAuthEndpoints {
                auth_uri: server.url("/auth"),
                token_uri: server.url("/token"),
            },
        );
        store.save(&credential("old")).await.unwrap();

        let mut credential = store.load_saved().await.unwrap();
        let token = store.bearer(&mut credential, &reqwest::Client::new()).await.unwrap();

        assert_eq!(token, "ya29.access");
        assert_eq!(credential.refresh_token, "rotated");
        assert_eq!(store.load_saved().await.unwrap().refresh_token, "rotated");
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_fatal() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).json_body(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked.",
            }));
        });

        let mut credential = credential("revoked");
        let err = credential
            .bearer(&reqwest::Client::new(), &server.url("/token"))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::TokenRejected { status: 400, .. }), "{err}");
        assert_eq!(err.retryability(), Retryability::Fatal);
    }

    #[test]
    fn expiring_token_is_not_fresh() {
        let now = Utc::now();
        let mut credential = credential("rt");
        assert!(!credential.is_fresh(now));

        credential.access_token = Some("token".to_string());
        credential.expiry = Some(now + Duration::seconds(30));
        assert!(!credential.is_fresh(now));

        credential.expiry = Some(now + Duration::seconds(600));
        assert!(credential.is_fresh(now));
    }
}
