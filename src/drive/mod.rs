//! Thin client of the Google Drive v3 API.
//!
//! Only what a backup needs is covered: looking up a shared drive and a
//! folder by name ([locator]) and uploading a file into it ([upload]).

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::auth::{Credential, CredentialStore};

mod error;
pub mod locator;
pub mod upload;

pub use error::{classify_transport, DriveError, Retryability};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A shared drive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriveRef {
    pub id: String,
    pub name: String,
}

/// A folder inside a shared drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRef {
    pub id: String,
    pub name: String,
    pub drive_id: String,
}

/// A file created by an upload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
}

/// Builds the HTTP client used for all API and token requests.
///
/// Without `timeout` a request may take arbitrarily long once connected,
/// large uploads are expected.
pub fn http_client(timeout: Option<Duration>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}

/// Authorized Drive API client.
#[derive(Debug)]
pub struct DriveClient {
    http: reqwest::Client,
    api_base: String,
    store: CredentialStore,
    credential: Mutex<Credential>,
}

impl DriveClient {
    /// Client acting with `credential`, refreshed and saved through `store`.
    pub fn new(
        http: reqwest::Client,
        store: CredentialStore,
        credential: Credential,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            store,
            credential: Mutex::new(credential),
        }
    }

    fn drives_url(&self) -> String {
        format!("{}/drive/v3/drives", self.api_base)
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/drive/v3/files", self.api_base)
    }

    /// A valid access token, refreshed when needed.
    async fn bearer(&self) -> Result<String, DriveError> {
        let mut credential = self.credential.lock().await;
        Ok(self.store.bearer(&mut *credential, &self.http).await?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DriveError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        Ok(error::check(response).await?.json::<T>().await?)
    }
}
