//! Upload of local files into a folder of a shared drive.
//!
//! The upload is a resumable upload sent in a single request: the metadata
//! opens an upload session, the content is then streamed to the session.

use std::path::Path;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::{error, DriveClient, DriveError, DriveRef, FolderRef, UploadedFile};
use crate::dump::mime_type_for;

impl DriveClient {
    /// Uploads `file_path` as `file_name` into `folder` of `drive`.
    ///
    /// Failures are logged and returned, they are never retried here.
    pub async fn upload(
        &self,
        drive: &DriveRef,
        folder: &FolderRef,
        file_path: &Path,
        file_name: &str,
    ) -> Result<UploadedFile, DriveError> {
        log::info!(target: "drive::upload", "Uploading file {file_name} to drive {}", drive.id);

        match self.try_upload(drive, folder, file_path, file_name).await {
            Ok(file) => {
                log::info!(target: "drive::upload", "File Id: {}", file.id);
                Ok(file)
            }
            Err(e) => {
                log::error!(
                    target: "drive::upload",
                    "Uploading {file_name} failed ({}): {e}",
                    e.retryability()
                );
                Err(e)
            }
        }
    }

    async fn try_upload(
        &self,
        drive: &DriveRef,
        folder: &FolderRef,
        file_path: &Path,
        file_name: &str,
    ) -> Result<UploadedFile, DriveError> {
        let file = tokio::fs::File::open(file_path).await?;
        let size = file.metadata().await?.len();
        let mime_type = mime_type_for(file_name);

        let metadata = json!({
            "name": file_name,
            "parents": [folder.id],
            "driveId": drive.id,
            "mimeType": mime_type,
        });
        let response = self
            .http
            .post(self.upload_url())
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", "id,name"),
            ])
            .bearer_auth(self.bearer().await?)
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", size)
            .json(&metadata)
            .send()
            .await?;
        let response = error::check(response).await?;

        let session_url = response
            .headers()
            .get(LOCATION)
            .and_then(|location| location.to_str().ok())
            .ok_or(DriveError::MissingLocation)?
            .to_owned();
        log::debug!(target: "drive::upload", "Opened upload session for {file_name} ({size} bytes)");

        let response = self
            .http
            .put(session_url)
            .header(CONTENT_TYPE, mime_type)
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        Ok(error::check(response).await?.json::<UploadedFile>().await?)
    }
}
