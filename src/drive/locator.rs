//! Name based lookup of shared drives and folders.
//!
//! Names are matched exactly and case-sensitively, the first match wins.
//! Keeping drive and folder names unique is up to the operator.

use serde::Deserialize;

use super::{DriveClient, DriveError, DriveRef, FolderRef, FOLDER_MIME_TYPE};

const DRIVES_PAGE_SIZE: &str = "100";
const FILES_PAGE_SIZE: &str = "1000";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveList {
    #[serde(default)]
    drives: Vec<DriveRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
}

impl DriveClient {
    /// Looks up the shared drive called `name` among all drives visible to
    /// the credential.
    pub async fn find_shared_drive(&self, name: &str) -> Result<Option<DriveRef>, DriveError> {
        let url = self.drives_url();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("pageSize", DRIVES_PAGE_SIZE),
                ("fields", "nextPageToken,drives(id,name)"),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let page: DriveList = self.get_json(&url, &query).await?;
            if let Some(drive) = page.drives.into_iter().find(|drive| drive.name == name) {
                log::debug!(target: "drive::locator", "Found shared drive {name}: {}", drive.id);
                return Ok(Some(drive));
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        log::debug!(target: "drive::locator", "No shared drive named {name}");
        Ok(None)
    }

    /// Looks up the folder called `name` anywhere inside the drive `drive_id`.
    pub async fn find_folder(
        &self,
        drive_id: &str,
        name: &str,
    ) -> Result<Option<FolderRef>, DriveError> {
        let url = self.files_url();
        let folder_query = format!("mimeType='{FOLDER_MIME_TYPE}'");
        let mut page_token: Option<String> = None;
        let mut matches = Vec::new();

        loop {
            let mut query = vec![
                ("corpora", "drive"),
                ("driveId", drive_id),
                ("includeItemsFromAllDrives", "true"),
                ("supportsAllDrives", "true"),
                ("q", folder_query.as_str()),
                ("pageSize", FILES_PAGE_SIZE),
                ("fields", "nextPageToken,files(id,name,mimeType)"),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let page: FileList = self.get_json(&url, &query).await?;
            matches.extend(
                page.files
                    .into_iter()
                    .filter(|file| file.mime_type == FOLDER_MIME_TYPE && file.name == name),
            );

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if matches.len() > 1 {
            log::warn!(
                target: "drive::locator",
                "{} folders named {name} in drive {drive_id}, using the first",
                matches.len()
            );
        }

        Ok(matches.into_iter().next().map(|file| {
            log::debug!(target: "drive::locator", "Found folder {name}: {}", file.id);
            FolderRef {
                id: file.id,
                name: file.name,
                drive_id: drive_id.to_string(),
            }
        }))
    }
}
