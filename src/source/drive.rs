//! Google Drive listing and export via the v3 REST API.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;

use super::error::SourceError;
use super::google_auth::ServiceAccountAuth;
use super::{check_response, into_download, Download, ItemKind, Listing, RemoteItem, Source};
use crate::state::Watermark;
use crate::types::SourceKind;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const PAGE_SIZE: &str = "1000";
const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, modifiedTime, size)";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const GOOGLE_APPS_PREFIX: &str = "application/vnd.google-apps.";

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
    modified_time: DateTime<Utc>,
    /// Drive encodes int64 fields as strings; absent for Google-native files.
    size: Option<String>,
}

#[derive(Debug)]
pub struct DriveSource {
    client: Client,
    auth: ServiceAccountAuth,
    target_folders: Vec<String>,
    base_url: String,
}

impl DriveSource {
    pub fn new(client: Client, auth: ServiceAccountAuth, target_folders: Vec<String>) -> Self {
        Self {
            client,
            auth,
            target_folders,
            base_url: API_BASE.to_string(),
        }
    }

    async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
        context: &str,
    ) -> Result<reqwest::Response, SourceError> {
        let token = self.auth.access_token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        match check_response(resp, context).await {
            Err(SourceError::Auth(msg)) => {
                // Force a fresh token exchange if the loop is ever restarted.
                self.auth.invalidate().await;
                Err(SourceError::Auth(msg))
            }
            other => other,
        }
    }
}

#[async_trait]
impl Source for DriveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Drive
    }

    async fn check_auth(&self) -> Result<(), SourceError> {
        let url = format!("{}/about", self.base_url);
        self.get(&url, &[("fields", "user(emailAddress)")], "drive about")
            .await?;
        tracing::info!(
            source = "drive",
            account = %self.auth.client_email(),
            folders = self.target_folders.len(),
            "Authenticated with Google Drive"
        );
        Ok(())
    }

    async fn list_since(&self, watermark: &Watermark) -> Result<Listing, SourceError> {
        let query = build_query(watermark, &self.target_folders);
        let url = format!("{}/files", self.base_url);
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;
        let started = Utc::now();

        loop {
            let mut params = vec![
                ("q", query.as_str()),
                ("pageSize", PAGE_SIZE),
                ("fields", LIST_FIELDS),
                ("orderBy", "modifiedTime"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }

            let resp = self.get(&url, &params, "drive files.list").await?;
            let page: FileList = resp.json().await?;
            pages += 1;
            items.extend(page.files.into_iter().filter_map(into_remote_item));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(source = "drive", pages, items = items.len(), "Listed Drive files");
        Ok(Listing::new(*watermark, items, Vec::new()).settled_before(*watermark, started))
    }

    async fn open(&self, item: &RemoteItem) -> Result<Download, SourceError> {
        let resp = match item.kind.export_mime() {
            Some(mime) => {
                let url = format!("{}/files/{}/export", self.base_url, item.id);
                self.get(&url, &[("mimeType", mime)], "drive files.export")
                    .await?
            }
            None => {
                let url = format!("{}/files/{}", self.base_url, item.id);
                self.get(
                    &url,
                    &[("alt", "media"), ("supportsAllDrives", "true")],
                    "drive files.get",
                )
                .await?
            }
        };
        Ok(into_download(resp))
    }
}

/// Build the `files.list` query for a watermark and optional folder scope.
fn build_query(watermark: &Watermark, folders: &[String]) -> String {
    let mut clauses = vec!["trashed = false".to_string()];
    if let Some(cursor) = watermark.cursor {
        clauses.insert(
            0,
            format!(
                "modifiedTime >= '{}'",
                cursor.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
        );
    }
    if !folders.is_empty() {
        let parents: Vec<String> = folders
            .iter()
            .map(|id| format!("'{}' in parents", escape_literal(id)))
            .collect();
        clauses.push(format!("({})", parents.join(" or ")));
    }
    clauses.join(" and ")
}

fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn item_kind(mime: &str) -> Option<ItemKind> {
    match mime {
        "application/vnd.google-apps.document" => Some(ItemKind::NativeDoc),
        "application/vnd.google-apps.spreadsheet" => Some(ItemKind::Sheet),
        "application/vnd.google-apps.presentation" => Some(ItemKind::Slide),
        m if m.starts_with(GOOGLE_APPS_PREFIX) => None,
        _ => Some(ItemKind::BinaryFile),
    }
}

fn into_remote_item(file: DriveFile) -> Option<RemoteItem> {
    if file.mime_type == FOLDER_MIME {
        return None;
    }
    let Some(kind) = item_kind(&file.mime_type) else {
        tracing::debug!(
            source = "drive",
            item_id = %file.id,
            mime = %file.mime_type,
            "No export format for Google file type, ignoring"
        );
        return None;
    };
    let size = file.size.as_deref().and_then(|s| s.parse::<u64>().ok());
    Some(RemoteItem {
        id: file.id,
        name: file.name,
        kind,
        mime_type: file.mime_type,
        size,
        modified_at: file.modified_time,
        source: SourceKind::Drive,
        download_url: None,
    })
}
