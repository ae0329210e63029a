//! Slack channel history and file attachments via the Web API.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::error::SourceError;
use super::triggers;
use super::{
    check_response, into_download, Download, ItemKind, ListedMessage, Listing, RemoteItem, Source,
};
use crate::state::Watermark;
use crate::types::SourceKind;

const API_BASE: &str = "https://slack.com/api";
const HISTORY_LIMIT: &str = "200";

#[derive(Debug, Deserialize)]
struct AuthTest {
    ok: bool,
    error: Option<String>,
    user_id: Option<String>,
    team_id: Option<String>,
    team: Option<String>,
}

#[derive(Debug, Deserialize)]
struct History {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    messages: Vec<SlackMessage>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: String,
    user: Option<String>,
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    files: Vec<SlackFile>,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    id: String,
    name: Option<String>,
    title: Option<String>,
    mimetype: Option<String>,
    size: Option<u64>,
    url_private_download: Option<String>,
    url_private: Option<String>,
}

#[derive(Debug, Clone)]
struct BotIdentity {
    user_id: String,
    team_id: String,
}

#[derive(Debug)]
struct ChannelPage {
    items: Vec<RemoteItem>,
    messages: Vec<ListedMessage>,
}

pub struct SlackSource {
    client: Client,
    token: String,
    channels: Vec<String>,
    base_url: String,
    identity: OnceCell<BotIdentity>,
}

impl std::fmt::Debug for SlackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSource")
            .field("channels", &self.channels)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl SlackSource {
    pub fn new(client: Client, token: String, channels: Vec<String>) -> Self {
        Self {
            client,
            token,
            channels,
            base_url: API_BASE.to_string(),
            identity: OnceCell::new(),
        }
    }

    async fn identity(&self) -> Result<&BotIdentity, SourceError> {
        self.identity
            .get_or_try_init(|| async {
                let url = format!("{}/auth.test", self.base_url);
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.token)
                    .send()
                    .await?;
                let resp = check_response(resp, "slack auth.test").await?;
                let body: AuthTest = resp.json().await?;
                if !body.ok {
                    return Err(api_error("auth.test", body.error));
                }
                let user_id = body.user_id.unwrap_or_default();
                tracing::info!(
                    source = "slack",
                    bot_user = %user_id,
                    team = %body.team.unwrap_or_default(),
                    "Authenticated with Slack"
                );
                Ok(BotIdentity {
                    user_id,
                    team_id: body.team_id.unwrap_or_default(),
                })
            })
            .await
    }

    async fn list_channel(
        &self,
        channel: &str,
        oldest: &str,
        bot: &BotIdentity,
    ) -> Result<ChannelPage, SourceError> {
        let url = format!("{}/conversations.history", self.base_url);
        let mut out = ChannelPage {
            items: Vec::new(),
            messages: Vec::new(),
        };
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![
                ("channel", channel),
                ("limit", HISTORY_LIMIT),
                ("inclusive", "true"),
            ];
            if !oldest.is_empty() {
                params.push(("oldest", oldest));
            }
            if let Some(c) = cursor.as_deref() {
                params.push(("cursor", c));
            }

            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .query(&params)
                .send()
                .await?;
            let resp = check_response(resp, "slack conversations.history").await?;
            let page: History = resp.json().await?;
            if !page.ok {
                return Err(api_error("conversations.history", page.error));
            }

            for message in page.messages {
                collect_message(channel, message, bot, &mut out);
            }

            match page.response_metadata.and_then(|m| m.next_cursor) {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl Source for SlackSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Slack
    }

    async fn check_auth(&self) -> Result<(), SourceError> {
        self.identity().await.map(|_| ())
    }

    async fn list_since(&self, watermark: &Watermark) -> Result<Listing, SourceError> {
        let bot = self.identity().await?;
        let oldest = watermark.cursor.map(format_ts).unwrap_or_default();
        let started = Utc::now();

        let mut pages = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let page = self.list_channel(channel, &oldest, bot).await?;
            tracing::debug!(
                source = "slack",
                channel = %channel,
                messages = page.messages.len(),
                files = page.items.len(),
                "Read channel history"
            );
            pages.push(page);
        }

        Ok(merge_pages(*watermark, started, pages))
    }

    async fn open(&self, item: &RemoteItem) -> Result<Download, SourceError> {
        let url = item
            .download_url
            .as_deref()
            .ok_or_else(|| SourceError::NotDownloadable(item.id.clone()))?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let resp = check_response(resp, "slack file download").await?;

        // Without the files:read scope Slack serves its sign-in page instead.
        let is_html = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/html"));
        if is_html && !item.mime_type.starts_with("text/html") {
            return Err(SourceError::Auth(
                "file download returned an HTML page; the bot token needs the files:read scope"
                    .to_string(),
            ));
        }
        Ok(into_download(resp))
    }
}

/// Combine per-channel pages into one listing. Channels are read one after
/// another, so the watermark is held behind `started`: a file posted in an
/// already-read channel while a later one is read is listed next cycle.
fn merge_pages(current: Watermark, started: DateTime<Utc>, pages: Vec<ChannelPage>) -> Listing {
    let mut items = Vec::new();
    let mut messages = Vec::new();
    for page in pages {
        items.extend(page.items);
        messages.extend(page.messages);
    }
    Listing::new(current, items, messages).settled_before(current, started)
}

fn collect_message(channel: &str, message: SlackMessage, bot: &BotIdentity, out: &mut ChannelPage) {
    if message.bot_id.is_some() || message.user.as_deref() == Some(bot.user_id.as_str()) {
        return;
    }
    let Some(posted_at) = parse_ts(&message.ts) else {
        tracing::warn!(source = "slack", channel, ts = %message.ts, "Unparseable message timestamp");
        return;
    };

    for file in &message.files {
        let name = file
            .name
            .clone()
            .or_else(|| file.title.clone())
            .unwrap_or_else(|| file.id.clone());
        out.items.push(RemoteItem {
            id: file.id.clone(),
            name,
            kind: ItemKind::BinaryFile,
            mime_type: file
                .mimetype
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: file.size,
            modified_at: posted_at,
            source: SourceKind::Slack,
            download_url: file
                .url_private_download
                .clone()
                .or_else(|| file.url_private.clone()),
        });
    }

    let trigger = triggers::detect(&message.text, Some(bot.user_id.as_str()));
    let permalink = trigger
        .as_ref()
        .map(|_| permalink(&bot.team_id, channel, &message.ts));
    out.messages.push(ListedMessage {
        channel: channel.to_string(),
        ts: message.ts,
        user: message.user,
        text: message.text,
        posted_at,
        file_count: message.files.len(),
        trigger,
        permalink,
    });
}

fn api_error(method: &str, error: Option<String>) -> SourceError {
    let code = error.unwrap_or_else(|| "unknown_error".to_string());
    match code.as_str() {
        "invalid_auth" | "not_authed" | "token_revoked" | "token_expired" | "account_inactive"
        | "missing_scope" => SourceError::Auth(format!("slack {}: {}", method, code)),
        "ratelimited" => SourceError::RateLimited {
            context: format!("slack {}", method),
            retry_after: None,
        },
        "internal_error" | "fatal_error" | "service_unavailable" | "request_timeout" => {
            SourceError::Unavailable(format!("slack {} ({})", method, code))
        }
        _ => SourceError::Api {
            context: format!("slack {}", method),
            message: code,
        },
    }
}

/// Parse a Slack `ts` ("1712345678.000200") into a UTC instant.
fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, ""));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().take(6).collect();
        format!("{:0<6}", digits).parse().ok()?
    };
    Utc.timestamp_opt(secs, micros * 1_000).single()
}

/// Format an instant the way `conversations.history` expects `oldest`.
fn format_ts(t: DateTime<Utc>) -> String {
    format!("{}.{:06}", t.timestamp(), t.timestamp_subsec_micros())
}

fn permalink(team_id: &str, channel: &str, ts: &str) -> String {
    format!(
        "https://app.slack.com/client/{}/{}/thread/{}-{}",
        team_id, channel, channel, ts
    )
}
