//! Google Sheets v4 REST transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::SheetsTransport;
use crate::config::MirrorConfig;
use crate::error::{ConfigError, MirrorError, Result};

/// Longest error body excerpt kept in [`MirrorError::Http`].
const ERROR_BODY_LIMIT: usize = 300;

/// A1 notation for a whole table: `'Name'`, with embedded quotes doubled.
#[must_use]
pub fn quote_table(table: &str) -> String {
    format!("'{}'", table.replace('\'', "''"))
}

/// A1 range covering every column from 0-based `first_row` down.
fn rows_from(table: &str, first_row: usize) -> String {
    format!("{}!A{}:{LAST_COLUMN}", quote_table(table), first_row + 1)
}

/// Rightmost column the service allows.
const LAST_COLUMN: &str = "ZZZ";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

/// Talks to `https://sheets.googleapis.com/v4/spreadsheets/{id}` with a
/// bearer access token.
#[derive(Debug, Clone)]
pub struct HttpSheetsTransport {
    client: Client,
    spreadsheet: Url,
    spreadsheet_id: String,
    token: String,
}

impl HttpSheetsTransport {
    pub fn from_config(config: &MirrorConfig) -> Result<Self> {
        let token = config
            .access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "mirror.access_token".into(),
                reason: "an access token is required when the mirror is enabled".into(),
            })?;
        let base = format!(
            "{}/spreadsheets/{}",
            config.api_base.trim_end_matches('/'),
            config.spreadsheet_id
        );
        let spreadsheet = Url::parse(&base).map_err(|e| ConfigError::InvalidValue {
            field: "mirror.api_base".into(),
            reason: e.to_string(),
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("tillsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MirrorError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            spreadsheet,
            spreadsheet_id: config.spreadsheet_id.clone(),
            token,
        })
    }

    /// `.../spreadsheets/{id}/values/{range}{suffix}`
    fn values_url(&self, range: &str, suffix: &str) -> Result<Url> {
        let mut url = self.spreadsheet.clone();
        url.path_segments_mut()
            .map_err(|()| MirrorError::InvalidResponse("api_base cannot be a base URL".into()))?
            .push("values")
            .push(&format!("{range}{suffix}"));
        Ok(url)
    }

    /// `.../spreadsheets/{id}:batchUpdate`
    fn batch_update_url(&self) -> Result<Url> {
        let mut url = self.spreadsheet.clone();
        url.path_segments_mut()
            .map_err(|()| MirrorError::InvalidResponse("api_base cannot be a base URL".into()))?
            .pop()
            .push(&format!("{}:batchUpdate", self.spreadsheet_id));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.token)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| MirrorError::Transport(e.to_string()))?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "sheets response");
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        if code == 401 || code == 403 {
            return Err(MirrorError::Unauthorized { status: code }.into());
        }
        let mut message = response.text().await.unwrap_or_default();
        if message.len() > ERROR_BODY_LIMIT {
            let cut = (0..=ERROR_BODY_LIMIT)
                .rev()
                .find(|i| message.is_char_boundary(*i))
                .unwrap_or(0);
            message.truncate(cut);
        }
        Err(MirrorError::Http {
            status: code,
            message,
        }
        .into())
    }

    async fn get_values(&self, range: &str) -> Result<Vec<Vec<Value>>> {
        let url = self.values_url(range, "")?;
        let response = self
            .send(
                self.request(Method::GET, url)
                    .query(&[("valueRenderOption", "FORMATTED_VALUE")]),
            )
            .await?;
        let body: ValueRange = response
            .json()
            .await
            .map_err(|e| MirrorError::InvalidResponse(e.to_string()))?;
        Ok(body.values)
    }

    async fn put_values(&self, range: &str, values: Value) -> Result<()> {
        let url = self.values_url(range, "")?;
        self.send(
            self.request(Method::PUT, url)
                .query(&[("valueInputOption", "RAW")])
                .json(&json!({ "majorDimension": "ROWS", "values": values })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SheetsTransport for HttpSheetsTransport {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let response = self
            .send(
                self.request(Method::GET, self.spreadsheet.clone())
                    .query(&[("fields", "sheets.properties.title")]),
            )
            .await?;
        let meta: SpreadsheetMeta = response
            .json()
            .await
            .map_err(|e| MirrorError::InvalidResponse(e.to_string()))?;
        Ok(meta.sheets.into_iter().map(|s| s.properties.title).collect())
    }

    async fn add_table(&self, table: &str) -> Result<()> {
        let body = json!({
            "requests": [{ "addSheet": { "properties": { "title": table } } }]
        });
        self.send(self.request(Method::POST, self.batch_update_url()?).json(&body))
            .await?;
        Ok(())
    }

    async fn read_header(&self, table: &str) -> Result<Vec<Value>> {
        let mut rows = self.get_values(&format!("{}!1:1", quote_table(table))).await?;
        Ok(if rows.is_empty() {
            Vec::new()
        } else {
            rows.swap_remove(0)
        })
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<Vec<Value>>> {
        self.get_values(&quote_table(table)).await
    }

    async fn write_header(&self, table: &str, headers: &[String]) -> Result<()> {
        self.put_values(&format!("{}!A1", quote_table(table)), json!([headers]))
            .await
    }

    async fn append_rows(&self, table: &str, rows: &[Vec<Value>]) -> Result<()> {
        let url = self.values_url(&format!("{}!A1", quote_table(table)), ":append")?;
        self.send(
            self.request(Method::POST, url)
                .query(&[
                    ("valueInputOption", "RAW"),
                    ("insertDataOption", "INSERT_ROWS"),
                ])
                .json(&json!({ "majorDimension": "ROWS", "values": rows })),
        )
        .await?;
        Ok(())
    }

    async fn clear_from(&self, table: &str, first_row: usize) -> Result<()> {
        let url = self.values_url(&rows_from(table, first_row), ":clear")?;
        self.send(self.request(Method::POST, url).json(&json!({})))
            .await?;
        Ok(())
    }

    async fn write_rows(&self, table: &str, rows: &[Vec<Value>]) -> Result<()> {
        self.put_values(&format!("{}!A1", quote_table(table)), json!(rows))
            .await
    }
}
