//! Remote source adapters: the spreadsheet table client and the exchange-rate feed.

use std::str::FromStr;

use async_trait::async_trait;
use reqwest::Url;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use som_core::{ChangeCheck, ChangelogCursor, ExchangeRate, RateRejection, RowWindow, SheetLayout};
use som_storage::{ApiClient, FetchError};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "som-adapters";

pub const DEFAULT_DRIVE_BASE: &str = "https://www.googleapis.com";
pub const DEFAULT_SHEETS_BASE: &str = "https://sheets.googleapis.com";
pub const DEFAULT_RATE_FEED_URL: &str = "https://www.cbr.ru/scripts/XML_daily.asp";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{operation} failed for spreadsheet {spreadsheet_id}: {source}")]
    Fetch {
        operation: &'static str,
        spreadsheet_id: String,
        #[source]
        source: FetchError,
    },
    #[error("changelog page token {0:?} repeated")]
    StalledChangelog(String),
    #[error("cannot build endpoint url from {0}")]
    Url(String),
    #[error("{count} rows from row {first_row} run past the last row number")]
    RowOverflow { first_row: u32, count: u32 },
}

/// Read side of the remote table: change detection and range reads.
#[async_trait]
pub trait RemoteTableClient: Send + Sync {
    fn resource_id(&self) -> &str;

    /// Walk the changelog from `cursor` to its end.
    async fn has_changed_since(&self, cursor: &ChangelogCursor) -> Result<ChangeCheck, RemoteError>;

    /// Read `count` rows starting at 1-based sheet row `first_row`.
    async fn read_window(&self, first_row: u32, count: u32) -> Result<RowWindow, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub drive_base: Url,
    pub sheets_base: Url,
}

impl GoogleEndpoints {
    pub fn new(drive_base: &str, sheets_base: &str) -> Result<Self, RemoteError> {
        Ok(Self {
            drive_base: Url::parse(drive_base).map_err(|_| RemoteError::Url(drive_base.to_string()))?,
            sheets_base: Url::parse(sheets_base)
                .map_err(|_| RemoteError::Url(sheets_base.to_string()))?,
        })
    }

    /// Both APIs behind one host, as with a local mock server.
    pub fn single(base: &str) -> Result<Self, RemoteError> {
        Self::new(base, base)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageTokenResponse {
    start_page_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeListPage {
    #[serde(default)]
    changes: Vec<ChangeEntry>,
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeEntry {
    file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
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
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

/// Drive changelog + Sheets values client for one tracked spreadsheet.
#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    api: ApiClient,
    endpoints: GoogleEndpoints,
    spreadsheet_id: String,
    layout: SheetLayout,
}

impl GoogleSheetsClient {
    pub fn new(
        api: ApiClient,
        endpoints: GoogleEndpoints,
        spreadsheet_id: impl Into<String>,
        layout: SheetLayout,
    ) -> Self {
        Self {
            api,
            endpoints,
            spreadsheet_id: spreadsheet_id.into(),
            layout,
        }
    }

    /// Numeric id of the tracked sheet tab, looked up by its title.
    pub async fn resolve_sheet_id(&self) -> Result<Option<i64>, RemoteError> {
        let mut url = endpoint(
            &self.endpoints.sheets_base,
            &["v4", "spreadsheets", &self.spreadsheet_id],
        )?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");
        let meta: SpreadsheetMeta = self
            .api
            .get_json(&url)
            .await
            .map_err(|source| self.fetch_error("spreadsheets.get", source))?;
        Ok(meta
            .sheets
            .into_iter()
            .find(|s| s.properties.title == self.layout.sheet_name)
            .map(|s| s.properties.sheet_id))
    }

    async fn start_page_token(&self) -> Result<ChangelogCursor, RemoteError> {
        let url = endpoint(
            &self.endpoints.drive_base,
            &["drive", "v3", "changes", "startPageToken"],
        )?;
        let response: StartPageTokenResponse = self
            .api
            .get_json(&url)
            .await
            .map_err(|source| self.fetch_error("changes.getStartPageToken", source))?;
        Ok(ChangelogCursor::new(response.start_page_token))
    }

    async fn change_page(&self, page_token: &str) -> Result<ChangeListPage, RemoteError> {
        let mut url = endpoint(&self.endpoints.drive_base, &["drive", "v3", "changes"])?;
        url.query_pairs_mut()
            .append_pair("pageToken", page_token)
            .append_pair("spaces", "drive")
            .append_pair("pageSize", "1000");
        self.api
            .get_json(&url)
            .await
            .map_err(|source| self.fetch_error("changes.list", source))
    }

    fn fetch_error(&self, operation: &'static str, source: FetchError) -> RemoteError {
        RemoteError::Fetch {
            operation,
            spreadsheet_id: self.spreadsheet_id.clone(),
            source,
        }
    }
}

#[async_trait]
impl RemoteTableClient for GoogleSheetsClient {
    fn resource_id(&self) -> &str {
        &self.spreadsheet_id
    }

    async fn has_changed_since(&self, cursor: &ChangelogCursor) -> Result<ChangeCheck, RemoteError> {
        if cursor.is_empty() {
            let start = self.start_page_token().await?;
            info!(cursor = %start, "no changelog cursor yet, scheduling a full sync");
            return Ok(ChangeCheck {
                changed: true,
                new_cursor: Some(start),
            });
        }

        let mut page_token = cursor.as_str().to_string();
        let mut changed = false;
        let mut new_cursor = None;
        let mut pages = 0usize;

        loop {
            let page = self.change_page(&page_token).await?;
            pages += 1;

            if page
                .changes
                .iter()
                .any(|c| c.file_id.as_deref() == Some(self.spreadsheet_id.as_str()))
            {
                changed = true;
            }
            if let Some(token) = page.new_start_page_token {
                new_cursor = Some(ChangelogCursor::new(token));
            }
            match page.next_page_token {
                Some(next) if next == page_token => return Err(RemoteError::StalledChangelog(next)),
                Some(next) => page_token = next,
                None => break,
            }
        }

        debug!(pages, changed, "changelog walked");
        Ok(ChangeCheck {
            changed,
            new_cursor,
        })
    }

    async fn read_window(&self, first_row: u32, count: u32) -> Result<RowWindow, RemoteError> {
        let range = self
            .layout
            .a1_range(first_row, count)
            .ok_or(RemoteError::RowOverflow { first_row, count })?;
        let mut url = endpoint(
            &self.endpoints.sheets_base,
            &["v4", "spreadsheets", &self.spreadsheet_id, "values", &range],
        )?;
        url.query_pairs_mut().append_pair("majorDimension", "ROWS");
        let response: ValueRange = self
            .api
            .get_json(&url)
            .await
            .map_err(|source| self.fetch_error("values.get", source))?;

        let rows = response
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect::<Vec<Vec<String>>>();
        debug!(%range, rows = rows.len(), "window read");
        Ok(RowWindow::new(first_row, rows))
    }
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, RemoteError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| RemoteError::Url(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn cell_text(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum RateError {
    #[error("fetching rate feed {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("currency {0} not found in rate feed")]
    MissingCurrency(String),
    #[error("malformed {field} {value:?} for {currency}")]
    Malformed {
        currency: String,
        field: &'static str,
        value: String,
    },
    #[error("bad selector {0}")]
    Selector(String),
    #[error("invalid feed url {0}")]
    Url(String),
    #[error(transparent)]
    Rejected(#[from] RateRejection),
}

#[async_trait]
pub trait RateFeed: Send + Sync {
    async fn fetch_rate(&self) -> Result<ExchangeRate, RateError>;
}

/// Central Bank of Russia daily rates (`XML_daily.asp`).
#[derive(Debug, Clone)]
pub struct CbrRateFeed {
    api: ApiClient,
    url: Url,
    currency_code: String,
}

impl CbrRateFeed {
    pub fn new(api: ApiClient, url: &str, currency_code: impl Into<String>) -> Result<Self, RateError> {
        let url = Url::parse(url).map_err(|e| RateError::Url(format!("{url}: {e}")))?;
        Ok(Self {
            api,
            url,
            currency_code: currency_code.into(),
        })
    }
}

#[async_trait]
impl RateFeed for CbrRateFeed {
    async fn fetch_rate(&self) -> Result<ExchangeRate, RateError> {
        let response = self
            .api
            .get_bytes(&self.url)
            .await
            .map_err(|source| RateError::Fetch {
                url: self.url.to_string(),
                source,
            })?;
        // The feed is windows-1251; only ASCII tags and digits matter here.
        let text = String::from_utf8_lossy(&response.body);
        parse_daily_rates(&text, &self.currency_code)
    }
}

/// Pull `Value / Nominal` for `currency_code` out of a daily rates document.
pub fn parse_daily_rates(document: &str, currency_code: &str) -> Result<ExchangeRate, RateError> {
    let html = Html::parse_document(document);
    let valute = selector("valute")?;

    for node in html.select(&valute) {
        let code = child_text(&node, "charcode")?;
        if !code
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(currency_code))
        {
            continue;
        }

        let value = child_text(&node, "value")?.unwrap_or_default();
        let value = parse_feed_decimal(&value).ok_or_else(|| RateError::Malformed {
            currency: currency_code.to_string(),
            field: "Value",
            value: value.clone(),
        })?;
        let nominal = match child_text(&node, "nominal")? {
            Some(raw) => parse_feed_decimal(&raw)
                .filter(|n| !n.is_zero())
                .ok_or_else(|| RateError::Malformed {
                    currency: currency_code.to_string(),
                    field: "Nominal",
                    value: raw.clone(),
                })?,
            None => Decimal::ONE,
        };
        return Ok(ExchangeRate::new(value / nominal)?);
    }

    Err(RateError::MissingCurrency(currency_code.to_string()))
}

fn selector(raw: &str) -> Result<Selector, RateError> {
    Selector::parse(raw).map_err(|e| RateError::Selector(e.to_string()))
}

fn child_text(node: &ElementRef<'_>, name: &str) -> Result<Option<String>, RateError> {
    let sel = selector(name)?;
    Ok(node.select(&sel).next().and_then(|n| {
        let text = n.text().collect::<String>();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }))
}

fn parse_feed_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(&raw.trim().replace(',', ".")).ok()
}
