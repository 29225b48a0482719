//! Core domain model for SOM: sheet layout, changelog cursor, tracked rows and the row mapper.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "som-core";

/// Rows with fewer populated leading cells than this never reach the store.
pub const MIN_POPULATED_CELLS: usize = 4;

/// Width of the `delivery_date` column (`CHAR(10)`).
pub const DELIVERY_DATE_WIDTH: usize = 10;

/// Scale of the `NUMERIC(12, 2)` amount columns.
pub const AMOUNT_SCALE: u32 = 2;

/// Row ceiling of a Google spreadsheet (10M cells, so at most 10M rows even at one column).
pub const MAX_SHEET_ROWS: u32 = 10_000_000;

/// Exclusive upper bound on the magnitude of a `NUMERIC(12, 2)` value.
const AMOUNT_LIMIT: i64 = 10_000_000_000;

pub fn spreadsheet_link(spreadsheet_id: &str) -> String {
    format!("https://docs.google.com/spreadsheets/d/{spreadsheet_id}")
}

/// Opaque provider-issued changelog position. Empty means "never synced".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangelogCursor(String);

impl ChangelogCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangelogCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Result of walking the changelog forward from a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCheck {
    pub changed: bool,
    /// Set only when the provider issued a fresh start token on the last page.
    pub new_cursor: Option<ChangelogCursor>,
}

impl ChangeCheck {
    pub fn unchanged() -> Self {
        Self {
            changed: false,
            new_cursor: None,
        }
    }
}

/// Durable sync state, written after every successful cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub spreadsheet_id: String,
    #[serde(default)]
    pub sheet_id: Option<i64>,
    #[serde(default)]
    pub change_cursor: ChangelogCursor,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            sheet_id: None,
            change_cursor: ChangelogCursor::empty(),
            last_sync: None,
        }
    }

    /// State after a fully reconciled cycle.
    pub fn advanced(&self, cursor: ChangelogCursor, at: DateTime<Utc>) -> Self {
        Self {
            change_cursor: cursor,
            last_sync: Some(at),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("chunk size must be positive")]
    ZeroChunk,
    #[error("invalid column letter {0:?}")]
    BadColumn(String),
    #[error("column range {start}:{end} spans {span} columns, at least {required} are needed")]
    NarrowRange {
        start: String,
        end: String,
        span: usize,
        required: usize,
    },
    #[error("sheet name must not be empty")]
    EmptySheetName,
    #[error("{field} {value} exceeds the {max} row limit of a spreadsheet")]
    TooManyRows {
        field: &'static str,
        value: u32,
        max: u32,
    },
}

/// Where the tracked rows live inside the remote spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    pub sheet_name: String,
    pub header_offset: u32,
    pub start_column: String,
    pub end_column: String,
    pub chunk_size: u32,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            sheet_name: "SourceSheet".to_string(),
            header_offset: 1,
            start_column: "A".to_string(),
            end_column: "D".to_string(),
            // A freshly created Google sheet has 1000 rows.
            chunk_size: 1000,
        }
    }
}

impl SheetLayout {
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.sheet_name.trim().is_empty() {
            return Err(LayoutError::EmptySheetName);
        }
        if self.chunk_size == 0 {
            return Err(LayoutError::ZeroChunk);
        }
        for (field, value) in [
            ("chunk size", self.chunk_size),
            ("header offset", self.header_offset),
        ] {
            if value > MAX_SHEET_ROWS {
                return Err(LayoutError::TooManyRows {
                    field,
                    value,
                    max: MAX_SHEET_ROWS,
                });
            }
        }
        let start = column_index(&self.start_column)?;
        let end = column_index(&self.end_column)?;
        let span = if end >= start { end - start + 1 } else { 0 };
        if span < MIN_POPULATED_CELLS {
            return Err(LayoutError::NarrowRange {
                start: self.start_column.clone(),
                end: self.end_column.clone(),
                span,
                required: MIN_POPULATED_CELLS,
            });
        }
        Ok(())
    }

    /// 1-based sheet rows `[first, last]` covered by the chunk at logical `offset`.
    /// `None` once the window no longer fits a row number.
    pub fn window_bounds(&self, offset: u32) -> Option<(u32, u32)> {
        let first = offset.checked_add(self.header_offset)?.checked_add(1)?;
        let last = last_row(first, self.chunk_size)?;
        Some((first, last))
    }

    /// A1 notation for `count` rows starting at sheet row `first_row`.
    pub fn a1_range(&self, first_row: u32, count: u32) -> Option<String> {
        let last = last_row(first_row, count)?;
        Some(format!(
            "{}!{}{}:{}{}",
            self.sheet_name, self.start_column, first_row, self.end_column, last
        ))
    }
}

fn last_row(first_row: u32, count: u32) -> Option<u32> {
    first_row.checked_add(count.max(1) - 1)
}

/// Zero-based index of a spreadsheet column letter (`A` = 0, `AA` = 26).
pub fn column_index(letters: &str) -> Result<usize, LayoutError> {
    let trimmed = letters.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(LayoutError::BadColumn(letters.to_string()));
    }
    let index = trimmed
        .to_ascii_uppercase()
        .bytes()
        .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize);
    Ok(index - 1)
}

/// Contiguous block of raw rows read from the remote sheet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowWindow {
    /// Sheet row of `rows[0]`.
    pub start_row: u32,
    pub rows: Vec<Vec<String>>,
}

impl RowWindow {
    pub fn new(start_row: u32, rows: Vec<Vec<String>>) -> Self {
        Self { start_row, rows }
    }

    pub fn empty(start_row: u32) -> Self {
        Self {
            start_row,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn end_row(&self) -> Option<u32> {
        if self.rows.is_empty() {
            None
        } else {
            Some(self.start_row + self.rows.len() as u32 - 1)
        }
    }

    /// Rows paired with their absolute sheet position.
    pub fn positioned(&self) -> impl Iterator<Item = (u32, &[String])> + '_ {
        self.rows
            .iter()
            .enumerate()
            .map(move |(i, cells)| (self.start_row + i as u32, cells.as_slice()))
    }
}

/// Mapped row as it leaves the mapper. Sourced values stay textual; the sink owns typing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRow {
    pub row_position: u32,
    pub sequence_number: String,
    pub order_identifier: String,
    pub amount_usd: String,
    pub delivery_date: String,
    pub amount_rub: Decimal,
}

/// Typed row as stored in and read back from the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOrder {
    pub row_position: i32,
    pub sequence_number: String,
    pub order_identifier: String,
    pub amount_usd: Decimal,
    pub amount_rub: Decimal,
    pub delivery_date: String,
}

impl TryFrom<&TrackedRow> for StoredOrder {
    type Error = RowRejection;

    fn try_from(row: &TrackedRow) -> Result<Self, Self::Error> {
        let row_position = i32::try_from(row.row_position)
            .map_err(|_| RowRejection::PositionOutOfRange(row.row_position))?;
        Ok(Self {
            row_position,
            sequence_number: row.sequence_number.clone(),
            order_identifier: row.order_identifier.clone(),
            amount_usd: parse_amount(&row.amount_usd)?,
            amount_rub: fit_amount(row.amount_rub)?,
            delivery_date: fixed_width_date(&row.delivery_date)?,
        })
    }
}

impl StoredOrder {
    /// `amount_rub = amount_usd * rate` at column precision.
    pub fn with_rate(mut self, rate: &ExchangeRate) -> Self {
        self.amount_rub = convert_amount(self.amount_usd, rate);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("row has {populated} populated cells, at least {required} required")]
    TooShort { populated: usize, required: usize },
    #[error("amount {0:?} is not a decimal number")]
    InvalidAmount(String),
    #[error("amount {0} does not fit NUMERIC(12, 2)")]
    AmountOutOfRange(Decimal),
    #[error("delivery date {0:?} is wider than 10 characters")]
    DateTooWide(String),
    #[error("row position {0} does not fit the key column")]
    PositionOutOfRange(u32),
}

/// Accepts `10.5`, `10,5`, `1 234,50`, `1,234.50`, `1.234,50` and a leading `$`.
pub fn parse_amount(raw: &str) -> Result<Decimal, RowRejection> {
    let compact: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    let normalized = match (compact.rfind(','), compact.rfind('.')) {
        // The later separator is the decimal one; the other groups thousands.
        (Some(comma), Some(dot)) if dot > comma => compact.replace(',', ""),
        (Some(_), Some(_)) => compact.replace('.', "").replace(',', "."),
        (Some(_), None) if compact.matches(',').count() > 1 => compact.replace(',', ""),
        (Some(_), None) => compact.replace(',', "."),
        _ => compact,
    };
    let value = Decimal::from_str(&normalized)
        .map_err(|_| RowRejection::InvalidAmount(raw.to_string()))?;
    fit_amount(value)
}

fn fit_amount(value: Decimal) -> Result<Decimal, RowRejection> {
    let rounded = value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero);
    if rounded.abs() >= Decimal::from(AMOUNT_LIMIT) {
        return Err(RowRejection::AmountOutOfRange(value));
    }
    Ok(rounded)
}

/// Pads to `CHAR(10)` the way the store does; never parses the date.
pub fn fixed_width_date(raw: &str) -> Result<String, RowRejection> {
    let trimmed = raw.trim();
    if trimmed.chars().count() > DELIVERY_DATE_WIDTH {
        return Err(RowRejection::DateTooWide(raw.to_string()));
    }
    Ok(format!("{trimmed:<width$}", width = DELIVERY_DATE_WIDTH))
}

pub fn convert_amount(amount_usd: Decimal, rate: &ExchangeRate) -> Decimal {
    (amount_usd * rate.value())
        .round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Positional column table: which raw cell feeds which field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub sequence_number: usize,
    pub order_identifier: usize,
    pub amount_usd: usize,
    pub delivery_date: usize,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            sequence_number: 0,
            order_identifier: 1,
            amount_usd: 2,
            delivery_date: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMapper {
    columns: ColumnMap,
    min_populated: usize,
}

impl Default for RowMapper {
    fn default() -> Self {
        Self {
            columns: ColumnMap::default(),
            min_populated: MIN_POPULATED_CELLS,
        }
    }
}

impl RowMapper {
    /// Number of leading cells up to the last non-blank one.
    pub fn populated_len(cells: &[String]) -> usize {
        cells
            .iter()
            .rposition(|c| !c.trim().is_empty())
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    pub fn map(&self, row_position: u32, cells: &[String]) -> Result<TrackedRow, RowRejection> {
        let populated = Self::populated_len(cells);
        if populated < self.min_populated {
            return Err(RowRejection::TooShort {
                populated,
                required: self.min_populated,
            });
        }
        let cell = |idx: usize| cells.get(idx).map(|c| c.trim().to_string()).unwrap_or_default();
        Ok(TrackedRow {
            row_position,
            sequence_number: cell(self.columns.sequence_number),
            order_identifier: cell(self.columns.order_identifier),
            amount_usd: cell(self.columns.amount_usd),
            delivery_date: cell(self.columns.delivery_date),
            amount_rub: Decimal::ZERO,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateRejection {
    #[error("exchange rate must be positive, got {0}")]
    NotPositive(Decimal),
    #[error("exchange rate {0} is not a finite number")]
    NotFinite(f64),
}

/// Positive USD to RUB rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate(Decimal);

impl ExchangeRate {
    pub fn new(value: Decimal) -> Result<Self, RateRejection> {
        if value <= Decimal::ZERO {
            return Err(RateRejection::NotPositive(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<f64> for ExchangeRate {
    type Error = RateRejection;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        let decimal = Decimal::try_from(value).map_err(|_| RateRejection::NotFinite(value))?;
        Self::new(decimal)
    }
}

impl fmt::Display for ExchangeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
