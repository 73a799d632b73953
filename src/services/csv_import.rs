//! Statement CSV parsing and normalization.
//!
//! Parses a raw bank export into typed rows using the property's configured
//! dialect. Ingestion is all-or-nothing: the first bad row aborts the whole
//! file so a partially ingested batch can never exist.

use crate::config::{CsvDialect, ReconciliationConfig};
use crate::error::IngestError;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Accepted date formats, tried in order; first match wins.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y"];

/// One typed statement row, 1-indexed by source position. Amounts are still
/// in the stated currency; the currency normalizer runs afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub row_number: usize,
    pub date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub currency: String,
    pub reference: Option<String>,
}

struct ColumnMap {
    date: usize,
    description: usize,
    amount: usize,
    currency: Option<usize>,
    reference: Option<usize>,
}

/// Parse a raw statement export into typed rows.
pub fn parse_statement(
    bytes: &[u8],
    config: &ReconciliationConfig,
) -> Result<Vec<ParsedRow>, IngestError> {
    let dialect = &config.csv;
    let text = decode(bytes, dialect)?;

    let mut reader = ReaderBuilder::new()
        .delimiter(dialect.delimiter as u8)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|_| IngestError::MissingHeader)?
        .clone();
    if headers.is_empty() {
        return Err(IngestError::MissingHeader);
    }

    let columns = map_columns(&headers, dialect)?;

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let row_number = idx + 1;
        let record = record.map_err(|e| IngestError::MalformedRecord {
            row: row_number,
            message: e.to_string(),
        })?;

        let date_raw = required_field(&record, columns.date, row_number, &dialect.date_column)?;
        let description = required_field(
            &record,
            columns.description,
            row_number,
            &dialect.description_column,
        )?;
        let amount_raw =
            required_field(&record, columns.amount, row_number, &dialect.amount_column)?;

        let date = parse_date(date_raw).ok_or_else(|| IngestError::UnparsableDate {
            row: row_number,
            value: date_raw.to_string(),
        })?;
        let amount = parse_amount(amount_raw).ok_or_else(|| IngestError::UnparsableAmount {
            row: row_number,
            value: amount_raw.to_string(),
        })?;

        let currency = columns
            .currency
            .and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| config.base_currency.clone());
        let reference = columns
            .reference
            .and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        rows.push(ParsedRow {
            row_number,
            date,
            description: description.to_string(),
            amount,
            currency,
            reference,
        });
    }

    Ok(rows)
}

fn decode(bytes: &[u8], dialect: &CsvDialect) -> Result<String, IngestError> {
    let encoding = encoding_rs::Encoding::for_label(dialect.encoding.as_bytes())
        .ok_or_else(|| IngestError::UnsupportedEncoding(dialect.encoding.clone()))?;
    let (text, _, _) = encoding.decode(bytes);
    Ok(text.into_owned())
}

fn map_columns(headers: &csv::StringRecord, dialect: &CsvDialect) -> Result<ColumnMap, IngestError> {
    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let required = |name: &str| {
        find(name).ok_or_else(|| IngestError::MissingColumn {
            row: 1,
            column: name.to_string(),
        })
    };

    Ok(ColumnMap {
        date: required(&dialect.date_column)?,
        description: required(&dialect.description_column)?,
        amount: required(&dialect.amount_column)?,
        currency: dialect.currency_column.as_deref().and_then(find),
        reference: dialect.reference_column.as_deref().and_then(find),
    })
}

fn required_field<'r>(
    record: &'r csv::StringRecord,
    index: usize,
    row: usize,
    column: &str,
) -> Result<&'r str, IngestError> {
    match record.get(index).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(IngestError::MissingColumn {
            row,
            column: column.to_string(),
        }),
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Parse a bank-formatted amount: currency symbols and spaces stripped,
/// thousands separators removed (both `1.234,56` and `1,234.56` conventions),
/// rounded half-up to 2 decimal places.
pub fn parse_amount(value: &str) -> Option<Decimal> {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }

    let normalized = normalize_separators(&cleaned);
    let amount = Decimal::from_str(&normalized).ok()?;
    Some(amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

fn normalize_separators(s: &str) -> String {
    let last_dot = s.rfind('.');
    let last_comma = s.rfind(',');

    match (last_dot, last_comma) {
        // Both present: the one occurring last is the decimal separator.
        (Some(dot), Some(comma)) => {
            if dot > comma {
                s.replace(',', "")
            } else {
                s.replace('.', "").replace(',', ".")
            }
        }
        // Comma only: decimal separator when it looks like one (single
        // occurrence, at most two trailing digits), thousands otherwise.
        (None, Some(comma)) => {
            let single = s.matches(',').count() == 1;
            let decimals = s.len() - comma - 1;
            if single && decimals <= 2 {
                s.replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        // Dot only: same heuristic.
        (Some(dot), None) => {
            let single = s.matches('.').count() == 1;
            let decimals = s.len() - dot - 1;
            if single && decimals <= 2 {
                s.to_string()
            } else {
                s.replace('.', "")
            }
        }
        (None, None) => s.to_string(),
    }
}
