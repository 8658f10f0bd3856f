//! Typed parser for upstream digest files.
//!
//! Digest lines are comma separated with seven fields:
//!
//! ```text
//! time_ms,ask,bid,unk1,unk2,buyPL:buyExit:sellPL:sellExit[:buyNoHit:sellNoHit],window:a:b:c:r2
//! ```
//!
//! Every field the engine consumes is validated here so that nothing
//! downstream has to second-guess a row.

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::types::DigestRow;

/// Timestamps outside `0..=MAX_TIME_MS` are rejected. The bound leaves room
/// to rebase any accepted time onto the epoch axis without overflow.
pub const MAX_TIME_MS: i64 = 1 << 53;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {line}: expected 7 comma-separated fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("line {line}: invalid {field} value '{value}'")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: label field needs 4 or 6 ':'-separated parts, found {found}")]
    LabelFormat { line: usize, found: usize },

    #[error("line {line}: fit field needs 5 ':'-separated parts, found {found}")]
    FitFormat { line: usize, found: usize },

    #[error("line {line}: row belongs to window {found}, expected {expected}")]
    WindowMismatch { line: usize, expected: u32, found: u32 },

    #[error("line {line}: {field} out of range: {value}")]
    OutOfRange {
        line: usize,
        field: &'static str,
        value: f64,
    },

    #[error("line {line}: {side} exit {exit} precedes entry {entry}")]
    ExitBeforeEntry {
        line: usize,
        side: &'static str,
        entry: i64,
        exit: i64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Whether the error concerns a single line rather than the whole input.
    pub fn is_row_error(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// What to do with a line that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedRowPolicy {
    /// Log the line and drop it.
    #[default]
    Skip,
    /// Fail the whole week.
    Abort,
}

/// Rows of one digest file plus the number of dropped lines.
#[derive(Debug, Clone, Default)]
pub struct ParsedDigest {
    pub rows: Vec<DigestRow>,
    pub skipped: usize,
}

/// Parse one digest line. `line_no` is 1-based and only used in errors.
pub fn parse_digest_line(
    line: &str,
    line_no: usize,
    expected_window: Option<u32>,
) -> Result<DigestRow, ParseError> {
    let cols: Vec<&str> = line.trim().splitn(7, ',').map(str::trim).collect();
    if cols.len() != 7 {
        return Err(ParseError::FieldCount {
            line: line_no,
            found: cols.len(),
        });
    }

    let time_ms = parse_ms(cols[0], line_no, "time_ms")?;

    let label: Vec<&str> = cols[5].split(':').collect();
    if label.len() != 4 && label.len() != 6 {
        return Err(ParseError::LabelFormat {
            line: line_no,
            found: label.len(),
        });
    }
    let buy_pl = parse_f64(label[0], line_no, "buyPL")?;
    let buy_exit = parse_ms(label[1], line_no, "buyExit")?;
    let sell_pl = parse_f64(label[2], line_no, "sellPL")?;
    let sell_exit = parse_ms(label[3], line_no, "sellExit")?;
    let (buy_no_hit, sell_no_hit) = if label.len() == 6 {
        (
            parse_flag(label[4], line_no, "buyNoHit")?,
            parse_flag(label[5], line_no, "sellNoHit")?,
        )
    } else {
        (false, false)
    };

    let fit: Vec<&str> = cols[6].split(':').collect();
    if fit.len() != 5 {
        return Err(ParseError::FitFormat {
            line: line_no,
            found: fit.len(),
        });
    }
    let window = fit[0]
        .parse::<u32>()
        .map_err(|_| invalid(line_no, "window", fit[0]))?;
    if let Some(expected) = expected_window {
        if window != expected {
            return Err(ParseError::WindowMismatch {
                line: line_no,
                expected,
                found: window,
            });
        }
    }
    let a = parse_f64(fit[1], line_no, "a")?;
    let b = parse_f64(fit[2], line_no, "b")?;
    let c = parse_f64(fit[3], line_no, "c")?;
    let r2 = parse_f64(fit[4], line_no, "r2")?;
    if !(0.0..=1.0).contains(&r2) {
        return Err(ParseError::OutOfRange {
            line: line_no,
            field: "r2",
            value: r2,
        });
    }

    for (side, exit) in [("buy", buy_exit), ("sell", sell_exit)] {
        if exit < time_ms {
            return Err(ParseError::ExitBeforeEntry {
                line: line_no,
                side,
                entry: time_ms,
                exit,
            });
        }
    }

    Ok(DigestRow {
        time_ms,
        a,
        b,
        c,
        r2,
        buy_pl,
        sell_pl,
        buy_exit,
        sell_exit,
        buy_no_hit,
        sell_no_hit,
    })
}

/// Parse a whole digest file, applying `policy` to malformed lines.
///
/// Rows are returned sorted by `time_ms` (stable for equal times).
pub fn parse_digest<R: BufRead>(
    reader: R,
    expected_window: Option<u32>,
    policy: MalformedRowPolicy,
) -> Result<ParsedDigest, ParseError> {
    let mut parsed = ParsedDigest::default();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_digest_line(&line, idx + 1, expected_window) {
            Ok(row) => parsed.rows.push(row),
            Err(e) if policy == MalformedRowPolicy::Skip && e.is_row_error() => {
                warn!("Skipping malformed digest row: {}", e);
                parsed.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    parsed.rows.sort_by_key(|r| r.time_ms);
    Ok(parsed)
}

/// Render a row back into digest line form. Quote prices are not kept on
/// `DigestRow`, so they are written as zero.
pub fn format_digest_line(row: &DigestRow, window: u32) -> String {
    format!(
        "{},0,0,0,0,{}:{}:{}:{}:{}:{},{}:{}:{}:{}:{}",
        row.time_ms,
        row.buy_pl,
        row.buy_exit,
        row.sell_pl,
        row.sell_exit,
        row.buy_no_hit as u8,
        row.sell_no_hit as u8,
        window,
        row.a,
        row.b,
        row.c,
        row.r2
    )
}

fn invalid(line: usize, field: &'static str, value: &str) -> ParseError {
    ParseError::InvalidNumber {
        line,
        field,
        value: value.to_string(),
    }
}

fn parse_f64(s: &str, line: usize, field: &'static str) -> Result<f64, ParseError> {
    match s.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(invalid(line, field, s)),
    }
}

/// Millisecond timestamps are integers, but some producers write them as `123.0`.
fn parse_ms(s: &str, line: usize, field: &'static str) -> Result<i64, ParseError> {
    let s = s.trim();
    let v = match s.parse::<i64>() {
        Ok(v) => v,
        Err(_) => match s.parse::<f64>() {
            Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 => v as i64,
            _ => return Err(invalid(line, field, s)),
        },
    };
    if !(0..=MAX_TIME_MS).contains(&v) {
        return Err(ParseError::OutOfRange {
            line,
            field,
            value: v as f64,
        });
    }
    Ok(v)
}

fn parse_flag(s: &str, line: usize, field: &'static str) -> Result<bool, ParseError> {
    match s.trim() {
        "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        other => Err(invalid(line, field, other)),
    }
}
