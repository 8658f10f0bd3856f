//! On-disk artifact store.
//!
//! One place owns the directory layout for every input and output:
//!
//! ```text
//! <root>/digest/<PAIR>/window_<W>/week_<YYYY-MM-DD>.csv           (input)
//! <root>/knn/grids/<PAIR>/window_<W>/week_<date>.json             metric cube
//! <root>/knn/trades/<PAIR>/window_<W>/week_<date>/<side>_N<N>_theta<θ>.parquet
//! <root>/knn/audit/<PAIR>/window_<W>/week_<date>.parquet          per-row audit
//! <root>/knn/params/<PAIR>/week_<date>.json                       manifest
//! <root>/knn/eval/<PAIR>/week_<date>.json                         week summary
//! <root>/knn/eval/<PAIR>/week_<date>_trades.parquet               merged log
//! ```
//!
//! Every output path is unique per (pair, week, window), so parallel grid
//! workers never write the same file.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime};
use polars::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::parser::{parse_digest, MalformedRowPolicy, ParseError};
use super::types::{DigestRow, Side, TradeRecord};
use crate::walkforward::{AuditRow, GridCube, MergedTrade, ParameterManifest, WeekSummary};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest parse error in {path}: {source}")]
    Parse { path: String, source: ParseError },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How digest timestamps are expressed upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBase {
    /// Milliseconds since the week's Monday 00:00 UTC.
    #[default]
    WeekRelative,
    /// Milliseconds since the Unix epoch.
    Absolute,
}

impl TimeBase {
    /// Offset that moves a week's timestamps onto the epoch axis.
    pub fn offset_ms(&self, monday: NaiveDate) -> i64 {
        match self {
            Self::WeekRelative => monday.and_time(NaiveTime::MIN).and_utc().timestamp_millis(),
            Self::Absolute => 0,
        }
    }
}

/// Digest loading options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestOptions {
    pub policy: MalformedRowPolicy,
    pub time_base: TimeBase,
}

/// Artifact store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ------------------------------------------------------------------
    // Paths

    fn digest_dir(&self, pair: &str, window: u32) -> PathBuf {
        self.root
            .join("digest")
            .join(pair)
            .join(format!("window_{}", window))
    }

    pub fn digest_file(&self, pair: &str, monday: NaiveDate, window: u32) -> PathBuf {
        self.digest_dir(pair, window).join(week_file_name(monday, "csv"))
    }

    pub fn grid_file(&self, pair: &str, monday: NaiveDate, window: u32) -> PathBuf {
        self.root
            .join("knn")
            .join("grids")
            .join(pair)
            .join(format!("window_{}", window))
            .join(week_file_name(monday, "json"))
    }

    pub fn trade_dir(&self, pair: &str, monday: NaiveDate, window: u32) -> PathBuf {
        self.root
            .join("knn")
            .join("trades")
            .join(pair)
            .join(format!("window_{}", window))
            .join(format!("week_{}", monday))
    }

    pub fn trade_file(
        &self,
        pair: &str,
        monday: NaiveDate,
        window: u32,
        side: Side,
        n: usize,
        theta: f64,
    ) -> PathBuf {
        self.trade_dir(pair, monday, window)
            .join(format!("{}_N{}_theta{}.parquet", side, n, theta))
    }

    pub fn audit_file(&self, pair: &str, monday: NaiveDate, window: u32) -> PathBuf {
        self.root
            .join("knn")
            .join("audit")
            .join(pair)
            .join(format!("window_{}", window))
            .join(week_file_name(monday, "parquet"))
    }

    pub fn params_file(&self, pair: &str, monday: NaiveDate) -> PathBuf {
        self.root
            .join("knn")
            .join("params")
            .join(pair)
            .join(week_file_name(monday, "json"))
    }

    pub fn eval_file(&self, pair: &str, monday: NaiveDate) -> PathBuf {
        self.root
            .join("knn")
            .join("eval")
            .join(pair)
            .join(week_file_name(monday, "json"))
    }

    pub fn eval_log_file(&self, pair: &str, monday: NaiveDate) -> PathBuf {
        self.root
            .join("knn")
            .join("eval")
            .join(pair)
            .join(format!("week_{}_trades.parquet", monday))
    }

    // ------------------------------------------------------------------
    // Digest input

    /// Mondays that have a digest file for `pair`/`window`, oldest first.
    pub fn list_mondays(&self, pair: &str, window: u32) -> Result<Vec<NaiveDate>, StoreError> {
        let dir = self.digest_dir(pair, window);
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut mondays = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if let Some(date) = name
                .strip_prefix("week_")
                .and_then(|s| s.strip_suffix(".csv"))
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            {
                mondays.push(date);
            }
        }
        mondays.sort();
        Ok(mondays)
    }

    /// Load one week of digest rows on the epoch time axis.
    pub fn load_week(
        &self,
        pair: &str,
        monday: NaiveDate,
        window: u32,
        options: DigestOptions,
    ) -> Result<Vec<DigestRow>, StoreError> {
        let path = self.digest_file(pair, monday, window);
        if !path.exists() {
            return Err(StoreError::FileNotFound(path.display().to_string()));
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let parsed = parse_digest(reader, Some(window), options.policy).map_err(|source| {
            StoreError::Parse {
                path: path.display().to_string(),
                source,
            }
        })?;
        if parsed.skipped > 0 {
            warn!(
                "{}: skipped {} malformed rows, kept {}",
                path.display(),
                parsed.skipped,
                parsed.rows.len()
            );
        }

        let offset = options.time_base.offset_ms(monday);
        parsed
            .rows
            .iter()
            .map(|r| {
                r.shifted(offset).ok_or_else(|| {
                    StoreError::InvalidData(format!(
                        "{}: time {} cannot be rebased by {} ms",
                        path.display(),
                        r.time_ms,
                        offset
                    ))
                })
            })
            .collect()
    }

    /// Concatenate several weeks in the given order; missing weeks are skipped.
    pub fn load_weeks(
        &self,
        pair: &str,
        mondays: &[NaiveDate],
        window: u32,
        options: DigestOptions,
    ) -> Result<Vec<DigestRow>, StoreError> {
        let mut rows = Vec::new();
        for &monday in mondays {
            match self.load_week(pair, monday, window, options) {
                Ok(week) => rows.extend(week),
                Err(StoreError::FileNotFound(path)) => {
                    debug!("No digest for {} window {}: {}", monday, window, path);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        rows.sort_by_key(|r| r.time_ms);
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Grid artifacts

    pub fn save_cube(&self, cube: &GridCube) -> Result<PathBuf, StoreError> {
        let path = self.grid_file(&cube.pair, cube.week, cube.window);
        write_json(&path, cube)?;
        Ok(path)
    }

    pub fn load_cube(&self, pair: &str, monday: NaiveDate, window: u32) -> Result<GridCube, StoreError> {
        read_json(&self.grid_file(pair, monday, window))
    }

    pub fn save_trades(&self, path: &Path, trades: &[TradeRecord]) -> Result<(), StoreError> {
        let mut df = DataFrame::new(vec![
            Series::new("entry_ms".into(), trades.iter().map(|t| t.entry_ms).collect::<Vec<_>>()).into(),
            Series::new("exit_ms".into(), trades.iter().map(|t| t.exit_ms).collect::<Vec<_>>()).into(),
            Series::new("pl".into(), trades.iter().map(|t| t.pl).collect::<Vec<_>>()).into(),
        ])?;
        write_parquet(path, &mut df)
    }

    pub fn load_trades(&self, path: &Path) -> Result<Vec<TradeRecord>, StoreError> {
        let df = read_parquet(path)?;
        let entry = df.column("entry_ms")?.i64()?;
        let exit = df.column("exit_ms")?.i64()?;
        let pl = df.column("pl")?.f64()?;

        entry
            .into_iter()
            .zip(exit.into_iter())
            .zip(pl.into_iter())
            .enumerate()
            .map(|(idx, ((entry_ms, exit_ms), pl))| match (entry_ms, exit_ms, pl) {
                (Some(entry_ms), Some(exit_ms), Some(pl)) => Ok(TradeRecord {
                    entry_ms,
                    exit_ms,
                    pl,
                }),
                _ => Err(StoreError::InvalidData(format!(
                    "{}: null value in row {}",
                    path.display(),
                    idx
                ))),
            })
            .collect()
    }

    pub fn save_audit(&self, path: &Path, rows: &[AuditRow]) -> Result<(), StoreError> {
        let mut df = DataFrame::new(vec![
            Series::new("side".into(), rows.iter().map(|r| r.side.as_str()).collect::<Vec<_>>()).into(),
            Series::new("N".into(), rows.iter().map(|r| r.n as u64).collect::<Vec<_>>()).into(),
            Series::new("theta".into(), rows.iter().map(|r| r.theta).collect::<Vec<_>>()).into(),
            Series::new("tau".into(), rows.iter().map(|r| r.tau).collect::<Vec<_>>()).into(),
            Series::new("time_ms".into(), rows.iter().map(|r| r.time_ms).collect::<Vec<_>>()).into(),
            Series::new("verdict".into(), rows.iter().map(|r| r.verdict.as_str()).collect::<Vec<_>>()).into(),
            Series::new("cv".into(), rows.iter().map(|r| r.cv).collect::<Vec<_>>()).into(),
            Series::new("wins".into(), rows.iter().map(|r| r.wins).collect::<Vec<_>>()).into(),
            Series::new("draws".into(), rows.iter().map(|r| r.draws).collect::<Vec<_>>()).into(),
            Series::new("losses".into(), rows.iter().map(|r| r.losses).collect::<Vec<_>>()).into(),
            Series::new("edge".into(), rows.iter().map(|r| r.edge).collect::<Vec<_>>()).into(),
            Series::new("signal".into(), rows.iter().map(|r| r.signal).collect::<Vec<_>>()).into(),
        ])?;
        write_parquet(path, &mut df)
    }

    // ------------------------------------------------------------------
    // Selection and evaluation artifacts

    pub fn save_manifest(&self, pair: &str, manifest: &ParameterManifest) -> Result<PathBuf, StoreError> {
        let path = self.params_file(pair, manifest.week);
        write_json(&path, manifest)?;
        Ok(path)
    }

    pub fn load_manifest(&self, pair: &str, monday: NaiveDate) -> Result<ParameterManifest, StoreError> {
        read_json(&self.params_file(pair, monday))
    }

    pub fn save_summary(&self, pair: &str, summary: &WeekSummary) -> Result<PathBuf, StoreError> {
        let path = self.eval_file(pair, summary.week);
        write_json(&path, summary)?;
        Ok(path)
    }

    pub fn load_summary(&self, pair: &str, monday: NaiveDate) -> Result<WeekSummary, StoreError> {
        read_json(&self.eval_file(pair, monday))
    }

    pub fn save_trade_log(&self, pair: &str, monday: NaiveDate, trades: &[MergedTrade]) -> Result<PathBuf, StoreError> {
        let path = self.eval_log_file(pair, monday);
        let mut df = DataFrame::new(vec![
            Series::new("window".into(), trades.iter().map(|t| t.window).collect::<Vec<_>>()).into(),
            Series::new("side".into(), trades.iter().map(|t| t.side.as_str()).collect::<Vec<_>>()).into(),
            Series::new("N".into(), trades.iter().map(|t| t.n as u64).collect::<Vec<_>>()).into(),
            Series::new("theta".into(), trades.iter().map(|t| t.theta).collect::<Vec<_>>()).into(),
            Series::new("entry_ms".into(), trades.iter().map(|t| t.trade.entry_ms).collect::<Vec<_>>()).into(),
            Series::new("exit_ms".into(), trades.iter().map(|t| t.trade.exit_ms).collect::<Vec<_>>()).into(),
            Series::new("pl".into(), trades.iter().map(|t| t.trade.pl).collect::<Vec<_>>()).into(),
        ])?;
        write_parquet(&path, &mut df)?;
        Ok(path)
    }
}

fn week_file_name(monday: NaiveDate, ext: &str) -> String {
    format!("week_{}.{}", monday, ext)
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    ensure_parent(path)?;
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Err(StoreError::FileNotFound(path.display().to_string()));
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_parquet(path: &Path, df: &mut DataFrame) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let file = fs::File::create(path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(Some(ZstdLevel::try_new(3)?)))
        .finish(df)?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<DataFrame, StoreError> {
    if !path.exists() {
        return Err(StoreError::FileNotFound(path.display().to_string()));
    }
    let file = fs::File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}
