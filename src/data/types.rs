//! Core data types for the walk-forward engine.
//!
//! A digest row is one candidate decision point produced upstream: the
//! quadratic-fit coefficients of the preceding price window, the fit
//! quality, and the realized forward outcome for both trade directions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Both sides, in the order they are searched and reported.
    pub const ALL: [Side; 2] = [Side::Buy, Side::Sell];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One digest row.
///
/// Times are milliseconds. After loading through the store they are on an
/// absolute epoch axis, so rows from different weeks can be compared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DigestRow {
    /// Decision time.
    pub time_ms: i64,
    /// Linear coefficient of the fit.
    pub a: f64,
    /// Quadratic coefficient of the fit.
    pub b: f64,
    /// Constant term of the fit (carried, unused by the engine).
    pub c: f64,
    /// Goodness of fit in [0, 1].
    pub r2: f64,
    /// Realized P/L of a buy entered at `time_ms`.
    pub buy_pl: f64,
    /// Realized P/L of a sell entered at `time_ms`.
    pub sell_pl: f64,
    /// Exit time of the buy.
    pub buy_exit: i64,
    /// Exit time of the sell.
    pub sell_exit: i64,
    /// Buy exit was time-based rather than a P/L hit.
    pub buy_no_hit: bool,
    /// Sell exit was time-based rather than a P/L hit.
    pub sell_no_hit: bool,
}

impl DigestRow {
    /// Realized P/L for the given side.
    pub fn pl(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.buy_pl,
            Side::Sell => self.sell_pl,
        }
    }

    /// Exit timestamp for the given side.
    pub fn exit(&self, side: Side) -> i64 {
        match side {
            Side::Buy => self.buy_exit,
            Side::Sell => self.sell_exit,
        }
    }

    /// Feature point used by the neighbor index.
    pub fn point(&self) -> [f64; 2] {
        [self.a, self.b]
    }

    /// Copy of this row with entry and exit times moved by `offset_ms`,
    /// or `None` if any of them would overflow.
    pub fn shifted(&self, offset_ms: i64) -> Option<Self> {
        Some(Self {
            time_ms: self.time_ms.checked_add(offset_ms)?,
            buy_exit: self.buy_exit.checked_add(offset_ms)?,
            sell_exit: self.sell_exit.checked_add(offset_ms)?,
            ..*self
        })
    }
}

/// An executed candidate trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_ms: i64,
    pub exit_ms: i64,
    pub pl: f64,
}

impl TradeRecord {
    pub fn from_row(row: &DigestRow, side: Side) -> Self {
        Self {
            entry_ms: row.time_ms,
            exit_ms: row.exit(side),
            pl: row.pl(side),
        }
    }

    pub fn is_winner(&self) -> bool {
        self.pl > 0.0
    }
}
