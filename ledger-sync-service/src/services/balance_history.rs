//! Balance history reconstruction.
//!
//! The aggregator only reports a live balance, so history is derived by
//! walking backward from it: `balance(d) = balance(d + 1) - delta(d + 1)`.
//! The result is exact only when every transaction in the walked range is
//! present once and correctly signed.

use crate::models::BalancePoint;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("invalid window: {start} is after {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<HistoryError> for AppError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::InvalidWindow { .. } => AppError::BadRequest(anyhow::anyhow!("{}", err)),
            HistoryError::Store(inner) => inner,
        }
    }
}

/// Daily series for `[start, end]`, ascending, anchored at
/// `balance(end) = current_balance`.
///
/// `deltas` holds the signed balance effect per day; days without an entry
/// carry the balance unchanged.
pub fn reconstruct(
    current_balance: Decimal,
    deltas: &BTreeMap<NaiveDate, Decimal>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<BalancePoint>, HistoryError> {
    if start > end {
        return Err(HistoryError::InvalidWindow { start, end });
    }

    let days = (end - start).num_days() as usize + 1;
    let mut points = Vec::with_capacity(days);
    let mut balance = current_balance;
    let mut day = end;

    points.push(BalancePoint { date: day, balance });
    while day > start {
        balance -= deltas.get(&day).copied().unwrap_or(Decimal::ZERO);
        day -= Duration::days(1);
        points.push(BalancePoint { date: day, balance });
    }

    points.reverse();
    Ok(points)
}

/// Series for `[start, end]` when the known balance belongs to `anchor`
/// (normally today). The walk runs from the anchor so days after `end` are
/// still subtracted; the result is trimmed to the requested window.
pub fn reconstruct_window(
    current_balance: Decimal,
    deltas: &BTreeMap<NaiveDate, Decimal>,
    start: NaiveDate,
    end: NaiveDate,
    anchor: NaiveDate,
) -> Result<Vec<BalancePoint>, HistoryError> {
    if start > end || end > anchor {
        return Err(HistoryError::InvalidWindow { start, end });
    }
    let mut points = reconstruct(current_balance, deltas, start, anchor)?;
    points.retain(|p| p.date <= end);
    Ok(points)
}
