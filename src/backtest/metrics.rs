//! Equity-curve and trade-ledger metrics.
//!
//! Money stays `Decimal`; the dimensionless statistics (Sharpe, drawdown,
//! win rate) are computed in f64, matching the live/backtest precision
//! split used everywhere else.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::engine::book::Trade;

const MS_PER_YEAR: f64 = 365.25 * 24.0 * 3_600_000.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquityPoint {
    pub timestamp_ms: i64,
    pub equity: Decimal,
}

/// Aggregate results of one backtest run. Small enough to retain for every
/// parameter combination in a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub initial_equity: Decimal,
    pub final_equity: Decimal,
    pub net_profit: Decimal,
    pub return_pct: Decimal,
    pub annualized_return_pct: f64,
    pub sharpe: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_funding: Decimal,
    pub total_fees: Decimal,
}

/// Compute metrics from the final equity curve and trade ledger.
pub fn compute_metrics(
    initial_equity: Decimal,
    curve: &[EquityPoint],
    trades: &[Trade],
) -> RunMetrics {
    let final_equity = curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(initial_equity);
    let net_profit = final_equity - initial_equity;
    let return_pct = if initial_equity.is_zero() {
        Decimal::ZERO
    } else {
        net_profit / initial_equity * Decimal::from(100)
    };

    let winning_trades = trades.iter().filter(|t| t.net_pnl > Decimal::ZERO).count() as u32;
    let losing_trades = trades.iter().filter(|t| t.net_pnl < Decimal::ZERO).count() as u32;
    let total_trades = trades.len() as u32;
    let win_rate = if total_trades == 0 {
        0.0
    } else {
        f64::from(winning_trades) / f64::from(total_trades)
    };

    let gross_wins: Decimal = trades
        .iter()
        .filter(|t| t.net_pnl > Decimal::ZERO)
        .map(|t| t.net_pnl)
        .sum();
    let gross_losses: Decimal = trades
        .iter()
        .filter(|t| t.net_pnl < Decimal::ZERO)
        .map(|t| -t.net_pnl)
        .sum();
    let profit_factor = if gross_losses.is_zero() {
        if gross_wins.is_zero() {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (gross_wins / gross_losses).to_f64().unwrap_or(0.0)
    };

    let total_funding: Decimal = trades.iter().map(|t| t.total_funding()).sum();
    let total_fees: Decimal = trades.iter().map(|t| t.entry_fee + t.exit_fee).sum();

    RunMetrics {
        initial_equity,
        final_equity,
        net_profit,
        return_pct,
        annualized_return_pct: annualized_return(initial_equity, final_equity, curve),
        sharpe: sharpe_ratio(curve),
        max_drawdown_pct: max_drawdown(curve),
        win_rate,
        profit_factor,
        total_trades,
        winning_trades,
        losing_trades,
        total_funding,
        total_fees,
    }
}

fn annualized_return(initial: Decimal, fin: Decimal, curve: &[EquityPoint]) -> f64 {
    let (Some(first), Some(last)) = (curve.first(), curve.last()) else {
        return 0.0;
    };
    let span_ms = (last.timestamp_ms - first.timestamp_ms) as f64;
    if span_ms <= 0.0 || initial.is_zero() {
        return 0.0;
    }
    let total_return = (fin / initial).to_f64().unwrap_or(1.0);
    if total_return <= 0.0 {
        return -100.0;
    }
    let years = span_ms / MS_PER_YEAR;
    (total_return.powf(1.0 / years) - 1.0) * 100.0
}

/// Annualized Sharpe over per-tick equity returns, risk-free rate zero.
fn sharpe_ratio(curve: &[EquityPoint]) -> f64 {
    if curve.len() < 3 {
        return 0.0;
    }
    let returns: Vec<f64> = curve
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].equity.to_f64()?;
            let next = w[1].equity.to_f64()?;
            (prev > 0.0).then(|| next / prev - 1.0)
        })
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 || !std_dev.is_finite() {
        return 0.0;
    }

    // Periods per year inferred from the actual tick spacing.
    let span_ms = (curve.last().unwrap().timestamp_ms - curve.first().unwrap().timestamp_ms) as f64;
    let avg_dt = span_ms / (curve.len() - 1) as f64;
    if avg_dt <= 0.0 {
        return 0.0;
    }
    let periods_per_year = MS_PER_YEAR / avg_dt;
    mean / std_dev * periods_per_year.sqrt()
}

/// Max peak-to-trough drawdown as a percentage of the peak.
fn max_drawdown(curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for point in curve {
        let equity = point.equity.to_f64().unwrap_or(0.0);
        peak = peak.max(equity);
        if peak > 0.0 {
            worst = worst.max((peak - equity) / peak);
        }
    }
    worst * 100.0
}
