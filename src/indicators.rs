use crate::price_history::Bar;
use ta::Next;
use ta::indicators::{Maximum, Minimum, SimpleMovingAverage};

pub const SMA_SHORT: usize = 5;
pub const SMA_LONG: usize = 20;
pub const STOCH_K: usize = 9;
pub const STOCH_D: usize = 3;

/// Per-bar indicator values aligned with the input series.
/// `None` marks positions where the window is not yet full or the value is undefined.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndicatorSet {
    pub sma_short: Vec<Option<f64>>,
    pub sma_long: Vec<Option<f64>>,
    pub stoch_k: Vec<Option<f64>>,
    pub stoch_d: Vec<Option<f64>>,
}

pub fn compute_indicators(series: &[Bar]) -> IndicatorSet {
    let closes: Vec<f64> = series.iter().map(|bar| bar.close).collect();
    let stoch_k = stochastic_k(series, STOCH_K);
    let stoch_d = smooth(&stoch_k, STOCH_D);

    IndicatorSet {
        sma_short: rolling_sma(&closes, SMA_SHORT),
        sma_long: rolling_sma(&closes, SMA_LONG),
        stoch_k,
        stoch_d,
    }
}

fn rolling_sma(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let Ok(mut sma) = SimpleMovingAverage::new(period) else {
        return vec![None; closes.len()];
    };

    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            // ta averages partial windows too; those leading values are not SMA(n).
            let value = sma.next(close);
            (i + 1 >= period).then_some(value)
        })
        .collect()
}

/// %K = 100 * (close - lowest low) / (highest high - lowest low) over `period` bars.
fn stochastic_k(series: &[Bar], period: usize) -> Vec<Option<f64>> {
    let (Ok(mut highest), Ok(mut lowest)) = (Maximum::new(period), Minimum::new(period)) else {
        return vec![None; series.len()];
    };

    series
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            let high = highest.next(bar);
            let low = lowest.next(bar);
            if i + 1 < period {
                return None;
            }

            let range = high - low;
            if range <= 0.0 {
                return None;
            }
            Some(100.0 * (bar.close - low) / range)
        })
        .collect()
}

/// Mean of the last `period` values, defined only when all of them are.
fn smooth(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if period == 0 || i + 1 < period {
                return None;
            }
            let window = &values[i + 1 - period..=i];
            let sum = window.iter().copied().sum::<Option<f64>>()?;
            Some(sum / period as f64)
        })
        .collect()
}
