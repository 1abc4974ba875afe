//! Turns the latest bars and their indicators into pattern labels and a trend regime.

use crate::indicators::IndicatorSet;
use crate::price_history::Bar;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;

/// Fewer bars than this and nothing is classified.
pub const MIN_BARS: usize = 20;
const BULLISH_RUN: usize = 3;

/// Declares a fieldless enum whose persisted form is a fixed label string.
/// The label table is the only place the strings appear.
macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            pub fn from_label(label: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.label() == label)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.label())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let label = String::deserialize(deserializer)?;
                Self::from_label(&label).ok_or_else(|| {
                    de::Error::invalid_value(de::Unexpected::Str(&label), &stringify!($name))
                })
            }
        }
    };
}

labelled_enum!(Pattern {
    InsufficientData => "insufficient-data",
    BullishMaCross => "bullish-MA-cross",
    BearishMaCross => "bearish-MA-cross",
    StochasticGoldenCross => "stochastic-golden-cross",
    StochasticDeathCross => "stochastic-death-cross",
    ThreeBullishCandles => "three-bullish-candles",
    NoDistinctPattern => "no-distinct-pattern",
});

labelled_enum!(
    /// Dominant trend of the latest bar.
    Regime {
        BullishMaCross => "bullish-MA-cross",
        BearishMaCross => "bearish-MA-cross",
        InsufficientData => "insufficient-data",
    }
);

#[derive(Debug, Clone, PartialEq)]
pub struct PatternResult {
    pub patterns: Vec<Pattern>,
    pub regime: Regime,
}

impl PatternResult {
    fn insufficient_data() -> Self {
        Self {
            patterns: vec![Pattern::InsufficientData],
            regime: Regime::InsufficientData,
        }
    }

    fn push(&mut self, pattern: Pattern) {
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }
}

/// Classifies the latest bar. Pure: the same input always yields the same labels in the same order.
pub fn classify(series: &[Bar], indicators: &IndicatorSet) -> PatternResult {
    if series.len() < MIN_BARS {
        return PatternResult::insufficient_data();
    }

    let (Some(short), Some(long)) = (
        last_defined(&indicators.sma_short),
        last_defined(&indicators.sma_long),
    ) else {
        return PatternResult::insufficient_data();
    };

    // Equal averages land on the bearish side.
    let regime = if short > long {
        Regime::BullishMaCross
    } else {
        Regime::BearishMaCross
    };
    let mut result = PatternResult {
        patterns: Vec::new(),
        regime,
    };
    result.push(match regime {
        Regime::BullishMaCross => Pattern::BullishMaCross,
        _ => Pattern::BearishMaCross,
    });

    if let Some(cross) = stochastic_cross(&indicators.stoch_k, &indicators.stoch_d) {
        result.push(cross);
    }

    if bullish_run(series, BULLISH_RUN) {
        result.push(Pattern::ThreeBullishCandles);
    }

    if result.patterns.is_empty() {
        result.push(Pattern::NoDistinctPattern);
    }

    result
}

fn last_defined(values: &[Option<f64>]) -> Option<f64> {
    values.last().copied().flatten()
}

/// Compares %K against %D on the last two positions. `None` when either
/// pair is undefined or the lines did not cross.
fn stochastic_cross(k: &[Option<f64>], d: &[Option<f64>]) -> Option<Pattern> {
    let [.., prev_k, cur_k] = k else { return None };
    let [.., prev_d, cur_d] = d else { return None };
    let (prev_k, cur_k, prev_d, cur_d) = ((*prev_k)?, (*cur_k)?, (*prev_d)?, (*cur_d)?);

    if prev_k < prev_d && cur_k > cur_d {
        Some(Pattern::StochasticGoldenCross)
    } else if prev_k > prev_d && cur_k < cur_d {
        Some(Pattern::StochasticDeathCross)
    } else {
        None
    }
}

fn bullish_run(series: &[Bar], len: usize) -> bool {
    series.len() >= len && series[series.len() - len..].iter().all(|bar| bar.close > bar.open)
}
