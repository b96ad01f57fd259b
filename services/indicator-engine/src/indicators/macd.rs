// Moving Average Convergence Divergence (MACD) indicator implementation
use std::collections::BTreeMap;

use super::{check_inputs, closes, ema_series, finite, Indicator, IndicatorError, ParamSpec, Payload};
use crate::candles::Bar;

const PARAMS: &[ParamSpec] = &[
    ParamSpec {
        name: "fast",
        min: 1,
        max: 200,
        default: Some(12),
    },
    ParamSpec {
        name: "slow",
        min: 2,
        max: 400,
        default: Some(26),
    },
    ParamSpec {
        name: "signal",
        min: 1,
        max: 200,
        default: Some(9),
    },
];

/// MACD line (fast EMA − slow EMA), its signal EMA, and the histogram.
#[derive(Debug, Clone, Copy, Default)]
pub struct Macd;

impl Indicator for Macd {
    fn name(&self) -> &'static str {
        "MACD"
    }

    fn params(&self) -> &'static [ParamSpec] {
        PARAMS
    }

    fn lookback(&self, params: &[u32]) -> usize {
        match params {
            [_, slow, signal] => *slow as usize * 2 + *signal as usize,
            _ => 1,
        }
    }

    fn validate(&self, params: &[u32]) -> Result<(), String> {
        match params {
            [fast, slow, _] if fast >= slow => {
                Err(format!("fast {fast} must be below slow {slow}"))
            }
            _ => Ok(()),
        }
    }

    fn compute(&self, window: &[Bar], params: &[u32]) -> Result<Payload, IndicatorError> {
        check_inputs(window, params, 3, self.lookback(params))?;
        let (fast, slow, signal) = (params[0], params[1], params[2]);

        let closes = closes(window);
        let fast_line = ema_series(&closes, fast);
        let slow_line = ema_series(&closes, slow);
        let macd_line: Vec<f64> = fast_line
            .iter()
            .zip(&slow_line)
            .map(|(f, s)| f - s)
            .collect();
        let signal_line = ema_series(&macd_line, signal);

        let macd = macd_line.last().copied().ok_or(IndicatorError::NonFinite)?;
        let signal = signal_line.last().copied().ok_or(IndicatorError::NonFinite)?;

        let mut fields = BTreeMap::new();
        fields.insert("macd".to_string(), macd);
        fields.insert("signal".to_string(), signal);
        fields.insert("hist".to_string(), macd - signal);
        finite(Payload::Fields(fields))
    }
}
