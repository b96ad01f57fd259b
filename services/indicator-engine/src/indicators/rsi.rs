// Relative Strength Index (RSI) indicator implementation
use super::{check_inputs, closes, finite, Indicator, IndicatorError, ParamSpec, Payload};
use crate::candles::Bar;

const PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "length",
    min: 2,
    max: 200,
    default: Some(14),
}];

/// Wilder RSI.
///
/// The first `length` changes seed the average gain/loss; remaining changes
/// in the window are Wilder-smoothed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rsi;

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "RSI"
    }

    fn params(&self) -> &'static [ParamSpec] {
        PARAMS
    }

    fn lookback(&self, params: &[u32]) -> usize {
        params.first().copied().unwrap_or(2) as usize * 2 + 1
    }

    fn compute(&self, window: &[Bar], params: &[u32]) -> Result<Payload, IndicatorError> {
        check_inputs(window, params, 1, self.lookback(params))?;
        let length = params[0] as usize;
        let w = length as f64;

        let closes = closes(window);
        let changes: Vec<f64> = closes.windows(2).map(|pair| pair[1] - pair[0]).collect();

        let (seed, rest) = changes.split_at(length);
        let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / w;
        let mut avg_loss = -seed.iter().filter(|c| **c < 0.0).sum::<f64>() / w;

        for &change in rest {
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);
            avg_gain = (avg_gain * (w - 1.0) + gain) / w;
            avg_loss = (avg_loss * (w - 1.0) + loss) / w;
        }

        let value = if avg_loss == 0.0 {
            if avg_gain == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            let rs = avg_gain / avg_loss;
            100.0 - 100.0 / (1.0 + rs)
        };
        finite(Payload::Scalar(value))
    }
}
