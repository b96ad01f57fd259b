// Exponential Moving Average (EMA) indicator implementation
use super::{check_inputs, closes, ema_series, finite, Indicator, IndicatorError, ParamSpec, Payload};
use crate::candles::Bar;

const PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "length",
    min: 1,
    max: 500,
    default: Some(20),
}];

/// EMA of closes, α = 2/(length+1).
///
/// Seeded with the first close of the window; the window spans twice the
/// length so the seed has decayed by the last bar.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema;

impl Indicator for Ema {
    fn name(&self) -> &'static str {
        "EMA"
    }

    fn params(&self) -> &'static [ParamSpec] {
        PARAMS
    }

    fn lookback(&self, params: &[u32]) -> usize {
        params.first().copied().unwrap_or(1) as usize * 2
    }

    fn compute(&self, window: &[Bar], params: &[u32]) -> Result<Payload, IndicatorError> {
        check_inputs(window, params, 1, self.lookback(params))?;

        let series = ema_series(&closes(window), params[0]);
        let last = series.last().copied().ok_or(IndicatorError::NonFinite)?;
        finite(Payload::Scalar(last))
    }
}
