// Simple Moving Average (SMA) indicator implementation
use super::{check_inputs, closes, finite, Indicator, IndicatorError, ParamSpec, Payload};
use crate::candles::Bar;

const PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "length",
    min: 1,
    max: 500,
    default: Some(20),
}];

/// Mean close over the last `length` bars.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sma;

impl Indicator for Sma {
    fn name(&self) -> &'static str {
        "SMA"
    }

    fn params(&self) -> &'static [ParamSpec] {
        PARAMS
    }

    fn lookback(&self, params: &[u32]) -> usize {
        params.first().copied().unwrap_or(1) as usize
    }

    fn compute(&self, window: &[Bar], params: &[u32]) -> Result<Payload, IndicatorError> {
        check_inputs(window, params, 1, self.lookback(params))?;
        let length = params[0] as usize;

        let closes = closes(window);
        let sum: f64 = closes[closes.len() - length..].iter().sum();
        finite(Payload::Scalar(sum / length as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::bars_from_closes;

    #[test]
    fn test_sma_calculation() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        // Last three closes: (3+4+5)/3 = 4.0
        assert_eq!(Sma.compute(&bars, &[3]).unwrap(), Payload::Scalar(4.0));
    }

    #[test]
    fn test_sma_period_one() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0]);
        assert_eq!(Sma.compute(&bars, &[1]).unwrap(), Payload::Scalar(3.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let bars = bars_from_closes(&[1.0, 2.0]);
        assert_eq!(
            Sma.compute(&bars, &[3]).unwrap_err(),
            IndicatorError::InsufficientData {
                required: 3,
                available: 2
            }
        );
    }

    #[test]
    fn test_sma_wrong_param_count() {
        let bars = bars_from_closes(&[1.0, 2.0]);
        assert!(matches!(
            Sma.compute(&bars, &[]),
            Err(IndicatorError::ParamCount { .. })
        ));
    }
}
