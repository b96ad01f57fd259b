//! Pluggable indicator functions
//!
//! Every indicator is a pure function over an ordered bar window, registered
//! by name in an [`IndicatorRegistry`]. Adding an indicator means adding an
//! implementation of [`Indicator`] and registering it; the engine never
//! matches on indicator names.

pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::candles::Bar;
use crate::error::EngineError;
use crate::key::IndicatorSpec;

pub use ema::Ema;
pub use macd::Macd;
pub use rsi::Rsi;
pub use sma::Sma;

/// Output of one indicator computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Single-line indicator (SMA, RSI, ...).
    Scalar(f64),
    /// Multi-line indicator, e.g. MACD `{"macd", "signal", "hist"}`.
    Fields(BTreeMap<String, f64>),
}

impl Payload {
    fn is_finite(&self) -> bool {
        match self {
            Payload::Scalar(v) => v.is_finite(),
            Payload::Fields(fields) => fields.values().all(|v| v.is_finite()),
        }
    }
}

/// Declared parameter of an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    /// Inclusive lower bound.
    pub min: u32,
    /// Inclusive upper bound.
    pub max: u32,
    /// Value used when the request omits the parameter.
    pub default: Option<u32>,
}

/// Errors raised by an indicator's compute function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndicatorError {
    #[error("insufficient data: need {required} bars, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("non-finite result")]
    NonFinite,

    #[error("wrong parameter count: expected {expected}, got {actual}")]
    ParamCount { expected: usize, actual: usize },
}

/// Polymorphic indicator capability.
pub trait Indicator: Send + Sync {
    /// Canonical upper-case name, e.g. "RSI".
    fn name(&self) -> &'static str;

    /// Declared parameters, in key order.
    fn params(&self) -> &'static [ParamSpec];

    /// Number of bars the compute function needs.
    fn lookback(&self, params: &[u32]) -> usize;

    /// Cross-parameter validation beyond per-parameter bounds.
    fn validate(&self, _params: &[u32]) -> Result<(), String> {
        Ok(())
    }

    /// Compute over `window`, oldest bar first, last bar the one just closed.
    fn compute(&self, window: &[Bar], params: &[u32]) -> Result<Payload, IndicatorError>;
}

impl fmt::Debug for dyn Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indicator")
            .field("name", &self.name())
            .finish()
    }
}

/// Lookup table of indicators by name.
#[derive(Debug, Clone, Default)]
pub struct IndicatorRegistry {
    indicators: HashMap<String, Arc<dyn Indicator>>,
}

impl IndicatorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in SMA, EMA, RSI and MACD.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Sma));
        registry.register(Arc::new(Ema));
        registry.register(Arc::new(Rsi));
        registry.register(Arc::new(Macd));
        registry
    }

    /// Register (or replace) an indicator under its name.
    pub fn register(&mut self, indicator: Arc<dyn Indicator>) {
        self.indicators
            .insert(indicator.name().to_ascii_uppercase(), indicator);
    }

    /// Look up an indicator by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<Arc<dyn Indicator>> {
        self.indicators.get(&name.to_ascii_uppercase()).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indicators.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate a client spec and produce the canonical name and parameter
    /// tuple.
    pub fn resolve(&self, spec: &IndicatorSpec) -> Result<(String, Vec<u32>), EngineError> {
        let indicator = self
            .get(&spec.name)
            .ok_or_else(|| EngineError::invalid_spec(&spec.name, "unknown indicator"))?;
        let declared = indicator.params();

        if let Some(unknown) = spec
            .params
            .keys()
            .find(|name| !declared.iter().any(|p| p.name == name.as_str()))
        {
            return Err(EngineError::invalid_spec(
                indicator.name(),
                format!("unknown parameter {unknown}"),
            ));
        }

        let mut values = Vec::with_capacity(declared.len());
        for param in declared {
            let value = match (spec.params.get(param.name), param.default) {
                (Some(&v), _) => v,
                (None, Some(default)) => i64::from(default),
                (None, None) => {
                    return Err(EngineError::invalid_spec(
                        indicator.name(),
                        format!("missing parameter {}", param.name),
                    ))
                }
            };
            if value < i64::from(param.min) || value > i64::from(param.max) {
                return Err(EngineError::invalid_spec(
                    indicator.name(),
                    format!(
                        "{} {} outside [{}, {}]",
                        param.name, value, param.min, param.max
                    ),
                ));
            }
            // Bounds above guarantee the value fits.
            values.push(value as u32);
        }

        indicator
            .validate(&values)
            .map_err(|reason| EngineError::invalid_spec(indicator.name(), reason))?;

        Ok((indicator.name().to_string(), values))
    }
}

/// Close prices of a window as `f64`.
pub(crate) fn closes(window: &[Bar]) -> Vec<f64> {
    window
        .iter()
        .map(|bar| bar.close.to_f64().unwrap_or(f64::NAN))
        .collect()
}

/// Check window length and parameter count shared by every built-in.
pub(crate) fn check_inputs(
    window: &[Bar],
    params: &[u32],
    expected_params: usize,
    required: usize,
) -> Result<(), IndicatorError> {
    if params.len() != expected_params {
        return Err(IndicatorError::ParamCount {
            expected: expected_params,
            actual: params.len(),
        });
    }
    if window.len() < required {
        return Err(IndicatorError::InsufficientData {
            required,
            available: window.len(),
        });
    }
    Ok(())
}

/// Reject NaN/inf results instead of delivering them.
pub(crate) fn finite(payload: Payload) -> Result<Payload, IndicatorError> {
    if payload.is_finite() {
        Ok(payload)
    } else {
        Err(IndicatorError::NonFinite)
    }
}

/// Exponential moving average series (`adjust=False` semantics: seeded with
/// the first observation, α = 2/(length+1)).
pub(crate) fn ema_series(values: &[f64], length: u32) -> Vec<f64> {
    let alpha = 2.0 / (f64::from(length) + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            None => v,
            Some(p) => alpha * v + (1.0 - alpha) * p,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_fills_defaults_in_declared_order() {
        let registry = IndicatorRegistry::with_defaults();

        let spec = IndicatorSpec::new("macd")
            .with_param("signal", 9)
            .with_param("slow", 26)
            .with_param("fast", 12);
        let (name, params) = registry.resolve(&spec).unwrap();
        assert_eq!(name, "MACD");
        assert_eq!(params, vec![12, 26, 9]);

        let (name, params) = registry.resolve(&IndicatorSpec::new("RSI")).unwrap();
        assert_eq!(name, "RSI");
        assert_eq!(params, vec![14]);
    }

    #[test]
    fn test_resolve_rejects_unknown_indicator() {
        let registry = IndicatorRegistry::with_defaults();
        let err = registry.resolve(&IndicatorSpec::new("FOO")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidIndicatorSpec { .. }));
    }

    #[test]
    fn test_resolve_rejects_out_of_bounds() {
        let registry = IndicatorRegistry::with_defaults();
        let spec = IndicatorSpec::new("RSI").with_param("length", 0);
        assert!(registry.resolve(&spec).is_err());

        let spec = IndicatorSpec::new("SMA").with_param("length", -5);
        assert!(registry.resolve(&spec).is_err());
    }

    #[test]
    fn test_resolve_rejects_unknown_param() {
        let registry = IndicatorRegistry::with_defaults();
        let spec = IndicatorSpec::new("RSI").with_param("period", 14);
        let err = registry.resolve(&spec).unwrap_err();
        assert!(err.to_string().contains("unknown parameter period"));
    }

    #[test]
    fn test_resolve_runs_cross_validation() {
        let registry = IndicatorRegistry::with_defaults();
        let spec = IndicatorSpec::new("MACD")
            .with_param("fast", 26)
            .with_param("slow", 12);
        assert!(registry.resolve(&spec).is_err());
    }

    #[test]
    fn test_registry_names() {
        let registry = IndicatorRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["EMA", "MACD", "RSI", "SMA"]);
        assert!(registry.get("sma").is_some());
    }

    #[test]
    fn test_payload_serialization() {
        assert_eq!(serde_json::to_string(&Payload::Scalar(52.5)).unwrap(), "52.5");

        let mut fields = BTreeMap::new();
        fields.insert("hist".to_string(), 2.0);
        let json = serde_json::to_string(&Payload::Fields(fields)).unwrap();
        assert_eq!(json, r#"{"hist":2.0}"#);
    }

    #[test]
    fn test_ema_series_seeded_with_first_value() {
        // alpha = 0.5
        let out = ema_series(&[10.0, 11.0, 12.0, 13.0], 3);
        assert_eq!(out, vec![10.0, 10.5, 11.25, 12.125]);
    }
}
