//! Impairment parameters for one simulated link.

use voip_bench_common::ConfigError;

/// Upper bound for latency and jitter, one minute.
pub const MAX_DELAY_MS: f64 = 60_000.0;

/// Immutable description of a simulated network path.
///
/// Probabilities live in `[0, 1]` and delays are milliseconds in
/// `[0, MAX_DELAY_MS]`. [`NetworkConditions::new`] and the `with_*` builders
/// clamp out-of-range input (NaN becomes 0); [`NetworkConditions::try_new`]
/// rejects it instead.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetworkConditions {
    // ---
    packet_loss: f64,
    jitter_ms: f64,
    latency_ms: f64,
    duplicate_prob: f64,
    reorder_prob: f64,
    corrupt_prob: f64,
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn delay(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, MAX_DELAY_MS)
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue { field, value })
    }
}

fn check_delay(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if (0.0..=MAX_DELAY_MS).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue { field, value })
    }
}

impl NetworkConditions {
    // ---
    /// Builds conditions, clamping every field into its valid range.
    ///
    /// # Arguments
    ///
    /// * `packet_loss` - Probability a packet is dropped
    /// * `jitter_ms` - Half-width of the uniform delay variation
    /// * `latency_ms` - Base one-way delay
    /// * `duplicate_prob` - Probability a packet is delivered twice
    /// * `reorder_prob` - Probability a packet is held back
    /// * `corrupt_prob` - Probability a delivery has its payload mangled
    pub fn new(
        packet_loss: f64,
        jitter_ms: f64,
        latency_ms: f64,
        duplicate_prob: f64,
        reorder_prob: f64,
        corrupt_prob: f64,
    ) -> Self {
        // ---
        Self {
            packet_loss: unit(packet_loss),
            jitter_ms: delay(jitter_ms),
            latency_ms: delay(latency_ms),
            duplicate_prob: unit(duplicate_prob),
            reorder_prob: unit(reorder_prob),
            corrupt_prob: unit(corrupt_prob),
        }
    }

    /// Like [`new`](Self::new) but fails on the first out-of-range field.
    pub fn try_new(
        packet_loss: f64,
        jitter_ms: f64,
        latency_ms: f64,
        duplicate_prob: f64,
        reorder_prob: f64,
        corrupt_prob: f64,
    ) -> Result<Self, ConfigError> {
        // ---
        Ok(Self {
            packet_loss: check_unit("packet_loss", packet_loss)?,
            jitter_ms: check_delay("jitter_ms", jitter_ms)?,
            latency_ms: check_delay("latency_ms", latency_ms)?,
            duplicate_prob: check_unit("duplicate_prob", duplicate_prob)?,
            reorder_prob: check_unit("reorder_prob", reorder_prob)?,
            corrupt_prob: check_unit("corrupt_prob", corrupt_prob)?,
        })
    }

    /// Named profiles: `perfect`, `good` (1% loss, 20ms, ±5ms) and
    /// `poor` (5% loss, 100ms, ±30ms).
    pub fn preset(name: &str) -> Option<Self> {
        // ---
        match name {
            "perfect" => Some(Self::default()),
            "good" => Some(Self::new(0.01, 5.0, 20.0, 0.0, 0.0, 0.0)),
            "poor" => Some(Self::new(0.05, 30.0, 100.0, 0.0, 0.0, 0.0)),
            _ => None,
        }
    }

    pub fn with_packet_loss(mut self, p: f64) -> Self {
        self.packet_loss = unit(p);
        self
    }

    pub fn with_jitter_ms(mut self, ms: f64) -> Self {
        self.jitter_ms = delay(ms);
        self
    }

    pub fn with_latency_ms(mut self, ms: f64) -> Self {
        self.latency_ms = delay(ms);
        self
    }

    pub fn with_duplicate_prob(mut self, p: f64) -> Self {
        self.duplicate_prob = unit(p);
        self
    }

    pub fn with_reorder_prob(mut self, p: f64) -> Self {
        self.reorder_prob = unit(p);
        self
    }

    pub fn with_corrupt_prob(mut self, p: f64) -> Self {
        self.corrupt_prob = unit(p);
        self
    }

    pub fn packet_loss(&self) -> f64 {
        self.packet_loss
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ms
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    pub fn duplicate_prob(&self) -> f64 {
        self.duplicate_prob
    }

    pub fn reorder_prob(&self) -> f64 {
        self.reorder_prob
    }

    pub fn corrupt_prob(&self) -> f64 {
        self.corrupt_prob
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_out_of_range_values_are_clamped() {
        // ---
        let c = NetworkConditions::new(1.5, -10.0, f64::NAN, -0.2, 0.5, 2.0);

        assert_eq!(c.packet_loss(), 1.0);
        assert_eq!(c.jitter_ms(), 0.0);
        assert_eq!(c.latency_ms(), 0.0);
        assert_eq!(c.duplicate_prob(), 0.0);
        assert_eq!(c.reorder_prob(), 0.5);
        assert_eq!(c.corrupt_prob(), 1.0);
    }

    #[test]
    fn test_unbounded_delays_are_capped() {
        // ---
        let c = NetworkConditions::default()
            .with_latency_ms(f64::INFINITY)
            .with_jitter_ms(1e300);
        assert_eq!(c.latency_ms(), MAX_DELAY_MS);
        assert_eq!(c.jitter_ms(), MAX_DELAY_MS);

        let c = NetworkConditions::new(0.0, f64::NEG_INFINITY, 1e12, 0.0, 0.0, 0.0);
        assert_eq!(c.jitter_ms(), 0.0);
        assert_eq!(c.latency_ms(), MAX_DELAY_MS);
    }

    #[test]
    fn test_try_new_rejects_unbounded_delays() {
        // ---
        let err = NetworkConditions::try_new(0.0, 0.0, 1e300, 0.0, 0.0, 0.0).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                field: "latency_ms",
                value: 1e300
            }
        );
        assert!(NetworkConditions::try_new(0.0, f64::INFINITY, 0.0, 0.0, 0.0, 0.0).is_err());
        assert!(NetworkConditions::try_new(0.0, f64::NAN, 0.0, 0.0, 0.0, 0.0).is_err());
        assert!(NetworkConditions::try_new(0.0, 0.0, MAX_DELAY_MS, 0.0, 0.0, 0.0).is_ok());
    }

    #[test]
    fn test_try_new_rejects_out_of_range() {
        // ---
        let err = NetworkConditions::try_new(0.1, 0.0, 0.0, 0.0, 1.2, 0.0).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                field: "reorder_prob",
                value: 1.2
            }
        );
        assert!(NetworkConditions::try_new(0.1, 10.0, 50.0, 0.0, 0.0, 0.0).is_ok());
    }

    #[test]
    fn test_builders_clamp() {
        // ---
        let c = NetworkConditions::default()
            .with_packet_loss(-1.0)
            .with_latency_ms(80.0)
            .with_corrupt_prob(3.0);

        assert_eq!(c.packet_loss(), 0.0);
        assert_eq!(c.latency_ms(), 80.0);
        assert_eq!(c.corrupt_prob(), 1.0);
    }

    #[test]
    fn test_presets() {
        // ---
        assert_eq!(
            NetworkConditions::preset("perfect"),
            Some(NetworkConditions::default())
        );
        let poor = NetworkConditions::preset("poor").unwrap();
        assert_eq!(poor.packet_loss(), 0.05);
        assert_eq!(poor.latency_ms(), 100.0);
        assert!(NetworkConditions::preset("lunar").is_none());
    }
}
