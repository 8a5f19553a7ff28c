//! Per-model pricing used to turn token counts into cost.

use std::collections::HashMap;

use fieldforge_shared::{AppConfig, PricingConfig};

/// Token prices keyed by model id, in USD per million tokens.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: HashMap<String, PricingConfig>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the price of one model.
    pub fn set(&mut self, model: impl Into<String>, input: f64, output: f64) {
        self.prices
            .insert(model.into(), PricingConfig { input, output });
    }

    pub fn get(&self, model: &str) -> Option<PricingConfig> {
        self.prices.get(model).copied()
    }

    /// `(input_cost, output_cost)` in USD; zero for unpriced models.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> (f64, f64) {
        match self.prices.get(model) {
            Some(p) => (
                p.input * input_tokens as f64 / 1e6,
                p.output * output_tokens as f64 / 1e6,
            ),
            None => (0.0, 0.0),
        }
    }
}

impl From<&AppConfig> for PricingTable {
    fn from(config: &AppConfig) -> Self {
        Self {
            prices: config
                .pricing
                .iter()
                .map(|(model, price)| (model.clone(), *price))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_per_million_tokens() {
        let mut table = PricingTable::new();
        table.set("m", 0.5, 1.5);
        let (input, output) = table.cost("m", 2_000_000, 1_000_000);
        assert!((input - 1.0).abs() < 1e-9);
        assert!((output - 1.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let table = PricingTable::new();
        assert_eq!(table.cost("nope", 1000, 1000), (0.0, 0.0));
    }

    #[test]
    fn from_default_config() {
        let table = PricingTable::from(&AppConfig::default());
        assert!(table.get("gpt-4o-mini").is_some());
    }
}
