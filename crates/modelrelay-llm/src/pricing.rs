//! Model pricing
//!
//! Per-model prices in USD per 1M tokens. Every provider descriptor owns one
//! [`PricingTable`]; a model missing from the table is treated as free.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tokens per pricing unit
const TOKENS_PER_UNIT: f64 = 1_000_000.0;

// DeepSeek
/// DeepSeek Chat (V3) input cost per 1M tokens
pub const DEEPSEEK_CHAT_INPUT_COST: f64 = 0.14;
/// DeepSeek Chat (V3) output cost per 1M tokens
pub const DEEPSEEK_CHAT_OUTPUT_COST: f64 = 0.28;
/// DeepSeek Reasoner (R1) input cost per 1M tokens
pub const DEEPSEEK_REASONER_INPUT_COST: f64 = 0.55;
/// DeepSeek Reasoner (R1) output cost per 1M tokens
pub const DEEPSEEK_REASONER_OUTPUT_COST: f64 = 2.19;

// Google Gemini 2.5 family
/// Gemini 2.5 Flash input cost per 1M tokens
pub const GEMINI_FLASH_INPUT_COST: f64 = 0.075;
/// Gemini 2.5 Flash output cost per 1M tokens
pub const GEMINI_FLASH_OUTPUT_COST: f64 = 0.60;
/// Gemini 2.5 Pro input cost per 1M tokens
pub const GEMINI_PRO_INPUT_COST: f64 = 1.25;
/// Gemini 2.5 Pro output cost per 1M tokens
pub const GEMINI_PRO_OUTPUT_COST: f64 = 15.00;

// GitHub Models (billed at the upstream OpenAI rates)
/// GPT-4o-mini input cost per 1M tokens
pub const GPT4O_MINI_INPUT_COST: f64 = 0.15;
/// GPT-4o-mini output cost per 1M tokens
pub const GPT4O_MINI_OUTPUT_COST: f64 = 0.60;
/// GPT-4o input cost per 1M tokens
pub const GPT4O_INPUT_COST: f64 = 2.50;
/// GPT-4o output cost per 1M tokens
pub const GPT4O_OUTPUT_COST: f64 = 10.00;

// HuggingFace inference router
/// Llama 3.1 8B Instruct input cost per 1M tokens
pub const HF_LLAMA_8B_INPUT_COST: f64 = 0.05;
/// Llama 3.1 8B Instruct output cost per 1M tokens
pub const HF_LLAMA_8B_OUTPUT_COST: f64 = 0.08;
/// Qwen2.5 Coder 32B input cost per 1M tokens
pub const HF_QWEN_CODER_INPUT_COST: f64 = 0.20;
/// Qwen2.5 Coder 32B output cost per 1M tokens
pub const HF_QWEN_CODER_OUTPUT_COST: f64 = 0.20;

/// Pricing information for a model (per 1M tokens)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost per 1M input tokens (USD)
    #[serde(rename = "input")]
    pub input_cost_per_million: f64,
    /// Cost per 1M output tokens (USD)
    #[serde(rename = "output")]
    pub output_cost_per_million: f64,
}

impl ModelPricing {
    /// Create pricing from per-million rates
    #[must_use]
    pub const fn new(input_cost_per_million: f64, output_cost_per_million: f64) -> Self {
        Self {
            input_cost_per_million,
            output_cost_per_million,
        }
    }

    /// Calculate cost for given token counts
    #[must_use]
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let input_cost = (input_tokens as f64 / TOKENS_PER_UNIT) * self.input_cost_per_million;
        let output_cost = (output_tokens as f64 / TOKENS_PER_UNIT) * self.output_cost_per_million;
        input_cost + output_cost
    }
}

/// Model name to pricing
pub type PricingTable = HashMap<String, ModelPricing>;

/// Cost of a call against a pricing table, 0 for unpriced models
#[must_use]
pub fn cost_for(table: &PricingTable, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    table
        .get(model)
        .map(|p| p.calculate_cost(input_tokens, output_tokens))
        .unwrap_or(0.0)
}

pub(crate) fn table(entries: &[(&str, f64, f64)]) -> PricingTable {
    entries
        .iter()
        .map(|(model, input, output)| ((*model).to_string(), ModelPricing::new(*input, *output)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_pricing_calculation() {
        let pricing = ModelPricing::new(10.0, 20.0);

        let cost = pricing.calculate_cost(1_000_000, 1_000_000);
        assert!((cost - 30.0).abs() < 0.001);

        let cost = pricing.calculate_cost(1_000, 1_000);
        assert!((cost - 0.03).abs() < 0.001);
    }

    #[test]
    fn test_unpriced_model_is_free() {
        let prices = table(&[("deepseek-chat", DEEPSEEK_CHAT_INPUT_COST, DEEPSEEK_CHAT_OUTPUT_COST)]);
        assert_eq!(cost_for(&prices, "unknown", 5_000, 5_000), 0.0);
        assert!(cost_for(&prices, "deepseek-chat", 1_000_000, 0) > 0.13);
    }

    #[test]
    fn test_pricing_deserializes_short_keys() {
        let p: ModelPricing = serde_json::from_str(r#"{"input": 1.5, "output": 3.0}"#).unwrap();
        assert_eq!(p, ModelPricing::new(1.5, 3.0));
    }
}
