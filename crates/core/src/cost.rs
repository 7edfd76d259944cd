use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

const FALLBACK_MODEL: &str = "gpt-4o";

const PRICE_TABLE: [(&str, ModelPrice); 5] = [
    ("gpt-4o", ModelPrice { input: 2.50, output: 10.00 }),
    ("gpt-4o-mini", ModelPrice { input: 0.15, output: 0.60 }),
    ("gpt-4-turbo", ModelPrice { input: 10.00, output: 30.00 }),
    ("gpt-4", ModelPrice { input: 30.00, output: 60.00 }),
    ("claude-sonnet-4", ModelPrice { input: 3.00, output: 15.00 }),
];

/// Exact match first, then the longest table entry the model id starts with,
/// so dated snapshots such as `gpt-4o-2024-08-06` price like their family.
pub fn price_for(model: &str) -> Option<ModelPrice> {
    let lowered = model.to_lowercase();
    if let Some((_, price)) = PRICE_TABLE.iter().find(|(name, _)| *name == lowered) {
        return Some(*price);
    }
    PRICE_TABLE
        .iter()
        .filter(|(name, _)| lowered.starts_with(name) || lowered.contains(&format!("{name}-")))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, price)| *price)
}

pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let price = match price_for(model) {
        Some(price) => price,
        None => {
            warn!(model, fallback = FALLBACK_MODEL, "unknown model, using fallback pricing");
            PRICE_TABLE[0].1
        }
    };
    (input_tokens as f64 / 1_000_000.0) * price.input
        + (output_tokens as f64 / 1_000_000.0) * price.output
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl CostRecord {
    pub fn new(model: &str, usage: TokenUsage) -> Self {
        Self {
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: calculate_cost(model, usage.input_tokens, usage.output_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostReport {
    pub document_id: String,
    pub source_file: String,
    pub model: String,
    pub total_pages: u32,
    pub pages_processed: u32,
    pub model_calls: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub processing_seconds: f64,
    pub cost_per_page: f64,
    pub estimated_full_document_cost: f64,
}

#[derive(Debug, Default)]
pub struct CostAccountant {
    records: Mutex<Vec<CostRecord>>,
}

impl CostAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, usage: TokenUsage) -> CostRecord {
        let record = CostRecord::new(model, usage);
        self.records.lock().push(record.clone());
        record
    }

    pub fn records(&self) -> Vec<CostRecord> {
        self.records.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn totals(&self) -> (u64, u64, f64) {
        self.records
            .lock()
            .iter()
            .fold((0, 0, 0.0), |(input, output, cost), record| {
                (
                    input + record.input_tokens,
                    output + record.output_tokens,
                    cost + record.cost_usd,
                )
            })
    }

    pub fn report(
        &self,
        document_id: &str,
        source_file: &str,
        model: &str,
        total_pages: u32,
        pages_processed: u32,
        elapsed: Duration,
    ) -> CostReport {
        let (total_input_tokens, total_output_tokens, total_cost_usd) = self.totals();
        let cost_per_page = if pages_processed > 0 {
            total_cost_usd / pages_processed as f64
        } else {
            0.0
        };

        CostReport {
            document_id: document_id.to_string(),
            source_file: source_file.to_string(),
            model: model.to_string(),
            total_pages,
            pages_processed,
            model_calls: self.call_count(),
            total_input_tokens,
            total_output_tokens,
            total_cost_usd,
            processing_seconds: elapsed.as_secs_f64(),
            cost_per_page,
            estimated_full_document_cost: cost_per_page * total_pages as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cost_uses_per_million_pricing() {
        let cost = calculate_cost("gpt-4o", 1_000_000, 100_000);
        assert!((cost - 3.5).abs() < 1e-9);
    }

    #[test]
    fn dated_model_ids_use_family_price() {
        assert_eq!(price_for("gpt-4o-mini-2024-07-18"), price_for("gpt-4o-mini"));
        assert_eq!(price_for("gpt-4o-2024-08-06"), price_for("gpt-4o"));
        assert_eq!(
            price_for("us.anthropic.claude-sonnet-4-20250514-v1:0"),
            price_for("claude-sonnet-4")
        );
        assert!(price_for("llama-3").is_none());
    }

    #[test]
    fn unknown_model_falls_back_to_default_price() {
        assert_eq!(
            calculate_cost("mystery", 2_000, 500),
            calculate_cost("gpt-4o", 2_000, 500)
        );
    }

    #[test]
    fn report_total_equals_sum_of_calls() {
        let accountant = CostAccountant::new();
        let per_page = [(1_200, 300), (900, 450), (2_500, 800)];
        let mut expected = 0.0;
        for (input, output) in per_page {
            expected += accountant
                .record(
                    "gpt-4o-mini",
                    TokenUsage {
                        input_tokens: input,
                        output_tokens: output,
                    },
                )
                .cost_usd;
        }

        let report = accountant.report("doc", "a.pdf", "gpt-4o-mini", 30, 3, Duration::from_secs(2));
        assert!((report.total_cost_usd - expected).abs() < 1e-12);
        assert_eq!(report.total_input_tokens, 4_600);
        assert_eq!(report.total_output_tokens, 1_550);
        assert_eq!(report.model_calls, 3);
        assert!((report.estimated_full_document_cost - expected * 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn concurrent_records_are_not_lost() {
        let accountant = Arc::new(CostAccountant::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let accountant = Arc::clone(&accountant);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    accountant.record(
                        "gpt-4o",
                        TokenUsage {
                            input_tokens: 10,
                            output_tokens: 1,
                        },
                    );
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }

        let (input, output, _) = accountant.totals();
        assert_eq!(accountant.call_count(), 200);
        assert_eq!(input, 2_000);
        assert_eq!(output, 200);
    }
}
