use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::{FinishReason, TokenUsage};

/// Timing and throughput of one completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionMetrics {
    pub provider: String,
    pub model: String,
    pub duration: Duration,
    pub usage: TokenUsage,
    pub tokens_per_second: f64,
    pub finish_reason: FinishReason,
}

impl ExecutionMetrics {
    pub fn from_run(
        start: Instant,
        end: Instant,
        usage: TokenUsage,
        model: impl Into<String>,
        provider: impl Into<String>,
        finish_reason: FinishReason,
    ) -> Self {
        let duration = end.saturating_duration_since(start);
        let generated = usage.output_tokens + usage.cache_read_tokens;
        let seconds = duration.as_secs_f64();
        let tokens_per_second = if seconds > 0.0 {
            generated as f64 / seconds
        } else {
            0.0
        };

        Self {
            provider: provider.into(),
            model: model.into(),
            duration,
            usage,
            tokens_per_second,
            finish_reason,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{}: {:.2}s, {} in, {} out, {} cached, {:.1} tok/s, {}",
            self.provider,
            self.model,
            self.duration.as_secs_f64(),
            self.usage.input_tokens,
            self.usage.output_tokens,
            self.usage.cache_read_tokens,
            self.tokens_per_second,
            self.finish_reason.as_str(),
        )
    }

    pub fn log(&self) {
        debug!(
            provider = self.provider.as_str(),
            model = self.model.as_str(),
            duration_ms = self.duration.as_millis() as u64,
            input_tokens = self.usage.input_tokens,
            output_tokens = self.usage.output_tokens,
            cache_read_tokens = self.usage.cache_read_tokens,
            tokens_per_second = self.tokens_per_second,
            finish_reason = self.finish_reason.as_str(),
            "chat completion finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_counts_output_and_cache_reads() {
        let start = Instant::now();
        let end = start + Duration::from_secs(2);
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 60,
            cache_creation_tokens: 0,
            cache_read_tokens: 40,
        };
        let metrics =
            ExecutionMetrics::from_run(start, end, usage, "gpt-4o", "openai", FinishReason::EndTurn);
        assert_eq!(metrics.tokens_per_second, 50.0);
        assert_eq!(
            metrics.summary(),
            "openai/gpt-4o: 2.00s, 10 in, 60 out, 40 cached, 50.0 tok/s, end_turn"
        );
    }

    #[test]
    fn zero_duration_reports_zero_throughput() {
        let now = Instant::now();
        let metrics = ExecutionMetrics::from_run(
            now,
            now,
            TokenUsage::default(),
            "m",
            "p",
            FinishReason::Unknown,
        );
        assert_eq!(metrics.tokens_per_second, 0.0);
    }
}
