use serde::{Deserialize, Serialize};

/// Token usage as reported by the provider. Zero means "not reported".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }

    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Running totals across every provider round-trip of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub provider_calls: u32,
    /// Round-trips whose usage the provider did not report.
    pub unreported_calls: u32,
}

impl AccumulatedUsage {
    pub fn accumulate(&mut self, usage: &TokenUsage) {
        self.provider_calls += 1;
        if usage.is_unknown() {
            self.unreported_calls += 1;
            return;
        }
        self.input_tokens += usage.input_tokens as u64;
        self.output_tokens += usage.output_tokens as u64;
    }

    pub fn merge(&mut self, other: &AccumulatedUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.provider_calls += other.provider_calls;
        self.unreported_calls += other.unreported_calls;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_usage_is_unknown_not_error() {
        let mut acc = AccumulatedUsage::default();
        acc.accumulate(&TokenUsage::default());
        acc.accumulate(&TokenUsage::new(100, 20));

        assert_eq!(acc.provider_calls, 2);
        assert_eq!(acc.unreported_calls, 1);
        assert_eq!(acc.total_tokens(), 120);
    }

    #[test]
    fn merge_sums_fields() {
        let mut a = AccumulatedUsage::default();
        a.accumulate(&TokenUsage::new(10, 5));
        let mut b = AccumulatedUsage::default();
        b.accumulate(&TokenUsage::new(1, 1));
        b.accumulate(&TokenUsage::default());
        a.merge(&b);
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 6);
        assert_eq!(a.provider_calls, 3);
        assert_eq!(a.unreported_calls, 1);
    }
}
