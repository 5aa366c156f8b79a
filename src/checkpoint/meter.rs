//! Context size estimation for threshold-triggered checkpoints.

/// Rough characters-per-token ratio for English prose and code.
pub const CHARS_PER_TOKEN: usize = 4;

/// Tracks accumulated prompt and output size for one story run.
///
/// Reports a crossing every time the estimate passes the next multiple of
/// the configured threshold, so a long run checkpoints at 1x, 2x, 3x...
#[derive(Debug, Clone)]
pub struct ContextMeter {
    threshold_tokens: u64,
    total_chars: usize,
    crossings: u64,
}

impl ContextMeter {
    pub fn new(threshold_tokens: u64) -> Self {
        Self {
            threshold_tokens,
            total_chars: 0,
            crossings: 0,
        }
    }

    /// Resume from a previously estimated token count without re-reporting
    /// crossings already passed.
    pub fn resume(threshold_tokens: u64, estimated_tokens: u64) -> Self {
        let mut meter = Self::new(threshold_tokens);
        meter.total_chars = (estimated_tokens as usize).saturating_mul(CHARS_PER_TOKEN);
        meter.crossings = meter.multiples();
        meter
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.total_chars.div_ceil(CHARS_PER_TOKEN) as u64
    }

    fn multiples(&self) -> u64 {
        if self.threshold_tokens == 0 {
            return 0;
        }
        self.estimated_tokens() / self.threshold_tokens
    }

    /// Add text to the estimate. Returns true when a new threshold multiple
    /// was crossed.
    pub fn add(&mut self, chars: usize) -> bool {
        self.total_chars = self.total_chars.saturating_add(chars);
        let multiples = self.multiples();
        if multiples > self.crossings {
            self.crossings = multiples;
            true
        } else {
            false
        }
    }

    pub fn usage_percentage(&self) -> f32 {
        if self.threshold_tokens == 0 {
            return 0.0;
        }
        (self.estimated_tokens() as f32 / self.threshold_tokens as f32) * 100.0
    }
}
