//! Model fallback: error classification and the retry/fallback state machine.
//!
//! Each generation attempt runs against the model at the current chain index.
//! Rate-limit-class failures move to the next model in the chain with a fresh
//! retry budget; anything else burns one retry on the same model. The engine
//! never moves backwards through the chain and never exceeds its bounds.

use crate::config::LimitsConfig;
use crate::error::LlmError;

use std::time::Duration;

/// Coarse error class driving the fallback transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Other,
}

/// Whether an error message indicates quota exhaustion or provider overload.
pub fn is_rate_limit_message(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    lower.contains("429")
        || lower.contains("resource_exhausted")
        || lower.contains("resource has been exhausted")
        || lower.contains("rate limit")
        || lower.contains("quota")
        || lower.contains("503")
        || lower.contains("unavailable")
        || lower.contains("overloaded")
}

/// Classify a generation error. Pure; the only input to the state machine.
pub fn classify_error(error: &LlmError) -> ErrorClass {
    match error {
        LlmError::RateLimitExceeded(_) => ErrorClass::RateLimit,
        other if is_rate_limit_message(&other.to_string()) => ErrorClass::RateLimit,
        _ => ErrorClass::Other,
    }
}

/// Retry budget and delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    /// Attempts granted to each model in the chain.
    pub retries_per_model: u32,
    /// Delay applied before trying the next model after a rate limit.
    pub rate_limit_backoff: Duration,
    /// Delay applied before retrying the same model.
    pub retry_delay: Duration,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl From<&LimitsConfig> for FallbackPolicy {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            retries_per_model: limits.retries_per_model.max(1),
            rate_limit_backoff: limits.rate_limit_backoff,
            retry_delay: limits.retry_delay,
        }
    }
}

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    Attempting { index: usize, retries_left: u32 },
    Backoff {
        index: usize,
        retries_left: u32,
        delay: Duration,
    },
    Exhausted,
    Success,
}

/// Retry/fallback state machine over an ordered model chain.
#[derive(Debug, Clone)]
pub struct FallbackEngine {
    chain: Vec<String>,
    policy: FallbackPolicy,
    state: FallbackState,
    attempted: Vec<String>,
    last_error: Option<String>,
}

impl FallbackEngine {
    pub fn new(chain: Vec<String>, policy: FallbackPolicy) -> Self {
        let state = if chain.is_empty() {
            FallbackState::Exhausted
        } else {
            FallbackState::Backoff {
                index: 0,
                retries_left: policy.retries_per_model,
                delay: Duration::ZERO,
            }
        };

        Self {
            chain,
            policy,
            state,
            attempted: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> FallbackState {
        self.state
    }

    /// Current chain index. Never decreases.
    pub fn index(&self) -> usize {
        match self.state {
            FallbackState::Attempting { index, .. } | FallbackState::Backoff { index, .. } => {
                index
            }
            FallbackState::Exhausted | FallbackState::Success => self.last_index(),
        }
    }

    pub fn retries_left(&self) -> u32 {
        match self.state {
            FallbackState::Attempting { retries_left, .. }
            | FallbackState::Backoff { retries_left, .. } => retries_left,
            FallbackState::Exhausted | FallbackState::Success => 0,
        }
    }

    /// Model the next (or current) attempt runs against.
    pub fn current_model(&self) -> Option<&str> {
        match self.state {
            FallbackState::Attempting { index, .. } | FallbackState::Backoff { index, .. } => {
                self.chain.get(index).map(String::as_str)
            }
            FallbackState::Exhausted | FallbackState::Success => None,
        }
    }

    /// Every model that has been attempted, in order, without duplicates.
    pub fn attempted_models(&self) -> &[String] {
        &self.attempted
    }

    /// Leave backoff and start an attempt. Returns the model to call, or
    /// `None` once the engine is terminal.
    pub fn begin_attempt(&mut self) -> Option<String> {
        let FallbackState::Backoff {
            index,
            retries_left,
            ..
        } = self.state
        else {
            return None;
        };

        let model = self.chain[index].clone();
        if !self.attempted.contains(&model) {
            self.attempted.push(model.clone());
        }
        self.state = FallbackState::Attempting {
            index,
            retries_left,
        };
        Some(model)
    }

    pub fn record_success(&mut self) {
        self.state = FallbackState::Success;
    }

    /// Apply a failed attempt. Returns the new state: `Backoff` carries the
    /// delay to wait before calling `begin_attempt` again.
    pub fn record_failure(&mut self, error: &LlmError) -> FallbackState {
        let FallbackState::Attempting {
            index,
            retries_left,
        } = self.state
        else {
            return self.state;
        };

        self.last_error = Some(error.to_string());
        let has_next = index + 1 < self.chain.len();

        self.state = match classify_error(error) {
            ErrorClass::RateLimit if has_next => FallbackState::Backoff {
                index: index + 1,
                retries_left: self.policy.retries_per_model,
                delay: self.policy.rate_limit_backoff,
            },
            ErrorClass::RateLimit => match retries_left.saturating_sub(1) {
                0 => FallbackState::Exhausted,
                remaining => FallbackState::Backoff {
                    index,
                    retries_left: remaining,
                    delay: self.policy.rate_limit_backoff,
                },
            },
            ErrorClass::Other => match retries_left.saturating_sub(1) {
                0 if has_next => FallbackState::Backoff {
                    index: index + 1,
                    retries_left: self.policy.retries_per_model,
                    delay: self.policy.retry_delay,
                },
                0 => FallbackState::Exhausted,
                remaining => FallbackState::Backoff {
                    index,
                    retries_left: remaining,
                    delay: self.policy.retry_delay,
                },
            },
        };

        self.state
    }

    /// Terminal error naming every attempted model.
    pub fn failure(&self) -> LlmError {
        LlmError::GenerationFailed {
            models: self.attempted.clone(),
            last_error: self
                .last_error
                .clone()
                .unwrap_or_else(|| "no model was attempted".into()),
        }
    }

    fn last_index(&self) -> usize {
        self.attempted
            .last()
            .and_then(|model| self.chain.iter().position(|m| m == model))
            .unwrap_or(0)
    }
}
