//! Ingress policies.
//!
//! The four policies are independent and compose freely. Together with
//! [`EdgeMatching`] they form an [`IngressConfig`], which hosts can load
//! from their own configuration files.

use serde::{Deserialize, Serialize};

use super::IngressError;

/// What to do with a data event earlier than the last punctuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisorderPolicy {
    /// Fail with a [`DisorderError`](super::DisorderError). The ingress
    /// terminates.
    #[default]
    Throw,
    /// Move the event forward to the last punctuation. Intervals that end
    /// at or before it are dropped.
    Adjust,
    /// Discard the event.
    Drop,
}

/// How punctuations enter the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunctuationPolicy {
    /// Only punctuations present in the input.
    #[default]
    None,
    /// A punctuation at the period boundary whenever event time reaches
    /// `period` past the last punctuation. Inserted before the event that
    /// crossed the boundary.
    Time {
        /// Period in time units.
        period: i64,
    },
    /// A punctuation at the highest accepted `sync_time` after every
    /// `events` accepted data events.
    Count {
        /// Data events between punctuations.
        events: u64,
    },
}

/// When the batch under assembly is pushed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// After every punctuation, and whenever the batch fills up.
    #[default]
    OnPunctuation,
    /// Only when the batch fills up, on explicit flush, and at completion.
    WhenFull,
}

/// What completing the source does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCompletedPolicy {
    /// Emit a final punctuation at infinity, closing every open lifetime.
    #[default]
    EndOfStream,
    /// Release buffered events and complete without a final punctuation.
    None,
}

/// How an End with no open Start is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMatching {
    /// Fail with [`InvalidEventError::UnmatchedEnd`](crate::event::InvalidEventError::UnmatchedEnd).
    #[default]
    Strict,
    /// Drop the End and log a warning.
    Repair,
}

/// Complete ingress configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Disorder handling.
    pub disorder: DisorderPolicy,
    /// Punctuation generation.
    pub punctuation: PunctuationPolicy,
    /// Batch flushing.
    pub flush: FlushPolicy,
    /// Completion behavior.
    pub on_completed: OnCompletedPolicy,
    /// Unmatched End handling.
    pub edge_matching: EdgeMatching,
}

impl IngressConfig {
    /// Sets the disorder policy.
    #[must_use]
    pub fn with_disorder(mut self, policy: DisorderPolicy) -> Self {
        self.disorder = policy;
        self
    }

    /// Sets the punctuation policy.
    #[must_use]
    pub fn with_punctuation(mut self, policy: PunctuationPolicy) -> Self {
        self.punctuation = policy;
        self
    }

    /// Sets the flush policy.
    #[must_use]
    pub fn with_flush(mut self, policy: FlushPolicy) -> Self {
        self.flush = policy;
        self
    }

    /// Sets the completion policy.
    #[must_use]
    pub fn with_on_completed(mut self, policy: OnCompletedPolicy) -> Self {
        self.on_completed = policy;
        self
    }

    /// Sets unmatched End handling.
    #[must_use]
    pub fn with_edge_matching(mut self, matching: EdgeMatching) -> Self {
        self.edge_matching = matching;
        self
    }

    /// Checks the policy parameters.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::InvalidConfig`] for a non-positive period or
    /// a zero event count.
    pub fn validate(&self) -> Result<(), IngressError> {
        match self.punctuation {
            PunctuationPolicy::Time { period } if period <= 0 => Err(IngressError::InvalidConfig(
                format!("punctuation period must be positive, got {period}"),
            )),
            PunctuationPolicy::Count { events: 0 } => Err(IngressError::InvalidConfig(
                "punctuation event count must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_strict() {
        let config = IngressConfig::default();
        assert_eq!(config.disorder, DisorderPolicy::Throw);
        assert_eq!(config.punctuation, PunctuationPolicy::None);
        assert_eq!(config.on_completed, OnCompletedPolicy::EndOfStream);
        assert_eq!(config.edge_matching, EdgeMatching::Strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_periods_rejected() {
        let config =
            IngressConfig::default().with_punctuation(PunctuationPolicy::Time { period: 0 });
        assert!(matches!(config.validate(), Err(IngressError::InvalidConfig(_))));
        let config =
            IngressConfig::default().with_punctuation(PunctuationPolicy::Count { events: 0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_loads_from_json() {
        let config: IngressConfig = serde_json::from_str(
            r#"{"disorder":"adjust","punctuation":{"time":{"period":10}},"flush":"when_full"}"#,
        )
        .unwrap();
        assert_eq!(config.disorder, DisorderPolicy::Adjust);
        assert_eq!(config.punctuation, PunctuationPolicy::Time { period: 10 });
        assert_eq!(config.flush, FlushPolicy::WhenFull);
        assert_eq!(config.edge_matching, EdgeMatching::Strict);
    }
}
