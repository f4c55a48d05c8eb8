use chrono::{DateTime, Utc};

/// Error taxonomy carried through the pipeline and mapped onto transport
/// status codes at the HTTP boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited")]
    RateLimited {
        /// Advisory, seconds until the window resets.
        retry_after_s: Option<u64>,
    },

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider rate limited")]
    ProviderRateLimited,

    /// Not an error at the transport: the caller receives the localized
    /// rejection body with a 200.
    #[error("guardrail rejected the request")]
    GuardrailRejected { response: String },

    #[error("circuit breaker open for agent `{agent}`")]
    CircuitOpen {
        agent: String,
        cooldown_until: Option<DateTime<Utc>>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Machine-readable reason carried in pipeline results and task replies.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "validation_error",
            AgentError::Unauthorized(_) => "unauthorized",
            AgentError::RateLimited { .. } => "rate_limited",
            AgentError::ProviderUnavailable(_) => "provider_unavailable",
            AgentError::ProviderRateLimited => "provider_rate_limited",
            AgentError::GuardrailRejected { .. } => "guardrail_rejected",
            AgentError::CircuitOpen { .. } => "circuit_open",
            AgentError::NotFound(_) => "not_found",
            AgentError::StateConflict(_) => "state_conflict",
            AgentError::Internal(_) => "internal",
        }
    }

    /// Whether a task queue should retry the failed handler invocation.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            AgentError::ProviderUnavailable(_) | AgentError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            AgentError::RateLimited { retry_after_s: None }.kind(),
            "rate_limited"
        );
        assert_eq!(
            AgentError::CircuitOpen {
                agent: "gap_fill_agent".into(),
                cooldown_until: None
            }
            .kind(),
            "circuit_open"
        );
    }

    #[test]
    fn only_systemic_errors_ask_for_retry() {
        assert!(AgentError::Internal("boom".into()).is_systemic());
        assert!(!AgentError::CircuitOpen {
            agent: "a".into(),
            cooldown_until: None
        }
        .is_systemic());
    }
}
