use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Engine configuration. Every field has a serde default so partial config
/// files deserialize cleanly; unknown fields are tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider_base_url: String,
    /// Resolved from the secret manager at startup; `None` marks the LLM
    /// feature unavailable in health checks without aborting startup.
    pub provider_api_key: Option<String>,
    pub default_model: String,
    pub fallback_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub cache_exact_ttl_s: u64,
    pub cache_semantic_ttl_s: u64,
    pub cache_semantic_threshold: f32,
    pub rate_limit_rpm: u32,
    pub rate_limit_rph: u32,
    pub outreach_daily_cap: u32,
    pub outreach_cooldown_minutes: i64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_window_minutes: i64,
    /// Priority name → expiry minutes; falls back to the built-in table for
    /// priorities not listed here.
    pub approval_expiry_by_priority: HashMap<String, i64>,
    pub messaging_base_url: String,
    pub messaging_auth_token: Option<String>,
    pub messaging_from_number: String,
    pub booking_base_url: String,
    pub queue_auth_token: Option<String>,
    pub event_topic: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut approval_expiry = HashMap::new();
        approval_expiry.insert("low".to_string(), 30);
        approval_expiry.insert("medium".to_string(), 15);
        approval_expiry.insert("high".to_string(), 5);
        approval_expiry.insert("urgent".to_string(), 2);
        Self {
            provider_base_url: "https://openrouter.ai/api/v1".to_string(),
            provider_api_key: None,
            default_model: "google/gemini-2.0-flash-001".to_string(),
            fallback_model: "google/gemini-flash-1.5".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            cache_exact_ttl_s: 3600,
            cache_semantic_ttl_s: 7200,
            cache_semantic_threshold: 0.92,
            rate_limit_rpm: 60,
            rate_limit_rph: 1000,
            outreach_daily_cap: 200,
            outreach_cooldown_minutes: 60,
            circuit_breaker_threshold: 5,
            circuit_breaker_window_minutes: 10,
            approval_expiry_by_priority: approval_expiry,
            messaging_base_url: "https://api.twilio.com".to_string(),
            messaging_auth_token: None,
            messaging_from_number: "+10000000000".to_string(),
            booking_base_url: "http://127.0.0.1:8080".to_string(),
            queue_auth_token: None,
            event_topic: "autopilot-events".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn approval_expiry_minutes(&self, priority: &str) -> Option<i64> {
        self.approval_expiry_by_priority.get(priority).copied()
    }

    pub fn llm_available(&self) -> bool {
        self.provider_api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty())
    }

    pub fn messaging_available(&self) -> bool {
        self.messaging_auth_token
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty())
    }
}
