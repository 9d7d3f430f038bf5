//! LLM adapter (C3): two-tier (`small`/`large`) structured completion with
//! schema-failure retry, wrapping `kg_ai_client::openai::OpenAi::extract`
//! and its `StructuredOutput` schema-fixup pipeline verbatim.

use kg_ai_client::openai::{OpenAi, StructuredOutput};
use thiserror::Error;

/// Model tier a call is issued at. `Large` is used for extraction, `Small`
/// for cheaper auxiliary calls (contradiction detection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Small,
    Large,
}

#[derive(Debug, Error)]
pub enum LlmFailure {
    #[error("schema validation failed after {attempts} attempts: {last_error}")]
    Schema { attempts: u32, last_error: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Thin two-tier wrapper around the provider client. Holds both model
/// names so callers select a tier instead of a model string.
#[derive(Clone)]
pub struct LlmAdapter {
    small: OpenAi,
    large: OpenAi,
    max_retries: u32,
}

impl LlmAdapter {
    pub fn new(api_key: impl Into<String>, small_model: impl Into<String>, large_model: impl Into<String>) -> Self {
        let api_key = api_key.into();
        Self {
            small: OpenAi::new(api_key.clone(), small_model),
            large: OpenAi::new(api_key, large_model),
            max_retries: 3,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.small = self.small.with_base_url(url.clone());
        self.large = self.large.with_base_url(url);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    fn agent_for(&self, tier: ModelTier) -> &OpenAi {
        match tier {
            ModelTier::Small => &self.small,
            ModelTier::Large => &self.large,
        }
    }

    /// Validates the returned JSON against `T`'s schema, retrying with the
    /// parser error appended to the prompt on failure, up to `max_retries`.
    /// `temperature` is forwarded as-is (§4.3: 0.1 for extraction, 0.0 for
    /// deduplication/contradiction checks); `None` falls back to the
    /// provider client's own default.
    pub async fn complete_json<T: StructuredOutput>(
        &self,
        system: &str,
        user: &str,
        tier: ModelTier,
        temperature: Option<f32>,
    ) -> Result<T, LlmFailure> {
        let agent = self.agent_for(tier);
        let model = match tier {
            ModelTier::Small => agent.model().to_string(),
            ModelTier::Large => agent.model().to_string(),
        };

        let mut last_error = String::new();
        let mut user_prompt = user.to_string();

        for attempt in 0..=self.max_retries {
            match agent.extract::<T>(&model, system, user_prompt.clone(), temperature).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e.to_string();
                    user_prompt = format!(
                        "{user}\n\nYour previous response failed schema validation with error: {last_error}. \
                         Return only valid JSON matching the schema."
                    );
                    tracing::warn!(attempt, error = %last_error, "llm structured output retry");
                }
            }
        }

        Err(LlmFailure::Schema { attempts: self.max_retries + 1, last_error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_tier_is_copy_and_comparable() {
        assert_eq!(ModelTier::Large, ModelTier::Large);
        assert_ne!(ModelTier::Small, ModelTier::Large);
    }
}
