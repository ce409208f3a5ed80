//! LLM integration: invoice classification and field extraction.
//!
//! Uses the rig-core crate for HTTP transport. `RigExtractor` drives any rig
//! `CompletionModel`; production runs OpenAI's chat-completions API.

pub mod extractor;

pub use extractor::{DEFAULT_MODEL, DEFAULT_OPENAI_BASE_URL, RigExtractor};

use std::sync::Arc;

use secrecy::SecretString;

use crate::error::LlmError;
use crate::pipeline::types::Extractor;

/// Configuration for the extraction model.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

/// Create the extractor from configuration.
pub fn create_extractor(config: &LlmConfig) -> Result<Arc<dyn Extractor>, LlmError> {
    extractor::create_openai_extractor(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_extractor_keeps_model() {
        // rig clients accept any key at construction; auth fails on first request.
        let config = LlmConfig {
            api_key: SecretString::from("sk-test"),
            model: "gpt-4o-mini".to_string(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
        };
        let extractor = create_extractor(&config);
        assert!(extractor.is_ok());
        assert_eq!(extractor.unwrap().model_name(), "gpt-4o-mini");
    }
}
