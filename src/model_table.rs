//! Compile-time-seeded `provider -> modelId -> Model` table.
//!
//! Built once behind a `OnceLock`, mirroring the lazy-singleton idiom this
//! crate uses for its provider registry. Exhaustive catalog maintenance is
//! explicitly the out-of-scope pricing/model-table collaborator's job; this
//! table only seeds enough entries to drive this crate's own adapters and
//! tests.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::model::{Api, Modality, Model, Pricing};

static TABLE: OnceLock<HashMap<&'static str, HashMap<&'static str, Model>>> = OnceLock::new();

fn build() -> HashMap<&'static str, HashMap<&'static str, Model>> {
    let mut table: HashMap<&'static str, HashMap<&'static str, Model>> = HashMap::new();

    let mut google = HashMap::new();
    google.insert(
        "gemini-2.5-flash",
        Model {
            id: "gemini-2.5-flash".to_string(),
            name: "Gemini 2.5 Flash".to_string(),
            api: Api::Google,
            provider: "google".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            reasoning: true,
            modalities: vec![Modality::Text, Modality::Image],
            pricing: Pricing {
                input: 0.30,
                output: 2.50,
                cache_read: 0.075,
                cache_write: 0.0,
            },
            context_window: 1_048_576,
            max_output_tokens: 65_536,
            default_headers: Default::default(),
        },
    );
    table.insert("google", google);

    let mut openai = HashMap::new();
    openai.insert(
        "gpt-5-nano",
        Model {
            id: "gpt-5-nano".to_string(),
            name: "GPT-5 Nano".to_string(),
            api: Api::Openai,
            provider: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            reasoning: true,
            modalities: vec![Modality::Text],
            pricing: Pricing {
                input: 0.05,
                output: 0.40,
                cache_read: 0.005,
                cache_write: 0.0,
            },
            context_window: 400_000,
            max_output_tokens: 128_000,
            default_headers: Default::default(),
        },
    );
    table.insert("openai", openai);

    table
}

/// Looks up a model by provider and model id.
pub fn get(provider: &str, model_id: &str) -> Option<Model> {
    TABLE
        .get_or_init(build)
        .get(provider)
        .and_then(|models| models.get(model_id))
        .cloned()
}

/// All models for a given provider.
pub fn for_provider(provider: &str) -> Vec<Model> {
    TABLE
        .get_or_init(build)
        .get(provider)
        .map(|models| models.values().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_seeded_google_model() {
        let model = get("google", "gemini-2.5-flash").expect("seeded model");
        assert_eq!(model.api, Api::Google);
    }

    #[test]
    fn unknown_model_returns_none() {
        assert!(get("google", "does-not-exist").is_none());
    }
}
