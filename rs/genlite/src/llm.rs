//! Text-generation client and the three prompt/parse flows built on top of it:
//! search, caption, and simulate.

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Abstraction over the backing text-generation model. Swappable in tests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_text(&self, prompt: &str, max_new_tokens: u32, temperature: f64) -> Result<String>;
}

/// `reqwest`-backed client for a Hugging Face-style text generation endpoint.
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpLlmClient {
    pub fn new(endpoint: String, auth_token: Option<String>) -> Self {
        HttpLlmClient {
            client: reqwest::Client::new(),
            endpoint,
            auth_token,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate_text(&self, prompt: &str, max_new_tokens: u32, temperature: f64) -> Result<String> {
        let mut builder = self.client.post(&self.endpoint).json(&serde_json::json!({
            "inputs": prompt,
            "parameters": {
                "max_new_tokens": max_new_tokens,
                "temperature": temperature,
            }
        }));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::GenerationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::GenerationFailed(format!("HTTP {}", response.status())));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::GenerationFailed(e.to_string()))?;

        let text = body
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|v| v.get("generated_text"))
            .and_then(|v| v.as_str())
            .or_else(|| body.get("generated_text").and_then(|v| v.as_str()))
            .ok_or_else(|| Error::GenerationFailed("no generated_text in response".into()))?;

        Ok(text.to_string())
    }
}

/// One search result, shaped for direct serialization into the client reply.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "thumbnailUrl")]
    pub thumbnail_url: String,
    #[serde(rename = "videoUrl")]
    pub video_url: String,
    #[serde(rename = "isLatent")]
    pub is_latent: bool,
    #[serde(rename = "useFixedSeed")]
    pub use_fixed_seed: bool,
    pub seed: u32,
    pub views: u32,
    pub tags: Vec<String>,
}

const MAX_SEARCH_ATTEMPTS: u32 = 2;

fn generate_seed() -> u32 {
    rand::rng().random_range(0..1_000_000)
}

fn placeholder_tag_pattern() -> Regex {
    Regex::new(r"<[A-Z_]+>").expect("valid regex")
}

/// Ask the model for a title/description pair, retrying on malformed YAML or
/// leftover `<PLACEHOLDER>` tags, and falling back to a synthesized
/// generic result if every attempt is exhausted.
pub async fn search(llm: &dyn LlmClient, query: &str) -> SearchResult {
    let placeholder = placeholder_tag_pattern();
    let mut temperature = rand::rng().random_range(0.68..=0.72);

    for attempt in 0..=MAX_SEARCH_ATTEMPTS {
        let prompt = format!(
            "Describe the first scene/shot for: \"{query}\". Respond as YAML with `title` and `description` fields only. (attempt {attempt})"
        );

        let raw = match llm.generate_text(&prompt, 200, temperature).await {
            Ok(raw) => raw,
            Err(_) => {
                temperature = rand::rng().random_range(0.68..=0.72);
                continue;
            }
        };

        let parsed: Option<serde_yaml::Value> = serde_yaml::from_str(raw.trim()).ok();
        let Some(serde_yaml::Value::Mapping(map)) = parsed else {
            temperature = rand::rng().random_range(0.68..=0.72);
            continue;
        };

        let title = map
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let title = if title.is_empty() { "Untitled Video".to_string() } else { title };

        let mut description = map
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if description.is_empty() {
            description = "No description available".to_string();
        }

        if placeholder.is_match(&description) {
            if attempt < MAX_SEARCH_ATTEMPTS {
                temperature = rand::rng().random_range(0.68..=0.72);
                continue;
            }
            description = title.clone();
        }

        let use_fixed_seed = description.to_lowercase().contains("webcam");
        return SearchResult {
            id: Uuid::new_v4().to_string(),
            title,
            description,
            thumbnail_url: String::new(),
            video_url: String::new(),
            is_latent: true,
            use_fixed_seed,
            seed: generate_seed(),
            views: 0,
            tags: vec![],
        };
    }

    const VIDEO_TYPES: &[&str] = &[
        "documentary",
        "movie screencap, movie scene",
        "POV, gopro footage",
        "music video",
        "videogame gameplay",
        "creepy found footage",
    ];
    let video_type = VIDEO_TYPES[rand::rng().random_range(0..VIDEO_TYPES.len())];

    SearchResult {
        id: Uuid::new_v4().to_string(),
        title: format!("{query} ({video_type})"),
        description: format!("{video_type}, {query}, engaging, detailed, dynamic, high quality, 4K, intricate details"),
        thumbnail_url: String::new(),
        video_url: String::new(),
        is_latent: true,
        use_fixed_seed: query.to_lowercase().contains("query"),
        seed: generate_seed(),
        views: 0,
        tags: vec![],
    }
}

/// Generate a longer narrative caption, trimming a trailing partial sentence
/// (the model's last sentence before the token budget cut it off).
pub async fn generate_caption(llm: &dyn LlmClient, title: &str, description: &str) -> Result<String> {
    let prompt = format!(
        "Generate a detailed story for a video named: \"{title}\". Visual description: {description}. Write 200-300 words covering plot and action."
    );

    let response = llm.generate_text(&prompt, 180, 0.7).await?;
    let response = response.replace("Caption: ", "");

    let padded = format!(" {response} ");
    let chunks: Vec<&str> = padded.split(". ").collect();
    let text = if chunks.len() > 1 {
        chunks[..chunks.len() - 1].join(". ")
    } else {
        response
    };

    Ok(text.trim().to_string())
}

/// The inputs to a single `simulate` evolution step.
pub struct SimulateRequest<'a> {
    pub original_title: &'a str,
    pub original_description: &'a str,
    pub current_description: &'a str,
    pub condensed_history: &'a str,
    pub evolution_count: u32,
    pub chat_messages: &'a str,
}

/// Evolve a video's narrative by one step. On generation failure or an empty
/// response, the current description is carried forward unchanged rather
/// than surfacing an error to the caller.
pub async fn simulate(llm: &dyn LlmClient, request: &SimulateRequest<'_>) -> String {
    let is_first = request.evolution_count == 0 || request.condensed_history.is_empty();

    let chat_section = if request.chat_messages.is_empty() {
        String::new()
    } else {
        format!(
            "\nViewers have shared the following messages; incorporate relevant ones into the scene:\n\n{}\n",
            request.chat_messages
        )
    };

    let prompt = if is_first {
        format!(
            "Evolve the narrative for \"{}\". Original description: {}.{}\nWrite the next scene, about 200 words, preserving visual consistency.",
            request.original_title, request.original_description, chat_section
        )
    } else {
        format!(
            "Continue the narrative for \"{}\". Original description: {}. History: {}. Current scene: {}.{}\nWrite the next scene, about 200 words, preserving visual consistency.",
            request.original_title,
            request.original_description,
            request.condensed_history,
            request.current_description,
            chat_section
        )
    };

    match llm.generate_text(&prompt, 240, 0.60).await {
        Ok(response) => {
            let evolved = response.trim().to_string();
            if evolved.is_empty() {
                request.current_description.to_string()
            } else {
                evolved
            }
        }
        Err(_) => request.current_description.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubLlm {
        responses: Vec<String>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn generate_text(&self, _prompt: &str, _max_new_tokens: u32, _temperature: f64) -> Result<String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.responses
                .get(i)
                .cloned()
                .ok_or_else(|| Error::GenerationFailed("exhausted".into()))
        }
    }

    #[tokio::test]
    async fn search_parses_well_formed_yaml() {
        let llm = StubLlm {
            responses: vec!["title: \"A cat\"\ndescription: \"documentary footage of a cat\"".to_string()],
            calls: AtomicU32::new(0),
        };
        let result = search(&llm, "cats").await;
        assert_eq!(result.title, "A cat");
        assert_eq!(result.description, "documentary footage of a cat");
    }

    #[tokio::test]
    async fn search_retries_on_placeholder_tags_then_falls_back_to_title() {
        let llm = StubLlm {
            responses: vec![
                "title: \"Thing\"\ndescription: \"<LOCATION> scene\"".to_string(),
                "title: \"Thing\"\ndescription: \"<LOCATION> scene again\"".to_string(),
                "title: \"Thing\"\ndescription: \"<LOCATION> scene still\"".to_string(),
            ],
            calls: AtomicU32::new(0),
        };
        let result = search(&llm, "things").await;
        assert_eq!(result.description, "Thing");
    }

    #[tokio::test]
    async fn search_falls_back_to_synthesized_result_when_every_attempt_fails() {
        let llm = StubLlm { responses: vec![], calls: AtomicU32::new(0) };
        let result = search(&llm, "dogs").await;
        assert!(result.title.contains("dogs"));
        assert!(!result.description.is_empty());
    }

    #[tokio::test]
    async fn caption_trims_trailing_partial_sentence() {
        let llm = StubLlm {
            responses: vec!["First sentence. Second sentence. Trailing partial".to_string()],
            calls: AtomicU32::new(0),
        };
        let caption = generate_caption(&llm, "t", "d").await.unwrap();
        assert_eq!(caption, "First sentence. Second sentence");
    }

    #[tokio::test]
    async fn simulate_falls_back_to_current_description_on_empty_response() {
        let llm = StubLlm { responses: vec!["   ".to_string()], calls: AtomicU32::new(0) };
        let request = SimulateRequest {
            original_title: "t",
            original_description: "d",
            current_description: "current scene",
            condensed_history: "",
            evolution_count: 0,
            chat_messages: "",
        };
        let evolved = simulate(&llm, &request).await;
        assert_eq!(evolved, "current scene");
    }

    #[tokio::test]
    async fn simulate_falls_back_to_current_description_on_llm_error() {
        let llm = StubLlm { responses: vec![], calls: AtomicU32::new(0) };
        let request = SimulateRequest {
            original_title: "t",
            original_description: "d",
            current_description: "current scene",
            condensed_history: "some history",
            evolution_count: 3,
            chat_messages: "nice!",
        };
        let evolved = simulate(&llm, &request).await;
        assert_eq!(evolved, "current scene");
    }
}
