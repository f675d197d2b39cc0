// =============================================================================
// LLM Capability Boundary — assess(signal, tier) → structured assessment
// =============================================================================
//
// The pipeline treats LLM providers as a black box: given a prompt and a
// tier, return {direction, strength, confidence}. Failures surface as typed
// Transient errors, never silent defaults.
//
// Two backends:
//   HttpLlmBackend — OpenAI-compatible chat completion endpoint per tier,
//                    with a hard per-call timeout.
//   DemoBackend    — deterministic assessment derived from the signal's own
//                    hints, salted per analyst. Used in Demo mode and tests
//                    so the full pipeline runs without provider keys.
// =============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};
use crate::model::TierConfig;
use crate::types::{Direction, LlmTier};

/// One assessment request: the evidence plus the analyst persona asking.
#[derive(Debug, Clone)]
pub struct AssessRequest {
    pub analyst_id: String,
    pub analyst_name: String,
    pub symbol: String,
    pub title: String,
    pub body: String,
    pub direction_hint: Option<Direction>,
    pub strength_hint: Option<f64>,
    pub tier: LlmTier,
    pub tier_config: Option<TierConfig>,
}

/// Structured assessment returned across the boundary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Assessment {
    pub direction: Direction,
    /// Strength in [0, 10].
    pub strength: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

impl Assessment {
    /// Clamp into the documented ranges. Providers occasionally return
    /// slightly out-of-range numbers.
    pub fn clamped(mut self) -> Self {
        self.strength = self.strength.clamp(0.0, 10.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// Object-safe seam for analyst dispatch.
#[async_trait]
pub trait AnalystBackend: Send + Sync {
    async fn assess(&self, request: &AssessRequest) -> PipelineResult<Assessment>;
}

// =============================================================================
// HTTP backend
// =============================================================================

/// Calls an OpenAI-compatible chat completion endpoint. The provider base
/// URL and model come from the universe's tier config; the API key from the
/// environment (`FORESIGHT_LLM_API_KEY`).
pub struct HttpLlmBackend {
    client: reqwest::Client,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpLlmBackend {
    pub fn new(api_key: String, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, api_key }
    }

    fn build_prompt(request: &AssessRequest) -> String {
        format!(
            "You are {name}, a {id} analyst. Assess the following item about {symbol} \
             and reply with JSON {{\"direction\": \"bullish|bearish|neutral\", \
             \"strength\": 0-10, \"confidence\": 0-1}}.\n\nTitle: {title}\n\n{body}",
            name = request.analyst_name,
            id = request.analyst_id,
            symbol = request.symbol,
            title = request.title,
            body = request.body,
        )
    }
}

#[async_trait]
impl AnalystBackend for HttpLlmBackend {
    async fn assess(&self, request: &AssessRequest) -> PipelineResult<Assessment> {
        let tier_config = request.tier_config.as_ref().ok_or_else(|| {
            PipelineError::validation(
                "MISSING_TIER_CONFIG",
                format!("universe has no provider configured for tier {}", request.tier),
            )
        })?;

        let url = format!("{}/v1/chat/completions", tier_config.provider.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": tier_config.model,
            "messages": [
                { "role": "user", "content": Self::build_prompt(request) }
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.2,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("LLM request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::transient(format!(
                "LLM provider returned {} for model {}",
                response.status(),
                tier_config.model
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::transient(format!("malformed LLM response: {e}")))?;

        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| PipelineError::transient("LLM response had no choices"))?;

        let assessment: Assessment = serde_json::from_str(content).map_err(|e| {
            PipelineError::transient(format!("LLM returned non-conforming JSON: {e}"))
        })?;

        Ok(assessment.clamped())
    }
}

// =============================================================================
// Demo backend
// =============================================================================

/// Deterministic assessment from the signal's own hints. The analyst id is
/// hashed into small strength/confidence offsets so different analysts
/// disagree in a stable, reproducible way.
pub struct DemoBackend;

impl DemoBackend {
    /// Stable per-(analyst, symbol) jitter in [0, 1).
    fn jitter(analyst_id: &str, symbol: &str) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(analyst_id.as_bytes());
        hasher.update(b"/");
        hasher.update(symbol.as_bytes());
        let digest = hasher.finalize();
        u16::from_be_bytes([digest[0], digest[1]]) as f64 / (u16::MAX as f64 + 1.0)
    }
}

#[async_trait]
impl AnalystBackend for DemoBackend {
    async fn assess(&self, request: &AssessRequest) -> PipelineResult<Assessment> {
        let jitter = Self::jitter(&request.analyst_id, &request.symbol);

        let direction = request.direction_hint.unwrap_or(Direction::Neutral);
        let base_strength = request.strength_hint.unwrap_or(5.0);

        // The contrarian slice of the hash space flips direction, so demo
        // ensembles are not unanimous.
        let direction = if jitter > 0.85 { direction.inverse() } else { direction };

        let strength = (base_strength + (jitter - 0.5) * 2.0).clamp(0.0, 10.0);
        let confidence = (0.55 + (jitter - 0.5) * 0.6).clamp(0.0, 1.0);

        Ok(Assessment { direction, strength, confidence })
    }
}
