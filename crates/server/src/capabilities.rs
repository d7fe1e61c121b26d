//! Capability gateway adapters
//!
//! The speech, extraction and click-to-call providers are external
//! services; these adapters speak plain HTTP to them. Transient failures
//! (network, 5xx) are retried here so the rest of the system only ever
//! sees terminal outcomes. The bus adapter never retries: click-to-call
//! transport failures are fatal for the session by design.

use std::time::Duration;

use async_trait::async_trait;

use intercom_agent::{AgentError, ClickToCallPublisher, ClickToCallRequest};
use intercom_config::{BusConfig, LlmConfig, SpeechConfig};
use intercom_directory::{DirectoryEntry, DirectoryError, DirectoryStore, ExtensionRecord};
use intercom_llm::{
    build_prompt, ExtractionContext, ExtractionResult, ExtractionStage, IntentExtractor, LlmError,
};
use intercom_pipeline::{PipelineError, Synthesizer, TranscribeHints, Transcriber};

use crate::ServerError;

/// Attempts per transient-retried call
const CAPABILITY_ATTEMPTS: u32 = 3;

/// Base backoff between attempts
const RETRY_BACKOFF: Duration = Duration::from_millis(300);

fn endpoint_of(option: &Option<String>, key: &str) -> Result<String, ServerError> {
    option
        .as_ref()
        .map(|e| e.trim_end_matches('/').to_string())
        .ok_or_else(|| ServerError::Internal(format!("{key} is not configured")))
}

/// Transcription + synthesis over one speech gateway
pub struct HttpSpeechGateway {
    client: reqwest::Client,
    base: String,
}

impl HttpSpeechGateway {
    pub fn new(config: &SpeechConfig) -> Result<Self, ServerError> {
        let base = endpoint_of(&config.endpoint, "speech.endpoint")?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(Self { client, base })
    }
}

#[async_trait]
impl Transcriber for HttpSpeechGateway {
    async fn transcribe(
        &self,
        audio: &[u8],
        hints: &TranscribeHints,
    ) -> Result<Option<String>, PipelineError> {
        let url = format!("{}/transcribe", self.base);
        let query = [
            ("language", hints.language.clone()),
            (
                "segment_timeout_ms",
                hints.segment_timeout.as_millis().to_string(),
            ),
        ];

        let mut last_error = String::new();
        for attempt in 1..=CAPABILITY_ATTEMPTS {
            let response = self
                .client
                .post(&url)
                .query(&query)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(audio.to_vec())
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let value: serde_json::Value = resp
                        .json()
                        .await
                        .map_err(|e| PipelineError::Capability(e.to_string()))?;
                    return Ok(value
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string));
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = format!("gateway returned {}", resp.status());
                }
                Ok(resp) => {
                    return Err(PipelineError::Capability(format!(
                        "transcription rejected: {}",
                        resp.status()
                    )));
                }
                Err(err) => last_error = err.to_string(),
            }

            tracing::debug!(attempt, %last_error, "transcription attempt failed");
            if attempt < CAPABILITY_ATTEMPTS {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }

        Err(PipelineError::Capability(format!(
            "transcription unavailable: {last_error}"
        )))
    }
}

#[async_trait]
impl Synthesizer for HttpSpeechGateway {
    async fn synthesize(&self, voice: &str, text: &str) -> Result<Vec<u8>, PipelineError> {
        let url = format!("{}/synthesize", self.base);
        let body = serde_json::json!({ "voice": voice, "text": text });

        let mut last_error = String::new();
        for attempt in 1..=CAPABILITY_ATTEMPTS {
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp
                        .bytes()
                        .await
                        .map_err(|e| PipelineError::Capability(e.to_string()))?;
                    return Ok(bytes.to_vec());
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = format!("gateway returned {}", resp.status());
                }
                Ok(resp) => {
                    return Err(PipelineError::Capability(format!(
                        "synthesis rejected: {}",
                        resp.status()
                    )));
                }
                Err(err) => last_error = err.to_string(),
            }

            tracing::debug!(attempt, %last_error, "synthesis attempt failed");
            if attempt < CAPABILITY_ATTEMPTS {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }

        Err(PipelineError::Capability(format!(
            "synthesis unavailable: {last_error}"
        )))
    }
}

/// Staged intent extraction over the LLM gateway
pub struct HttpIntentExtractor {
    client: reqwest::Client,
    base: String,
    model: Option<String>,
}

impl HttpIntentExtractor {
    pub fn new(config: &LlmConfig) -> Result<Self, ServerError> {
        let base = endpoint_of(&config.endpoint, "llm.endpoint")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl IntentExtractor for HttpIntentExtractor {
    async fn extract(
        &self,
        stage: ExtractionStage,
        context: &ExtractionContext,
    ) -> Result<ExtractionResult, LlmError> {
        let url = format!("{}/extract", self.base);
        let body = serde_json::json!({
            "stage": stage,
            "model": self.model,
            "prompt": build_prompt(stage, context),
        });

        let mut last_error = String::new();
        for attempt in 1..=CAPABILITY_ATTEMPTS {
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<ExtractionResult>()
                        .await
                        .map_err(|e| LlmError::InvalidResponse(e.to_string()));
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = format!("gateway returned {}", resp.status());
                }
                Ok(resp) => {
                    return Err(LlmError::Capability(format!(
                        "extraction rejected: {}",
                        resp.status()
                    )));
                }
                Err(err) => last_error = err.to_string(),
            }

            tracing::debug!(attempt, %last_error, "extraction attempt failed");
            if attempt < CAPABILITY_ATTEMPTS {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }

        Err(LlmError::Capability(format!(
            "extraction unavailable: {last_error}"
        )))
    }
}

/// Click-to-call publisher over the bus gateway. No retries here: the
/// orchestrator owns attempt policy, and transport failures surface up.
pub struct HttpBusPublisher {
    client: reqwest::Client,
    endpoint: String,
    exchange: String,
    routing_key: String,
}

impl HttpBusPublisher {
    pub fn new(config: &BusConfig) -> Result<Self, ServerError> {
        let endpoint = endpoint_of(&config.endpoint, "bus.endpoint")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
        })
    }
}

#[async_trait]
impl ClickToCallPublisher for HttpBusPublisher {
    async fn publish(&self, request: &ClickToCallRequest) -> Result<(), AgentError> {
        let body = serde_json::json!({
            "exchange": self.exchange,
            "routing_key": self.routing_key,
            "payload": request.to_payload(),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Bus(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::Bus(format!(
                "bus gateway returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Directory stand-in for deployments without a database. Extension
/// loading falls through to the snapshot; apartment lookups report the
/// directory as unavailable.
pub struct OfflineDirectory;

#[async_trait]
impl DirectoryStore for OfflineDirectory {
    async fn list_extensions(&self) -> Result<Vec<ExtensionRecord>, DirectoryError> {
        Ok(Vec::new())
    }

    async fn find_apartment(
        &self,
        _apartment: &str,
    ) -> Result<Option<DirectoryEntry>, DirectoryError> {
        Err(DirectoryError::Unavailable(
            "no directory database configured".to_string(),
        ))
    }
}
