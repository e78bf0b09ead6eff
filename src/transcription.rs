use std::time::Duration;

use async_trait::async_trait;

/// External transcription collaborator used by `chat::media`'s audio pre-flight
/// step. Concrete providers are external network calls; only the call surface is
/// implemented here, selected by `STT_PROVIDER`.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn transcribe(&self, audio_path: &str, timeout: Duration) -> Result<String, TranscriptionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("transcription provider not configured")]
    NotConfigured,
    #[error("transcription request timed out")]
    Timeout,
    #[error("transcription provider error: {0}")]
    Provider(String),
}

/// Selects a provider at startup from `STT_PROVIDER`; `None` when unset, in which
/// case the chat runner skips transcription entirely (non-fatal).
pub fn provider_from_env(
    provider_name: Option<&str>,
    api_key: Option<&str>,
    model: Option<&str>,
    language: Option<&str>,
) -> Option<Box<dyn TranscriptionProvider>> {
    match provider_name {
        Some("deepgram") => Some(Box::new(DeepgramProvider {
            api_key: api_key?.to_owned(),
            model: model.unwrap_or("nova-2").to_owned(),
            language: language.map(str::to_owned),
        })),
        Some("openai") => Some(Box::new(OpenAiProvider {
            api_key: api_key?.to_owned(),
            model: model.unwrap_or("whisper-1").to_owned(),
        })),
        _ => None,
    }
}

struct DeepgramProvider {
    api_key: String,
    model: String,
    language: Option<String>,
}

#[async_trait]
impl TranscriptionProvider for DeepgramProvider {
    async fn transcribe(&self, audio_path: &str, timeout: Duration) -> Result<String, TranscriptionError> {
        let _ = (&self.api_key, &self.model, &self.language, audio_path, timeout);
        Err(TranscriptionError::Provider("deepgram transcription backend is out of scope".into()))
    }
}

struct OpenAiProvider {
    api_key: String,
    model: String,
}

#[async_trait]
impl TranscriptionProvider for OpenAiProvider {
    async fn transcribe(&self, audio_path: &str, timeout: Duration) -> Result<String, TranscriptionError> {
        let _ = (&self.api_key, &self.model, audio_path, timeout);
        Err(TranscriptionError::Provider("openai transcription backend is out of scope".into()))
    }
}
