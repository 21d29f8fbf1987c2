use crate::{
    config::Config,
    errors::{ChatError, ChatResult},
    logging::log_api_call,
    models::{ApiCallLog, Message, Role},
    transport::{delta_content, EventDecoder, SseEvent},
};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use futures::Stream;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// One outbound message in the completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Lazy, finite sequence of response fragments.
pub type FragmentStream = BoxStream<'static, ChatResult<String>>;

/// Anything that can turn a request into a fragment sequence.
pub trait CompletionSource: Send + Sync {
    fn stream_completion(&self, request: ChatCompletionRequest) -> FragmentStream;
}

/// Client for an OpenAI-compatible inference server.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: Client,
    base_url: String,
    api_token: String,
}

impl CompletionClient {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.base_url(), config.api_token.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Lists the model ids the server reports.
    pub async fn list_models(&self) -> ChatResult<Vec<String>> {
        let endpoint = format!("{}/models", self.base_url);
        let start_time = Instant::now();

        let response = self
            .client
            .get(&endpoint)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| {
                warn!("Failed to fetch models: {}", e);
                ChatError::connectivity_error(&self.base_url)
            })?;

        record_call(&endpoint, "list_models", response.status().as_u16(), start_time);

        if !response.status().is_success() {
            warn!("Failed to fetch models: HTTP {}", response.status());
            return Err(ChatError::connectivity_error(&self.base_url));
        }

        let body: ModelsResponse = response.json().await.map_err(|e| {
            warn!("Failed to parse models response: {}", e);
            ChatError::connectivity_error(&self.base_url)
        })?;

        Ok(body.data.into_iter().map(|model| model.id).collect())
    }

    /// Opens the streaming request and hands back the raw body.
    async fn open_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> ChatResult<BoxStream<'static, ChatResult<Bytes>>> {
        let endpoint = self.completions_url();
        let payload = ChatCompletionRequest {
            stream: true,
            ..request.clone()
        };
        let start_time = Instant::now();

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        record_call(&endpoint, "stream_completion", status.as_u16(), start_time);

        if !status.is_success() {
            return Err(ChatError::HttpStatus {
                status: status.as_u16(),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ChatError::from))
            .boxed())
    }

    /// The one-shot `stream: false` request used when streaming fails.
    ///
    /// Every failure here is a connectivity error naming the endpoint.
    async fn complete_once(&self, request: &ChatCompletionRequest) -> ChatResult<Option<String>> {
        let endpoint = self.completions_url();
        let payload = ChatCompletionRequest {
            stream: false,
            ..request.clone()
        };
        let start_time = Instant::now();

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                warn!("Non-streaming request failed: {}", e);
                ChatError::connectivity_error(&self.base_url)
            })?;

        let status = response.status();
        record_call(&endpoint, "complete_once", status.as_u16(), start_time);

        if !status.is_success() {
            warn!("Non-streaming request returned HTTP {}", status);
            return Err(ChatError::connectivity_error(&self.base_url));
        }

        let body: CompletionResponse = response.json().await.map_err(|e| {
            warn!("Failed to parse completion response: {}", e);
            ChatError::connectivity_error(&self.base_url)
        })?;

        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .filter(|content| !content.is_empty()))
    }
}

enum Phase {
    Connect(ChatCompletionRequest),
    Streaming {
        fragments: FragmentStream,
        request: ChatCompletionRequest,
    },
    Fallback(ChatCompletionRequest),
    Finished,
}

impl CompletionSource for CompletionClient {
    /// Streams the reply, switching to a single non-streaming request if the
    /// stream cannot be opened or breaks while reading.
    fn stream_completion(&self, request: ChatCompletionRequest) -> FragmentStream {
        let client = self.clone();

        stream::unfold(Phase::Connect(request), move |phase| {
            let client = client.clone();
            async move {
                let mut phase = phase;
                loop {
                    match phase {
                        Phase::Connect(request) => match client.open_stream(&request).await {
                            Ok(body) => {
                                phase = Phase::Streaming {
                                    fragments: content_fragments(body).boxed(),
                                    request,
                                };
                            }
                            Err(e) if e.is_transport() => {
                                warn!("Streaming failed, falling back: {}", e);
                                phase = Phase::Fallback(request);
                            }
                            Err(e) => return Some((Err(e), Phase::Finished)),
                        },
                        Phase::Streaming {
                            mut fragments,
                            request,
                        } => match fragments.next().await {
                            Some(Ok(fragment)) => {
                                return Some((Ok(fragment), Phase::Streaming { fragments, request }));
                            }
                            Some(Err(e)) if e.is_transport() => {
                                warn!("Stream broke mid-response, falling back: {}", e);
                                phase = Phase::Fallback(request);
                            }
                            Some(Err(e)) => return Some((Err(e), Phase::Finished)),
                            None => return None,
                        },
                        Phase::Fallback(request) => {
                            return match client.complete_once(&request).await {
                                Ok(Some(content)) => Some((Ok(content), Phase::Finished)),
                                Ok(None) => None,
                                Err(e) => Some((Err(e), Phase::Finished)),
                            };
                        }
                        Phase::Finished => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

/// Turns a raw completion body into content fragments.
///
/// Ends at `[DONE]` or when the body closes. A read error is yielded once and
/// ends the sequence.
pub fn content_fragments<S>(body: S) -> impl Stream<Item = ChatResult<String>> + Send
where
    S: Stream<Item = ChatResult<Bytes>> + Send + 'static,
{
    stream::unfold(
        (body.boxed(), EventDecoder::new(), VecDeque::<String>::new(), false),
        |(mut body, mut decoder, mut ready, mut failed)| async move {
            loop {
                if let Some(fragment) = ready.pop_front() {
                    return Some((Ok(fragment), (body, decoder, ready, failed)));
                }
                if failed || decoder.is_finished() {
                    return None;
                }

                match body.next().await {
                    Some(Ok(chunk)) => {
                        for event in decoder.feed(&chunk) {
                            match event {
                                SseEvent::Data(payload) => {
                                    if let Some(content) = delta_content(&payload) {
                                        ready.push_back(content);
                                    }
                                }
                                SseEvent::Done => debug!("Stream finished"),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        failed = true;
                        return Some((Err(e), (body, decoder, ready, failed)));
                    }
                    None => return None,
                }
            }
        },
    )
}

fn record_call(endpoint: &str, summary: &str, status: u16, start_time: Instant) {
    log_api_call(&ApiCallLog {
        timestamp: Utc::now(),
        endpoint: endpoint.to_string(),
        request_summary: summary.to_string(),
        response_status: status,
        response_time_ms: start_time.elapsed().as_millis(),
    });
}
