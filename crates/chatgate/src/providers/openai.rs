use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::base::{ChunkStream, Completion, ModelInvoker, Prompt};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    messages_to_openai_spec, openai_response_to_completion, parse_stream_line,
    tools_to_openai_spec, LineBuffer, StreamEvent,
};
use crate::errors::{GatewayError, GatewayResult};

/// Talks to any endpoint implementing the OpenAI chat completions protocol (OpenAI, Groq, ...)
pub struct OpenAiCompatibleInvoker {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiCompatibleInvoker {
    pub fn new(config: OpenAiProviderConfig) -> GatewayResult<Self> {
        // No client-wide deadline: it would also cover reading a stream's body
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        )
    }

    fn build_payload(&self, prompt: &Prompt, stream: bool) -> GatewayResult<Value> {
        let tools_spec = if !prompt.options.tools.is_empty() {
            tools_to_openai_spec(&prompt.options.tools)?
        } else {
            vec![]
        };

        let model = prompt
            .options
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());

        let mut payload = json!({
            "model": model,
            "messages": messages_to_openai_spec(prompt),
        });

        let object = payload
            .as_object_mut()
            .ok_or_else(|| GatewayError::FatalUpstream("payload is not an object".into()))?;
        if !tools_spec.is_empty() {
            object.insert("tools".to_string(), json!(tools_spec));
        }
        if let Some(temp) = prompt.options.temperature.or(self.config.temperature) {
            object.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = prompt.options.max_tokens.or(self.config.max_tokens) {
            object.insert("max_tokens".to_string(), json!(tokens));
        }
        if stream {
            object.insert("stream".to_string(), json!(true));
            object.insert(
                "stream_options".to_string(),
                json!({"include_usage": true}),
            );
        }

        Ok(payload)
    }

    fn request(&self, payload: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(payload)
    }

    async fn check(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
        match response.status() {
            StatusCode::OK => Ok(response),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(GatewayError::FatalUpstream(format!(
                    "Request failed: {}\nBody: {}",
                    status, body
                )))
            }
        }
    }
}

fn idle_timeout(idle: std::time::Duration) -> GatewayError {
    GatewayError::timeout(format!("no data from upstream for {}ms", idle.as_millis()))
}

#[async_trait]
impl ModelInvoker for OpenAiCompatibleInvoker {
    async fn invoke(&self, prompt: &Prompt) -> GatewayResult<Completion> {
        let payload = self.build_payload(prompt, false)?;
        let response = self
            .request(&payload)
            .timeout(self.config.timeout)
            .send()
            .await?;
        let response: Value = Self::check(response).await?.json().await?;

        if let Some(error) = response.get("error") {
            return Err(GatewayError::FatalUpstream(format!(
                "API error: {}",
                error
            )));
        }

        openai_response_to_completion(&response)
    }

    async fn invoke_stream(&self, prompt: &Prompt) -> GatewayResult<ChunkStream> {
        let payload = self.build_payload(prompt, true)?;
        let idle = self.config.timeout;
        let response = tokio::time::timeout(idle, self.request(&payload).send())
            .await
            .map_err(|_| idle_timeout(idle))??;
        let mut body = Self::check(response).await?.bytes_stream();

        Ok(Box::pin(async_stream::try_stream! {
            let mut buffer = LineBuffer::default();
            let mut done = false;
            // Each read gets the full budget, so a slow but live stream is never cut off
            'body: while let Some(bytes) = tokio::time::timeout(idle, body.next())
                .await
                .map_err(|_| idle_timeout(idle))?
            {
                let bytes = bytes.map_err(GatewayError::from)?;
                for line in buffer.push(&bytes) {
                    match parse_stream_line(&line)? {
                        Some(StreamEvent::Chunk(chunk)) => {
                            if !chunk.text.is_empty() || chunk.usage.is_some() {
                                yield chunk;
                            }
                        }
                        Some(StreamEvent::Done) => {
                            done = true;
                            break 'body;
                        }
                        None => {}
                    }
                }
            }
            // Some servers close the body without a trailing newline or `[DONE]`
            if !done {
                if let Some(line) = buffer.finish() {
                    if let Some(StreamEvent::Chunk(chunk)) = parse_stream_line(&line)? {
                        if !chunk.text.is_empty() || chunk.usage.is_some() {
                            yield chunk;
                        }
                    }
                }
            }
        }))
    }
}
