use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    /// Base URL of an OpenAI-compatible API, without the `/v1/...` suffix
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    /// Connect timeout and deadline for a blocking request. A stream may run longer;
    /// it only fails when a single read waits this long.
    pub timeout: Duration,
}

impl OpenAiProviderConfig {
    pub fn new<H: Into<String>, K: Into<String>, M: Into<String>>(
        host: H,
        api_key: K,
        model: M,
    ) -> Self {
        Self {
            host: host.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            timeout: Duration::from_secs(600),
        }
    }
}
