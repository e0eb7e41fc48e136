use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::errors::{GatewayError, GatewayResult};

/// Used whenever no prompt has ever been loaded successfully
pub const FALLBACK_PROMPT: &str = "You are a helpful AI assistant.";

const LANGUAGE_HINTS: [&str; 4] = [
    "same language",
    "language as the user",
    "answer in",
    "respond in",
];

/// Supplies the system prompt placed in front of every request
pub trait SystemPromptSource: Send + Sync {
    /// The cached prompt
    fn prompt(&self) -> String;

    /// Refresh the cache. On failure the previous prompt stays in effect.
    fn reload(&self) -> GatewayResult<()> {
        Ok(())
    }
}

/// A fixed prompt
#[derive(Debug, Clone)]
pub struct StaticPrompt(String);

impl StaticPrompt {
    pub fn new<S: Into<String>>(prompt: S) -> Self {
        Self(prompt.into())
    }
}

impl Default for StaticPrompt {
    fn default() -> Self {
        Self::new(FALLBACK_PROMPT)
    }
}

impl SystemPromptSource for StaticPrompt {
    fn prompt(&self) -> String {
        self.0.clone()
    }
}

/// A prompt read from a UTF-8 file, re-read on `reload`
#[derive(Debug)]
pub struct FilePromptSource {
    path: PathBuf,
    cached: RwLock<Option<String>>,
}

impl FilePromptSource {
    /// Reads the file once up front. A missing or empty file is not an error here;
    /// the fallback prompt is served until a reload succeeds.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let source = Self {
            path: path.as_ref().to_path_buf(),
            cached: RwLock::new(None),
        };
        if let Err(e) = source.reload() {
            tracing::error!(error = %e, "Using fallback system prompt");
        }
        source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> GatewayResult<String> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read system prompt {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if content.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "system prompt {} is empty",
                self.path.display()
            )));
        }
        Ok(content)
    }
}

impl SystemPromptSource for FilePromptSource {
    fn prompt(&self) -> String {
        self.cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| FALLBACK_PROMPT.to_string())
    }

    fn reload(&self) -> GatewayResult<()> {
        let content = self.read()?;
        tracing::info!(
            path = %self.path.display(),
            characters = content.chars().count(),
            "System prompt loaded"
        );
        warn_without_language_hints(&content);

        *self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(content);
        Ok(())
    }
}

/// Whether the prompt tells the model to mirror the user's language
pub fn has_language_instructions(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    LANGUAGE_HINTS.iter().any(|hint| lower.contains(hint))
}

fn warn_without_language_hints(prompt: &str) {
    if has_language_instructions(prompt) {
        tracing::debug!("System prompt includes multi-language instructions");
    } else {
        tracing::warn!(
            "System prompt may not include multi-language instructions; consider asking the model to answer in the user's language"
        );
    }
}
