//! Streaming translation interface.
//!
//! One streaming request per transcript; the translator station forwards
//! growing prefixes downstream as tokens arrive.

use crate::error::{Result, VoiceBridgeError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Factory for streaming translation requests.
#[async_trait]
pub trait TranslatorClient: Send + Sync {
    /// Starts one streaming translation of `text`.
    async fn translate_stream(&self, text: &str) -> Result<Box<dyn TokenStream>>;
}

/// A live token stream for one translation request.
#[async_trait]
pub trait TokenStream: Send {
    /// Next text delta. `Ok(None)` marks end of stream.
    async fn next_token(&mut self) -> Result<Option<String>>;
}

/// Scripted translator for tests.
///
/// Looks up a translation by source text (falling back to a default),
/// streams it word by word with an optional delay per token, and can fail
/// the first N requests.
#[derive(Clone)]
pub struct MockTranslator {
    translations: Arc<Mutex<Vec<(String, String)>>>,
    default_translation: String,
    token_delay: Duration,
    first_token_delay: Duration,
    fail_requests: Arc<AtomicU32>,
    requests: Arc<AtomicU32>,
}

impl MockTranslator {
    pub fn new() -> Self {
        Self {
            translations: Arc::new(Mutex::new(Vec::new())),
            default_translation: "mock translation".to_string(),
            token_delay: Duration::ZERO,
            first_token_delay: Duration::ZERO,
            fail_requests: Arc::new(AtomicU32::new(0)),
            requests: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Registers a translation for an exact source text.
    pub fn with_translation(self, source: &str, translated: &str) -> Self {
        self.translations
            .lock()
            .unwrap()
            .push((source.to_string(), translated.to_string()));
        self
    }

    /// Sets the fallback translation for unregistered source text.
    pub fn with_default(mut self, translated: &str) -> Self {
        self.default_translation = translated.to_string();
        self
    }

    /// Delay before each token after the first.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Delay before the first token (simulated model latency).
    pub fn with_first_token_delay(mut self, delay: Duration) -> Self {
        self.first_token_delay = delay;
        self
    }

    /// Fails the next `n` requests with a transport error.
    pub fn with_request_failures(self, n: u32) -> Self {
        self.fail_requests.store(n, Ordering::SeqCst);
        self
    }

    /// Number of streaming requests issued so far.
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Default for MockTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranslatorClient for MockTranslator {
    async fn translate_stream(&self, text: &str) -> Result<Box<dyn TokenStream>> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let failures = self.fail_requests.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_requests.store(failures - 1, Ordering::SeqCst);
            return Err(VoiceBridgeError::Transport {
                service: "translator",
                message: "mock request failure".to_string(),
            });
        }

        let translated = self
            .translations
            .lock()
            .unwrap()
            .iter()
            .find(|(source, _)| source == text)
            .map(|(_, translated)| translated.clone())
            .unwrap_or_else(|| self.default_translation.clone());

        // Words become tokens, keeping the trailing space so concatenation
        // reconstructs the exact text.
        let mut tokens: VecDeque<String> = VecDeque::new();
        let words: Vec<&str> = translated.split(' ').collect();
        for (i, word) in words.iter().enumerate() {
            if i + 1 < words.len() {
                tokens.push_back(format!("{word} "));
            } else {
                tokens.push_back((*word).to_string());
            }
        }

        Ok(Box::new(MockTokenStream {
            tokens,
            token_delay: self.token_delay,
            // Absolute deadline so a caller polling with short timeouts
            // still observes the full first-token latency
            first_ready: tokio::time::Instant::now() + self.first_token_delay,
            first_delivered: false,
        }))
    }
}

struct MockTokenStream {
    tokens: VecDeque<String>,
    token_delay: Duration,
    first_ready: tokio::time::Instant,
    first_delivered: bool,
}

#[async_trait]
impl TokenStream for MockTokenStream {
    async fn next_token(&mut self) -> Result<Option<String>> {
        if self.tokens.is_empty() {
            return Ok(None);
        }
        if !self.first_delivered {
            tokio::time::sleep_until(self.first_ready).await;
            self.first_delivered = true;
        } else {
            tokio::time::sleep(self.token_delay).await;
        }
        Ok(self.tokens.pop_front())
    }
}
