//! Streaming speech recognizer interface.
//!
//! One persistent session per pipeline run; the STT station streams each
//! utterance's PCM into it and reads interim/final results back.

use crate::error::{Result, VoiceBridgeError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Word-level timing reported by recognizers that support it.
#[derive(Debug, Clone, PartialEq)]
pub struct WordTiming {
    pub word: String,
    pub start_ms: f64,
    pub end_ms: f64,
    pub confidence: f32,
}

/// One recognition hypothesis from the service.
#[derive(Debug, Clone)]
pub struct SttResult {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
    pub words: Option<Vec<WordTiming>>,
}

impl SttResult {
    /// A final result with the given text.
    pub fn final_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            is_final: true,
            confidence: 0.95,
            words: None,
        }
    }

    /// An interim result with the given text.
    pub fn interim(text: &str) -> Self {
        Self {
            text: text.to_string(),
            is_final: false,
            confidence: 0.5,
            words: None,
        }
    }
}

/// Factory for recognizer sessions.
#[async_trait]
pub trait RecognizerClient: Send + Sync {
    /// Opens a streaming session. Authentication failures surface here as
    /// `VoiceBridgeError::Auth`.
    async fn open_session(&self) -> Result<Box<dyn RecognizerSession>>;
}

/// One open streaming connection to the recognizer.
#[async_trait]
pub trait RecognizerSession: Send {
    /// Streams raw little-endian PCM bytes for the current utterance.
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<()>;

    /// Waits for the next hypothesis. `Ok(None)` means the service closed
    /// the stream.
    async fn next_result(&mut self) -> Result<Option<SttResult>>;

    /// Idle keepalive ping.
    async fn keepalive(&mut self) -> Result<()>;

    /// Closes the session.
    async fn close(&mut self) -> Result<()>;
}

/// Scripted recognizer for tests.
///
/// Each `send_audio` consumes the next script entry (a list of results the
/// session will then deliver, after an optional simulated processing delay).
/// Re-opened sessions continue the same script, which lets tests exercise
/// reconnect-and-resend paths.
#[derive(Clone)]
pub struct MockRecognizer {
    scripts: Arc<Mutex<VecDeque<Vec<SttResult>>>>,
    delay: Duration,
    fail_opens: Arc<AtomicU32>,
    fail_sends: Arc<AtomicU32>,
    opens: Arc<AtomicU32>,
}

impl MockRecognizer {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::ZERO,
            fail_opens: Arc::new(AtomicU32::new(0)),
            fail_sends: Arc::new(AtomicU32::new(0)),
            opens: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Queues the results delivered for one utterance.
    pub fn with_utterance(self, results: Vec<SttResult>) -> Self {
        self.scripts.lock().unwrap().push_back(results);
        self
    }

    /// Convenience: queues a single final transcript for one utterance.
    pub fn with_final(self, text: &str) -> Self {
        self.with_utterance(vec![SttResult::final_text(text)])
    }

    /// Simulated processing delay before results become available.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails the next `n` session opens with a connection error.
    pub fn with_open_failures(self, n: u32) -> Self {
        self.fail_opens.store(n, Ordering::SeqCst);
        self
    }

    /// Refuses every connection attempt (outage).
    pub fn with_connection_refused(self) -> Self {
        self.fail_opens.store(u32::MAX, Ordering::SeqCst);
        self
    }

    /// Fails the next `n` audio sends with a transport error, without
    /// consuming the utterance script.
    pub fn with_send_failures(self, n: u32) -> Self {
        self.fail_sends.store(n, Ordering::SeqCst);
        self
    }

    /// Number of sessions opened so far.
    pub fn session_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Default for MockRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecognizerClient for MockRecognizer {
    async fn open_session(&self) -> Result<Box<dyn RecognizerSession>> {
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(VoiceBridgeError::Connection {
                service: "recognizer",
                message: "mock connection refused".to_string(),
            });
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRecognizerSession {
            scripts: self.scripts.clone(),
            fail_sends: self.fail_sends.clone(),
            delay: self.delay,
            pending: VecDeque::new(),
            ready_at: None,
        }))
    }
}

struct MockRecognizerSession {
    scripts: Arc<Mutex<VecDeque<Vec<SttResult>>>>,
    fail_sends: Arc<AtomicU32>,
    delay: Duration,
    pending: VecDeque<SttResult>,
    ready_at: Option<Instant>,
}

#[async_trait]
impl RecognizerSession for MockRecognizerSession {
    async fn send_audio(&mut self, _pcm: &[u8]) -> Result<()> {
        let failures = self.fail_sends.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_sends.store(failures - 1, Ordering::SeqCst);
            return Err(VoiceBridgeError::Transport {
                service: "recognizer",
                message: "mock transport break".to_string(),
            });
        }

        let results = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![SttResult::final_text("mock transcript")]);
        self.pending.extend(results);
        self.ready_at = Some(Instant::now() + self.delay);
        Ok(())
    }

    async fn next_result(&mut self) -> Result<Option<SttResult>> {
        if let Some(ready_at) = self.ready_at {
            tokio::time::sleep_until(ready_at).await;
        }
        loop {
            if let Some(result) = self.pending.pop_front() {
                return Ok(Some(result));
            }
            // Nothing pending: behave like a quiet wire. The station's
            // deadline bounds this wait.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn keepalive(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_delivers_scripted_results() {
        let recognizer = MockRecognizer::new()
            .with_utterance(vec![SttResult::interim("hola"), SttResult::final_text("hola cómo estás")]);

        let mut session = recognizer.open_session().await.unwrap();
        session.send_audio(&[0u8; 960]).await.unwrap();

        let first = session.next_result().await.unwrap().unwrap();
        assert!(!first.is_final);
        assert_eq!(first.text, "hola");

        let second = session.next_result().await.unwrap().unwrap();
        assert!(second.is_final);
        assert_eq!(second.text, "hola cómo estás");
    }

    #[tokio::test]
    async fn test_mock_falls_back_to_default_transcript() {
        let recognizer = MockRecognizer::new();
        let mut session = recognizer.open_session().await.unwrap();
        session.send_audio(&[0u8; 4]).await.unwrap();

        let result = session.next_result().await.unwrap().unwrap();
        assert_eq!(result.text, "mock transcript");
        assert!(result.is_final);
    }

    #[tokio::test]
    async fn test_mock_open_failures_then_success() {
        let recognizer = MockRecognizer::new().with_open_failures(2);

        assert!(recognizer.open_session().await.is_err());
        assert!(recognizer.open_session().await.is_err());
        assert!(recognizer.open_session().await.is_ok());
        assert_eq!(recognizer.session_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_connection_refused_never_recovers() {
        let recognizer = MockRecognizer::new().with_connection_refused();
        for _ in 0..10 {
            assert!(recognizer.open_session().await.is_err());
        }
    }

    #[tokio::test]
    async fn test_mock_send_failure_preserves_script() {
        let recognizer = MockRecognizer::new()
            .with_final("survives reconnect")
            .with_send_failures(1);

        let mut session = recognizer.open_session().await.unwrap();
        assert!(session.send_audio(&[0u8; 4]).await.is_err());

        // A fresh session replays the same utterance script
        let mut session = recognizer.open_session().await.unwrap();
        session.send_audio(&[0u8; 4]).await.unwrap();
        let result = session.next_result().await.unwrap().unwrap();
        assert_eq!(result.text, "survives reconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_delay_holds_results() {
        let recognizer = MockRecognizer::new()
            .with_final("delayed")
            .with_delay(Duration::from_millis(250));

        let mut session = recognizer.open_session().await.unwrap();
        session.send_audio(&[0u8; 4]).await.unwrap();

        let started = Instant::now();
        let result = session.next_result().await.unwrap().unwrap();
        assert_eq!(result.text, "delayed");
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
