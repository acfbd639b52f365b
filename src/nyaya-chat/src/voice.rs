//! Voice input.
//!
//! Wraps a speech recognizer as a cancellable subscription. Recognized text is
//! formatted into a running transcript that callers read and submit as a chat
//! message. Transient recognizer failures are retried with backoff, up to a
//! bounded number of attempts, and never while the device is offline.
//!
//! Each [`VoiceInput::start`] opens a new generation. Events from a superseded
//! or stopped generation are dropped.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::VoiceConfig;
use crate::error::{ChatError, Result};

/// Events from one recognition session, in delivery order.
pub type RecognitionStream = Pin<Box<dyn Stream<Item = RecognitionEvent> + Send>>;

/// A recognized piece of speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionSegment {
    pub text: String,
    /// Interim segments may still be revised by the recognizer.
    pub is_final: bool,
}

impl RecognitionSegment {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Started,
    Results { segments: Vec<RecognitionSegment> },
    Error(RecognitionErrorKind),
    Ended,
}

/// Recognizer failure kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NotAllowed,
    Network,
    ServiceNotAllowed,
    NoSpeech,
    Aborted,
    Other(String),
}

impl RecognitionErrorKind {
    /// Map a recognizer error code such as `"no-speech"`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "not-allowed" => Self::NotAllowed,
            "network" => Self::Network,
            "service-not-allowed" => Self::ServiceNotAllowed,
            "no-speech" => Self::NoSpeech,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether reconnecting may help.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, Self::Network | Self::ServiceNotAllowed | Self::Other(_))
    }

    pub fn message(&self) -> String {
        match self {
            Self::NotAllowed => "Microphone access denied. Please allow microphone access.".into(),
            Self::Network => "Network error. Please check your connection.".into(),
            Self::ServiceNotAllowed => {
                "Speech service not available. Please try again later.".into()
            }
            Self::NoSpeech => "No speech detected. Please try again.".into(),
            Self::Aborted => "Voice input was aborted.".into(),
            Self::Other(code) => format!("Speech recognition error: {code}"),
        }
    }
}

/// A speech recognizer.
#[async_trait]
pub trait SpeechSource: Send + Sync {
    /// Open a recognition session for the given language tag.
    async fn connect(&self, lang: &str) -> Result<RecognitionStream>;
}

/// Reports whether the device has network access.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity that never reports offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

const OFFLINE_AT_START: &str =
    "Network connection is offline. Please check your internet connection and try again.";
const OFFLINE_DURING_ERROR: &str =
    "Your device appears to be offline. Please check your internet connection.";
const STILL_OFFLINE: &str = "Still offline. Please check your internet connection and try again.";
const STILL_OFFLINE_ON_RETRY: &str =
    "Still offline. Please check your internet connection before retrying.";
const START_FAILED: &str = "Failed to start speech recognition";
const STOPPED_UNEXPECTEDLY: &str = "Voice recognition stopped unexpectedly. Please try again.";

/// Append-ready form of `fragment` given the transcript so far.
///
/// Capitalizes at the start or after a sentence end, and separates with a
/// space unless the fragment already starts with one or with punctuation.
pub fn format_fragment(transcript: &str, fragment: &str) -> String {
    let Some(first) = fragment.chars().next() else {
        return String::new();
    };

    let needs_space = !matches!(first, ' ' | '.' | ',' | '?' | '!');
    let capitalize = transcript.is_empty()
        || transcript.ends_with('.')
        || transcript.ends_with('?')
        || transcript.ends_with('!');

    let mut out = String::with_capacity(fragment.len() + 1);
    if !transcript.is_empty() && needs_space {
        out.push(' ');
    }
    if capitalize {
        out.extend(first.to_uppercase());
        out.push_str(&fragment[first.len_utf8()..]);
    } else {
        out.push_str(fragment);
    }
    out
}

enum Next {
    Continue,
    Reconnect(Duration),
    Stop,
}

#[derive(Default)]
struct VoiceState {
    generation: u64,
    listening: bool,
    transcript: String,
    interim: String,
    error: Option<String>,
    attempts: u32,
    token: Option<CancellationToken>,
}

impl VoiceState {
    fn flush_interim(&mut self) {
        let interim = std::mem::take(&mut self.interim);
        if !interim.trim().is_empty() {
            let formatted = format_fragment(&self.transcript, &interim);
            self.transcript.push_str(&formatted);
        }
    }

    fn on_started(&mut self) {
        self.listening = true;
        self.error = None;
        self.interim.clear();
        self.attempts = 0;
    }

    fn on_results(&mut self, segments: &[RecognitionSegment]) {
        let mut final_text = String::new();
        let mut interim = String::new();
        for segment in segments {
            if segment.is_final {
                final_text.push_str(&segment.text);
            } else {
                interim.push_str(&segment.text);
            }
        }

        if !final_text.is_empty() {
            self.interim.clear();
            let formatted = format_fragment(&self.transcript, &final_text);
            let tail = formatted.trim_start().to_lowercase();
            if self.transcript.to_lowercase().ends_with(&tail) {
                tracing::trace!("Final text already in transcript, skipping");
            } else {
                self.transcript.push_str(&formatted);
            }
        } else if !interim.is_empty() {
            self.interim = interim;
        }
    }

    fn on_error(&mut self, kind: &RecognitionErrorKind, online: bool, config: &VoiceConfig) -> Next {
        self.flush_interim();

        let mut message = kind.message();
        let mut reconnect = kind.is_reconnectable();
        if reconnect && !online {
            message = OFFLINE_DURING_ERROR.to_string();
            reconnect = false;
        }

        let max = config.max_reconnect_attempts;
        if reconnect && self.attempts < max {
            self.attempts += 1;
            self.error = Some(format!(
                "{message} Attempting to reconnect... ({}/{max})",
                self.attempts
            ));
            return Next::Reconnect(reconnect_delay(config, self.attempts));
        }

        self.error = Some(if reconnect {
            format!("{message} Reconnection failed after {max} attempts.")
        } else {
            message
        });
        self.listening = false;
        Next::Stop
    }

    fn on_ended(&mut self, online: bool) {
        self.flush_interim();
        let was_listening = self.listening;
        self.listening = false;
        if was_listening && self.error.is_none() && online {
            self.error = Some(STOPPED_UNEXPECTEDLY.to_string());
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
fn reconnect_delay(config: &VoiceConfig, attempt: u32) -> Duration {
    let factor = config.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
    Duration::from_secs_f64(config.reconnect_delay().as_secs_f64() * factor)
}

/// Handle to one started recognition generation.
#[derive(Debug)]
pub struct VoiceSubscription {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl VoiceSubscription {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop delivering events from this generation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the recognition task to end.
    pub async fn finished(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Voice recognition task failed");
        }
    }
}

/// Voice input controller. Clones share state.
#[derive(Clone)]
pub struct VoiceInput {
    config: VoiceConfig,
    connectivity: Arc<dyn Connectivity>,
    state: Arc<Mutex<VoiceState>>,
}

impl VoiceInput {
    pub fn new(config: VoiceConfig) -> Self {
        Self::with_connectivity(config, Arc::new(AlwaysOnline))
    }

    pub fn with_connectivity(config: VoiceConfig, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            config,
            connectivity,
            state: Arc::new(Mutex::new(VoiceState::default())),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().listening
    }

    pub fn transcript(&self) -> String {
        self.state.lock().transcript.clone()
    }

    pub fn interim(&self) -> String {
        self.state.lock().interim.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Start listening, superseding any earlier subscription.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&self, source: Arc<dyn SpeechSource>) -> Result<VoiceSubscription> {
        if !self.connectivity.is_online() {
            self.state.lock().error = Some(OFFLINE_AT_START.to_string());
            return Err(ChatError::Voice(OFFLINE_AT_START.to_string()));
        }

        let token = CancellationToken::new();
        let generation = {
            let mut state = self.state.lock();
            if let Some(previous) = state.token.replace(token.clone()) {
                previous.cancel();
            }
            state.generation += 1;
            state.error = None;
            state.generation
        };
        tracing::debug!(generation, lang = %self.config.lang, "Starting voice input");

        let this = self.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            this.run(source, generation, task_token).await;
        });

        Ok(VoiceSubscription {
            generation,
            token,
            handle,
        })
    }

    /// Stop listening, keeping any interim text as final.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(token) = state.token.take() {
            token.cancel();
        }
        state.attempts = 0;
        state.flush_interim();
        state.listening = false;
        tracing::debug!("Voice input stopped");
    }

    /// Clear any error and start again after a short delay.
    pub async fn retry(&self, source: Arc<dyn SpeechSource>) -> Result<VoiceSubscription> {
        if !self.connectivity.is_online() {
            self.state.lock().error = Some(STILL_OFFLINE_ON_RETRY.to_string());
            return Err(ChatError::Voice(STILL_OFFLINE_ON_RETRY.to_string()));
        }

        {
            let mut state = self.state.lock();
            state.generation += 1;
            if let Some(token) = state.token.take() {
                token.cancel();
            }
            state.error = None;
            state.attempts = 0;
            state.listening = false;
        }

        tokio::time::sleep(self.config.retry_delay()).await;
        self.start(source)
    }

    /// Forget the transcript and any error.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.transcript.clear();
        state.interim.clear();
        state.error = None;
    }

    /// Apply `f` to the state if `generation` is still current.
    fn with_current<T>(&self, generation: u64, f: impl FnOnce(&mut VoiceState) -> T) -> Option<T> {
        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::trace!(generation, current = state.generation, "Dropping stale voice event");
            return None;
        }
        Some(f(&mut state))
    }

    async fn run(&self, source: Arc<dyn SpeechSource>, generation: u64, token: CancellationToken) {
        loop {
            let connected = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                connected = source.connect(&self.config.lang) => connected,
            };
            let mut events = match connected {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "Speech recognizer failed to start");
                    self.with_current(generation, |state| {
                        state.error = Some(START_FAILED.to_string());
                        state.listening = false;
                    });
                    return;
                }
            };

            let delay = loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    event = events.next() => event,
                };
                let online = self.connectivity.is_online();

                let next = match event {
                    Some(RecognitionEvent::Started) => self.with_current(generation, |state| {
                        state.on_started();
                        Next::Continue
                    }),
                    Some(RecognitionEvent::Results { segments }) => {
                        self.with_current(generation, |state| {
                            state.on_results(&segments);
                            Next::Continue
                        })
                    }
                    Some(RecognitionEvent::Error(kind)) => {
                        tracing::debug!(error = ?kind, "Speech recognizer error");
                        self.with_current(generation, |state| {
                            state.on_error(&kind, online, &self.config)
                        })
                    }
                    Some(RecognitionEvent::Ended) | None => self.with_current(generation, |state| {
                        state.on_ended(online);
                        Next::Stop
                    }),
                };

                match next {
                    Some(Next::Continue) => continue,
                    Some(Next::Reconnect(delay)) => break delay,
                    Some(Next::Stop) | None => return,
                }
            };

            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting voice input");
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.connectivity.is_online() {
                self.with_current(generation, |state| {
                    state.error = Some(STILL_OFFLINE.to_string());
                    state.listening = false;
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Replays one scripted event list per connect call.
    struct ScriptedSource {
        sessions: Mutex<VecDeque<Vec<RecognitionEvent>>>,
        connects: AtomicUsize,
        hang_after: bool,
    }

    impl ScriptedSource {
        fn new(sessions: Vec<Vec<RecognitionEvent>>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                connects: AtomicUsize::new(0),
                hang_after: false,
            })
        }

        fn hanging(sessions: Vec<Vec<RecognitionEvent>>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                connects: AtomicUsize::new(0),
                hang_after: true,
            })
        }
    }

    #[async_trait]
    impl SpeechSource for ScriptedSource {
        async fn connect(&self, _lang: &str) -> Result<RecognitionStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let events = self.sessions.lock().pop_front().unwrap_or_default();
            let stream = futures::stream::iter(events);
            if self.hang_after {
                Ok(Box::pin(stream.chain(futures::stream::pending())))
            } else {
                Ok(Box::pin(stream))
            }
        }
    }

    struct Switch(AtomicBool);

    impl Connectivity for Switch {
        fn is_online(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn results(segments: Vec<RecognitionSegment>) -> RecognitionEvent {
        RecognitionEvent::Results { segments }
    }

    #[test]
    fn test_format_fragment() {
        assert_eq!(format_fragment("", "hello"), "Hello");
        assert_eq!(format_fragment("Hello", "world"), " world");
        assert_eq!(format_fragment("Hello.", "next one"), " Next one");
        assert_eq!(format_fragment("Hello", ", friend"), ", friend");
        assert_eq!(format_fragment("Is it?", " yes"), " yes");
        assert_eq!(format_fragment("anything", ""), "");
        assert_eq!(format_fragment("", "ñandú"), "Ñandú");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(RecognitionErrorKind::from_code("network"), RecognitionErrorKind::Network);
        assert!(RecognitionErrorKind::from_code("weird").is_reconnectable());
        assert!(!RecognitionErrorKind::NotAllowed.is_reconnectable());
        assert!(!RecognitionErrorKind::NoSpeech.is_reconnectable());
        assert_eq!(
            RecognitionErrorKind::Other("bad-grammar".into()).message(),
            "Speech recognition error: bad-grammar"
        );
    }

    #[test]
    fn test_results_final_and_interim() {
        let mut state = VoiceState::default();
        state.on_results(&[RecognitionSegment::interim("what is")]);
        assert_eq!(state.interim, "what is");
        assert!(state.transcript.is_empty());

        state.on_results(&[RecognitionSegment::final_text("what is bail")]);
        assert_eq!(state.transcript, "What is bail");
        assert!(state.interim.is_empty());

        // Duplicate final delivery is not appended twice.
        state.on_results(&[RecognitionSegment::final_text("what is bail")]);
        assert_eq!(state.transcript, "What is bail");
    }

    #[test]
    fn test_reconnect_delay_backoff() {
        let mut config = VoiceConfig::default();
        assert_eq!(reconnect_delay(&config, 1), Duration::from_millis(1500));
        assert_eq!(reconnect_delay(&config, 3), Duration::from_millis(1500));
        config.backoff_multiplier = 2.0;
        assert_eq!(reconnect_delay(&config, 3), Duration::from_millis(6000));
    }

    #[test]
    fn test_error_offline_does_not_reconnect() {
        let mut state = VoiceState {
            listening: true,
            ..VoiceState::default()
        };
        let next = state.on_error(&RecognitionErrorKind::Network, false, &VoiceConfig::default());
        assert!(matches!(next, Next::Stop));
        assert_eq!(state.error.as_deref(), Some(OFFLINE_DURING_ERROR));
        assert!(!state.listening);
    }

    #[test]
    fn test_error_flushes_interim() {
        let mut state = VoiceState {
            interim: "file an appeal".into(),
            ..VoiceState::default()
        };
        state.on_error(&RecognitionErrorKind::NoSpeech, true, &VoiceConfig::default());
        assert_eq!(state.transcript, "File an appeal");
        assert!(state.interim.is_empty());
    }

    #[tokio::test]
    async fn test_start_collects_transcript() {
        let source = ScriptedSource::new(vec![vec![
            RecognitionEvent::Started,
            results(vec![RecognitionSegment::interim("my landlord")]),
            results(vec![RecognitionSegment::final_text("my landlord kept my deposit.")]),
            results(vec![RecognitionSegment::final_text("what can I do")]),
        ]]);
        let voice = VoiceInput::new(VoiceConfig::default());

        let subscription = voice.start(source).unwrap();
        subscription.finished().await;

        assert_eq!(voice.transcript(), "My landlord kept my deposit. What can I do");
        assert!(!voice.is_listening());
        // Stream closed without an explicit stop.
        assert_eq!(voice.error().as_deref(), Some(STOPPED_UNEXPECTEDLY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_reconnects_then_gives_up() {
        let source = ScriptedSource::new(vec![
            vec![RecognitionEvent::Error(RecognitionErrorKind::Network)];
            5
        ]);
        let voice = VoiceInput::new(VoiceConfig::default());

        let subscription = voice.start(source.clone()).unwrap();
        subscription.finished().await;

        // One initial connect plus three reconnects.
        assert_eq!(source.connects.load(Ordering::SeqCst), 4);
        assert_eq!(
            voice.error().as_deref(),
            Some("Network error. Please check your connection. Reconnection failed after 3 attempts.")
        );
        assert!(!voice.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_start_resets_attempts() {
        let source = ScriptedSource::new(vec![
            vec![RecognitionEvent::Error(RecognitionErrorKind::Network)],
            vec![RecognitionEvent::Error(RecognitionErrorKind::Network)],
            vec![RecognitionEvent::Started, RecognitionEvent::Error(RecognitionErrorKind::Network)],
            vec![RecognitionEvent::Error(RecognitionErrorKind::Network)],
            vec![RecognitionEvent::Error(RecognitionErrorKind::NotAllowed)],
        ]);
        let voice = VoiceInput::new(VoiceConfig::default());

        voice.start(source.clone()).unwrap().finished().await;

        assert_eq!(source.connects.load(Ordering::SeqCst), 5);
        assert_eq!(
            voice.error().as_deref(),
            Some("Microphone access denied. Please allow microphone access.")
        );
    }

    #[tokio::test]
    async fn test_start_offline_fails() {
        let connectivity = Arc::new(Switch(AtomicBool::new(false)));
        let voice = VoiceInput::with_connectivity(VoiceConfig::default(), connectivity);
        let source = ScriptedSource::new(vec![]);

        let err = voice.start(source.clone()).unwrap_err();
        assert!(matches!(err, ChatError::Voice(_)));
        assert_eq!(voice.error().as_deref(), Some(OFFLINE_AT_START));
        assert_eq!(source.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_flushes_interim_and_drops_later_events() {
        let source = ScriptedSource::hanging(vec![vec![
            RecognitionEvent::Started,
            results(vec![RecognitionSegment::interim("section four")]),
        ]]);
        let voice = VoiceInput::new(VoiceConfig::default());
        let subscription = voice.start(source).unwrap();

        while voice.interim().is_empty() {
            tokio::task::yield_now().await;
        }
        voice.stop();

        assert_eq!(voice.transcript(), "Section four");
        assert!(voice.interim().is_empty());
        assert!(!voice.is_listening());
        subscription.finished().await;
        assert_eq!(voice.error(), None);
    }

    #[tokio::test]
    async fn test_new_start_supersedes_old() {
        let first = ScriptedSource::hanging(vec![vec![RecognitionEvent::Started]]);
        let voice = VoiceInput::new(VoiceConfig::default());
        let old = voice.start(first).unwrap();

        let second = ScriptedSource::hanging(vec![vec![
            RecognitionEvent::Started,
            results(vec![RecognitionSegment::final_text("second")]),
        ]]);
        let new = voice.start(second).unwrap();
        assert!(new.generation() > old.generation());

        old.finished().await;
        while voice.transcript().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(voice.transcript(), "Second");
        new.cancel();
        new.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_offline_and_online() {
        let connectivity = Arc::new(Switch(AtomicBool::new(false)));
        let voice = VoiceInput::with_connectivity(VoiceConfig::default(), connectivity.clone());
        let source = ScriptedSource::new(vec![vec![
            RecognitionEvent::Started,
            results(vec![RecognitionSegment::final_text("hello")]),
        ]]);

        assert!(voice.retry(source.clone()).await.is_err());
        assert_eq!(voice.error().as_deref(), Some(STILL_OFFLINE_ON_RETRY));

        connectivity.0.store(true, Ordering::SeqCst);
        voice.retry(source).await.unwrap().finished().await;
        assert_eq!(voice.transcript(), "Hello");
    }

    #[test]
    fn test_reset() {
        let voice = VoiceInput::new(VoiceConfig::default());
        {
            let mut state = voice.state.lock();
            state.transcript = "text".into();
            state.interim = "more".into();
            state.error = Some("oops".into());
        }
        voice.reset();
        assert!(voice.transcript().is_empty());
        assert!(voice.interim().is_empty());
        assert_eq!(voice.error(), None);
    }
}
