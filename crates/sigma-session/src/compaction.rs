//! History compaction over a wrapped session
//!
//! When a session's history grows, this module asks the model to compact
//! it: the raw items are replaced by a condensed equivalent (typically a
//! compaction marker plus summary items) while tool-call linkage and
//! response chaining keep working. The wrapped session stays the source
//! of truth; the caches here are advisory and rebuilt whenever they are
//! found unset.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use sigma_wire::codec;
use sigma_wire::openai::{CompactionRequest, CompactionResponse, OpenAIClient};
use sigma_wire::{ConversationItem, Role, TokenUsage};

use crate::error::{Error, Result};
use crate::session::{Session, SessionKind};

/// Candidate count at which the default decision compacts
pub const DEFAULT_TRIGGER_ITEMS: usize = 10;

/// The compaction call a session core needs from the model API
#[async_trait]
pub trait CompactionBackend: Send + Sync {
    /// Ask the model to compact a conversation into summary items
    async fn compact(&self, request: &CompactionRequest) -> Result<CompactionResponse>;
}

#[async_trait]
impl CompactionBackend for OpenAIClient {
    async fn compact(&self, request: &CompactionRequest) -> Result<CompactionResponse> {
        Ok(OpenAIClient::compact(self, request).await?)
    }
}

// --- Mode resolution ---

/// How a compaction request describes the history to compact
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionMode {
    /// Pick per run based on what the last turn looked like
    Auto,
    /// Send the full session history inline
    Input,
    /// Reference the last turn's server-side response state
    PreviousResponseId,
}

/// A mode after resolution; `Auto` never survives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMode {
    Input,
    PreviousResponseId,
}

/// Resolve the mode for one compaction run.
///
/// A non-auto request passes through unchanged. Auto prefers chaining on
/// the last response, but falls back to inline input when the last turn
/// was explicitly not stored server-side or no response id is known yet.
pub fn resolve_compaction_mode(
    requested: CompactionMode,
    response_id: Option<&str>,
    store: Option<bool>,
) -> ResolvedMode {
    match requested {
        CompactionMode::Input => ResolvedMode::Input,
        CompactionMode::PreviousResponseId => ResolvedMode::PreviousResponseId,
        CompactionMode::Auto => {
            if store == Some(false) || response_id.is_none() {
                ResolvedMode::Input
            } else {
                ResolvedMode::PreviousResponseId
            }
        }
    }
}

// --- Model gate ---

const CHAT_MODEL_PREFIXES: &[&str] = &["gpt-", "chatgpt-"];

static REASONING_MODEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^o[0-9][a-z0-9-]*$").unwrap());

/// Check whether a model name can serve compaction requests.
///
/// Accepts chat models by prefix and o-series reasoning models, after
/// trimming and stripping an `ft:` fine-tune wrapper; the root segment
/// before any `:`-separated suffix is what gets judged.
pub fn is_compaction_model(model: &str) -> bool {
    let trimmed = model.trim();
    let without_ft = trimmed.strip_prefix("ft:").unwrap_or(trimmed);
    let root = without_ft.split(':').next().unwrap_or("");
    if root.is_empty() {
        return false;
    }
    CHAT_MODEL_PREFIXES.iter().any(|p| root.starts_with(p))
        || REASONING_MODEL_PATTERN.is_match(root)
}

// --- Candidate selection ---

/// Check whether one item is eligible for compaction.
///
/// User messages are kept verbatim and compaction markers are already
/// compacted; everything else qualifies, unknown items included.
pub fn is_compaction_candidate(item: &ConversationItem) -> bool {
    match item {
        ConversationItem::Compaction(_) => false,
        ConversationItem::Message(m) => m.role != Role::User,
        _ => true,
    }
}

/// Select the compactable subsequence of a history, order preserved
pub fn select_compaction_candidates(items: &[ConversationItem]) -> Vec<ConversationItem> {
    items
        .iter()
        .filter(|item| is_compaction_candidate(item))
        .cloned()
        .collect()
}

// --- Session core ---

/// Configuration for a compaction session
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Model used for compaction requests
    pub model: String,
    /// Default mode when a run does not override it
    pub mode: CompactionMode,
    /// Candidate count at which the default decision compacts
    pub trigger_items: usize,
}

impl CompactionConfig {
    /// Create a config with default mode and trigger
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            mode: CompactionMode::Auto,
            trigger_items: DEFAULT_TRIGGER_ITEMS,
        }
    }

    /// Override the default mode
    pub fn with_mode(mut self, mode: CompactionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the default trigger count
    pub fn with_trigger_items(mut self, trigger_items: usize) -> Self {
        self.trigger_items = trigger_items;
        self
    }
}

/// Per-run arguments for [`CompactionSession::run_compaction`]
#[derive(Debug, Clone, Default)]
pub struct CompactionArgs {
    /// Response id of the turn that just completed
    pub response_id: Option<String>,
    /// Whether that turn's response was stored server-side
    pub store: Option<bool>,
    /// Override the configured mode for this run
    pub mode: Option<CompactionMode>,
    /// Compact regardless of what the decision says
    pub force: bool,
}

/// What the decision hook sees when asked whether to compact
pub struct CompactionCheck<'a> {
    pub response_id: Option<&'a str>,
    pub mode: ResolvedMode,
    pub candidate_items: &'a [ConversationItem],
    pub session_items: &'a [ConversationItem],
}

/// Custom decision replacing the default candidate-count trigger
pub type ShouldCompactFn = dyn Fn(&CompactionCheck<'_>) -> bool + Send + Sync;

#[derive(Default)]
struct SessionState {
    response_id: Option<String>,
    last_store: Option<bool>,
    // None means "not yet primed"; an empty Vec is a real, known-empty
    // history. Both caches are set and unset together.
    session_items: Option<Vec<ConversationItem>>,
    candidate_items: Option<Vec<ConversationItem>>,
}

/// A session decorator that compacts the wrapped session's history.
///
/// The delegate must be client-managed: compaction replaces history
/// wholesale, which cannot be reconciled with a log the conversation
/// service writes to on its own, so [`SessionKind::ConversationLog`]
/// delegates are rejected at construction.
pub struct CompactionSession {
    delegate: Arc<dyn Session>,
    backend: Arc<dyn CompactionBackend>,
    config: CompactionConfig,
    should_compact: Option<Arc<ShouldCompactFn>>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for CompactionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CompactionSession {
    /// Wrap a session. Fails immediately on an unsupported delegate kind
    /// or a model name that cannot serve compaction.
    pub fn new(
        delegate: Arc<dyn Session>,
        backend: Arc<dyn CompactionBackend>,
        config: CompactionConfig,
    ) -> Result<Self> {
        if delegate.kind() == SessionKind::ConversationLog {
            return Err(Error::UnsupportedDelegate(delegate.kind()));
        }
        if !is_compaction_model(&config.model) {
            return Err(Error::UnsupportedModel(config.model));
        }
        Ok(Self {
            delegate,
            backend,
            config,
            should_compact: None,
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Replace the default candidate-count decision with a custom hook
    pub fn with_should_compact(mut self, hook: Arc<ShouldCompactFn>) -> Self {
        self.should_compact = Some(hook);
        self
    }

    /// The response id recorded by the most recent run
    pub fn response_id(&self) -> Option<String> {
        self.state.lock().response_id.clone()
    }

    /// Prime the caches from the delegate if needed and return the
    /// current compaction candidates (a copy; mutating it changes nothing).
    pub async fn compaction_candidates(&self) -> Result<Vec<ConversationItem>> {
        let (_, candidates) = self.primed().await?;
        Ok(candidates)
    }

    /// Run one compaction pass.
    ///
    /// Records the turn state from `args`, resolves the mode, and asks the
    /// decision whether to proceed; a declined run returns `Ok(None)` with
    /// no side effects beyond recording the turn state. On success the
    /// delegate log is cleared and re-seeded with exactly the compaction
    /// output, both caches are replaced wholesale, and the model's token
    /// usage is returned. A failure before that commit point leaves the
    /// delegate and the caches untouched.
    pub async fn run_compaction(&self, args: CompactionArgs) -> Result<Option<TokenUsage>> {
        let (resolved, response_id) = {
            let mut state = self.state.lock();
            if let Some(response_id) = args.response_id {
                state.response_id = Some(response_id);
            }
            if let Some(store) = args.store {
                state.last_store = Some(store);
            }
            let requested = args.mode.unwrap_or(self.config.mode);
            let resolved = resolve_compaction_mode(
                requested,
                state.response_id.as_deref(),
                state.last_store,
            );
            (resolved, state.response_id.clone())
        };

        // Cannot chain on a response that was never recorded; fail before
        // touching the network or the caches.
        if resolved == ResolvedMode::PreviousResponseId && response_id.is_none() {
            return Err(Error::MissingResponseId);
        }

        let (session_items, candidate_items) = self.primed().await?;

        if !args.force {
            let check = CompactionCheck {
                response_id: response_id.as_deref(),
                mode: resolved,
                candidate_items: &candidate_items,
                session_items: &session_items,
            };
            let proceed = match &self.should_compact {
                Some(hook) => hook(&check),
                None => candidate_items.len() >= self.config.trigger_items,
            };
            if !proceed {
                return Ok(None);
            }
        }

        let request = CompactionRequest {
            model: self.config.model.clone(),
            previous_response_id: match resolved {
                ResolvedMode::PreviousResponseId => response_id,
                ResolvedMode::Input => None,
            },
            input: match resolved {
                ResolvedMode::Input => Some(codec::to_wire_input(&session_items)?),
                ResolvedMode::PreviousResponseId => None,
            },
        };

        let response = self.backend.compact(&request).await?;
        let output_items = codec::to_conversation_items(response.output);

        // Commit point: replace the delegate log, then the caches.
        self.delegate.clear().await?;
        if !output_items.is_empty() {
            self.delegate.add_items(output_items.clone()).await?;
        }

        let candidates = select_compaction_candidates(&output_items);
        {
            let mut state = self.state.lock();
            state.session_items = Some(output_items);
            state.candidate_items = Some(candidates);
        }

        tracing::debug!(
            "Compacted session history: {} tokens in, {} out",
            response.usage.input_tokens,
            response.usage.output_tokens
        );
        Ok(Some(response.usage))
    }

    async fn primed(&self) -> Result<(Vec<ConversationItem>, Vec<ConversationItem>)> {
        {
            let state = self.state.lock();
            if let (Some(items), Some(candidates)) =
                (&state.session_items, &state.candidate_items)
            {
                return Ok((items.clone(), candidates.clone()));
            }
        }

        let items = self.delegate.items(None).await?;
        let candidates = select_compaction_candidates(&items);
        let mut state = self.state.lock();
        state.session_items = Some(items.clone());
        state.candidate_items = Some(candidates.clone());
        Ok((items, candidates))
    }
}

#[async_trait]
impl Session for CompactionSession {
    fn kind(&self) -> SessionKind {
        SessionKind::Compaction
    }

    async fn session_id(&self) -> Result<String> {
        self.delegate.session_id().await
    }

    async fn items(&self, limit: Option<usize>) -> Result<Vec<ConversationItem>> {
        self.delegate.items(limit).await
    }

    async fn add_items(&self, items: Vec<ConversationItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let new_candidates = select_compaction_candidates(&items);
        self.delegate.add_items(items.clone()).await?;

        // Extend primed caches in place instead of reloading the log.
        let mut state = self.state.lock();
        if state.session_items.is_some() && state.candidate_items.is_some() {
            if let Some(session_items) = state.session_items.as_mut() {
                session_items.extend(items);
            }
            if let Some(candidate_items) = state.candidate_items.as_mut() {
                candidate_items.extend(new_candidates);
            }
        }
        Ok(())
    }

    async fn pop_item(&self) -> Result<Option<ConversationItem>> {
        let Some(popped) = self.delegate.pop_item().await? else {
            return Ok(None);
        };

        // Drop the popped item from the history cache; if the cached value
        // does not match what the delegate returned, reload instead of
        // guessing which entry to evict.
        let reload_items = {
            let mut state = self.state.lock();
            match state.session_items.as_mut() {
                None => false,
                Some(items) => match items.iter().rposition(|item| item == &popped) {
                    Some(index) => {
                        items.remove(index);
                        false
                    }
                    None => true,
                },
            }
        };
        if reload_items {
            let fresh = self.delegate.items(None).await?;
            self.state.lock().session_items = Some(fresh);
        }

        // Same treatment for the candidate cache, but only when the popped
        // item was a candidate at all.
        let recompute_candidates = {
            let mut state = self.state.lock();
            match state.candidate_items.as_mut() {
                None => false,
                Some(candidates) if is_compaction_candidate(&popped) => {
                    match candidates.iter().rposition(|item| item == &popped) {
                        Some(index) => {
                            candidates.remove(index);
                            false
                        }
                        None => true,
                    }
                }
                Some(_) => false,
            }
        };
        if recompute_candidates {
            let fresh = self.delegate.items(None).await?;
            let candidates = select_compaction_candidates(&fresh);
            self.state.lock().candidate_items = Some(candidates);
        }

        Ok(Some(popped))
    }

    async fn clear(&self) -> Result<()> {
        self.delegate.clear().await?;
        let mut state = self.state.lock();
        // Known-empty, not unset: the next read must not hit the delegate.
        state.session_items = Some(Vec::new());
        state.candidate_items = Some(Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySession;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // --- Mock backend ---

    #[derive(Default)]
    struct MockBackend {
        output: Mutex<Vec<Value>>,
        usage: Mutex<TokenUsage>,
        fail: Mutex<bool>,
        requests: Mutex<Vec<CompactionRequest>>,
    }

    impl MockBackend {
        fn new() -> Arc<Self> {
            let backend = Self::default();
            *backend.output.lock() = summary_output();
            *backend.usage.lock() = TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
                total_tokens: 120,
            };
            Arc::new(backend)
        }

        fn calls(&self) -> usize {
            self.requests.lock().len()
        }

        fn last_request(&self) -> CompactionRequest {
            self.requests.lock().last().cloned().expect("no request")
        }
    }

    #[async_trait]
    impl CompactionBackend for MockBackend {
        async fn compact(&self, request: &CompactionRequest) -> Result<CompactionResponse> {
            self.requests.lock().push(request.clone());
            if *self.fail.lock() {
                return Err(sigma_wire::Error::api(500, "backend exploded").into());
            }
            Ok(CompactionResponse {
                id: Some("resp_compact".into()),
                output: self.output.lock().clone(),
                usage: self.usage.lock().clone(),
            })
        }
    }

    fn summary_output() -> Vec<Value> {
        vec![
            json!({"type": "compaction", "encrypted_content": "zip"}),
            json!({
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": "summary"}]
            }),
        ]
    }

    // --- Counting delegate ---

    struct CountingSession {
        inner: InMemorySession,
        reads: AtomicUsize,
    }

    impl CountingSession {
        fn with_items(items: Vec<ConversationItem>) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemorySession::with_items(items),
                reads: AtomicUsize::new(0),
            })
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Session for CountingSession {
        fn kind(&self) -> SessionKind {
            SessionKind::Basic
        }

        async fn session_id(&self) -> Result<String> {
            self.inner.session_id().await
        }

        async fn items(&self, limit: Option<usize>) -> Result<Vec<ConversationItem>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.items(limit).await
        }

        async fn add_items(&self, items: Vec<ConversationItem>) -> Result<()> {
            self.inner.add_items(items).await
        }

        async fn pop_item(&self) -> Result<Option<ConversationItem>> {
            self.inner.pop_item().await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    struct RemoteLogStub;

    #[async_trait]
    impl Session for RemoteLogStub {
        fn kind(&self) -> SessionKind {
            SessionKind::ConversationLog
        }

        async fn session_id(&self) -> Result<String> {
            Ok("conv_stub".into())
        }

        async fn items(&self, _limit: Option<usize>) -> Result<Vec<ConversationItem>> {
            Ok(Vec::new())
        }

        async fn add_items(&self, _items: Vec<ConversationItem>) -> Result<()> {
            Ok(())
        }

        async fn pop_item(&self) -> Result<Option<ConversationItem>> {
            Ok(None)
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    fn assistant_items(n: usize) -> Vec<ConversationItem> {
        (0..n)
            .map(|i| ConversationItem::assistant(format!("reply {i}")))
            .collect()
    }

    fn make_session(
        delegate: Arc<dyn Session>,
        backend: Arc<MockBackend>,
    ) -> CompactionSession {
        CompactionSession::new(delegate, backend, CompactionConfig::new("gpt-4o")).unwrap()
    }

    // --- Mode resolution ---

    #[test]
    fn test_mode_resolution_table() {
        use CompactionMode::*;

        // Non-auto passes through, whatever the turn state looks like.
        assert_eq!(
            resolve_compaction_mode(Input, Some("r"), Some(true)),
            ResolvedMode::Input
        );
        assert_eq!(
            resolve_compaction_mode(PreviousResponseId, None, None),
            ResolvedMode::PreviousResponseId
        );

        // Auto: explicit store == false forces input, response id or not.
        assert_eq!(
            resolve_compaction_mode(Auto, Some("r"), Some(false)),
            ResolvedMode::Input
        );
        assert_eq!(
            resolve_compaction_mode(Auto, None, Some(false)),
            ResolvedMode::Input
        );

        // Auto: no response id yet falls back to input.
        assert_eq!(resolve_compaction_mode(Auto, None, None), ResolvedMode::Input);
        assert_eq!(
            resolve_compaction_mode(Auto, None, Some(true)),
            ResolvedMode::Input
        );

        // Auto: response id known and store not disabled chains on it.
        assert_eq!(
            resolve_compaction_mode(Auto, Some("r"), None),
            ResolvedMode::PreviousResponseId
        );
        assert_eq!(
            resolve_compaction_mode(Auto, Some("r"), Some(true)),
            ResolvedMode::PreviousResponseId
        );
    }

    // --- Model gate ---

    #[test]
    fn test_model_gate_accepts_chat_and_reasoning_models() {
        assert!(is_compaction_model("gpt-4o"));
        assert!(is_compaction_model("gpt-4.1"));
        assert!(is_compaction_model("chatgpt-4o-latest"));
        assert!(is_compaction_model("o1-preview"));
        assert!(is_compaction_model("o3"));
        assert!(is_compaction_model("  gpt-4o  "));
        assert!(is_compaction_model("ft:gpt-4o-mini:org:project:suffix"));
        assert!(is_compaction_model("gpt-4o:beta"));
    }

    #[test]
    fn test_model_gate_rejects_everything_else() {
        assert!(!is_compaction_model("claude-3"));
        assert!(!is_compaction_model(""));
        assert!(!is_compaction_model("   "));
        assert!(!is_compaction_model("ft:"));
        assert!(!is_compaction_model("gpt"));
        assert!(!is_compaction_model("oops-1"));
        assert!(!is_compaction_model("davinci"));
    }

    // --- Candidate selection ---

    #[test]
    fn test_candidate_selection_skips_user_and_markers() {
        let items = vec![
            ConversationItem::user("question"),
            ConversationItem::assistant("answer"),
            ConversationItem::system("rules"),
            ConversationItem::function_call("c1", "f", "{}"),
            ConversationItem::function_call_output("c1", "out"),
            ConversationItem::compaction_marker(),
            ConversationItem::Unknown(json!({"type": "mystery"})),
        ];
        let candidates = select_compaction_candidates(&items);
        assert_eq!(candidates.len(), 5);
        assert_eq!(candidates[0], items[1]);
        assert_eq!(candidates[4], items[6]);
        assert!(candidates.iter().all(is_compaction_candidate));
    }

    // --- Construction ---

    #[tokio::test]
    async fn test_rejects_conversation_log_delegate() {
        let err = CompactionSession::new(
            Arc::new(RemoteLogStub),
            MockBackend::new(),
            CompactionConfig::new("gpt-4o"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedDelegate(SessionKind::ConversationLog)
        ));
        assert!(err.is_usage_error());
    }

    #[tokio::test]
    async fn test_rejects_unsupported_model() {
        let err = CompactionSession::new(
            Arc::new(InMemorySession::new()),
            MockBackend::new(),
            CompactionConfig::new("claude-3"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedModel(_)));
    }

    #[tokio::test]
    async fn test_wrapping_another_compaction_session_is_allowed() {
        let inner = make_session(Arc::new(InMemorySession::new()), MockBackend::new());
        let outer = CompactionSession::new(
            Arc::new(inner),
            MockBackend::new(),
            CompactionConfig::new("gpt-4o"),
        );
        assert!(outer.is_ok());
    }

    // --- Decision and end-to-end flow ---

    #[tokio::test]
    async fn test_below_trigger_is_a_noop() {
        let delegate = CountingSession::with_items(assistant_items(9));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        let usage = session.run_compaction(CompactionArgs::default()).await.unwrap();
        assert!(usage.is_none());
        assert_eq!(backend.calls(), 0);
        assert_eq!(session.items(None).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_tenth_candidate_triggers_compaction() {
        let delegate = CountingSession::with_items(assistant_items(9));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        // Two user turns never count toward the trigger.
        session
            .add_items(vec![
                ConversationItem::user("q1"),
                ConversationItem::user("q2"),
            ])
            .await
            .unwrap();
        assert!(session
            .run_compaction(CompactionArgs::default())
            .await
            .unwrap()
            .is_none());

        session
            .add_items(vec![ConversationItem::assistant("reply 9")])
            .await
            .unwrap();
        let usage = session
            .run_compaction(CompactionArgs::default())
            .await
            .unwrap()
            .expect("tenth candidate must compact");

        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.total_tokens, 120);
        assert_eq!(backend.calls(), 1);

        // No response id was ever recorded, so auto resolved to input and
        // carried the full history, user turns included.
        let request = backend.last_request();
        assert!(request.previous_response_id.is_none());
        assert_eq!(request.input.as_ref().unwrap().len(), 12);

        // The delegate log was replaced by exactly the compaction output.
        let items = session.items(None).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], ConversationItem::Compaction(_)));
        assert_eq!(items[1].text().as_deref(), Some("summary"));

        // The candidate cache was replaced too: the marker is excluded.
        let candidates = session.compaction_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_force_compacts_below_trigger() {
        let delegate = CountingSession::with_items(assistant_items(2));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        let usage = session
            .run_compaction(CompactionArgs {
                force: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(usage.is_some());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_custom_hook_replaces_default_decision() {
        let delegate = CountingSession::with_items(assistant_items(2));
        let backend = MockBackend::new();
        let seen: Arc<Mutex<Option<(usize, usize)>>> = Arc::new(Mutex::new(None));
        let seen_in_hook = seen.clone();
        let session = make_session(delegate.clone(), backend.clone()).with_should_compact(
            Arc::new(move |check: &CompactionCheck<'_>| {
                *seen_in_hook.lock() =
                    Some((check.session_items.len(), check.candidate_items.len()));
                check.candidate_items.len() >= 3
            }),
        );

        assert!(session
            .run_compaction(CompactionArgs::default())
            .await
            .unwrap()
            .is_none());
        assert_eq!(*seen.lock(), Some((2, 2)));

        session
            .add_items(vec![ConversationItem::assistant("third")])
            .await
            .unwrap();
        assert!(session
            .run_compaction(CompactionArgs::default())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_previous_response_id_without_id_fails_before_any_io() {
        let delegate = CountingSession::with_items(assistant_items(12));
        let backend = MockBackend::new();
        let session = CompactionSession::new(
            delegate.clone(),
            backend.clone(),
            CompactionConfig::new("gpt-4o").with_mode(CompactionMode::PreviousResponseId),
        )
        .unwrap();

        let err = session
            .run_compaction(CompactionArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingResponseId));
        assert_eq!(backend.calls(), 0);
        assert_eq!(delegate.reads(), 0);
    }

    #[tokio::test]
    async fn test_previous_response_id_request_carries_only_the_id() {
        let delegate = CountingSession::with_items(assistant_items(12));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        let usage = session
            .run_compaction(CompactionArgs {
                response_id: Some("resp_7".into()),
                store: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(usage.is_some());

        let request = backend.last_request();
        assert_eq!(request.previous_response_id.as_deref(), Some("resp_7"));
        assert!(request.input.is_none());
    }

    #[tokio::test]
    async fn test_args_mode_overrides_config() {
        let delegate = CountingSession::with_items(assistant_items(12));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        session
            .run_compaction(CompactionArgs {
                response_id: Some("resp_1".into()),
                mode: Some(CompactionMode::Input),
                ..Default::default()
            })
            .await
            .unwrap()
            .expect("should compact");

        // Auto would have chained on resp_1; the explicit override wins.
        let request = backend.last_request();
        assert!(request.previous_response_id.is_none());
        assert!(request.input.is_some());
    }

    #[tokio::test]
    async fn test_backend_failure_leaves_everything_untouched() {
        let delegate = CountingSession::with_items(assistant_items(12));
        let backend = MockBackend::new();
        *backend.fail.lock() = true;
        let session = make_session(delegate.clone(), backend.clone());

        let err = session
            .run_compaction(CompactionArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Wire(_)));

        // Delegate history and both caches are exactly as before the call.
        assert_eq!(session.items(None).await.unwrap().len(), 12);
        let candidates = session.compaction_candidates().await.unwrap();
        assert_eq!(candidates.len(), 12);
        // The caches were primed once; nothing forced a reload.
        assert_eq!(delegate.reads(), 2);
    }

    #[tokio::test]
    async fn test_empty_compaction_output_leaves_empty_history() {
        let delegate = CountingSession::with_items(assistant_items(12));
        let backend = MockBackend::new();
        *backend.output.lock() = Vec::new();
        let session = make_session(delegate.clone(), backend.clone());

        let usage = session.run_compaction(CompactionArgs::default()).await.unwrap();
        assert!(usage.is_some());
        assert!(session.items(None).await.unwrap().is_empty());
        assert!(session.compaction_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_declined_run_still_records_turn_state() {
        let delegate = CountingSession::with_items(assistant_items(2));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        assert!(session
            .run_compaction(CompactionArgs {
                response_id: Some("resp_1".into()),
                ..Default::default()
            })
            .await
            .unwrap()
            .is_none());
        assert_eq!(session.response_id().as_deref(), Some("resp_1"));

        // The recorded id makes the next auto run chain on it.
        session
            .run_compaction(CompactionArgs {
                force: true,
                ..Default::default()
            })
            .await
            .unwrap()
            .expect("forced run");
        assert_eq!(
            backend.last_request().previous_response_id.as_deref(),
            Some("resp_1")
        );
    }

    // --- Cache maintenance ---

    #[tokio::test]
    async fn test_add_items_extends_primed_caches_without_reload() {
        let delegate = CountingSession::with_items(assistant_items(3));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        session.compaction_candidates().await.unwrap();
        assert_eq!(delegate.reads(), 1);

        session
            .add_items(vec![
                ConversationItem::user("question"),
                ConversationItem::assistant("answer"),
            ])
            .await
            .unwrap();

        let candidates = session.compaction_candidates().await.unwrap();
        assert_eq!(candidates.len(), 4);
        assert_eq!(candidates[3].text().as_deref(), Some("answer"));
        // Still the single priming read: the caches grew in place.
        assert_eq!(delegate.reads(), 1);

        // Cache contents match a fresh ground-truth read.
        let ground_truth = delegate.inner.items(None).await.unwrap();
        assert_eq!(candidates, select_compaction_candidates(&ground_truth));
    }

    #[tokio::test]
    async fn test_add_items_before_priming_leaves_caches_unset() {
        let delegate = CountingSession::with_items(assistant_items(1));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        session
            .add_items(vec![ConversationItem::assistant("two")])
            .await
            .unwrap();
        assert_eq!(delegate.reads(), 0);

        let candidates = session.compaction_candidates().await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(delegate.reads(), 1);
    }

    #[tokio::test]
    async fn test_pop_updates_both_caches_in_place() {
        let delegate = CountingSession::with_items(vec![
            ConversationItem::assistant("a"),
            ConversationItem::user("q"),
            ConversationItem::assistant("b"),
        ]);
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        session.compaction_candidates().await.unwrap();
        assert_eq!(delegate.reads(), 1);

        let popped = session.pop_item().await.unwrap().unwrap();
        assert_eq!(popped.text().as_deref(), Some("b"));
        assert_eq!(delegate.reads(), 1);

        let candidates = session.compaction_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].text().as_deref(), Some("a"));

        // Popping a user message leaves the candidate cache alone.
        let popped = session.pop_item().await.unwrap().unwrap();
        assert_eq!(popped.role(), Some(Role::User));
        assert_eq!(delegate.reads(), 1);
        assert_eq!(session.compaction_candidates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pop_falls_back_to_reload_on_cache_mismatch() {
        let delegate = CountingSession::with_items(assistant_items(2));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        session.compaction_candidates().await.unwrap();
        assert_eq!(delegate.reads(), 1);

        // Slip an item past the decorator; the caches never saw it.
        delegate
            .add_items(vec![ConversationItem::assistant("sneaky")])
            .await
            .unwrap();

        let popped = session.pop_item().await.unwrap().unwrap();
        assert_eq!(popped.text().as_deref(), Some("sneaky"));
        // Both fallbacks reloaded from the delegate.
        assert_eq!(delegate.reads(), 3);

        let candidates = session.compaction_candidates().await.unwrap();
        let ground_truth = delegate.inner.items(None).await.unwrap();
        assert_eq!(candidates, select_compaction_candidates(&ground_truth));
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_pop_on_empty_delegate() {
        let delegate = CountingSession::with_items(Vec::new());
        let session = make_session(delegate.clone(), MockBackend::new());
        assert!(session.pop_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_resets_caches_to_known_empty() {
        let delegate = CountingSession::with_items(assistant_items(5));
        let backend = MockBackend::new();
        let session = make_session(delegate.clone(), backend.clone());

        session.compaction_candidates().await.unwrap();
        assert_eq!(delegate.reads(), 1);

        session.clear().await.unwrap();

        // Empty, and served from the cache without touching the delegate.
        assert!(session.compaction_candidates().await.unwrap().is_empty());
        assert_eq!(delegate.reads(), 1);

        // The caches are primed, so later appends extend them in place.
        session
            .add_items(vec![ConversationItem::assistant("fresh")])
            .await
            .unwrap();
        assert_eq!(session.compaction_candidates().await.unwrap().len(), 1);
        assert_eq!(delegate.reads(), 1);
    }

    #[tokio::test]
    async fn test_kind_and_delegated_ops() {
        let delegate = CountingSession::with_items(assistant_items(1));
        let session = make_session(delegate.clone(), MockBackend::new());

        assert_eq!(session.kind(), SessionKind::Compaction);
        assert!(!session.session_id().await.unwrap().is_empty());
        assert_eq!(session.items(Some(0)).await.unwrap().len(), 0);
        assert_eq!(session.items(None).await.unwrap().len(), 1);
    }
}
