//! Turn coordination.
//!
//! Builds the conversation sent to the model from a session's stored history,
//! drains the streamed reply into one string and commits the new turns only
//! once the whole reply has arrived.
//!
//! ## Phases
//!
//! ```text
//! history empty, utterance ""   -> Initial: send the opening utterance with no
//!                                  prior turns, record it as the first user turn
//! anything else                 -> Ongoing: send stored history + user(utterance)
//! ```
//!
//! A failed turn leaves the stored history untouched, so the client can retry
//! the identical request.

use crate::error::TurnError;
use crate::prompt::SystemInstruction;
use crate::provider::{check_alternation, ChatModel, ModelRequest, ProviderError};
use crate::session::{SessionLocks, SessionStore, Turn};
use advisor_common::Config;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Request / Outcome
// ============================================================================

/// Inbound chat turn. Both fields are optional on the wire so that missing
/// values can be reported as validation failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    /// `""` asks the assistant to open the conversation.
    #[serde(default)]
    pub user_response: Option<String>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, user_response: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            user_response: Some(user_response.into()),
        }
    }

    /// Check required fields, returning `(session_id, utterance)`.
    pub fn validate(self) -> Result<(String, String), TurnError> {
        let session_id = self
            .session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TurnError::Validation("sessionId is required".into()))?;
        let utterance = self
            .user_response
            .ok_or_else(|| TurnError::Validation("userResponse is required".into()))?;
        Ok((session_id, utterance))
    }
}

/// Result of a successful turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Full assistant reply
    pub reply: String,
    /// Stored history after the commit
    pub history: Vec<Turn>,
}

// ============================================================================
// Phase
// ============================================================================

/// How the outgoing conversation is built for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing stored and nothing said: the assistant opens the conversation.
    Initial,
    /// Continue from the stored history.
    Ongoing,
}

impl Phase {
    pub fn classify(history: &[Turn], utterance: &str) -> Self {
        if history.is_empty() && utterance.is_empty() {
            Self::Initial
        } else {
            Self::Ongoing
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Model call settings used by the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub model: String,
    pub temperature: Option<f64>,
    /// Synthetic first user message for the initial phase
    pub opening_utterance: String,
    /// Upper bound on one model call, stream drain included
    pub timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            opening_utterance: config.chat.opening_utterance.clone(),
            timeout: Duration::from_secs(config.llm.timeout_secs),
        }
    }
}

/// Runs chat turns against a session store and a model.
pub struct TurnCoordinator {
    store: Arc<dyn SessionStore>,
    model: Arc<dyn ChatModel>,
    instruction: SystemInstruction,
    settings: CoordinatorSettings,
    locks: SessionLocks,
}

impl TurnCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        model: Arc<dyn ChatModel>,
        instruction: SystemInstruction,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            model,
            instruction,
            settings,
            locks: SessionLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Run one chat turn.
    ///
    /// Turns for the same session are serialized; the lock is held from the
    /// history read to the commit.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnOutcome, TurnError> {
        let (session_id, utterance) = request.validate().map_err(|e| {
            tracing::debug!(error = %e, "Rejected chat turn");
            e
        })?;

        let _guard = self.locks.acquire(&session_id).await;

        let stored = self.store.get(&session_id).await?;
        let stored_len = stored.len();
        let phase = Phase::classify(&stored, &utterance);

        let (prior, message) = match phase {
            Phase::Initial => (Vec::new(), self.settings.opening_utterance.clone()),
            Phase::Ongoing => (stored, utterance),
        };

        let request = ModelRequest {
            model: self.settings.model.clone(),
            system_instruction: self.instruction.parts().to_vec(),
            history: prior,
            message,
            temperature: self.settings.temperature,
        };

        let mut working = request.contents();
        if let Err(reason) = check_alternation(&working) {
            tracing::error!(
                session_id = %session_id,
                history_len = stored_len,
                reason = %reason,
                "Stored history breaks turn ordering"
            );
            return Err(TurnError::UpstreamProtocol(reason));
        }

        tracing::debug!(
            session_id = %session_id,
            phase = ?phase,
            history_len = stored_len,
            "Calling model"
        );

        let reply = match self.collect_reply(request).await {
            Ok(reply) => reply,
            Err(e) => {
                match &e {
                    TurnError::UpstreamProtocol(detail) => tracing::error!(
                        session_id = %session_id,
                        history_len = stored_len,
                        error = %detail,
                        "Model rejected conversation history"
                    ),
                    other => tracing::warn!(
                        session_id = %session_id,
                        error = %other,
                        "Chat turn failed"
                    ),
                }
                return Err(e);
            }
        };

        working.push(Turn::assistant(reply.clone()));
        self.store.set(&session_id, working.clone()).await?;

        tracing::info!(
            session_id = %session_id,
            phase = ?phase,
            history_len = working.len(),
            reply_chars = reply.chars().count(),
            "Chat turn committed"
        );

        Ok(TurnOutcome {
            reply,
            history: working,
        })
    }

    /// Call the model and drain its reply within the configured timeout.
    async fn collect_reply(&self, request: ModelRequest) -> Result<String, TurnError> {
        let call = async {
            let mut stream = self.model.stream_reply(request).await?;
            let mut reply = String::new();
            let mut index = 0usize;

            while let Some(item) = stream.next().await {
                let fragment = item?;
                match fragment.text() {
                    Some(text) => reply.push_str(&text),
                    None => tracing::warn!(
                        provider = self.model.name(),
                        fragment_index = index,
                        fragment = ?fragment,
                        "Unexpected fragment shape, no text extracted"
                    ),
                }
                index += 1;
            }

            Ok::<_, ProviderError>(reply)
        };

        match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(result) => result.map_err(TurnError::from),
            Err(_) => Err(TurnError::UpstreamTransient(format!(
                "no complete reply within {}s",
                self.settings.timeout.as_secs_f64()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Fragment;
    use crate::provider::{FragmentStream, ProviderErrorKind};
    use crate::session::{InMemorySessionStore, Role};
    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    enum Script {
        Reply(Vec<Result<Fragment, ProviderError>>),
        Fail(ProviderErrorKind),
        Hang,
    }

    /// Replays scripted replies and records every request.
    #[derive(Default)]
    struct ScriptedModel {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        fn with(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ModelRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream_reply(&self, request: ModelRequest) -> Result<FragmentStream, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Reply(items)) => Ok(stream::iter(items).boxed()),
                Some(Script::Fail(kind)) => Err(ProviderError::new("scripted", "m", kind, "scripted failure")),
                Some(Script::Hang) => Ok(stream::pending().boxed()),
                None => Ok(stream::iter(vec![Ok(Fragment::Plain("default".into()))]).boxed()),
            }
        }
    }

    fn plain(parts: &[&str]) -> Script {
        Script::Reply(parts.iter().map(|p| Ok(Fragment::Plain((*p).to_string()))).collect())
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            model: "gemini-test".into(),
            temperature: None,
            opening_utterance: "Hello".into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn coordinator(model: Arc<ScriptedModel>) -> (TurnCoordinator, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let instruction = SystemInstruction::parse("persona\n---\nrules").unwrap();
        let coordinator = TurnCoordinator::new(store.clone(), model, instruction, settings());
        (coordinator, store)
    }

    #[test]
    fn phase_classification() {
        assert_eq!(Phase::classify(&[], ""), Phase::Initial);
        assert_eq!(Phase::classify(&[], "hi"), Phase::Ongoing);
        let history = [Turn::user("a"), Turn::assistant("b")];
        assert_eq!(Phase::classify(&history, ""), Phase::Ongoing);
        assert_eq!(Phase::classify(&history, "c"), Phase::Ongoing);
    }

    #[test]
    fn turn_request_reads_camel_case() {
        let req: TurnRequest =
            serde_json::from_value(json!({"sessionId": "s1", "userResponse": ""})).unwrap();
        assert_eq!(req.validate().unwrap(), ("s1".to_string(), String::new()));
    }

    #[test]
    fn turn_request_validation() {
        let missing_id: TurnRequest = serde_json::from_value(json!({"userResponse": "x"})).unwrap();
        assert!(matches!(missing_id.validate(), Err(TurnError::Validation(_))));

        let empty_id = TurnRequest::new("", "x");
        assert!(matches!(empty_id.validate(), Err(TurnError::Validation(_))));

        let null_response: TurnRequest =
            serde_json::from_value(json!({"sessionId": "s1", "userResponse": null})).unwrap();
        assert!(matches!(null_response.validate(), Err(TurnError::Validation(_))));
    }

    #[tokio::test]
    async fn initial_turn_sends_opening_utterance_with_empty_history() {
        let model = ScriptedModel::with(vec![plain(&["I'm Tina. ", "May I ask?"])]);
        let (coordinator, store) = coordinator(model.clone());

        let outcome = coordinator.handle_turn(TurnRequest::new("s1", "")).await.unwrap();

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[0].message, "Hello");
        assert_eq!(requests[0].system_instruction, vec!["persona", "rules"]);

        assert_eq!(outcome.reply, "I'm Tina. May I ask?");
        assert_eq!(
            outcome.history,
            vec![Turn::user("Hello"), Turn::assistant("I'm Tina. May I ask?")]
        );
        assert_eq!(store.get("s1").await.unwrap(), outcome.history);
    }

    #[tokio::test]
    async fn ongoing_turn_sends_stored_history_plus_user_turn() {
        let model = ScriptedModel::with(vec![plain(&["opening"]), plain(&["question one"])]);
        let (coordinator, store) = coordinator(model.clone());

        coordinator.handle_turn(TurnRequest::new("s1", "")).await.unwrap();
        let before = store.get("s1").await.unwrap();
        let outcome = coordinator
            .handle_turn(TurnRequest::new("s1", "Yes, go ahead"))
            .await
            .unwrap();

        let second = &model.requests()[1];
        assert_eq!(second.history, before);
        let mut expected = before.clone();
        expected.push(Turn::user("Yes, go ahead"));
        assert_eq!(second.contents(), expected);

        assert_eq!(outcome.history.len(), 4);
        assert_eq!(outcome.history[2], Turn::user("Yes, go ahead"));
        assert_eq!(outcome.history[3], Turn::assistant("question one"));
    }

    #[tokio::test]
    async fn first_contact_with_real_text_is_ongoing() {
        let model = ScriptedModel::with(vec![plain(&["hi"])]);
        let (coordinator, store) = coordinator(model.clone());

        coordinator.handle_turn(TurnRequest::new("s1", "I need insurance")).await.unwrap();

        assert_eq!(model.requests()[0].message, "I need insurance");
        assert_eq!(store.get("s1").await.unwrap()[0], Turn::user("I need insurance"));
    }

    #[tokio::test]
    async fn n_turns_give_2n_alternating_entries() {
        let model = ScriptedModel::with(vec![]);
        let (coordinator, store) = coordinator(model);

        coordinator.handle_turn(TurnRequest::new("s1", "")).await.unwrap();
        for answer in ["yes", "a sedan", "five years old", "commuting"] {
            coordinator.handle_turn(TurnRequest::new("s1", answer)).await.unwrap();
        }

        let history = store.get("s1").await.unwrap();
        assert_eq!(history.len(), 10);
        for (i, turn) in history.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            assert_eq!(turn.role, expected);
        }
    }

    #[tokio::test]
    async fn fragments_concatenate_in_order_with_nested_fallback() {
        let nested = Fragment::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "B"}]}}]
        }));
        let model = ScriptedModel::with(vec![Script::Reply(vec![
            Ok(Fragment::Plain("A".into())),
            Ok(nested),
            Ok(Fragment::Unrecognized(json!({"weird": true}))),
            Ok(Fragment::Metadata),
            Ok(Fragment::Plain("C".into())),
        ])]);
        let (coordinator, _) = coordinator(model);

        let outcome = coordinator.handle_turn(TurnRequest::new("s1", "")).await.unwrap();
        assert_eq!(outcome.reply, "ABC");
    }

    #[tokio::test]
    async fn failure_before_stream_leaves_history_untouched() {
        let model = ScriptedModel::with(vec![plain(&["opening"]), Script::Fail(ProviderErrorKind::RateLimited)]);
        let (coordinator, store) = coordinator(model);

        coordinator.handle_turn(TurnRequest::new("s1", "")).await.unwrap();
        let before = store.get("s1").await.unwrap();

        let err = coordinator.handle_turn(TurnRequest::new("s1", "yes")).await.unwrap_err();
        assert!(matches!(err, TurnError::UpstreamTransient(_)));
        assert_eq!(store.get("s1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn failure_mid_stream_leaves_history_untouched() {
        let model = ScriptedModel::with(vec![Script::Reply(vec![
            Ok(Fragment::Plain("partial".into())),
            Err(ProviderError::new("scripted", "m", ProviderErrorKind::Transport, "reset")),
            Ok(Fragment::Plain("never".into())),
        ])]);
        let (coordinator, store) = coordinator(model);

        let err = coordinator.handle_turn(TurnRequest::new("s1", "")).await.unwrap_err();
        assert!(matches!(err, TurnError::UpstreamTransient(_)));
        assert!(store.get("s1").await.unwrap().is_empty());
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn history_order_rejection_is_a_protocol_error() {
        let model = ScriptedModel::with(vec![Script::Fail(ProviderErrorKind::HistoryOrder)]);
        let (coordinator, store) = coordinator(model);

        let err = coordinator.handle_turn(TurnRequest::new("s1", "hi")).await.unwrap_err();
        assert!(matches!(err, TurnError::UpstreamProtocol(_)));
        assert!(store.get("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_stored_history_is_caught_before_calling_out() {
        let model = ScriptedModel::with(vec![]);
        let (coordinator, store) = coordinator(model.clone());
        let corrupt = vec![Turn::assistant("out of order")];
        store.set("s1", corrupt.clone()).await.unwrap();

        let err = coordinator.handle_turn(TurnRequest::new("s1", "hi")).await.unwrap_err();
        assert!(matches!(err, TurnError::UpstreamProtocol(_)));
        assert!(model.requests().is_empty());
        assert_eq!(store.get("s1").await.unwrap(), corrupt);
    }

    #[tokio::test]
    async fn validation_failure_creates_no_session() {
        let model = ScriptedModel::with(vec![]);
        let (coordinator, store) = coordinator(model.clone());

        let err = coordinator
            .handle_turn(TurnRequest {
                session_id: None,
                user_response: Some("hi".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Validation(_)));
        assert!(model.requests().is_empty());
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_stream_times_out_as_transient() {
        let model = ScriptedModel::with(vec![Script::Hang]);
        let (coordinator, store) = coordinator(model);

        let err = coordinator.handle_turn(TurnRequest::new("s1", "")).await.unwrap_err();
        assert!(matches!(err, TurnError::UpstreamTransient(_)));
        assert_eq!(store.session_count().await, 0);
    }

    /// Replies only once a permit is released, tracking how many calls are
    /// waiting at the same time.
    struct GatedModel {
        gate: Arc<Semaphore>,
        calls: AtomicUsize,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl GatedModel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(0)),
                calls: AtomicUsize::new(0),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl ChatModel for GatedModel {
        fn name(&self) -> &str {
            "gated"
        }

        async fn stream_reply(&self, _request: ModelRequest) -> Result<FragmentStream, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            let gate = self.gate.clone();
            let in_flight = self.in_flight.clone();
            Ok(stream::once(async move {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Fragment::Plain(format!("reply {n}")))
            })
            .boxed())
        }
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_are_serialized() {
        let model = GatedModel::new();
        let store = Arc::new(InMemorySessionStore::new());
        let coordinator = Arc::new(TurnCoordinator::new(
            store.clone(),
            model.clone(),
            SystemInstruction::parse("persona").unwrap(),
            settings(),
        ));

        store
            .set("s1", vec![Turn::user("Hello"), Turn::assistant("I'm Tina.")])
            .await
            .unwrap();

        let a = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.handle_turn(TurnRequest::new("s1", "first")).await })
        };
        let b = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.handle_turn(TurnRequest::new("s1", "second")).await })
        };

        // Let both turns run as far as they can before any reply is released.
        while model.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);

        model.gate.add_permits(2);
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(model.max_in_flight.load(Ordering::SeqCst), 1);
        let history = store.get("s1").await.unwrap();
        assert_eq!(history.len(), 6);
        assert!(check_alternation(&history).is_ok());
    }
}
