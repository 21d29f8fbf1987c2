// src/session.rs

use crate::api::{ChatCompletionRequest, ChatMessage, CompletionSource};
use crate::config::Config;
use crate::errors::{ChatError, ChatResult};
use crate::models::{ChatConfig, Conversation, Message, Role};
use crate::store::ConversationStore;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    UserAppended,
    AssistantPlaceholderCreated,
    Streaming,
    Finalized,
    Errored,
}

/// What a turn reports to its observer while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    State(TurnState),
    Fragment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Finalized,
    /// The user-visible error message. Partial content is kept.
    Errored(String),
    /// The target conversation disappeared mid-stream.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub assistant_message_id: String,
    pub status: TurnStatus,
    pub content: String,
}

/// Checkpoint every `every_fragments` fragments or every `interval`,
/// whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub every_fragments: usize,
    pub interval: Duration,
}

impl CheckpointPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            every_fragments: config.checkpoint_every_fragments.max(1),
            interval: config.checkpoint_interval(),
        }
    }

    fn due(&self, fragments: usize, since: Instant) -> bool {
        fragments >= self.every_fragments || since.elapsed() >= self.interval
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The single in-progress assistant message of a turn.
struct PendingReply {
    conversation_id: String,
    index: usize,
    message: Message,
    unsaved_fragments: usize,
    last_checkpoint: Instant,
}

impl PendingReply {
    fn outcome(self, status: TurnStatus) -> TurnOutcome {
        TurnOutcome {
            conversation_id: self.conversation_id,
            assistant_message_id: self.message.id,
            status,
            content: self.message.content,
        }
    }
}

/// Releases the in-flight flag however the turn ends, including when the
/// turn future is dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> ChatResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ChatError::TurnInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives one user turn at a time against the shared store.
///
/// The store lock is held only for individual mutations, so other readers
/// (and deletions) can interleave between fragments, never inside one.
pub struct ChatSession {
    store: Arc<Mutex<ConversationStore>>,
    source: Arc<dyn CompletionSource>,
    policy: CheckpointPolicy,
    in_flight: AtomicBool,
}

impl ChatSession {
    pub fn new(
        store: Arc<Mutex<ConversationStore>>,
        source: Arc<dyn CompletionSource>,
        policy: CheckpointPolicy,
    ) -> Self {
        Self {
            store,
            source,
            policy,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Sends `input` in the current conversation and streams the reply.
    ///
    /// Guard violations are returned as errors and change nothing. Once the
    /// user message is appended the turn always returns `Ok`, with failures
    /// reported through `TurnStatus::Errored`, and the last event is
    /// `TurnState::Idle` once the session accepts a new turn.
    pub async fn send_message<F>(&self, input: &str, mut on_event: F) -> ChatResult<TurnOutcome>
    where
        F: FnMut(&TurnEvent),
    {
        let guard = InFlightGuard::acquire(&self.in_flight)?;
        let outcome = self.run_turn(input, &mut on_event).await;
        drop(guard);
        if outcome.is_ok() {
            on_event(&TurnEvent::State(TurnState::Idle));
        }
        outcome
    }

    async fn run_turn<F>(&self, input: &str, on_event: &mut F) -> ChatResult<TurnOutcome>
    where
        F: FnMut(&TurnEvent),
    {
        let (mut reply, request) = {
            let mut store = self.store.lock().await;
            let config = store.config().clone();
            if config.model.trim().is_empty() {
                return Err(ChatError::MissingModel);
            }
            let text = input.trim();
            if text.is_empty() {
                return Err(ChatError::EmptyInput);
            }
            let conversation_id = store
                .current_id()
                .ok_or(ChatError::NoActiveConversation)?
                .to_string();

            store
                .append_message(&conversation_id, Message::new(Role::User, text))
                .ok_or(ChatError::NoActiveConversation)?;
            store.checkpoint();

            let messages = match store.get(&conversation_id) {
                Some(conversation) => outbound_messages(&config, conversation),
                None => return Err(ChatError::NoActiveConversation),
            };
            let placeholder = Message::placeholder();
            let index = store
                .append_message(&conversation_id, placeholder.clone())
                .ok_or(ChatError::NoActiveConversation)?;

            debug!(
                "Turn in {}: {} outbound message(s), reply slot {}",
                conversation_id,
                messages.len(),
                index
            );

            let reply = PendingReply {
                conversation_id,
                index,
                message: placeholder,
                unsaved_fragments: 0,
                last_checkpoint: Instant::now(),
            };
            let request = ChatCompletionRequest {
                model: config.model,
                messages,
                temperature: config.temperature,
                stream: true,
            };
            (reply, request)
        };
        on_event(&TurnEvent::State(TurnState::UserAppended));
        on_event(&TurnEvent::State(TurnState::AssistantPlaceholderCreated));

        let mut fragments = self.source.stream_completion(request);
        on_event(&TurnEvent::State(TurnState::Streaming));

        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => {
                    reply.message.content.push_str(&fragment);
                    {
                        let mut store = self.store.lock().await;
                        if !store.write_reply(&reply.conversation_id, reply.index, &reply.message) {
                            warn!(
                                "Conversation {} vanished mid-stream; discarding reply",
                                reply.conversation_id
                            );
                            return Ok(reply.outcome(TurnStatus::Abandoned));
                        }
                        reply.unsaved_fragments += 1;
                        if self.policy.due(reply.unsaved_fragments, reply.last_checkpoint) {
                            store.checkpoint();
                            reply.unsaved_fragments = 0;
                            reply.last_checkpoint = Instant::now();
                        }
                    }
                    on_event(&TurnEvent::Fragment(fragment));
                }
                Err(e) => return Ok(self.fail(reply, e, on_event).await),
            }
        }

        let mut store = self.store.lock().await;
        if !store.write_reply(&reply.conversation_id, reply.index, &reply.message) {
            warn!(
                "Conversation {} vanished before the reply was finalized",
                reply.conversation_id
            );
            return Ok(reply.outcome(TurnStatus::Abandoned));
        }
        store.checkpoint();
        drop(store);

        info!(
            "Reply finalized in {} ({} chars)",
            reply.conversation_id,
            reply.message.content.chars().count()
        );
        on_event(&TurnEvent::State(TurnState::Finalized));
        Ok(reply.outcome(TurnStatus::Finalized))
    }

    /// Keeps everything appended so far, persists it, and reports the error.
    async fn fail<F>(&self, reply: PendingReply, err: ChatError, on_event: &mut F) -> TurnOutcome
    where
        F: FnMut(&TurnEvent),
    {
        error!("Turn in {} failed: {}", reply.conversation_id, err);
        {
            let mut store = self.store.lock().await;
            if store.contains(&reply.conversation_id) {
                store.checkpoint();
            }
        }
        on_event(&TurnEvent::State(TurnState::Errored));
        reply.outcome(TurnStatus::Errored(err.to_string()))
    }
}

/// System prompt (when set) followed by the transcript, role-mapped.
pub fn outbound_messages(config: &ChatConfig, conversation: &Conversation) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(conversation.messages.len() + 1);
    if !config.system_prompt.trim().is_empty() {
        messages.push(ChatMessage {
            role: Role::System,
            content: config.system_prompt.clone(),
        });
    }
    messages.extend(conversation.messages.iter().map(ChatMessage::from));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FragmentStream;
    use crate::constants::NEW_CHAT_TITLE;
    use crate::storage::{MemoryStorage, Storage};
    use futures::stream;
    use std::sync::Mutex as StdMutex;

    /// Replays a fixed script, optionally sleeping before each item.
    struct ScriptedSource {
        script: Vec<Result<&'static str, &'static str>>,
        delays: Vec<Duration>,
        requests: StdMutex<Vec<ChatCompletionRequest>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<&'static str, &'static str>>) -> Self {
            Self {
                script,
                delays: Vec::new(),
                requests: StdMutex::new(Vec::new()),
            }
        }

        fn with_delays(mut self, delays: Vec<Duration>) -> Self {
            self.delays = delays;
            self
        }
    }

    impl CompletionSource for ScriptedSource {
        fn stream_completion(&self, request: ChatCompletionRequest) -> FragmentStream {
            self.requests.lock().unwrap().push(request);
            let items: Vec<(Duration, Result<&'static str, &'static str>)> = self
                .script
                .iter()
                .enumerate()
                .map(|(i, item)| (self.delays.get(i).copied().unwrap_or_default(), *item))
                .collect();
            stream::iter(items)
                .then(|(delay, item)| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    item.map(str::to_string)
                        .map_err(ChatError::connectivity_error)
                })
                .boxed()
        }
    }

    /// Deletes the conversation it is streaming into after the first fragment.
    struct DeletingSource {
        store: Arc<Mutex<ConversationStore>>,
    }

    impl CompletionSource for DeletingSource {
        fn stream_completion(&self, _request: ChatCompletionRequest) -> FragmentStream {
            let store = self.store.clone();
            stream::iter(0..3)
                .then(move |i| {
                    let store = store.clone();
                    async move {
                        if i == 1 {
                            let mut store = store.lock().await;
                            store.delete_current().unwrap();
                        }
                        Ok(format!("part{}", i))
                    }
                })
                .boxed()
        }
    }

    fn shared_store(model: &str) -> (Arc<Mutex<ConversationStore>>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = ConversationStore::bootstrap(Box::new(storage.clone()));
        let mut config = store.config().clone();
        config.model = model.to_string();
        store.update_config(config).unwrap();
        (Arc::new(Mutex::new(store)), storage)
    }

    fn session(store: &Arc<Mutex<ConversationStore>>, source: Arc<dyn CompletionSource>) -> ChatSession {
        ChatSession::new(store.clone(), source, CheckpointPolicy::default())
    }

    #[tokio::test]
    async fn test_fragments_concatenate_in_order() {
        let (store, _) = shared_store("test-model");
        let source = ScriptedSource::new(vec![Ok("Hel"), Ok("lo, "), Ok("world")]).with_delays(vec![
            Duration::from_millis(30),
            Duration::from_millis(1),
            Duration::from_millis(15),
        ]);
        let session = session(&store, Arc::new(source));

        let mut events = Vec::new();
        let outcome = session
            .send_message("  Say hello  ", |event| events.push(event.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Finalized);
        assert_eq!(outcome.content, "Hello, world");

        let store = store.lock().await;
        let conversation = store.current().unwrap();
        assert_eq!(conversation.title, "Say hello");
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert_eq!(conversation.messages[0].content, "Say hello");
        assert_eq!(conversation.messages[1].role, Role::Assistant);
        assert_eq!(conversation.messages[1].id, outcome.assistant_message_id);
        assert_eq!(conversation.messages[1].content, "Hello, world");

        assert_eq!(
            events,
            vec![
                TurnEvent::State(TurnState::UserAppended),
                TurnEvent::State(TurnState::AssistantPlaceholderCreated),
                TurnEvent::State(TurnState::Streaming),
                TurnEvent::Fragment("Hel".to_string()),
                TurnEvent::Fragment("lo, ".to_string()),
                TurnEvent::Fragment("world".to_string()),
                TurnEvent::State(TurnState::Finalized),
                TurnEvent::State(TurnState::Idle),
            ]
        );
    }

    #[tokio::test]
    async fn test_observer_can_read_store_during_turn() {
        let (store, _) = shared_store("test-model");
        let session = session(&store, Arc::new(ScriptedSource::new(vec![Ok("a"), Ok("b")])));

        let observer_store = store.clone();
        let mut seen = Vec::new();
        session
            .send_message("look", |event| {
                let messages = observer_store
                    .try_lock()
                    .map(|store| store.current().map(|c| c.messages.len()).unwrap_or(0))
                    .ok();
                seen.push((event.clone(), messages));
            })
            .await
            .unwrap();

        assert!(seen.iter().all(|(_, messages)| messages.is_some()));
        assert_eq!(
            seen[0],
            (TurnEvent::State(TurnState::UserAppended), Some(2))
        );
        assert_eq!(
            seen[1],
            (TurnEvent::State(TurnState::AssistantPlaceholderCreated), Some(2))
        );
    }

    #[tokio::test]
    async fn test_request_includes_system_prompt_and_history() {
        let (store, _) = shared_store("test-model");
        let source = Arc::new(ScriptedSource::new(vec![Ok("first answer")]));
        let session = session(&store, source.clone());

        session.send_message("first", |_| {}).await.unwrap();
        session.send_message("second", |_| {}).await.unwrap();

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        assert_eq!(second.model, "test-model");
        assert!(second.stream);
        let roles: Vec<Role> = second.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(second.messages[2].content, "first answer");
        assert_eq!(second.messages[3].content, "second");

        let store = store.lock().await;
        assert_eq!(store.current().unwrap().title, "first");
    }

    #[tokio::test]
    async fn test_empty_system_prompt_is_omitted() {
        let (store, _) = shared_store("test-model");
        {
            let mut store = store.lock().await;
            let mut config = store.config().clone();
            config.system_prompt = "   ".to_string();
            store.update_config(config).unwrap();
        }
        let source = Arc::new(ScriptedSource::new(vec![Ok("ok")]));
        let session = session(&store, source.clone());
        session.send_message("hi", |_| {}).await.unwrap();

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_guards_reject_without_mutation() {
        let (store, storage) = shared_store("");
        let session = session(&store, Arc::new(ScriptedSource::new(vec![Ok("x")])));
        let saves = storage.conversation_saves();

        assert!(matches!(
            session.send_message("hello", |_| {}).await,
            Err(ChatError::MissingModel)
        ));

        {
            let mut store = store.lock().await;
            let mut config = store.config().clone();
            config.model = "test-model".to_string();
            store.update_config(config).unwrap();
        }
        assert!(matches!(
            session.send_message(" \n\t ", |_| {}).await,
            Err(ChatError::EmptyInput)
        ));

        let store = store.lock().await;
        assert!(store.current().unwrap().is_empty());
        assert_eq!(store.current().unwrap().title, NEW_CHAT_TITLE);
        assert_eq!(storage.conversation_saves(), saves);
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_second_turn_rejected_while_streaming() {
        let (store, _) = shared_store("test-model");
        let source = ScriptedSource::new(vec![Ok("slow"), Ok(" reply")])
            .with_delays(vec![Duration::from_millis(50), Duration::from_millis(50)]);
        let session = session(&store, Arc::new(source));

        let (first, second) = tokio::join!(
            session.send_message("one", |_| {}),
            session.send_message("two", |_| {}),
        );
        assert_eq!(first.unwrap().content, "slow reply");
        assert!(matches!(second, Err(ChatError::TurnInProgress)));
        assert!(!session.is_streaming());

        let store = store.lock().await;
        assert_eq!(store.current().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_error_keeps_partial_reply() {
        let (store, storage) = shared_store("test-model");
        let source = ScriptedSource::new(vec![Ok("partial "), Ok("answer"), Err("http://localhost:1238/v1")]);
        let session = session(&store, Arc::new(source));

        let mut events = Vec::new();
        let outcome = session
            .send_message("question", |event| events.push(event.clone()))
            .await
            .unwrap();

        match &outcome.status {
            TurnStatus::Errored(message) => assert!(message.contains("http://localhost:1238/v1")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(outcome.content, "partial answer");
        assert_eq!(
            &events[events.len() - 2..],
            &[
                TurnEvent::State(TurnState::Errored),
                TurnEvent::State(TurnState::Idle)
            ]
        );
        assert!(!session.is_streaming());

        // the persisted copy has both messages and the partial content
        let persisted = storage.load_conversations().unwrap().unwrap();
        let conversation = &persisted[&outcome.conversation_id];
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].content, "question");
        assert_eq!(conversation.messages[1].content, "partial answer");

        // the session is usable again
        let outcome = session.send_message("again", |_| {}).await.unwrap();
        assert!(matches!(outcome.status, TurnStatus::Errored(_)));
        assert_eq!(store.lock().await.current().unwrap().messages.len(), 4);
    }

    #[tokio::test]
    async fn test_checkpoints_are_throttled() {
        let (store, storage) = shared_store("test-model");
        let script: Vec<Result<&'static str, &'static str>> = (0..40).map(|_| Ok("x")).collect();
        let policy = CheckpointPolicy {
            every_fragments: 16,
            interval: Duration::from_secs(3600),
        };
        let session = ChatSession::new(store.clone(), Arc::new(ScriptedSource::new(script)), policy);
        let before = storage.conversation_saves();

        let outcome = session.send_message("count", |_| {}).await.unwrap();
        assert_eq!(outcome.content.len(), 40);

        // user append + two throttled checkpoints + final
        assert_eq!(storage.conversation_saves() - before, 4);

        let persisted = storage.load_conversations().unwrap().unwrap();
        assert_eq!(persisted[&outcome.conversation_id].messages[1].content, outcome.content);
    }

    #[tokio::test]
    async fn test_user_message_persisted_before_stream_opens() {
        struct PeekingSource {
            storage: Arc<MemoryStorage>,
        }

        impl CompletionSource for PeekingSource {
            fn stream_completion(&self, _request: ChatCompletionRequest) -> FragmentStream {
                let persisted = self.storage.load_conversations().unwrap().unwrap();
                let user_messages = persisted
                    .values()
                    .flat_map(|c| c.messages.iter())
                    .filter(|m| m.role == Role::User)
                    .count();
                stream::iter(vec![Ok(user_messages.to_string())]).boxed()
            }
        }

        let (store, storage) = shared_store("test-model");
        let session = session(&store, Arc::new(PeekingSource { storage }));
        let outcome = session.send_message("durable", |_| {}).await.unwrap();
        assert_eq!(outcome.content, "1");
    }

    #[tokio::test]
    async fn test_deleted_conversation_discards_reply() {
        let (store, _) = shared_store("test-model");
        let session = session(&store, Arc::new(DeletingSource { store: store.clone() }));
        let original = store.lock().await.current_id().unwrap().to_string();

        let outcome = session.send_message("doomed", |_| {}).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Abandoned);
        assert_eq!(outcome.conversation_id, original);

        let store = store.lock().await;
        assert!(!store.contains(&original));
        assert_eq!(store.len(), 1);
        assert!(store.current().unwrap().is_empty());
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_dropped_turn_releases_session() {
        let (store, storage) = shared_store("test-model");
        let source = ScriptedSource::new(vec![Ok("never"), Ok(" arrives")])
            .with_delays(vec![Duration::from_millis(500)]);
        let session = session(&store, Arc::new(source));

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            session.send_message("abandon me", |_| {}),
        )
        .await;
        assert!(result.is_err());
        assert!(!session.is_streaming());

        // the user message was checkpointed before the stream opened
        let persisted = storage.load_conversations().unwrap().unwrap();
        let user_messages: Vec<&Message> = persisted
            .values()
            .flat_map(|c| c.messages.iter())
            .filter(|m| m.role == Role::User)
            .collect();
        assert_eq!(user_messages.len(), 1);
        assert_eq!(user_messages[0].content, "abandon me");
    }

    #[test]
    fn test_policy_due() {
        let policy = CheckpointPolicy {
            every_fragments: 3,
            interval: Duration::from_secs(3600),
        };
        assert!(!policy.due(2, Instant::now()));
        assert!(policy.due(3, Instant::now()));

        let policy = CheckpointPolicy {
            every_fragments: 1000,
            interval: Duration::from_millis(0),
        };
        assert!(policy.due(1, Instant::now()));
    }
}
