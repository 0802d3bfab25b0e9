//! End-to-end tests for the agentic loop.
//!
//! Each test scripts the model with `ScriptedProvider`, backs the overlay with
//! `MemoryRepo`, and checks what the host sees (fragments, updates) against
//! what the model was sent on the following turn.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::Notify;

use repolens_kernel::tree::find;
use repolens_kernel::{
    CommitOutcome, CommitRequest, Conversation, ConversationEngine, EngineConfig, EngineError,
    LlmError, MemoryRepo, NodeKind, Overlay, Part, RepoRef, RepoResult, RepoSource, Role,
    ScriptedProvider, ScriptedTurn, SharedTree, StreamEvent, ToolCall, ToolDispatcher, TreeEntry,
};

// ============================================================================
// Shared test setup
// ============================================================================

struct Harness {
    engine: ConversationEngine,
    dispatcher: Arc<ToolDispatcher>,
    provider: Arc<ScriptedProvider>,
}

fn harness(repo: Arc<dyn RepoSource>, turns: Vec<ScriptedTurn>) -> Harness {
    harness_with(repo, turns, EngineConfig::default())
}

fn harness_with(repo: Arc<dyn RepoSource>, turns: Vec<ScriptedTurn>, config: EngineConfig) -> Harness {
    let overlay = Overlay::shared(repo, RepoRef::new("octo", "demo"));
    let dispatcher = Arc::new(ToolDispatcher::new(overlay, SharedTree::default()));
    let provider = Arc::new(ScriptedProvider::new(turns));
    let engine = ConversationEngine::new(provider.clone(), dispatcher.clone(), config);
    Harness {
        engine,
        dispatcher,
        provider,
    }
}

fn read(id: &str, path: &str) -> ToolCall {
    ToolCall::new(id, "read_file", json!({ "path": path }))
}

fn user(text: &str) -> Vec<Part> {
    vec![Part::text(text)]
}

/// Function responses of the last content sent in request `n`.
fn responses(provider: &ScriptedProvider, n: usize) -> Vec<(String, Value)> {
    let request = &provider.requests()[n];
    let last = request.last_turn().expect("request has contents");
    assert_eq!(last.role, Role::User);
    last.parts
        .iter()
        .map(|p| match p {
            Part::FunctionResponse { id, response, .. } => (id.clone(), response.clone()),
            other => panic!("expected function response, got {:?}", other),
        })
        .collect()
}

async fn drain(stream: repolens_kernel::TurnStream) -> Vec<Result<String, EngineError>> {
    stream.collect().await
}

// ============================================================================
// Loop behavior
// ============================================================================

#[tokio::test]
async fn marker_precedes_final_answer() {
    let repo = Arc::new(MemoryRepo::new().with_file("src/lib.rs", "pub struct Widget;"));
    let h = harness(
        repo,
        vec![
            ScriptedTurn::tool_calls(vec![read("c1", "src/lib.rs")]),
            ScriptedTurn::text("It defines Widget."),
        ],
    );
    let conversation = Conversation::shared();

    let items: Vec<String> = drain(h.engine.run(conversation.clone(), user("what's in lib?"), None))
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(items, vec!["\n\n> 🔧 Reading `src/lib.rs`…\n\n", "It defines Widget."]);
    assert_eq!(
        responses(&h.provider, 1),
        vec![("c1".to_string(), json!({ "content": "pub struct Widget;" }))]
    );

    let conv = conversation.lock();
    let messages = conv.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text, items.concat());
    assert!(!messages[1].streaming);
    // user, model(call), user(results), model(answer)
    assert_eq!(conv.history().len(), 4);
}

#[tokio::test]
async fn update_on_absent_path_grows_tree() {
    let repo = Arc::new(MemoryRepo::new());
    let h = harness(
        repo.clone(),
        vec![
            ScriptedTurn::tool_calls(vec![ToolCall::new(
                "u1",
                "update_file",
                json!({ "path": "src/a.ts", "code": "X", "description": "add X" }),
            )]),
            ScriptedTurn::text("Done."),
        ],
    );
    let mut updates = h.dispatcher.subscribe();

    let text = h
        .engine
        .run(Conversation::shared(), user("add X"), None)
        .collect_text()
        .await
        .unwrap();
    assert!(text.contains("> ✏️ Updating `src/a.ts`…"));

    let tree = h.dispatcher.tree().snapshot();
    let src = find(&tree, "src").unwrap();
    assert_eq!(src.kind, NodeKind::Tree);
    assert_eq!(src.children()[0].path, "src/a.ts");
    assert_eq!(src.children()[0].kind, NodeKind::Blob);
    assert_eq!(h.dispatcher.overlay().get("src/a.ts").await.unwrap(), "X");
    assert_eq!(repo.fetch_count(), 0);

    let update = updates.try_recv().unwrap();
    assert_eq!(update.description, "add X");
    assert!(updates.try_recv().is_err());
    assert_eq!(responses(&h.provider, 1)[0].1, json!({ "result": "ok" }));
}

#[tokio::test]
async fn three_calls_keep_order_and_correlation() {
    let repo = Arc::new(
        MemoryRepo::new()
            .with_file("a.rs", "A")
            .with_file("b.rs", "B")
            .with_file("c.rs", "C"),
    );
    let h = harness(
        repo,
        vec![
            ScriptedTurn::tool_calls(vec![read("1", "a.rs"), read("2", "b.rs"), read("3", "c.rs")]),
            ScriptedTurn::text("All read."),
        ],
    );

    let items: Vec<String> = drain(h.engine.run(Conversation::shared(), user("read all"), None))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    let markers: Vec<&String> = items.iter().filter(|s| s.contains("Reading")).collect();
    assert_eq!(
        markers,
        vec![
            "\n\n> 🔧 Reading `a.rs`…\n\n",
            "\n\n> 🔧 Reading `b.rs`…\n\n",
            "\n\n> 🔧 Reading `c.rs`…\n\n",
        ]
    );
    assert_eq!(
        responses(&h.provider, 1),
        vec![
            ("1".to_string(), json!({ "content": "A" })),
            ("2".to_string(), json!({ "content": "B" })),
            ("3".to_string(), json!({ "content": "C" })),
        ]
    );
    assert_eq!(h.provider.request_count(), 2);
}

#[tokio::test]
async fn read_after_write_in_same_turn() {
    let repo = Arc::new(MemoryRepo::new().with_file("cfg.toml", "old = true"));
    let h = harness(
        repo.clone(),
        vec![
            ScriptedTurn::tool_calls(vec![
                ToolCall::new(
                    "w",
                    "update_file",
                    json!({ "path": "cfg.toml", "code": "new = true", "description": "flip" }),
                ),
                read("r", "cfg.toml"),
            ]),
            ScriptedTurn::text("ok"),
        ],
    );

    h.engine
        .run(Conversation::shared(), user("flip it"), None)
        .collect_text()
        .await
        .unwrap();
    assert_eq!(responses(&h.provider, 1)[1].1, json!({ "content": "new = true" }));
    assert_eq!(repo.fetch_count(), 0);
}

#[tokio::test]
async fn long_file_is_capped_at_30000_chars() {
    let body: String = "é".repeat(30_500);
    let repo = Arc::new(MemoryRepo::new().with_file("big.txt", &body));
    let h = harness(
        repo,
        vec![ScriptedTurn::tool_calls(vec![read("c1", "big.txt")]), ScriptedTurn::text("big")],
    );

    h.engine
        .run(Conversation::shared(), user("read it"), None)
        .collect_text()
        .await
        .unwrap();
    let content = responses(&h.provider, 1)[0].1["content"].as_str().unwrap().to_string();
    assert_eq!(content.chars().count(), 30_000);
    assert!(body.starts_with(&content));
}

#[tokio::test]
async fn unknown_tool_yields_error_and_loop_continues() {
    let h = harness(
        Arc::new(MemoryRepo::new()),
        vec![
            ScriptedTurn::tool_calls(vec![ToolCall::new("x", "run_shell", json!({ "cmd": "ls" }))]),
            ScriptedTurn::text("Sorry, I can't do that."),
        ],
    );

    let items: Vec<String> = drain(h.engine.run(Conversation::shared(), user("ls"), None))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(items[0], "\n\n> ⚠️ Unknown tool `run_shell`\n\n");
    assert_eq!(items[1], "Sorry, I can't do that.");
    assert_eq!(
        responses(&h.provider, 1),
        vec![("x".to_string(), json!({ "error": "unknown tool: run_shell" }))]
    );
}

#[tokio::test]
async fn failed_read_is_fed_back_not_fatal() {
    let h = harness(
        Arc::new(MemoryRepo::new()),
        vec![ScriptedTurn::tool_calls(vec![read("c1", "ghost.rs")]), ScriptedTurn::text("Not there.")],
    );

    let text = h
        .engine
        .run(Conversation::shared(), user("read ghost"), None)
        .collect_text()
        .await
        .unwrap();
    assert!(text.ends_with("Not there."));
    let (_, response) = &responses(&h.provider, 1)[0];
    assert!(response["error"].as_str().unwrap().contains("ghost.rs"));
}

// ============================================================================
// Failure and cancellation
// ============================================================================

#[tokio::test]
async fn transport_failure_preserves_history() {
    let repo = Arc::new(MemoryRepo::new().with_file("a.rs", "A"));
    let h = harness(
        repo,
        vec![
            ScriptedTurn::tool_calls(vec![read("c1", "a.rs")]),
            ScriptedTurn::Fail("connection reset".into()),
        ],
    );
    let conversation = Conversation::shared();

    let items = drain(h.engine.run(conversation.clone(), user("read a"), None)).await;
    assert_eq!(items.len(), 2);
    assert!(items[0].as_ref().unwrap().contains("Reading"));
    assert!(matches!(
        &items[1],
        Err(EngineError::Transport(LlmError::NetworkError(m))) if m == "connection reset"
    ));

    let conv = conversation.lock();
    let history = conv.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].text(), "read a");
    assert_eq!(history[1].role, Role::Model);
    assert!(history[2].is_tool_results());
    assert!(conv.awaits_model());
    assert!(conv.streaming_message().is_none());
}

#[tokio::test]
async fn stream_error_event_is_terminal() {
    let h = harness(
        Arc::new(MemoryRepo::new()),
        vec![ScriptedTurn::Events(vec![
            StreamEvent::TextDelta("partial".into()),
            StreamEvent::Error("overloaded".into()),
        ])],
    );
    let conversation = Conversation::shared();

    let err = h
        .engine
        .run(conversation.clone(), user("hi"), None)
        .collect_text()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Stream(ref m) if m == "overloaded"));
    // the partial reply stays visible but never enters history
    let conv = conversation.lock();
    assert_eq!(conv.messages()[1].text, "partial");
    assert_eq!(conv.history().len(), 1);
}

#[tokio::test]
async fn turn_limit_stops_runaway_loop() {
    let repo = Arc::new(MemoryRepo::new().with_file("a.rs", "A"));
    let h = harness_with(
        repo,
        vec![
            ScriptedTurn::tool_calls(vec![read("1", "a.rs")]),
            ScriptedTurn::tool_calls(vec![read("2", "a.rs")]),
            ScriptedTurn::tool_calls(vec![read("3", "a.rs")]),
        ],
        EngineConfig::default().with_max_turns(2),
    );

    let err = h
        .engine
        .run(Conversation::shared(), user("loop"), None)
        .collect_text()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TurnLimit(2)));
    assert_eq!(h.provider.request_count(), 2);
}

/// Repository whose content fetches wait for a signal.
struct GatedRepo {
    inner: MemoryRepo,
    gate: Arc<Notify>,
}

#[async_trait]
impl RepoSource for GatedRepo {
    fn name(&self) -> &str {
        "gated"
    }

    async fn fetch_tree(&self, repo: &RepoRef) -> RepoResult<Vec<TreeEntry>> {
        self.inner.fetch_tree(repo).await
    }

    async fn fetch_content(&self, repo: &RepoRef, path: &str) -> RepoResult<String> {
        self.gate.notified().await;
        self.inner.fetch_content(repo, path).await
    }

    async fn commit(&self, repo: &RepoRef, request: CommitRequest) -> RepoResult<CommitOutcome> {
        self.inner.commit(repo, request).await
    }
}

#[tokio::test]
async fn dropping_stream_stops_further_turns() {
    let gate = Arc::new(Notify::new());
    let repo = Arc::new(GatedRepo {
        inner: MemoryRepo::new().with_file("slow.rs", "S"),
        gate: gate.clone(),
    });
    let h = harness(
        repo,
        vec![
            ScriptedTurn::tool_calls(vec![read("c1", "slow.rs")]),
            ScriptedTurn::text("never sent"),
        ],
    );
    let conversation = Conversation::shared();

    let mut stream = h.engine.run(conversation.clone(), user("read slow"), None);
    let marker = stream.next().await.unwrap().unwrap();
    assert!(marker.contains("slow.rs"));

    let driver = stream.cancel();
    gate.notify_one();
    driver.await.unwrap();

    assert_eq!(h.provider.request_count(), 1);
    assert_eq!(h.provider.remaining(), 1);
    let conv = conversation.lock();
    assert_eq!(conv.history().len(), 1);
    assert!(conv.pending_calls().is_empty());
    assert!(conv.streaming_message().is_none());
}

#[tokio::test]
async fn paused_consumer_holds_back_tools_and_turns() {
    let repo = Arc::new(MemoryRepo::new().with_file("a.rs", "A"));
    let h = harness(
        repo.clone(),
        vec![
            ScriptedTurn::tool_calls(vec![read("c1", "a.rs")]),
            ScriptedTurn::tool_calls(vec![ToolCall::new(
                "u1",
                "update_file",
                json!({ "path": "a.rs", "code": "CLOBBERED", "description": "rewrite" }),
            )]),
            ScriptedTurn::text("Rewrote it."),
        ],
    );
    let conversation = Conversation::shared();

    let mut stream = h.engine.run(conversation.clone(), user("rewrite a"), None);
    let marker = stream.next().await.unwrap().unwrap();
    assert!(marker.contains("Reading `a.rs`"));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(h.provider.request_count(), 1);
    assert_eq!(repo.fetch_count(), 0);
    assert!(conversation.lock().pending_results().is_empty());
    assert!(!h.dispatcher.overlay().is_dirty("a.rs"));

    let rest: Vec<String> = stream.map(Result::unwrap).collect().await;
    assert_eq!(rest.last().unwrap(), "Rewrote it.");
    assert_eq!(h.provider.request_count(), 3);
    assert_eq!(h.dispatcher.overlay().get("a.rs").await.unwrap(), "CLOBBERED");
}

#[tokio::test]
async fn unpolled_stream_issues_no_request() {
    let h = harness(Arc::new(MemoryRepo::new()), vec![ScriptedTurn::text("Hi.")]);

    let stream = h.engine.run(Conversation::shared(), user("hello"), None);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.provider.request_count(), 0);

    assert_eq!(stream.collect_text().await.unwrap(), "Hi.");
    assert_eq!(h.provider.request_count(), 1);
}

#[tokio::test]
async fn retry_resends_unanswered_history() {
    let h = harness(
        Arc::new(MemoryRepo::new()),
        vec![ScriptedTurn::Fail("timeout".into()), ScriptedTurn::text("Hello!")],
    );
    let conversation = Conversation::shared();

    let err = h
        .engine
        .run(conversation.clone(), user("hi"), None)
        .collect_text()
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let text = h
        .engine
        .run(conversation.clone(), Vec::new(), None)
        .collect_text()
        .await
        .unwrap();
    assert_eq!(text, "Hello!");

    let requests = h.provider.requests();
    assert_eq!(requests[0].contents, requests[1].contents);
    assert_eq!(conversation.lock().history().len(), 2);
}
