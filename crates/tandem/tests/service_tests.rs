//! Session service scenarios over scripted providers.

use serde_json::json;

use tandem::error::TandemError;
use tandem::runner::claude::protocol::ControlOut;
use tandem::runner::codex::events::{ItemStatus, ThreadEvent, ThreadItem, ThreadUsage};
use tandem::session::{ContinueRequest, StartRequest};
use tandem_protocol::{
    ContentBlock, PermissionDecision, Provider, ServerEvent, SessionStatus, StreamMessage,
};

mod common;
use common::{
    QueryStep, ThreadStep, collect, events_until, final_status, harness, held_turn, kinds,
    next_event, session_id_of, simple_turn,
};

fn start(title: &str, prompt: &str) -> StartRequest {
    StartRequest {
        title: title.to_string(),
        prompt: prompt.to_string(),
        cwd: Some("/work/app".to_string()),
        ..Default::default()
    }
}

fn tool_result_of(event: &ServerEvent) -> Option<(String, String, bool)> {
    let ServerEvent::StreamMessage {
        message: StreamMessage::User(user),
        ..
    } = event
    else {
        return None;
    };
    user.message.content.iter().find_map(|block| match block {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some((
            tool_use_id.clone(),
            ContentBlock::result_text(content),
            is_error.unwrap_or(false),
        )),
        _ => None,
    })
}

#[tokio::test]
async fn start_streams_canonical_events_in_order() {
    let h = harness(vec![simple_turn("tok-1", "hello there")], Vec::new()).await;

    let events = collect(h.service.start(start("Greeting", "say hi")).await.unwrap()).await;

    assert_eq!(
        kinds(&events),
        vec![
            "session.status",
            "stream.user_prompt",
            "stream.message:system",
            "stream.message:assistant",
            "stream.message:result",
            "session.status",
        ]
    );
    assert_eq!(events[0].status(), Some(SessionStatus::Running));
    assert_eq!(final_status(&events), SessionStatus::Completed);

    let session_id = session_id_of(&events);
    let session = h.service.get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.resume_token.as_deref(), Some("tok-1"));
    assert_eq!(session.last_prompt.as_deref(), Some("say hi"));

    let history = h.service.history(&session_id).await.unwrap();
    assert_eq!(history.messages.len(), 4);
    assert!(matches!(history.messages[0], StreamMessage::UserPrompt(_)));
    assert!(history.pending_permissions.is_empty());

    let requests = h.claude.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].resume, None);
    assert_eq!(requests[0].cwd.as_deref(), Some(std::path::Path::new("/work/app")));
}

#[tokio::test]
async fn start_rejects_missing_fields() {
    let h = harness(Vec::new(), Vec::new()).await;

    let err = h.service.start(start("  ", "prompt")).await.unwrap_err();
    assert!(matches!(err, TandemError::Validation(_)));
    let err = h.service.start(start("Title", "")).await.unwrap_err();
    assert!(matches!(err, TandemError::Validation(_)));

    assert!(h.service.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn continue_resumes_with_stored_token() {
    let h = harness(
        vec![simple_turn("tok-1", "first"), simple_turn("tok-1", "second")],
        Vec::new(),
    )
    .await;

    let events = collect(h.service.start(start("Chat", "one")).await.unwrap()).await;
    let session_id = session_id_of(&events);

    let events = collect(
        h.service
            .continue_session(ContinueRequest {
                prompt: "two".to_string(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(final_status(&events), SessionStatus::Completed);
    assert_eq!(session_id_of(&events), session_id);

    let requests = h.claude.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].resume.as_deref(), Some("tok-1"));
    assert_eq!(requests[1].prompt, "two");

    let history = h.service.history(&session_id).await.unwrap();
    assert_eq!(history.messages.len(), 8);
}

#[tokio::test]
async fn continue_by_resume_token_finds_session() {
    let h = harness(
        vec![simple_turn("tok-9", "first"), simple_turn("tok-9", "again")],
        Vec::new(),
    )
    .await;
    let first = collect(h.service.start(start("Chat", "one")).await.unwrap()).await;

    let events = collect(
        h.service
            .continue_session(ContinueRequest {
                prompt: "two".to_string(),
                resume_token: Some("tok-9".to_string()),
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(session_id_of(&events), session_id_of(&first));
}

#[tokio::test]
async fn continue_without_token_is_rejected() {
    let h = harness(
        vec![vec![QueryStep::Message(StreamMessage::result_success(
            None, None,
        ))]],
        Vec::new(),
    )
    .await;
    let events = collect(h.service.start(start("Chat", "one")).await.unwrap()).await;
    let session_id = session_id_of(&events);

    let err = h
        .service
        .continue_session(ContinueRequest {
            prompt: "two".to_string(),
            session_id: Some(session_id),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::Validation(_)));

    let err = h
        .service
        .continue_session(ContinueRequest {
            prompt: "two".to_string(),
            session_id: Some("missing".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::NotFound(_)));
}

#[tokio::test]
async fn permission_allow_lets_tool_run() {
    let h = harness(
        vec![vec![
            QueryStep::Message(StreamMessage::init("tok-1", None, None)),
            QueryStep::permission("toolu_1", "Bash", json!({"command": "ls"})),
            QueryStep::Message(StreamMessage::result_success(None, None)),
        ]],
        Vec::new(),
    )
    .await;
    let mut rx = h.service.start(start("Tools", "list files")).await.unwrap();

    let seen = events_until(&mut rx, |e| {
        matches!(e, ServerEvent::PermissionRequest { .. })
    })
    .await;
    let session_id = session_id_of(&seen);
    let Some(ServerEvent::PermissionRequest {
        tool_use_id,
        tool_name,
        input,
        ..
    }) = seen.last()
    else {
        unreachable!()
    };
    assert_eq!(tool_use_id, "toolu_1");
    assert_eq!(tool_name, "Bash");
    assert_eq!(input, &json!({"command": "ls"}));

    let pending = h.service.history(&session_id).await.unwrap().pending_permissions;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tool_use_id, "toolu_1");

    assert!(
        h.service
            .respond_permission(&session_id, "toolu_1", PermissionDecision::allow())
            .await
            .unwrap()
    );
    // Each slot resolves once.
    assert!(
        !h.service
            .respond_permission(&session_id, "toolu_1", PermissionDecision::allow())
            .await
            .unwrap()
    );

    let rest = collect(rx).await;
    let result = rest.iter().find_map(tool_result_of).unwrap();
    assert_eq!(result, ("toolu_1".to_string(), "ok".to_string(), false));
    assert_eq!(final_status(&rest), SessionStatus::Completed);

    let allowed = h.claude.control_messages().into_iter().any(|out| {
        matches!(out, ControlOut::PermissionResponse { decision, input, .. }
            if decision.is_allow() && input == json!({"command": "ls"}))
    });
    assert!(allowed);
}

#[tokio::test]
async fn permission_deny_reports_error_result() {
    let h = harness(
        vec![vec![
            QueryStep::Message(StreamMessage::init("tok-1", None, None)),
            QueryStep::permission("toolu_2", "Write", json!({"path": "/etc/hosts"})),
            QueryStep::Message(StreamMessage::result_success(None, None)),
        ]],
        Vec::new(),
    )
    .await;
    let mut rx = h.service.start(start("Tools", "edit hosts")).await.unwrap();
    let seen = events_until(&mut rx, |e| {
        matches!(e, ServerEvent::PermissionRequest { .. })
    })
    .await;
    let session_id = session_id_of(&seen);

    assert!(
        h.service
            .respond_permission(&session_id, "toolu_2", PermissionDecision::deny("not there"))
            .await
            .unwrap()
    );

    let rest = collect(rx).await;
    let (tool_use_id, text, is_error) = rest.iter().find_map(tool_result_of).unwrap();
    assert_eq!(tool_use_id, "toolu_2");
    assert_eq!(text, "not there");
    assert!(is_error);
    assert_eq!(final_status(&rest), SessionStatus::Completed);
}

#[tokio::test]
async fn stop_while_permission_pending_ends_idle() {
    let h = harness(
        vec![vec![
            QueryStep::Message(StreamMessage::init("tok-1", None, None)),
            QueryStep::permission("toolu_3", "Bash", json!({"command": "rm -rf build"})),
            QueryStep::Message(StreamMessage::assistant_text(None, "should never arrive")),
            QueryStep::Message(StreamMessage::result_success(None, None)),
        ]],
        Vec::new(),
    )
    .await;
    let mut rx = h.service.start(start("Cleanup", "clean")).await.unwrap();
    let seen = events_until(&mut rx, |e| {
        matches!(e, ServerEvent::PermissionRequest { .. })
    })
    .await;
    let session_id = session_id_of(&seen);

    assert!(h.service.stop(&session_id).await.unwrap());

    let rest = collect(rx).await;
    assert_eq!(kinds(&rest), vec!["session.status"]);
    assert_eq!(final_status(&rest), SessionStatus::Idle);

    // Stop is idempotent once the run is gone.
    assert!(!h.service.stop(&session_id).await.unwrap());
    assert!(
        !h.service
            .respond_permission(&session_id, "toolu_3", PermissionDecision::allow())
            .await
            .unwrap()
    );
    assert!(!h.service.controller().is_active(&session_id));

    let session = h.service.get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Idle);
    let history = h.service.history(&session_id).await.unwrap();
    assert!(history.pending_permissions.is_empty());
    assert!(
        h.claude
            .control_messages()
            .contains(&ControlOut::Interrupt)
    );
}

#[tokio::test]
async fn stop_held_run_by_external_id() {
    let h = harness(vec![held_turn("tok-1")], Vec::new()).await;
    let mut request = start("Long", "work");
    request.external_id = Some("ext-1".to_string());
    let mut rx = h.service.start(request).await.unwrap();
    let seen = events_until(&mut rx, |e| {
        matches!(e, ServerEvent::StreamMessage { .. })
    })
    .await;
    let session_id = session_id_of(&seen);

    assert!(h.service.controller().is_active("ext-1"));
    assert!(h.service.stop("ext-1").await.unwrap());

    let rest = collect(rx).await;
    assert_eq!(final_status(&rest), SessionStatus::Idle);
    assert!(!h.service.controller().is_active("ext-1"));

    // The token from the aborted run is kept for a later continue.
    let session = h.service.get(&session_id).await.unwrap();
    assert_eq!(session.resume_token.as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn second_run_on_active_session_conflicts() {
    let h = harness(vec![held_turn("tok-1")], Vec::new()).await;
    let mut request = start("Long", "work");
    request.external_id = Some("ext-2".to_string());
    let mut rx = h.service.start(request.clone()).await.unwrap();
    let seen = events_until(&mut rx, |e| {
        matches!(e, ServerEvent::StreamMessage { .. })
    })
    .await;
    let session_id = session_id_of(&seen);

    let err = h.service.start(request).await.unwrap_err();
    assert!(matches!(err, TandemError::Conflict(_)));

    let err = h
        .service
        .continue_session(ContinueRequest {
            prompt: "more".to_string(),
            session_id: Some(session_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::Conflict(_)));

    assert!(h.service.stop(&session_id).await.unwrap());
    assert_eq!(final_status(&collect(rx).await), SessionStatus::Idle);
}

#[tokio::test]
async fn external_id_is_unique_across_sessions() {
    let h = harness(vec![simple_turn("tok-1", "done")], Vec::new()).await;
    let mut request = start("First", "go");
    request.external_id = Some("ext-3".to_string());
    collect(h.service.start(request.clone()).await.unwrap()).await;

    let err = h.service.start(request).await.unwrap_err();
    assert!(matches!(err, TandemError::Validation(_)));
}

#[tokio::test]
async fn delete_stops_active_run_first() {
    let h = harness(vec![held_turn("tok-1")], Vec::new()).await;
    let mut rx = h.service.start(start("Doomed", "work")).await.unwrap();
    let seen = events_until(&mut rx, |e| {
        matches!(e, ServerEvent::StreamMessage { .. })
    })
    .await;
    let session_id = session_id_of(&seen);

    h.service.delete(&session_id).await.unwrap();

    assert!(!h.service.controller().is_active(&session_id));
    assert!(matches!(
        h.service.get(&session_id).await,
        Err(TandemError::NotFound(_))
    ));
    assert!(h.service.list().await.unwrap().is_empty());
    assert_eq!(final_status(&collect(rx).await), SessionStatus::Idle);

    assert!(matches!(
        h.service.delete(&session_id).await,
        Err(TandemError::NotFound(_))
    ));
}

#[tokio::test]
async fn provider_start_failure_ends_in_error() {
    // No script queued: the transport refuses to open.
    let h = harness(Vec::new(), Vec::new()).await;

    let events = collect(h.service.start(start("Broken", "go")).await.unwrap()).await;
    assert_eq!(
        kinds(&events),
        vec![
            "session.status",
            "stream.user_prompt",
            "runner.error",
            "session.status"
        ]
    );
    let Some(ServerEvent::SessionStatus { status, error, .. }) = events.last() else {
        unreachable!()
    };
    assert_eq!(*status, SessionStatus::Error);
    assert!(error.as_deref().unwrap().contains("no scripted query left"));
    assert!(!h.service.controller().is_active(&session_id_of(&events)));
}

#[tokio::test]
async fn error_result_ends_in_error() {
    let h = harness(
        vec![vec![
            QueryStep::Message(StreamMessage::init("tok-1", None, None)),
            QueryStep::Message(StreamMessage::result_error(None, "rate limited")),
        ]],
        Vec::new(),
    )
    .await;

    let events = collect(h.service.start(start("Busy", "go")).await.unwrap()).await;
    let Some(ServerEvent::SessionStatus { status, error, .. }) = events.last() else {
        unreachable!()
    };
    assert_eq!(*status, SessionStatus::Error);
    assert_eq!(error.as_deref(), Some("rate limited"));
}

#[tokio::test]
async fn stream_ending_without_result_is_an_error() {
    let h = harness(
        vec![vec![QueryStep::Message(StreamMessage::init(
            "tok-1", None, None,
        ))]],
        Vec::new(),
    )
    .await;

    let events = collect(h.service.start(start("Crash", "go")).await.unwrap()).await;
    assert_eq!(final_status(&events), SessionStatus::Error);
}

fn codex_turn(thread_id: &str) -> Vec<ThreadStep> {
    vec![
        ThreadStep::Event(ThreadEvent::ThreadStarted {
            thread_id: thread_id.to_string(),
        }),
        ThreadStep::Event(ThreadEvent::TurnStarted),
        ThreadStep::Event(ThreadEvent::ItemStarted {
            item: ThreadItem::CommandExecution {
                id: "cmd_1".to_string(),
                command: "echo hi".to_string(),
                aggregated_output: String::new(),
                exit_code: None,
                status: ItemStatus::InProgress,
            },
        }),
        ThreadStep::Event(ThreadEvent::ItemCompleted {
            item: ThreadItem::CommandExecution {
                id: "cmd_1".to_string(),
                command: "echo hi".to_string(),
                aggregated_output: "hi".to_string(),
                exit_code: Some(0),
                status: ItemStatus::Completed,
            },
        }),
        ThreadStep::Event(ThreadEvent::ItemCompleted {
            item: ThreadItem::AgentMessage {
                id: "msg_1".to_string(),
                text: "Printed hi.".to_string(),
            },
        }),
        ThreadStep::Event(ThreadEvent::TurnCompleted {
            usage: Some(ThreadUsage {
                input_tokens: 10,
                cached_input_tokens: 0,
                output_tokens: 5,
            }),
        }),
    ]
}

#[tokio::test]
async fn codex_turn_is_translated_and_resumable() {
    let h = harness(Vec::new(), vec![codex_turn("th_1"), codex_turn("th_1")]).await;
    let mut request = start("Shell", "print hi");
    request.provider = Provider::Codex;

    let events = collect(h.service.start(request).await.unwrap()).await;
    assert_eq!(
        kinds(&events),
        vec![
            "session.status",
            "stream.user_prompt",
            "stream.message:system",
            "stream.message:assistant",
            "stream.message:user",
            "stream.message:assistant",
            "stream.message:result",
            "session.status",
        ]
    );
    let (tool_use_id, text, is_error) = events.iter().find_map(tool_result_of).unwrap();
    assert_eq!(tool_use_id, "cmd_1");
    assert_eq!(text, "Exit code: 0\nhi");
    assert!(!is_error);
    assert_eq!(final_status(&events), SessionStatus::Completed);

    let session_id = session_id_of(&events);
    let session = h.service.get(&session_id).await.unwrap();
    assert_eq!(session.provider, Provider::Codex);
    assert_eq!(session.resume_token.as_deref(), Some("th_1"));

    collect(
        h.service
            .continue_session(ContinueRequest {
                prompt: "again".to_string(),
                session_id: Some(session_id),
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    let requests = h.codex.requests();
    assert_eq!(requests[0].thread_id, None);
    assert_eq!(requests[1].thread_id.as_deref(), Some("th_1"));
}

#[tokio::test]
async fn codex_stop_ends_idle() {
    let h = harness(
        Vec::new(),
        vec![vec![
            ThreadStep::Event(ThreadEvent::ThreadStarted {
                thread_id: "th_2".to_string(),
            }),
            ThreadStep::Hold,
        ]],
    )
    .await;
    let mut request = start("Shell", "wait");
    request.provider = Provider::Codex;
    let mut rx = h.service.start(request).await.unwrap();
    let seen = events_until(&mut rx, |e| {
        matches!(e, ServerEvent::StreamMessage { .. })
    })
    .await;

    assert!(h.service.stop(&session_id_of(&seen)).await.unwrap());
    assert_eq!(final_status(&collect(rx).await), SessionStatus::Idle);
}

#[tokio::test]
async fn codex_turn_failure_ends_in_error() {
    let h = harness(
        Vec::new(),
        vec![vec![
            ThreadStep::Event(ThreadEvent::ThreadStarted {
                thread_id: "th_3".to_string(),
            }),
            ThreadStep::Event(ThreadEvent::TurnFailed {
                error: tandem::runner::codex::events::ThreadError {
                    message: "model overloaded".to_string(),
                },
            }),
        ]],
    )
    .await;
    let mut request = start("Shell", "go");
    request.provider = Provider::Codex;

    let events = collect(h.service.start(request).await.unwrap()).await;
    let Some(ServerEvent::SessionStatus { status, error, .. }) = events.last() else {
        unreachable!()
    };
    assert_eq!(*status, SessionStatus::Error);
    assert_eq!(error.as_deref(), Some("model overloaded"));
}

#[tokio::test]
async fn hub_sees_every_run_event() {
    let h = harness(vec![simple_turn("tok-1", "hi")], Vec::new()).await;
    let mut feed = h.service.subscribe();

    let events = collect(h.service.start(start("Watched", "go")).await.unwrap()).await;

    let first = tokio::time::timeout(common::WAIT, feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, ServerEvent::SessionList { ref sessions } if sessions.len() == 1));

    let mut observed = Vec::new();
    for _ in 0..events.len() {
        observed.push(
            tokio::time::timeout(common::WAIT, feed.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert_eq!(observed, events);
}

#[tokio::test]
async fn recent_cwds_are_distinct_and_limited() {
    let h = harness(
        vec![
            simple_turn("t1", "a"),
            simple_turn("t2", "b"),
            simple_turn("t3", "c"),
        ],
        Vec::new(),
    )
    .await;
    for cwd in ["/a", "/b", "/a"] {
        let mut request = start("Dir", "go");
        request.cwd = Some(cwd.to_string());
        collect(h.service.start(request).await.unwrap()).await;
    }

    let cwds = h.service.recent_cwds(10).await.unwrap();
    assert_eq!(cwds.len(), 2);
    assert!(cwds.contains(&"/a".to_string()));
    assert!(cwds.contains(&"/b".to_string()));
    assert_eq!(h.service.recent_cwds(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn next_event_after_terminal_is_end_of_stream() {
    let h = harness(vec![simple_turn("tok-1", "hi")], Vec::new()).await;
    let mut rx = h.service.start(start("Once", "go")).await.unwrap();
    events_until(&mut rx, ServerEvent::is_terminal_status).await;
    assert!(next_event(&mut rx).await.is_none());
}

#[tokio::test]
async fn concurrent_starts_bind_external_id_once() {
    let scripts = (0..20)
        .map(|round| simple_turn(&format!("tok-{round}"), "hi"))
        .collect();
    let h = harness(scripts, Vec::new()).await;

    for round in 0..20 {
        let mut request = start("Race", "go");
        request.external_id = Some(format!("ext-race-{round}"));
        let (a, b) = tokio::join!(
            h.service.start(request.clone()),
            h.service.start(request)
        );

        let mut streams = Vec::new();
        let mut errors = Vec::new();
        for result in [a, b] {
            match result {
                Ok(rx) => streams.push(rx),
                Err(e) => errors.push(e),
            }
        }
        assert_eq!(streams.len(), 1, "round {round}: {errors:?}");
        assert!(
            matches!(
                errors[0],
                TandemError::Validation(_) | TandemError::Conflict(_)
            ),
            "round {round}: {:?}",
            errors[0]
        );
        let events = collect(streams.pop().unwrap()).await;
        assert_eq!(final_status(&events), SessionStatus::Completed);
    }
    assert_eq!(h.service.list().await.unwrap().len(), 20);
}

#[tokio::test]
async fn stop_after_result_before_finish_ends_idle() {
    let h = harness(
        vec![vec![
            QueryStep::Message(StreamMessage::init("tok-1", None, None)),
            QueryStep::Message(StreamMessage::result_success(None, None)),
            QueryStep::Delay(std::time::Duration::from_millis(300)),
        ]],
        Vec::new(),
    )
    .await;
    let mut rx = h.service.start(start("Late", "go")).await.unwrap();
    let seen = events_until(&mut rx, |e| {
        matches!(
            e,
            ServerEvent::StreamMessage {
                message: StreamMessage::Result(_),
                ..
            }
        )
    })
    .await;
    let session_id = session_id_of(&seen);

    // The provider already reported success; the run is not finished yet.
    assert!(h.service.stop(&session_id).await.unwrap());

    assert_eq!(final_status(&collect(rx).await), SessionStatus::Idle);
    let session = h.service.get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Idle);
}

#[tokio::test]
async fn unrecorded_messages_are_not_announced() {
    let h = harness(
        vec![vec![
            QueryStep::Message(StreamMessage::init("tok-1", None, None)),
            QueryStep::Delay(std::time::Duration::from_millis(300)),
            QueryStep::Message(StreamMessage::assistant_text(None, "lost")),
            QueryStep::Message(StreamMessage::result_success(None, None)),
        ]],
        Vec::new(),
    )
    .await;
    let mut rx = h.service.start(start("Broken store", "go")).await.unwrap();
    events_until(&mut rx, |e| matches!(e, ServerEvent::StreamMessage { .. })).await;

    sqlx::query("DROP TABLE messages")
        .execute(h.database.pool())
        .await
        .unwrap();

    let rest = collect(rx).await;
    assert_eq!(
        kinds(&rest),
        vec!["runner.error", "runner.error", "session.status"]
    );
    let ServerEvent::RunnerError { message, .. } = &rest[0] else {
        unreachable!()
    };
    assert!(message.starts_with("failed to persist message"));
}
