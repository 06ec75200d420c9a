//! Session manager behavior: counters, caps, eviction, sweep, shutdown.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

mod common;
use common::{StubRuntime, test_app, test_app_with};

use claude_broker::maintenance;
use claude_broker::session::{CreateSessionRequest, SessionError};

fn create_request(user_id: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        user_id: user_id.to_string(),
        ..Default::default()
    }
}

/// Property: message_count after N successful chats equals N.
#[tokio::test]
async fn test_message_count_tracks_turns() {
    let app = test_app().await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    for _ in 0..5 {
        app.manager.chat(&info.session_id, "hi").await.unwrap();
    }

    let info = app.manager.get(&info.session_id).await.unwrap();
    assert_eq!(info.message_count, 5);
}

/// Property: a burst of concurrent chats admits exactly one turn.
#[tokio::test]
async fn test_chat_burst_admits_exactly_one() {
    let app = test_app_with(
        StubRuntime::new().with_turn_delay(Duration::from_millis(150)),
        |_| {},
    )
    .await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let manager = app.manager.clone();
        let session_id = info.session_id.clone();
        tasks.push(tokio::spawn(async move {
            manager.chat(&session_id, "hi").await
        }));
    }

    let mut ok = 0;
    let mut busy = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(SessionError::Busy(_)) => busy += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(busy, 4);

    let info = app.manager.get(&info.session_id).await.unwrap();
    assert_eq!(info.message_count, 1);
}

/// Property: the live client count never exceeds max_sessions.
#[tokio::test]
async fn test_max_sessions_cap() {
    let app = test_app_with(StubRuntime::new(), |config| {
        config.limits.max_sessions = 2;
    })
    .await;

    app.manager.create(create_request("alice")).await.unwrap();
    app.manager.create(create_request("bob")).await.unwrap();
    assert_eq!(app.manager.live_count().await, 2);

    let err = app.manager.create(create_request("carol")).await.unwrap_err();
    assert!(matches!(err, SessionError::Overloaded(_)), "{err}");
    assert_eq!(app.manager.live_count().await, 2);
}

/// Concurrent creates for one user cannot slip under the quota together.
#[tokio::test]
async fn test_concurrent_creates_respect_quota() {
    let app = test_app_with(StubRuntime::new(), |config| {
        config.limits.max_sessions_per_user = 2;
    })
    .await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = app.manager.clone();
        tasks.push(tokio::spawn(
            async move { manager.create(create_request("carol")).await },
        ));
    }

    let mut ok = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(SessionError::QuotaExceeded(_)) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(refused, 2);
    assert_eq!(app.manager.live_count().await, 2);
}

/// Property: close is idempotent; the second close reports NotFound and no
/// subprocess survives.
#[tokio::test]
async fn test_close_idempotent() {
    let app = test_app().await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    app.manager.close(&info.session_id).await.unwrap();
    let err = app.manager.close(&info.session_id).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    assert_eq!(app.runtime.open_client_count(), 0);

    // The slot is free again for the user.
    app.manager.create(create_request("alice")).await.unwrap();
}

/// Closing a session with a turn in flight waits for the turn.
#[tokio::test]
async fn test_close_waits_for_in_flight_turn() {
    let app = test_app_with(
        StubRuntime::new().with_turn_delay(Duration::from_millis(150)),
        |_| {},
    )
    .await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    let manager = app.manager.clone();
    let session_id = info.session_id.clone();
    let chat = tokio::spawn(async move { manager.chat(&session_id, "hi").await });

    // Give the chat a head start so it owns the session lock.
    tokio::time::sleep(Duration::from_millis(30)).await;
    app.manager.close(&info.session_id).await.unwrap();

    // The turn completed rather than being severed.
    chat.await.unwrap().unwrap();
}

/// TTL sweep removes expired metadata and closes the live client.
#[tokio::test]
async fn test_ttl_sweep_closes_live_client() {
    let app = test_app_with(StubRuntime::new(), |config| {
        config.storage.ttl_seconds = 1;
    })
    .await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    // Age the record past the TTL instead of sleeping through it.
    let mut record = app
        .manager
        .store()
        .get(&info.session_id)
        .await
        .unwrap()
        .unwrap();
    record.last_active_at = Utc::now() - chrono::Duration::seconds(5);
    app.manager.store().save(&record).await.unwrap();

    maintenance::run_cycle(&app.manager).await;

    let err = app.manager.get(&info.session_id).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
    assert_eq!(app.manager.live_count().await, 0);
    assert_eq!(app.runtime.open_client_count(), 0);
}

/// Idle clients are evicted by the maintenance cycle; metadata survives.
#[tokio::test]
async fn test_idle_eviction_keeps_metadata() {
    let app = test_app_with(StubRuntime::new(), |config| {
        config.limits.idle_session_timeout_seconds = 1;
        config.storage.ttl_seconds = 0;
    })
    .await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    maintenance::run_cycle(&app.manager).await;

    assert_eq!(app.manager.live_count().await, 0);
    assert_eq!(app.runtime.open_client_count(), 0);
    // Still resumable.
    let got = app.manager.get(&info.session_id).await.unwrap();
    assert_eq!(got.session_id, info.session_id);
    app.manager.resume(&info.session_id).await.unwrap();
    assert_eq!(app.manager.live_count().await, 1);
}

/// Memory pressure evicts the least-recently-used idle client to admit a
/// new one.
#[tokio::test]
async fn test_pressure_recovery_evicts_lru() {
    let per_client_mb: u64 = 10;
    let self_mb = claude_broker::agent::rss::self_rss_bytes() / (1024 * 1024);

    let app = test_app_with(
        StubRuntime::new().with_rss_bytes(per_client_mb * 1024 * 1024),
        move |config| {
            // Headroom for one client beyond the broker itself, plus slack
            // for broker growth during the test.
            config.limits.memory_limit_mb = self_mb + per_client_mb + per_client_mb / 2;
        },
    )
    .await;

    // Admission samples current RSS: the first two creates pass (the
    // ceiling is crossed only once both clients are live), the third
    // triggers pressure recovery.
    let first = app.manager.create(create_request("alice")).await.unwrap();
    let second = app.manager.create(create_request("bob")).await.unwrap();
    let third = app.manager.create(create_request("carol")).await.unwrap();

    assert_eq!(app.manager.live_count().await, 2);
    let live: Vec<String> = app
        .manager
        .live_by_last_used()
        .await
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert!(!live.contains(&first.session_id), "LRU client not evicted");
    assert!(live.contains(&third.session_id));

    // Evicted metadata survives and stays resumable.
    assert!(app.manager.get(&first.session_id).await.is_ok());
    assert!(app.manager.get(&second.session_id).await.is_ok());
}

/// Streaming consumer disconnect does not cancel the turn (S6).
#[tokio::test]
async fn test_disconnect_does_not_cancel_turn() {
    let app = test_app_with(
        StubRuntime::new().with_turn_delay(Duration::from_millis(100)),
        |_| {},
    )
    .await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    let records = app
        .manager
        .chat_stream(&info.session_id, "hi")
        .await
        .unwrap();
    drop(records); // client went away

    // The turn still runs to completion server-side.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let info = app.manager.get(&info.session_id).await.unwrap();
        if info.message_count == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "turn never completed after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(app.manager.live_count().await, 1);
    assert_eq!(app.runtime.open_client_count(), 1);
}

/// A turn that stalls past the timeout ends with error + done and evicts
/// the wedged client.
#[tokio::test]
async fn test_turn_stall_timeout() {
    // A turn script that never reaches Done.
    let stalling_turn = vec![claude_broker::agent::AgentEvent::TextDelta {
        text: "starting...".to_string(),
    }];

    let app = test_app_with(StubRuntime::new().with_turn(stalling_turn), |config| {
        config.limits.turn_timeout_seconds = 1;
    })
    .await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    let mut records = app
        .manager
        .chat_stream(&info.session_id, "hi")
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(record) = records.recv().await {
        seen.push(serde_json::to_value(&record).unwrap());
    }

    assert_eq!(seen.last().unwrap()["type"], "done");
    let error = seen
        .iter()
        .find(|record| record["type"] == "error")
        .expect("expected an error record");
    assert_eq!(error["kind"], "internal");

    // The wedged client was evicted and closed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while app.runtime.open_client_count() != 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(app.manager.live_count().await, 0);
}

/// In-stream agent failures surface as error records; the turn still
/// completes and is counted.
#[tokio::test]
async fn test_agent_failure_completes_turn() {
    use claude_broker::agent::{AgentErrorKind, AgentEvent};

    let failing_turn = vec![
        AgentEvent::TextDelta {
            text: "partial".to_string(),
        },
        AgentEvent::Error {
            kind: AgentErrorKind::BudgetExceeded,
            detail: "budget limit reached".to_string(),
        },
        AgentEvent::Done,
    ];

    let app = test_app_with(StubRuntime::new().with_turn(failing_turn), |_| {}).await;
    let info = app.manager.create(create_request("alice")).await.unwrap();

    let mut records = app
        .manager
        .chat_stream(&info.session_id, "hi")
        .await
        .unwrap();
    let mut kinds = Vec::new();
    while let Some(record) = records.recv().await {
        kinds.push(serde_json::to_value(&record).unwrap()["type"]
            .as_str()
            .unwrap()
            .to_string());
    }
    assert_eq!(kinds, vec!["text_delta", "error", "done"]);

    let info = app.manager.get(&info.session_id).await.unwrap();
    assert_eq!(info.message_count, 1);
}

/// Shutdown closes every live client.
#[tokio::test]
async fn test_shutdown_closes_fleet() {
    let app = test_app().await;
    for user in ["alice", "bob", "carol"] {
        app.manager.create(create_request(user)).await.unwrap();
    }
    assert_eq!(app.manager.live_count().await, 3);

    app.manager.shutdown().await;
    assert_eq!(app.manager.live_count().await, 0);
    assert_eq!(app.runtime.open_client_count(), 0);
}

/// The streaming and synchronous paths agree on the same event script.
#[tokio::test]
async fn test_sync_equals_streaming_accumulation() {
    let app = test_app().await;
    let sync_info = app.manager.create(create_request("alice")).await.unwrap();
    let stream_info = app.manager.create(create_request("bob")).await.unwrap();

    let sync = app.manager.chat(&sync_info.session_id, "hi").await.unwrap();

    let mut records = app
        .manager
        .chat_stream(&stream_info.session_id, "hi")
        .await
        .unwrap();
    let mut text = String::new();
    let mut tool_calls: Vec<(String, serde_json::Value)> = Vec::new();
    while let Some(record) = records.recv().await {
        let value = serde_json::to_value(&record).unwrap();
        match value["type"].as_str().unwrap() {
            "text_delta" => text.push_str(value["text"].as_str().unwrap()),
            "tool_use" => tool_calls.push((
                value["tool_name"].as_str().unwrap().to_string(),
                value["tool_input"].clone(),
            )),
            _ => {}
        }
    }

    assert_eq!(sync.text, text);
    assert_eq!(sync.tool_calls.len(), tool_calls.len());
    for (call, (name, input)) in sync.tool_calls.iter().zip(&tool_calls) {
        assert_eq!(&call.name, name);
        assert_eq!(&call.input, input);
    }
}

/// Metadata round-trips verbatim through create.
#[tokio::test]
async fn test_metadata_stored_verbatim() {
    let app = test_app().await;
    let request = CreateSessionRequest {
        user_id: "alice".to_string(),
        metadata: Some(json!({"team": "infra", "priority": 3})),
        ..Default::default()
    };
    let info = app.manager.create(request).await.unwrap();
    assert_eq!(info.metadata, json!({"team": "infra", "priority": 3}));

    let got = app.manager.get(&info.session_id).await.unwrap();
    assert_eq!(got.metadata, json!({"team": "infra", "priority": 3}));
}
