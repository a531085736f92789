// tests/sync_integration_test.rs
//! Sync client integration tests over the public API.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;

use common::{ChannelSource, MemoryFileApi, MemoryTranscriptApi};
use livesync_lib::cache::NamespaceKey;
use livesync_lib::files::FileStatusKind;
use livesync_lib::stream::SseEvent;
use livesync_lib::transcript::TranscriptEvent;
use livesync_lib::{SyncClient, SyncConfig};

fn notification(kind: &str, data: serde_json::Value) -> SseEvent {
    SseEvent::message(json!({ "type": kind, "data": data }).to_string())
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn notifications_reach_subscribers_cache_and_open_files() {
    let source = Arc::new(ChannelSource::new());
    let files = Arc::new(MemoryFileApi::new());
    files.write("todo.md", "- milk").await;

    let client = SyncClient::with_parts(
        SyncConfig::default(),
        source.clone(),
        files.clone(),
        Arc::new(MemoryTranscriptApi::new()),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = client.bus().subscribe("duty.*", move |event| {
        sink.lock().unwrap().push(event.kind.clone());
    });

    client.queries().store(NamespaceKey::from(["calendar", "week"]), json!([]));
    client.files().open("todo.md").await.expect("file should open");

    let frames = source.accept().await;
    client.connect();
    eventually(|| client.connection_state().connected).await;

    frames.send(Ok(notification("duty.scheduled", json!({ "id": 4 })))).unwrap();
    let revision = files.write("todo.md", "- milk\n- eggs").await;
    frames
        .send(Ok(notification(
            "file.modified",
            json!({ "path": "todo.md", "mtime": revision.as_str() }),
        )))
        .unwrap();

    eventually(|| {
        client
            .files()
            .get("todo.md")
            .map(|record| record.content == "- milk\n- eggs")
            .unwrap_or(false)
    })
    .await;

    assert_eq!(*seen.lock().unwrap(), vec!["duty.scheduled".to_string()]);
    assert!(client.queries().get(&NamespaceKey::from(["calendar", "week"])).unwrap().is_stale);
    assert_eq!(client.files().status("todo.md"), Some(FileStatusKind::Clean));
    assert_eq!(source.requests().await[0].path, "/api/events");
}

#[tokio::test(start_paused = true)]
async fn conversation_resumes_from_cursor_after_drop() {
    let source = Arc::new(ChannelSource::new());
    let transcripts = Arc::new(MemoryTranscriptApi::new());
    transcripts.push("c-7", TranscriptEvent::new("e1", "user_message")).await;

    let client = SyncClient::with_parts(
        SyncConfig::default(),
        source.clone(),
        Arc::new(MemoryFileApi::new()),
        transcripts.clone(),
    );

    let first = source.accept().await;
    let stream = client.transcripts().watch("c-7");
    let live = |id: &str| {
        SseEvent::named(
            "transcript",
            json!({ "id": id, "type": "assistant_message" }).to_string(),
        )
    };
    first.send(Ok(live("e2"))).unwrap();
    eventually(|| client.transcripts().cache().cursor("c-7").as_deref() == Some("e2")).await;

    let second = source.accept().await;
    drop(first);
    second.send(Ok(live("e2"))).unwrap();
    second.send(Ok(live("e3"))).unwrap();
    eventually(|| client.transcripts().cache().cursor("c-7").as_deref() == Some("e3")).await;

    let log = client.transcripts().cache().get("c-7").unwrap();
    assert_eq!(log.ids(), vec!["e1", "e2", "e3"]);

    let requests = source.requests().await;
    assert_eq!(requests[0].path, "/api/conversations/c-7/stream");
    assert_eq!(requests[0].query_value("after"), Some("e1"));
    assert_eq!(requests[1].query_value("after"), Some("e2"));
    drop(stream);
}
