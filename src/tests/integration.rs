//! End-to-end tests through `SyncClient`.

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::cache::NamespaceKey;
    use crate::config::SyncConfig;
    use crate::files::{FileStatusKind, Resolution};
    use crate::stream::Visibility;
    use crate::testing::{wait_until, FakeFileApi, FakeTranscriptApi, ScriptedSource};
    use crate::tests::notification_frame;
    use crate::SyncClient;

    fn client(source: &Arc<ScriptedSource>, files: &Arc<FakeFileApi>) -> SyncClient {
        SyncClient::with_parts(
            SyncConfig::default(),
            source.clone(),
            files.clone(),
            Arc::new(FakeTranscriptApi::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_write_conflicts_open_buffer_and_invalidates_queries() {
        let source = Arc::new(ScriptedSource::new());
        let files = Arc::new(FakeFileApi::new().with_file("notes/plan.md", "draft"));
        let client = client(&source, &files);

        client.queries().store(NamespaceKey::from(["files", "tree"]), json!(["notes/plan.md"]));
        client.files().open("notes/plan.md").await.unwrap();
        client.files().edit("notes/plan.md", "draft, revised").unwrap();

        let theirs = files.server_write("notes/plan.md", "rewritten elsewhere");
        source.push_open(vec![notification_frame(
            "file.modified",
            json!({ "path": "notes/plan.md", "mtime": theirs.as_str() }),
        )]);
        client.connect();

        wait_until(|| client.files().status("notes/plan.md") == Some(FileStatusKind::Conflict)).await;
        assert!(client.queries().get(&NamespaceKey::from(["files", "tree"])).unwrap().is_stale);
        assert_eq!(
            client.files().get("notes/plan.md").unwrap().content,
            "draft, revised"
        );

        let status = client
            .files()
            .resolve("notes/plan.md", Resolution::KeepMine)
            .await
            .unwrap();
        assert_eq!(status, FileStatusKind::Clean);
        assert_eq!(files.content("notes/plan.md").as_deref(), Some("draft, revised"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_round_trip_resyncs_queries() {
        let source = Arc::new(ScriptedSource::new());
        let files = Arc::new(FakeFileApi::new());
        let client = client(&source, &files);
        client.queries().store(NamespaceKey::from(["contacts"]), json!([]));

        source.push_open(vec![]);
        client.connect();
        wait_until(|| client.connection_state().connected).await;

        client.set_visibility(Visibility::Hidden);
        wait_until(|| client.connection_state().suspended).await;
        assert!(client.queries().stale_keys().is_empty());

        source.push_open(vec![]);
        client.set_visibility(Visibility::Visible);
        wait_until(|| client.connection_state().connected).await;
        assert_eq!(
            client.queries().stale_keys(),
            vec![NamespaceKey::from(["contacts"])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_the_connection() {
        let source = Arc::new(ScriptedSource::new());
        let files = Arc::new(FakeFileApi::new());
        let client = client(&source, &files);

        source.push_open(vec![]);
        client.connect();
        wait_until(|| source.live_streams() == 1).await;

        client.close();
        wait_until(|| source.live_streams() == 0).await;
        assert!(!client.connection_state().connected);
    }
}
