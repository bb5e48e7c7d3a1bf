use local_store_persister::{
    CleanupOutcome, LocalFileIo, MemoryStore, PersistContext, PersisterSet, Row, SyncSettings, TableStore, WatchHub,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().expect("object row")
}

fn context(data_dir: &Path, hub_capacity: usize) -> (PersistContext, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let ctx = PersistContext::new(
        store.clone(),
        Arc::new(LocalFileIo::new()),
        Arc::new(SyncSettings::new(data_dir)),
        WatchHub::new(hub_capacity),
    );
    (ctx, store)
}

fn human(name: &str, memo: &str) -> Row {
    row(json!({
        "user_id": "u1",
        "name": name,
        "email": format!("{}@example.com", name.to_lowercase()),
        "org_id": "o1",
        "pinned": false,
        "memo": memo
    }))
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn every_entity_kind_round_trips_through_disk() {
    let root = tempfile::tempdir().expect("temp dir");
    let (ctx, store) = context(root.path(), 64);
    store.set_row("humans", "h1", human("Ada", "Met at the offsite.\n\nFollow up."));
    store.set_row("organizations", "o1", row(json!({ "user_id": "u1", "name": "Acme" })));
    store.set_row(
        "chat_shortcuts",
        "s1",
        row(json!({ "user_id": "u1", "title": "Summarize", "content": "Summarize this meeting" })),
    );
    store.set_row("chat_groups", "g1", row(json!({ "user_id": "u1", "title": "Planning" })));
    store.set_row(
        "chat_messages",
        "m1",
        row(json!({ "chat_group_id": "g1", "role": "user", "content": "hi", "created_at": "2024-01-01" })),
    );
    store.set_row(
        "sessions",
        "s1",
        row(json!({ "title": "Standup", "created_at": "2024-01-01", "folder_id": "work", "raw_md": "my notes" })),
    );
    store.set_row("transcripts", "t1", row(json!({ "session_id": "s1", "started_at": 0 })));
    store.set_row(
        "enhanced_notes",
        "n1",
        row(json!({ "session_id": "s1", "title": "Summary", "content": "Shipped the release" })),
    );
    store.set_row(
        "calendars",
        "c1",
        row(json!({
            "user_id": "u1",
            "tracking_id_calendar": "primary",
            "name": "Work",
            "created_at": "2024-01-01",
            "enabled": true,
            "provider": "google"
        })),
    );

    let reports = PersisterSet::new(&ctx).save_all().await;
    assert!(reports.iter().all(|report| report.is_success()));

    let (fresh_ctx, fresh_store) = context(root.path(), 64);
    assert_eq!(PersisterSet::new(&fresh_ctx).load_all().await, 6);
    assert_eq!(fresh_store.tables(), store.tables());
}

#[tokio::test]
async fn external_delete_propagates_to_the_store() {
    let root = tempfile::tempdir().expect("temp dir");
    let (ctx, store) = context(root.path(), 64);
    let hub = ctx.watch_hub.clone();
    store.set_row("humans", "h1", human("Ada", ""));
    store.set_row("humans", "h2", human("Grace", ""));
    let set = PersisterSet::new(&ctx);
    set.humans.save(None).await;

    let auto = set.humans.start_auto_persisting().await;
    assert!(auto.is_watching());

    std::fs::remove_file(root.path().join("humans").join("h1.md")).expect("remove h1");
    hub.notify("humans/h1.md");
    eventually("h1 removal", || !store.has_row("humans", "h1")).await;
    assert!(store.has_row("humans", "h2"));

    std::fs::write(
        root.path().join("humans").join("h3.md"),
        "---\nuser_id: u1\nname: Linus\n---\n\nNew contact",
    )
    .expect("write h3");
    hub.notify("humans/h3.md");
    eventually("h3 load", || store.has_row("humans", "h3")).await;
    assert_eq!(store.row("humans", "h3").expect("h3")["memo"], "New contact");
    auto.stop();
}

#[tokio::test]
async fn burst_of_external_writes_converges_after_lost_events() {
    let root = tempfile::tempdir().expect("temp dir");
    let (ctx, store) = context(root.path(), 4);
    let hub = ctx.watch_hub.clone();
    let set = PersisterSet::new(&ctx);
    let auto = set.humans.start_auto_persisting().await;

    let dir = root.path().join("humans");
    std::fs::create_dir_all(&dir).expect("create humans");
    for index in 0..50 {
        std::fs::write(
            dir.join(format!("h{index}.md")),
            format!("---\nuser_id: u1\nname: Person {index}\n---\n\nnote {index}"),
        )
        .expect("write human");
        hub.notify(format!("humans/h{index}.md"));
    }

    eventually("all 50 humans", || store.row_ids("humans").len() == 50).await;
    assert_eq!(store.row("humans", "h49").expect("h49")["memo"], "note 49");
    auto.stop();
}

#[tokio::test]
async fn local_edits_are_saved_and_deleted_files_stay_deleted() {
    let root = tempfile::tempdir().expect("temp dir");
    let (ctx, store) = context(root.path(), 64);
    let set = PersisterSet::new(&ctx);
    let auto = set.organizations.start_auto_persisting().await;

    store.set_row("organizations", "o1", row(json!({ "user_id": "u1", "name": "Acme" })));
    store.set_row("organizations", "o2", row(json!({ "user_id": "u1", "name": "Initech" })));
    let o1 = root.path().join("organizations").join("o1.md");
    let o2 = root.path().join("organizations").join("o2.md");
    eventually("both organizations saved", || o1.exists() && o2.exists()).await;

    store.delete_row("organizations", "o1");
    eventually("o1 deleted", || !o1.exists()).await;
    assert!(o2.exists());
    auto.stop();
}

#[tokio::test]
async fn safeguard_protects_disk_when_the_store_is_mostly_empty() {
    let root = tempfile::tempdir().expect("temp dir");
    let dir = root.path().join("humans");
    std::fs::create_dir_all(&dir).expect("create humans");
    for index in 0..10 {
        std::fs::write(
            dir.join(format!("h{index}.md")),
            format!("---\nuser_id: u1\nname: Person {index}\n---\n"),
        )
        .expect("write human");
    }

    let (ctx, store) = context(root.path(), 64);
    store.set_row("humans", "h0", human("Person 0", ""));
    store.set_row("humans", "h1", human("Person 1", ""));
    let report = PersisterSet::new(&ctx).humans.save(None).await;

    assert!(matches!(
        report.cleanup.as_slice(),
        [CleanupOutcome::Tripped {
            keep_count: 2,
            disk_count: 10,
            ..
        }]
    ));
    assert_eq!(std::fs::read_dir(&dir).expect("read humans").count(), 10);
}

#[tokio::test]
async fn chat_group_removed_on_disk_takes_its_messages_along() {
    let root = tempfile::tempdir().expect("temp dir");
    let (ctx, store) = context(root.path(), 64);
    let hub = ctx.watch_hub.clone();
    store.set_row("chat_groups", "g1", row(json!({ "title": "Planning" })));
    store.set_row("chat_messages", "m1", row(json!({ "chat_group_id": "g1", "content": "hi" })));
    let set = PersisterSet::new(&ctx);
    set.chats.save(None).await;
    let auto = set.chats.start_auto_persisting().await;

    std::fs::remove_dir_all(root.path().join("chats").join("g1")).expect("remove group");
    hub.notify("chats/g1/messages.json");
    eventually("group removal", || !store.has_row("chat_groups", "g1")).await;
    assert!(!store.has_row("chat_messages", "m1"));
    auto.stop();
}

#[tokio::test]
async fn undecodable_files_survive_load_save_and_cleanup() {
    let root = tempfile::tempdir().expect("temp dir");
    let dir = root.path().join("humans");
    std::fs::create_dir_all(&dir).expect("create humans");
    let broken = "---\nuser_id: u1\nname: [Ada\n---\n\nhalf-typed edit";
    std::fs::write(dir.join("h1.md"), broken).expect("write broken human");

    let (ctx, store) = context(root.path(), 64);
    store.set_row("humans", "h1", human("Ada", "before the edit"));
    let set = PersisterSet::new(&ctx);
    set.load_all().await;
    assert!(store.has_row("humans", "h1"));
    store.set_row("humans", "h2", human("Grace", ""));

    let report = set.humans.save(None).await;
    assert!(report.is_success());
    assert_eq!(std::fs::read_to_string(dir.join("h1.md")).expect("read h1"), broken);
    assert!(dir.join("h2.md").exists());
}

#[tokio::test]
async fn session_folder_follows_store_edits_and_ignores_its_own_echo() {
    let root = tempfile::tempdir().expect("temp dir");
    let (ctx, store) = context(root.path(), 64);
    let hub = ctx.watch_hub.clone();
    let set = PersisterSet::new(&ctx);
    let auto = set.sessions.start_auto_persisting().await;

    store.set_row(
        "sessions",
        "s1",
        row(json!({ "title": "Standup", "folder_id": "", "raw_md": "first draft" })),
    );
    let memo = root.path().join("sessions").join("s1").join("_memo.md");
    eventually("memo saved", || memo.exists()).await;

    store.set_row(
        "sessions",
        "s1",
        row(json!({ "title": "Standup", "folder_id": "", "raw_md": "second draft" })),
    );
    eventually("memo rewritten", || {
        std::fs::read_to_string(&memo).is_ok_and(|text| text.contains("second draft"))
    })
    .await;
    hub.notify("sessions/s1/_memo.md");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.row("sessions", "s1").expect("s1")["raw_md"], "second draft");

    std::fs::write(&memo, "---\nid: s1\nsession_id: s1\n---\n\nedited elsewhere").expect("edit memo");
    hub.notify("sessions/s1/_memo.md");
    eventually("external memo edit", || {
        store
            .row("sessions", "s1")
            .is_some_and(|session| session["raw_md"] == "edited elsewhere")
    })
    .await;
    auto.stop();
}
