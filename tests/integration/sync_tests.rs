use crate::common::*;
use assert_fs::prelude::*;
use langbridge::events::NotificationLevel;
use langbridge::lsp::protocol::{path_to_uri, Position, Range, TextEdit};
use langbridge::sync::DocumentSync;
use predicates::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_shared_buffer_opens_and_closes_once() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);

    let first = ws.open("a.js", "let a = 1;").await;
    let second = ws.workspace.open_view(first.buffer());
    manager.view_opened(&first).await.unwrap().unwrap();
    manager.view_opened(&second).await.unwrap().unwrap();
    settle().await;
    assert_eq!(starter.messages("textDocument/didOpen").len(), 1);

    ws.workspace.close_view(first.id());
    manager.view_closed(first.id());
    settle().await;
    assert!(starter.messages("textDocument/didClose").is_empty());

    ws.workspace.close_view(second.id());
    manager.view_closed(second.id());
    starter.wait_for("textDocument/didClose", 1).await;
    settle().await;
    assert_eq!(starter.messages("textDocument/didClose").len(), 1);
}

#[tokio::test]
async fn test_only_primary_view_reports_changes() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);

    let primary = ws.open("a.js", "let a = 1;").await;
    let secondary = ws.workspace.open_view(primary.buffer());
    let record = manager.view_opened(&primary).await.unwrap().unwrap();
    let secondary_sync = DocumentSync::attach(&secondary, Arc::clone(record.sync_context()));

    assert!(!secondary_sync.is_primary());
    assert!(!secondary_sync.send_full_changes().unwrap());

    primary.buffer().set_text("let a = 2;").unwrap();
    let changes = starter.wait_for("textDocument/didChange", 1).await;
    settle().await;
    assert_eq!(starter.messages("textDocument/didChange").len(), 1);
    assert_eq!(changes[0]["params"]["textDocument"]["version"], 2);
    assert_eq!(starter.messages("textDocument/didOpen").len(), 1);

    secondary_sync.detach();
}

#[tokio::test]
async fn test_versions_increase_without_gaps() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);
    let view = ws.open("a.js", "").await;
    manager.view_opened(&view).await.unwrap().unwrap();

    for text in ["a", "ab", "abc"] {
        view.buffer().set_text(text).unwrap();
    }

    let changes = starter.wait_for("textDocument/didChange", 3).await;
    let versions: Vec<i64> = changes
        .iter()
        .map(|c| c["params"]["textDocument"]["version"].as_i64().unwrap())
        .collect();
    assert_eq!(versions, vec![2, 3, 4]);
    assert_eq!(manager.versions().current(&view.buffer().path().unwrap()), 4);
}

#[tokio::test]
async fn test_multi_range_edit_is_sent_bottom_to_top() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);
    let view = ws.open("a.js", "a\nb\nc").await;
    manager.view_opened(&view).await.unwrap().unwrap();

    let edit = |line: u32, text: &str| {
        TextEdit::new(Range::new(Position::new(line, 0), Position::new(line, 1)), text)
    };
    view.buffer()
        .edit(vec![edit(0, "A"), edit(1, "B"), edit(2, "C")])
        .unwrap();
    assert_eq!(view.buffer().text(), "A\nB\nC");

    let changes = starter.wait_for("textDocument/didChange", 1).await;
    let content = changes[0]["params"]["contentChanges"].as_array().unwrap();
    let lines: Vec<u64> = content
        .iter()
        .map(|c| c["range"]["start"]["line"].as_u64().unwrap())
        .collect();
    assert_eq!(lines, vec![2, 1, 0]);
    assert_eq!(content[0]["text"], "C");
    assert_eq!(content[0]["rangeLength"], 1);
}

#[tokio::test]
async fn test_full_sync_sends_whole_text() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions {
        capabilities: json!({ "textDocumentSync": 1 }),
        ..Default::default()
    });
    let manager = ws.manager(test_config(), &starter);
    let view = ws.open("a.js", "one").await;
    manager.view_opened(&view).await.unwrap().unwrap();

    view.buffer().set_text_in_range(
        Range::new(Position::new(0, 3), Position::new(0, 3)),
        " two",
    )
    .unwrap();

    let changes = starter.wait_for("textDocument/didChange", 1).await;
    assert_eq!(
        changes[0]["params"]["contentChanges"],
        json!([{ "text": "one two" }])
    );
}

#[tokio::test]
async fn test_rename_reopens_under_new_uri() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);
    let view = ws.open("old.js", "let a;").await;
    manager.view_opened(&view).await.unwrap().unwrap();
    starter.wait_for("textDocument/didOpen", 1).await;

    let old_path = view.buffer().path().unwrap();
    let new_path = ws.root().join("new.js");
    view.buffer().set_path(Some(new_path.clone()));

    starter.wait_for("textDocument/didOpen", 2).await;
    let methods: Vec<String> = starter
        .methods()
        .into_iter()
        .filter(|m| m.starts_with("textDocument/") || m == "workspace/didChangeWatchedFiles")
        .collect();
    assert_eq!(
        methods,
        vec![
            "textDocument/didOpen",
            "textDocument/didClose",
            "workspace/didChangeWatchedFiles",
            "textDocument/didOpen",
        ]
    );

    let close = &starter.messages("textDocument/didClose")[0];
    assert_eq!(close["params"]["textDocument"]["uri"], path_to_uri(&old_path));
    let reopened = &starter.messages("textDocument/didOpen")[1];
    assert_eq!(reopened["params"]["textDocument"]["uri"], path_to_uri(&new_path));
    assert_eq!(reopened["params"]["textDocument"]["version"], 1);
}

#[tokio::test]
async fn test_save_sends_did_save_with_text() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);
    let view = ws.open("a.js", "let a;").await;
    manager.view_opened(&view).await.unwrap().unwrap();

    view.buffer().set_text("let b;").unwrap();
    view.buffer().save().await.unwrap();

    let saves = starter.wait_for("textDocument/didSave", 1).await;
    assert_eq!(saves[0]["params"]["text"], "let b;");
    ws.temp.child("a.js").assert("let b;");
}

#[tokio::test]
async fn test_will_save_edits_are_applied_before_writing() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions {
        will_save_edits: json!([{
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 0 } },
            "newText": "// formatted\n"
        }]),
        ..Default::default()
    });
    let manager = ws.manager(test_config(), &starter);
    let view = ws.open("a.js", "let a;").await;
    manager.view_opened(&view).await.unwrap().unwrap();

    view.buffer().save().await.unwrap();

    ws.temp
        .child("a.js")
        .assert(predicate::str::starts_with("// formatted\n"));
    let saves = starter.wait_for("textDocument/didSave", 1).await;
    assert_eq!(saves[0]["params"]["text"], "// formatted\nlet a;");
}

#[tokio::test]
async fn test_slow_will_save_does_not_block_save() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions {
        will_save_delay: Duration::from_secs(2),
        will_save_edits: json!([{
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 0 } },
            "newText": "// late\n"
        }]),
        ..Default::default()
    });
    let manager = ws.manager(test_config(), &starter);
    let mut notifications = manager.subscribe_notifications();
    let view = ws.open("a.js", "let a;").await;
    manager.view_opened(&view).await.unwrap().unwrap();

    view.buffer().set_text("changed").unwrap();
    let started = Instant::now();
    view.buffer().save().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    ws.temp.child("a.js").assert("changed");

    let notification = notifications.try_recv().unwrap();
    assert_eq!(notification.level, NotificationLevel::Warning);
    assert!(notification.dismissable);
}

#[tokio::test]
async fn test_language_change_moves_view_off_the_server() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);
    let view = ws.open("a.js", "").await;
    let record = manager.view_opened(&view).await.unwrap().unwrap();
    starter.wait_for("textDocument/didOpen", 1).await;

    view.buffer().set_language_id(Some("python".to_string()));
    assert!(manager.refresh_view(&view).await.unwrap().is_none());

    starter.wait_for("textDocument/didClose", 1).await;
    assert!(!record.is_attached(view.id()));
    assert!(record.sync_context().open_documents().is_empty());
}

#[tokio::test]
async fn test_untitled_buffer_opens_once_it_has_a_path() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);

    let buffer = ws
        .workspace
        .create_buffer("let a;", None, Some("javascript".to_string()));
    let view = ws.workspace.open_view(&buffer);
    let record = manager.view_opened(&view).await.unwrap().unwrap();
    assert_eq!(record.project_root(), ws.root());
    settle().await;
    assert!(starter.messages("textDocument/didOpen").is_empty());

    buffer.save_as(&ws.root().join("untitled.js")).await.unwrap();
    let opens = starter.wait_for("textDocument/didOpen", 1).await;
    assert_eq!(opens[0]["params"]["textDocument"]["languageId"], "javascript");
}
