use crate::common::*;
use assert_fs::prelude::*;
use langbridge::lsp::protocol::path_to_uri;
use serde_json::{json, Map, Value};
use std::path::Path;

fn edit(line: u32, start: u32, end: u32, text: &str) -> Value {
    json!({
        "range": {
            "start": { "line": line, "character": start },
            "end": { "line": line, "character": end }
        },
        "newText": text
    })
}

fn apply_edit_request(id: i64, changes: Vec<(&Path, Vec<Value>)>) -> Value {
    let mut map = Map::new();
    for (path, edits) in changes {
        map.insert(path_to_uri(path), Value::Array(edits));
    }
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "workspace/applyEdit",
        "params": { "label": "Rename symbol", "edit": { "changes": map } }
    })
}

#[tokio::test]
async fn test_server_edit_spans_open_and_unopened_files() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);

    let view = ws.open("a.js", "const foo = 1;\nuse(foo);").await;
    let b_path = ws.write("b.js", "import { foo } from './a';");
    manager.view_opened(&view).await.unwrap().unwrap();
    let a_path = view.buffer().path().unwrap();

    starter.send_to_client(
        &ws.root(),
        apply_edit_request(
            11,
            vec![
                (&a_path, vec![edit(0, 6, 9, "bar"), edit(1, 4, 7, "bar")]),
                (&b_path, vec![edit(0, 9, 12, "bar")]),
            ],
        ),
    );

    let response = starter.wait_for_response(&json!(11)).await;
    assert_eq!(response["result"]["applied"], true);
    assert_eq!(view.buffer().text(), "const bar = 1;\nuse(bar);");

    // The unopened file stays edited in memory after the reply, not on disk
    let b = ws.workspace.buffer_for_path(&b_path).unwrap();
    assert_eq!(b.text(), "import { bar } from './a';");
    assert!(ws.workspace.views_for_buffer(b.id()).is_empty());
    ws.temp.child("b.js").assert("import { foo } from './a';");

    // Only the synced document reports changes
    let changes = starter.wait_for("textDocument/didChange", 2).await;
    assert!(changes
        .iter()
        .all(|c| c["params"]["textDocument"]["uri"] == path_to_uri(&a_path)));

    // One undo step per buffer
    assert!(view.buffer().undo());
    assert_eq!(view.buffer().text(), "const foo = 1;\nuse(foo);");
}

#[tokio::test]
async fn test_invalid_server_edit_changes_nothing() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);

    let view = ws.open("a.js", "const foo = 1;").await;
    let b_path = ws.write("b.js", "foo();");
    let b = ws.workspace.open_buffer(&b_path).await.unwrap();
    manager.view_opened(&view).await.unwrap().unwrap();
    let a_path = view.buffer().path().unwrap();

    starter.send_to_client(
        &ws.root(),
        apply_edit_request(
            12,
            vec![
                (&a_path, vec![edit(0, 6, 9, "bar")]),
                (&b_path, vec![edit(4, 0, 3, "bar")]),
            ],
        ),
    );

    let response = starter.wait_for_response(&json!(12)).await;
    assert_eq!(response["result"]["applied"], false);
    assert!(response["result"]["failureReason"]
        .as_str()
        .unwrap()
        .contains("invalid range"));

    assert_eq!(view.buffer().text(), "const foo = 1;");
    assert_eq!(b.text(), "foo();");
    settle().await;
    assert!(starter.messages("textDocument/didChange").is_empty());
}

#[tokio::test]
async fn test_overlapping_server_edits_are_refused() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);

    let view = ws.open("a.js", "abcdef").await;
    manager.view_opened(&view).await.unwrap().unwrap();
    let a_path = view.buffer().path().unwrap();

    starter.send_to_client(
        &ws.root(),
        apply_edit_request(13, vec![(&a_path, vec![edit(0, 0, 3, "x"), edit(0, 2, 5, "y")])]),
    );

    let response = starter.wait_for_response(&json!(13)).await;
    assert_eq!(response["result"]["applied"], false);
    assert!(response["result"]["failureReason"]
        .as_str()
        .unwrap()
        .contains("overlapping"));
    assert_eq!(view.buffer().text(), "abcdef");
}

#[tokio::test]
async fn test_resource_operations_are_refused() {
    let ws = TestWorkspace::new();
    let starter = FakeStarter::new(FakeServerOptions::default());
    let manager = ws.manager(test_config(), &starter);

    let view = ws.open("a.js", "let a;").await;
    manager.view_opened(&view).await.unwrap().unwrap();
    let created = path_to_uri(&ws.root().join("c.js"));

    starter.send_to_client(
        &ws.root(),
        json!({
            "jsonrpc": "2.0", "id": 14, "method": "workspace/applyEdit",
            "params": { "edit": { "documentChanges": [ { "kind": "create", "uri": created } ] } }
        }),
    );

    let response = starter.wait_for_response(&json!(14)).await;
    assert_eq!(response["result"]["applied"], false);
    assert_eq!(
        response["result"]["failureReason"],
        "unsupported resource operation 'create'"
    );
    assert!(!ws.root().join("c.js").exists());
}
