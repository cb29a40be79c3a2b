use rserv_api::GraphView;
use rserv_storage::Error;
use rserv_storage::graph::{EdgeIndex, GraphMode};
use rserv_storage::store::{DocumentStore, NoopCache, PatchNull, SortOrder, StoreOptions};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn write_schema(base: &Path, entity: &str, fields: Value) {
    let dir = base.join("schema").join("default");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join(format!("{entity}.json")),
        serde_json::to_vec(&fields).unwrap(),
    )
    .unwrap();
}

fn social_schema(base: &Path) {
    write_schema(
        base,
        "users",
        json!({
            "name": {"type": "string", "required": true},
            "age": {"type": "integer", "min": 0},
            "friends": {"type": "REF", "entity": "users"}
        }),
    );
    write_schema(
        base,
        "posts",
        json!({
            "title": {"type": "string", "required": true},
            "author": {"type": "REF", "entity": "users"}
        }),
    );
}

fn open_store(base: &Path, options: StoreOptions) -> (DocumentStore, Arc<EdgeIndex>) {
    let graph = Arc::new(EdgeIndex::new(GraphMode::Memory, None));
    let store = DocumentStore::open(
        base,
        "default",
        options,
        Some(graph.clone()),
        Arc::new(NoopCache),
    )
    .unwrap();
    (store, graph)
}

fn body(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

#[test]
fn create_allocates_sequential_ids() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    let (id1, doc1) = store.create("users", body(json!({"name": "Alice"}))).unwrap();
    let (id2, _) = store.create("users", body(json!({"name": "Bob"}))).unwrap();
    assert_eq!((id1, id2), (1, 2));
    assert_eq!(doc1["id"], json!(1));
    assert_eq!(store.get("users", 1).unwrap()["name"], json!("Alice"));
}

#[test]
fn get_after_write_observes_new_state() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    let (id, _) = store.create("users", body(json!({"name": "Alice"}))).unwrap();
    let written = store
        .replace("users", id, body(json!({"name": "Alicia", "age": 30})))
        .unwrap();
    assert_eq!(store.get("users", id).unwrap(), written);
}

#[test]
fn replace_with_own_state_is_idempotent() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    let (id, _) = store
        .create("users", body(json!({"name": "Alice", "age": 30})))
        .unwrap();
    let before = store.get("users", id).unwrap();
    store
        .replace("users", id, before.as_object().unwrap().clone())
        .unwrap();
    assert_eq!(store.get("users", id).unwrap(), before);
}

#[test]
fn empty_patch_changes_nothing() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    let (id, _) = store
        .create("users", body(json!({"name": "Alice", "age": 30})))
        .unwrap();
    let before = store.get("users", id).unwrap();
    store.patch("users", id, Map::new()).unwrap();
    assert_eq!(store.get("users", id).unwrap(), before);
}

#[test]
fn save_conflicts_on_existing_id() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    store.save("users", 7, body(json!({"name": "Greg"}))).unwrap();
    assert!(matches!(
        store.save("users", 7, body(json!({"name": "Again"}))),
        Err(Error::IdExists { .. })
    ));
    // The allocator skips past saved ids.
    let (next, _) = store.create("users", body(json!({"name": "Hana"}))).unwrap();
    assert_eq!(next, 8);
}

#[test]
fn missing_required_field_is_a_validation_error() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    let err = store.create("users", body(json!({"age": 3}))).unwrap_err();
    match err {
        Error::Validation(errors) => assert_eq!(errors[0].field, "name"),
        other => panic!("expected validation error, got {other}"),
    }
}

#[test]
fn patch_null_delete_removes_the_field() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(
        dir.path(),
        StoreOptions {
            patch_null: PatchNull::Delete,
            ..StoreOptions::default()
        },
    );

    let (id, _) = store
        .create("users", body(json!({"name": "Alice", "age": 30})))
        .unwrap();
    store.patch("users", id, body(json!({"age": null}))).unwrap();
    let doc = store.get("users", id).unwrap();
    assert!(doc.get("age").is_none());
}

#[test]
fn patch_null_store_keeps_an_explicit_null() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    let (id, _) = store
        .create("users", body(json!({"name": "Alice", "age": 30})))
        .unwrap();
    store.patch("users", id, body(json!({"age": null}))).unwrap();
    assert_eq!(store.get("users", id).unwrap()["age"], Value::Null);
}

#[test]
fn foreign_key_target_must_exist() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    let err = store
        .create(
            "posts",
            body(json!({"title": "Hello", "author": {"id": 99}})),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
}

#[test]
fn delete_of_referenced_document_is_refused_without_cascade() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    let (user, _) = store.create("users", body(json!({"name": "Alice"}))).unwrap();
    store
        .create(
            "posts",
            body(json!({"title": "Hi", "author": {"id": user}})),
        )
        .unwrap();
    assert!(matches!(
        store.delete("users", user, false),
        Err(Error::ReferencedDelete { .. })
    ));
}

#[test]
fn cascade_delete_removes_referrers_transitively() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    write_schema(
        dir.path(),
        "comments",
        json!({
            "text": {"type": "string"},
            "post": {"type": "REF", "entity": "posts"}
        }),
    );
    let (store, graph) = open_store(
        dir.path(),
        StoreOptions {
            cascading_delete: true,
            ..StoreOptions::default()
        },
    );

    let (user, _) = store.create("users", body(json!({"name": "Alice"}))).unwrap();
    let (p1, _) = store
        .create("posts", body(json!({"title": "a", "author": {"id": user}})))
        .unwrap();
    let (p2, _) = store
        .create("posts", body(json!({"title": "b", "author": {"id": user}})))
        .unwrap();
    store
        .create("comments", body(json!({"text": "!", "post": {"id": p1}})))
        .unwrap();

    let nodes_before = graph.node_count();
    store.delete("users", user, true).unwrap();

    assert!(matches!(
        store.get("posts", p1),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        store.get("posts", p2),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        store.get("comments", 1),
        Err(Error::NotFound { .. })
    ));
    assert_eq!(graph.node_count(), nodes_before - 4);
    assert_eq!(graph.edge_count(), 0);
}

#[test]
fn cascade_delete_terminates_on_reference_cycles() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(
        dir.path(),
        StoreOptions {
            cascading_delete: true,
            ..StoreOptions::default()
        },
    );

    let (a, _) = store.create("users", body(json!({"name": "A"}))).unwrap();
    let (b, _) = store
        .create("users", body(json!({"name": "B", "friends": {"id": a}})))
        .unwrap();
    store
        .patch("users", a, body(json!({"friends": {"id": b}})))
        .unwrap();

    store.delete("users", a, true).unwrap();
    assert!(matches!(store.get("users", a), Err(Error::NotFound { .. })));
    assert!(matches!(store.get("users", b), Err(Error::NotFound { .. })));
}

#[test]
fn unique_fields_are_enforced_by_scan() {
    let dir = tempdir().unwrap();
    write_schema(
        dir.path(),
        "users",
        json!({
            "email": {"type": "string", "unique": true}
        }),
    );
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    store
        .create("users", body(json!({"email": "a@example.com"})))
        .unwrap();
    assert!(matches!(
        store.create("users", body(json!({"email": "a@example.com"}))),
        Err(Error::Integrity(_))
    ));
}

#[test]
fn list_sorts_and_paginates() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, _) = open_store(dir.path(), StoreOptions::default());

    for (name, age) in [("Carol", 20), ("Alice", 35), ("Bob", 20)] {
        store
            .create("users", body(json!({"name": name, "age": age})))
            .unwrap();
    }

    let sorted = store
        .list(
            "users",
            None,
            None,
            &[
                ("age".to_string(), SortOrder::Asc),
                ("name".to_string(), SortOrder::Asc),
            ],
        )
        .unwrap();
    let names: Vec<_> = sorted.items.iter().map(|d| d["name"].clone()).collect();
    assert_eq!(names, vec![json!("Bob"), json!("Carol"), json!("Alice")]);

    let page = store.list("users", Some(2), Some(2), &[]).unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 1);
}

#[test]
fn writes_maintain_the_edge_index() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    let (store, graph) = open_store(dir.path(), StoreOptions::default());

    let (alice, _) = store.create("users", body(json!({"name": "Alice"}))).unwrap();
    let (bob, _) = store.create("users", body(json!({"name": "Bob"}))).unwrap();
    store
        .patch("users", alice, body(json!({"friends": {"id": bob}})))
        .unwrap();

    let a = graph.resolve_id(alice).unwrap();
    let out = graph.outbound(a);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].label, "FRIENDS");
    assert_eq!(out[0].peer.id, bob);
    // Reference fields stay out of node properties.
    assert!(graph.node_property(a, "friends").is_none());
    assert_eq!(graph.node_property(a, "name"), Some(json!("Alice")));

    store.patch("users", alice, body(json!({"friends": []}))).unwrap();
    assert!(graph.outbound(a).is_empty());
}

#[test]
fn boot_scan_rebuilds_the_index_from_disk() {
    let dir = tempdir().unwrap();
    social_schema(dir.path());
    {
        let (store, _) = open_store(dir.path(), StoreOptions::default());
        let (alice, _) = store.create("users", body(json!({"name": "Alice"}))).unwrap();
        let (bob, _) = store.create("users", body(json!({"name": "Bob"}))).unwrap();
        store
            .patch("users", alice, body(json!({"friends": {"id": bob}})))
            .unwrap();
    }
    let (_store, graph) = open_store(dir.path(), StoreOptions::default());
    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.edge_count(), 1);
}

#[test]
fn invalid_entity_names_are_rejected() {
    let dir = tempdir().unwrap();
    let (store, _) = open_store(dir.path(), StoreOptions::default());
    assert!(matches!(
        store.create("../escape", Map::new()),
        Err(Error::InvalidEntityName(_))
    ));
}
