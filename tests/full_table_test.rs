mod common;

use common::*;
use mongo_capture::bookmarks::{
    State, LAST_ID_FETCHED, LAST_ID_FETCHED_TYPE, LAST_REPLICATION_METHOD, MAX_ID_TYPE,
    MAX_ID_VALUE,
};
use mongo_capture::checkpoint::CheckpointManager;
use mongo_capture::output::{MemorySink, Message};
use mongo_capture::sync::MemorySource;
use mongo_capture::Replicator;
use mongodb::bson::{doc, Bson};
use tempfile::TempDir;

fn hex_ids(replicator: &TestReplicator) -> Vec<String> {
    replicator
        .sink()
        .records("orders")
        .iter()
        .map(|r| r["_id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_resumed_scan_emits_remaining_documents_and_one_activation() {
    let docs = object_id_docs(51);
    let source = MemorySource::new();
    source.upsert(&ns("orders"), docs.clone()).await;

    let id = |i: usize| docs[i].get("_id").cloned().unwrap();
    let mut state = State::new();
    let bookmark = state.bookmark_mut("shop-orders");
    bookmark.set_version(1_700_000_000_000);
    bookmark.set(LAST_REPLICATION_METHOD, "FULL_TABLE");
    bookmark
        .set_typed(LAST_ID_FETCHED, LAST_ID_FETCHED_TYPE, &id(24))
        .unwrap();
    // doc[50] arrived after the interrupted scan recorded its bound.
    bookmark.set_typed(MAX_ID_VALUE, MAX_ID_TYPE, &id(49)).unwrap();
    state.set_currently_syncing(Some("shop-orders"));

    let mut replicator = replicator(source);
    let catalog = catalog(vec![stream("orders", "FULL_TABLE").build()]);
    replicator.run(&catalog, &mut state).await.unwrap();

    let expected: Vec<String> = docs[24..50]
        .iter()
        .map(|d| d.get_object_id("_id").unwrap().to_hex())
        .collect();
    assert_eq!(hex_ids(&replicator), expected);
    assert_eq!(expected.len(), 26);

    let messages = replicator.sink().messages();
    let kinds = kinds(messages);
    assert_eq!(count_kind(messages, "ACTIVATE_VERSION"), 1);
    let activation = kinds.iter().position(|k| *k == "ACTIVATE_VERSION").unwrap();
    let last_record = kinds.iter().rposition(|k| *k == "RECORD").unwrap();
    assert!(activation > last_record);
    assert_eq!(
        messages[activation],
        Message::activate_version("orders", 1_700_000_000_000)
    );

    let bookmark = state.bookmark("shop-orders").unwrap();
    assert!(bookmark.initial_full_table_complete());
    assert!(!bookmark.contains(MAX_ID_VALUE));
    assert!(!bookmark.contains(LAST_ID_FETCHED));
    assert_eq!(state.currently_syncing, None);
}

#[tokio::test]
async fn test_fresh_scan_announces_generation_first_and_last() {
    let source = MemorySource::new();
    source.upsert(&ns("orders"), object_id_docs(5)).await;

    let mut replicator = replicator(source);
    let mut state = State::new();
    let catalog = catalog(vec![stream("orders", "FULL_TABLE").build()]);
    replicator.run(&catalog, &mut state).await.unwrap();

    let kinds = kinds(replicator.sink().messages());
    assert_eq!(&kinds[..3], &["STATE", "SCHEMA", "STATE"]);
    assert_eq!(kinds[3], "ACTIVATE_VERSION");
    assert_eq!(kinds.last(), Some(&"STATE"));
    assert_eq!(kinds[kinds.len() - 2], "ACTIVATE_VERSION");
    assert_eq!(replicator.sink().records("orders").len(), 5);
    assert_eq!(replicator.stats().total_rows(), 5);

    // The first checkpoint marks the stream before anything is emitted.
    let first = states(replicator.sink().messages())[0];
    assert_eq!(first.currently_syncing.as_deref(), Some("shop-orders"));
}

#[tokio::test]
async fn test_second_run_starts_a_new_generation() {
    let source = MemorySource::new();
    source.upsert(&ns("orders"), object_id_docs(3)).await;
    let catalog = catalog(vec![stream("orders", "FULL_TABLE").build()]);

    let mut state = State::new();
    let mut replicator = replicator(source);
    replicator.run(&catalog, &mut state).await.unwrap();
    let first_version = state.bookmark("shop-orders").unwrap().version().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    replicator.sink_mut().take();
    replicator.run(&catalog, &mut state).await.unwrap();

    let second_version = state.bookmark("shop-orders").unwrap().version().unwrap();
    assert!(second_version > first_version);
    assert_eq!(count_kind(replicator.sink().messages(), "ACTIVATE_VERSION"), 2);
    assert_eq!(replicator.sink().records("orders").len(), 3);
}

#[tokio::test]
async fn test_checkpoints_are_written_through_to_state_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("state.json");

    let source = MemorySource::new();
    source.upsert(&ns("orders"), object_id_docs(4)).await;
    let mut settings = settings();
    settings.state_file = Some(path.clone());
    settings.update_bookmark_period = 2;

    let mut replicator = Replicator::new(settings, source, MemorySink::new());
    let mut state = State::new();
    let catalog = catalog(vec![stream("orders", "FULL_TABLE").build()]);
    replicator.run(&catalog, &mut state).await.unwrap();

    let saved = CheckpointManager::new(&path).load().await.unwrap().unwrap();
    assert_eq!(saved, state);
    assert_eq!(
        states(replicator.sink().messages()).last().copied(),
        Some(&state)
    );
}

#[tokio::test]
async fn test_string_ids_resume_with_their_type() {
    let source = MemorySource::new();
    source
        .upsert(
            &ns("orders"),
            ["a", "b", "c", "d"].map(|id| doc! { "_id": id }),
        )
        .await;

    let mut state = State::new();
    let bookmark = state.bookmark_mut("shop-orders");
    bookmark.set_version(9);
    bookmark.set(LAST_REPLICATION_METHOD, "FULL_TABLE");
    bookmark
        .set_typed(LAST_ID_FETCHED, LAST_ID_FETCHED_TYPE, &Bson::String("b".into()))
        .unwrap();
    bookmark
        .set_typed(MAX_ID_VALUE, MAX_ID_TYPE, &Bson::String("c".into()))
        .unwrap();

    let mut replicator = replicator(source);
    let catalog = catalog(vec![stream("orders", "FULL_TABLE").build()]);
    replicator.run(&catalog, &mut state).await.unwrap();

    let ids: Vec<&str> = replicator
        .sink()
        .records("orders")
        .iter()
        .map(|r| r["_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["b", "c"]);
}

#[tokio::test]
async fn test_mixed_id_types_are_all_scanned() {
    let source = MemorySource::new();
    source.upsert(&ns("orders"), object_id_docs(20)).await;
    source
        .upsert(
            &ns("orders"),
            (0..80).map(|i| doc! { "_id": format!("id-{:02}", i) }),
        )
        .await;

    let mut replicator = replicator(source);
    let mut state = State::new();
    let catalog = catalog(vec![stream("orders", "FULL_TABLE").build()]);
    replicator.run(&catalog, &mut state).await.unwrap();

    let ids = hex_ids(&replicator);
    assert_eq!(ids.len(), 100);
    // Strings sort before ObjectIds in the _id index.
    assert_eq!(ids[0], "id-00");
    assert_eq!(ids[79], "id-79");
    assert!(state
        .bookmark("shop-orders")
        .unwrap()
        .initial_full_table_complete());
}

#[tokio::test]
async fn test_resume_from_string_id_reaches_object_ids() {
    let docs = object_id_docs(3);
    let source = MemorySource::new();
    source.upsert(&ns("orders"), docs.clone()).await;
    source
        .upsert(&ns("orders"), ["a", "b"].map(|id| doc! { "_id": id }))
        .await;

    let mut state = State::new();
    let bookmark = state.bookmark_mut("shop-orders");
    bookmark.set_version(9);
    bookmark.set(LAST_REPLICATION_METHOD, "FULL_TABLE");
    bookmark
        .set_typed(LAST_ID_FETCHED, LAST_ID_FETCHED_TYPE, &Bson::String("b".into()))
        .unwrap();
    bookmark
        .set_typed(MAX_ID_VALUE, MAX_ID_TYPE, docs[2].get("_id").unwrap())
        .unwrap();

    let mut replicator = replicator(source);
    let catalog = catalog(vec![stream("orders", "FULL_TABLE").build()]);
    replicator.run(&catalog, &mut state).await.unwrap();

    let mut expected = vec!["b".to_string()];
    expected.extend(docs.iter().map(|d| d.get_object_id("_id").unwrap().to_hex()));
    assert_eq!(hex_ids(&replicator), expected);
}
