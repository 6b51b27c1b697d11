//! Host-facing control surface: update, delete, rotation, stats, events.

use memvault_core::events::WalletEvent;
use memvault_core::retrieval::{SearchMode, SearchOptions};
use memvault_core::types::{IngestOutcome, UserAddress};
use memvault_test_utils::harness;

async fn ingest_accepted(
    h: &memvault_test_utils::TestHarness,
    user: &UserAddress,
    text: &str,
) -> memvault_core::types::MemoryId {
    match h.wallet.ingest(user, text, None).await.unwrap() {
        IngestOutcome::Accepted { memory_id, .. } => memory_id,
        other => panic!("expected acceptance, got {other:?}"),
    }
}

#[tokio::test]
async fn update_keeps_id_and_rewrites_content() {
    let h = harness();
    let user = UserAddress::new("0xuser1");
    let memory_id = ingest_accepted(&h, &user, "I live in Lisbon").await;
    h.wallet.flush(&user).await.unwrap();

    let before = h.wallet.get_memory(&user, memory_id).await.unwrap();
    let updated = h
        .wallet
        .update(&user, memory_id, "I live in Porto now")
        .await
        .unwrap();
    h.wallet.flush(&user).await.unwrap();

    assert_eq!(updated.memory_id, memory_id);
    assert_ne!(updated.content_ref, before.content_ref);
    assert_ne!(updated.vector_ref, before.vector_ref);
    assert!(updated.updated_at >= before.updated_at);
    // The version link landed in the graph refs.
    assert!(updated.graph_refs.len() > before.graph_refs.len());

    let response = h
        .wallet
        .search(
            &user,
            "live Porto",
            SearchOptions {
                mode: SearchMode::Vector,
                k: Some(3),
                include_content: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let hit = response
        .results
        .iter()
        .find(|r| r.memory_id == memory_id)
        .expect("updated memory should be searchable");
    assert_eq!(hit.content.as_deref(), Some("I live in Porto now"));
}

#[tokio::test]
async fn delete_removes_record_vector_and_blob() {
    let h = harness();
    let user = UserAddress::new("0xuser1");
    let memory_id = ingest_accepted(&h, &user, "Temporary secret to forget").await;
    h.wallet.flush(&user).await.unwrap();

    assert!(h.wallet.delete(&user, memory_id).await.unwrap());
    assert!(!h.wallet.delete(&user, memory_id).await.unwrap());
    assert!(h.wallet.get_memory(&user, memory_id).await.is_err());

    let response = h
        .wallet
        .search(
            &user,
            "temporary secret",
            SearchOptions {
                mode: SearchMode::Vector,
                k: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn rotation_bumps_version_and_keeps_old_ciphertexts_readable() {
    let h = harness();
    let user = UserAddress::new("0xuser1");
    let memory_id = ingest_accepted(&h, &user, "Sealed before rotation").await;
    h.wallet.flush(&user).await.unwrap();

    let version = h.wallet.rotate_keys(&user, Some(30));
    assert_eq!(version, 1);
    assert_eq!(h.wallet.rotate_keys(&user, None), 2);

    let response = h
        .wallet
        .search(
            &user,
            "sealed rotation",
            SearchOptions {
                mode: SearchMode::Vector,
                k: Some(3),
                include_content: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let hit = response
        .results
        .iter()
        .find(|r| r.memory_id == memory_id)
        .expect("memory still retrievable after rotation");
    assert!(!hit.decryption_failed);
    assert_eq!(hit.content.as_deref(), Some("Sealed before rotation"));
}

#[tokio::test]
async fn events_announce_lifecycle() {
    let h = harness();
    let mut events = h.wallet.subscribe();
    let user = UserAddress::new("0xuser1");

    let memory_id = ingest_accepted(&h, &user, "Announce me").await;
    match events.recv().await.unwrap() {
        WalletEvent::MemoryCreated {
            memory_id: event_id,
            ..
        } => assert_eq!(event_id, memory_id),
        other => panic!("expected MemoryCreated, got {other:?}"),
    }

    h.wallet.delete(&user, memory_id).await.unwrap();
    loop {
        match events.recv().await.unwrap() {
            WalletEvent::MemoryDeleted {
                memory_id: event_id,
                ..
            } => {
                assert_eq!(event_id, memory_id);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn stats_reflect_activity() {
    let h = harness();
    let user = UserAddress::new("0xuser1");
    for i in 0..5 {
        ingest_accepted(&h, &user, &format!("note number {i}")).await;
    }
    h.wallet.flush(&user).await.unwrap();
    h.wallet.checkpoint(&user).await.unwrap();

    let stats = h.wallet.stats().await;
    assert_eq!(stats.pipeline.accepted, 5);
    assert_eq!(stats.records, 5);
    assert_eq!(stats.index.snapshots_written, 1);
    assert!(stats.envelope.encrypt_count >= 5);
    assert!(stats
        .index
        .users
        .iter()
        .any(|u| u.user == user && u.size == 5));
    assert!(stats.embeddings.provider_calls > 0);
}

#[tokio::test]
async fn hybrid_search_blends_modes_and_facets() {
    let h = harness();
    let user = UserAddress::new("0xuser1");
    h.llm.script_extraction(
        "My dog Pepper chases squirrels",
        r#"{"nodes":[{"kind":"animal","name":"Pepper"},{"kind":"animal","name":"squirrels"}],
            "edges":[{"from_name":"Pepper","to_name":"squirrels","label":"chases"}]}"#,
    );
    ingest_accepted(&h, &user, "My dog Pepper chases squirrels").await;
    ingest_accepted(&h, &user, "Meeting notes from the budget review").await;
    h.wallet.flush(&user).await.unwrap();

    let response = h
        .wallet
        .search(
            &user,
            "pepper",
            SearchOptions {
                mode: SearchMode::Hybrid,
                k: Some(5),
                include_facets: true,
                include_content: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    let top = &response.results[0];
    assert_eq!(
        top.content.as_deref(),
        Some("My dog Pepper chases squirrels")
    );
    // The graph mode contributed: "pepper" seeds the entity node attached
    // to this memory.
    assert!(top.mode_scores.contains_key("graph"));

    let facets = response.facets.expect("facets requested");
    let total: usize = facets.categories.values().sum();
    assert!(total >= response.results.len());
}
