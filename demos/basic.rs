//! Basic sofa example
//!
//! Embedded use of a store: revisioned writes, conflicts, bulk writes and the
//! change feed.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;

use serde_json::json;
use sofa_core::{Document, Error, Options, Store};
use sofa_storage::MemoryBackend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Sofa Basic Example\n");

    let store = Store::open(Arc::new(MemoryBackend::new()), "example").await?;

    // Create a document
    let doc = Document::from_json(json!({"_id": "user:alice", "name": "Alice", "age": 30}))?;
    let created = store.put(doc, Options::default()).await?;
    println!("Created {} at rev {} (seq {})", created.id, created.rev, created.seq);

    // Update it; the current revision must be supplied
    let mut alice = store.get("user:alice").await?;
    alice.body.insert("age".into(), json!(31));
    let updated = store.put(alice, Options::default()).await?;
    println!("Updated to rev {}", updated.rev);

    // A stale revision is rejected
    let stale = Document::from_json(json!({"_id": "user:alice", "_rev": created.rev.to_string()}))?;
    match store.put(stale, Options::default()).await {
        Err(Error::Conflict { reason, .. }) => println!("Conflict: {}", reason),
        other => println!("Unexpected: {:?}", other),
    }

    // Bulk write; each document gets its own result
    let docs = vec![
        Document::from_json(json!({"_id": "user:bob", "name": "Bob"}))?,
        Document::from_json(json!({"_id": "user:alice"}))?,
    ];
    for result in store.bulk(docs, Options::default()).await? {
        match result {
            Ok(written) => println!("Bulk wrote {} at seq {}", written.id, written.seq),
            Err(e) => println!("Bulk rejected: {}", e),
        }
    }

    // Delete
    let bob = store.get("user:bob").await?;
    store.remove(bob, Options::default()).await?;

    // Everything that happened, in commit order
    println!("\nChanges:");
    for change in store.changes(Options::default()).collect().await? {
        let marker = if change.deleted { " (deleted)" } else { "" };
        println!("  #{} {} {}{}", change.seq, change.id, change.rev, marker);
    }

    let info = store.info();
    println!(
        "\n{} documents, {} deleted, update_seq {}",
        info.doc_count, info.deleted_count, info.update_seq
    );

    Ok(())
}
