//! Demonstrates the incremental path: a pipeline is built once, then fed
//! one document change at a time via [`docview::LivePipeline`] instead of
//! being re-executed from scratch.

use docview::Engine;
use serde_json::json;

fn main() {
    tracing_subscriber::fmt::init();

    let mut engine = Engine::new();
    let mut row_ids = Vec::new();
    row_ids.push(engine.add_document(json!({"_id": 1, "category": "a", "amount": 10})));
    row_ids.push(engine.add_document(json!({"_id": 2, "category": "b", "amount": 20})));

    let pipeline = vec![
        json!({"$group": {"_id": "$category", "total": {"$sum": "$amount"}}}),
        json!({"$sort": {"total": -1}}),
    ];

    let mut live = engine.build_pipeline(&pipeline).expect("pipeline should build");
    println!("initial: {:?}", live.snapshot().unwrap());

    let new_row = live.add_document(json!({"_id": 3, "category": "a", "amount": 50})).unwrap();
    println!("after insert: {:?}", live.snapshot().unwrap());

    live.remove_document(new_row).unwrap();
    live.remove_document(row_ids[0]).unwrap();
    println!("after removes: {:?}", live.snapshot().unwrap());

    println!("fallback count (should stay zero): {}", live.fallback_count());
}
