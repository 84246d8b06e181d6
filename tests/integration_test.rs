//! End-to-end scenarios from the aggregation pipeline specification:
//! exists predicates, projection, unwind, group+sort with incremental
//! remove/re-insert, out-of-bounds array access, and cross-stage field
//! propagation.

use docview::{aggregate, Engine};
use serde_json::json;

fn ids(docs: &[serde_json::Value]) -> Vec<i64> {
    let mut v: Vec<i64> = docs.iter().map(|d| d["_id"].as_i64().unwrap()).collect();
    v.sort();
    v
}

#[test]
fn exists_predicate_matches_explicit_null_but_not_missing() {
    let docs = vec![
        json!({"_id": 1, "name": "A", "tags": ["a"]}),
        json!({"_id": 2, "name": "B"}),
        json!({"_id": 3, "name": "C", "tags": null}),
    ];
    let pipeline = vec![json!({"$match": {"tags": {"$exists": true}}})];
    let out = aggregate(docs, &pipeline).unwrap();
    assert_eq!(ids(&out), vec![1, 3]);
}

#[test]
fn projection_keeps_only_id_and_named_field() {
    let docs = vec![
        json!({"_id": 1, "name": "A", "tags": ["a"], "extra": "x"}),
        json!({"_id": 2, "name": "B", "tags": ["b"], "extra": "y"}),
    ];
    let pipeline = vec![json!({"$project": {"name": 1}})];
    let out = aggregate(docs, &pipeline).unwrap();
    assert_eq!(out.len(), 2);
    for doc in &out {
        let obj = doc.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(keys, vec!["_id", "name"]);
    }
}

#[test]
fn unwind_produces_one_document_per_array_element() {
    let docs = vec![
        json!({"_id": 1, "tags": ["red", "blue"], "name": "i1"}),
        json!({"_id": 2, "tags": ["green"], "name": "i2"}),
    ];
    let pipeline = vec![json!({"$unwind": "$tags"})];
    let mut out = aggregate(docs, &pipeline).unwrap();
    out.sort_by(|a, b| (a["_id"].as_i64(), a["tags"].as_str()).cmp(&(b["_id"].as_i64(), b["tags"].as_str())));
    assert_eq!(out.len(), 3);
    let tags: Vec<&str> = out.iter().map(|d| d["tags"].as_str().unwrap()).collect();
    assert_eq!(tags, vec!["blue", "red", "green"]);
    assert_eq!(out[0]["name"], json!("i1"));
    assert_eq!(out[2]["name"], json!("i2"));
}

fn revenue_docs() -> Vec<serde_json::Value> {
    vec![
        json!({"_id": 1, "category": "a", "price": 10, "quantity": 2}),
        json!({"_id": 2, "category": "a", "price": 5, "quantity": 1}),
        json!({"_id": 3, "category": "b", "price": 20, "quantity": 1}),
        json!({"_id": 4, "category": "b", "price": 2, "quantity": 5}),
    ]
}

fn revenue_pipeline() -> Vec<serde_json::Value> {
    vec![
        json!({"$group": {
            "_id": "$category",
            "totalRevenue": {"$sum": {"$multiply": ["$price", "$quantity"]}},
        }}),
        json!({"$sort": {"totalRevenue": -1}}),
    ]
}

#[test]
fn group_and_sort_incremental_matches_from_scratch() {
    let docs = revenue_docs();
    let pipeline = revenue_pipeline();

    let mut engine = Engine::new();
    let mut row_ids = Vec::new();
    for d in &docs {
        row_ids.push(engine.add_document(d.clone()));
    }
    let mut live = engine.build_pipeline(&pipeline).unwrap();
    let before = live.snapshot().unwrap();

    // Remove the second document and re-insert an identical copy.
    live.remove_document(row_ids[1]).unwrap();
    live.add_document(docs[1].clone()).unwrap();

    let after = live.snapshot().unwrap();
    assert_eq!(before, after);

    let from_scratch = aggregate(docs, &pipeline).unwrap();
    assert_eq!(after, from_scratch);
}

#[test]
fn group_accumulator_update_reorders_downstream_sort_without_new_members() {
    // Category "b" starts behind "a"; inserting a third member into "b"
    // pushes its total ahead without ever emptying or recreating either
    // group, so the only way $sort can see the new ranking is the
    // retract-then-assert pair $group emits for an in-place update.
    let mut engine = Engine::new();
    engine.add_document(json!({"_id": 1, "category": "a", "amount": 100}));
    engine.add_document(json!({"_id": 2, "category": "b", "amount": 10}));
    let pipeline = vec![
        json!({"$group": {"_id": "$category", "total": {"$sum": "$amount"}}}),
        json!({"$sort": {"total": -1}}),
    ];
    let mut live = engine.build_pipeline(&pipeline).unwrap();
    assert_eq!(live.snapshot().unwrap(), vec![json!({"_id": "a", "total": 100}), json!({"_id": "b", "total": 10})]);

    live.add_document(json!({"_id": 3, "category": "b", "amount": 500})).unwrap();
    assert_eq!(live.snapshot().unwrap(), vec![json!({"_id": "b", "total": 510}), json!({"_id": "a", "total": 100})]);

    let from_scratch = aggregate(
        vec![
            json!({"_id": 1, "category": "a", "amount": 100}),
            json!({"_id": 2, "category": "b", "amount": 10}),
            json!({"_id": 3, "category": "b", "amount": 500}),
        ],
        &pipeline,
    )
    .unwrap();
    assert_eq!(live.snapshot().unwrap(), from_scratch);
}

#[test]
fn group_accumulator_update_on_partial_removal_stays_consistent() {
    // Removing one of two members from a group leaves it non-empty; the
    // group's rowId survives but its total must still refresh downstream.
    let mut engine = Engine::new();
    let r1 = engine.add_document(json!({"_id": 1, "category": "a", "amount": 7}));
    engine.add_document(json!({"_id": 2, "category": "a", "amount": 3}));
    let pipeline = vec![json!({"$group": {"_id": "$category", "total": {"$sum": "$amount"}}})];
    let mut live = engine.build_pipeline(&pipeline).unwrap();
    assert_eq!(live.snapshot().unwrap(), vec![json!({"_id": "a", "total": 10})]);

    live.remove_document(r1).unwrap();
    assert_eq!(live.snapshot().unwrap(), vec![json!({"_id": "a", "total": 3})]);
}

#[test]
fn lookup_joins_through_the_public_foreign_document_api() {
    let mut engine = Engine::new();
    engine.add_document(json!({"_id": 1, "customerId": 7}));
    engine.add_document(json!({"_id": 2, "customerId": 8}));
    let mut live = engine
        .build_pipeline(&[json!({"$lookup": {
            "from": "customers",
            "localField": "customerId",
            "foreignField": "_id",
            "as": "customer",
        }})])
        .unwrap();

    let acme = live.add_foreign_document(0, json!({"_id": 7, "name": "Acme"})).unwrap();
    live.add_foreign_document(0, json!({"_id": 8, "name": "Globex"})).unwrap();

    let mut out = live.snapshot().unwrap();
    out.sort_by_key(|d| d["_id"].as_i64());
    assert_eq!(
        out,
        vec![
            json!({"_id": 1, "customerId": 7, "customer": [{"_id": 7, "name": "Acme"}]}),
            json!({"_id": 2, "customerId": 8, "customer": [{"_id": 8, "name": "Globex"}]}),
        ]
    );

    live.remove_foreign_document(0, acme).unwrap();
    let mut out = live.snapshot().unwrap();
    out.sort_by_key(|d| d["_id"].as_i64());
    assert_eq!(
        out,
        vec![
            json!({"_id": 1, "customerId": 7, "customer": []}),
            json!({"_id": 2, "customerId": 8, "customer": [{"_id": 8, "name": "Globex"}]}),
        ]
    );
}

#[test]
fn out_of_bounds_array_access_evaluates_to_null() {
    let docs = vec![json!({"_id": 1, "xs": [10, 20]})];
    let pipeline = vec![json!({"$project": {"at5": {"$arrayElemAt": ["$xs", 5]}}})];
    let out = aggregate(docs, &pipeline).unwrap();
    assert_eq!(out[0]["at5"], json!(null));
}

#[test]
fn cross_stage_field_is_visible_to_the_next_stage() {
    let docs = vec![
        json!({"_id": 1, "date": "2024-03-05T00:00:00Z"}),
        json!({"_id": 2, "date": "2024-03-18T00:00:00Z"}),
        json!({"_id": 3, "date": "2024-04-01T00:00:00Z"}),
    ];
    let pipeline = vec![
        json!({"$project": {"month": {"$month": "$date"}}}),
        json!({"$group": {"_id": "$month", "n": {"$sum": 1}}}),
    ];
    let mut out = aggregate(docs, &pipeline).unwrap();
    out.sort_by_key(|d| d["_id"].as_i64());
    assert_eq!(out, vec![json!({"_id": 3, "n": 2}), json!({"_id": 4, "n": 1})]);
}

#[test]
fn round_trip_insert_then_remove_restores_prior_snapshot() {
    let mut engine = Engine::new();
    let row = engine.add_document(json!({"_id": 1, "active": true}));
    let mut live = engine.build_pipeline(&[json!({"$match": {"active": true}})]).unwrap();
    let before = live.snapshot().unwrap();

    let added = live.add_document(json!({"_id": 2, "active": true})).unwrap();
    live.remove_document(added).unwrap();
    let after = live.snapshot().unwrap();

    assert_eq!(before, after);
    let _ = row;
}

#[test]
fn incrementality_matches_from_scratch_after_interleaved_changes() {
    let pipeline = vec![json!({"$match": {"n": {"$gte": 2}}}), json!({"$project": {"n": 1}})];

    let mut engine = Engine::new();
    let r1 = engine.add_document(json!({"_id": 1, "n": 1}));
    let mut live = engine.build_pipeline(&pipeline).unwrap();

    live.add_document(json!({"_id": 2, "n": 2})).unwrap();
    live.add_document(json!({"_id": 3, "n": 3})).unwrap();
    live.remove_document(r1).unwrap();
    let r4 = live.add_document(json!({"_id": 4, "n": 5})).unwrap();
    live.remove_document(r4).unwrap();

    let mut incremental = live.snapshot().unwrap();
    incremental.sort_by_key(|d| d["_id"].as_i64());

    let final_docs = vec![json!({"_id": 2, "n": 2}), json!({"_id": 3, "n": 3})];
    let mut from_scratch = aggregate(final_docs, &pipeline).unwrap();
    from_scratch.sort_by_key(|d| d["_id"].as_i64());

    assert_eq!(incremental, from_scratch);
}

#[test]
fn zero_fallback_across_a_representative_pipeline_corpus() {
    let pipelines: Vec<Vec<serde_json::Value>> = vec![
        vec![json!({"$match": {"n": {"$gt": 1}}})],
        vec![json!({"$project": {"n": 1, "doubled": {"$multiply": ["$n", 2]}}})],
        vec![json!({"$unwind": "$tags"})],
        vec![json!({"$group": {"_id": "$k", "total": {"$sum": "$n"}}}), json!({"$sort": {"total": -1}})],
        vec![json!({"$sort": {"n": -1}}), json!({"$limit": 2})],
    ];
    for pipeline in pipelines {
        let mut engine = Engine::new();
        engine.add_document(json!({"_id": 1, "n": 3, "k": "a", "tags": ["x", "y"]}));
        engine.add_document(json!({"_id": 2, "n": 5, "k": "a", "tags": ["z"]}));
        let live = engine.build_pipeline(&pipeline).unwrap();
        assert_eq!(live.fallback_count(), 0, "pipeline {pipeline:?} used a fallback");
    }
}
