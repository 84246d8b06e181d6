//! Property-based equivalence and incrementality checks (spec §8).
//!
//! Each case generates a small document multiset plus an interleaving of
//! insert/remove operations, and checks the live, incrementally-maintained
//! pipeline against a from-scratch `aggregate` call over the same final
//! multiset.

use docview::{aggregate, Engine};
use proptest::prelude::*;
use serde_json::{json, Value};

fn doc(id: i64, n: i64, k: &str) -> Value {
    json!({"_id": id, "n": n, "k": k})
}

fn sorted_by_id(mut docs: Vec<Value>) -> Vec<Value> {
    docs.sort_by_key(|d| d["_id"].as_i64().unwrap());
    docs
}

proptest! {
    #[test]
    fn match_and_project_equivalence(
        values in prop::collection::vec((1i64..200, -50i64..50), 0..30),
    ) {
        let docs: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(i, (_id, n))| doc(i as i64, *n, if *n % 2 == 0 { "even" } else { "odd" }))
            .collect();
        let pipeline = vec![json!({"$match": {"n": {"$gte": 0}}}), json!({"$project": {"n": 1, "k": 1}})];

        let expected = sorted_by_id(aggregate(docs.clone(), &pipeline).unwrap());

        let mut engine = Engine::new();
        for d in &docs {
            engine.add_document(d.clone());
        }
        let actual = sorted_by_id(engine.execute(&pipeline).unwrap());
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn incremental_matches_from_scratch_over_insert_remove_sequences(
        inserted in prop::collection::vec((0i64..500, -50i64..50), 1..20),
        remove_every_nth in 1usize..4,
    ) {
        let pipeline = vec![json!({"$match": {"n": {"$gt": -10}}})];

        let mut engine = Engine::new();
        let mut live = engine.build_pipeline(&pipeline).unwrap();

        let mut alive: Vec<Value> = Vec::new();
        for (i, (id_seed, n)) in inserted.iter().enumerate() {
            let id = *id_seed * 1000 + i as i64;
            let d = doc(id, *n, "x");
            let row = live.add_document(d.clone()).unwrap();
            alive.push(d.clone());
            if i % remove_every_nth == 0 {
                live.remove_document(row).unwrap();
                alive.pop();
            }
        }

        let mut incremental = sorted_by_id(live.snapshot().unwrap());
        let mut expected = sorted_by_id(aggregate(alive, &pipeline).unwrap());
        incremental.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        expected.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        prop_assert_eq!(incremental, expected);
    }

    #[test]
    fn group_sum_equivalence_under_shuffled_insertion_order(
        values in prop::collection::vec(1i64..100, 1..25),
    ) {
        let docs: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(i, n)| doc(i as i64, *n, if *n % 3 == 0 { "a" } else { "b" }))
            .collect();
        let pipeline = vec![json!({"$group": {"_id": "$k", "total": {"$sum": "$n"}}})];

        let mut forward = aggregate(docs.clone(), &pipeline).unwrap();
        let mut reversed_docs = docs.clone();
        reversed_docs.reverse();
        let mut reversed = aggregate(reversed_docs, &pipeline).unwrap();

        forward.sort_by(|a, b| a["_id"].to_string().cmp(&b["_id"].to_string()));
        reversed.sort_by(|a, b| a["_id"].to_string().cmp(&b["_id"].to_string()));
        prop_assert_eq!(forward, reversed);
    }
}
