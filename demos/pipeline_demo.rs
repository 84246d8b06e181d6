//! Builds a small sales dataset and runs a `$match -> $group -> $sort`
//! pipeline through [`docview::aggregate`].

use docview::aggregate;
use serde_json::json;

fn main() {
    tracing_subscriber::fmt::init();

    let docs = vec![
        json!({"_id": 1, "category": "books", "price": 12, "quantity": 3, "status": "shipped"}),
        json!({"_id": 2, "category": "books", "price": 8, "quantity": 1, "status": "pending"}),
        json!({"_id": 3, "category": "electronics", "price": 200, "quantity": 1, "status": "shipped"}),
        json!({"_id": 4, "category": "electronics", "price": 50, "quantity": 2, "status": "shipped"}),
    ];

    let pipeline = vec![
        json!({"$match": {"status": "shipped"}}),
        json!({"$group": {
            "_id": "$category",
            "revenue": {"$sum": {"$multiply": ["$price", "$quantity"]}},
            "orders": {"$sum": 1},
        }}),
        json!({"$sort": {"revenue": -1}}),
    ];

    let results = aggregate(docs, &pipeline).expect("pipeline should build and execute");
    for doc in results {
        println!("{doc}");
    }
}
