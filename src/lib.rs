//! # docview
//!
//! Incremental view maintenance for document-oriented aggregation
//! pipelines. A pipeline is a sequence of `$match`/`$project`/`$group`/
//! `$sort`/`$limit`/`$skip`/`$unwind`/`$addFields`/`$lookup`/`$topK`
//! stages, built once and then fed `addDocument`/`removeDocument` deltas
//! one at a time — each call re-derives only the rows actually affected,
//! never a full recomputation (see [`pipeline`]).
//!
//! ## Pipeline
//! ```text
//! pipeline spec (JSON)
//!     ↓
//! [stage::parse_pipeline]     → Vec<StageSpec>
//!     ↓
//! [optimizer::Optimizer]      → pushdown / fuse / prune (once, not fixpoint)
//!     ↓
//! [pipeline::Pipeline::build] → Vec<Stage> (compiled, stateful)
//!     ↓
//! hydrate(initial docs) / ingest_delta(one delta at a time)
//!     ↓
//! snapshot() → [doc]
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use docview::Engine;
//! use serde_json::json;
//!
//! let mut engine = Engine::new();
//! let r1 = engine.add_document(json!({"_id": 1, "status": "active", "amount": 10}));
//! let r2 = engine.add_document(json!({"_id": 2, "status": "closed", "amount": 20}));
//!
//! let pipeline = vec![
//!     json!({"$match": {"status": "active"}}),
//!     json!({"$project": {"amount": 1}}),
//! ];
//! let out = engine.execute(&pipeline)?;
//! engine.remove_document(r1)?;
//! # Ok::<(), docview::EngineError>(())
//! ```
//!
//! ## Module organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | `Value`/`Document` aliases over `serde_json`, path get/set, total ordering |
//! | `rowid` | Opaque row identity shared by every stage |
//! | `delta` | Insert/Remove deltas and active sets |
//! | `expr` | Expression/predicate AST, parser, compiler |
//! | `order_window` | Ordered index and bounded two-heap partition (`$sort`/`$limit`/`$skip`/`$topK`) |
//! | `cache` | Central effective-document cache |
//! | `debug` | Fallback-to-interpretation tracking |
//! | `error` | Three-tier error model |
//! | `stage` | Per-stage parsing and compiled runtime state |
//! | `optimizer` | One-shot pipeline rewrites |
//! | `pipeline` | The stage-array driver: hydrate, ingest_delta, snapshot |
//! | `config` | Resource limits and logging configuration |

pub mod cache;
pub mod config;
pub mod debug;
pub mod delta;
pub mod error;
pub mod expr;
pub mod optimizer;
pub mod order_window;
pub mod pipeline;
pub mod rowid;
pub mod stage;
pub mod value;

pub use config::EngineConfig;
pub use delta::{ActiveSet, Delta};
pub use error::{EngineError, EngineResult, EvalError, InternalError, SpecError};
pub use rowid::{RowId, RowIdAllocator};
pub use value::{Document, Value};

use std::collections::HashMap;

use optimizer::Optimizer;
use pipeline::Pipeline;
use stage::parse_pipeline;

/// A single running view: an input document store plus zero or more
/// compiled pipelines derived from it (spec §2, §6).
///
/// `addDocument`/`removeDocument` mutate the store and push the
/// corresponding delta through every pipeline built from this engine via
/// [`Engine::execute`]. Each `execute` call compiles and hydrates a fresh
/// pipeline over the store's current contents; the returned handle is
/// live until the next structural change (see [`pipeline::Pipeline`] for
/// the incremental path beyond a single `execute` call).
pub struct Engine {
    root: HashMap<RowId, Value>,
    alloc: RowIdAllocator,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            root: HashMap::new(),
            alloc: RowIdAllocator::new(),
        }
    }

    /// Inserts a document into the primary collection, returning its
    /// rowId (spec §6 `addDocument`).
    pub fn add_document(&mut self, doc: Value) -> RowId {
        let row_id = self.alloc.alloc();
        self.root.insert(row_id, doc);
        row_id
    }

    /// Removes a document from the primary collection. A no-op if the
    /// rowId is already absent.
    pub fn remove_document(&mut self, row_id: RowId) {
        self.root.remove(&row_id);
    }

    /// Compiles, optimizes and hydrates `pipeline_spec` over the current
    /// store, returning its output documents (spec §6 `execute`).
    pub fn execute(&mut self, pipeline_spec: &[Value]) -> EngineResult<Vec<Value>> {
        let specs = parse_pipeline(pipeline_spec)?;
        let specs = Optimizer::new().optimize(specs);
        let mut pipeline = Pipeline::build(&specs);
        pipeline.hydrate(&self.root, &self.alloc)?;
        pipeline.snapshot(&self.root)
    }

    /// Builds a [`Pipeline`] handle over the current store without
    /// immediately discarding it, for callers that want to keep feeding
    /// deltas incrementally rather than re-executing from scratch.
    pub fn build_pipeline(&mut self, pipeline_spec: &[Value]) -> EngineResult<LivePipeline<'_>> {
        let specs = parse_pipeline(pipeline_spec)?;
        let specs = Optimizer::new().optimize(specs);
        let mut pipeline = Pipeline::build(&specs);
        pipeline.hydrate(&self.root, &self.alloc)?;
        Ok(LivePipeline { engine: self, pipeline })
    }

    /// Replaces the document at `row_id` in place: a remove followed by an
    /// insert that reuses the same rowId (spec §4.5 `updateDocument`,
    /// expressed here as the driver-level primitive it names rather than a
    /// new rowId-allocating operation).
    pub fn update_document(&mut self, row_id: RowId, doc: Value) {
        self.root.insert(row_id, doc);
    }

    pub fn document_count(&self) -> usize {
        self.root.len()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// A pipeline kept alive alongside its owning [`Engine`], so further
/// `addDocument`/`removeDocument` calls can be pushed through it one
/// delta at a time instead of re-running `execute` from scratch.
pub struct LivePipeline<'a> {
    engine: &'a mut Engine,
    pipeline: Pipeline,
}

impl<'a> LivePipeline<'a> {
    pub fn add_document(&mut self, doc: Value) -> EngineResult<RowId> {
        let row_id = self.engine.alloc.alloc();
        self.engine.root.insert(row_id, doc);
        self.pipeline.ingest_delta(Delta::Insert(row_id), &self.engine.root, &self.engine.alloc)?;
        Ok(row_id)
    }

    pub fn remove_document(&mut self, row_id: RowId) -> EngineResult<()> {
        self.pipeline.ingest_delta(Delta::Remove(row_id), &self.engine.root, &self.engine.alloc)?;
        self.engine.root.remove(&row_id);
        Ok(())
    }

    /// Replaces the document at `row_id`, reusing the same rowId (spec
    /// §4.5 `updateDocument`): a remove delta against the old contents
    /// followed by an insert delta against the new ones, so every stage
    /// sees the change as the two deltas it already knows how to apply.
    pub fn update_document(&mut self, row_id: RowId, doc: Value) -> EngineResult<()> {
        self.pipeline.ingest_delta(Delta::Remove(row_id), &self.engine.root, &self.engine.alloc)?;
        self.engine.root.insert(row_id, doc);
        self.pipeline.ingest_delta(Delta::Insert(row_id), &self.engine.root, &self.engine.alloc)?;
        Ok(())
    }

    pub fn snapshot(&mut self) -> EngineResult<Vec<Value>> {
        self.pipeline.snapshot(&self.engine.root)
    }

    /// Adds a document to the foreign collection of the `$lookup` stage at
    /// `stage_index` (its position in the pipeline spec passed to
    /// `build_pipeline`), allocating its rowId from the same shared
    /// allocator every other document in this engine draws from. Every
    /// local row the new document now joins to is re-emitted downstream
    /// (spec §4.2 "updates local rows when the foreign side changes").
    ///
    /// This is the entry point that actually makes `$lookup` join
    /// anything: without it, a stage built from `{"$lookup": ...}` has no
    /// way to receive foreign documents at all.
    pub fn add_foreign_document(&mut self, stage_index: usize, doc: Value) -> EngineResult<RowId> {
        let row_id = self.engine.alloc.alloc();
        self.pipeline.add_foreign_document(stage_index, row_id, doc, &self.engine.root, &self.engine.alloc)?;
        Ok(row_id)
    }

    /// Removes a document from the foreign collection of the `$lookup`
    /// stage at `stage_index`, re-emitting affected local rows the same
    /// way [`LivePipeline::add_foreign_document`] does.
    pub fn remove_foreign_document(&mut self, stage_index: usize, row_id: RowId) -> EngineResult<()> {
        self.pipeline.remove_foreign_document(stage_index, row_id, &self.engine.root, &self.engine.alloc)
    }

    pub fn reset_fallback_tracking(&self) {
        self.pipeline.reset_fallback_tracking();
    }

    pub fn fallback_count(&self) -> u64 {
        self.pipeline.fallback_count()
    }
}

/// Convenience one-shot entry point: fresh engine, bulk-insert, execute,
/// discard (spec §6 `aggregate`).
pub fn aggregate(docs: Vec<Value>, pipeline_spec: &[Value]) -> EngineResult<Vec<Value>> {
    let mut engine = Engine::new();
    for doc in docs {
        engine.add_document(doc);
    }
    engine.execute(pipeline_spec)
}
