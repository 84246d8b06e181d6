//! Pipeline driver (spec §4.5).
//!
//! Owns the compiled stage array and the effective-document cache, and is
//! the only thing that mutates either. A [`Pipeline`] is built once from an
//! optimized [`StageSpec`] list, `hydrate`d over whatever rows are active
//! at build time, and can then take further deltas one at a time via
//! [`Pipeline::ingest_delta`] — the incremental path the rest of this crate
//! exists to support.

use std::collections::HashMap;

use crate::cache::EffectiveDocumentCache;
use crate::delta::Delta;
use crate::debug::FallbackTracker;
use crate::error::{EngineResult, InternalError};
use crate::rowid::{RowId, RowIdAllocator};
use crate::stage::{Stage, StageSpec};
use crate::value::Value;

/// A compiled, optimized pipeline: the stage array plus the shared
/// effective-document cache and debug counters the driver owns (spec §4.5,
/// §5 "shared resources").
pub struct Pipeline {
    stages: Vec<Stage>,
    cache: EffectiveDocumentCache,
    fallback: FallbackTracker,
    poisoned: bool,
}

impl Pipeline {
    pub fn build(specs: &[StageSpec]) -> Self {
        Pipeline {
            stages: specs.iter().map(Stage::compile).collect(),
            cache: EffectiveDocumentCache::new(),
            fallback: FallbackTracker::new(),
            poisoned: false,
        }
    }

    fn check_poisoned(&self) -> EngineResult<()> {
        if self.poisoned {
            Err(InternalError::PipelinePoisoned.into())
        } else {
            Ok(())
        }
    }

    /// The nearest stage at or before `stage_index` that transforms
    /// documents — the stage whose `effective_document` a non-transforming
    /// stage at `stage_index` forwards to (spec §4.1).
    fn nearest_transformer(&self, stage_index: usize) -> Option<usize> {
        (0..=stage_index).rev().find(|&i| self.stages[i].is_transforming())
    }

    /// Resolves the effective document a given stage observes as its
    /// input: `None` means "the raw root document", `Some(i)` means stage
    /// `i`'s output. Consults the shared cache first; on miss,
    /// rematerializes from the owning stage and populates the cache (spec
    /// §2 "central effective-document cache").
    fn resolve(&mut self, upstream: Option<usize>, row_id: RowId, root: &HashMap<RowId, Value>) -> EngineResult<Value> {
        let Some(stage_index) = upstream else {
            return root
                .get(&row_id)
                .cloned()
                .ok_or(InternalError::InactiveRowReference { stage_index: 0, row_id }.into());
        };
        let Some(owner) = self.nearest_transformer(stage_index) else {
            return root
                .get(&row_id)
                .cloned()
                .ok_or(InternalError::InactiveRowReference { stage_index, row_id }.into());
        };
        if let Some(doc) = self.cache.get(owner, row_id) {
            return Ok(doc.clone());
        }
        let doc = self.stages[owner]
            .effective_document(row_id)
            .ok_or(InternalError::CacheMiss { stage_index: owner, row_id })?;
        self.cache.put(owner, row_id, doc.clone());
        Ok(doc)
    }

    /// Bulk-installs every stage over `root`'s current contents, in
    /// stage order (spec §4.1 "hydrate"). `alloc` must be the same
    /// `RowIdAllocator` the owning `Engine` hands out document rowIds from
    /// — stage-synthesized rows (e.g. `$unwind` children) draw from it too,
    /// so every rowId in the pipeline, physical or synthesized, comes from
    /// one shared counter and can never collide with one the engine later
    /// allocates for a new document (spec §3 "monotone identity", §9 "one
    /// identity space").
    pub fn hydrate(&mut self, root: &HashMap<RowId, Value>, alloc: &RowIdAllocator) -> EngineResult<()> {
        self.check_poisoned()?;
        let mut upstream_active: Vec<RowId> = {
            let mut ids: Vec<RowId> = root.keys().copied().collect();
            ids.sort();
            ids
        };
        let stage_count = self.stages.len();
        for i in 0..stage_count {
            let prior_owner = if i == 0 { None } else { self.nearest_transformer(i - 1) };
            let Pipeline { stages, cache, .. } = self;
            let (before, rest) = stages.split_at_mut(i);
            let stage = &mut rest[0];
            let upstream_doc = |row_id: RowId| -> EngineResult<Value> {
                match prior_owner {
                    None => root
                        .get(&row_id)
                        .cloned()
                        .ok_or(InternalError::InactiveRowReference { stage_index: i, row_id }.into()),
                    Some(owner) => {
                        if let Some(doc) = cache.get(owner, row_id) {
                            return Ok(doc.clone());
                        }
                        let doc = before[owner]
                            .effective_document(row_id)
                            .ok_or(InternalError::CacheMiss { stage_index: owner, row_id })?;
                        cache.put(owner, row_id, doc.clone());
                        Ok(doc)
                    }
                }
            };
            let active = stage.hydrate(i, &upstream_active, upstream_doc, alloc)?;
            if stage.is_transforming() {
                for row_id in &active {
                    if let Some(doc) = stage.effective_document(*row_id) {
                        cache.put(i, *row_id, doc);
                    }
                }
            }
            upstream_active = active;
        }
        Ok(())
    }

    /// Routes one root-level delta through every stage in order (spec
    /// §4.5 "ingestDelta"); evaluation errors drop the delta at the
    /// offending stage and stop propagation, leaving every stage's prior
    /// state intact (spec §7).
    pub fn ingest_delta(&mut self, delta: Delta, root: &HashMap<RowId, Value>, alloc: &RowIdAllocator) -> EngineResult<()> {
        self.check_poisoned()?;
        self.propagate(0, vec![delta], root, alloc)
    }

    /// Drives `frontier` through stages `start_stage..`, threading the
    /// effective-document cache the same way regardless of where
    /// propagation begins. `start_stage == 0` with a root-level delta is
    /// `ingest_delta`'s case; a non-zero `start_stage` is how a `$lookup`
    /// stage's foreign-side change re-enters the pipeline one stage past
    /// itself, without re-running the stages before it (spec §4.5).
    fn propagate(&mut self, start_stage: usize, mut frontier: Vec<Delta>, root: &HashMap<RowId, Value>, alloc: &RowIdAllocator) -> EngineResult<()> {
        let stage_count = self.stages.len();
        for i in start_stage..stage_count {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            let prior_owner = if i == 0 { None } else { self.nearest_transformer(i - 1) };
            for d in frontier {
                let Pipeline { stages, cache, .. } = self;
                let (before, rest) = stages.split_at_mut(i);
                let stage = &mut rest[0];
                let upstream_doc = |row_id: RowId| -> EngineResult<Value> {
                    match prior_owner {
                        None => root
                            .get(&row_id)
                            .cloned()
                            .ok_or(InternalError::InactiveRowReference { stage_index: i, row_id }.into()),
                        Some(owner) => {
                            if let Some(doc) = cache.get(owner, row_id) {
                                return Ok(doc.clone());
                            }
                            let doc = before[owner]
                                .effective_document(row_id)
                                .ok_or(InternalError::CacheMiss { stage_index: owner, row_id })?;
                            cache.put(owner, row_id, doc.clone());
                            Ok(doc)
                        }
                    }
                };
                let result = stage.apply_delta(i, d, upstream_doc, alloc);
                match result {
                    Ok(emitted) => {
                        if stage.is_transforming() {
                            for e in &emitted {
                                match e {
                                    Delta::Insert(r) => {
                                        if let Some(doc) = stage.effective_document(*r) {
                                            cache.put(i, *r, doc);
                                        }
                                    }
                                    Delta::Remove(r) => cache.invalidate(i, *r),
                                }
                            }
                        }
                        next.extend(emitted);
                    }
                    Err(crate::error::EngineError::Poisoned(_)) => {
                        self.poisoned = true;
                        return Err(InternalError::PipelinePoisoned.into());
                    }
                    Err(crate::error::EngineError::Evaluation(e)) => {
                        tracing::warn!(error = %e, stage = i, "dropping delta after evaluation error");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            frontier = next;
        }
        Ok(())
    }

    /// Inserts a document into the foreign collection of the `$lookup`
    /// stage at `stage_index`, then re-emits every local row whose joined
    /// array it affects to the stages after it as a retract-then-assert
    /// pair — the same idiom `$group` uses for an in-place accumulator
    /// update (spec §4.2 "updates local rows when the foreign side
    /// changes"). The only way to populate a `$lookup` stage's foreign
    /// side once a pipeline is built.
    pub fn add_foreign_document(
        &mut self,
        stage_index: usize,
        row_id: RowId,
        doc: Value,
        root: &HashMap<RowId, Value>,
        alloc: &RowIdAllocator,
    ) -> EngineResult<()> {
        self.check_poisoned()?;
        let Stage::Lookup { state, .. } = &mut self.stages[stage_index] else {
            return Err(InternalError::NotALookupStage { stage_index }.into());
        };
        let affected = state.add_foreign_document(row_id, doc);
        self.refresh_and_repropagate(stage_index, affected, root, alloc)
    }

    /// Removes a document from the foreign collection of the `$lookup`
    /// stage at `stage_index`, re-emitting affected local rows the same
    /// way [`Pipeline::add_foreign_document`] does.
    pub fn remove_foreign_document(
        &mut self,
        stage_index: usize,
        row_id: RowId,
        root: &HashMap<RowId, Value>,
        alloc: &RowIdAllocator,
    ) -> EngineResult<()> {
        self.check_poisoned()?;
        let Stage::Lookup { state, .. } = &mut self.stages[stage_index] else {
            return Err(InternalError::NotALookupStage { stage_index }.into());
        };
        let affected = state.remove_foreign_document(row_id);
        self.refresh_and_repropagate(stage_index, affected, root, alloc)
    }

    fn refresh_and_repropagate(
        &mut self,
        stage_index: usize,
        affected: Vec<RowId>,
        root: &HashMap<RowId, Value>,
        alloc: &RowIdAllocator,
    ) -> EngineResult<()> {
        for row_id in affected {
            self.cache.invalidate(stage_index, row_id);
            if let Some(doc) = self.stages[stage_index].effective_document(row_id) {
                self.cache.put(stage_index, row_id, doc);
            }
            self.propagate(stage_index + 1, vec![Delta::Remove(row_id), Delta::Insert(row_id)], root, alloc)?;
        }
        Ok(())
    }

    /// Ordered output rowIds of the terminal stage (spec §4.1 "snapshot").
    pub fn snapshot_ids(&self) -> Vec<RowId> {
        self.stages.last().map(Stage::active_ids).unwrap_or_default()
    }

    /// Materializes the terminal stage's current output as documents.
    pub fn snapshot(&mut self, root: &HashMap<RowId, Value>) -> EngineResult<Vec<Value>> {
        self.check_poisoned()?;
        let last = self.stages.len() - 1;
        let ids = self.snapshot_ids();
        ids.into_iter().map(|row_id| self.resolve(Some(last), row_id, root)).collect()
    }

    pub fn fallback_count(&self) -> u64 {
        self.fallback.count()
    }

    pub fn reset_fallback_tracking(&self) {
        self.fallback.reset();
    }

    /// Number of cache entries held for stage `i` — used by the
    /// cache-consistency invariant test (spec §8).
    pub fn cache_count_for_stage(&self, stage_index: usize) -> usize {
        self.cache.count_for_stage(stage_index)
    }
}
