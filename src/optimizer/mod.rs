//! # Pipeline Optimizer
//!
//! Runs once at pipeline build (spec §4.4). Three rewrites, each a single
//! pass over the cloned stage list:
//!
//! - Projection pruning: narrow a `$project`/`$addFields` whose output is
//!   wider than anything read downstream — never the terminal stage.
//! - Predicate pushdown: `Project(Match(x, pred), proj) -> Match(Project(x,
//!   proj), pred)` when `pred`'s fields survive the projection unchanged,
//!   letting `$match` filter before the transform instead of after.
//! - Sort+limit fusion: `Limit(Sort(x, key), n) -> TopK(x, n, key)`.
//!
//! The optimizer never mutates its input; every rule works on an owned
//! clone, matching the immutability the spec requires of the original.

use crate::expr::Predicate;
use crate::stage::project::{collect_referenced, ProjectSpec};
use crate::stage::StageSpec;

/// Pipeline optimizer, applied once per pipeline build.
pub struct Optimizer;

impl Optimizer {
    pub fn new() -> Self {
        Optimizer
    }

    /// Optimizes a cloned stage list. Idempotent: running it again on its
    /// own output is a no-op (spec §8 "Idempotent optimization"), since
    /// each rule's precondition no longer holds once applied.
    pub fn optimize(&self, stages: Vec<StageSpec>) -> Vec<StageSpec> {
        let stages = self.pushdown_predicates(stages);
        let stages = self.fuse_sort_limit(stages);
        self.prune_projections(stages)
    }

    /// Swaps an adjacent `$match` that follows a `$project`/`$addFields`
    /// to precede it, whenever every field the predicate reads is passed
    /// through unchanged by the projection (i.e. not dropped, not
    /// shadowed by a computed field).
    fn pushdown_predicates(&self, stages: Vec<StageSpec>) -> Vec<StageSpec> {
        let mut out = stages;
        let mut i = 0;
        while i + 1 < out.len() {
            let swap = match (&out[i], &out[i + 1]) {
                (StageSpec::Project(proj), StageSpec::Match(pred)) | (StageSpec::AddFields(proj), StageSpec::Match(pred)) => {
                    predicate_survives(pred, proj)
                }
                _ => false,
            };
            if swap {
                out.swap(i, i + 1);
                if i > 0 {
                    i -= 1;
                    continue;
                }
            }
            i += 1;
        }
        out
    }

    /// `Limit(Sort(x, key), n) -> TopK(x, n, key)`. Only fires when the
    /// two stages are directly adjacent; an intervening stage means the
    /// limit no longer observes the sort's order directly.
    fn fuse_sort_limit(&self, stages: Vec<StageSpec>) -> Vec<StageSpec> {
        let mut out = Vec::with_capacity(stages.len());
        let mut iter = stages.into_iter().peekable();
        while let Some(stage) = iter.next() {
            match (&stage, iter.peek()) {
                (StageSpec::Sort(sort), Some(StageSpec::Limit { .. })) => {
                    let sort = sort.clone();
                    let Some(StageSpec::Limit { n, .. }) = iter.next() else {
                        unreachable!("peeked Limit");
                    };
                    out.push(StageSpec::TopK { n, sort });
                }
                _ => out.push(stage),
            }
        }
        out
    }

    /// Narrows any non-terminal inclusion `$project` to the fields
    /// actually read downstream. The terminal stage's user-declared
    /// projection is never touched (spec §4.4 "pruning safety"); exclusion
    /// and `$addFields` stages are left alone since narrowing them would
    /// require proving no later stage reads the whole document via
    /// `$$ROOT`/`$$CURRENT`.
    fn prune_projections(&self, mut stages: Vec<StageSpec>) -> Vec<StageSpec> {
        if stages.is_empty() {
            return stages;
        }
        let last = stages.len() - 1;

        let mut needed_after: Vec<Vec<String>> = vec![Vec::new(); stages.len()];
        let mut suffix_fields: Vec<String> = Vec::new();
        for i in (0..stages.len()).rev() {
            needed_after[i] = suffix_fields.clone();
            suffix_fields.extend(stage_referenced_fields(&stages[i]));
        }

        for i in 0..last {
            let StageSpec::Project(proj) = &stages[i] else {
                continue;
            };
            if proj.mode != crate::stage::project::ProjectMode::Include {
                continue;
            }
            let needed = &needed_after[i];
            let narrowed: Vec<String> = proj
                .simple_fields
                .iter()
                .filter(|f| needed.iter().any(|n| n == *f || n.starts_with(&format!("{f}."))))
                .cloned()
                .collect();
            if narrowed.len() < proj.simple_fields.len() {
                let mut new_spec = (**proj).clone();
                new_spec.simple_fields = narrowed;
                stages[i] = StageSpec::Project(std::rc::Rc::new(new_spec));
            }
        }
        stages
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

fn predicate_survives(pred: &Predicate, proj: &ProjectSpec) -> bool {
    let mut fields = Vec::new();
    collect_predicate_fields(pred, &mut fields);
    fields.iter().all(|f| field_passes_through(f, proj))
}

fn field_passes_through(field: &str, proj: &ProjectSpec) -> bool {
    use crate::stage::project::ProjectMode;
    if proj.computed.iter().any(|(name, _)| name == field) {
        return false;
    }
    match proj.mode {
        ProjectMode::AddFields => true,
        ProjectMode::Include => proj.simple_fields.iter().any(|f| f == field) || field == "_id",
        ProjectMode::Exclude => !proj.simple_fields.iter().any(|f| f == field),
    }
}

fn collect_predicate_fields(pred: &Predicate, out: &mut Vec<String>) {
    match pred {
        Predicate::FieldEq(f, _) | Predicate::FieldCmp(f, _, _) | Predicate::FieldExists(f, _) => {
            out.push(f.clone())
        }
        Predicate::And(ps) | Predicate::Or(ps) => {
            for p in ps {
                collect_predicate_fields(p, out);
            }
        }
        Predicate::Not(p) => collect_predicate_fields(p, out),
        Predicate::Expr(e) => collect_referenced(e, out),
    }
}

fn stage_referenced_fields(stage: &StageSpec) -> Vec<String> {
    let mut out = Vec::new();
    match stage {
        StageSpec::Match(pred) => collect_predicate_fields(pred, &mut out),
        StageSpec::Project(p) | StageSpec::AddFields(p) => out = p.referenced_fields(),
        StageSpec::Group { key, accumulators } => {
            collect_referenced(key, &mut out);
            for acc in accumulators.iter() {
                if let Some(e) = &acc.expr {
                    collect_referenced(e, &mut out);
                }
            }
        }
        StageSpec::Sort(sort) | StageSpec::Limit { sort, .. } | StageSpec::Skip { sort, .. } | StageSpec::TopK { sort, .. } => {
            out.extend(sort.field_names().map(str::to_string));
        }
        StageSpec::Unwind(u) => out.push(u.path.clone()),
        StageSpec::Lookup(l) => out.push(l.local_field.clone()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::parse_pipeline;
    use serde_json::json;

    #[test]
    fn fuses_sort_then_limit_into_topk() {
        let stages = parse_pipeline(&[json!({"$sort": {"score": -1}}), json!({"$limit": 5})]).unwrap();
        let optimized = Optimizer::new().optimize(stages);
        assert_eq!(optimized.len(), 1);
        assert!(matches!(optimized[0], StageSpec::TopK { n: 5, .. }));
    }

    #[test]
    fn pushes_match_before_project_when_field_survives() {
        let stages = parse_pipeline(&[
            json!({"$project": {"name": 1, "age": 1}}),
            json!({"$match": {"name": "Ada"}}),
        ])
        .unwrap();
        let optimized = Optimizer::new().optimize(stages);
        assert!(matches!(optimized[0], StageSpec::Match(_)));
        assert!(matches!(optimized[1], StageSpec::Project(_)));
    }

    #[test]
    fn leaves_match_after_project_when_field_is_dropped() {
        let stages = parse_pipeline(&[
            json!({"$project": {"name": 1}}),
            json!({"$match": {"age": {"$gt": 10}}}),
        ])
        .unwrap();
        let optimized = Optimizer::new().optimize(stages);
        assert!(matches!(optimized[0], StageSpec::Project(_)));
        assert!(matches!(optimized[1], StageSpec::Match(_)));
    }

    #[test]
    fn prunes_inclusion_projection_to_downstream_needs() {
        let stages = parse_pipeline(&[
            json!({"$project": {"name": 1, "age": 1, "email": 1}}),
            json!({"$project": {"name": 1}}),
        ])
        .unwrap();
        let optimized = Optimizer::new().optimize(stages);
        let StageSpec::Project(first) = &optimized[0] else {
            panic!("expected a project stage");
        };
        assert_eq!(first.simple_fields, vec!["name".to_string()]);
    }

    #[test]
    fn optimizing_twice_is_idempotent() {
        let stages = parse_pipeline(&[json!({"$sort": {"score": -1}}), json!({"$limit": 5})]).unwrap();
        let once = Optimizer::new().optimize(stages);
        let twice = Optimizer::new().optimize(once.clone());
        assert_eq!(once.len(), twice.len());
        assert!(matches!((&once[0], &twice[0]), (StageSpec::TopK { .. }, StageSpec::TopK { .. })));
    }
}
