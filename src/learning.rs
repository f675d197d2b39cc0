// =============================================================================
// Learnings — scoped scoring-rule adjustments and the suggestion queue
// =============================================================================
//
// A Learning is config-as-data: optional threshold overrides, analyst weight
// overrides, a strength multiplier, or an avoid flag, applied at one of four
// scope levels. At read time the consensus engine folds all active learnings
// covering a target into one EffectiveConfig, broader scopes first so that
// narrower scopes override them.
//
// AI-generated suggestions land in the LearningQueue and only become active
// Learnings through a human decision (approve / reject / modify).
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::model::{
    ConsensusThresholds, Learning, LearningConfig, LearningKind, LearningQueueItem,
    LearningSource, LearningStatus, QueueStatus, Scope,
};
use crate::store::Store;
use crate::types::Domain;

// =============================================================================
// Effective config
// =============================================================================

/// The merged adjustment set a consensus/ensemble run actually sees.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub thresholds: ConsensusThresholds,
    pub analyst_weights: HashMap<String, f64>,
    pub strength_multiplier: f64,
    pub avoid: bool,
}

impl EffectiveConfig {
    pub fn base(thresholds: ConsensusThresholds) -> Self {
        Self {
            thresholds,
            analyst_weights: HashMap::new(),
            strength_multiplier: 1.0,
            avoid: false,
        }
    }

    /// Weight for one analyst, defaulting to the roster weight when no
    /// learning overrides it.
    pub fn analyst_weight(&self, analyst_id: &str, roster_weight: f64) -> f64 {
        self.analyst_weights
            .get(analyst_id)
            .copied()
            .unwrap_or(roster_weight)
    }
}

/// Fold the active learnings covering `(domain, universe, target)` over the
/// universe's base thresholds. Broader scopes apply first; narrower scopes
/// override field by field. Within one scope level, newer learnings win.
pub fn effective_config(
    base: ConsensusThresholds,
    learnings: &[Learning],
    domain: Domain,
    universe_id: Uuid,
    target_id: Uuid,
) -> EffectiveConfig {
    let mut applicable: Vec<&Learning> = learnings
        .iter()
        .filter(|l| {
            l.status == LearningStatus::Active && l.scope.covers(domain, universe_id, target_id)
        })
        .collect();
    applicable.sort_by_key(|l| (l.scope.specificity(), l.created_at));

    let mut effective = EffectiveConfig::base(base);
    for learning in applicable {
        let cfg = &learning.config;
        if let Some(v) = cfg.min_predictors {
            effective.thresholds.min_predictors = v;
        }
        if let Some(v) = cfg.min_combined_strength {
            effective.thresholds.min_combined_strength = v;
        }
        if let Some(v) = cfg.min_direction_consensus {
            effective.thresholds.min_direction_consensus = v;
        }
        for (analyst, weight) in &cfg.analyst_weights {
            effective.analyst_weights.insert(analyst.clone(), *weight);
        }
        if let Some(v) = cfg.strength_multiplier {
            effective.strength_multiplier = v;
        }
        if cfg.avoid {
            effective.avoid = true;
        }
    }
    effective
}

// =============================================================================
// Learning creation
// =============================================================================

/// Create an active Learning directly (human-authored or promotion output).
#[allow(clippy::too_many_arguments)]
pub fn create_learning(
    store: &Store,
    scope: Scope,
    kind: LearningKind,
    config: LearningConfig,
    source: LearningSource,
    is_test: bool,
    scenario_run_id: Option<Uuid>,
    evaluation_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Learning {
    let learning = Learning {
        id: Uuid::new_v4(),
        scope,
        kind,
        config,
        status: LearningStatus::Active,
        source,
        is_test,
        scenario_run_id,
        evaluation_id,
        superseded_by: None,
        created_at: now,
    };
    store.insert_learning(learning.clone());
    info!(learning_id = %learning.id, scope = ?scope, kind = ?kind, is_test, "learning created");
    learning
}

/// Mark `old_id` superseded by `new_id`, preserving lineage.
pub fn supersede(store: &Store, old_id: Uuid, new_id: Uuid) -> PipelineResult<()> {
    store.update_learning(old_id, |l| {
        l.status = LearningStatus::Superseded;
        l.superseded_by = Some(new_id);
    })?;
    Ok(())
}

// =============================================================================
// Learning queue
// =============================================================================

/// Enqueue an AI-generated suggestion for human review.
#[allow(clippy::too_many_arguments)]
pub fn suggest(
    store: &Store,
    scope: Scope,
    kind: LearningKind,
    config: LearningConfig,
    reasoning: String,
    ai_confidence: f64,
    is_test: bool,
    scenario_run_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> LearningQueueItem {
    let item = LearningQueueItem {
        id: Uuid::new_v4(),
        suggested_scope: scope,
        suggested_kind: kind,
        suggested_config: config,
        reasoning,
        ai_confidence,
        status: QueueStatus::Pending,
        resolved_learning_id: None,
        is_test,
        scenario_run_id,
        created_at: now,
        resolved_at: None,
    };
    store.insert_queue_item(item.clone());
    info!(item_id = %item.id, scope = ?scope, confidence = ai_confidence, "learning suggested");
    item
}

/// A human decision on a queue item.
#[derive(Debug, Clone)]
pub enum QueueDecision {
    Approve,
    Reject,
    /// Accept with an altered scope/config.
    Modify {
        scope: Scope,
        kind: LearningKind,
        config: LearningConfig,
    },
}

/// Resolve a pending queue item. Approve and Modify produce an active
/// Learning; Reject leaves only the resolved queue row behind.
pub fn resolve_queue_item(
    store: &Store,
    item_id: Uuid,
    decision: QueueDecision,
    now: DateTime<Utc>,
) -> PipelineResult<LearningQueueItem> {
    let item = store.queue_item(item_id)?;
    if item.status != QueueStatus::Pending {
        return Err(crate::error::PipelineError::validation(
            "ALREADY_RESOLVED",
            format!("queue item {item_id} is already {:?}", item.status),
        ));
    }

    let (status, learning) = match decision {
        QueueDecision::Approve => {
            let learning = create_learning(
                store,
                item.suggested_scope,
                item.suggested_kind,
                item.suggested_config.clone(),
                LearningSource::AiApproved,
                item.is_test,
                item.scenario_run_id,
                None,
                now,
            );
            (QueueStatus::Approved, Some(learning))
        }
        QueueDecision::Reject => (QueueStatus::Rejected, None),
        QueueDecision::Modify { scope, kind, config } => {
            let learning = create_learning(
                store,
                scope,
                kind,
                config,
                LearningSource::Human,
                item.is_test,
                item.scenario_run_id,
                None,
                now,
            );
            (QueueStatus::Modified, Some(learning))
        }
    };

    store.update_queue_item(item_id, |i| {
        i.status = status;
        i.resolved_learning_id = learning.as_ref().map(|l| l.id);
        i.resolved_at = Some(now);
    })
}
