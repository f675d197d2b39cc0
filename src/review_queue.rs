// =============================================================================
// Review Queue — human gate for gray-zone predictors
// =============================================================================
//
// A predictor whose confidence lands in the configured gray zone (default
// 0.4–0.7) is written `Held` and queued here instead of feeding consensus.
// A human decision resolves it:
//
//   approve — predictor becomes consensus input as if auto-approved, with an
//             optional strength override
//   reject  — predictor never feeds consensus
//   modify  — approve with a replacement strength
//
// A free-text note on any resolution seeds a LearningQueue candidate scoped
// to the predictor's target.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::learning;
use crate::model::{
    LearningConfig, LearningKind, Predictor, ReviewDisposition, ReviewItem, ReviewStatus, Scope,
};
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;

/// Decide the initial disposition for a freshly assessed predictor.
pub fn disposition_for(config: &RuntimeConfig, confidence: f64) -> ReviewDisposition {
    if config.in_review_gray_zone(confidence) {
        ReviewDisposition::Held
    } else {
        ReviewDisposition::Auto
    }
}

/// Queue a held predictor for human review.
pub fn enqueue(store: &Store, predictor: &Predictor, now: DateTime<Utc>) -> ReviewItem {
    let item = ReviewItem {
        id: Uuid::new_v4(),
        predictor_id: predictor.id,
        universe_id: predictor.universe_id,
        confidence: predictor.confidence,
        status: ReviewStatus::Pending,
        strength_override: None,
        note: None,
        is_test: predictor.is_test,
        created_at: now,
        resolved_at: None,
    };
    store.insert_review_item(item.clone());
    info!(
        predictor_id = %predictor.id,
        confidence = predictor.confidence,
        "predictor held for review"
    );
    item
}

/// A human decision on a review item.
#[derive(Debug, Clone)]
pub enum ReviewDecision {
    Approve { strength_override: Option<f64>, note: Option<String> },
    Reject { note: Option<String> },
    Modify { strength: f64, note: Option<String> },
}

/// Resolve a pending review item and update its predictor accordingly.
pub fn resolve(
    store: &Store,
    item_id: Uuid,
    decision: ReviewDecision,
    now: DateTime<Utc>,
) -> PipelineResult<ReviewItem> {
    let item = store.review_item(item_id)?;
    if item.status != ReviewStatus::Pending {
        return Err(PipelineError::validation(
            "ALREADY_RESOLVED",
            format!("review item {item_id} is already {:?}", item.status),
        ));
    }

    let predictor = store.predictor(item.predictor_id)?;

    let (status, disposition, strength_override, note) = match decision {
        ReviewDecision::Approve { strength_override, note } => {
            (ReviewStatus::Approved, ReviewDisposition::Approved, strength_override, note)
        }
        ReviewDecision::Reject { note } => {
            (ReviewStatus::Rejected, ReviewDisposition::Rejected, None, note)
        }
        ReviewDecision::Modify { strength, note } => {
            (ReviewStatus::Modified, ReviewDisposition::Approved, Some(strength), note)
        }
    };

    store.update_predictor(predictor.id, |p| {
        p.disposition = disposition;
        if let Some(s) = strength_override {
            p.strength = s.clamp(0.0, 10.0);
        }
    })?;

    // The reviewer's note becomes a learning candidate tied to the target.
    if let Some(text) = &note {
        if !text.trim().is_empty() {
            learning::suggest(
                store,
                Scope::Target(predictor.target_id),
                LearningKind::Pattern,
                LearningConfig::default(),
                format!("review note on predictor {}: {}", predictor.id, text.trim()),
                predictor.confidence,
                predictor.is_test,
                predictor.scenario_run_id,
                now,
            );
        }
    }

    let resolved = store.update_review_item(item_id, |i| {
        i.status = status;
        i.strength_override = strength_override;
        i.note = note.clone();
        i.resolved_at = Some(now);
    })?;

    info!(
        item_id = %item_id,
        predictor_id = %predictor.id,
        status = ?status,
        "review item resolved"
    );
    Ok(resolved)
}
