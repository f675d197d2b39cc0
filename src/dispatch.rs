// =============================================================================
// Dispatch Boundary — "<entity>.<operation>" routing
// =============================================================================
//
// One entry point for every operator action: an action string, a JSON
// payload, and an execution context naming the caller's org/agent. The
// entity segment parses into a fixed enum with one handler per family and a
// single unknown-entity fallback; handlers validate the payload, check
// scope ownership, and call into the core modules. No business logic lives
// here.
//
// Errors leave as `{code, message, details}`: a failed promotion, for
// example, carries the failing criteria by name in `details`.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{PipelineError, PipelineResult};
use crate::learning::{self, QueueDecision};
use crate::model::{
    AnalystSpec, ConsensusThresholds, LearningConfig, LearningKind, LearningSource,
    LearningStatus, NotificationConfig, Scope, Source, Target, TierConfig, Universe,
};
use crate::promotion;
use crate::review_queue::{self, ReviewDecision};
use crate::scheduler::{self, WorkerKind};
use crate::symbols;
use crate::testdata;
use crate::types::{Direction, Domain, LlmTier, SourceKind};

// =============================================================================
// Context, errors, parsing
// =============================================================================

/// Who is calling. Scope ownership checks compare against the universe's
/// own org/agent pair.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub org_id: String,
    pub agent_id: String,
}

/// A dispatch failure: the typed pipeline error plus optional structured
/// details for the wire body.
#[derive(Debug)]
pub struct DispatchError {
    pub error: PipelineError,
    pub details: Option<Value>,
}

impl From<PipelineError> for DispatchError {
    fn from(error: PipelineError) -> Self {
        Self { error, details: None }
    }
}

pub type DispatchResult = Result<Value, DispatchError>;

/// The fixed set of entity families the boundary routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityFamily {
    Universes,
    Targets,
    Sources,
    Predictions,
    Analysts,
    Strategies,
    Learnings,
    LearningQueue,
    ReviewQueue,
    MissedOpportunities,
    TestScenarios,
    TestArticles,
    TestPriceData,
    TestTargetMirrors,
    RunnerTriggers,
}

impl EntityFamily {
    pub fn parse(entity: &str) -> Option<Self> {
        Some(match entity {
            "universes" => Self::Universes,
            "targets" => Self::Targets,
            "sources" => Self::Sources,
            "predictions" => Self::Predictions,
            "analysts" => Self::Analysts,
            // A strategy is an analyst roster entry on a Universe; both names
            // route to the same handlers.
            "strategies" => Self::Strategies,
            "learnings" => Self::Learnings,
            "learning-queue" => Self::LearningQueue,
            "review-queue" => Self::ReviewQueue,
            "missed-opportunities" => Self::MissedOpportunities,
            "test-scenarios" => Self::TestScenarios,
            "test-articles" => Self::TestArticles,
            "test-price-data" => Self::TestPriceData,
            "test-target-mirrors" => Self::TestTargetMirrors,
            "runner-triggers" => Self::RunnerTriggers,
            _ => return None,
        })
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> PipelineResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| PipelineError::validation("INVALID_PAYLOAD", format!("payload rejected: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> PipelineResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| PipelineError::consistency(format!("response serialisation failed: {e}")))
}

fn unknown_operation(entity: &str, op: &str) -> DispatchError {
    PipelineError::validation(
        "UNKNOWN_OPERATION",
        format!("entity '{entity}' has no operation '{op}'"),
    )
    .into()
}

/// Scope ownership gate for every universe-anchored mutation and read.
fn authorize(universe: &Universe, ctx: &ExecContext) -> PipelineResult<()> {
    if universe.org_id != ctx.org_id || universe.agent_id != ctx.agent_id {
        return Err(PipelineError::denied(format!(
            "universe {} is not owned by {}/{}",
            universe.id, ctx.org_id, ctx.agent_id
        )));
    }
    Ok(())
}

// =============================================================================
// Entry point
// =============================================================================

/// Route one action string. Unknown entities and unknown operations come
/// back as typed validation errors, never panics.
pub async fn execute(
    state: &Arc<AppState>,
    action: &str,
    payload: Value,
    ctx: &ExecContext,
) -> DispatchResult {
    let Some((entity, op)) = action.split_once('.') else {
        return Err(PipelineError::validation(
            "INVALID_ACTION",
            format!("action '{action}' is not of the form '<entity>.<operation>'"),
        )
        .into());
    };
    let Some(family) = EntityFamily::parse(entity) else {
        return Err(
            PipelineError::validation("UNKNOWN_ENTITY", format!("unknown entity '{entity}'"))
                .into(),
        );
    };

    let result = match family {
        EntityFamily::Universes => universes(state, entity, op, payload, ctx),
        EntityFamily::Targets => targets(state, entity, op, payload, ctx),
        EntityFamily::Sources => sources(state, entity, op, payload, ctx),
        EntityFamily::Predictions => predictions(state, entity, op, payload, ctx),
        EntityFamily::Analysts | EntityFamily::Strategies => {
            analysts_family(state, entity, op, payload, ctx)
        }
        EntityFamily::Learnings => learnings(state, entity, op, payload),
        EntityFamily::LearningQueue => learning_queue(state, entity, op, payload),
        EntityFamily::ReviewQueue => review_queue_family(state, entity, op, payload),
        EntityFamily::MissedOpportunities => {
            return missed_opportunities(state, entity, op, payload).await
        }
        EntityFamily::TestScenarios => test_scenarios(state, entity, op, payload, ctx),
        EntityFamily::TestArticles => test_articles(state, entity, op, payload),
        EntityFamily::TestPriceData => test_price_data(state, entity, op, payload),
        EntityFamily::TestTargetMirrors => test_mirrors(state, entity, op, payload),
        EntityFamily::RunnerTriggers => return runner_triggers(state, entity, op, payload).await,
    };

    if result.is_ok() {
        state.increment_version();
    }
    result
}

// =============================================================================
// Universes
// =============================================================================

#[derive(Deserialize)]
struct UniverseCreate {
    name: String,
    domain: Domain,
    #[serde(default)]
    tiers: std::collections::HashMap<LlmTier, TierConfig>,
    #[serde(default)]
    thresholds: Option<ConsensusThresholds>,
    #[serde(default)]
    analysts: Vec<AnalystSpec>,
    #[serde(default)]
    resolution_horizon_hours: Option<i64>,
    #[serde(default)]
    notification: Option<NotificationConfig>,
}

#[derive(Deserialize)]
struct ById {
    id: Uuid,
}

fn universes(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    payload: Value,
    ctx: &ExecContext,
) -> DispatchResult {
    let store = &state.store;
    match op {
        "create" => {
            let req: UniverseCreate = parse_payload(payload)?;
            let thresholds = req.thresholds.unwrap_or_default();
            thresholds.validate()?;
            let universe = Universe {
                id: Uuid::new_v4(),
                org_id: ctx.org_id.clone(),
                agent_id: ctx.agent_id.clone(),
                name: req.name,
                domain: req.domain,
                tiers: req.tiers,
                thresholds,
                analysts: req.analysts,
                resolution_horizon_hours: req.resolution_horizon_hours,
                notification: req.notification,
                active: true,
                created_at: Utc::now(),
            };
            store.insert_universe(universe.clone());
            Ok(to_json(&universe)?)
        }
        "get" => {
            let req: ById = parse_payload(payload)?;
            let universe = store.universe(req.id)?;
            authorize(&universe, ctx)?;
            Ok(to_json(&universe)?)
        }
        "list" => {
            let owned: Vec<Universe> = store
                .list_universes()
                .into_iter()
                .filter(|u| u.org_id == ctx.org_id && u.agent_id == ctx.agent_id)
                .collect();
            Ok(to_json(&owned)?)
        }
        "update-thresholds" => {
            #[derive(Deserialize)]
            struct Req {
                id: Uuid,
                thresholds: ConsensusThresholds,
            }
            let req: Req = parse_payload(payload)?;
            req.thresholds.validate()?;
            let universe = store.universe(req.id)?;
            authorize(&universe, ctx)?;
            let updated = store.update_universe(req.id, |u| u.thresholds = req.thresholds)?;
            Ok(to_json(&updated)?)
        }
        "deactivate" => {
            let req: ById = parse_payload(payload)?;
            let universe = store.universe(req.id)?;
            authorize(&universe, ctx)?;
            let updated = store.update_universe(req.id, |u| u.active = false)?;
            Ok(to_json(&updated)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

// =============================================================================
// Targets
// =============================================================================

fn targets(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    payload: Value,
    ctx: &ExecContext,
) -> DispatchResult {
    let store = &state.store;
    match op {
        "create" => {
            #[derive(Deserialize)]
            struct Req {
                universe_id: Uuid,
                symbol: String,
                kind: String,
                #[serde(default)]
                tier_override: Option<LlmTier>,
            }
            let req: Req = parse_payload(payload)?;
            let universe = store.universe(req.universe_id)?;
            authorize(&universe, ctx)?;
            // Test-namespace targets only come from scenario mirrors.
            if symbols::is_test_symbol(&req.symbol) {
                return Err(PipelineError::validation(
                    "INVALID_SYMBOL",
                    format!(
                        "'{}' is in the test namespace; create it via a scenario mirror",
                        req.symbol
                    ),
                )
                .into());
            }
            if store.target_by_symbol(req.universe_id, &req.symbol).is_some() {
                return Err(PipelineError::validation(
                    "DUPLICATE_SYMBOL",
                    format!("universe already tracks '{}'", req.symbol),
                )
                .into());
            }
            let target = Target {
                id: Uuid::new_v4(),
                universe_id: req.universe_id,
                symbol: req.symbol,
                kind: req.kind,
                tier_override: req.tier_override,
                archived: false,
                created_at: Utc::now(),
            };
            store.insert_target(target.clone());
            Ok(to_json(&target)?)
        }
        "list" => {
            #[derive(Deserialize)]
            struct Req {
                universe_id: Uuid,
            }
            let req: Req = parse_payload(payload)?;
            let universe = store.universe(req.universe_id)?;
            authorize(&universe, ctx)?;
            Ok(to_json(&store.list_targets(req.universe_id))?)
        }
        "archive" => {
            let req: ById = parse_payload(payload)?;
            let target = store.target(req.id)?;
            let universe = store.universe(target.universe_id)?;
            authorize(&universe, ctx)?;
            let updated = store.update_target(req.id, |t| t.archived = true)?;
            Ok(to_json(&updated)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

// =============================================================================
// Sources
// =============================================================================

fn sources(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    payload: Value,
    ctx: &ExecContext,
) -> DispatchResult {
    let store = &state.store;
    match op {
        "create" => {
            #[derive(Deserialize)]
            struct Req {
                universe_id: Uuid,
                name: String,
                kind: SourceKind,
                #[serde(default)]
                url: Option<String>,
                crawl_interval_minutes: u64,
            }
            let req: Req = parse_payload(payload)?;
            let universe = store.universe(req.universe_id)?;
            authorize(&universe, ctx)?;
            // test_db sources are owned by the scenario runner.
            if req.kind == SourceKind::TestDb {
                return Err(PipelineError::validation(
                    "INVALID_SOURCE_KIND",
                    "test_db sources are created by running a scenario",
                )
                .into());
            }
            if req.url.is_none() {
                return Err(PipelineError::validation(
                    "MISSING_URL",
                    format!("source '{}' needs a fetch URL", req.name),
                )
                .into());
            }
            let source = Source {
                id: Uuid::new_v4(),
                universe_id: req.universe_id,
                name: req.name,
                kind: req.kind,
                url: req.url,
                crawl_interval_minutes: req.crawl_interval_minutes.max(1),
                is_test: false,
                scenario_run_id: None,
                enabled: true,
                consecutive_failures: 0,
                last_crawled_at: None,
                created_at: Utc::now(),
            };
            store.insert_source(source.clone());
            Ok(to_json(&source)?)
        }
        "list" => Ok(to_json(&state.store.list_sources())?),
        "enable" | "disable" => {
            let enable = op == "enable";
            let req: ById = parse_payload(payload)?;
            let source = store.source(req.id)?;
            let universe = store.universe(source.universe_id)?;
            authorize(&universe, ctx)?;
            let updated = store.update_source(req.id, |s| {
                s.enabled = enable;
                if enable {
                    s.consecutive_failures = 0;
                }
            })?;
            Ok(to_json(&updated)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

// =============================================================================
// Predictions
// =============================================================================

fn predictions(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    payload: Value,
    ctx: &ExecContext,
) -> DispatchResult {
    let store = &state.store;
    match op {
        "current" => {
            #[derive(Deserialize)]
            struct Req {
                target_id: Uuid,
            }
            let req: Req = parse_payload(payload)?;
            let target = store.target(req.target_id)?;
            let universe = store.universe(target.universe_id)?;
            authorize(&universe, ctx)?;
            Ok(to_json(&store.current_prediction(req.target_id))?)
        }
        "list" => {
            #[derive(Deserialize)]
            struct Req {
                target_id: Uuid,
            }
            let req: Req = parse_payload(payload)?;
            let target = store.target(req.target_id)?;
            let universe = store.universe(target.universe_id)?;
            authorize(&universe, ctx)?;
            Ok(to_json(&store.predictions_for_target(req.target_id))?)
        }
        "get" => {
            let req: ById = parse_payload(payload)?;
            let prediction = store.prediction(req.id)?;
            let universe = store.universe(prediction.universe_id)?;
            authorize(&universe, ctx)?;
            Ok(to_json(&prediction)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

// =============================================================================
// Analyst roster
// =============================================================================

fn analysts_family(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    payload: Value,
    ctx: &ExecContext,
) -> DispatchResult {
    let store = &state.store;
    match op {
        "add" => {
            #[derive(Deserialize)]
            struct Req {
                universe_id: Uuid,
                analyst: AnalystSpec,
            }
            let req: Req = parse_payload(payload)?;
            let universe = store.universe(req.universe_id)?;
            authorize(&universe, ctx)?;
            if universe.analysts.iter().any(|a| a.id == req.analyst.id) {
                return Err(PipelineError::validation(
                    "DUPLICATE_ANALYST",
                    format!("analyst '{}' already on the roster", req.analyst.id),
                )
                .into());
            }
            let updated =
                store.update_universe(req.universe_id, |u| u.analysts.push(req.analyst))?;
            Ok(to_json(&updated.analysts)?)
        }
        "update" => {
            #[derive(Deserialize)]
            struct Req {
                universe_id: Uuid,
                analyst_id: String,
                #[serde(default)]
                weight: Option<f64>,
                #[serde(default)]
                tier: Option<LlmTier>,
                #[serde(default)]
                enabled: Option<bool>,
            }
            let req: Req = parse_payload(payload)?;
            let universe = store.universe(req.universe_id)?;
            authorize(&universe, ctx)?;
            if !universe.analysts.iter().any(|a| a.id == req.analyst_id) {
                return Err(PipelineError::not_found("analyst", req.analyst_id).into());
            }
            let updated = store.update_universe(req.universe_id, |u| {
                if let Some(a) = u.analysts.iter_mut().find(|a| a.id == req.analyst_id) {
                    if let Some(w) = req.weight {
                        a.weight = w;
                    }
                    if let Some(t) = req.tier {
                        a.tier = t;
                    }
                    if let Some(e) = req.enabled {
                        a.enabled = e;
                    }
                }
            })?;
            Ok(to_json(&updated.analysts)?)
        }
        "remove" => {
            #[derive(Deserialize)]
            struct Req {
                universe_id: Uuid,
                analyst_id: String,
            }
            let req: Req = parse_payload(payload)?;
            let universe = store.universe(req.universe_id)?;
            authorize(&universe, ctx)?;
            let updated = store.update_universe(req.universe_id, |u| {
                u.analysts.retain(|a| a.id != req.analyst_id)
            })?;
            Ok(to_json(&updated.analysts)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

// =============================================================================
// Learnings & promotion
// =============================================================================

fn learnings(state: &Arc<AppState>, entity: &str, op: &str, payload: Value) -> DispatchResult {
    let store = &state.store;
    match op {
        "create" => {
            #[derive(Deserialize)]
            struct Req {
                scope: Scope,
                kind: LearningKind,
                #[serde(default)]
                config: LearningConfig,
                #[serde(default)]
                is_test: bool,
            }
            let req: Req = parse_payload(payload)?;
            let learning = learning::create_learning(
                store,
                req.scope,
                req.kind,
                req.config,
                LearningSource::Human,
                req.is_test,
                None,
                None,
                Utc::now(),
            );
            Ok(to_json(&learning)?)
        }
        "list" => Ok(to_json(&store.list_learnings())?),
        "disable" => {
            let req: ById = parse_payload(payload)?;
            let updated = store.update_learning(req.id, |l| l.status = LearningStatus::Disabled)?;
            Ok(to_json(&updated)?)
        }
        "backtest" => {
            let req: ById = parse_payload(payload)?;
            let criteria = state.runtime_config.read().promotion.to_criteria();
            let report = promotion::backtest(store, req.id, &criteria)?;
            Ok(to_json(&report)?)
        }
        "promote" => {
            #[derive(Deserialize)]
            struct Req {
                id: Uuid,
                reviewer: String,
                #[serde(default)]
                notes: Option<String>,
            }
            let req: Req = parse_payload(payload)?;
            let criteria = state.runtime_config.read().promotion.to_criteria();

            // A failing gate carries the criteria names in the error details.
            let report = promotion::backtest(store, req.id, &criteria)?;
            if !report.passed {
                return Err(DispatchError {
                    error: PipelineError::validation(
                        "PROMOTION_CRITERIA_NOT_MET",
                        format!("backtest failed: {}", report.failing_criteria.join(", ")),
                    ),
                    details: Some(json!({
                        "failing_criteria": report.failing_criteria,
                        "report": to_json(&report)?,
                    })),
                });
            }

            let record = promotion::promote(
                store,
                req.id,
                &req.reviewer,
                req.notes,
                &criteria,
                Utc::now(),
            )?;
            Ok(to_json(&record)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

fn learning_queue(state: &Arc<AppState>, entity: &str, op: &str, payload: Value) -> DispatchResult {
    let store = &state.store;
    match op {
        "list" => Ok(to_json(&store.pending_queue_items())?),
        "resolve" => {
            #[derive(Deserialize)]
            #[serde(tag = "decision", rename_all = "snake_case")]
            enum Decision {
                Approve,
                Reject,
                Modify {
                    scope: Scope,
                    kind: LearningKind,
                    config: LearningConfig,
                },
            }
            #[derive(Deserialize)]
            struct Req {
                id: Uuid,
                #[serde(flatten)]
                decision: Decision,
            }
            let req: Req = parse_payload(payload)?;
            let decision = match req.decision {
                Decision::Approve => QueueDecision::Approve,
                Decision::Reject => QueueDecision::Reject,
                Decision::Modify { scope, kind, config } => {
                    QueueDecision::Modify { scope, kind, config }
                }
            };
            let resolved = learning::resolve_queue_item(store, req.id, decision, Utc::now())?;
            Ok(to_json(&resolved)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

fn review_queue_family(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    payload: Value,
) -> DispatchResult {
    let store = &state.store;
    match op {
        "list" => Ok(to_json(&store.pending_review_items())?),
        "resolve" => {
            #[derive(Deserialize)]
            #[serde(tag = "decision", rename_all = "snake_case")]
            enum Decision {
                Approve {
                    #[serde(default)]
                    strength_override: Option<f64>,
                    #[serde(default)]
                    note: Option<String>,
                },
                Reject {
                    #[serde(default)]
                    note: Option<String>,
                },
                Modify {
                    strength: f64,
                    #[serde(default)]
                    note: Option<String>,
                },
            }
            #[derive(Deserialize)]
            struct Req {
                id: Uuid,
                #[serde(flatten)]
                decision: Decision,
            }
            let req: Req = parse_payload(payload)?;
            let decision = match req.decision {
                Decision::Approve { strength_override, note } => {
                    ReviewDecision::Approve { strength_override, note }
                }
                Decision::Reject { note } => ReviewDecision::Reject { note },
                Decision::Modify { strength, note } => ReviewDecision::Modify { strength, note },
            };
            let resolved = review_queue::resolve(store, req.id, decision, Utc::now())?;
            Ok(to_json(&resolved)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

// =============================================================================
// Missed opportunities
// =============================================================================

async fn missed_opportunities(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    _payload: Value,
) -> DispatchResult {
    match op {
        "scan" => {
            let report = scheduler::run_worker(state, WorkerKind::MissedOpportunity).await;
            Ok(report)
        }
        "list" => {
            let items: Vec<_> = state
                .store
                .pending_queue_items()
                .into_iter()
                .filter(|i| i.reasoning.starts_with("missed opportunity"))
                .collect();
            Ok(to_json(&items)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

// =============================================================================
// Test data
// =============================================================================

fn test_scenarios(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    payload: Value,
    ctx: &ExecContext,
) -> DispatchResult {
    let store = &state.store;
    match op {
        "create" => {
            #[derive(Deserialize)]
            struct Req {
                universe_id: Uuid,
                name: String,
                #[serde(default)]
                description: Option<String>,
            }
            let req: Req = parse_payload(payload)?;
            let universe = store.universe(req.universe_id)?;
            authorize(&universe, ctx)?;
            let scenario =
                testdata::create_scenario(store, req.universe_id, req.name, req.description, Utc::now())?;
            Ok(to_json(&scenario)?)
        }
        "list" => Ok(to_json(&store.list_test_scenarios())?),
        "run" => {
            let req: ById = parse_payload(payload)?;
            let run = testdata::run_scenario(store, req.id, Utc::now())?;
            Ok(json!({ "run_id": run.run_id, "source_id": run.source_id }))
        }
        "cleanup-run" => {
            #[derive(Deserialize)]
            struct Req {
                run_id: Uuid,
            }
            let req: Req = parse_payload(payload)?;
            let removed = testdata::cleanup_run(store, req.run_id);
            Ok(json!({ "removed": removed }))
        }
        "delete" => {
            let req: ById = parse_payload(payload)?;
            let removed = testdata::delete_scenario(store, req.id)?;
            Ok(json!({ "removed": removed }))
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

fn test_articles(state: &Arc<AppState>, entity: &str, op: &str, payload: Value) -> DispatchResult {
    let store = &state.store;
    match op {
        "add" => {
            #[derive(Deserialize)]
            struct Req {
                scenario_id: Uuid,
                symbol: String,
                title: String,
                body: String,
                #[serde(default)]
                direction_hint: Option<Direction>,
                #[serde(default)]
                strength_hint: Option<f64>,
                #[serde(default)]
                published_at: Option<chrono::DateTime<Utc>>,
            }
            let req: Req = parse_payload(payload)?;
            let article = testdata::add_article(
                store,
                req.scenario_id,
                req.symbol,
                req.title,
                req.body,
                req.direction_hint,
                req.strength_hint,
                req.published_at.unwrap_or_else(Utc::now),
            )?;
            Ok(to_json(&article)?)
        }
        "list" => {
            #[derive(Deserialize)]
            struct Req {
                scenario_id: Uuid,
            }
            let req: Req = parse_payload(payload)?;
            Ok(to_json(&store.list_test_articles(req.scenario_id))?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

fn test_price_data(state: &Arc<AppState>, entity: &str, op: &str, payload: Value) -> DispatchResult {
    match op {
        "add" => {
            #[derive(Deserialize)]
            struct Req {
                scenario_id: Uuid,
                symbol: String,
                at: chrono::DateTime<Utc>,
                price: f64,
            }
            let req: Req = parse_payload(payload)?;
            let point =
                testdata::add_price(&state.store, req.scenario_id, req.symbol, req.at, req.price)?;
            Ok(to_json(&point)?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

fn test_mirrors(state: &Arc<AppState>, entity: &str, op: &str, payload: Value) -> DispatchResult {
    let store = &state.store;
    match op {
        "create" => {
            #[derive(Deserialize)]
            struct Req {
                scenario_id: Uuid,
                real_symbol: String,
            }
            let req: Req = parse_payload(payload)?;
            let mirror = testdata::create_mirror(store, req.scenario_id, &req.real_symbol, Utc::now())?;
            Ok(to_json(&mirror)?)
        }
        "list" => {
            #[derive(Deserialize)]
            struct Req {
                scenario_id: Uuid,
            }
            let req: Req = parse_payload(payload)?;
            Ok(to_json(&store.list_test_mirrors(req.scenario_id))?)
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

// =============================================================================
// Runner triggers
// =============================================================================

async fn runner_triggers(
    state: &Arc<AppState>,
    entity: &str,
    op: &str,
    payload: Value,
) -> DispatchResult {
    match op {
        "run" => {
            #[derive(Deserialize)]
            struct Req {
                runner: String,
            }
            let req: Req = parse_payload(payload)?;
            let Some(kind) = WorkerKind::parse(&req.runner) else {
                return Err(
                    PipelineError::not_found("runner", req.runner).into(),
                );
            };
            let report = scheduler::run_worker(state, kind).await;
            Ok(json!({ "runner": kind.name(), "report": report }))
        }
        _ => Err(unknown_operation(entity, op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;

    fn ctx() -> ExecContext {
        ExecContext { org_id: "org-1".into(), agent_id: "agent-1".into() }
    }

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(RuntimeConfig::default()))
    }

    async fn create_universe(state: &Arc<AppState>, ctx: &ExecContext) -> Uuid {
        let out = execute(
            state,
            "universes.create",
            json!({ "name": "us-equities", "domain": "equities" }),
            ctx,
        )
        .await
        .unwrap();
        out["id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn unknown_entity_and_operation_are_typed() {
        let state = state();
        let err = execute(&state, "widgets.create", json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.error.code(), "UNKNOWN_ENTITY");

        let err = execute(&state, "universes.explode", json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.error.code(), "UNKNOWN_OPERATION");

        let err = execute(&state, "noperiod", json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.error.code(), "INVALID_ACTION");
    }

    #[tokio::test]
    async fn universe_create_and_target_roundtrip() {
        let state = state();
        let ctx = ctx();
        let universe_id = create_universe(&state, &ctx).await;

        let target = execute(
            &state,
            "targets.create",
            json!({ "universe_id": universe_id, "symbol": "AAPL", "kind": "equity" }),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(target["symbol"], "AAPL");

        // Duplicates and test-namespace symbols are rejected.
        let err = execute(
            &state,
            "targets.create",
            json!({ "universe_id": universe_id, "symbol": "AAPL", "kind": "equity" }),
            &ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.code(), "DUPLICATE_SYMBOL");

        let err = execute(
            &state,
            "targets.create",
            json!({ "universe_id": universe_id, "symbol": "T_AAPL", "kind": "equity" }),
            &ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.code(), "INVALID_SYMBOL");
    }

    #[tokio::test]
    async fn foreign_org_is_denied() {
        let state = state();
        let owner = ctx();
        let universe_id = create_universe(&state, &owner).await;

        let intruder = ExecContext { org_id: "org-2".into(), agent_id: "agent-9".into() };
        let err = execute(
            &state,
            "universes.deactivate",
            json!({ "id": universe_id }),
            &intruder,
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.code(), "DENIED");
        assert_eq!(err.error.http_status(), 403);
    }

    #[tokio::test]
    async fn malformed_thresholds_are_rejected() {
        let state = state();
        let err = execute(
            &state,
            "universes.create",
            json!({
                "name": "bad",
                "domain": "crypto",
                "thresholds": {
                    "min_predictors": 0,
                    "min_combined_strength": 15.0,
                    "min_direction_consensus": 0.6
                }
            }),
            &ctx(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.code(), "INVALID_THRESHOLDS");
    }

    #[tokio::test]
    async fn test_db_source_cannot_be_created_directly() {
        let state = state();
        let ctx = ctx();
        let universe_id = create_universe(&state, &ctx).await;

        let err = execute(
            &state,
            "sources.create",
            json!({
                "universe_id": universe_id,
                "name": "sneaky",
                "kind": "test_db",
                "crawl_interval_minutes": 5
            }),
            &ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.code(), "INVALID_SOURCE_KIND");
    }

    #[tokio::test]
    async fn scenario_lifecycle_via_dispatch() {
        let state = state();
        let ctx = ctx();
        let universe_id = create_universe(&state, &ctx).await;

        let scenario = execute(
            &state,
            "test-scenarios.create",
            json!({ "universe_id": universe_id, "name": "earnings-shock" }),
            &ctx,
        )
        .await
        .unwrap();
        let scenario_id = scenario["id"].as_str().unwrap().to_string();

        execute(
            &state,
            "test-articles.add",
            json!({
                "scenario_id": scenario_id,
                "symbol": "T_AAPL",
                "title": "synthetic beat",
                "body": "numbers way up",
                "direction_hint": "bullish",
                "strength_hint": 8.0
            }),
            &ctx,
        )
        .await
        .unwrap();

        let run = execute(
            &state,
            "test-scenarios.run",
            json!({ "id": scenario_id }),
            &ctx,
        )
        .await
        .unwrap();
        assert!(run["run_id"].is_string());

        let cleaned = execute(
            &state,
            "test-scenarios.cleanup-run",
            json!({ "run_id": run["run_id"] }),
            &ctx,
        )
        .await
        .unwrap();
        assert!(cleaned["removed"].is_number());
    }

    #[tokio::test]
    async fn strategies_route_to_the_analyst_roster() {
        let state = state();
        let ctx = ctx();
        let universe_id = create_universe(&state, &ctx).await;

        let roster = execute(
            &state,
            "strategies.add",
            json!({
                "universe_id": universe_id,
                "analyst": { "id": "contrarian", "name": "Contrarian", "tier": "silver" }
            }),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(roster[0]["id"], "contrarian");

        // Same roster is visible through the analysts name.
        let err = execute(
            &state,
            "analysts.add",
            json!({
                "universe_id": universe_id,
                "analyst": { "id": "contrarian", "name": "Contrarian", "tier": "silver" }
            }),
            &ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.code(), "DUPLICATE_ANALYST");

        let roster = execute(
            &state,
            "strategies.remove",
            json!({ "universe_id": universe_id, "analyst_id": "contrarian" }),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(roster.as_array().map(|r| r.len()), Some(0));
    }

    #[tokio::test]
    async fn runner_trigger_runs_and_unknown_runner_404s() {
        let state = state();
        let out = execute(
            &state,
            "runner-triggers.run",
            json!({ "runner": "prediction_batch" }),
            &ctx(),
        )
        .await
        .unwrap();
        assert_eq!(out["runner"], "prediction_batch");

        let err = execute(
            &state,
            "runner-triggers.run",
            json!({ "runner": "alpha_decay" }),
            &ctx(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.http_status(), 404);
    }

    #[tokio::test]
    async fn failed_promotion_carries_details() {
        let state = state();
        // A test learning with no outcomes at all fails every data criterion.
        let learning = learning::create_learning(
            &state.store,
            Scope::Runner,
            LearningKind::Threshold,
            LearningConfig::default(),
            LearningSource::Human,
            true,
            None,
            None,
            Utc::now(),
        );

        let err = execute(
            &state,
            "learnings.promote",
            json!({ "id": learning.id, "reviewer": "casey" }),
            &ctx(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.error.code(), "PROMOTION_CRITERIA_NOT_MET");
        let details = err.details.unwrap();
        assert!(details["failing_criteria"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "min_sample_size"));
    }
}
