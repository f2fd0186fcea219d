use std::collections::HashSet;

use chrono::Utc;
use uuid::Uuid;

use crate::convergence::session::ConvergenceDeps;
use crate::convergence::state::{ConvergenceState, RunCounters};
use crate::deals::{candidate_key, Deal, NewCandidate, ProcessingGroup, Provenance};
use crate::discovery::build_query;
use crate::queue::{EnqueuePolicy, TargetKey, SCORING_QUEUE};

/// How the side-effecting steps ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepsOutcome {
    NoGroups,
    /// Nothing new was enqueued and a result already exists.
    AlreadyDone,
    NeedsScoring,
    Failed(String),
    /// The session moved on to another entity mid-run.
    Superseded,
}

/// Sink for step transitions. `advance` returns false once the run no
/// longer belongs to the session's current entity.
pub trait StepReporter: Send {
    fn advance(&mut self, state: ConvergenceState, message: &str) -> bool;
    fn counters(&mut self) -> &mut RunCounters;
}

macro_rules! step {
    ($reporter:expr, $state:expr, $msg:expr) => {
        if !$reporter.advance($state, &$msg) {
            return StepsOutcome::Superseded;
        }
    };
}

/// Check, link, discover, enqueue. Only the checking step can fail the run.
pub async fn run_steps(
    deps: &ConvergenceDeps,
    deal_id: Uuid,
    reporter: &mut dyn StepReporter,
) -> StepsOutcome {
    step!(reporter, ConvergenceState::Checking, "Checking processing groups");

    let deal = match deps.deals.load_deal(deal_id).await {
        Ok(Some(deal)) => deal,
        Ok(None) => return StepsOutcome::Failed(format!("deal {deal_id} not found")),
        Err(e) => return StepsOutcome::Failed(format!("failed to load deal: {e}")),
    };
    let groups = match deps.deals.active_groups().await {
        Ok(g) => g,
        Err(e) => return StepsOutcome::Failed(format!("failed to load processing groups: {e}")),
    };
    if groups.is_empty() {
        return StepsOutcome::NoGroups;
    }
    let linked = match deps.deals.linked_groups(deal_id).await {
        Ok(l) => l,
        Err(e) => return StepsOutcome::Failed(format!("failed to load group links: {e}")),
    };
    reporter.counters().groups_total = groups.len();

    let missing: Vec<Uuid> = groups
        .iter()
        .map(|g| g.id)
        .filter(|id| !linked.contains(id))
        .collect();
    step!(
        reporter,
        ConvergenceState::AssigningGroups,
        format!("Linking {} of {} groups", missing.len(), groups.len())
    );
    link_missing(deps, deal_id, &missing, reporter).await;

    step!(reporter, ConvergenceState::Discovering, "Searching for additional buyers");
    let inserted = discover_candidates(deps, &deal).await;
    reporter.counters().candidates_inserted += inserted;

    step!(
        reporter,
        ConvergenceState::Queuing,
        format!("Queuing scoring for {} groups", groups.len())
    );
    let enqueued = enqueue_all(deps, deal_id, &groups, reporter).await;

    if enqueued == 0 {
        match deps.deals.has_result(deal_id).await {
            Ok(true) => return StepsOutcome::AlreadyDone,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(entity_id = %deal_id, error = %e, "result re-check failed; polling instead")
            }
        }
    }

    StepsOutcome::NeedsScoring
}

async fn link_missing(
    deps: &ConvergenceDeps,
    deal_id: Uuid,
    missing: &[Uuid],
    reporter: &mut dyn StepReporter,
) {
    for (batch, chunk) in missing
        .chunks(deps.settings.link_batch_size.max(1))
        .enumerate()
    {
        match deps.deals.link_groups(deal_id, chunk).await {
            Ok(n) => reporter.counters().groups_linked += n,
            Err(e) => {
                reporter.counters().link_failures += 1;
                tracing::warn!(entity_id = %deal_id, batch, error = %e, "group link batch failed");
            }
        }
    }
}

/// Best effort: returns the number of candidates inserted, never fails.
async fn discover_candidates(deps: &ConvergenceDeps, deal: &Deal) -> u64 {
    let Some(req) = build_query(deal) else {
        return 0;
    };

    let found = match deps.discovery.discover(&req).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(entity_id = %deal.id, query = %req.query, error = %e, "discovery failed");
            return 0;
        }
    };

    let mut seen = HashSet::new();
    let fresh: Vec<(String, _)> = found
        .into_iter()
        .filter(|c| !c.already_known)
        .filter_map(|c| {
            let key = candidate_key(&c.name, c.website.as_deref())?;
            seen.insert(key.clone()).then_some((key, c))
        })
        .collect();
    if fresh.is_empty() {
        return 0;
    }

    let keys: Vec<String> = fresh.iter().map(|(k, _)| k.clone()).collect();
    let known = match deps.deals.known_candidates(&keys).await {
        Ok(k) => k,
        Err(e) => {
            // conflicts are skipped on insert anyway
            tracing::debug!(entity_id = %deal.id, error = %e, "known-candidate lookup failed");
            HashSet::new()
        }
    };

    let now = Utc::now();
    let rows: Vec<NewCandidate> = fresh
        .into_iter()
        .filter(|(k, _)| !known.contains(k))
        .map(|(identity_key, c)| NewCandidate {
            identity_key,
            name: c.name,
            website: c.website,
            provenance: Provenance {
                source: deps.discovery.source().to_string(),
                origin_deal_id: deal.id,
                discovered_at: now,
                query: req.query.clone(),
            },
        })
        .collect();

    let mut inserted = 0u64;
    for (batch, chunk) in rows
        .chunks(deps.settings.candidate_batch_size.max(1))
        .enumerate()
    {
        match deps.deals.insert_candidates(chunk).await {
            Ok(n) => inserted += n,
            Err(e) => {
                tracing::warn!(entity_id = %deal.id, batch, error = %e, "candidate insert batch failed")
            }
        }
    }

    tracing::debug!(entity_id = %deal.id, inserted, "discovery finished");
    inserted
}

/// One enqueue per group, continuing past failures. Returns the total
/// number of rows inserted or reset.
async fn enqueue_all(
    deps: &ConvergenceDeps,
    deal_id: Uuid,
    groups: &[ProcessingGroup],
    reporter: &mut dyn StepReporter,
) -> u64 {
    let mut total = 0u64;
    for group in groups {
        let key = TargetKey::scoped(deal_id, group.id);
        match deps
            .queue
            .enqueue(SCORING_QUEUE, &[key], EnqueuePolicy::FillGaps)
            .await
        {
            Ok(report) => total += report.enqueued,
            Err(e) => {
                total += e.enqueued();
                reporter.counters().enqueue_failures += 1;
                tracing::warn!(
                    entity_id = %deal_id,
                    group_id = %group.id,
                    error = %e,
                    "scoring enqueue failed for group"
                );
            }
        }
    }
    reporter.counters().enqueued += total;
    total
}
