use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::deals::model::{Deal, NewCandidate, ProcessingGroup};
use crate::deals::store::DealStore;

/// In-process deal store with call counters and failure hooks.
#[derive(Default)]
pub struct MemoryDealStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    deals: HashMap<Uuid, Deal>,
    // BTreeMap keeps group order stable across calls
    groups: BTreeMap<Uuid, ProcessingGroup>,
    links: HashSet<(Uuid, Uuid)>,
    scored: HashMap<Uuid, usize>,
    candidates: BTreeMap<String, NewCandidate>,

    link_calls: usize,
    candidate_insert_calls: usize,

    fail_deal_load: bool,
    fail_group_load: bool,
    fail_link_batches: bool,
    fail_candidate_inserts: bool,
    fail_result_check: bool,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_deal(&self, deal: Deal) {
        self.state.lock().await.deals.insert(deal.id, deal);
    }

    pub async fn add_group(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.groups.insert(
            id,
            ProcessingGroup {
                id,
                name: name.to_string(),
                active: true,
            },
        );
        id
    }

    pub async fn deactivate_group(&self, group_id: Uuid) {
        if let Some(g) = self.state.lock().await.groups.get_mut(&group_id) {
            g.active = false;
        }
    }

    pub async fn link(&self, deal_id: Uuid, group_id: Uuid) {
        self.state.lock().await.links.insert((deal_id, group_id));
    }

    /// Record a score row, standing in for the scoring worker.
    pub async fn insert_score(&self, deal_id: Uuid) {
        *self.state.lock().await.scored.entry(deal_id).or_default() += 1;
    }

    /// Seed the candidate pool with an existing identity key.
    pub async fn add_known_candidate(&self, candidate: NewCandidate) {
        self.state
            .lock()
            .await
            .candidates
            .insert(candidate.identity_key.clone(), candidate);
    }

    pub async fn candidates(&self) -> Vec<NewCandidate> {
        self.state.lock().await.candidates.values().cloned().collect()
    }

    pub async fn link_calls(&self) -> usize {
        self.state.lock().await.link_calls
    }

    pub async fn candidate_insert_calls(&self) -> usize {
        self.state.lock().await.candidate_insert_calls
    }

    pub async fn fail_deal_load(&self, fail: bool) {
        self.state.lock().await.fail_deal_load = fail;
    }

    pub async fn fail_group_load(&self, fail: bool) {
        self.state.lock().await.fail_group_load = fail;
    }

    pub async fn fail_link_batches(&self, fail: bool) {
        self.state.lock().await.fail_link_batches = fail;
    }

    pub async fn fail_candidate_inserts(&self, fail: bool) {
        self.state.lock().await.fail_candidate_inserts = fail;
    }

    pub async fn fail_result_check(&self, fail: bool) {
        self.state.lock().await.fail_result_check = fail;
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn load_deal(&self, deal_id: Uuid) -> anyhow::Result<Option<Deal>> {
        let st = self.state.lock().await;
        if st.fail_deal_load {
            anyhow::bail!("injected deal load failure");
        }
        Ok(st.deals.get(&deal_id).cloned())
    }

    async fn active_groups(&self) -> anyhow::Result<Vec<ProcessingGroup>> {
        let st = self.state.lock().await;
        if st.fail_group_load {
            anyhow::bail!("injected group load failure");
        }
        Ok(st.groups.values().filter(|g| g.active).cloned().collect())
    }

    async fn linked_groups(&self, deal_id: Uuid) -> anyhow::Result<HashSet<Uuid>> {
        let st = self.state.lock().await;
        if st.fail_group_load {
            anyhow::bail!("injected group load failure");
        }
        Ok(st
            .links
            .iter()
            .filter(|(d, _)| *d == deal_id)
            .map(|(_, g)| *g)
            .collect())
    }

    async fn link_groups(&self, deal_id: Uuid, group_ids: &[Uuid]) -> anyhow::Result<u64> {
        let mut st = self.state.lock().await;
        st.link_calls += 1;
        if st.fail_link_batches {
            anyhow::bail!("injected link failure");
        }
        let mut created = 0u64;
        for g in group_ids {
            if st.links.insert((deal_id, *g)) {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn has_result(&self, deal_id: Uuid) -> anyhow::Result<bool> {
        let st = self.state.lock().await;
        if st.fail_result_check {
            anyhow::bail!("injected result check failure");
        }
        Ok(st.scored.get(&deal_id).is_some_and(|n| *n > 0))
    }

    async fn known_candidates(&self, keys: &[String]) -> anyhow::Result<HashSet<String>> {
        let st = self.state.lock().await;
        Ok(keys
            .iter()
            .filter(|k| st.candidates.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn insert_candidates(&self, candidates: &[NewCandidate]) -> anyhow::Result<u64> {
        let mut st = self.state.lock().await;
        st.candidate_insert_calls += 1;
        if st.fail_candidate_inserts {
            anyhow::bail!("injected candidate insert failure");
        }
        let mut inserted = 0u64;
        for c in candidates {
            if !st.candidates.contains_key(&c.identity_key) {
                st.candidates.insert(c.identity_key.clone(), c.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}
