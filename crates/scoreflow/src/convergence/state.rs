use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceState {
    Idle,
    Checking,
    AssigningGroups,
    Discovering,
    Queuing,
    Scoring,
    Done,
    NoGroups,
    /// Poll budget exhausted without observing a result. Not an error.
    StillProcessing,
    Error,
}

impl ConvergenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvergenceState::Idle => "idle",
            ConvergenceState::Checking => "checking",
            ConvergenceState::AssigningGroups => "assigning_groups",
            ConvergenceState::Discovering => "discovering",
            ConvergenceState::Queuing => "queuing",
            ConvergenceState::Scoring => "scoring",
            ConvergenceState::Done => "done",
            ConvergenceState::NoGroups => "no_groups",
            ConvergenceState::StillProcessing => "still_processing",
            ConvergenceState::Error => "error",
        }
    }

    /// `None` for `Error`, which keeps whatever was shown before.
    pub fn percent(&self) -> Option<u8> {
        match self {
            ConvergenceState::Idle => Some(0),
            ConvergenceState::Checking => Some(5),
            ConvergenceState::AssigningGroups => Some(20),
            ConvergenceState::Discovering => Some(40),
            ConvergenceState::Queuing => Some(60),
            ConvergenceState::Scoring => Some(80),
            ConvergenceState::StillProcessing => Some(90),
            ConvergenceState::Done | ConvergenceState::NoGroups => Some(100),
            ConvergenceState::Error => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConvergenceState::Done
                | ConvergenceState::NoGroups
                | ConvergenceState::StillProcessing
                | ConvergenceState::Error
        )
    }
}

/// Side-effect tallies for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub groups_total: usize,
    pub groups_linked: u64,
    pub link_failures: usize,
    pub candidates_inserted: u64,
    pub enqueued: u64,
    pub enqueue_failures: usize,
    pub polls: u32,
}

/// What a session publishes to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvergenceStatus {
    pub entity_id: Option<Uuid>,
    pub state: ConvergenceState,
    pub message: String,
    pub progress: u8,
    pub counters: RunCounters,
}

impl ConvergenceStatus {
    pub fn idle(entity_id: Option<Uuid>) -> Self {
        Self {
            entity_id,
            state: ConvergenceState::Idle,
            message: String::new(),
            progress: 0,
            counters: RunCounters::default(),
        }
    }

    /// Move to `state`; progress follows the state except on `Error`.
    pub fn advance(&mut self, state: ConvergenceState, message: impl Into<String>) {
        self.state = state;
        self.message = message.into();
        if let Some(p) = state.percent() {
            self.progress = p;
        }
    }
}
