//! Hierarchical research memory: Session > Turn > Plan > Action, with the
//! Evidence and Claim sets owned by each Turn.

mod snapshot;
mod store;
mod types;

pub use snapshot::{replay_lineage, LineageDelta, PlanSnapshot, StepView, TurnSnapshot};
pub use store::MemoryStore;
pub use types::{
    Action, ActionHandle, ActionKind, ActionStatus, Claim, ClaimLineage, ConfigSnapshot, Cost,
    Evidence, NewClaim, NewEvidence, Plan, PlanRevision, PriorTurn, Session, SourceKind, Step,
    StepSpec, StepStatus, Turn, TurnOutcome, TurnStatus,
};
