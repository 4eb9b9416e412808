//! Persisted domain records.

mod connection;
mod event;
mod execution;
mod organization;
mod stage;
mod stage_event;

pub use connection::{Connection, Filter, FilterOperator};
pub use event::{Event, EventState, SourceType};
pub use execution::{completion_event, Execution, ExecutionResult, ExecutionState, COMPLETION_EVENT_TYPE};
pub use organization::{Canvas, EventSource, Organization, Secret, LOCAL_SECRET_PROVIDER};
pub use stage::{
    Condition, EventDataRef, InputDefinition, InputMapping, LastExecutionRef, MappingCondition,
    OutputDefinition, RunTemplate, SecretRef, Stage, TagDefinition, TagUsage, TimeWindow,
    TriggeredBy, ValueDefinition, ValueFrom,
};
pub use stage_event::{
    Approval, StageEvent, StageEventState, StateReason, Tag, TagFilter, TagState,
};
