//! Row decoding. Enum columns are stored as their wire strings.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;

use superplane::error::Result;
use superplane::model::{
    Approval, Canvas, Condition, Connection, Event, EventSource, EventState, Execution,
    ExecutionResult, ExecutionState, FilterOperator, Organization, RunTemplate, Secret,
    SourceType, Stage, StageEvent, StageEventState, StateReason, Tag, TagState, TagUsage,
};

use crate::error::DbResultExt;

pub(crate) const ORGANIZATION_COLUMNS: &str =
    "id, name, display_name, created_by, created_at, updated_at, deleted_at";
pub(crate) const CANVAS_COLUMNS: &str =
    "id, organization_id, name, created_by, created_at, updated_at";
pub(crate) const SOURCE_COLUMNS: &str = "id, canvas_id, name, key, created_at, updated_at";
pub(crate) const SECRET_COLUMNS: &str =
    "id, canvas_id, name, provider, data, created_by, created_at, updated_at";
pub(crate) const STAGE_COLUMNS: &str = "id, canvas_id, name, created_by, created_at, updated_at, \
     conditions, run_template, inputs, outputs, input_mappings, tag_usage, secrets";
pub(crate) const CONNECTION_COLUMNS: &str =
    "id, stage_id, source_id, source_name, source_type, filters, filter_operator";
pub(crate) const EVENT_COLUMNS: &str =
    "id, source_id, source_name, source_type, state, received_at, raw, headers";
pub(crate) const STAGE_EVENT_COLUMNS: &str = "id, stage_id, event_id, source_id, source_name, \
     source_type, state, state_reason, created_at, inputs";
pub(crate) const EXECUTION_COLUMNS: &str = "id, stage_id, stage_event_id, state, result, \
     reference_id, outputs, created_at, updated_at, started_at, finished_at, dispatch_attempts";

fn json<T: DeserializeOwned>(row: &PgRow, column: &str) -> Result<T> {
    Ok(row.try_get::<Json<T>, _>(column).db()?.0)
}

fn text(row: &PgRow, column: &str) -> Result<String> {
    row.try_get(column).db()
}

pub(crate) fn organization(row: &PgRow) -> Result<Organization> {
    Ok(Organization {
        id: row.try_get("id").db()?,
        name: text(row, "name")?,
        display_name: text(row, "display_name")?,
        created_by: text(row, "created_by")?,
        created_at: row.try_get("created_at").db()?,
        updated_at: row.try_get("updated_at").db()?,
        deleted_at: row.try_get("deleted_at").db()?,
    })
}

pub(crate) fn canvas(row: &PgRow) -> Result<Canvas> {
    Ok(Canvas {
        id: row.try_get("id").db()?,
        organization_id: row.try_get("organization_id").db()?,
        name: text(row, "name")?,
        created_by: text(row, "created_by")?,
        created_at: row.try_get("created_at").db()?,
        updated_at: row.try_get("updated_at").db()?,
    })
}

pub(crate) fn event_source(row: &PgRow) -> Result<EventSource> {
    Ok(EventSource {
        id: row.try_get("id").db()?,
        canvas_id: row.try_get("canvas_id").db()?,
        name: text(row, "name")?,
        key: row.try_get("key").db()?,
        created_at: row.try_get("created_at").db()?,
        updated_at: row.try_get("updated_at").db()?,
    })
}

pub(crate) fn secret(row: &PgRow) -> Result<Secret> {
    Ok(Secret {
        id: row.try_get("id").db()?,
        canvas_id: row.try_get("canvas_id").db()?,
        name: text(row, "name")?,
        provider: text(row, "provider")?,
        data: row.try_get("data").db()?,
        created_by: text(row, "created_by")?,
        created_at: row.try_get("created_at").db()?,
        updated_at: row.try_get("updated_at").db()?,
    })
}

pub(crate) fn stage(row: &PgRow) -> Result<Stage> {
    Ok(Stage {
        id: row.try_get("id").db()?,
        canvas_id: row.try_get("canvas_id").db()?,
        name: text(row, "name")?,
        created_by: text(row, "created_by")?,
        created_at: row.try_get("created_at").db()?,
        updated_at: row.try_get("updated_at").db()?,
        conditions: json::<Vec<Condition>>(row, "conditions")?,
        run_template: json::<RunTemplate>(row, "run_template")?,
        inputs: json(row, "inputs")?,
        outputs: json(row, "outputs")?,
        input_mappings: json(row, "input_mappings")?,
        tag_usage: row
            .try_get::<Option<Json<TagUsage>>, _>("tag_usage")
            .db()?
            .map(|j| j.0),
        secrets: json(row, "secrets")?,
    })
}

pub(crate) fn connection(row: &PgRow) -> Result<Connection> {
    Ok(Connection {
        id: row.try_get("id").db()?,
        stage_id: row.try_get("stage_id").db()?,
        source_id: row.try_get("source_id").db()?,
        source_name: text(row, "source_name")?,
        source_type: SourceType::parse(&text(row, "source_type")?)?,
        filters: json(row, "filters")?,
        filter_operator: FilterOperator::parse(&text(row, "filter_operator")?)?,
    })
}

pub(crate) fn event(row: &PgRow) -> Result<Event> {
    Ok(Event {
        id: row.try_get("id").db()?,
        source_id: row.try_get("source_id").db()?,
        source_name: text(row, "source_name")?,
        source_type: SourceType::parse(&text(row, "source_type")?)?,
        state: EventState::parse(&text(row, "state")?)?,
        received_at: row.try_get("received_at").db()?,
        raw: row.try_get("raw").db()?,
        headers: json::<BTreeMap<String, String>>(row, "headers")?,
    })
}

pub(crate) fn stage_event(row: &PgRow) -> Result<StageEvent> {
    let reason: Option<String> = row.try_get("state_reason").db()?;
    Ok(StageEvent {
        id: row.try_get("id").db()?,
        stage_id: row.try_get("stage_id").db()?,
        event_id: row.try_get("event_id").db()?,
        source_id: row.try_get("source_id").db()?,
        source_name: text(row, "source_name")?,
        source_type: SourceType::parse(&text(row, "source_type")?)?,
        state: StageEventState::parse(&text(row, "state")?)?,
        state_reason: match reason {
            Some(reason) => StateReason::parse(&reason)?,
            None => None,
        },
        created_at: row.try_get("created_at").db()?,
        inputs: json(row, "inputs")?,
    })
}

pub(crate) fn approval(row: &PgRow) -> Result<Approval> {
    Ok(Approval {
        stage_event_id: row.try_get("stage_event_id").db()?,
        approved_by: text(row, "approved_by")?,
        approved_at: row.try_get("approved_at").db()?,
    })
}

pub(crate) fn tag(row: &PgRow) -> Result<Tag> {
    Ok(Tag {
        stage_event_id: row.try_get("stage_event_id").db()?,
        name: text(row, "name")?,
        value: text(row, "value")?,
        state: TagState::parse(&text(row, "state")?)?,
    })
}

pub(crate) fn execution(row: &PgRow) -> Result<Execution> {
    let result: Option<String> = row.try_get("result").db()?;
    let attempts: i32 = row.try_get("dispatch_attempts").db()?;
    Ok(Execution {
        id: row.try_get("id").db()?,
        stage_id: row.try_get("stage_id").db()?,
        stage_event_id: row.try_get("stage_event_id").db()?,
        state: ExecutionState::parse(&text(row, "state")?)?,
        result: match result {
            Some(result) => ExecutionResult::parse(&result)?,
            None => None,
        },
        reference_id: row.try_get("reference_id").db()?,
        outputs: json(row, "outputs")?,
        created_at: row.try_get("created_at").db()?,
        updated_at: row.try_get("updated_at").db()?,
        started_at: row.try_get("started_at").db()?,
        finished_at: row.try_get("finished_at").db()?,
        dispatch_attempts: attempts.max(0) as u32,
    })
}

pub(crate) fn all<T>(rows: &[PgRow], decode: fn(&PgRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(decode).collect()
}
