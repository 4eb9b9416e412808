use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use superplane::error::{Error, Result};
use superplane::model::{
    Approval, Canvas, Connection, Event, EventSource, EventState, Execution, ExecutionResult,
    Organization, Secret, SourceType, Stage, StageEvent, StageEventState, StateReason, Tag,
    TagFilter, TagState,
};
use superplane::store::{dispatch_backoff, stale_join, FanOut, Finish, Store};

use crate::error::DbResultExt;
use crate::rows::{self, *};
use crate::PgStore;

fn names<T>(values: &[T], as_str: fn(&T) -> &'static str) -> Vec<String> {
    values.iter().map(|v| as_str(v).to_string()).collect()
}

async fn insert_event(conn: &mut PgConnection, event: &Event) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO events (id, source_id, source_name, source_type, state, received_at, raw, headers)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.id)
    .bind(event.source_id)
    .bind(&event.source_name)
    .bind(event.source_type.as_str())
    .bind(event.state.as_str())
    .bind(event.received_at)
    .bind(&event.raw)
    .bind(Json(&event.headers))
    .execute(&mut *conn)
    .await
    .db()?;
    Ok(())
}

async fn insert_connections(conn: &mut PgConnection, connections: &[Connection]) -> Result<()> {
    for connection in connections {
        sqlx::query(
            r#"
            INSERT INTO connections (id, stage_id, source_id, source_name, source_type, filters, filter_operator)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(connection.id)
        .bind(connection.stage_id)
        .bind(connection.source_id)
        .bind(&connection.source_name)
        .bind(connection.source_type.as_str())
        .bind(Json(&connection.filters))
        .bind(connection.filter_operator.as_str())
        .execute(&mut *conn)
        .await
        .db()?;
    }
    Ok(())
}

/// Stage events, tags, sibling cancellation and the event's state flip.
async fn apply_fan_out_in(conn: &mut PgConnection, fan_out: &FanOut) -> Result<()> {
    let state = if fan_out.is_discarded() {
        EventState::Discarded
    } else {
        EventState::Processed
    };
    let flipped = sqlx::query("UPDATE events SET state = $2 WHERE id = $1 AND state = 'pending'")
        .bind(fan_out.event_id)
        .bind(state.as_str())
        .execute(&mut *conn)
        .await
        .db()?;
    if flipped.rows_affected() == 0 {
        return Err(Error::Conflict("event already routed".into()));
    }

    for new in &fan_out.stage_events {
        let se = &new.stage_event;
        sqlx::query(
            r#"
            INSERT INTO stage_events
                (id, stage_id, event_id, source_id, source_name, source_type, state, state_reason, created_at, inputs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(se.id)
        .bind(se.stage_id)
        .bind(se.event_id)
        .bind(se.source_id)
        .bind(&se.source_name)
        .bind(se.source_type.as_str())
        .bind(se.state.as_str())
        .bind(se.state_reason.map(|r| r.as_str()))
        .bind(se.created_at)
        .bind(Json(&se.inputs))
        .execute(&mut *conn)
        .await
        .db()?;

        for tag in &new.tags {
            sqlx::query(
                "INSERT INTO stage_event_tags (stage_event_id, name, value, state) VALUES ($1, $2, $3, $4)",
            )
            .bind(tag.stage_event_id)
            .bind(&tag.name)
            .bind(&tag.value)
            .bind(tag.state.as_str())
            .execute(&mut *conn)
            .await
            .db()?;
        }
    }

    if !fan_out.cancelled.is_empty() {
        let mut siblings = fan_out.cancelled.clone();
        siblings.sort();
        siblings.dedup();
        let cancelled = sqlx::query(
            r#"
            UPDATE stage_events
            SET state = 'processed', state_reason = 'cancelled'
            WHERE id = ANY($1) AND state = 'waiting'
            "#,
        )
        .bind(&siblings)
        .execute(&mut *conn)
        .await
        .db()?;
        // The caller's transaction rolls back on error.
        if cancelled.rows_affected() != siblings.len() as u64 {
            return Err(stale_join());
        }
    }
    Ok(())
}

impl PgStore {
    /// Distinguish a missing execution from one in the wrong state after a
    /// conditional update matched nothing.
    async fn execution_conflict(&self, id: Uuid, message: &str) -> Error {
        match self.find_execution(id).await {
            Ok(Some(_)) => Error::Conflict(message.to_string()),
            Ok(None) => Error::not_found("execution"),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_organization(&self, org: &Organization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, display_name, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(&org.display_name)
        .bind(&org.created_by)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(self.pool())
        .await
        .db()?;
        Ok(())
    }

    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        let sql = format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::organization).transpose()
    }

    async fn find_organization_by_name(&self, name: &str) -> Result<Option<Organization>> {
        let sql = format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE name = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&sql).bind(name).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::organization).transpose()
    }

    async fn list_organizations(&self, ids: &[Uuid]) -> Result<Vec<Organization>> {
        let sql = format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations \
             WHERE id = ANY($1) AND deleted_at IS NULL ORDER BY name"
        );
        let found = sqlx::query(&sql).bind(ids).fetch_all(self.pool()).await.db()?;
        rows::all(&found, rows::organization)
    }

    async fn update_organization(&self, org: &Organization) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET name = $2, display_name = $3, updated_at = $4
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(&org.display_name)
        .bind(org.updated_at)
        .execute(self.pool())
        .await
        .db()?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("organization"));
        }
        Ok(())
    }

    async fn soft_delete_organization(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE organizations SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .db()?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("organization"));
        }
        Ok(())
    }

    async fn create_canvas(&self, canvas: &Canvas) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO canvases (id, organization_id, name, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(canvas.id)
        .bind(canvas.organization_id)
        .bind(&canvas.name)
        .bind(&canvas.created_by)
        .bind(canvas.created_at)
        .bind(canvas.updated_at)
        .execute(self.pool())
        .await
        .db()?;
        Ok(())
    }

    async fn find_canvas(&self, id: Uuid) -> Result<Option<Canvas>> {
        let sql = format!("SELECT {CANVAS_COLUMNS} FROM canvases WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::canvas).transpose()
    }

    async fn find_canvas_by_name(&self, organization_id: Uuid, name: &str) -> Result<Option<Canvas>> {
        let sql = format!("SELECT {CANVAS_COLUMNS} FROM canvases WHERE organization_id = $1 AND name = $2");
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .db()?;
        row.as_ref().map(rows::canvas).transpose()
    }

    async fn list_canvases(&self, organization_id: Uuid) -> Result<Vec<Canvas>> {
        let sql = format!("SELECT {CANVAS_COLUMNS} FROM canvases WHERE organization_id = $1 ORDER BY name");
        let found = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_all(self.pool())
            .await
            .db()?;
        rows::all(&found, rows::canvas)
    }

    async fn create_event_source(&self, source: &EventSource) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_sources (id, canvas_id, name, key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(source.id)
        .bind(source.canvas_id)
        .bind(&source.name)
        .bind(&source.key)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(self.pool())
        .await
        .db()?;
        Ok(())
    }

    async fn find_event_source(&self, id: Uuid) -> Result<Option<EventSource>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM event_sources WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::event_source).transpose()
    }

    async fn find_event_source_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<EventSource>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM event_sources WHERE canvas_id = $1 AND name = $2");
        let row = sqlx::query(&sql)
            .bind(canvas_id)
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .db()?;
        row.as_ref().map(rows::event_source).transpose()
    }

    async fn list_event_sources(&self, canvas_id: Uuid) -> Result<Vec<EventSource>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM event_sources WHERE canvas_id = $1 ORDER BY name");
        let found = sqlx::query(&sql).bind(canvas_id).fetch_all(self.pool()).await.db()?;
        rows::all(&found, rows::event_source)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secrets (id, canvas_id, name, provider, data, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(secret.id)
        .bind(secret.canvas_id)
        .bind(&secret.name)
        .bind(&secret.provider)
        .bind(&secret.data)
        .bind(&secret.created_by)
        .bind(secret.created_at)
        .bind(secret.updated_at)
        .execute(self.pool())
        .await
        .db()?;
        Ok(())
    }

    async fn find_secret_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<Secret>> {
        let sql = format!("SELECT {SECRET_COLUMNS} FROM secrets WHERE canvas_id = $1 AND name = $2");
        let row = sqlx::query(&sql)
            .bind(canvas_id)
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .db()?;
        row.as_ref().map(rows::secret).transpose()
    }

    async fn list_secrets(&self, canvas_id: Uuid) -> Result<Vec<Secret>> {
        let sql = format!("SELECT {SECRET_COLUMNS} FROM secrets WHERE canvas_id = $1 ORDER BY name");
        let found = sqlx::query(&sql).bind(canvas_id).fetch_all(self.pool()).await.db()?;
        rows::all(&found, rows::secret)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<()> {
        let result = sqlx::query(
            "UPDATE secrets SET provider = $2, data = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(secret.id)
        .bind(&secret.provider)
        .bind(&secret.data)
        .bind(secret.updated_at)
        .execute(self.pool())
        .await
        .db()?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("secret {}", secret.name)));
        }
        Ok(())
    }

    async fn delete_secret(&self, canvas_id: Uuid, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM secrets WHERE canvas_id = $1 AND name = $2")
            .bind(canvas_id)
            .bind(name)
            .execute(self.pool())
            .await
            .db()?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("secret {name}")));
        }
        Ok(())
    }

    async fn create_stage(&self, stage: &Stage, connections: &[Connection]) -> Result<()> {
        let mut tx = self.pool().begin().await.db()?;
        sqlx::query(
            r#"
            INSERT INTO stages
                (id, canvas_id, name, created_by, created_at, updated_at, conditions,
                 run_template, inputs, outputs, input_mappings, tag_usage, secrets)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(stage.id)
        .bind(stage.canvas_id)
        .bind(&stage.name)
        .bind(&stage.created_by)
        .bind(stage.created_at)
        .bind(stage.updated_at)
        .bind(Json(&stage.conditions))
        .bind(Json(&stage.run_template))
        .bind(Json(&stage.inputs))
        .bind(Json(&stage.outputs))
        .bind(Json(&stage.input_mappings))
        .bind(stage.tag_usage.as_ref().map(Json))
        .bind(Json(&stage.secrets))
        .execute(&mut *tx)
        .await
        .db()?;

        insert_connections(&mut tx, connections).await?;
        tx.commit().await.db()
    }

    async fn update_stage(&self, stage: &Stage, connections: &[Connection]) -> Result<Vec<StageEvent>> {
        let mut tx = self.pool().begin().await.db()?;
        let result = sqlx::query(
            r#"
            UPDATE stages
            SET name = $2, updated_at = $3, conditions = $4, run_template = $5, inputs = $6,
                outputs = $7, input_mappings = $8, tag_usage = $9, secrets = $10
            WHERE id = $1
            "#,
        )
        .bind(stage.id)
        .bind(&stage.name)
        .bind(stage.updated_at)
        .bind(Json(&stage.conditions))
        .bind(Json(&stage.run_template))
        .bind(Json(&stage.inputs))
        .bind(Json(&stage.outputs))
        .bind(Json(&stage.input_mappings))
        .bind(stage.tag_usage.as_ref().map(Json))
        .bind(Json(&stage.secrets))
        .execute(&mut *tx)
        .await
        .db()?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("stage"));
        }

        sqlx::query("DELETE FROM connections WHERE stage_id = $1")
            .bind(stage.id)
            .execute(&mut *tx)
            .await
            .db()?;
        insert_connections(&mut tx, connections).await?;

        let connected: Vec<Uuid> = connections.iter().map(|c| c.source_id).collect();
        let sql = format!(
            r#"
            UPDATE stage_events
            SET state = 'processed', state_reason = 'connection'
            WHERE stage_id = $1
              AND state IN ('pending', 'waiting')
              AND NOT (source_id = ANY($2))
            RETURNING {STAGE_EVENT_COLUMNS}
            "#
        );
        let invalidated = sqlx::query(&sql)
            .bind(stage.id)
            .bind(&connected)
            .fetch_all(&mut *tx)
            .await
            .db()?;

        tx.commit().await.db()?;
        rows::all(&invalidated, rows::stage_event)
    }

    async fn find_stage(&self, id: Uuid) -> Result<Option<Stage>> {
        let sql = format!("SELECT {STAGE_COLUMNS} FROM stages WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::stage).transpose()
    }

    async fn find_stage_by_name(&self, canvas_id: Uuid, name: &str) -> Result<Option<Stage>> {
        let sql = format!("SELECT {STAGE_COLUMNS} FROM stages WHERE canvas_id = $1 AND name = $2");
        let row = sqlx::query(&sql)
            .bind(canvas_id)
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .db()?;
        row.as_ref().map(rows::stage).transpose()
    }

    async fn list_stages(&self, canvas_id: Uuid) -> Result<Vec<Stage>> {
        let sql = format!("SELECT {STAGE_COLUMNS} FROM stages WHERE canvas_id = $1 ORDER BY created_at, id");
        let found = sqlx::query(&sql).bind(canvas_id).fetch_all(self.pool()).await.db()?;
        rows::all(&found, rows::stage)
    }

    async fn list_connections_for_stage(&self, stage_id: Uuid) -> Result<Vec<Connection>> {
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE stage_id = $1");
        let found = sqlx::query(&sql).bind(stage_id).fetch_all(self.pool()).await.db()?;
        rows::all(&found, rows::connection)
    }

    async fn list_connections_for_source(&self, source_id: Uuid, source_type: SourceType) -> Result<Vec<Connection>> {
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections WHERE source_id = $1 AND source_type = $2"
        );
        let found = sqlx::query(&sql)
            .bind(source_id)
            .bind(source_type.as_str())
            .fetch_all(self.pool())
            .await
            .db()?;
        rows::all(&found, rows::connection)
    }

    async fn create_event(&self, event: &Event) -> Result<()> {
        let mut conn = self.pool().acquire().await.db()?;
        insert_event(&mut conn, event).await
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::event).transpose()
    }

    async fn list_pending_events(&self, limit: usize) -> Result<Vec<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE state = 'pending' ORDER BY received_at, id LIMIT $1"
        );
        let found = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await
            .db()?;
        rows::all(&found, rows::event)
    }

    async fn last_event_by_source(&self, source_id: Uuid) -> Result<Option<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE source_id = $1 ORDER BY received_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql).bind(source_id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::event).transpose()
    }

    async fn apply_fan_out(&self, fan_out: &FanOut) -> Result<()> {
        let mut tx = self.pool().begin().await.db()?;
        apply_fan_out_in(&mut tx, fan_out).await?;
        tx.commit().await.db()
    }

    async fn find_stage_event(&self, id: Uuid) -> Result<Option<StageEvent>> {
        let sql = format!("SELECT {STAGE_EVENT_COLUMNS} FROM stage_events WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::stage_event).transpose()
    }

    async fn list_stage_events(&self, stage_id: Uuid, states: &[StageEventState]) -> Result<Vec<StageEvent>> {
        let sql = format!(
            r#"
            SELECT {STAGE_EVENT_COLUMNS} FROM stage_events
            WHERE stage_id = $1 AND (cardinality($2::text[]) = 0 OR state = ANY($2))
            ORDER BY created_at, id
            "#
        );
        let found = sqlx::query(&sql)
            .bind(stage_id)
            .bind(names(states, StageEventState::as_str))
            .fetch_all(self.pool())
            .await
            .db()?;
        rows::all(&found, rows::stage_event)
    }

    async fn oldest_pending_stage_event(&self, stage_id: Uuid) -> Result<Option<StageEvent>> {
        let sql = format!(
            r#"
            SELECT {STAGE_EVENT_COLUMNS} FROM stage_events
            WHERE stage_id = $1 AND state = 'pending'
            ORDER BY created_at, id
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql).bind(stage_id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::stage_event).transpose()
    }

    async fn stages_with_pending_events(&self) -> Result<Vec<Uuid>> {
        let found = sqlx::query(
            "SELECT DISTINCT stage_id FROM stage_events WHERE state = 'pending' ORDER BY stage_id",
        )
        .fetch_all(self.pool())
        .await
        .db()?;
        found.iter().map(|r| r.try_get("stage_id").db()).collect()
    }

    async fn stage_events_waiting_for_time_window(&self) -> Result<Vec<StageEvent>> {
        let sql = format!(
            r#"
            SELECT {STAGE_EVENT_COLUMNS} FROM stage_events
            WHERE state = 'waiting' AND state_reason = 'time-window'
            ORDER BY created_at, id
            "#
        );
        let found = sqlx::query(&sql).fetch_all(self.pool()).await.db()?;
        rows::all(&found, rows::stage_event)
    }

    async fn transition_stage_event(
        &self,
        id: Uuid,
        from: &[StageEventState],
        to: StageEventState,
        reason: Option<StateReason>,
    ) -> Result<Option<StageEvent>> {
        let sql = format!(
            r#"
            UPDATE stage_events SET state = $3, state_reason = $4
            WHERE id = $1 AND state = ANY($2)
            RETURNING {STAGE_EVENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(names(from, StageEventState::as_str))
            .bind(to.as_str())
            .bind(reason.map(|r| r.as_str()))
            .fetch_optional(self.pool())
            .await
            .db()?;
        row.as_ref().map(rows::stage_event).transpose()
    }

    async fn approve_stage_event(&self, approval: &Approval) -> Result<()> {
        sqlx::query(
            "INSERT INTO stage_event_approvals (stage_event_id, approved_by, approved_at) VALUES ($1, $2, $3)",
        )
        .bind(approval.stage_event_id)
        .bind(&approval.approved_by)
        .bind(approval.approved_at)
        .execute(self.pool())
        .await
        .db()?;
        Ok(())
    }

    async fn list_approvals(&self, stage_event_id: Uuid) -> Result<Vec<Approval>> {
        let found = sqlx::query(
            r#"
            SELECT stage_event_id, approved_by, approved_at FROM stage_event_approvals
            WHERE stage_event_id = $1
            ORDER BY approved_at
            "#,
        )
        .bind(stage_event_id)
        .fetch_all(self.pool())
        .await
        .db()?;
        rows::all(&found, rows::approval)
    }

    async fn list_tags(&self, stage_event_id: Uuid) -> Result<Vec<Tag>> {
        let found = sqlx::query(
            "SELECT stage_event_id, name, value, state FROM stage_event_tags WHERE stage_event_id = $1 ORDER BY name",
        )
        .bind(stage_event_id)
        .fetch_all(self.pool())
        .await
        .db()?;
        rows::all(&found, rows::tag)
    }

    async fn list_stage_tags(&self, filter: &TagFilter) -> Result<Vec<Tag>> {
        let found = sqlx::query(
            r#"
            SELECT t.stage_event_id, t.name, t.value, t.state
            FROM stage_event_tags t
            JOIN stage_events se ON se.id = t.stage_event_id
            JOIN stages s ON s.id = se.stage_id
            WHERE ($1::uuid IS NULL OR s.canvas_id = $1)
              AND ($2::uuid IS NULL OR se.stage_id = $2)
              AND ($3::text IS NULL OR t.name = $3)
              AND ($4::text IS NULL OR t.value = $4)
              AND (cardinality($5::text[]) = 0 OR t.state = ANY($5))
            ORDER BY se.created_at, se.id, t.name
            "#,
        )
        .bind(filter.canvas_id)
        .bind(filter.stage_id)
        .bind(filter.name.as_deref())
        .bind(filter.value.as_deref())
        .bind(names(&filter.states, TagState::as_str))
        .fetch_all(self.pool())
        .await
        .db()?;
        rows::all(&found, rows::tag)
    }

    async fn update_tag_state(&self, filter: &TagFilter, state: TagState) -> Result<Vec<StageEvent>> {
        let mut tx = self.pool().begin().await.db()?;
        let touched = sqlx::query(
            r#"
            UPDATE stage_event_tags t
            SET state = $6
            FROM stage_events se, stages s
            WHERE se.id = t.stage_event_id
              AND s.id = se.stage_id
              AND ($1::uuid IS NULL OR s.canvas_id = $1)
              AND ($2::uuid IS NULL OR se.stage_id = $2)
              AND ($3::text IS NULL OR t.name = $3)
              AND ($4::text IS NULL OR t.value = $4)
              AND (cardinality($5::text[]) = 0 OR t.state = ANY($5))
            RETURNING t.stage_event_id
            "#,
        )
        .bind(filter.canvas_id)
        .bind(filter.stage_id)
        .bind(filter.name.as_deref())
        .bind(filter.value.as_deref())
        .bind(names(&filter.states, TagState::as_str))
        .bind(state.as_str())
        .fetch_all(&mut *tx)
        .await
        .db()?;

        if state == TagState::Unhealthy || touched.is_empty() {
            tx.commit().await.db()?;
            return Ok(Vec::new());
        }

        let ids = touched
            .iter()
            .map(|r| r.try_get::<Uuid, _>("stage_event_id").db())
            .collect::<Result<Vec<Uuid>>>()?;
        let sql = format!(
            r#"
            UPDATE stage_events SET state = 'pending', state_reason = NULL
            WHERE id = ANY($1)
              AND state = 'waiting'
              AND state_reason = 'unhealthy'
              AND NOT EXISTS (
                  SELECT 1 FROM stage_event_tags t
                  WHERE t.stage_event_id = stage_events.id AND t.state = 'unhealthy'
              )
            RETURNING {STAGE_EVENT_COLUMNS}
            "#
        );
        let requeued = sqlx::query(&sql).bind(&ids).fetch_all(&mut *tx).await.db()?;
        tx.commit().await.db()?;

        let mut requeued = rows::all(&requeued, rows::stage_event)?;
        requeued.sort_by_key(|e| (e.created_at, e.id));
        Ok(requeued)
    }

    async fn admit(&self, execution: &Execution) -> Result<()> {
        let mut tx = self.pool().begin().await.db()?;
        let moved = sqlx::query(
            r#"
            UPDATE stage_events SET state = 'processed', state_reason = 'execution'
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(execution.stage_event_id)
        .execute(&mut *tx)
        .await
        .db()?;
        if moved.rows_affected() == 0 {
            return Err(Error::Conflict("stage event is no longer pending".into()));
        }

        sqlx::query(
            r#"
            INSERT INTO executions (id, stage_id, stage_event_id, state, outputs, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(execution.id)
        .bind(execution.stage_id)
        .bind(execution.stage_event_id)
        .bind(execution.state.as_str())
        .bind(Json(&execution.outputs))
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .db()?;

        tx.commit().await.db()
    }

    async fn active_execution(&self, stage_id: Uuid) -> Result<Option<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE stage_id = $1 AND state IN ('pending', 'started')"
        );
        let row = sqlx::query(&sql).bind(stage_id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::execution).transpose()
    }

    async fn find_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await.db()?;
        row.as_ref().map(rows::execution).transpose()
    }

    async fn find_execution_by_reference(&self, reference_id: &str) -> Result<Option<Execution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE reference_id = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(reference_id)
            .fetch_optional(self.pool())
            .await
            .db()?;
        row.as_ref().map(rows::execution).transpose()
    }

    async fn list_executions(&self, stage_id: Uuid) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE stage_id = $1 ORDER BY created_at DESC, id DESC"
        );
        let found = sqlx::query(&sql).bind(stage_id).fetch_all(self.pool()).await.db()?;
        rows::all(&found, rows::execution)
    }

    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the
    /// same execution.
    async fn claim_pending_executions(&self, worker_id: &str, limit: usize, lease: Duration) -> Result<Vec<Execution>> {
        let now = Utc::now();
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM executions
                WHERE state = 'pending'
                  AND (dispatch_after IS NULL OR dispatch_after <= $3)
                  AND (worker_id IS NULL OR worker_id = $2 OR lease_expires_at <= $3)
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE executions
            SET worker_id = $2,
                lease_expires_at = $4
            WHERE id IN (SELECT id FROM claimable)
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let found = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(worker_id)
            .bind(now)
            .bind(now + lease)
            .fetch_all(self.pool())
            .await
            .db()?;

        let mut claimed = rows::all(&found, rows::execution)?;
        claimed.sort_by_key(|e| (e.created_at, e.id));
        Ok(claimed)
    }

    async fn claim_execution(&self, id: Uuid, worker_id: &str, lease: Duration) -> Result<Option<Execution>> {
        let now = Utc::now();
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM executions
                WHERE id = $1
                  AND state = 'pending'
                  AND (dispatch_after IS NULL OR dispatch_after <= $3)
                  AND (worker_id IS NULL OR worker_id = $2 OR lease_expires_at <= $3)
                FOR UPDATE SKIP LOCKED
            )
            UPDATE executions
            SET worker_id = $2,
                lease_expires_at = $4
            WHERE id IN (SELECT id FROM claimable)
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(now)
            .bind(now + lease)
            .fetch_optional(self.pool())
            .await
            .db()?;
        row.as_ref().map(rows::execution).transpose()
    }

    async fn start_execution(&self, id: Uuid, reference_id: &str) -> Result<Execution> {
        let sql = format!(
            r#"
            UPDATE executions
            SET state = 'started',
                reference_id = $2,
                started_at = NOW(),
                updated_at = NOW(),
                worker_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND state = 'pending'
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(reference_id)
            .fetch_optional(self.pool())
            .await
            .db()?;
        match row {
            Some(row) => rows::execution(&row),
            None => Err(self.execution_conflict(id, "execution is not pending").await),
        }
    }

    /// Count a failed attempt and schedule a retry with exponential backoff.
    async fn retry_dispatch(&self, id: Uuid) -> Result<Execution> {
        let mut tx = self.pool().begin().await.db()?;

        let current = sqlx::query(
            "SELECT dispatch_attempts FROM executions WHERE id = $1 AND state = 'pending' FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .db()?;
        let Some(current) = current else {
            return Err(self.execution_conflict(id, "execution is not pending").await);
        };
        let attempts: i32 = current.try_get("dispatch_attempts").db()?;
        let attempts = attempts.max(0) as u32 + 1;
        let retry_at = Utc::now() + dispatch_backoff(attempts);

        let sql = format!(
            r#"
            UPDATE executions
            SET dispatch_attempts = $2,
                dispatch_after = $3,
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(attempts as i32)
            .bind(retry_at)
            .fetch_one(&mut *tx)
            .await
            .db()?;

        tx.commit().await.db()?;
        rows::execution(&row)
    }

    async fn update_execution_outputs(&self, id: Uuid, outputs: &Map<String, Value>) -> Result<Execution> {
        let sql = format!(
            r#"
            UPDATE executions
            SET outputs = outputs || $2, updated_at = NOW()
            WHERE id = $1 AND state <> 'finished'
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(Json(outputs))
            .fetch_optional(self.pool())
            .await
            .db()?;
        match row {
            Some(row) => rows::execution(&row),
            None => Err(self.execution_conflict(id, "execution already finished").await),
        }
    }

    async fn finish_execution(&self, finish: &Finish) -> Result<Execution> {
        let mut tx = self.pool().begin().await.db()?;

        let sql = format!(
            r#"
            UPDATE executions
            SET state = 'finished',
                result = $2,
                outputs = $3,
                finished_at = $4,
                updated_at = $4,
                worker_id = NULL,
                lease_expires_at = NULL,
                dispatch_after = NULL
            WHERE id = $1 AND state <> 'finished'
            RETURNING {EXECUTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(finish.execution_id)
            .bind(finish.result.as_str())
            .bind(Json(&finish.outputs))
            .bind(finish.finished_at)
            .fetch_optional(&mut *tx)
            .await
            .db()?;
        let Some(row) = row else {
            return Err(self
                .execution_conflict(finish.execution_id, "execution already finished")
                .await);
        };
        let finished = rows::execution(&row)?;

        let health = if finish.result == ExecutionResult::Passed {
            TagState::Healthy
        } else {
            TagState::Unhealthy
        };
        sqlx::query("UPDATE stage_event_tags SET state = $2 WHERE stage_event_id = $1")
            .bind(finished.stage_event_id)
            .bind(health.as_str())
            .execute(&mut *tx)
            .await
            .db()?;

        insert_event(&mut tx, &finish.completion_event).await?;
        apply_fan_out_in(&mut tx, &finish.fan_out).await?;

        tx.commit().await.db()?;
        Ok(finished)
    }

    async fn last_execution_inputs(
        &self,
        stage_id: Uuid,
        results: &[ExecutionResult],
    ) -> Result<Option<BTreeMap<String, String>>> {
        let row = sqlx::query(
            r#"
            SELECT se.inputs
            FROM executions e
            JOIN stage_events se ON se.id = e.stage_event_id
            WHERE e.stage_id = $1
              AND e.state = 'finished'
              AND e.result = ANY($2)
            ORDER BY e.finished_at DESC, e.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(stage_id)
        .bind(names(results, ExecutionResult::as_str))
        .fetch_optional(self.pool())
        .await
        .db()?;

        row.map(|r| {
            r.try_get::<Json<BTreeMap<String, String>>, _>("inputs")
                .db()
                .map(|j| j.0)
        })
        .transpose()
    }

    async fn try_acquire_stage_lease(&self, stage_id: Uuid, worker_id: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stage_leases (stage_id, worker_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (stage_id) DO UPDATE
            SET worker_id = EXCLUDED.worker_id,
                expires_at = EXCLUDED.expires_at
            WHERE stage_leases.worker_id = EXCLUDED.worker_id
               OR stage_leases.expires_at <= NOW()
            "#,
        )
        .bind(stage_id)
        .bind(worker_id)
        .bind(Utc::now() + ttl)
        .execute(self.pool())
        .await
        .db()?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_stage_lease(&self, stage_id: Uuid, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM stage_leases WHERE stage_id = $1 AND worker_id = $2")
            .bind(stage_id)
            .bind(worker_id)
            .execute(self.pool())
            .await
            .db()?;
        Ok(())
    }
}
