use uuid::Uuid;

use super::Service;
use crate::error::{Error, Result};
use crate::model::{Execution, StageEvent, StageEventState, Tag, TagFilter, TagState};
use crate::store::Required;

impl Service {
    /// Stage events of a stage, oldest first. An empty state list means all.
    pub async fn list_stage_events(
        &self,
        canvas_id: Uuid,
        stage: &str,
        states: &[StageEventState],
    ) -> Result<Vec<StageEvent>> {
        let stage = self.describe_stage(canvas_id, stage).await?;
        let states = if states.is_empty() {
            &[
                StageEventState::Pending,
                StageEventState::Waiting,
                StageEventState::Processed,
            ][..]
        } else {
            states
        };
        self.store.list_stage_events(stage.id, states).await
    }

    pub async fn approve_stage_event(
        &self,
        canvas_id: Uuid,
        stage: &str,
        stage_event_id: Uuid,
        user_id: &str,
    ) -> Result<StageEvent> {
        self.stage_event(canvas_id, stage, stage_event_id).await?;
        self.machine.approve(stage_event_id, user_id).await
    }

    pub async fn cancel_stage_event(&self, canvas_id: Uuid, stage: &str, stage_event_id: Uuid) -> Result<StageEvent> {
        self.stage_event(canvas_id, stage, stage_event_id).await?;
        self.machine.cancel(stage_event_id).await
    }

    /// Executions of a stage, newest first.
    pub async fn list_executions(&self, canvas_id: Uuid, stage: &str) -> Result<Vec<Execution>> {
        let stage = self.describe_stage(canvas_id, stage).await?;
        self.store.list_executions(stage.id).await
    }

    pub async fn describe_execution(&self, canvas_id: Uuid, stage: &str, execution_id: Uuid) -> Result<Execution> {
        let stage = self.describe_stage(canvas_id, stage).await?;
        let execution = self
            .store
            .find_execution(execution_id)
            .await
            .required("execution")?;
        if execution.stage_id != stage.id {
            return Err(Error::not_found("execution"));
        }
        Ok(execution)
    }

    pub async fn cancel_execution(&self, canvas_id: Uuid, stage: &str, execution_id: Uuid) -> Result<Execution> {
        self.describe_execution(canvas_id, stage, execution_id).await?;
        self.tracker.cancel(execution_id).await
    }

    /// Tags within the canvas matching the filter.
    pub async fn list_stage_tags(&self, canvas_id: Uuid, mut filter: TagFilter) -> Result<Vec<Tag>> {
        filter.canvas_id = Some(canvas_id);
        self.store.list_stage_tags(&filter).await
    }

    /// Set the health of every tag `name=value` in the canvas.
    pub async fn update_tag_state(
        &self,
        canvas_id: Uuid,
        name: &str,
        value: &str,
        state: TagState,
    ) -> Result<Vec<StageEvent>> {
        let filter = TagFilter {
            canvas_id: Some(canvas_id),
            name: Some(name.to_string()),
            value: Some(value.to_string()),
            ..Default::default()
        };
        self.machine.update_tag_state(&filter, state).await
    }

    async fn stage_event(&self, canvas_id: Uuid, stage: &str, stage_event_id: Uuid) -> Result<StageEvent> {
        let stage = self.describe_stage(canvas_id, stage).await?;
        let stage_event = self
            .store
            .find_stage_event(stage_event_id)
            .await
            .required("stage event")?;
        if stage_event.stage_id != stage.id {
            return Err(Error::not_found("stage event"));
        }
        Ok(stage_event)
    }
}
