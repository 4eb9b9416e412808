use tracing::info;
use uuid::Uuid;

use super::{duplicate_name, validate_name, Service};
use crate::authz::{DomainKind, CANVAS_OWNER};
use crate::error::{Error, Result};
use crate::model::Canvas;
use crate::store::Required;

impl Service {
    /// Create a canvas, provision its roles and make `user_id` its owner.
    pub async fn create_canvas(&self, org_id: Uuid, name: &str, user_id: &str) -> Result<Canvas> {
        validate_name("canvas", name)?;
        self.describe_organization(org_id).await?;
        if self.store.find_canvas_by_name(org_id, name).await?.is_some() {
            return Err(duplicate_name("canvas"));
        }

        let canvas = Canvas::new(org_id, name, user_id);
        self.store.create_canvas(&canvas).await?;

        let canvas_id = canvas.id.to_string();
        self.enforcer.setup_canvas_roles(&canvas_id).await?;
        self.enforcer
            .assign_role(user_id, CANVAS_OWNER, &canvas_id, DomainKind::Canvas)
            .await?;

        info!(%org_id, canvas_id = %canvas.id, name, user_id, "canvas created");
        Ok(canvas)
    }

    /// Look a canvas up by id or by name within the organization.
    pub async fn describe_canvas(&self, org_id: Uuid, id_or_name: &str) -> Result<Canvas> {
        let canvas = match Uuid::parse_str(id_or_name) {
            Ok(id) => self.store.find_canvas(id).await,
            Err(_) => self.store.find_canvas_by_name(org_id, id_or_name).await,
        }
        .required("canvas")?;

        if canvas.organization_id != org_id {
            return Err(Error::not_found("canvas"));
        }
        Ok(canvas)
    }

    /// Canvases of the organization the user can see.
    pub async fn list_canvases(&self, org_id: Uuid, user_id: &str) -> Result<Vec<Canvas>> {
        let accessible = self.enforcer.accessible_canvases(user_id);
        let org_wide = self
            .enforcer
            .check_org(user_id, &org_id.to_string(), "canvas", "read");

        Ok(self
            .store
            .list_canvases(org_id)
            .await?
            .into_iter()
            .filter(|c| org_wide || accessible.contains(&c.id.to_string()))
            .collect())
    }
}
