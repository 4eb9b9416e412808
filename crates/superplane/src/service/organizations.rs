use tracing::info;
use uuid::Uuid;

use super::{duplicate_name, validate_name, Service};
use crate::error::{parse_uuid, Result};
use crate::model::Organization;
use crate::store::Required;

impl Service {
    /// Create an organization, provision its roles and make `user_id` its
    /// owner.
    pub async fn create_organization(
        &self,
        name: &str,
        display_name: &str,
        user_id: &str,
    ) -> Result<Organization> {
        validate_name("organization", name)?;
        if self.store.find_organization_by_name(name).await?.is_some() {
            return Err(duplicate_name("organization"));
        }

        let display_name = if display_name.trim().is_empty() {
            name
        } else {
            display_name
        };
        let org = Organization::new(name, display_name, user_id);
        self.store.create_organization(&org).await?;

        let org_id = org.id.to_string();
        self.enforcer.setup_organization_roles(&org_id).await?;
        self.enforcer.create_organization_owner(user_id, &org_id).await?;

        info!(org_id = %org.id, name, user_id, "organization created");
        Ok(org)
    }

    pub async fn describe_organization(&self, org_id: Uuid) -> Result<Organization> {
        self.store.find_organization(org_id).await.required("organization")
    }

    /// Organizations where the user holds any role.
    pub async fn list_organizations(&self, user_id: &str) -> Result<Vec<Organization>> {
        let ids = self
            .enforcer
            .accessible_organizations(user_id)
            .iter()
            .map(|id| parse_uuid("organization id", id))
            .collect::<Result<Vec<_>>>()?;
        self.store.list_organizations(&ids).await
    }

    pub async fn update_organization(&self, org_id: Uuid, display_name: &str) -> Result<Organization> {
        let mut org = self.describe_organization(org_id).await?;
        if !display_name.trim().is_empty() {
            org.display_name = display_name.to_string();
        }
        org.updated_at = chrono::Utc::now();
        self.store.update_organization(&org).await?;
        Ok(org)
    }

    pub async fn delete_organization(&self, org_id: Uuid) -> Result<()> {
        self.describe_organization(org_id).await?;
        self.store.soft_delete_organization(org_id).await?;
        info!(%org_id, "organization deleted");
        Ok(())
    }
}
