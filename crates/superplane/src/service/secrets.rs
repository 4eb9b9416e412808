use std::collections::BTreeMap;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::{duplicate_name, validate_name, Service};
use crate::error::{Error, Result};
use crate::model::{Secret, LOCAL_SECRET_PROVIDER};
use crate::store::Required;

impl Service {
    /// Store a key/value secret, encrypted and bound to its name.
    pub async fn create_secret(
        &self,
        canvas_id: Uuid,
        name: &str,
        values: &BTreeMap<String, String>,
        user_id: &str,
    ) -> Result<Secret> {
        validate_name("secret", name)?;
        self.canvas(canvas_id).await?;
        if self.store.find_secret_by_name(canvas_id, name).await?.is_some() {
            return Err(duplicate_name("secret"));
        }

        let now = Utc::now();
        let secret = Secret {
            id: Uuid::new_v4(),
            canvas_id,
            name: name.to_string(),
            provider: LOCAL_SECRET_PROVIDER.to_string(),
            data: self.seal(name, values)?,
            created_by: user_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_secret(&secret).await?;

        info!(%canvas_id, name, keys = values.len(), "secret created");
        Ok(secret)
    }

    pub async fn describe_secret(&self, canvas_id: Uuid, name: &str) -> Result<Secret> {
        self.store
            .find_secret_by_name(canvas_id, name)
            .await
            .required(format!("secret {name}"))
    }

    /// Key names held by a secret. Values are never returned.
    pub async fn secret_keys(&self, canvas_id: Uuid, name: &str) -> Result<Vec<String>> {
        let secret = self.describe_secret(canvas_id, name).await?;
        let plaintext = self.encryptor.decrypt(&secret.data, secret.name.as_bytes())?;
        let values: BTreeMap<String, String> = serde_json::from_slice(&plaintext)?;
        Ok(values.into_keys().collect())
    }

    pub async fn list_secrets(&self, canvas_id: Uuid) -> Result<Vec<Secret>> {
        self.store.list_secrets(canvas_id).await
    }

    /// Replace a secret's values.
    pub async fn update_secret(
        &self,
        canvas_id: Uuid,
        name: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<Secret> {
        let mut secret = self.describe_secret(canvas_id, name).await?;
        secret.data = self.seal(name, values)?;
        secret.updated_at = Utc::now();
        self.store.update_secret(&secret).await?;
        info!(%canvas_id, name, keys = values.len(), "secret updated");
        Ok(secret)
    }

    pub async fn delete_secret(&self, canvas_id: Uuid, name: &str) -> Result<()> {
        self.describe_secret(canvas_id, name).await?;
        self.store.delete_secret(canvas_id, name).await?;
        info!(%canvas_id, name, "secret deleted");
        Ok(())
    }

    fn seal(&self, name: &str, values: &BTreeMap<String, String>) -> Result<Vec<u8>> {
        if values.is_empty() {
            return Err(Error::Validation("secret needs at least one value".into()));
        }
        let plaintext = serde_json::to_vec(values)?;
        Ok(self.encryptor.encrypt(&plaintext, name.as_bytes())?)
    }
}
