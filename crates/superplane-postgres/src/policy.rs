use async_trait::async_trait;
use sqlx::{PgPool, Row};

use superplane::authz::{PolicyRule, PolicyStore};
use superplane::error::Result;

use crate::error::DbResultExt;

/// Policy rules in the `policy_rules` table, one row per rule with
/// positional columns `v0..v3`.
#[derive(Clone)]
pub struct PgPolicyStore {
    pool: PgPool,
}

impl PgPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Positional values padded to the four stored columns.
fn columns(rule: &PolicyRule) -> [String; 4] {
    let mut columns: [String; 4] = Default::default();
    for (column, value) in columns.iter_mut().zip(rule.values()) {
        *column = value.to_string();
    }
    columns
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn load(&self) -> Result<Vec<PolicyRule>> {
        let rows = sqlx::query("SELECT ptype, v0, v1, v2, v3 FROM policy_rules ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .db()?;

        rows.iter()
            .map(|row| {
                let ptype: String = row.try_get("ptype").db()?;
                let values: Vec<String> = ["v0", "v1", "v2", "v3"]
                    .iter()
                    .map(|c| row.try_get::<String, _>(*c).db())
                    .collect::<Result<_>>()?;
                let values: Vec<&str> = values
                    .iter()
                    .map(String::as_str)
                    .filter(|v| !v.is_empty())
                    .collect();
                PolicyRule::from_values(&ptype, &values)
            })
            .collect()
    }

    async fn add(&self, rules: &[PolicyRule]) -> Result<()> {
        let mut tx = self.pool.begin().await.db()?;
        for rule in rules {
            let [v0, v1, v2, v3] = columns(rule);
            sqlx::query(
                r#"
                INSERT INTO policy_rules (ptype, v0, v1, v2, v3)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT ON CONSTRAINT policy_rules_key DO NOTHING
                "#,
            )
            .bind(rule.ptype())
            .bind(v0)
            .bind(v1)
            .bind(v2)
            .bind(v3)
            .execute(&mut *tx)
            .await
            .db()?;
        }
        tx.commit().await.db()
    }

    async fn remove(&self, rules: &[PolicyRule]) -> Result<()> {
        let mut tx = self.pool.begin().await.db()?;
        for rule in rules {
            let [v0, v1, v2, v3] = columns(rule);
            sqlx::query(
                r#"
                DELETE FROM policy_rules
                WHERE ptype = $1 AND v0 = $2 AND v1 = $3 AND v2 = $4 AND v3 = $5
                "#,
            )
            .bind(rule.ptype())
            .bind(v0)
            .bind(v1)
            .bind(v2)
            .bind(v3)
            .execute(&mut *tx)
            .await
            .db()?;
        }
        tx.commit().await.db()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_pad_the_last_column() {
        let edge = PolicyRule::edge("role:org_admin", "role:org_viewer", "org:1");
        assert_eq!(
            columns(&edge),
            [
                "role:org_admin".to_string(),
                "role:org_viewer".to_string(),
                "org:1".to_string(),
                String::new(),
            ]
        );
    }
}
