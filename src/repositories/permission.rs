use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::Result,
    models::access::{DataAccessPermission, Role},
    repositories::column,
};

/// Role and permission lookups. Grants with an `expires_at` in the past are ignored.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn roles(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Role>>;

    async fn permissions(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Vec<DataAccessPermission>>;
}

fn row_to_permission(row: &Row) -> Result<DataAccessPermission> {
    Ok(DataAccessPermission {
        table_name: column(row, "table_name")?,
        access_level: column(row, "access_level")?,
        data_category: column(row, "data_category")?,
        conditions: column::<Option<Vec<String>>>(row, "conditions")?.unwrap_or_default(),
    })
}

#[derive(Clone)]
pub struct PgPermissionStore {
    pool: Pool,
}

impl PgPermissionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermissionStore for PgPermissionStore {
    async fn roles(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Role>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT role
                FROM user_roles
                WHERE subject_id = $1 AND (expires_at IS NULL OR expires_at > $2)
                "#,
                &[&subject_id, &now],
            )
            .await?;
        rows.iter().map(|row| column(row, "role")).collect()
    }

    async fn permissions(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<Vec<DataAccessPermission>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT table_name, access_level, data_category, conditions
                FROM data_access_permissions
                WHERE subject_id = $1 AND (expires_at IS NULL OR expires_at > $2)
                "#,
                &[&subject_id, &now],
            )
            .await?;
        rows.iter().map(row_to_permission).collect()
    }
}
