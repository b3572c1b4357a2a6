//! SQLite persistence for workpools and VM images.
//!
//! A workpool is stored across three tables (`workpools`, `instances`, `leases`)
//! and always written as a whole by [`Repository::save_workpool`], inside one
//! transaction, so a crash never leaves a lease without its instance or a pool
//! half-updated.

use crate::error::{Result, WorkpoolError};
use crate::model::{
    InstanceModel, InstanceState, LeaseModel, VmImageModel, VmImageState, WorkpoolModel,
    WorkpoolState,
};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, instrument};

#[derive(Debug, sqlx::FromRow)]
struct WorkpoolRow {
    id: String,
    name: String,
    kind: String,
    maximum_instances: i32,
    state: WorkpoolState,
    last_error: String,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    id: String,
    workpool_id: String,
    moid: Option<String>,
    guest_username: String,
    guest_password: String,
    autologon: bool,
    state: InstanceState,
    last_error: String,
    created_at: i64,
}

impl From<InstanceRow> for InstanceModel {
    fn from(row: InstanceRow) -> Self {
        InstanceModel {
            id: row.id,
            workpool_id: row.workpool_id,
            moid: row.moid,
            guest_username: row.guest_username,
            guest_password: row.guest_password,
            autologon: row.autologon,
            state: row.state,
            last_error: row.last_error,
            created_at: from_millis(row.created_at),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    lease_id: String,
    vc_config: String,
    #[sqlx(flatten)]
    instance: InstanceRow,
}

impl TryFrom<LeaseRow> for LeaseModel {
    type Error = WorkpoolError;

    fn try_from(row: LeaseRow) -> Result<Self> {
        Ok(LeaseModel {
            id: row.lease_id,
            vc_config: serde_json::from_str(&row.vc_config)?,
            instance: row.instance.into(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VmImageRow {
    id: String,
    name: String,
    moid: Option<String>,
    os_info: String,
    os_registration: String,
    vm_pattern: Option<String>,
    state: VmImageState,
    last_error: String,
    created_at: i64,
}

impl TryFrom<VmImageRow> for VmImageModel {
    type Error = WorkpoolError;

    fn try_from(row: VmImageRow) -> Result<Self> {
        Ok(VmImageModel {
            id: row.id,
            name: row.name,
            moid: row.moid,
            os_info: serde_json::from_str(&row.os_info)?,
            os_registration: serde_json::from_str(&row.os_registration)?,
            vm_pattern: row
                .vm_pattern
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            state: row.state,
            last_error: row.last_error,
            created_at: from_millis(row.created_at),
        })
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new workpool together with any instances it starts with
    #[instrument(skip(self, model), fields(workpool = %model.name))]
    pub async fn insert_workpool(&self, model: &WorkpoolModel) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workpools (id, name, kind, maximum_instances, state, last_error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&model.id)
        .bind(&model.name)
        .bind(serde_json::to_string(&model.kind)?)
        .bind(model.maximum_instances)
        .bind(model.state)
        .bind(&model.last_error)
        .bind(model.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        write_members(&mut *tx, model).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Write the whole workpool (row, instances, leases) atomically
    #[instrument(skip(self, model), fields(workpool = %model.name, state = %model.state))]
    pub async fn save_workpool(&self, model: &WorkpoolModel) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workpools
            SET name = ?, kind = ?, maximum_instances = ?, state = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(&model.name)
        .bind(serde_json::to_string(&model.kind)?)
        .bind(model.maximum_instances)
        .bind(model.state)
        .bind(&model.last_error)
        .bind(&model.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkpoolError::NotFound(format!("workpool {}", model.id)));
        }

        write_members(&mut *tx, model).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Remove a workpool; its instances and leases go with it
    pub async fn delete_workpool(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workpools WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!("Deleted workpool {} from the database", id);
        Ok(())
    }

    pub async fn get_workpool(&self, id: &str) -> Result<Option<WorkpoolModel>> {
        let row = sqlx::query_as::<_, WorkpoolRow>("SELECT * FROM workpools WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load_workpool(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn find_workpool_by_name(&self, name: &str) -> Result<Option<WorkpoolModel>> {
        let row = sqlx::query_as::<_, WorkpoolRow>("SELECT * FROM workpools WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load_workpool(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn find_all_workpools(&self) -> Result<Vec<WorkpoolModel>> {
        let rows = sqlx::query_as::<_, WorkpoolRow>(
            "SELECT * FROM workpools ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workpools = Vec::with_capacity(rows.len());
        for row in rows {
            workpools.push(self.load_workpool(row).await?);
        }
        Ok(workpools)
    }

    async fn load_workpool(&self, row: WorkpoolRow) -> Result<WorkpoolModel> {
        let instances = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE workpool_id = ? ORDER BY rowid",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        let leases = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT l.id AS lease_id, l.vc_config, i.*
            FROM leases l
            JOIN instances i ON i.id = l.instance_id
            WHERE l.workpool_id = ?
            ORDER BY l.rowid
            "#,
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(WorkpoolModel {
            kind: serde_json::from_str(&row.kind)?,
            id: row.id,
            name: row.name,
            maximum_instances: row.maximum_instances,
            state: row.state,
            last_error: row.last_error,
            instances: instances.into_iter().map(InstanceModel::from).collect(),
            leases: leases
                .into_iter()
                .map(LeaseModel::try_from)
                .collect::<Result<Vec<_>>>()?,
            created_at: from_millis(row.created_at),
        })
    }

    #[instrument(skip(self, model), fields(vm_image = %model.name))]
    pub async fn insert_vm_image(&self, model: &VmImageModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vm_images (id, name, moid, os_info, os_registration, vm_pattern, state, last_error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&model.id)
        .bind(&model.name)
        .bind(&model.moid)
        .bind(serde_json::to_string(&model.os_info)?)
        .bind(serde_json::to_string(&model.os_registration)?)
        .bind(model.vm_pattern.as_ref().map(serde_json::to_string).transpose()?)
        .bind(model.state)
        .bind(&model.last_error)
        .bind(model.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, model), fields(vm_image = %model.name, state = %model.state))]
    pub async fn save_vm_image(&self, model: &VmImageModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE vm_images
            SET name = ?, moid = ?, os_info = ?, os_registration = ?, vm_pattern = ?, state = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(&model.name)
        .bind(&model.moid)
        .bind(serde_json::to_string(&model.os_info)?)
        .bind(serde_json::to_string(&model.os_registration)?)
        .bind(model.vm_pattern.as_ref().map(serde_json::to_string).transpose()?)
        .bind(model.state)
        .bind(&model.last_error)
        .bind(&model.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkpoolError::NotFound(format!("VM image {}", model.id)));
        }
        Ok(())
    }

    pub async fn delete_vm_image(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vm_images WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!("Deleted VM image {} from the database", id);
        Ok(())
    }

    pub async fn get_vm_image(&self, id: &str) -> Result<Option<VmImageModel>> {
        sqlx::query_as::<_, VmImageRow>("SELECT * FROM vm_images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(VmImageModel::try_from)
            .transpose()
    }

    pub async fn find_vm_image_by_name(&self, name: &str) -> Result<Option<VmImageModel>> {
        sqlx::query_as::<_, VmImageRow>("SELECT * FROM vm_images WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(VmImageModel::try_from)
            .transpose()
    }

    pub async fn find_all_vm_images(&self) -> Result<Vec<VmImageModel>> {
        sqlx::query_as::<_, VmImageRow>("SELECT * FROM vm_images ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(VmImageModel::try_from)
            .collect()
    }
}

/// Sync the instance and lease tables with `model`. Instances are upserted so
/// they keep their row order.
async fn write_members(conn: &mut SqliteConnection, model: &WorkpoolModel) -> Result<()> {
    sqlx::query("DELETE FROM leases WHERE workpool_id = ?")
        .bind(&model.id)
        .execute(&mut *conn)
        .await?;

    let keep: HashSet<&str> = model.instances.iter().map(|i| i.id.as_str()).collect();
    let stored: Vec<String> =
        sqlx::query_scalar("SELECT id FROM instances WHERE workpool_id = ?")
            .bind(&model.id)
            .fetch_all(&mut *conn)
            .await?;

    for id in stored.iter().filter(|id| !keep.contains(id.as_str())) {
        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    for instance in &model.instances {
        sqlx::query(
            r#"
            INSERT INTO instances (id, workpool_id, moid, guest_username, guest_password, autologon, state, last_error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                moid = excluded.moid,
                guest_username = excluded.guest_username,
                guest_password = excluded.guest_password,
                autologon = excluded.autologon,
                state = excluded.state,
                last_error = excluded.last_error
            "#,
        )
        .bind(&instance.id)
        .bind(&model.id)
        .bind(&instance.moid)
        .bind(&instance.guest_username)
        .bind(&instance.guest_password)
        .bind(instance.autologon)
        .bind(instance.state)
        .bind(&instance.last_error)
        .bind(instance.created_at.timestamp_millis())
        .execute(&mut *conn)
        .await?;
    }

    let now = Utc::now().timestamp_millis();
    for lease in &model.leases {
        sqlx::query(
            "INSERT INTO leases (id, workpool_id, instance_id, vc_config, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&lease.id)
        .bind(&model.id)
        .bind(&lease.instance.id)
        .bind(serde_json::to_string(&lease.vc_config)?)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}
