use crate::error::Result;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Open the workpool database, creating the file and its directory if needed
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options).await?;

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Copy the database aside before migrating it. Returns `None` when there is
/// nothing to back up yet.
pub fn backup_database(db_path: &Path) -> Result<Option<PathBuf>> {
    if !db_path.exists() {
        return Ok(None);
    }

    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let backup_path = db_path.with_extension(format!("db.backup.{}", stamp));
    std::fs::copy(db_path, &backup_path)?;

    Ok(Some(backup_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_of_missing_database_is_skipped() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = backup_database(&dir.path().join("absent.db")).expect("Failed to back up");
        assert!(result.is_none());
    }

    #[test]
    fn backup_copies_existing_database() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = dir.path().join("workpool.db");
        std::fs::write(&db_path, b"sqlite").expect("Failed to write db");

        let backup = backup_database(&db_path)
            .expect("Failed to back up")
            .expect("Backup path missing");
        assert_eq!(std::fs::read(backup).expect("Failed to read backup"), b"sqlite");
    }

    #[tokio::test]
    async fn create_pool_makes_parent_directories() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = dir.path().join("nested").join("workpool.db");

        let pool = create_pool(&db_path).await.expect("Failed to create pool");
        run_migrations(&pool).await.expect("Failed to migrate");
        assert!(db_path.exists());
    }
}
