//! Durable registry of owned resources
//!
//! Tracks every resource this tool created or adopted across process runs,
//! as a section -> {id: name} store backed by SQLite through sqlx. Sections
//! are keyed by resource kind (`vpc`, `security-groups`, `<service>-roles`).
//! Writes are visible to subsequent reads immediately.

use crate::error::Error;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

/// Registry section for VPCs
pub const SECTION_VPC: &str = "vpc";

/// Registry section for security groups
pub const SECTION_SECURITY_GROUPS: &str = "security-groups";

/// Handle to the local resource registry.
///
/// Passed explicitly into every controller constructor and destructor; there
/// is no process-global registry state.
#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    /// Open the registry at its default per-user data path, creating it if
    /// needed.
    pub async fn open() -> Result<Self, Error> {
        let proj_dirs =
            directories::ProjectDirs::from("", "", "batchrig").ok_or(Error::NoDataDir)?;
        let state_dir = proj_dirs.data_local_dir();
        std::fs::create_dir_all(state_dir)?;
        Self::open_at(&state_dir.join("registry.db")).await
    }

    /// Open a registry at an explicit path.
    pub async fn open_at(path: &Path) -> Result<Self, Error> {
        let db_url = format!("sqlite://{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);
        Self::connect(options, 5).await
    }

    /// Open an in-memory registry, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                section TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (section, resource_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Record a resource under a section. Re-adding the same id replaces the
    /// stored name.
    pub async fn add(&self, section: &str, id: &str, name: &str) -> Result<(), Error> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR REPLACE INTO resources (section, resource_id, name, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(section)
        .bind(id)
        .bind(name)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a resource from a section. Removing an absent id is a no-op.
    pub async fn remove(&self, section: &str, id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM resources WHERE section = ? AND resource_id = ?")
            .bind(section)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// All resource ids recorded under a section.
    pub async fn list(&self, section: &str) -> Result<BTreeSet<String>, Error> {
        let rows = sqlx::query("SELECT resource_id FROM resources WHERE section = ?")
            .bind(section)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("resource_id")).collect())
    }

    /// The name recorded for a resource id, if any.
    pub async fn get(&self, section: &str, id: &str) -> Result<Option<String>, Error> {
        let row = sqlx::query("SELECT name FROM resources WHERE section = ? AND resource_id = ?")
            .bind(section)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("name")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_list_remove_roundtrip() {
        let registry = Registry::open_in_memory().await.unwrap();

        registry.add(SECTION_VPC, "vpc-1234", "mynet").await.unwrap();
        assert_eq!(
            registry.list(SECTION_VPC).await.unwrap(),
            BTreeSet::from(["vpc-1234".to_string()])
        );
        assert_eq!(
            registry.get(SECTION_VPC, "vpc-1234").await.unwrap().as_deref(),
            Some("mynet")
        );

        registry.remove(SECTION_VPC, "vpc-1234").await.unwrap();
        assert!(registry.list(SECTION_VPC).await.unwrap().is_empty());
        assert!(registry.get(SECTION_VPC, "vpc-1234").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sections_are_independent() {
        let registry = Registry::open_in_memory().await.unwrap();

        registry.add(SECTION_VPC, "vpc-1", "a").await.unwrap();
        registry
            .add(SECTION_SECURITY_GROUPS, "sg-1", "b")
            .await
            .unwrap();

        registry.remove(SECTION_VPC, "vpc-1").await.unwrap();
        assert_eq!(
            registry.list(SECTION_SECURITY_GROUPS).await.unwrap(),
            BTreeSet::from(["sg-1".to_string()])
        );
    }

    #[tokio::test]
    async fn re_adding_replaces_the_name() {
        let registry = Registry::open_in_memory().await.unwrap();

        registry.add(SECTION_VPC, "vpc-1", "old").await.unwrap();
        registry.add(SECTION_VPC, "vpc-1", "new").await.unwrap();

        assert_eq!(registry.list(SECTION_VPC).await.unwrap().len(), 1);
        assert_eq!(
            registry.get(SECTION_VPC, "vpc-1").await.unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn removing_absent_id_is_a_noop() {
        let registry = Registry::open_in_memory().await.unwrap();
        registry.remove(SECTION_VPC, "vpc-absent").await.unwrap();
    }
}
