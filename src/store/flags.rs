use anyhow::{Context, Result};

use crate::store::database::Database;

pub const EMERGENCY_STOP: &str = "emergency_stop";
pub const PAPER_MODE: &str = "paper_mode";

/// Key-value operator flags. Both flags default to off/false when unset,
/// except paper mode, which callers seed from config at startup.
#[derive(Clone)]
pub struct FlagsRepository {
    db: Database,
}

impl FlagsRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_flags (key, value, updated_at)
            VALUES ($1, $2, strftime('%s', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = strftime('%s', 'now')
            "#,
        )
        .bind(key)
        .bind(if value { "true" } else { "false" })
        .execute(&self.db.pool)
        .await
        .context("Failed to set system flag")?;
        Ok(())
    }

    pub async fn get_bool(&self, key: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM system_flags WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.db.pool)
                .await
                .context("Failed to read system flag")?;
        Ok(matches!(row, Some((v,)) if v == "true"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flags_default_false_and_round_trip() {
        let repo = FlagsRepository::new(Database::in_memory().await.unwrap());

        assert!(!repo.get_bool(EMERGENCY_STOP).await.unwrap());

        repo.set_bool(EMERGENCY_STOP, true).await.unwrap();
        assert!(repo.get_bool(EMERGENCY_STOP).await.unwrap());

        repo.set_bool(EMERGENCY_STOP, false).await.unwrap();
        assert!(!repo.get_bool(EMERGENCY_STOP).await.unwrap());
    }
}
