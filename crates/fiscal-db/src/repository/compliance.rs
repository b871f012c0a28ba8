//! # Compliance Profile Repository
//!
//! Store fiscal settings. The pipeline only reads them; `upsert` exists for
//! the back office sync and the seed binary.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;
use fiscal_core::ComplianceProfile;

/// Repository for compliance profiles.
#[derive(Debug, Clone)]
pub struct ComplianceRepository {
    pool: SqlitePool,
}

impl ComplianceRepository {
    /// Creates a new ComplianceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ComplianceRepository { pool }
    }

    /// Gets a store's profile.
    pub async fn get(&self, store_id: &str) -> DbResult<Option<ComplianceProfile>> {
        let profile = sqlx::query_as::<_, ComplianceProfile>(
            "SELECT * FROM compliance_profiles WHERE store_id = ?1",
        )
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    /// Inserts or replaces a store's profile.
    pub async fn upsert(&self, profile: &ComplianceProfile) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO compliance_profiles (
                store_id, organization_id, enable_kkm, kkm_mode,
                kkm_provider_key, legal_name, tax_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (store_id) DO UPDATE SET
                organization_id = excluded.organization_id,
                enable_kkm = excluded.enable_kkm,
                kkm_mode = excluded.kkm_mode,
                kkm_provider_key = excluded.kkm_provider_key,
                legal_name = excluded.legal_name,
                tax_id = excluded.tax_id
            "#,
        )
        .bind(&profile.store_id)
        .bind(&profile.organization_id)
        .bind(profile.enable_kkm)
        .bind(profile.kkm_mode)
        .bind(&profile.kkm_provider_key)
        .bind(&profile.legal_name)
        .bind(&profile.tax_id)
        .execute(&self.pool)
        .await?;

        info!(
            store_id = %profile.store_id,
            enable_kkm = profile.enable_kkm,
            mode = ?profile.kkm_mode,
            "Compliance profile saved"
        );
        Ok(())
    }
}
