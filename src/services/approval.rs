/*!
 * Approval policy: decides whether a paid order is handed to fulfillment
 * without a human in the loop.
 */

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};
use std::sync::Arc;
use tracing::instrument;

use crate::db::DbPool;
use crate::entities::preferences::{self, AutoApproveMode, SINGLETON_ID};
use crate::errors::ServiceError;

/// Policy table. A missing limit under `AutoApproveBelow` fails closed,
/// as does any unrecognized mode upstream of this call.
pub fn should_auto_approve(
    mode: AutoApproveMode,
    limit: Option<Decimal>,
    total_cost: Decimal,
) -> bool {
    match mode {
        AutoApproveMode::ManuallyApproveAll => false,
        AutoApproveMode::AutoApproveAll => true,
        AutoApproveMode::AutoApproveBelow => match limit {
            Some(limit) => total_cost < limit,
            None => false,
        },
    }
}

/// Singleton site preferences backing the admin settings surface.
#[derive(Clone)]
pub struct PreferencesService {
    db: Arc<DbPool>,
}

impl PreferencesService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Fetches the preferences row, if one has been saved.
    pub async fn get(&self) -> Result<Option<preferences::Model>, ServiceError> {
        let found = preferences::Entity::find_by_id(SINGLETON_ID)
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Creates or replaces the singleton preferences row.
    #[instrument(skip(self))]
    pub async fn upsert(
        &self,
        site_name: String,
        auto_approve_mode: AutoApproveMode,
        auto_approve_limit: Option<Decimal>,
    ) -> Result<preferences::Model, ServiceError> {
        if auto_approve_mode == AutoApproveMode::AutoApproveBelow && auto_approve_limit.is_none() {
            return Err(ServiceError::ValidationError(
                "auto_approve_limit is required when mode is auto_approve_below".to_string(),
            ));
        }

        let active = preferences::ActiveModel {
            id: Set(SINGLETON_ID),
            site_name: Set(site_name),
            auto_approve_mode: Set(auto_approve_mode),
            auto_approve_limit: Set(auto_approve_limit),
            updated_at: Set(Some(Utc::now())),
        };

        let existing = preferences::Entity::find_by_id(SINGLETON_ID)
            .one(&*self.db)
            .await?;

        let saved = if existing.is_some() {
            active.update(&*self.db).await?
        } else {
            active.insert(&*self.db).await?
        };

        Ok(saved)
    }
}
