use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Fixed id for the singleton preferences row.
pub const SINGLETON_ID: Uuid = Uuid::from_u128(0x5052_4546_5345_5454_494e_4753_0001_u128);

/// Governs whether approved-for-print hand-off happens without a human in
/// the loop. Unknown values deserialize to manual approval (fail closed).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum AutoApproveMode {
    #[default]
    #[sea_orm(string_value = "manually_approve_all")]
    ManuallyApproveAll,
    #[sea_orm(string_value = "auto_approve_below")]
    AutoApproveBelow,
    #[sea_orm(string_value = "auto_approve_all")]
    AutoApproveAll,
}

impl std::str::FromStr for AutoApproveMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "auto_approve_below" | "autoapprovebelow" => AutoApproveMode::AutoApproveBelow,
            "auto_approve_all" | "autoapproveall" => AutoApproveMode::AutoApproveAll,
            _ => AutoApproveMode::ManuallyApproveAll,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "preferences")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub site_name: String,
    pub auto_approve_mode: AutoApproveMode,
    /// Only consulted when mode is AutoApproveBelow
    pub auto_approve_limit: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mode_falls_back_to_manual() {
        assert_eq!(
            "definitely_not_a_mode".parse::<AutoApproveMode>().unwrap(),
            AutoApproveMode::ManuallyApproveAll
        );
    }

    #[test]
    fn known_modes_parse() {
        assert_eq!(
            "auto_approve_below".parse::<AutoApproveMode>().unwrap(),
            AutoApproveMode::AutoApproveBelow
        );
        assert_eq!(
            "AutoApproveAll".parse::<AutoApproveMode>().unwrap(),
            AutoApproveMode::AutoApproveAll
        );
    }
}
