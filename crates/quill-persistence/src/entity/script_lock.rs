//! Script lock entity
//!
//! The `script_id` primary key is the uniqueness constraint behind the
//! at-most-one-lock-per-script invariant.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "script_lock")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub script_id: String,
    pub holder_id: String,
    pub holder_name: String,
    pub acquired_at: DateTimeUtc,
    pub last_heartbeat: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
