use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Category {
    pub category_id: Uuid,
    pub slug: String,
    pub display_name: String,
    pub parent_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}
