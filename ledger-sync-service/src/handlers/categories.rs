use crate::services::normalizer::category_path as resolve_path;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct CategoryNode {
    pub slug: String,
    pub display_name: String,
}

/// `GET /categories/:slug/path`, root first.
pub async fn category_path(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<CategoryNode>>, AppError> {
    let path = resolve_path(&state.db, &slug)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Category not found")))?;

    Ok(Json(
        path.into_iter()
            .map(|c| CategoryNode {
                slug: c.slug,
                display_name: c.display_name,
            })
            .collect(),
    ))
}
