//! Merchant and category normalization.
//!
//! Merchant cleaning is a pure function. Category resolution maps the
//! aggregator's category hierarchy onto canonical slugs, creating rows inside
//! the caller's transaction the first time a slug is seen.

use crate::models::Category;
use crate::services::database::{db_error, Database};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use service_core::error::AppError;
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upper bound on parent hops when walking the category graph.
pub const MAX_CATEGORY_DEPTH: usize = 16;

static PROCESSOR_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:sq|tst|sp|pp|paypal|pypl|in|ddr|goog)\s*\*\s*")
        .expect("processor prefix regex")
});

static CARD_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:pos\s+|debit\s+card\s+purchase\s+|checkcard\s+|recurring\s+payment\s+|purchase\s+authorized\s+on\s+\d{1,2}/\d{1,2}\s+)",
    )
    .expect("card prefix regex")
});

static NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)#\s*\d+|\bstore\s+\d+\b|\b\d{4,}\b|\b\d{1,2}/\d{1,2}(?:/\d{2,4})?\b")
        .expect("noise regex")
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

static SLUG_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("slug regex"));

/// Strip processor noise from one raw merchant string.
pub fn clean_merchant(raw: &str) -> Option<String> {
    let mut text = raw.trim().to_string();
    // Prefixes can stack ("POS SQ *..."), so strip until stable.
    loop {
        let stripped = {
            let without_card = CARD_PREFIX.replace(&text, "");
            PROCESSOR_PREFIX.replace(&without_card, "").into_owned()
        };
        if stripped == text {
            break;
        }
        text = stripped;
    }

    let text = NOISE.replace_all(&text, " ");
    let text = WHITESPACE.replace_all(&text, " ");
    let text = text.trim_matches(|c: char| c.is_whitespace() || "-*#.,".contains(c));

    if text.is_empty() {
        return None;
    }

    // Shouting bank feeds get title case; mixed case is assumed intentional.
    if text.chars().any(|c| c.is_lowercase()) {
        Some(text.to_string())
    } else {
        Some(title_case(text))
    }
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Merchant name, falling back through merchant → transaction name → description.
pub fn normalize_merchant(
    merchant_name: Option<&str>,
    name: Option<&str>,
    description: Option<&str>,
) -> Option<String> {
    [merchant_name, name, description]
        .into_iter()
        .flatten()
        .find_map(clean_merchant)
}

pub fn slugify(label: &str) -> String {
    let lowered = label.to_lowercase().replace('&', " and ");
    SLUG_INVALID
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

/// One level of a provider category hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySpec {
    pub slug: String,
    pub display_name: String,
}

/// Root-to-leaf canonical path for a provider category list. Empty and
/// unsluggable levels are dropped.
pub fn resolve_category_path(levels: &[String]) -> Vec<CategorySpec> {
    let mut path: Vec<CategorySpec> = Vec::new();
    for level in levels.iter().take(MAX_CATEGORY_DEPTH) {
        let display_name = WHITESPACE.replace_all(level.trim(), " ").into_owned();
        let slug = slugify(&display_name);
        if slug.is_empty() || path.iter().any(|p| p.slug == slug) {
            continue;
        }
        path.push(CategorySpec { slug, display_name });
    }
    path
}

#[derive(Debug, Clone, Copy)]
struct CachedCategory {
    category_id: Uuid,
    parent_id: Option<Uuid>,
}

/// Category rows created or adopted inside an uncommitted transaction.
/// Handed back to [`Normalizer::remember`] once the transaction commits.
#[derive(Debug, Default)]
pub struct PendingCategories(Vec<(String, Uuid, Option<Uuid>)>);

/// Cached slug lookup shared across sync runs.
#[derive(Default)]
pub struct Normalizer {
    cache: RwLock<HashMap<String, CachedCategory>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every stored category into the cache.
    pub async fn warm(&self, db: &Database) -> Result<usize, AppError> {
        let categories = db.list_categories().await?;
        let count = categories.len();
        let mut cache = self
            .cache
            .write()
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("category cache poisoned")))?;
        for category in categories {
            cache.insert(
                category.slug,
                CachedCategory {
                    category_id: category.category_id,
                    parent_id: category.parent_id,
                },
            );
        }
        Ok(count)
    }

    fn cached(&self, slug: &str) -> Option<CachedCategory> {
        self.cache.read().ok().and_then(|c| c.get(slug).copied())
    }

    /// Publish categories whose transaction has committed.
    pub fn remember(&self, pending: PendingCategories) {
        if let Ok(mut cache) = self.cache.write() {
            for (slug, category_id, parent_id) in pending.0 {
                cache.insert(
                    slug,
                    CachedCategory {
                        category_id,
                        parent_id,
                    },
                );
            }
        }
    }

    /// Resolve (creating on first sighting) the leaf category of `levels`.
    pub async fn resolve_in_tx(
        &self,
        conn: &mut SqliteConnection,
        levels: &[String],
        pending: &mut PendingCategories,
    ) -> Result<Option<Uuid>, AppError> {
        let path = resolve_category_path(levels);
        let mut parent_id: Option<Uuid> = None;

        for spec in &path {
            let cached = self.cached(&spec.slug).or_else(|| {
                pending
                    .0
                    .iter()
                    .find(|(slug, _, _)| slug == &spec.slug)
                    .map(|(_, category_id, parent_id)| CachedCategory {
                        category_id: *category_id,
                        parent_id: *parent_id,
                    })
            });

            let current = match cached {
                Some(hit) => hit,
                None => {
                    let row = find_or_create(conn, spec, parent_id).await?;
                    let entry = CachedCategory {
                        category_id: row.category_id,
                        parent_id: row.parent_id,
                    };
                    pending
                        .0
                        .push((spec.slug.clone(), entry.category_id, entry.parent_id));
                    entry
                }
            };

            // A category first seen as a root adopts the parent it is later
            // reported under, unless that would close a loop.
            if current.parent_id.is_none() && parent_id.is_some() {
                if let Some(parent) = parent_id {
                    if adopt_parent(conn, current.category_id, parent).await? {
                        pending
                            .0
                            .push((spec.slug.clone(), current.category_id, Some(parent)));
                    }
                }
            } else if parent_id.is_some() && current.parent_id != parent_id {
                debug!(slug = %spec.slug, "Category reported under a different parent; keeping stored parent");
            }

            parent_id = Some(current.category_id);
        }

        Ok(parent_id)
    }
}

async fn find_or_create(
    conn: &mut SqliteConnection,
    spec: &CategorySpec,
    parent_id: Option<Uuid>,
) -> Result<Category, AppError> {
    sqlx::query(
        r#"
        INSERT INTO categories (category_id, slug, display_name, parent_id, created_utc)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (slug) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&spec.slug)
    .bind(&spec.display_name)
    .bind(parent_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("Failed to create category", e))?;

    sqlx::query_as::<_, Category>(
        "SELECT category_id, slug, display_name, parent_id, created_utc FROM categories WHERE slug = ?",
    )
    .bind(&spec.slug)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| db_error("Failed to load category", e))
}

/// Walk up from `parent_id`; true if `category_id` is reached within the
/// depth bound or the walk itself loops.
async fn would_cycle(
    conn: &mut SqliteConnection,
    category_id: Uuid,
    parent_id: Uuid,
) -> Result<bool, AppError> {
    let mut seen = HashSet::new();
    let mut cursor = Some(parent_id);

    for _ in 0..MAX_CATEGORY_DEPTH {
        let Some(current) = cursor else {
            return Ok(false);
        };
        if current == category_id || !seen.insert(current) {
            return Ok(true);
        }
        cursor = sqlx::query_scalar::<_, Option<Uuid>>(
            "SELECT parent_id FROM categories WHERE category_id = ?",
        )
        .bind(current)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to walk category parents", e))?
        .flatten();
    }

    // Deeper than the bound counts as a cycle for write purposes.
    Ok(cursor.is_some())
}

async fn adopt_parent(
    conn: &mut SqliteConnection,
    category_id: Uuid,
    parent_id: Uuid,
) -> Result<bool, AppError> {
    if would_cycle(conn, category_id, parent_id).await? {
        warn!(category_id = %category_id, parent_id = %parent_id, "Refusing category parent that would create a cycle");
        return Ok(false);
    }

    sqlx::query("UPDATE categories SET parent_id = ? WHERE category_id = ? AND parent_id IS NULL")
        .bind(parent_id)
        .bind(category_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to set category parent", e))?;
    Ok(true)
}

/// Root-to-leaf path for a slug, resolved iteratively with a depth bound.
pub async fn category_path(db: &Database, slug: &str) -> Result<Option<Vec<Category>>, AppError> {
    let Some(leaf) = db.get_category_by_slug(slug).await? else {
        return Ok(None);
    };

    let mut seen = HashSet::from([leaf.category_id]);
    let mut next = leaf.parent_id;
    let mut path = vec![leaf];

    while let Some(parent_id) = next {
        if path.len() >= MAX_CATEGORY_DEPTH {
            warn!(slug = %slug, "Category path exceeds depth bound; truncating");
            break;
        }
        if !seen.insert(parent_id) {
            warn!(slug = %slug, "Category cycle detected; truncating path");
            break;
        }
        match db.get_category(parent_id).await? {
            Some(parent) => {
                next = parent.parent_id;
                path.push(parent);
            }
            None => break,
        }
    }

    path.reverse();
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_merchant_strips_processor_noise() {
        assert_eq!(
            clean_merchant("SQ *BLUE BOTTLE COFFEE #1234").as_deref(),
            Some("Blue Bottle Coffee")
        );
        assert_eq!(
            clean_merchant("TST* SHAKE SHACK 0042").as_deref(),
            Some("Shake Shack")
        );
        assert_eq!(
            clean_merchant("POS PAYPAL *Spotify 4029357733").as_deref(),
            Some("Spotify")
        );
        assert_eq!(clean_merchant("  #0042  "), None);
    }

    #[test]
    fn test_merchant_fallback_chain() {
        assert_eq!(
            normalize_merchant(None, Some("UBER   TRIP 12/03"), Some("ignored")).as_deref(),
            Some("Uber Trip")
        );
        assert_eq!(
            normalize_merchant(Some("   "), None, Some("Rent payment")).as_deref(),
            Some("Rent payment")
        );
        assert_eq!(normalize_merchant(None, None, None), None);
    }

    #[test]
    fn test_category_path_slugs() {
        let path = resolve_category_path(&[
            "Food & Drink".to_string(),
            " Restaurants ".to_string(),
            "".to_string(),
            "Coffee Shop".to_string(),
        ]);
        let slugs: Vec<_> = path.iter().map(|p| p.slug.as_str()).collect();
        assert_eq!(slugs, vec!["food-and-drink", "restaurants", "coffee-shop"]);
        assert_eq!(path[0].display_name, "Food & Drink");
    }

    #[test]
    fn test_repeated_level_is_collapsed() {
        let path = resolve_category_path(&["Travel".to_string(), "travel".to_string()]);
        assert_eq!(path.len(), 1);
    }
}
