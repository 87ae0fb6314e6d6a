//! Access rule storage
//!
//! Rules attach to content items and taxonomy terms; both live in one
//! table keyed by (scope, scope_id). Tag sets are stored as JSON arrays.

use crate::services::access::AccessRule;
use crate::db::users::TagSet;
use crmgate_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Rule scope discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    Content,
    Term,
}

impl RuleScope {
    fn as_str(&self) -> &'static str {
        match self {
            RuleScope::Content => "content",
            RuleScope::Term => "term",
        }
    }
}

fn parse_tag_set(json: &str) -> Result<TagSet> {
    serde_json::from_str(json).map_err(|e| Error::Internal(format!("Corrupt tag set column: {}", e)))
}

fn rule_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AccessRule> {
    let lock_content: i64 = row.try_get("lock_content").map_err(Error::Database)?;
    let allow_tags: String = row.try_get("allow_tags").map_err(Error::Database)?;
    let allow_tags_all: String = row.try_get("allow_tags_all").map_err(Error::Database)?;
    let allow_tags_not: String = row.try_get("allow_tags_not").map_err(Error::Database)?;
    let apply_tags: String = row.try_get("apply_tags").map_err(Error::Database)?;
    let remove_tags: String = row.try_get("remove_tags").map_err(Error::Database)?;

    Ok(AccessRule {
        lock_content: lock_content != 0,
        allow_tags: parse_tag_set(&allow_tags)?,
        allow_tags_all: parse_tag_set(&allow_tags_all)?,
        allow_tags_not: parse_tag_set(&allow_tags_not)?,
        apply_tags: parse_tag_set(&apply_tags)?,
        remove_tags: parse_tag_set(&remove_tags)?,
        redirect: row.try_get("redirect").map_err(Error::Database)?,
        redirect_url: row.try_get("redirect_url").map_err(Error::Database)?,
        message: row.try_get("message").map_err(Error::Database)?,
    })
}

/// Fetch the rule for one content item, if any
pub async fn get_content_rule(db: &SqlitePool, content_id: i64) -> Result<Option<AccessRule>> {
    get_rule(db, RuleScope::Content, content_id).await
}

/// Fetch the rule for one scope entry
pub async fn get_rule(
    db: &SqlitePool,
    scope: RuleScope,
    scope_id: i64,
) -> Result<Option<AccessRule>> {
    let row = sqlx::query("SELECT * FROM access_rules WHERE scope = ? AND scope_id = ?")
        .bind(scope.as_str())
        .bind(scope_id)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    row.as_ref().map(rule_from_row).transpose()
}

/// Fetch rules for every term attached to a content item
///
/// Terms with no rule row are skipped; order follows term id for
/// determinism.
pub async fn get_term_rules_for_content(
    db: &SqlitePool,
    content_id: i64,
) -> Result<Vec<AccessRule>> {
    let rows = sqlx::query(
        r#"
        SELECT r.* FROM access_rules r
        JOIN content_terms ct ON ct.term_id = r.scope_id
        WHERE r.scope = 'term' AND ct.content_id = ?
        ORDER BY r.scope_id
        "#,
    )
    .bind(content_id)
    .fetch_all(db)
    .await
    .map_err(Error::Database)?;

    rows.iter().map(rule_from_row).collect()
}

/// Insert or replace a rule
pub async fn upsert_rule(
    db: &SqlitePool,
    scope: RuleScope,
    scope_id: i64,
    rule: &AccessRule,
) -> Result<()> {
    let to_json = |set: &TagSet| -> Result<String> {
        serde_json::to_string(set).map_err(|e| Error::Internal(e.to_string()))
    };

    sqlx::query(
        r#"
        INSERT INTO access_rules
            (scope, scope_id, lock_content, allow_tags, allow_tags_all,
             allow_tags_not, apply_tags, remove_tags, redirect, redirect_url, message)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(scope, scope_id) DO UPDATE SET
            lock_content = excluded.lock_content,
            allow_tags = excluded.allow_tags,
            allow_tags_all = excluded.allow_tags_all,
            allow_tags_not = excluded.allow_tags_not,
            apply_tags = excluded.apply_tags,
            remove_tags = excluded.remove_tags,
            redirect = excluded.redirect,
            redirect_url = excluded.redirect_url,
            message = excluded.message
        "#,
    )
    .bind(scope.as_str())
    .bind(scope_id)
    .bind(rule.lock_content as i64)
    .bind(to_json(&rule.allow_tags)?)
    .bind(to_json(&rule.allow_tags_all)?)
    .bind(to_json(&rule.allow_tags_not)?)
    .bind(to_json(&rule.apply_tags)?)
    .bind(to_json(&rule.remove_tags)?)
    .bind(rule.redirect)
    .bind(&rule.redirect_url)
    .bind(&rule.message)
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}

/// Attach a term to a content item
pub async fn attach_term(db: &SqlitePool, content_id: i64, term_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO content_terms (content_id, term_id) VALUES (?, ?)")
        .bind(content_id)
        .bind(term_id)
        .execute(db)
        .await
        .map_err(Error::Database)?;

    Ok(())
}
