//! Content access evaluation
//!
//! Pure decision logic: given a content rule, a viewer, and the viewer's
//! tag set, compute allow/deny and a redirect target. No storage access
//! happens here; callers load rules and tags first.
//!
//! Evaluation order is fixed:
//! 1. privileged-viewer exemption (site-wide option)
//! 2. excluded tags deny
//! 3. absent/empty rule allows
//! 4. unlocked content allows
//! 5. locked content denies unauthenticated viewers
//! 6. both required sets empty allows any authenticated viewer
//! 7. required-any with empty intersection denies
//! 8. required-all without full coverage denies
//! 9. otherwise allow

use crate::db::settings::RuntimeOptions;
use crate::db::users::TagSet;
use serde::{Deserialize, Serialize};

/// Access rule attached to a content item or taxonomy term
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessRule {
    /// Whether this item is restricted at all
    pub lock_content: bool,
    /// Viewer needs at least one of these tags
    #[serde(default)]
    pub allow_tags: TagSet,
    /// Viewer needs every one of these tags
    #[serde(default)]
    pub allow_tags_all: TagSet,
    /// Any of these tags denies outright
    #[serde(default)]
    pub allow_tags_not: TagSet,
    /// Tags applied to the viewer after a successful view
    #[serde(default)]
    pub apply_tags: TagSet,
    /// Tags removed from the viewer after a successful view
    #[serde(default)]
    pub remove_tags: TagSet,
    /// Content id to redirect denied viewers to
    pub redirect: Option<i64>,
    /// URL to redirect denied viewers to (takes precedence over `redirect`)
    pub redirect_url: Option<String>,
    /// Per-item restricted-content message override
    pub message: Option<String>,
}

impl AccessRule {
    /// A rule with no restriction effect
    pub fn is_empty(&self) -> bool {
        !self.lock_content && self.allow_tags_not.is_empty()
    }
}

/// Who is looking at the content
#[derive(Debug, Clone, Copy, Default)]
pub struct Viewer {
    pub authenticated: bool,
    /// Holds elevated privileges (admin exemption candidate)
    pub privileged: bool,
}

/// Why access was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Viewer holds an excluded tag
    ExcludedTag,
    /// Locked content, viewer not authenticated
    Unauthenticated,
    /// None of the required-any tags present
    MissingAnyTag,
    /// Not all of the required-all tags present
    MissingAllTags,
}

/// Access decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied(DenyReason),
}

impl Access {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Access::Allowed)
    }
}

/// Where to send a denied viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RedirectTarget {
    /// External or site URL
    Url { url: String },
    /// Another content item
    Content { content_id: i64 },
    /// No redirect; render the restricted-content message in place
    Message { message: String },
}

/// Evaluate one rule against a viewer's tag set
pub fn evaluate(
    rule: Option<&AccessRule>,
    user_tags: &TagSet,
    viewer: &Viewer,
    options: &RuntimeOptions,
) -> Access {
    // Site-wide exemption short-circuits before any rule is consulted
    if options.exclude_admins && viewer.privileged {
        return Access::Allowed;
    }

    let rule = match rule {
        Some(rule) => rule,
        None => return Access::Allowed,
    };

    // Excluded tags deny first, even on unlocked content
    if rule.allow_tags_not.intersection(user_tags).next().is_some() {
        return Access::Denied(DenyReason::ExcludedTag);
    }

    if rule.is_empty() || !rule.lock_content {
        return Access::Allowed;
    }

    if !viewer.authenticated {
        return Access::Denied(DenyReason::Unauthenticated);
    }

    // Locked with no tag requirements: any authenticated viewer passes
    if rule.allow_tags.is_empty() && rule.allow_tags_all.is_empty() {
        return Access::Allowed;
    }

    if !rule.allow_tags.is_empty()
        && rule.allow_tags.intersection(user_tags).next().is_none()
    {
        return Access::Denied(DenyReason::MissingAnyTag);
    }

    if !rule.allow_tags_all.is_empty()
        && rule.allow_tags_all.intersection(user_tags).count() != rule.allow_tags_all.len()
    {
        return Access::Denied(DenyReason::MissingAllTags);
    }

    Access::Allowed
}

/// Evaluate term-level rules layered above an item-level rule
///
/// Term rules run first; the first denial wins and the item rule is never
/// consulted.
pub fn evaluate_layered(
    term_rules: &[AccessRule],
    item_rule: Option<&AccessRule>,
    user_tags: &TagSet,
    viewer: &Viewer,
    options: &RuntimeOptions,
) -> Access {
    for rule in term_rules {
        let access = evaluate(Some(rule), user_tags, viewer, options);
        if !access.is_allowed() {
            return access;
        }
    }

    evaluate(item_rule, user_tags, viewer, options)
}

/// Resolve the redirect target for a denied view
///
/// Priority: explicit URL > explicit content redirect > site default >
/// in-page message. A redirect pointing at the denied item itself is
/// treated as no-redirect to prevent loops.
pub fn resolve_redirect(
    content_id: i64,
    rule: &AccessRule,
    options: &RuntimeOptions,
) -> RedirectTarget {
    if let Some(url) = &rule.redirect_url {
        if !url.is_empty() {
            return RedirectTarget::Url { url: url.clone() };
        }
    }

    if let Some(target) = rule.redirect {
        if target != content_id {
            return RedirectTarget::Content { content_id: target };
        }
    }

    if let Some(url) = &options.default_redirect {
        if !url.is_empty() {
            return RedirectTarget::Url { url: url.clone() };
        }
    }

    let message = rule
        .message
        .clone()
        .unwrap_or_else(|| options.restricted_message.clone());
    RedirectTarget::Message { message }
}
