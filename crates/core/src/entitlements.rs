use std::collections::{BTreeMap, HashSet};

use dashmap::DashMap;
use tracing::info;

use crate::registry::{BlockRegistry, FREE_FEATURE_SLUG};

/// In-memory entitlement grants, keyed by user then feature slug.
///
/// Stands in for the billing provider's feature-access checks: grants are
/// written by the demo checkout flow and incoming webhooks. Free blocks
/// always pass.
#[derive(Debug, Default)]
pub struct EntitlementStore {
    unlocked: DashMap<String, HashSet<String>>,
}

impl EntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_access(&self, user_id: &str, feature_slug: &str) -> bool {
        if feature_slug == FREE_FEATURE_SLUG {
            return true;
        }

        self.unlocked
            .get(user_id)
            .map(|slugs| slugs.contains(feature_slug))
            .unwrap_or(false)
    }

    pub fn grant(&self, user_id: &str, feature_slug: &str) {
        if feature_slug == FREE_FEATURE_SLUG {
            return;
        }

        self.unlocked
            .entry(user_id.to_string())
            .or_default()
            .insert(feature_slug.to_string());
        info!(user_id, feature_slug, "Entitlement granted");
    }

    pub fn revoke(&self, user_id: &str, feature_slug: &str) {
        if let Some(mut slugs) = self.unlocked.get_mut(user_id) {
            slugs.remove(feature_slug);
        }
    }

    /// Access map over the full block catalog, the shape served by
    /// `GET /api/entitlements`.
    pub fn snapshot_for(&self, user_id: &str, registry: &BlockRegistry) -> BTreeMap<String, bool> {
        registry
            .all()
            .into_iter()
            .map(|block| {
                (
                    block.feature_slug.clone(),
                    self.has_access(user_id, &block.feature_slug),
                )
            })
            .collect()
    }
}
