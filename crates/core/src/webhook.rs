use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use crate::entitlements::EntitlementStore;
use crate::registry::BlockRegistry;
use crate::tokens::{token_product_by_price_slug, TokenLedger, TokenProduct};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Error, PartialEq)]
pub enum WebhookError {
    #[error("webhook secret is not configured")]
    MissingSecret,

    #[error("missing {SIGNATURE_HEADER} header")]
    MissingSignature,

    #[error("webhook signature mismatch")]
    SignatureMismatch,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomerInfo {
    pub id: String,
    pub external_id: String,
}

/// Billing-provider event envelope. Unknown event types are acknowledged
/// and ignored so provider-side additions never bounce deliveries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub customer: Option<CustomerInfo>,
    #[serde(default)]
    pub price_slug: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Verify the HMAC-SHA256 signature over the raw body and decode the
/// event. The header value is hex, optionally prefixed with `sha256=`.
pub fn verify_webhook(
    raw_body: &[u8],
    signature_header: Option<&str>,
    secret: Option<&str>,
) -> Result<WebhookEvent, WebhookError> {
    let secret = secret.ok_or(WebhookError::MissingSecret)?;
    let provided = signature_header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(WebhookError::MissingSignature)?;
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);

    if !provided.eq_ignore_ascii_case(&sign_body(raw_body, secret)) {
        return Err(WebhookError::SignatureMismatch);
    }

    serde_json::from_slice(raw_body).map_err(|err| WebhookError::InvalidPayload(err.to_string()))
}

pub fn sign_body(raw_body: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(raw_body);
    let tag = mac.finalize().into_bytes();
    format!("{tag:x}")
}

/// Tracks processed event ids so redelivered webhooks are acknowledged
/// without reprocessing.
#[derive(Debug, Default)]
pub struct IdempotencyStore {
    seen: DashMap<String, DateTime<Utc>>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event id; returns `false` when it was already seen.
    pub fn record(&self, event_id: &str) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.seen.entry(event_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Utc::now());
                true
            }
        }
    }
}

/// Apply a verified event to the ledger and entitlement stores.
pub fn handle_event(
    event: &WebhookEvent,
    ledger: &TokenLedger,
    entitlements: &EntitlementStore,
    registry: &BlockRegistry,
) {
    let Some(customer) = &event.customer else {
        warn!(event_id = %event.id, event_type = %event.event_type, "Webhook event without customer");
        return;
    };
    let user_id = customer.external_id.as_str();

    match event.event_type.as_str() {
        "payment.succeeded" => {
            let Some(price_slug) = event.price_slug.as_deref() else {
                warn!(event_id = %event.id, "payment.succeeded without price_slug");
                return;
            };

            if let Some(product) = token_product_by_price_slug(price_slug) {
                let credited = ledger.credit_purchase_once(
                    user_id,
                    &event.id,
                    product.tokens_per_purchase(),
                );
                if let (TokenProduct::Subscription(sub), Some(subscription_id)) =
                    (&product, event.subscription_id.as_deref())
                {
                    if credited {
                        ledger.set_subscription(user_id, subscription_id, sub.interval, 0);
                    }
                }
            } else if let Some(block) = registry
                .all()
                .into_iter()
                .find(|block| block.price_slug == price_slug)
            {
                entitlements.grant(user_id, &block.feature_slug);
            } else {
                warn!(event_id = %event.id, price_slug, "payment.succeeded for unknown price");
            }
        }
        "subscription.created" => {
            let Some(price_slug) = event.price_slug.as_deref() else {
                return;
            };
            if let Some(TokenProduct::Subscription(sub)) = token_product_by_price_slug(price_slug)
            {
                let subscription_id = event.subscription_id.as_deref().unwrap_or(&event.id);
                ledger.set_subscription(
                    user_id,
                    subscription_id,
                    sub.interval,
                    sub.tokens_per_period,
                );
            }
        }
        "payment.failed" => {
            warn!(
                event_id = %event.id,
                user_id,
                reason = event.failure_reason.as_deref().unwrap_or("unknown"),
                "Payment failed"
            );
        }
        other => {
            info!(event_id = %event.id, event_type = other, "Ignoring webhook event type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::build_default_registry;
    use crate::tokens::DEFAULT_BALANCE;

    const SECRET: &str = "whsec_test";

    fn event_body(id: &str, event_type: &str, price_slug: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": id,
            "type": event_type,
            "customer": {"id": "cus_1", "external_id": "user-1"},
            "price_slug": price_slug,
        }))
        .expect("serialize event")
    }

    #[test]
    fn test_verify_accepts_valid_signature() {
        let body = event_body("evt_1", "payment.succeeded", "starter_pack");
        let signature = sign_body(&body, SECRET);

        let event = verify_webhook(&body, Some(&signature), Some(SECRET)).expect("verified");
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "payment.succeeded");

        // The sha256= prefix is tolerated.
        let prefixed = format!("sha256={signature}");
        verify_webhook(&body, Some(&prefixed), Some(SECRET)).expect("prefixed verified");
    }

    #[test]
    fn test_verify_rejects_tampered_body_and_missing_pieces() {
        let body = event_body("evt_1", "payment.succeeded", "starter_pack");
        let signature = sign_body(&body, SECRET);

        let mut tampered = body.clone();
        tampered[0] ^= 1;
        assert_eq!(
            verify_webhook(&tampered, Some(&signature), Some(SECRET)),
            Err(WebhookError::SignatureMismatch)
        );
        assert_eq!(
            verify_webhook(&body, None, Some(SECRET)),
            Err(WebhookError::MissingSignature)
        );
        assert_eq!(
            verify_webhook(&body, Some(&signature), None),
            Err(WebhookError::MissingSecret)
        );
    }

    #[test]
    fn test_verify_rejects_garbage_payload() {
        let body = b"not json".to_vec();
        let signature = sign_body(&body, SECRET);

        match verify_webhook(&body, Some(&signature), Some(SECRET)) {
            Err(WebhookError::InvalidPayload(_)) => {}
            other => panic!("expected invalid payload, got {other:?}"),
        }
    }

    #[test]
    fn test_idempotency_store_records_once() {
        let store = IdempotencyStore::new();
        assert!(store.record("evt_1"));
        assert!(!store.record("evt_1"));
        assert!(store.record("evt_2"));
    }

    #[test]
    fn test_payment_succeeded_credits_token_pack_once() {
        let registry = build_default_registry();
        let ledger = TokenLedger::new();
        let entitlements = EntitlementStore::new();
        let body = event_body("evt_1", "payment.succeeded", "starter_pack");
        let event: WebhookEvent = serde_json::from_slice(&body).expect("parse");

        handle_event(&event, &ledger, &entitlements, &registry);
        handle_event(&event, &ledger, &entitlements, &registry);

        // Redelivery of the same event id must not double-credit.
        assert_eq!(ledger.balance("user-1"), DEFAULT_BALANCE + 100);
    }

    #[test]
    fn test_payment_succeeded_grants_block_entitlement() {
        let registry = build_default_registry();
        let ledger = TokenLedger::new();
        let entitlements = EntitlementStore::new();
        let body = event_body("evt_2", "payment.succeeded", "summarize_text");
        let event: WebhookEvent = serde_json::from_slice(&body).expect("parse");

        handle_event(&event, &ledger, &entitlements, &registry);

        assert!(entitlements.has_access("user-1", "summarize_text"));
        assert_eq!(ledger.balance("user-1"), DEFAULT_BALANCE);
    }

    #[test]
    fn test_subscription_created_sets_state_and_credits() {
        let registry = build_default_registry();
        let ledger = TokenLedger::new();
        let entitlements = EntitlementStore::new();
        let body = event_body("evt_3", "subscription.created", "monthly_plan");
        let event: WebhookEvent = serde_json::from_slice(&body).expect("parse");

        handle_event(&event, &ledger, &entitlements, &registry);

        let account = ledger.account("user-1");
        assert_eq!(account.balance, DEFAULT_BALANCE + 200);
        assert!(account.subscription.is_some());
    }
}
