use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// Starting balance granted to every new user account.
pub const DEFAULT_BALANCE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Week,
    Month,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPack {
    pub id: &'static str,
    pub name: &'static str,
    pub tokens: u32,
    pub price_usd: u32,
    pub price_slug: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenSubscription {
    pub id: &'static str,
    pub name: &'static str,
    pub tokens_per_period: u32,
    pub price_usd: u32,
    pub price_slug: &'static str,
    pub interval: BillingInterval,
}

pub const TOKEN_PACKS: [TokenPack; 2] = [
    TokenPack {
        id: "starter",
        name: "Starter Pack",
        tokens: 100,
        price_usd: 5,
        price_slug: "starter_pack",
    },
    TokenPack {
        id: "pro",
        name: "Pro Pack",
        tokens: 500,
        price_usd: 20,
        price_slug: "pro_pack",
    },
];

pub const TOKEN_SUBSCRIPTIONS: [TokenSubscription; 2] = [
    TokenSubscription {
        id: "monthly",
        name: "Monthly Plan",
        tokens_per_period: 200,
        price_usd: 10,
        price_slug: "monthly_plan",
        interval: BillingInterval::Month,
    },
    TokenSubscription {
        id: "weekly",
        name: "Weekly Plan",
        tokens_per_period: 50,
        price_usd: 3,
        price_slug: "weekly_plan",
        interval: BillingInterval::Week,
    },
];

/// A purchasable token product: one-time pack or recurring subscription.
#[derive(Debug, Clone)]
pub enum TokenProduct {
    Pack(TokenPack),
    Subscription(TokenSubscription),
}

impl TokenProduct {
    /// Tokens credited when the product is purchased (first period for
    /// subscriptions).
    pub fn tokens_per_purchase(&self) -> u32 {
        match self {
            TokenProduct::Pack(pack) => pack.tokens,
            TokenProduct::Subscription(sub) => sub.tokens_per_period,
        }
    }
}

pub fn token_product_by_price_slug(price_slug: &str) -> Option<TokenProduct> {
    TOKEN_PACKS
        .iter()
        .find(|pack| pack.price_slug == price_slug)
        .cloned()
        .map(TokenProduct::Pack)
        .or_else(|| {
            TOKEN_SUBSCRIPTIONS
                .iter()
                .find(|sub| sub.price_slug == price_slug)
                .cloned()
                .map(TokenProduct::Subscription)
        })
}

#[derive(Debug, Error, PartialEq)]
#[error("insufficient tokens: need {needed}, have {available}")]
pub struct InsufficientBalance {
    pub needed: u32,
    pub available: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionState {
    pub subscription_id: String,
    pub interval: BillingInterval,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenAccount {
    pub balance: u32,
    pub last_refresh: DateTime<Utc>,
    pub subscription: Option<SubscriptionState>,
    #[serde(skip)]
    credited_purchases: HashSet<String>,
}

impl TokenAccount {
    fn new() -> Self {
        Self {
            balance: DEFAULT_BALANCE,
            last_refresh: Utc::now(),
            subscription: None,
            credited_purchases: HashSet::new(),
        }
    }
}

/// In-memory per-user token balances. Accounts are created lazily with the
/// default starting balance on first touch.
#[derive(Debug, Default)]
pub struct TokenLedger {
    accounts: DashMap<String, TokenAccount>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, user_id: &str) -> u32 {
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(TokenAccount::new)
            .balance
    }

    pub fn account(&self, user_id: &str) -> TokenAccount {
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(TokenAccount::new)
            .clone()
    }

    /// Deduct `amount` tokens, failing without side effects when the
    /// balance is short. Returns the new balance.
    pub fn deduct(&self, user_id: &str, amount: u32) -> Result<u32, InsufficientBalance> {
        let mut account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(TokenAccount::new);

        if account.balance < amount {
            return Err(InsufficientBalance {
                needed: amount,
                available: account.balance,
            });
        }

        account.balance -= amount;
        Ok(account.balance)
    }

    /// Credit tokens unconditionally. Returns the new balance.
    pub fn credit(&self, user_id: &str, amount: u32, reason: &str) -> u32 {
        let mut account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(TokenAccount::new);
        account.balance += amount;

        info!(
            user_id,
            amount,
            reason,
            new_balance = account.balance,
            "Credited tokens"
        );
        account.balance
    }

    /// Credit a purchase at most once per purchase id. Returns `false`
    /// when the purchase was already credited.
    pub fn credit_purchase_once(&self, user_id: &str, purchase_id: &str, amount: u32) -> bool {
        let mut account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(TokenAccount::new);

        if !account.credited_purchases.insert(purchase_id.to_string()) {
            return false;
        }

        account.balance += amount;
        info!(
            user_id,
            purchase_id,
            amount,
            new_balance = account.balance,
            "Credited purchase"
        );
        true
    }

    pub fn set_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
        interval: BillingInterval,
        tokens_to_credit: u32,
    ) {
        let mut account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(TokenAccount::new);
        account.subscription = Some(SubscriptionState {
            subscription_id: subscription_id.to_string(),
            interval,
        });
        account.last_refresh = Utc::now();
        account.balance += tokens_to_credit;

        info!(user_id, subscription_id, tokens_to_credit, "Subscription set");
    }

    pub fn cancel_subscription(&self, user_id: &str) {
        if let Some(mut account) = self.accounts.get_mut(user_id) {
            account.subscription = None;
            info!(user_id, "Subscription cancelled");
        }
    }

    /// Period renewal: credit the subscription's tokens and stamp the
    /// refresh time.
    pub fn refresh_subscription(&self, user_id: &str, tokens_to_credit: u32) {
        let mut account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(TokenAccount::new);
        account.balance += tokens_to_credit;
        account.last_refresh = Utc::now();

        info!(
            user_id,
            tokens_to_credit,
            new_balance = account.balance,
            "Subscription refresh"
        );
    }
}
