//! Buyer-side state: balances and profiles.

use chrono::{DateTime, Utc};
use common::UserId;
use serde::{Deserialize, Serialize};

use crate::Money;

/// A user's spendable balance, owned by the balance service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: UserId,
    pub amount: Money,
}

impl Balance {
    pub fn new(user_id: UserId, amount: Money) -> Self {
        Self { user_id, amount }
    }
}

/// User profile. The cached copy lives under `user:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub name: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            status: String::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn cache_key(&self) -> String {
        self.user_id.cache_key()
    }
}
