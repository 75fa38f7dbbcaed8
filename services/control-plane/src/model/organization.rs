//! Organizations: tenants owning a token budget.

use batchfleet_id::OrgId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A tenant with a finite resource budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    pub memo: String,

    /// Tokens not currently reserved by an active pipeline. Never negative.
    pub token_budget: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an organization.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewOrganization {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    pub name: String,

    #[serde(default)]
    pub memo: String,

    #[validate(range(min = 0, message = "token_budget cannot be negative"))]
    pub token_budget: i64,
}

impl Organization {
    /// Build a new organization from validated input.
    pub fn new(input: NewOrganization) -> Self {
        let now = Utc::now();
        Self {
            id: OrgId::new(),
            name: input.name,
            memo: input.memo,
            token_budget: input.token_budget,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if `tokens` can be debited without going negative.
    pub fn can_afford(&self, tokens: i64) -> bool {
        tokens <= self.token_budget
    }
}
