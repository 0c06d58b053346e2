use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::InvariantViolation;
use crate::randomization::{Company, FileMetadata};
use crate::types::{GridPos, Properties};

const GIB: u64 = 1 << 30;

/// Subscription tiers, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Plan {
    PersonalFree,
    PersonalPro,
    BusinessStandard,
    BusinessEnterprise,
}

impl Plan {
    pub const ALL: [Plan; 4] =
        [Plan::PersonalFree, Plan::PersonalPro, Plan::BusinessStandard, Plan::BusinessEnterprise];

    pub fn name(self) -> &'static str {
        match self {
            Plan::PersonalFree => "personal/free",
            Plan::PersonalPro => "personal/pro",
            Plan::BusinessStandard => "business/standard",
            Plan::BusinessEnterprise => "business/enterprise",
        }
    }

    /// Storage allocation per account in bytes.
    pub fn allocation_bytes(self) -> u64 {
        match self {
            Plan::PersonalFree => 10 * GIB,
            Plan::PersonalPro => 1_024 * GIB,
            Plan::BusinessStandard => 5 * 1_024 * GIB,
            Plan::BusinessEnterprise => 100 * 1_024 * GIB,
        }
    }

    pub fn price_per_seat_usd(self) -> f64 {
        match self {
            Plan::PersonalFree => 0.0,
            Plan::PersonalPro => 10.0,
            Plan::BusinessStandard => 12.5,
            Plan::BusinessEnterprise => 20.0,
        }
    }

    pub fn is_business(self) -> bool {
        matches!(self, Plan::BusinessStandard | Plan::BusinessEnterprise)
    }

    pub fn successor(self) -> Result<Plan, InvariantViolation> {
        match self {
            Plan::PersonalFree => Ok(Plan::PersonalPro),
            Plan::PersonalPro => Ok(Plan::BusinessStandard),
            Plan::BusinessStandard => Ok(Plan::BusinessEnterprise),
            Plan::BusinessEnterprise => Err(InvariantViolation::NoSuccessorPlan(self.name())),
        }
    }

    pub fn predecessor(self) -> Result<Plan, InvariantViolation> {
        match self {
            Plan::PersonalFree => Err(InvariantViolation::NoPredecessorPlan(self.name())),
            Plan::PersonalPro => Ok(Plan::PersonalFree),
            Plan::BusinessStandard => Ok(Plan::PersonalPro),
            Plan::BusinessEnterprise => Ok(Plan::BusinessStandard),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AccountId(pub usize);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HedgeboxFile {
    pub id: Uuid,
    pub metadata: FileMetadata,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: GridPos,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub plan: Plan,
    pub team_members: BTreeSet<GridPos>,
    pub files: Vec<HedgeboxFile>,
    pub was_billing_scheduled: bool,
}

impl Account {
    pub fn new(id: Uuid, created_at: DateTime<Utc>, plan: Plan, founder: GridPos) -> Self {
        Account {
            id,
            created_at,
            plan,
            team_members: BTreeSet::from([founder]),
            files: Vec::new(),
            was_billing_scheduled: false,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.metadata.size_b).sum()
    }

    pub fn allocation_used_fraction(&self) -> f64 {
        self.used_bytes() as f64 / self.plan.allocation_bytes() as f64
    }

    pub fn seats(&self) -> usize {
        self.team_members.len()
    }

    /// Monthly bill: per-seat price times seats.
    pub fn bill_usd(&self) -> f64 {
        self.plan.price_per_seat_usd() * self.seats() as f64
    }

    pub fn file(&self, id: Uuid) -> Option<&HedgeboxFile> {
        self.files.iter().find(|f| f.id == id)
    }

    /// Properties mirrored onto the `account` group.
    pub fn group_properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert("plan".into(), json!(self.plan.name()));
        props.insert("team_size".into(), json!(self.seats()));
        props.insert("file_count".into(), json!(self.files.len()));
        props.insert("used_mb".into(), json!(self.used_bytes() / (1 << 20)));
        props.insert("created_at".into(), json!(self.created_at));
        props
    }
}

/// Product state shared by everyone in one cluster.
#[derive(Debug, Default)]
pub struct HedgeboxShared {
    /// Present when the cluster is a workplace rather than a circle of friends.
    pub company: Option<Company>,
    pub accounts: Vec<Account>,
}

impl HedgeboxShared {
    pub fn open_account(&mut self, account: Account) -> AccountId {
        self.accounts.push(account);
        AccountId(self.accounts.len() - 1)
    }

    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(id.0)
    }

    pub fn account_mut(&mut self, id: AccountId) -> Option<&mut Account> {
        self.accounts.get_mut(id.0)
    }

    pub fn is_member(&self, id: AccountId, pos: GridPos) -> bool {
        self.account(id).is_some_and(|a| a.team_members.contains(&pos))
    }

    pub fn company_group_properties(&self) -> Option<(String, Properties)> {
        let company = self.company.as_ref()?;
        let mut props = Properties::new();
        props.insert("name".into(), json!(company.name));
        props.insert("industry".into(), json!(company.industry));
        Some((company.domain.clone(), props))
    }
}
