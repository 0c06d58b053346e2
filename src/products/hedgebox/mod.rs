mod models;
mod person;

pub use models::{Account, AccountId, HedgeboxFile, HedgeboxShared, Plan};
pub use person::{
    FlagSchedule, HedgeboxCommand, HedgeboxCondition, HedgeboxIntent, HedgeboxPerson, SignupVariant,
};

// ── Pages ─────────────────────────────────────────────────────────────────────

pub const SITE_URL: &str = "https://hedgebox.net";
pub const URL_HOME: &str = "https://hedgebox.net/";
pub const URL_MARIUS_TECH_TIPS: &str = "https://hedgebox.net/mariustechtips/";
pub const URL_PRICING: &str = "https://hedgebox.net/pricing/";
pub const URL_SIGNUP: &str = "https://hedgebox.net/register/";
pub const URL_LOGIN: &str = "https://hedgebox.net/login/";
pub const URL_FILES: &str = "https://hedgebox.net/files/";
pub const URL_ACCOUNT_SETTINGS: &str = "https://hedgebox.net/account/settings/";
pub const URL_ACCOUNT_BILLING: &str = "https://hedgebox.net/account/billing/";
pub const URL_ACCOUNT_TEAM: &str = "https://hedgebox.net/account/team/";

pub fn url_file(file_id: uuid::Uuid) -> String {
    format!("{SITE_URL}/files/{file_id}/")
}

// ── Events ────────────────────────────────────────────────────────────────────

pub const EVENT_SIGNED_UP: &str = "signed_up";
pub const EVENT_LOGGED_IN: &str = "logged_in";
pub const EVENT_UPLOADED_FILE: &str = "uploaded_file";
pub const EVENT_DOWNLOADED_FILE: &str = "downloaded_file";
pub const EVENT_DELETED_FILE: &str = "deleted_file";
pub const EVENT_SHARED_FILE_LINK: &str = "shared_file_link";
pub const EVENT_UPGRADED_PLAN: &str = "upgraded_plan";
pub const EVENT_DOWNGRADED_PLAN: &str = "downgraded_plan";
pub const EVENT_INVITED_TEAM_MEMBER: &str = "invited_team_member";
pub const EVENT_REMOVED_TEAM_MEMBER: &str = "removed_team_member";
pub const EVENT_PAID_BILL: &str = "paid_bill";

// ── Groups and flags ──────────────────────────────────────────────────────────

pub const GROUP_TYPE_ACCOUNT: &str = "account";
pub const GROUP_TYPE_COMPANY: &str = "company";

pub const SIGNUP_PAGE_FLAG_KEY: &str = "signup-page-4.0";
pub const FILE_PREVIEWS_FLAG_KEY: &str = "file-previews";
