use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::models::{Account, AccountId, HedgeboxFile, HedgeboxShared, Plan};
use super::{
    EVENT_DELETED_FILE, EVENT_DOWNGRADED_PLAN, EVENT_DOWNLOADED_FILE, EVENT_INVITED_TEAM_MEMBER,
    EVENT_LOGGED_IN, EVENT_PAID_BILL, EVENT_REMOVED_TEAM_MEMBER, EVENT_SHARED_FILE_LINK,
    EVENT_SIGNED_UP, EVENT_UPGRADED_PLAN, EVENT_UPLOADED_FILE, FILE_PREVIEWS_FLAG_KEY,
    GROUP_TYPE_ACCOUNT, GROUP_TYPE_COMPANY, SIGNUP_PAGE_FLAG_KEY, URL_ACCOUNT_BILLING,
    URL_ACCOUNT_SETTINGS, URL_ACCOUNT_TEAM, URL_FILES, URL_HOME, URL_LOGIN, URL_MARIUS_TECH_TIPS,
    URL_PRICING, URL_SIGNUP, url_file,
};
use crate::behavior::{ClusterInfo, PersonBehavior, SessionContext, SpawnContext};
use crate::effects::Target;
use crate::error::InvariantViolation;
use crate::person::PersonState;
use crate::randomization::{FileMetadata, RandomStream};
use crate::types::{Properties, seconds};

type Ctx<'a> = SessionContext<'a, HedgeboxPerson>;

/// Signed-up people below this satisfaction stop coming back.
const CHURN_SATISFACTION: f64 = -0.6;
/// People who never signed up with less need than this go dormant.
const DISINTEREST_NEED: f64 = 0.1;
const BILLING_PERIOD_DAYS: i64 = 30;
const MAX_RADIUS: u64 = 3;
const COMPANY_CLUSTER_CHANCE: f64 = 0.35;
const PREVIEWS_ROLLOUT: f64 = 0.5;
/// Super property carrying the plan of the logged-in account.
const PLAN_SUPER_PROPERTY: &str = "account_plan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignupVariant {
    Control,
    Test,
}

impl SignupVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            SignupVariant::Control => "control",
            SignupVariant::Test => "test",
        }
    }
}

/// When the product's flags are live, relative to the matrix "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSchedule {
    pub experiment_start: DateTime<Utc>,
    pub experiment_end: DateTime<Utc>,
    pub previews_launch: DateTime<Utc>,
}

impl FlagSchedule {
    pub fn around(now: DateTime<Utc>) -> Self {
        FlagSchedule {
            experiment_start: now - Duration::days(30),
            experiment_end: now + Duration::days(14),
            previews_launch: now - Duration::days(45),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeboxIntent {
    ConsiderProduct,
    CheckMarketingUpdates,
    UploadFiles,
    DownloadOwnFile,
    DeleteFiles,
    ShareFile,
    ViewSharedFile,
    InviteTeamMember,
    RemoveTeamMember,
    UpgradePlan,
    DowngradePlan,
}

#[derive(Debug, Clone, Serialize)]
pub enum HedgeboxCommand {
    /// Invitation to an existing account; accepted on the next session.
    JoinAccount { account: AccountId },
    ReceiveSharedFile { account: AccountId, file: Uuid },
    /// Monthly charge; reschedules itself while the plan is paid.
    PayBill { account: AccountId },
    /// Word of mouth.
    RaiseNeed { delta: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HedgeboxCondition {
    NotSignedUp,
    Invitable,
    NotViewingSharedFile,
}

/// A user of Hedgebox, a file-hosting SaaS. They find it through the marketing
/// site, sign up, share files, form teams and move between plans.
#[derive(Debug)]
pub struct HedgeboxPerson {
    pub account: Option<AccountId>,
    pub pending_invite: Option<AccountId>,
    pub file_to_view: Option<(AccountId, Uuid)>,
    pub is_invitable: bool,
    pub watches_marketing: bool,
    pub logged_in: bool,
    pub signup_variant: SignupVariant,
    /// Set when a teammate removed this person; handled at the next session.
    lost_access: bool,
    previews_bucket: f64,
    flags: FlagSchedule,
}

fn unavailable(intent: HedgeboxIntent, requirement: &'static str) -> InvariantViolation {
    InvariantViolation::IntentUnavailable { intent: format!("{intent:?}"), requirement }
}

fn file_properties(metadata: &FileMetadata) -> Properties {
    let mut props = Properties::new();
    props.insert("file_type".into(), json!(metadata.mime_type));
    props.insert("file_size_b".into(), json!(metadata.size_b));
    props
}

impl PersonBehavior for HedgeboxPerson {
    type Intent = HedgeboxIntent;
    type Command = HedgeboxCommand;
    type Condition = HedgeboxCondition;
    type Shared = HedgeboxShared;

    const NAME: &'static str = "hedgebox";

    fn cluster_radius(random: &mut RandomStream, max_radius: Option<usize>) -> usize {
        let radius = random.int_inclusive(0, MAX_RADIUS) as usize;
        max_radius.map_or(radius, |cap| radius.min(cap))
    }

    fn initiation_fraction(random: &mut RandomStream) -> f64 {
        random.beta(1.5, 6.0)
    }

    fn new_shared(_info: &ClusterInfo, random: &mut RandomStream) -> HedgeboxShared {
        let company = random.chance(COMPANY_CLUSTER_CHANCE).then(|| random.company());
        HedgeboxShared { company, accounts: Vec::new() }
    }

    fn spawn(person: &mut PersonState, ctx: &mut SpawnContext<'_, HedgeboxShared>) -> Self {
        if let Some(company) = &ctx.shared.company {
            person.email = ctx.random.email(&person.name, Some(&company.domain));
        }
        if ctx.kernel {
            person.adjust_need(0.4);
        }
        let is_invitable = ctx.random.chance(0.8);
        let watches_marketing = ctx.random.chance(0.2 + 0.4 * person.affinity);
        let signup_variant =
            if ctx.random.chance(0.5) { SignupVariant::Test } else { SignupVariant::Control };
        HedgeboxPerson {
            account: None,
            pending_invite: None,
            file_to_view: None,
            is_invitable,
            watches_marketing,
            logged_in: false,
            signup_variant,
            lost_access: false,
            previews_bucket: ctx.random.uniform(),
            flags: FlagSchedule::around(ctx.info.now),
        }
    }

    fn is_engaged(&self, _person: &PersonState) -> bool {
        self.account.is_some()
    }

    fn determine_session_intent(
        &mut self,
        person: &PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<Option<HedgeboxIntent>, InvariantViolation> {
        if let Some(id) = self.account
            && !ctx.shared.is_member(id, person.pos)
        {
            self.account = None;
            self.lost_access = true;
        }

        let Some(id) = self.account else {
            if self.file_to_view.is_some() {
                return Ok(Some(HedgeboxIntent::ViewSharedFile));
            }
            if self.pending_invite.is_some() {
                return Ok(Some(HedgeboxIntent::ConsiderProduct));
            }
            if person.need() < DISINTEREST_NEED && !self.watches_marketing {
                return Ok(None);
            }
            let intents = [HedgeboxIntent::ConsiderProduct, HedgeboxIntent::CheckMarketingUpdates];
            let weights = [person.need(), if self.watches_marketing { 0.3 } else { 0.0 }];
            return Ok(Some(*ctx.random.weighted_choice(&intents, &weights)?));
        };

        if person.satisfaction() < CHURN_SATISFACTION {
            return Ok(None);
        }
        let account = ctx
            .shared
            .account(id)
            .ok_or_else(|| unavailable(HedgeboxIntent::UploadFiles, "an open account"))?;
        let used = account.allocation_used_fraction();
        let has_files = !account.files.is_empty();
        let company_cluster = ctx.shared.company.is_some();

        let mut intents = Vec::with_capacity(11);
        let mut weights = Vec::with_capacity(11);
        let mut offer = |intent, weight: f64| {
            if weight > 0.0 {
                intents.push(intent);
                weights.push(weight);
            }
        };
        offer(HedgeboxIntent::UploadFiles, 0.1 + person.need() * (1.0 - used).max(0.0));
        if has_files {
            offer(HedgeboxIntent::DownloadOwnFile, 0.5);
            offer(HedgeboxIntent::DeleteFiles, 0.05 + used);
            offer(HedgeboxIntent::ShareFile, 0.3 * person.affinity);
        }
        if self.file_to_view.is_some() {
            offer(HedgeboxIntent::ViewSharedFile, 2.0);
        }
        if account.plan.is_business() {
            offer(HedgeboxIntent::InviteTeamMember, 0.2);
        }
        if account.seats() > 1 {
            offer(HedgeboxIntent::RemoveTeamMember, 0.03);
        }
        if account.plan.successor().is_ok() {
            let pressure = if company_cluster && !account.plan.is_business() { 0.4 } else { 0.0 };
            offer(HedgeboxIntent::UpgradePlan, (used - 0.5).max(0.0) + pressure);
        }
        if account.plan.predecessor().is_ok() && person.satisfaction() < 0.0 {
            offer(HedgeboxIntent::DowngradePlan, -0.3 * person.satisfaction());
        }
        if self.watches_marketing {
            offer(HedgeboxIntent::CheckMarketingUpdates, 0.1);
        }
        Ok(Some(*ctx.random.weighted_choice(&intents, &weights)?))
    }

    fn simulate_session(
        &mut self,
        intent: HedgeboxIntent,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        if self.lost_access {
            self.lost_access = false;
            self.logged_in = false;
            let mut client = ctx.client(person);
            client.unregister(PLAN_SUPER_PROPERTY);
            client.ungroup(GROUP_TYPE_ACCOUNT);
            client.ungroup(GROUP_TYPE_COMPANY);
            person.adjust_satisfaction(-0.2);
        }

        match intent {
            HedgeboxIntent::ConsiderProduct => self.consider_product(person, ctx)?,
            HedgeboxIntent::CheckMarketingUpdates => self.check_marketing_updates(person, ctx),
            HedgeboxIntent::UploadFiles => self.upload_files(intent, person, ctx)?,
            HedgeboxIntent::DownloadOwnFile => self.download_own_file(intent, person, ctx)?,
            HedgeboxIntent::DeleteFiles => self.delete_files(intent, person, ctx)?,
            HedgeboxIntent::ShareFile => self.share_file(intent, person, ctx)?,
            HedgeboxIntent::ViewSharedFile => self.view_shared_file(person, ctx)?,
            HedgeboxIntent::InviteTeamMember => self.invite_team_member(intent, person, ctx)?,
            HedgeboxIntent::RemoveTeamMember => self.remove_team_member(intent, person, ctx)?,
            HedgeboxIntent::UpgradePlan => self.change_plan(intent, true, person, ctx)?,
            HedgeboxIntent::DowngradePlan => self.change_plan(intent, false, person, ctx)?,
        }

        self.wrap_up(person, ctx);
        Ok(())
    }

    fn decide_feature_flags(&self, _person: &PersonState, at: DateTime<Utc>) -> Properties {
        let mut flags = Properties::new();
        if self.flags.experiment_start <= at && at < self.flags.experiment_end {
            flags.insert(SIGNUP_PAGE_FLAG_KEY.into(), json!(self.signup_variant.as_str()));
        }
        if at >= self.flags.previews_launch {
            flags.insert(FILE_PREVIEWS_FLAG_KEY.into(), json!(self.previews_bucket < PREVIEWS_ROLLOUT));
        }
        flags
    }

    fn satisfies(&self, condition: &HedgeboxCondition, _person: &PersonState, _shared: &HedgeboxShared) -> bool {
        match condition {
            HedgeboxCondition::NotSignedUp => self.account.is_none(),
            HedgeboxCondition::Invitable => {
                self.account.is_none() && self.is_invitable && self.pending_invite.is_none()
            }
            HedgeboxCondition::NotViewingSharedFile => self.file_to_view.is_none(),
        }
    }

    fn apply_command(
        &mut self,
        command: &HedgeboxCommand,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        match *command {
            HedgeboxCommand::JoinAccount { account } => {
                if self.account.is_none() && self.pending_invite.is_none() {
                    self.pending_invite = Some(account);
                    let delay = ctx.random.uniform_range(600.0, 86_400.0);
                    person.wake_no_later_than(ctx.clock + seconds(delay));
                }
            }
            HedgeboxCommand::ReceiveSharedFile { account, file } => {
                if self.file_to_view.is_none() {
                    self.file_to_view = Some((account, file));
                    let delay = ctx.random.uniform_range(60.0, 6.0 * 3_600.0);
                    person.wake_no_later_than(ctx.clock + seconds(delay));
                }
            }
            HedgeboxCommand::PayBill { account } => {
                let Some(acc) = ctx.shared.account_mut(account) else { return Ok(()) };
                let amount = acc.bill_usd();
                if amount <= 0.0 {
                    acc.was_billing_scheduled = false;
                    return Ok(());
                }
                let mut props = Properties::new();
                props.insert("plan".into(), json!(acc.plan.name()));
                props.insert("seats".into(), json!(acc.seats()));
                props.insert("amount_usd".into(), json!(amount));
                ctx.server.capture(EVENT_PAID_BILL, Some(props), person.distinct_id(), ctx.clock);
                ctx.schedule(
                    ctx.clock + Duration::days(BILLING_PERIOD_DAYS),
                    Target::SelfTarget,
                    None,
                    HedgeboxCommand::PayBill { account },
                );
            }
            HedgeboxCommand::RaiseNeed { delta } => {
                person.adjust_need(delta);
                let delay = ctx.random.uniform_range(3_600.0, 48.0 * 3_600.0);
                person.wake_no_later_than(ctx.clock + seconds(delay));
            }
        }
        Ok(())
    }
}

impl HedgeboxPerson {
    fn account_id(&self, intent: HedgeboxIntent) -> Result<AccountId, InvariantViolation> {
        self.account.ok_or_else(|| unavailable(intent, "an account"))
    }

    fn account_mut<'s>(
        &self,
        intent: HedgeboxIntent,
        shared: &'s mut HedgeboxShared,
    ) -> Result<&'s mut Account, InvariantViolation> {
        let id = self.account_id(intent)?;
        shared.account_mut(id).ok_or_else(|| unavailable(intent, "an open account"))
    }

    fn sees_new_signup_page(person: &PersonState) -> bool {
        person.feature_flag(SIGNUP_PAGE_FLAG_KEY) == Some(&json!(SignupVariant::Test.as_str()))
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    fn consider_product(&mut self, person: &mut PersonState, ctx: &mut Ctx<'_>) -> Result<(), InvariantViolation> {
        if let Some(account) = self.pending_invite.take() {
            // Invitation links go straight to the signup page.
            ctx.client(person).capture_pageview(URL_SIGNUP, Some(&[("invite", "1")]));
            person.advance_timer(ctx.random.uniform_range(20.0, 120.0));
            return self.sign_up(Some(account), person, ctx);
        }

        ctx.client(person).capture_pageview(URL_HOME, None);
        person.advance_timer(ctx.random.uniform_range(10.0, 60.0));
        if ctx.random.chance(0.2) {
            ctx.client(person).capture_snapshot(json!({ "type": 2, "data": { "href": URL_HOME } }));
        }
        if ctx.random.chance(0.5 + 0.3 * person.affinity) {
            ctx.client(person).capture_pageview(URL_PRICING, None);
            person.advance_timer(ctx.random.uniform_range(20.0, 120.0));
        }

        let mut conversion = 0.15 + 0.35 * person.affinity + 0.2 * person.need();
        if Self::sees_new_signup_page(person) {
            conversion *= 1.3;
        }
        if !ctx.random.chance(conversion) {
            person.adjust_need(-0.05);
            person.adjust_satisfaction(-0.02);
            return Ok(());
        }
        ctx.client(person).capture_pageview(URL_SIGNUP, None);
        person.advance_timer(ctx.random.uniform_range(30.0, 180.0));
        self.sign_up(None, person, ctx)
    }

    /// Create an account (or join `invited_to`) and identify the person.
    fn sign_up(
        &mut self,
        invited_to: Option<AccountId>,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        let now = person.simulation_time();
        let account_id = match invited_to {
            Some(id) => {
                let account = ctx
                    .shared
                    .account_mut(id)
                    .ok_or_else(|| unavailable(HedgeboxIntent::ConsiderProduct, "an account to join"))?;
                account.team_members.insert(person.pos);
                id
            }
            None => {
                let plan = if ctx.shared.company.is_some() && person.kernel {
                    Plan::BusinessStandard
                } else {
                    Plan::PersonalFree
                };
                let uuid = ctx.random.roll_uuidt(now);
                ctx.shared.open_account(Account::new(uuid, now, plan, person.pos))
            }
        };
        self.account = Some(account_id);
        self.logged_in = true;

        let mut set = Properties::new();
        set.insert("email".into(), json!(person.email));
        set.insert("name".into(), json!(person.name));
        let in_product_id = person.id.to_string();
        ctx.client(person).identify(&in_product_id, Some(set));
        let mut props = Properties::new();
        props.insert("from_invite".into(), json!(invited_to.is_some()));
        ctx.client(person).capture(EVENT_SIGNED_UP, Some(props));
        self.sync_account(account_id, person, ctx)?;
        person.adjust_satisfaction(0.1);

        if invited_to.is_none() {
            self.schedule_billing(account_id, person, ctx);
            if person.kernel && ctx.shared.company.is_some() {
                let delay = ctx.random.uniform_range(3_600.0, 3.0 * 86_400.0);
                ctx.schedule(
                    now + seconds(delay),
                    Target::AllNeighbors,
                    Some(HedgeboxCondition::NotSignedUp),
                    HedgeboxCommand::JoinAccount { account: account_id },
                );
            }
        }
        Ok(())
    }

    fn log_in(&mut self, person: &mut PersonState, ctx: &mut Ctx<'_>) {
        if self.logged_in {
            return;
        }
        ctx.client(person).capture_pageview(URL_LOGIN, None);
        person.advance_timer(ctx.random.uniform_range(5.0, 25.0));
        let in_product_id = person.id.to_string();
        let mut client = ctx.client(person);
        client.identify(&in_product_id, None);
        client.capture(EVENT_LOGGED_IN, None);
        self.logged_in = true;
    }

    fn check_marketing_updates(&mut self, person: &mut PersonState, ctx: &mut Ctx<'_>) {
        ctx.client(person).capture_pageview(URL_MARIUS_TECH_TIPS, Some(&[("utm_source", "newsletter")]));
        person.advance_timer(ctx.random.uniform_range(60.0, 400.0));
        let interest = ctx.random.uniform_range(0.0, 0.1);
        person.adjust_need(interest);
    }

    fn upload_files(
        &mut self,
        intent: HedgeboxIntent,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        let id = self.account_id(intent)?;
        self.log_in(person, ctx);
        ctx.client(person).capture_pageview(URL_FILES, None);
        person.advance_timer(ctx.random.uniform_range(5.0, 30.0));

        let count = ctx.random.int_inclusive(1, 5);
        let mut uploaded = 0;
        for _ in 0..count {
            let metadata = ctx.random.file();
            let at = person.simulation_time();
            let file_id = ctx.random.roll_uuidt(at);
            let account = self.account_mut(intent, ctx.shared)?;
            if account.used_bytes() + metadata.size_b > account.plan.allocation_bytes() {
                // Out of space: annoying, and a reason to upgrade.
                person.adjust_satisfaction(-0.15);
                person.adjust_need(0.1);
                break;
            }
            let props = file_properties(&metadata);
            account.files.push(HedgeboxFile { id: file_id, metadata, uploaded_at: at, uploaded_by: person.pos });
            ctx.client(person).capture(EVENT_UPLOADED_FILE, Some(props));
            person.advance_timer(ctx.random.uniform_range(3.0, 40.0));
            uploaded += 1;
        }
        person.adjust_need(-0.05 * uploaded as f64);
        person.adjust_satisfaction(0.03);
        self.sync_account(id, person, ctx)
    }

    fn download_own_file(
        &mut self,
        intent: HedgeboxIntent,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        self.log_in(person, ctx);
        let account = self.account_mut(intent, ctx.shared)?;
        let Some(file) = ctx.random.choose(&account.files).cloned() else {
            return Err(unavailable(intent, "at least one file"));
        };
        ctx.client(person).capture_pageview(&url_file(file.id), None);
        person.advance_timer(ctx.random.uniform_range(5.0, 45.0));
        let mut props = file_properties(&file.metadata);
        let previewed = person.feature_flag(FILE_PREVIEWS_FLAG_KEY) == Some(&json!(true));
        props.insert("previewed".into(), json!(previewed));
        ctx.client(person).capture(EVENT_DOWNLOADED_FILE, Some(props));
        person.adjust_satisfaction(if previewed { 0.05 } else { 0.03 });
        Ok(())
    }

    fn delete_files(
        &mut self,
        intent: HedgeboxIntent,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        let id = self.account_id(intent)?;
        self.log_in(person, ctx);
        ctx.client(person).capture_pageview(URL_FILES, None);
        person.advance_timer(ctx.random.uniform_range(5.0, 20.0));

        let count = ctx.random.int_inclusive(1, 3);
        for _ in 0..count {
            let account = self.account_mut(intent, ctx.shared)?;
            if account.files.is_empty() {
                break;
            }
            let index = ctx.random.int_inclusive(0, account.files.len() as u64 - 1) as usize;
            let file = account.files.remove(index);
            ctx.client(person).capture(EVENT_DELETED_FILE, Some(file_properties(&file.metadata)));
            person.advance_timer(ctx.random.uniform_range(2.0, 15.0));
        }
        self.sync_account(id, person, ctx)
    }

    fn share_file(
        &mut self,
        intent: HedgeboxIntent,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        let id = self.account_id(intent)?;
        self.log_in(person, ctx);
        let account = self.account_mut(intent, ctx.shared)?;
        let Some(file) = ctx.random.choose(&account.files).cloned() else {
            return Err(unavailable(intent, "at least one file"));
        };
        ctx.client(person).capture_pageview(&url_file(file.id), None);
        person.advance_timer(ctx.random.uniform_range(5.0, 30.0));
        ctx.client(person).capture(EVENT_SHARED_FILE_LINK, Some(file_properties(&file.metadata)));

        let delay = ctx.random.uniform_range(60.0, 2.0 * 86_400.0);
        ctx.schedule(
            person.simulation_time() + seconds(delay),
            Target::RandomNeighbor,
            Some(HedgeboxCondition::NotViewingSharedFile),
            HedgeboxCommand::ReceiveSharedFile { account: id, file: file.id },
        );
        Ok(())
    }

    fn view_shared_file(&mut self, person: &mut PersonState, ctx: &mut Ctx<'_>) -> Result<(), InvariantViolation> {
        let Some((account, file_id)) = self.file_to_view.take() else {
            return Err(unavailable(HedgeboxIntent::ViewSharedFile, "a shared file"));
        };
        ctx.client(person).capture_pageview(&url_file(file_id), None);
        person.advance_timer(ctx.random.uniform_range(10.0, 90.0));

        let file = ctx.shared.account(account).and_then(|a| a.file(file_id)).cloned();
        match file {
            Some(file) => {
                let mut props = file_properties(&file.metadata);
                props.insert("shared".into(), json!(true));
                ctx.client(person).capture(EVENT_DOWNLOADED_FILE, Some(props));
                if self.account.is_none() {
                    person.adjust_need(0.1);
                }
            }
            // Deleted before it was opened.
            None => person.adjust_satisfaction(-0.05),
        }

        if self.account.is_none() && ctx.random.chance(0.3) {
            self.consider_product(person, ctx)?;
        }
        Ok(())
    }

    fn invite_team_member(
        &mut self,
        intent: HedgeboxIntent,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        let id = self.account_id(intent)?;
        self.log_in(person, ctx);
        ctx.client(person).capture_pageview(URL_ACCOUNT_TEAM, None);
        person.advance_timer(ctx.random.uniform_range(10.0, 60.0));
        ctx.client(person).capture(EVENT_INVITED_TEAM_MEMBER, None);

        let delay = ctx.random.uniform_range(3_600.0, 2.0 * 86_400.0);
        ctx.schedule(
            person.simulation_time() + seconds(delay),
            Target::RandomNeighbor,
            Some(HedgeboxCondition::Invitable),
            HedgeboxCommand::JoinAccount { account: id },
        );
        Ok(())
    }

    fn remove_team_member(
        &mut self,
        intent: HedgeboxIntent,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        let id = self.account_id(intent)?;
        self.log_in(person, ctx);
        ctx.client(person).capture_pageview(URL_ACCOUNT_TEAM, None);
        person.advance_timer(ctx.random.uniform_range(10.0, 60.0));

        let account = self.account_mut(intent, ctx.shared)?;
        let others: Vec<_> = account.team_members.iter().copied().filter(|p| *p != person.pos).collect();
        let Some(&removed) = ctx.random.choose(&others) else {
            return Err(unavailable(intent, "another team member"));
        };
        account.team_members.remove(&removed);
        ctx.client(person).capture(EVENT_REMOVED_TEAM_MEMBER, None);
        self.sync_account(id, person, ctx)
    }

    fn change_plan(
        &mut self,
        intent: HedgeboxIntent,
        upgrade: bool,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        let id = self.account_id(intent)?;
        self.log_in(person, ctx);
        ctx.client(person).capture_pageview(URL_ACCOUNT_SETTINGS, None);
        person.advance_timer(ctx.random.uniform_range(5.0, 20.0));
        ctx.client(person).capture_pageview(URL_ACCOUNT_BILLING, None);
        person.advance_timer(ctx.random.uniform_range(20.0, 120.0));

        let account = self.account_mut(intent, ctx.shared)?;
        let previous = account.plan;
        let next = if upgrade { previous.successor()? } else { previous.predecessor()? };
        account.plan = next;

        let mut props = Properties::new();
        props.insert("previous_plan".into(), json!(previous.name()));
        props.insert("new_plan".into(), json!(next.name()));
        let event = if upgrade { EVENT_UPGRADED_PLAN } else { EVENT_DOWNGRADED_PLAN };
        ctx.client(person).capture(event, Some(props));
        person.adjust_satisfaction(if upgrade { 0.05 } else { 0.1 });
        if upgrade {
            self.schedule_billing(id, person, ctx);
        }
        self.sync_account(id, person, ctx)
    }

    // ── Shared helpers ────────────────────────────────────────────────────────

    /// Mirror the account (and company) onto groups and the plan super property.
    fn sync_account(
        &self,
        id: AccountId,
        person: &mut PersonState,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), InvariantViolation> {
        let Some(account) = ctx.shared.account(id) else { return Ok(()) };
        let key = account.id.to_string();
        let props = account.group_properties();
        let mut plan = Properties::new();
        plan.insert(PLAN_SUPER_PROPERTY.into(), json!(account.plan.name()));
        let company = ctx.shared.company_group_properties();

        let mut client = ctx.client(person);
        client.group(GROUP_TYPE_ACCOUNT, &key, Some(props))?;
        if let Some((domain, company_props)) = company {
            client.group(GROUP_TYPE_COMPANY, &domain, Some(company_props))?;
        }
        client.register(plan);
        Ok(())
    }

    fn schedule_billing(&self, id: AccountId, person: &PersonState, ctx: &mut Ctx<'_>) {
        let Some(account) = ctx.shared.account_mut(id) else { return };
        if account.was_billing_scheduled || account.plan.price_per_seat_usd() <= 0.0 {
            return;
        }
        account.was_billing_scheduled = true;
        ctx.schedule(
            person.simulation_time() + Duration::days(BILLING_PERIOD_DAYS),
            Target::SelfTarget,
            None,
            HedgeboxCommand::PayBill { account: id },
        );
    }

    /// End-of-session: happy users talk, some log out.
    fn wrap_up(&mut self, person: &mut PersonState, ctx: &mut Ctx<'_>) {
        if self.account.is_none() {
            return;
        }
        if person.satisfaction() > 0.5 && ctx.random.chance(0.05) {
            let delay = ctx.random.uniform_range(3_600.0, 3.0 * 86_400.0);
            ctx.schedule(
                person.simulation_time() + seconds(delay),
                Target::AllNeighbors,
                Some(HedgeboxCondition::NotSignedUp),
                HedgeboxCommand::RaiseNeed { delta: 0.2 },
            );
        }
        if self.logged_in && ctx.random.chance(0.05) {
            ctx.client(person).reset();
            self.logged_in = false;
        }
    }
}
