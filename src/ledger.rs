//! Plan and credit bookkeeping on top of [`UserStore`].
//!
//! Every write is a merge. Double grants are prevented by two merge-written
//! guards: `freeBasicGranted` for the Basic pack and `processedTxns.<id>`
//! for paid packs.

use crate::plan::Plan;
use crate::store::{StoreError, UserPatch, UserRecord, UserStore};
use crate::{loge, logi, logok, logw};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};

/// Hours between depletion and the automatic refill.
pub const REFILL_COOLDOWN_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// Document reference. A missing document is created by the merge.
    ByUid(&'a str),
    ByEmail(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    FreeGranted,
    FreeAlreadyClaimed,
    PaidGranted,
    TxnAlreadyProcessed,
    /// Paid grant without a transaction id; nothing guards a repeat.
    PaidGrantedUnguarded,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("user store unavailable")]
    StoreUnavailable,
    #[error("no user with email {0:?}")]
    UserNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stages the merge for applying `plan`. `credits` of `None` means the
/// plan's default pack; the Basic pack is always the fixed free amount.
pub fn plan_patch(
    record: &UserRecord,
    plan: Plan,
    credits: Option<i64>,
    txn: Option<&str>,
) -> (UserPatch, Applied) {
    let mut patch = UserPatch {
        subscription_selected: Some(true),
        subscription_plan: Some(plan),
        credit_depleted_at: Some(None),
        ..UserPatch::default()
    };

    if !plan.is_paid() {
        if record.free_basic_granted {
            return (patch, Applied::FreeAlreadyClaimed);
        }
        patch.credits = Some(Plan::Basic.credit_pack());
        patch.free_basic_granted = Some(true);
        return (patch, Applied::FreeGranted);
    }

    let amount = credits.unwrap_or(plan.credit_pack());
    match txn.filter(|t| !t.is_empty()) {
        Some(txn) if record.has_processed(txn) => (patch, Applied::TxnAlreadyProcessed),
        Some(txn) => {
            patch.credits = Some(amount);
            patch.processed_txn = Some(txn.to_string());
            patch.last_paid_txn = Some(txn.to_string());
            (patch, Applied::PaidGranted)
        }
        None => {
            patch.credits = Some(amount);
            (patch, Applied::PaidGrantedUnguarded)
        }
    }
}

async fn resolve(store: &dyn UserStore, target: Target<'_>) -> Result<(String, UserRecord), LedgerError> {
    match target {
        Target::ByUid(uid) => {
            let record = store.find_by_id(uid).await?.unwrap_or_default();
            Ok((uid.to_string(), record))
        }
        Target::ByEmail(email) => store
            .find_by_email(email)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(email.to_string())),
    }
}

pub async fn try_apply_plan(
    store: Option<&dyn UserStore>,
    target: Target<'_>,
    plan: Plan,
    credits: Option<i64>,
    txn: Option<&str>,
) -> Result<Applied, LedgerError> {
    let store = store.ok_or(LedgerError::StoreUnavailable)?;
    let (uid, record) = resolve(store, target).await?;
    let (patch, applied) = plan_patch(&record, plan, credits, txn);
    store.merge(&uid, &patch).await?;

    match applied {
        Applied::FreeGranted => logok(format!("Granted Basic free pack to {uid}")),
        Applied::FreeAlreadyClaimed => logi(format!("User {uid} already claimed Basic free pack, no regrant")),
        Applied::PaidGranted => logok(format!("Granted {plan} plan to {uid} (txn={})", txn.unwrap_or_default())),
        Applied::TxnAlreadyProcessed => logi(format!("Txn {} already processed, skipping", txn.unwrap_or_default())),
        Applied::PaidGrantedUnguarded => logok(format!("Granted {plan} plan to {uid} without transaction id")),
    }
    Ok(applied)
}

/// Applies a plan and reports only whether the merge was written.
pub async fn apply_plan(
    store: Option<&dyn UserStore>,
    target: Target<'_>,
    plan: Plan,
    credits: Option<i64>,
    txn: Option<&str>,
) -> bool {
    match try_apply_plan(store, target, plan, credits, txn).await {
        Ok(_) => true,
        Err(LedgerError::Store(e)) => {
            loge(format!("Plan update for {target:?} failed: {e}"));
            false
        }
        Err(e) => {
            logw(format!("Plan update for {target:?} skipped: {e}"));
            false
        }
    }
}

/// Tries the uid first, then the email when the uid update did not happen.
pub async fn apply_plan_to_user(
    store: Option<&dyn UserStore>,
    uid: Option<&str>,
    email: Option<&str>,
    plan: Plan,
    credits: Option<i64>,
    txn: Option<&str>,
) -> bool {
    if let Some(uid) = uid.filter(|u| !u.is_empty()) {
        if apply_plan(store, Target::ByUid(uid), plan, credits, txn).await {
            return true;
        }
    }
    if let Some(email) = email.filter(|e| !e.is_empty()) {
        return apply_plan(store, Target::ByEmail(email), plan, credits, txn).await;
    }
    false
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses RFC 3339, or naive ISO-8601 read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|at| at.and_utc())
}

/// Decides the refresh merge for a stored record at `now`.
///
/// Paid plans self-heal `subscriptionSelected`. An empty paid balance first
/// gets a depletion stamp; once the stamp is at least a day old (or
/// unreadable) the plan pack is restored and the stamp cleared.
pub fn refresh_patch(record: &UserRecord, now: DateTime<Utc>) -> UserPatch {
    let mut patch = UserPatch::default();
    let Some(plan) = record.plan().filter(|p| p.is_paid()) else {
        return patch;
    };

    if !record.subscription_selected {
        patch.subscription_selected = Some(true);
    }
    if record.credits > 0 {
        return patch;
    }

    match record.credit_depleted_at.as_deref().filter(|s| !s.is_empty()) {
        None => patch.credit_depleted_at = Some(Some(format_timestamp(now))),
        Some(raw) => {
            let due = match parse_timestamp(raw) {
                Some(depleted) => now - depleted >= TimeDelta::hours(REFILL_COOLDOWN_HOURS),
                None => true,
            };
            if due {
                patch.credits = Some(plan.credit_pack());
                patch.credit_depleted_at = Some(None);
            }
        }
    }
    patch
}

/// Runs the auto top-up. Returns whether anything was written.
pub async fn refresh_credits(
    store: &dyn UserStore,
    target: Target<'_>,
    now: DateTime<Utc>,
) -> Result<bool, LedgerError> {
    let (uid, record) = resolve(store, target).await?;
    let patch = refresh_patch(&record, now);
    if patch.is_empty() {
        return Ok(false);
    }
    store.merge(&uid, &patch).await?;
    if patch.credits.is_some() {
        logok(format!("Refilled credits for {uid} after cooldown"));
    } else if patch.credit_depleted_at.is_some() {
        logi(format!("Stamped credit depletion for {uid}"));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn paid(plan: &str, credits: i64, depleted_at: Option<&str>) -> UserRecord {
        UserRecord {
            subscription_plan: Some(plan.to_string()),
            subscription_selected: true,
            credits,
            credit_depleted_at: depleted_at.map(str::to_string),
            ..UserRecord::default()
        }
    }

    #[test]
    fn basic_pack_is_granted_once() {
        let (patch, applied) = plan_patch(&UserRecord::default(), Plan::Basic, Some(999), None);
        assert_eq!(applied, Applied::FreeGranted);
        assert_eq!(patch.credits, Some(50));
        assert_eq!(patch.free_basic_granted, Some(true));
        assert_eq!(patch.subscription_selected, Some(true));
        assert_eq!(patch.credit_depleted_at, Some(None));

        let claimed = UserRecord { free_basic_granted: true, ..UserRecord::default() };
        let (patch, applied) = plan_patch(&claimed, Plan::Basic, None, Some("txn_1"));
        assert_eq!(applied, Applied::FreeAlreadyClaimed);
        assert_eq!(patch.credits, None);
        assert_eq!(patch.subscription_plan, Some(Plan::Basic));
    }

    #[test]
    fn paid_grants_are_guarded_by_transaction() {
        let (patch, applied) = plan_patch(&UserRecord::default(), Plan::Pro, None, Some("txn_1"));
        assert_eq!(applied, Applied::PaidGranted);
        assert_eq!(patch.credits, Some(200));
        assert_eq!(patch.processed_txn.as_deref(), Some("txn_1"));
        assert_eq!(patch.last_paid_txn.as_deref(), Some("txn_1"));

        let mut record = UserRecord::default();
        patch.apply_to(&mut record);
        let (patch, applied) = plan_patch(&record, Plan::Pro, None, Some("txn_1"));
        assert_eq!(applied, Applied::TxnAlreadyProcessed);
        assert_eq!(patch.credits, None);
        assert_eq!(patch.processed_txn, None);

        let (patch, applied) = plan_patch(&record, Plan::Premium, Some(1234), None);
        assert_eq!(applied, Applied::PaidGrantedUnguarded);
        assert_eq!(patch.credits, Some(1234));
    }

    #[tokio::test]
    async fn repeated_transaction_grants_once() {
        let store = MemoryStore::new();
        let first = try_apply_plan(Some(&store), Target::ByUid("u1"), Plan::Premium, None, Some("txn_7"))
            .await
            .unwrap();
        assert_eq!(first, Applied::PaidGranted);
        assert_eq!(store.get("u1").unwrap().credits, 1000);

        let mut spent = store.get("u1").unwrap();
        spent.credits = 3;
        store.insert("u1", spent);

        let second = try_apply_plan(Some(&store), Target::ByUid("u1"), Plan::Premium, None, Some("txn_7"))
            .await
            .unwrap();
        assert_eq!(second, Applied::TxnAlreadyProcessed);
        let record = store.get("u1").unwrap();
        assert_eq!(record.credits, 3);
        assert_eq!(record.processed_txns.len(), 1);
    }

    #[tokio::test]
    async fn email_targets_must_exist() {
        let store = MemoryStore::new();
        let err = try_apply_plan(Some(&store), Target::ByEmail("x@y.z"), Plan::Pro, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UserNotFound(_)));
        assert!(matches!(
            try_apply_plan(None, Target::ByUid("u1"), Plan::Pro, None, None).await,
            Err(LedgerError::StoreUnavailable)
        ));

        store.insert("u9", UserRecord { email: "x@y.z".into(), ..UserRecord::default() });
        assert!(apply_plan_to_user(Some(&store), Some(""), Some("x@y.z"), Plan::Pro, None, None).await);
        assert_eq!(store.get("u9").unwrap().credits, 200);
        assert!(!apply_plan_to_user(Some(&store), None, None, Plan::Pro, None, None).await);
    }

    #[test]
    fn refresh_stamps_then_refills_after_cooldown() {
        let now = Utc::now();

        let patch = refresh_patch(&paid("Pro", 0, None), now);
        assert_eq!(patch.credit_depleted_at, Some(Some(format_timestamp(now))));
        assert_eq!(patch.credits, None);

        let recent = format_timestamp(now - TimeDelta::hours(3));
        assert!(refresh_patch(&paid("Pro", 0, Some(&recent)), now).is_empty());

        let old = format_timestamp(now - TimeDelta::hours(25));
        let patch = refresh_patch(&paid("Premium", 0, Some(&old)), now);
        assert_eq!(patch.credits, Some(1000));
        assert_eq!(patch.credit_depleted_at, Some(None));

        let patch = refresh_patch(&paid("Pro", -2, Some("not a date")), now);
        assert_eq!(patch.credits, Some(200));
    }

    #[test]
    fn refresh_ignores_funded_and_free_accounts() {
        let now = Utc::now();
        assert!(refresh_patch(&paid("Pro", 5, None), now).is_empty());
        assert!(refresh_patch(&paid("Basic", 0, None), now).is_empty());
        assert!(refresh_patch(&UserRecord::default(), now).is_empty());

        let mut unselected = paid("Premium", 5, None);
        unselected.subscription_selected = false;
        let patch = refresh_patch(&unselected, now);
        assert_eq!(patch.subscription_selected, Some(true));
        assert_eq!(patch.credits, None);
    }

    #[test]
    fn parses_naive_and_zoned_timestamps() {
        let expected = parse_timestamp("2025-08-23T07:47:00Z").unwrap();
        assert_eq!(parse_timestamp("2025-08-23T07:47:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-23T07:47:00.000000Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-23T09:47:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(format_timestamp(expected), "2025-08-23T07:47:00Z");
    }
}
