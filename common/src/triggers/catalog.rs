// Built-in trigger set

use super::scheduled::{Audience, Body, ScheduleEntry, ScheduledTrigger};
use super::{EpochTrigger, OracleVotingPoller, StateChangeTrigger, TriggerContext};
use crate::schedule::FirePolicy;
use chrono::Duration;

fn offset(id: &str, before: Duration, audience: Audience, body: Body) -> ScheduleEntry {
    ScheduleEntry::new(id, FirePolicy::Offset(before), audience, body)
}

fn percent(id: &str, fraction: f64, audience: Audience, body: Body) -> ScheduleEntry {
    ScheduleEntry::new(id, FirePolicy::PercentOfEpoch { fraction }, audience, body)
}

/// Countdown reminders, split by flip readiness
pub fn validation_entries() -> Vec<ScheduleEntry> {
    use Audience::{NotReady, Ready};
    use Body::DaysLeft;

    vec![
        offset("validation.ready.1-day", Duration::hours(24), Ready, DaysLeft),
        offset("validation.ready.1-hour", Duration::hours(1), Ready, DaysLeft),
        offset("validation.ready.5-min", Duration::minutes(5), Ready, DaysLeft),
        offset("validation.ready.now", Duration::zero(), Ready, DaysLeft),
        offset("validation.not-ready.1-day", Duration::hours(24), NotReady, DaysLeft),
        offset("validation.not-ready.1-hour", Duration::hours(1), NotReady, DaysLeft),
        percent("validation.not-ready.left-50%-epoch", 0.5, NotReady, DaysLeft),
    ]
}

pub fn issue_invite_entries() -> Vec<ScheduleEntry> {
    vec![
        percent("issue-invite.left-50%-epoch", 0.5, Audience::IdentityHolders, Body::InvitesCount),
        percent("issue-invite.left-80%-epoch", 0.8, Audience::IdentityHolders, Body::InvitesCount),
    ]
}

pub fn extra_flip_entries() -> Vec<ScheduleEntry> {
    vec![offset("extra-flip", Duration::hours(20), Audience::IdentityHolders, Body::ExtraFlip)]
}

pub fn remind_invitee_entries() -> Vec<ScheduleEntry> {
    vec![offset(
        "remind-invitee",
        Duration::hours(48),
        Audience::IdentityHolders,
        Body::InviteeReminder,
    )]
}

/// Every trigger the notifier runs each epoch
pub fn builtin_triggers(ctx: &TriggerContext) -> Vec<EpochTrigger> {
    vec![
        EpochTrigger::Scheduled(ScheduledTrigger::new("validation", validation_entries(), ctx.clone())),
        EpochTrigger::Scheduled(ScheduledTrigger::new("issue-invite", issue_invite_entries(), ctx.clone())),
        EpochTrigger::Scheduled(ScheduledTrigger::new("extra-flip", extra_flip_entries(), ctx.clone())),
        EpochTrigger::Scheduled(ScheduledTrigger::new(
            "remind-invitee",
            remind_invitee_entries(),
            ctx.clone(),
        )),
        EpochTrigger::StateChange(StateChangeTrigger::new(ctx.clone())),
        EpochTrigger::OracleVoting(OracleVotingPoller::new(ctx.clone())),
    ]
}

/// Template ids the built-in triggers render; checked at startup
pub fn required_templates() -> Vec<String> {
    let mut ids: Vec<String> = validation_entries()
        .into_iter()
        .chain(issue_invite_entries())
        .chain(extra_flip_entries())
        .map(|e| e.id)
        .collect();

    for entry in remind_invitee_entries() {
        ids.push(format!("{}.invitee-ready", entry.id));
        ids.push(format!("{}.invitee-not-ready", entry.id));
    }

    ids.extend(
        [
            "accept-invite",
            "oracle-voting-new",
            "oracle-public-voting",
            "validation-result",
        ]
        .map(String::from),
    );
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::TemplateTable;
    use crate::triggers::testing::{ts, Harness};
    use crate::triggers::Trigger;
    use std::collections::HashSet;

    #[test]
    fn test_entry_ids_are_unique() {
        let ids: Vec<String> = validation_entries()
            .into_iter()
            .chain(issue_invite_entries())
            .chain(extra_flip_entries())
            .chain(remind_invitee_entries())
            .map(|e| e.id)
            .collect();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_required_templates_cover_segments() {
        let ids = required_templates();
        assert!(ids.contains(&"remind-invitee.invitee-ready".to_string()));
        assert!(ids.contains(&"remind-invitee.invitee-not-ready".to_string()));
        assert!(!ids.contains(&"remind-invitee".to_string()));
        assert!(ids.contains(&"validation.not-ready.left-50%-epoch".to_string()));
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn test_builtin_trigger_names() {
        let h = Harness::new(TemplateTable::new(), ts("2024-01-05T00:00:00Z"));
        let names: Vec<String> = builtin_triggers(&h.ctx)
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "validation",
                "issue-invite",
                "extra-flip",
                "remind-invitee",
                "accept-invite",
                "oracle-watcher"
            ]
        );
    }

    #[test]
    fn test_shipped_templates_are_complete() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/notifications.json");
        let table = TemplateTable::load(path).unwrap();
        table.validate(&required_templates()).unwrap();
    }
}
