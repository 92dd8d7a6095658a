//! Provenance recorder: action history on the object's annotations, plus
//! status conditions and the deployed release summary.

use chrono::{DateTime, SecondsFormat, Utc};
use keel_action::Operation;
use keel_core::annotations::{
    CHART_VERSION, LAST_ACTION, LAST_ACTION_TIMESTAMP, LAST_OUTCOME, RELEASE_REVISION, VALUES_FINGERPRINT,
};
use keel_core::{Condition, ConditionStatus, ConditionType, DeployedRelease, ManagedObject, ObjectStatus, Release};
use metrics::counter;

pub const OUTCOME_SUCCEEDED: &str = "succeeded";
pub const OUTCOME_FAILED: &str = "failed";

/// Stamp a successful action onto `obj`'s annotations.
pub fn record(obj: &mut ManagedObject, action: Operation, fingerprint: &str, release: &Release, now: DateTime<Utc>) {
    let a = &mut obj.annotations;
    a.insert(LAST_ACTION.into(), action.as_str().into());
    a.insert(LAST_OUTCOME.into(), OUTCOME_SUCCEEDED.into());
    a.insert(VALUES_FINGERPRINT.into(), fingerprint.into());
    a.insert(CHART_VERSION.into(), release.chart_version.clone());
    a.insert(RELEASE_REVISION.into(), release.revision.to_string());
    a.insert(LAST_ACTION_TIMESTAMP.into(), now.to_rfc3339_opts(SecondsFormat::Secs, true));
}

pub fn stored_fingerprint(obj: &ManagedObject) -> Option<&str> { obj.annotation(VALUES_FINGERPRINT) }

pub fn stored_chart_version(obj: &ManagedObject) -> Option<&str> { obj.annotation(CHART_VERSION) }

pub fn count_action(action: Operation, outcome: &'static str) {
    counter!("keel_reconcile_actions_total", 1u64, "action" => action.as_str(), "outcome" => outcome);
}

pub fn mark_initialized(status: &mut ObjectStatus) {
    status.set_condition(Condition::new(ConditionType::Initialized, ConditionStatus::True, "", ""));
}

fn success_reason(action: Operation) -> &'static str {
    match action {
        Operation::Install => "InstallSuccessful",
        Operation::Upgrade => "UpgradeSuccessful",
        Operation::Uninstall => "UninstallSuccessful",
        Operation::Reconcile | Operation::Get => "ReconcileSuccessful",
    }
}

fn error_reason(action: Operation) -> &'static str {
    match action {
        Operation::Install => "InstallError",
        Operation::Upgrade => "UpgradeError",
        Operation::Uninstall => "UninstallError",
        Operation::Reconcile | Operation::Get => "ReconcileError",
    }
}

/// Deployed, not failed, reconcilable, with the release summary in place.
pub fn mark_deployed(status: &mut ObjectStatus, action: Operation, release: &Release) {
    mark_initialized(status);
    let msg = format!("revision {}", release.revision);
    status.set_condition(Condition::new(ConditionType::Deployed, ConditionStatus::True, success_reason(action), msg));
    status.set_condition(Condition::new(ConditionType::ReleaseFailed, ConditionStatus::False, "", ""));
    status.remove_condition(ConditionType::Irreconcilable);
    status.deployed_release = Some(DeployedRelease { name: release.name.clone(), manifest: release.manifest.clone() });
}

pub fn mark_failed(status: &mut ObjectStatus, action: Operation, message: impl Into<String>) {
    mark_initialized(status);
    status.set_condition(Condition::new(ConditionType::ReleaseFailed, ConditionStatus::True, error_reason(action), message));
}

pub fn mark_irreconcilable(status: &mut ObjectStatus, message: impl Into<String>) {
    mark_initialized(status);
    status.set_condition(Condition::new(ConditionType::Irreconcilable, ConditionStatus::True, "ValuesError", message));
}

/// Status equality ignoring condition transition times.
pub fn same_status(a: &ObjectStatus, b: &ObjectStatus) -> bool {
    if a.deployed_release != b.deployed_release || a.conditions.len() != b.conditions.len() {
        return false;
    }
    a.conditions.iter().all(|ca| {
        b.condition(ca.type_)
            .map(|cb| cb.status == ca.status && cb.reason == ca.reason && cb.message == ca.message)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use keel_core::{Gvk, ObjectKey, ReleaseStatus};

    fn release(rev: i64) -> Release {
        Release {
            name: "web".into(),
            namespace: "prod".into(),
            chart_name: "nginx".into(),
            chart_version: "1.2.3".into(),
            values: Default::default(),
            manifest: "---\n".into(),
            revision: rev,
            status: ReleaseStatus::Deployed,
        }
    }

    #[test]
    fn record_writes_every_key() {
        let mut obj = ManagedObject::new(ObjectKey::new(Gvk::new("x.io", "v1", "App"), Some("prod"), "web"), serde_json::json!({}));
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        record(&mut obj, Operation::Upgrade, "sha256:ab", &release(4), now);
        assert_eq!(obj.annotation(LAST_ACTION), Some("upgrade"));
        assert_eq!(obj.annotation(LAST_OUTCOME), Some("succeeded"));
        assert_eq!(stored_fingerprint(&obj), Some("sha256:ab"));
        assert_eq!(stored_chart_version(&obj), Some("1.2.3"));
        assert_eq!(obj.annotation(RELEASE_REVISION), Some("4"));
        assert_eq!(obj.annotation(LAST_ACTION_TIMESTAMP), Some("2024-05-01T12:00:00Z"));
    }

    #[test]
    fn deployed_clears_failure_state() {
        let mut st = ObjectStatus::default();
        mark_irreconcilable(&mut st, "bad values");
        mark_failed(&mut st, Operation::Install, "boom");
        mark_deployed(&mut st, Operation::Install, &release(1));
        assert!(st.condition(ConditionType::Irreconcilable).is_none());
        assert_eq!(st.condition(ConditionType::ReleaseFailed).unwrap().status, ConditionStatus::False);
        assert_eq!(st.condition(ConditionType::Deployed).unwrap().reason.as_deref(), Some("InstallSuccessful"));
        assert_eq!(st.deployed_release.as_ref().unwrap().name, "web");
    }

    #[test]
    fn same_status_ignores_transition_time() {
        let mut a = ObjectStatus::default();
        mark_deployed(&mut a, Operation::Reconcile, &release(1));
        let mut b = a.clone();
        for c in b.conditions.iter_mut() { c.last_transition_time = None; }
        assert!(same_status(&a, &b));
        mark_failed(&mut b, Operation::Reconcile, "drift");
        assert!(!same_status(&a, &b));
    }
}
