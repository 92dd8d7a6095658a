//! Object annotations the engine reads (action options) and writes (provenance).

use serde::{Deserialize, Serialize};

use crate::ManagedObject;

pub const LAST_ACTION: &str = "keel.sh/last-action";
pub const LAST_OUTCOME: &str = "keel.sh/last-outcome";
pub const VALUES_FINGERPRINT: &str = "keel.sh/values-fingerprint";
pub const CHART_VERSION: &str = "keel.sh/chart-version";
pub const RELEASE_REVISION: &str = "keel.sh/release-revision";
pub const LAST_ACTION_TIMESTAMP: &str = "keel.sh/last-action-timestamp";

/// Every provenance key, for tooling that wants to strip or display them.
pub const PROVENANCE_KEYS: [&str; 6] =
    [LAST_ACTION, LAST_OUTCOME, VALUES_FINGERPRINT, CHART_VERSION, RELEASE_REVISION, LAST_ACTION_TIMESTAMP];

pub const INSTALL_DISABLE_HOOKS: &str = "keel.sh/install-disable-hooks";
pub const UPGRADE_DISABLE_HOOKS: &str = "keel.sh/upgrade-disable-hooks";
pub const UPGRADE_FORCE: &str = "keel.sh/upgrade-force";
pub const UNINSTALL_DISABLE_HOOKS: &str = "keel.sh/uninstall-disable-hooks";

/// What a recognized annotation switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionEffect {
    DisableHooks,
    Force,
}

/// An annotation key that, when set to a true value on the object, toggles an action option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionAnnotation {
    pub key: String,
    pub effect: OptionEffect,
}

impl ActionAnnotation {
    pub fn new(key: &str, effect: OptionEffect) -> Self { Self { key: key.to_string(), effect } }
}

/// Options passed to install/upgrade/uninstall calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOptions {
    pub disable_hooks: bool,
    pub force: bool,
}

impl ActionOptions {
    /// Fold the recognized annotations present on `obj` into options.
    pub fn from_annotations(annotations: &[ActionAnnotation], obj: &ManagedObject) -> Self {
        let mut opts = Self::default();
        for a in annotations {
            let enabled = obj.annotation(&a.key).map(|v| v.trim().eq_ignore_ascii_case("true")).unwrap_or(false);
            if !enabled { continue; }
            match a.effect {
                OptionEffect::DisableHooks => opts.disable_hooks = true,
                OptionEffect::Force => opts.force = true,
            }
        }
        opts
    }
}

/// Annotation sets per action kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationSets {
    pub install: Vec<ActionAnnotation>,
    pub upgrade: Vec<ActionAnnotation>,
    pub uninstall: Vec<ActionAnnotation>,
}

impl AnnotationSets {
    pub fn defaults() -> Self {
        Self {
            install: vec![ActionAnnotation::new(INSTALL_DISABLE_HOOKS, OptionEffect::DisableHooks)],
            upgrade: vec![
                ActionAnnotation::new(UPGRADE_DISABLE_HOOKS, OptionEffect::DisableHooks),
                ActionAnnotation::new(UPGRADE_FORCE, OptionEffect::Force),
            ],
            uninstall: vec![ActionAnnotation::new(UNINSTALL_DISABLE_HOOKS, OptionEffect::DisableHooks)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Gvk, ObjectKey};

    fn obj_with(annos: &[(&str, &str)]) -> ManagedObject {
        let mut o = ManagedObject::new(ObjectKey::new(Gvk::new("g", "v1", "K"), Some("ns"), "a"), serde_json::json!({}));
        for (k, v) in annos { o.annotations.insert(k.to_string(), v.to_string()); }
        o
    }

    #[test]
    fn only_true_values_enable_options() {
        let sets = AnnotationSets::defaults();
        let o = obj_with(&[(UPGRADE_FORCE, "TRUE"), (UPGRADE_DISABLE_HOOKS, "yes")]);
        let opts = ActionOptions::from_annotations(&sets.upgrade, &o);
        assert!(opts.force);
        assert!(!opts.disable_hooks);
    }

    #[test]
    fn annotations_are_scoped_to_their_action() {
        let sets = AnnotationSets::defaults();
        let o = obj_with(&[(UPGRADE_FORCE, "true"), (INSTALL_DISABLE_HOOKS, "true")]);
        let install = ActionOptions::from_annotations(&sets.install, &o);
        assert_eq!(install, ActionOptions { disable_hooks: true, force: false });
        let uninstall = ActionOptions::from_annotations(&sets.uninstall, &o);
        assert_eq!(uninstall, ActionOptions::default());
    }
}
