//! Restore-data store consumed by the reconciler. Runners persist
//! pre-shutdown state into a per-plan ConfigMap and stamp per-target
//! "restored" annotations on the plan during wake-up; the engine only ever
//! talks to the five operations below.

use async_trait::async_trait;
use hibernator_common::{annotations, labels};
use hibernator_types::HibernatePlan;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client, ResourceExt, api::PostParams};

use crate::util::Error;
use crate::util::patch::patch_object;

#[async_trait]
pub trait RestoreStore: Send + Sync {
    /// Ensures the per-plan store exists. Existing entries are kept.
    async fn prepare_restore_point(
        &self,
        namespace: &str,
        plan: &HibernatePlan,
    ) -> Result<(), Error>;

    /// Whether any restore data has been captured for the plan. A wake-up
    /// must not start without it.
    async fn has_restore_data(&self, namespace: &str, plan: &str) -> Result<bool, Error>;

    /// Whether every given target has confirmed restoration. Idempotent.
    async fn mark_all_targets_restored(
        &self,
        namespace: &str,
        plan: &HibernatePlan,
        targets: &[String],
    ) -> Result<bool, Error>;

    /// Clears the per-target "restored" markers after a completed wake-up.
    async fn unlock_restore_data(&self, namespace: &str, plan: &HibernatePlan)
    -> Result<(), Error>;

    /// Deterministic name of the plan's restore ConfigMap.
    fn restore_config_map(&self, plan: &str) -> String;
}

#[derive(Clone)]
pub struct ConfigMapRestoreStore {
    client: Client,
}

impl ConfigMapRestoreStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RestoreStore for ConfigMapRestoreStore {
    async fn prepare_restore_point(
        &self,
        namespace: &str,
        plan: &HibernatePlan,
    ) -> Result<(), Error> {
        let name = self.restore_config_map(&plan.name_any());
        let api = self.api(namespace);
        let current_targets: Vec<String> =
            plan.spec.targets.iter().map(|t| t.name.clone()).collect();
        match api.get(&name).await {
            Ok(config_map) => {
                // Reset: drop entries for targets no longer in the plan,
                // keeping every active entry untouched.
                let Some(data) = config_map.data.as_ref() else {
                    return Ok(());
                };
                let pruned = prune_stale_entries(data, &current_targets);
                if pruned.len() == data.len() {
                    return Ok(());
                }
                let patch = serde_json::json!({ "data": pruned_as_patch(data, &pruned) });
                api.patch(
                    &name,
                    &kube::api::PatchParams::apply(crate::util::MANAGER_NAME),
                    &kube::api::Patch::Merge(&patch),
                )
                .await?;
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let config_map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name),
                        namespace: Some(namespace.to_string()),
                        labels: Some(
                            [(labels::PLAN.to_string(), plan.name_any())]
                                .into_iter()
                                .collect(),
                        ),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                api.create(&PostParams::default(), &config_map).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_restore_data(&self, namespace: &str, plan: &str) -> Result<bool, Error> {
        let name = self.restore_config_map(plan);
        match self.api(namespace).get(&name).await {
            Ok(config_map) => Ok(config_map.data.is_some_and(|d| !d.is_empty())),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_all_targets_restored(
        &self,
        _namespace: &str,
        plan: &HibernatePlan,
        targets: &[String],
    ) -> Result<bool, Error> {
        let plan_annotations = plan.annotations();
        Ok(targets.iter().all(|target| {
            plan_annotations
                .get(&format!("{}{}", annotations::RESTORED_PREFIX, target))
                .map(String::as_str)
                == Some("true")
        }))
    }

    async fn unlock_restore_data(
        &self,
        _namespace: &str,
        plan: &HibernatePlan,
    ) -> Result<(), Error> {
        let has_markers = plan
            .annotations()
            .keys()
            .any(|k| k.starts_with(annotations::RESTORED_PREFIX));
        if !has_markers {
            return Ok(());
        }
        patch_object(self.client.clone(), plan, |p| {
            if let Some(existing) = p.metadata.annotations.as_mut() {
                existing.retain(|k, _| !k.starts_with(annotations::RESTORED_PREFIX));
            }
        })
        .await?;
        Ok(())
    }

    fn restore_config_map(&self, plan: &str) -> String {
        format!("hibernate-restore-{}", plan)
    }
}

/// Store entries are keyed by target name. Keeps every entry that still
/// belongs to a declared target.
fn prune_stale_entries(
    data: &std::collections::BTreeMap<String, String>,
    targets: &[String],
) -> std::collections::BTreeMap<String, String> {
    data.iter()
        .filter(|(key, _)| targets.iter().any(|t| t == *key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Merge-patch body that deletes the pruned keys and leaves the rest alone.
fn pruned_as_patch(
    original: &std::collections::BTreeMap<String, String>,
    pruned: &std::collections::BTreeMap<String, String>,
) -> serde_json::Value {
    let mut patch = serde_json::Map::new();
    for key in original.keys() {
        if !pruned.contains_key(key) {
            patch.insert(key.clone(), serde_json::Value::Null);
        }
    }
    serde_json::Value::Object(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn data(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn active_entries_survive_a_reset() {
        let stored = data(&[("db", "{...}"), ("cache", "{...}"), ("retired", "{...}")]);
        let targets = vec!["db".to_string(), "cache".to_string()];
        let pruned = prune_stale_entries(&stored, &targets);
        assert_eq!(pruned.len(), 2);
        assert!(pruned.contains_key("db"));
        assert!(pruned.contains_key("cache"));
        assert!(!pruned.contains_key("retired"));
    }

    #[test]
    fn reset_patch_nulls_only_the_stale_keys() {
        let stored = data(&[("db", "{...}"), ("retired", "{...}")]);
        let pruned = prune_stale_entries(&stored, &["db".to_string()]);
        let patch = pruned_as_patch(&stored, &pruned);
        assert_eq!(patch, serde_json::json!({ "retired": null }));
    }
}
