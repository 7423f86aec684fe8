//! Runner job construction and inspection. One short-lived job per
//! (target, operation); all coordination state rides on labels so crashed
//! controllers can reassemble it from a list call.

use hibernator_common::{annotations, labels};
use hibernator_types::{HibernatePlan, Operation, Target};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    ProjectedVolumeSource, ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{ListParams, Patch, PatchParams, PostParams},
};
use std::collections::BTreeMap;

use crate::util::{Error, MANAGER_NAME, hash_suffix};

pub const RUNNER_CONTAINER: &str = "runner";
pub const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/ardikabs/hibernator-runner:latest";
pub const DEFAULT_RUNNER_SERVICE_ACCOUNT: &str = "hibernator-runner";

const TOKEN_MOUNT_PATH: &str = "/var/run/secrets/stream";
const TOKEN_AUDIENCE: &str = "hibernator-control-plane";
const TOKEN_EXPIRY_SECONDS: i64 = 600;
const JOB_BACKOFF_LIMIT: i32 = 3;
const JOB_TTL_SECONDS: i32 = 3600;

/// Longest name stem used inside `generateName`.
const GENERATE_NAME_STEM: usize = 50;
/// Kubernetes label values max out at 63 characters.
const LABEL_VALUE_MAX: usize = 63;

/// Static runner invocation settings resolved from flags at startup.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub image: String,
    pub service_account: String,
    pub control_plane_endpoint: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_RUNNER_IMAGE.to_string(),
            service_account: DEFAULT_RUNNER_SERVICE_ACCOUNT.to_string(),
            control_plane_endpoint: "hibernator-control-plane".to_string(),
        }
    }
}

/// Truncates `value` to at most `max` characters, keeping it unique by
/// replacing the tail with a short digest of the full string.
pub fn shortened(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    format!("{}-{}", &value[..max - 9], hash_suffix(value))
}

/// `<shortened(plan-target)>-<unix-seconds>`, bounded by the label value
/// limit so it can ride on the job as `execution-id`.
pub fn execution_id(plan: &str, target: &str, unix_seconds: i64) -> String {
    let suffix = unix_seconds.to_string();
    let stem = shortened(
        &format!("{}-{}", plan, target),
        LABEL_VALUE_MAX - suffix.len() - 1,
    );
    format!("{}-{}", stem, suffix)
}

/// Label selector matching all live runner jobs of one (plan, operation,
/// cycle).
pub fn cycle_selector(plan: &str, operation: Operation, cycle_id: &str) -> String {
    format!(
        "{}={},{}={},{}={}",
        labels::PLAN,
        plan,
        labels::OPERATION,
        operation,
        labels::CYCLE_ID,
        cycle_id
    )
}

pub fn is_stale(job: &Job) -> bool {
    job.labels().get(labels::STALE).map(String::as_str) == Some("true")
}

pub fn matches_target(job: &Job, target: &str, executor: &str) -> bool {
    let labels_map = job.labels();
    labels_map.get(labels::TARGET).map(String::as_str) == Some(target)
        && labels_map.get(labels::EXECUTOR).map(String::as_str) == Some(executor)
}

/// The terminal/running shape of a runner job, read off its conditions.
#[derive(Clone, Debug, PartialEq)]
pub enum RunnerJobState {
    Pending,
    Running { started_at: Option<Time> },
    Completed { finished_at: Option<Time> },
    Failed { finished_at: Option<Time> },
}

pub fn derive_job_state(job: &Job) -> RunnerJobState {
    let status = match &job.status {
        Some(s) => s,
        None => return RunnerJobState::Pending,
    };
    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Complete" => {
                    return RunnerJobState::Completed {
                        finished_at: condition.last_transition_time.clone(),
                    };
                }
                "Failed" => {
                    return RunnerJobState::Failed {
                        finished_at: condition.last_transition_time.clone(),
                    };
                }
                _ => {}
            }
        }
    }
    if status.active.unwrap_or(0) > 0 {
        return RunnerJobState::Running {
            started_at: status.start_time.clone(),
        };
    }
    RunnerJobState::Pending
}

pub fn job_attempts(job: &Job) -> u32 {
    let status = match &job.status {
        Some(s) => s,
        None => return 0,
    };
    (status.succeeded.unwrap_or(0) + status.failed.unwrap_or(0)).max(0) as u32
}

/// Builds the runner job for one (target, operation) of the current cycle.
pub fn build_runner_job(
    plan: &HibernatePlan,
    target: &Target,
    operation: Operation,
    cycle_id: &str,
    execution_id: &str,
    config: &RunnerConfig,
) -> Result<Job, Error> {
    let plan_name = plan.name_any();
    let namespace = plan
        .namespace()
        .ok_or_else(|| Error::UserInput("HibernatePlan is missing metadata.namespace".into()))?;
    let owner = plan.controller_owner_ref(&()).ok_or_else(|| {
        Error::UserInput("HibernatePlan is missing metadata required for ownership".into())
    })?;

    let mut job_labels = BTreeMap::new();
    job_labels.insert(labels::PLAN.to_string(), plan_name.clone());
    job_labels.insert(labels::TARGET.to_string(), target.name.clone());
    job_labels.insert(labels::OPERATION.to_string(), operation.to_string());
    job_labels.insert(labels::EXECUTION_ID.to_string(), execution_id.to_string());
    job_labels.insert(labels::EXECUTOR.to_string(), target.target_type.clone());
    job_labels.insert(labels::CYCLE_ID.to_string(), cycle_id.to_string());

    let mut job_annotations = BTreeMap::new();
    job_annotations.insert(annotations::PLAN.to_string(), plan_name.clone());
    job_annotations.insert(annotations::TARGET.to_string(), target.name.clone());

    let endpoint = &config.control_plane_endpoint;
    let target_params = target
        .parameters
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "{}".to_string());
    let connector_namespace = target
        .connector_ref
        .namespace
        .clone()
        .unwrap_or_else(|| namespace.clone());

    let env = vec![
        EnvVar {
            name: "POD_NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        env_var("HIBERNATOR_EXECUTION_ID", execution_id),
        env_var("HIBERNATOR_CONTROL_PLANE_ENDPOINT", endpoint),
        env_var("HIBERNATOR_USE_TLS", "false"),
        env_var("HIBERNATOR_GRPC_ENDPOINT", &format!("{endpoint}:9444")),
        env_var(
            "HIBERNATOR_WEBSOCKET_ENDPOINT",
            &format!("ws://{endpoint}:8082"),
        ),
        env_var(
            "HIBERNATOR_HTTP_CALLBACK_ENDPOINT",
            &format!("http://{endpoint}:8082"),
        ),
        env_var("HIBERNATOR_TARGET_PARAMS", &target_params),
        env_var("HIBERNATOR_CONNECTOR_KIND", &target.connector_ref.kind),
        env_var("HIBERNATOR_CONNECTOR_NAME", &target.connector_ref.name),
        env_var("HIBERNATOR_CONNECTOR_NAMESPACE", &connector_namespace),
    ];

    let container = Container {
        name: RUNNER_CONTAINER.to_string(),
        image: Some(config.image.clone()),
        args: Some(vec![
            "--operation".to_string(),
            operation.to_string(),
            "--target".to_string(),
            target.name.clone(),
            "--target-type".to_string(),
            target.target_type.clone(),
            "--plan".to_string(),
            plan_name.clone(),
        ]),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: "stream-token".to_string(),
            mount_path: TOKEN_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        service_account_name: Some(config.service_account.clone()),
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: "stream-token".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        audience: Some(TOKEN_AUDIENCE.to_string()),
                        expiration_seconds: Some(TOKEN_EXPIRY_SECONDS),
                        path: "token".to_string(),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            generate_name: Some(format!(
                "runner-{}-",
                shortened(&format!("{}-{}", plan_name, target.name), GENERATE_NAME_STEM)
            )),
            namespace: Some(namespace),
            labels: Some(job_labels),
            annotations: Some(job_annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(JOB_BACKOFF_LIMIT),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(
                        [
                            (labels::PLAN.to_string(), plan_name),
                            (labels::TARGET.to_string(), target.name.clone()),
                            (labels::EXECUTION_ID.to_string(), execution_id.to_string()),
                        ]
                        .into(),
                    ),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// All jobs belonging to one (plan, operation, cycle), stale ones included.
pub async fn list_cycle_jobs(
    client: Client,
    namespace: &str,
    plan: &str,
    operation: Operation,
    cycle_id: &str,
) -> Result<Vec<Job>, Error> {
    let api: Api<Job> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(&cycle_selector(plan, operation, cycle_id));
    Ok(api.list(&params).await?.items)
}

/// All jobs belonging to a plan regardless of cycle, for deletion.
pub async fn list_plan_jobs(
    client: Client,
    namespace: &str,
    plan: &str,
) -> Result<Vec<Job>, Error> {
    let api: Api<Job> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(&format!("{}={}", labels::PLAN, plan));
    Ok(api.list(&params).await?.items)
}

pub async fn create_runner_job(client: Client, job: &Job) -> Result<Job, Error> {
    let namespace = job.namespace().unwrap_or_default();
    let api: Api<Job> = Api::namespaced(client, &namespace);
    Ok(api.create(&PostParams::default(), job).await?)
}

/// Retires a job from state aggregation by labeling it stale.
pub async fn mark_job_stale(client: Client, job: &Job, reason: &str) -> Result<(), Error> {
    let namespace = job.namespace().unwrap_or_default();
    let api: Api<Job> = Api::namespaced(client, &namespace);
    let patch = serde_json::json!({
        "metadata": {
            "labels": {
                labels::STALE: "true",
                labels::STALE_REASON: reason,
            }
        }
    });
    api.patch(
        &job.name_any(),
        &PatchParams::apply(MANAGER_NAME),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Termination message of the newest pod spawned by a failed job.
/// Best-effort: absence of pods or messages is not an error.
pub async fn failed_pod_message(client: Client, job: &Job) -> Option<String> {
    use k8s_openapi::api::core::v1::Pod;

    let namespace = job.namespace()?;
    let api: Api<Pod> = Api::namespaced(client, &namespace);
    let params = ListParams::default().labels(&format!("job-name={}", job.name_any()));
    let mut pods = api.list(&params).await.ok()?.items;
    pods.sort_by(|a, b| {
        b.metadata
            .creation_timestamp
            .cmp(&a.metadata.creation_timestamp)
    });
    let pod = pods.into_iter().next()?;
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == RUNNER_CONTAINER)
        .and_then(|cs| cs.state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .and_then(|terminated| terminated.message.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hibernator_types::{ConnectorRef, HibernatePlanSpec};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn plan(name: &str) -> HibernatePlan {
        let mut plan = HibernatePlan::new(name, HibernatePlanSpec::default());
        plan.metadata.namespace = Some("workloads".to_string());
        plan.metadata.uid = Some("uid-1234".to_string());
        plan
    }

    fn target(name: &str) -> Target {
        Target {
            name: name.to_string(),
            target_type: "eks".to_string(),
            connector_ref: ConnectorRef {
                kind: "AWSConnector".to_string(),
                name: "prod".to_string(),
                namespace: Some("connectors".to_string()),
            },
            parameters: Some(serde_json::json!({"clusterName": "prod-eks"})),
        }
    }

    fn job_with_condition(type_: &str, status: &str) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn short_values_pass_through() {
        assert_eq!(shortened("plan-db", 50), "plan-db");
    }

    #[test]
    fn long_values_truncate_deterministically() {
        let long = "a".repeat(80);
        let a = shortened(&long, 50);
        let b = shortened(&long, 50);
        assert_eq!(a, b);
        assert_eq!(a.len(), 50);
        assert!(a.starts_with(&"a".repeat(41)));
    }

    #[test]
    fn distinct_long_values_stay_distinct() {
        let a = shortened(&format!("{}x", "a".repeat(80)), 50);
        let b = shortened(&format!("{}y", "a".repeat(80)), 50);
        assert_ne!(a, b);
    }

    #[test]
    fn execution_id_is_deterministic_for_the_same_second() {
        assert_eq!(
            execution_id("nightly", "db", 1_769_641_200),
            execution_id("nightly", "db", 1_769_641_200)
        );
        assert_eq!(
            execution_id("nightly", "db", 1_769_641_200),
            "nightly-db-1769641200"
        );
    }

    #[test]
    fn execution_id_fits_a_label() {
        let id = execution_id(&"p".repeat(60), &"t".repeat(30), 1_769_641_200);
        assert!(id.len() <= 63);
        assert!(id.ends_with("-1769641200"));
    }

    #[test]
    fn runner_job_carries_the_wire_contract() {
        let plan = plan("nightly");
        let target = target("db");
        let config = RunnerConfig::default();
        let job = build_runner_job(
            &plan,
            &target,
            Operation::Shutdown,
            "a1b2c3d4",
            "nightly-db-1769641200",
            &config,
        )
        .unwrap();

        let labels_map = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels_map[labels::PLAN], "nightly");
        assert_eq!(labels_map[labels::TARGET], "db");
        assert_eq!(labels_map[labels::OPERATION], "shutdown");
        assert_eq!(labels_map[labels::EXECUTOR], "eks");
        assert_eq!(labels_map[labels::CYCLE_ID], "a1b2c3d4");
        assert_eq!(labels_map[labels::EXECUTION_ID], "nightly-db-1769641200");
        assert_eq!(
            job.metadata.generate_name.as_deref(),
            Some("runner-nightly-db-")
        );

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(3));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.service_account_name.as_deref(), Some("hibernator-runner"));

        let container = &pod.containers[0];
        assert_eq!(container.name, "runner");
        assert_eq!(
            container.args.as_ref().unwrap(),
            &[
                "--operation",
                "shutdown",
                "--target",
                "db",
                "--target-type",
                "eks",
                "--plan",
                "nightly"
            ]
        );

        let env = container.env.as_ref().unwrap();
        let get = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.as_deref())
        };
        assert_eq!(get("HIBERNATOR_USE_TLS"), Some("false"));
        assert_eq!(
            get("HIBERNATOR_GRPC_ENDPOINT"),
            Some("hibernator-control-plane:9444")
        );
        assert_eq!(
            get("HIBERNATOR_WEBSOCKET_ENDPOINT"),
            Some("ws://hibernator-control-plane:8082")
        );
        assert_eq!(
            get("HIBERNATOR_HTTP_CALLBACK_ENDPOINT"),
            Some("http://hibernator-control-plane:8082")
        );
        assert_eq!(
            get("HIBERNATOR_TARGET_PARAMS"),
            Some(r#"{"clusterName":"prod-eks"}"#)
        );
        assert_eq!(get("HIBERNATOR_CONNECTOR_KIND"), Some("AWSConnector"));
        assert_eq!(get("HIBERNATOR_CONNECTOR_NAME"), Some("prod"));
        assert_eq!(get("HIBERNATOR_CONNECTOR_NAMESPACE"), Some("connectors"));

        let volume = &pod.volumes.as_ref().unwrap()[0];
        let projection = &volume.projected.as_ref().unwrap().sources.as_ref().unwrap()[0];
        let token = projection.service_account_token.as_ref().unwrap();
        assert_eq!(token.audience.as_deref(), Some("hibernator-control-plane"));
        assert_eq!(token.expiration_seconds, Some(600));
    }

    #[test]
    fn job_state_follows_conditions() {
        assert_eq!(
            derive_job_state(&job_with_condition("Complete", "True")),
            RunnerJobState::Completed { finished_at: None }
        );
        assert_eq!(
            derive_job_state(&job_with_condition("Failed", "True")),
            RunnerJobState::Failed { finished_at: None }
        );
        // A False condition does not count.
        assert_eq!(
            derive_job_state(&job_with_condition("Failed", "False")),
            RunnerJobState::Pending
        );
        let running = Job {
            status: Some(JobStatus {
                active: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            derive_job_state(&running),
            RunnerJobState::Running { started_at: None }
        );
    }

    #[test]
    fn attempts_sum_succeeded_and_failed() {
        let job = Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                failed: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(job_attempts(&job), 3);
    }

    #[test]
    fn stale_jobs_are_recognized() {
        let mut job = Job::default();
        assert!(!is_stale(&job));
        job.metadata.labels = Some(
            [(labels::STALE.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(is_stale(&job));
    }

    #[test]
    fn cycle_selector_routes_on_all_three_keys() {
        let selector = cycle_selector("nightly", Operation::Wakeup, "a1b2c3d4");
        assert_eq!(
            selector,
            "hibernator.ardikabs.com/plan=nightly,\
             hibernator.ardikabs.com/operation=wakeup,\
             hibernator.ardikabs.com/cycle-id=a1b2c3d4"
        );
    }
}
