//! Kubernetes backend.
//!
//! A desktop is one pod plus a ClusterIP service and a basic-auth secret,
//! applied as a `kind: List` manifest through `kubectl apply -f -`. The
//! recorded address is the service DNS name, which only resolves in-cluster,
//! so desktops are proxied (`requires_proxy = true`) even though no SSH key
//! is involved; readiness is probed through a transient `kubectl
//! port-forward`. Power operations do not exist for pods.

use std::ffi::OsString;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::health::{ProbePolicy, check_health, wait_until_ready};
use crate::home::Context;
use crate::instance::{DesktopInstance, InstanceStatus, ProviderKind, ProviderRef, generate_id};
use crate::provider::{
    CreateRequest, DesktopProvider, RefreshSummary, deprovision_guard, ensure_name_available,
    finish_delete, persist_running, reconcile, resolve_name,
};
use crate::runner::{CommandRunner, ProcessRunner, require_success};
use crate::tunnel::terminate_pid;
use crate::util::{find_open_port, random_password};

const KUBECTL: &str = "kubectl";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_IMAGE: &str = "vdesk/desktop:latest";
const PROVISIONER_LABEL: (&str, &str) = ("provisioner", "vdesk");
const DEFAULT_AUTH_USER: &str = "vdesk";
const PASSWORD_LEN: usize = 24;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 60;
const FORWARD_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeArgs {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// kubeconfig context; the current one when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Default for KubeArgs {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            context: None,
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn pod_name(instance: &str) -> String {
    format!("desk-{instance}")
}

fn secret_name(pod: &str) -> String {
    format!("{pod}-auth")
}

fn service_dns(pod: &str, namespace: &str) -> String {
    format!("{pod}.{namespace}.svc.cluster.local")
}

fn map_phase(phase: &str) -> InstanceStatus {
    match phase {
        "Running" => InstanceStatus::Running,
        "Pending" => InstanceStatus::Creating,
        _ => InstanceStatus::Error,
    }
}

pub struct KubeProvider<R: CommandRunner = ProcessRunner> {
    ctx: Context,
    runner: R,
    args: KubeArgs,
    policy: ProbePolicy,
    forward_port: Option<u16>,
}

impl KubeProvider<ProcessRunner> {
    #[must_use]
    pub fn new(ctx: Context, args: KubeArgs) -> Self {
        Self::with_runner(ctx, args, ProcessRunner)
    }

    /// Reconstruct a provider from stored connection configuration.
    ///
    /// # Errors
    ///
    /// Infallible today; `Result` keeps the constructor uniform across
    /// backends.
    pub fn from_data(ctx: Context, provider: &ProviderRef) -> Result<Self> {
        let args = serde_json::from_value(provider.args.clone()).unwrap_or_default();
        Ok(Self::new(ctx, args))
    }
}

impl<R: CommandRunner> KubeProvider<R> {
    #[must_use]
    pub fn with_runner(ctx: Context, args: KubeArgs, runner: R) -> Self {
        Self {
            ctx,
            runner,
            args,
            policy: ProbePolicy::default(),
            forward_port: None,
        }
    }

    #[must_use]
    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pin the local port-forward endpoint instead of picking a free port.
    #[must_use]
    pub fn with_forward_port(mut self, port: u16) -> Self {
        self.forward_port = Some(port);
        self
    }

    fn provision_err(&self, name: &str, reason: String) -> Error {
        Error::ProvisionFailed {
            name: name.to_string(),
            provider: self.kind(),
            reason,
        }
    }

    fn kubectl_args(&self, rest: &[&str]) -> Vec<OsString> {
        let mut args = vec!["--namespace".to_string(), self.args.namespace.clone()];
        if let Some(context) = &self.args.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.extend(rest.iter().map(|s| (*s).to_string()));
        args.into_iter().map(OsString::from).collect()
    }

    fn manifest(name: &str, pod: &str, user: &str, password: &str, image: &str) -> serde_json::Value {
        let secret = secret_name(pod);
        let labels = json!({ PROVISIONER_LABEL.0: PROVISIONER_LABEL.1, "desk": name });
        json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "metadata": { "name": secret, "labels": labels },
                    "stringData": { "CUSTOM_USER": user, "PASSWORD": password },
                },
                {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": { "name": pod, "labels": labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "desktop",
                            "image": image,
                            "ports": [
                                { "containerPort": 8000 },
                                { "containerPort": 3000 },
                                { "containerPort": 3001 },
                            ],
                            "envFrom": [{ "secretRef": { "name": secret } }],
                        }],
                    },
                },
                {
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": { "name": pod, "labels": labels },
                    "spec": {
                        "type": "ClusterIP",
                        "selector": { "desk": name },
                        "ports": [
                            { "name": "agentd", "port": 8000, "targetPort": 8000 },
                            { "name": "vnc", "port": 3000, "targetPort": 3000 },
                            { "name": "vnc-https", "port": 3001, "targetPort": 3001 },
                        ],
                    },
                },
            ],
        })
    }

    fn wait_for_phase(&self, name: &str, pod: &str, target: &str) -> Result<()> {
        for _ in 1..=POLL_ATTEMPTS {
            let output = self.runner.run(
                KUBECTL,
                &self.kubectl_args(&["get", "pod", pod, "-o", "jsonpath={.status.phase}"]),
            )?;
            if output.is_success() && output.stdout.trim() == target {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(self.provision_err(name, format!("pod never reached phase {target}")))
    }

    /// Readiness wait through a transient `kubectl port-forward` per attempt.
    fn probe_via_forward(&self, name: &str, pod: &str) -> Result<()> {
        wait_until_ready(name, ProviderKind::Kube, self.policy, || {
            let local = match self.forward_port.or_else(|| find_open_port(8000, 9000)) {
                Some(port) => port,
                None => {
                    tracing::warn!(name, "no free local port for the probe forward");
                    return false;
                }
            };
            let forward = format!("{local}:8000");
            let target = format!("pod/{pod}");
            let pid = match self.runner.spawn_detached(
                KUBECTL,
                &self.kubectl_args(&["port-forward", &target, &forward]),
            ) {
                Ok(pid) => pid,
                Err(e) => {
                    tracing::debug!(name, error = %e, "port-forward failed to start");
                    return false;
                }
            };
            std::thread::sleep(FORWARD_GRACE);
            let healthy = check_health(&format!("http://localhost:{local}"));
            terminate_pid(pid);
            healthy
        })
    }

    fn teardown(&self, pod: &str) -> Result<()> {
        let pod_ref = format!("pod/{pod}");
        let service_ref = format!("service/{pod}");
        let secret_ref = format!("secret/{}", secret_name(pod));
        let output = self.runner.run(
            KUBECTL,
            &self.kubectl_args(&[
                "delete", "--ignore-not-found", &pod_ref, &service_ref, &secret_ref,
            ]),
        )?;
        require_success(KUBECTL, output).map(|_| ())
    }
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Deserialize)]
struct PodItem {
    metadata: PodMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
struct PodMeta {
    name: String,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(default)]
    phase: String,
}

impl<R: CommandRunner> DesktopProvider for KubeProvider<R> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kube
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    fn create(&self, req: CreateRequest) -> Result<DesktopInstance> {
        if req.reserve_ip {
            return Err(Error::NotSupported {
                op: "reserve_ip",
                provider: ProviderKind::Kube,
            });
        }
        if req.ssh_key_pair.is_some() {
            return Err(Error::NotSupported {
                op: "ssh_key_pair",
                provider: ProviderKind::Kube,
            });
        }
        let name = resolve_name(&req)?;
        ensure_name_available(&self.ctx, self.kind(), &name, req.owner_id.as_deref())?;

        let pod = pod_name(&name);
        let user = req
            .owner_id
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTH_USER.to_string());
        let password = random_password(PASSWORD_LEN);
        let image = req.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        let manifest = Self::manifest(&name, &pod, &user, &password, &image);
        let stdin = serde_json::to_string(&manifest)
            .map_err(|e| self.provision_err(&name, format!("encoding manifest: {e}")))?;
        let output = self
            .runner
            .run_with_stdin(KUBECTL, &self.kubectl_args(&["apply", "-f", "-"]), &stdin)?;
        require_success(KUBECTL, output).map_err(|e| self.provision_err(&name, e.to_string()))?;

        if let Err(e) = self.wait_for_phase(&name, &pod, "Running") {
            let _ = self.teardown(&pod);
            return Err(e);
        }
        if let Err(e) = self.probe_via_forward(&name, &pod) {
            // Keep no half-started desktop around.
            let _ = self.teardown(&pod);
            return Err(e);
        }

        let sealed_password = self
            .ctx
            .cipher()
            .encrypt(&password)
            .map_err(|e| self.provision_err(&name, e.to_string()))?;
        let instance = DesktopInstance {
            id: req.id.clone().unwrap_or_else(generate_id),
            name: name.clone(),
            owner_id: req.owner_id.clone(),
            addr: service_dns(&pod, &self.args.namespace),
            status: InstanceStatus::Creating,
            created: chrono::Utc::now(),
            cpu: req.cpu,
            memory_gb: req.memory_gb,
            disk: req.disk.clone(),
            image: Some(image),
            provider: self.to_data(),
            reserved_ip: false,
            requires_proxy: true,
            ssh_port: crate::instance::DEFAULT_SSH_PORT,
            agentd_port: 8000,
            vnc_port: Some(3000),
            vnc_port_https: Some(3001),
            basic_auth_user: Some(user),
            basic_auth_password: Some(sealed_password),
            key_pair_name: None,
            resource_name: Some(pod),
            namespace: Some(self.args.namespace.clone()),
            ttl: req.ttl,
            metadata: req.metadata,
        };
        persist_running(&self.ctx, instance)
    }

    fn delete(&self, name: &str, owner_id: Option<&str>, force: bool) -> Result<()> {
        let instance = self.get(name, owner_id)?;
        let pod = instance
            .resource_name
            .clone()
            .unwrap_or_else(|| pod_name(&instance.name));
        let outcome = self.teardown(&pod);
        deprovision_guard(force, name, outcome)?;
        finish_delete(&self.ctx, &instance)
    }

    fn refresh(&self) -> Result<RefreshSummary> {
        let selector = format!("{}={}", PROVISIONER_LABEL.0, PROVISIONER_LABEL.1);
        let output = self.runner.run(
            KUBECTL,
            &self.kubectl_args(&["get", "pods", "-l", &selector, "-o", "json"]),
        )?;
        let output = require_success(KUBECTL, output)?;
        let pods: PodList = serde_json::from_str(&output.stdout)
            .map_err(|e| Error::http("parsing pod listing", e))?;
        let live: Vec<reconcile::LiveResource> = pods
            .items
            .into_iter()
            .map(|item| reconcile::LiveResource {
                resource_name: item.metadata.name.clone(),
                addr: service_dns(&item.metadata.name, &self.args.namespace),
                status: map_phase(&item.status.phase),
            })
            .collect();
        reconcile::run(&self.ctx.instances(), self.kind(), &live)
    }

    fn to_data(&self) -> ProviderRef {
        ProviderRef::new(
            ProviderKind::Kube,
            serde_json::to_value(&self.args).unwrap_or_else(|_| serde_json::Value::Null),
        )
    }
}
