//! Lifecycle behavior that holds across backends: persistence, name and
//! owner scoping, failure handling, and reconciliation against the backend.

#![allow(clippy::expect_used)]

use mockall::predicate::eq;
use vdesk::provider::docker::{DockerPorts, DockerProvider};
use vdesk::provider::hetzner::{FirewallRef, HetznerArgs, HetznerProvider};
use vdesk::{Context, CreateRequest, DesktopProvider, Error, InstanceStatus, ProviderKind};

use crate::helpers;
use crate::mocks;

fn docker_provider(
    ctx: Context,
    docker: mocks::ScriptedDocker,
    agentd: u16,
) -> DockerProvider<mocks::ScriptedDocker> {
    DockerProvider::with_runner(ctx, docker)
        .with_probe_policy(helpers::one_shot_probe())
        .with_ports(DockerPorts {
            agentd,
            vnc: helpers::dead_port(),
            vnc_https: helpers::dead_port(),
        })
}

#[test]
fn test_desktop_survives_context_reload() {
    let (dir, ctx) = helpers::temp_context();
    let docker = mocks::ScriptedDocker::new();
    let agentd = helpers::serve_once(helpers::HEALTH_OK);
    let provider = docker_provider(ctx, docker.clone(), agentd);

    let created = provider
        .create(CreateRequest::named("box-a"))
        .expect("create");
    assert_eq!(created.status, InstanceStatus::Running);

    // A second process opening the same state directory sees the desktop.
    let reopened = Context::with_root(dir.path().to_path_buf()).expect("reopen context");
    let provider = DockerProvider::with_runner(reopened, docker);
    let seen = provider.get("box-a", None).expect("get after reload");
    assert_eq!(seen, created);
}

#[test]
fn test_create_then_delete_leaves_nothing() {
    let (_dir, ctx) = helpers::temp_context();
    let docker = mocks::ScriptedDocker::new();
    let agentd = helpers::serve_once(helpers::HEALTH_OK);
    let provider = docker_provider(ctx, docker.clone(), agentd);

    provider
        .create(CreateRequest::named("box-b"))
        .expect("create");
    provider.delete("box-b", None, false).expect("delete");

    assert!(provider.list().expect("list").is_empty());
    assert!(
        docker.calls().iter().any(|c| c == "docker rm -f box-b"),
        "container must be removed, calls were {:?}",
        docker.calls()
    );
    assert!(matches!(
        provider
            .delete("box-b", None, false)
            .expect_err("second delete"),
        Error::NotFound { .. }
    ));
}

#[test]
fn test_same_name_needs_delete_first() {
    let (_dir, ctx) = helpers::temp_context();
    let docker = mocks::ScriptedDocker::new();
    let agentd = helpers::serve_once(helpers::HEALTH_OK);
    let provider = docker_provider(ctx, docker.clone(), agentd);

    provider
        .create(CreateRequest::named("box-c"))
        .expect("first create");
    let err = provider
        .create(CreateRequest::named("box-c"))
        .expect_err("second create");

    assert!(matches!(err, Error::NameConflict { .. }));
    // The conflict is caught before anything is started.
    let runs = docker
        .calls()
        .iter()
        .filter(|c| c.starts_with("docker run "))
        .count();
    assert_eq!(runs, 1);
}

#[test]
fn test_owner_scoping_hides_foreign_desktops() {
    let (_dir, ctx) = helpers::temp_context();
    let mut owned = helpers::instance_record("box-alice", ProviderKind::Docker);
    owned.owner_id = Some("alice".to_string());
    ctx.instances().upsert(&owned).expect("seed owned");
    let shared = helpers::instance_record("box-shared", ProviderKind::Docker);
    ctx.instances().upsert(&shared).expect("seed shared");

    let provider = DockerProvider::with_runner(ctx, mocks::ScriptedDocker::new());
    provider
        .get("box-alice", Some("alice"))
        .expect("owner sees own desktop");
    assert!(matches!(
        provider.get("box-alice", Some("bob")).expect_err("bob"),
        Error::NotFound { .. }
    ));
    assert!(matches!(
        provider.get("box-alice", None).expect_err("anonymous"),
        Error::NotFound { .. }
    ));
    // Unowned desktops stay visible to every caller.
    provider
        .get("box-shared", Some("alice"))
        .expect("shared visible to alice");
    assert_eq!(provider.list().expect("list").len(), 2);
}

#[test]
fn test_records_of_other_backends_are_invisible() {
    let (_dir, ctx) = helpers::temp_context();
    let foreign = helpers::instance_record("box-h", ProviderKind::Hetzner);
    ctx.instances().upsert(&foreign).expect("seed");

    let docker = mocks::ScriptedDocker::new();
    docker.set_ps("");
    let provider = DockerProvider::with_runner(ctx.clone(), docker);

    assert!(matches!(
        provider.get("box-h", None).expect_err("get"),
        Error::NotFound { .. }
    ));
    assert!(provider.list().expect("list").is_empty());
    // Reconciliation against an empty container list must not touch records
    // that belong to another backend.
    let summary = provider.refresh().expect("refresh");
    assert!(summary.is_noop());
    assert!(
        ctx.instances()
            .find_named("box-h", None)
            .expect("find")
            .is_some()
    );
}

#[test]
fn test_cloud_create_rolls_back_nothing_on_probe_timeout() {
    let (_dir, ctx) = helpers::temp_context();
    let mut api = mocks::MockHetznerCloud::new();
    api.expect_ensure_ssh_key()
        .withf(|_, public_key| public_key.starts_with("ssh-rsa "))
        .times(1)
        .returning(|_, _| Ok(()));
    api.expect_ensure_firewall().times(1).returning(|| Ok(7));
    api.expect_create_server()
        .withf(|req| {
            req.server_type == "cx22"
                && req.firewalls == vec![FirewallRef { firewall: 7 }]
                && req.user_data.contains("ssh-rsa ")
        })
        .times(1)
        .returning(|req| Ok(mocks::hetzner_server(42, &req.name, "running", "203.0.113.61")));
    api.expect_get_server()
        .with(eq(42u64))
        .returning(|_| Ok(mocks::hetzner_server(42, "box-t", "running", "203.0.113.61")));
    // No delete_server expectation: the server is left for inspection.

    let provider = HetznerProvider::with_api(
        ctx,
        HetznerArgs {
            location: "nbg1".to_string(),
        },
        api,
    )
    .with_probe_policy(helpers::one_shot_probe());

    let err = provider
        .create(CreateRequest::named("box-t"))
        .expect_err("unreachable desktop must not be reported ready");
    assert!(matches!(err, Error::ReadinessTimeout { attempts: 1, .. }));
    assert!(provider.list().expect("list").is_empty());
}

#[test]
fn test_force_delete_survives_cloud_outage() {
    let (_dir, ctx) = helpers::temp_context();
    let mut record = helpers::instance_record("box-w", ProviderKind::Hetzner);
    record.resource_name = Some("42".to_string());
    ctx.instances().upsert(&record).expect("seed");

    let mut api = mocks::MockHetznerCloud::new();
    api.expect_delete_server()
        .with(eq(42u64))
        .times(2)
        .returning(|_| {
            Err(Error::Http {
                context: "deleting server".to_string(),
                reason: "api is down".to_string(),
            })
        });
    let provider = HetznerProvider::with_api(
        ctx.clone(),
        HetznerArgs {
            location: "nbg1".to_string(),
        },
        api,
    );

    // Without force the outage propagates and the record survives.
    let err = provider
        .delete("box-w", None, false)
        .expect_err("plain delete");
    assert!(matches!(err, Error::Http { .. }));
    provider.get("box-w", None).expect("record kept");

    // With force the record goes even though the backend call still fails.
    provider.delete("box-w", None, true).expect("forced delete");
    assert!(matches!(
        provider.get("box-w", None).expect_err("gone"),
        Error::NotFound { .. }
    ));
}

#[test]
fn test_refresh_adopts_backend_truth_for_cloud() {
    let (_dir, ctx) = helpers::temp_context();
    let mut live = helpers::instance_record("box-live", ProviderKind::Hetzner);
    live.resource_name = Some("42".to_string());
    live.addr = "203.0.113.5".to_string();
    ctx.instances().upsert(&live).expect("seed live");
    let mut gone = helpers::instance_record("box-gone", ProviderKind::Hetzner);
    gone.resource_name = Some("43".to_string());
    ctx.instances().upsert(&gone).expect("seed gone");

    let mut api = mocks::MockHetznerCloud::new();
    api.expect_list_servers()
        .times(2)
        .returning(|| Ok(vec![mocks::hetzner_server(42, "box-live", "running", "198.51.100.9")]));
    let provider = HetznerProvider::with_api(
        ctx.clone(),
        HetznerArgs {
            location: "nbg1".to_string(),
        },
        api,
    );

    let summary = provider.refresh().expect("refresh");
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.updated, 1);
    let adopted = provider.get("box-live", None).expect("survivor");
    assert_eq!(adopted.addr, "198.51.100.9");
    assert!(matches!(
        provider.get("box-gone", None).expect_err("reaped"),
        Error::NotFound { .. }
    ));

    // A second pass finds nothing left to fix.
    assert!(provider.refresh().expect("second refresh").is_noop());
}
