//! Building providers from stored references: wire shape, connection
//! argument round trips, and credential resolution from the environment.

#![allow(clippy::expect_used)]

use serde_json::json;
use serial_test::serial;
use vdesk::{Error, ProviderKind, ProviderRef, provider_from_ref};

use crate::helpers;

#[test]
fn test_local_backends_build_from_bare_refs() {
    let (_dir, ctx) = helpers::temp_context();
    for kind in [ProviderKind::Qemu, ProviderKind::Docker, ProviderKind::Kube] {
        let provider =
            provider_from_ref(&ctx, &ProviderRef::bare(kind)).expect("local backends need no args");
        assert_eq!(provider.kind(), kind);
        assert!(provider.list().expect("list").is_empty());
    }
}

#[test]
fn test_kube_ref_round_trips_connection_args() {
    let (_dir, ctx) = helpers::temp_context();
    let ref_in = ProviderRef::new(
        ProviderKind::Kube,
        json!({"namespace": "desks", "context": "prod-eu"}),
    );
    let provider = provider_from_ref(&ctx, &ref_in).expect("build");
    assert_eq!(provider.to_data(), ref_in);
}

#[test]
#[serial]
#[allow(unsafe_code)]
fn test_cloud_backends_require_env_credentials() {
    // SAFETY: every test touching these variables runs serialized.
    unsafe {
        std::env::remove_var("SCW_SECRET_KEY");
        std::env::remove_var("SCW_DEFAULT_PROJECT_ID");
        std::env::remove_var("HCLOUD_TOKEN");
    }
    let (_dir, ctx) = helpers::temp_context();

    // With the project in the ref, the missing secret is what gets reported.
    let scw = ProviderRef::new(ProviderKind::Scaleway, json!({"project_id": "proj-1"}));
    match provider_from_ref(&ctx, &scw).expect_err("scaleway") {
        Error::Credentials {
            provider: ProviderKind::Scaleway,
            var,
        } => assert_eq!(var, "SCW_SECRET_KEY"),
        other => panic!("unexpected error: {other}"),
    }
    // A bare ref cannot even resolve the project.
    match provider_from_ref(&ctx, &ProviderRef::bare(ProviderKind::Scaleway))
        .expect_err("bare scaleway")
    {
        Error::Credentials { var, .. } => assert_eq!(var, "SCW_DEFAULT_PROJECT_ID"),
        other => panic!("unexpected error: {other}"),
    }
    match provider_from_ref(&ctx, &ProviderRef::bare(ProviderKind::Hetzner)).expect_err("hetzner") {
        Error::Credentials { var, .. } => assert_eq!(var, "HCLOUD_TOKEN"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
#[serial]
#[allow(unsafe_code)]
fn test_cloud_refs_round_trip_under_env_tokens() {
    // SAFETY: every test touching these variables runs serialized.
    unsafe {
        std::env::set_var("SCW_SECRET_KEY", "scw-secret");
        std::env::set_var("HCLOUD_TOKEN", "hcloud-token");
    }
    let (_dir, ctx) = helpers::temp_context();

    let scw = ProviderRef::new(
        ProviderKind::Scaleway,
        json!({"zone": "nl-ams-1", "project_id": "proj-55"}),
    );
    let provider = provider_from_ref(&ctx, &scw).expect("scaleway");
    assert_eq!(provider.kind(), ProviderKind::Scaleway);
    assert_eq!(provider.to_data(), scw);

    let hz = ProviderRef::new(ProviderKind::Hetzner, json!({"location": "fsn1"}));
    let provider = provider_from_ref(&ctx, &hz).expect("hetzner");
    assert_eq!(provider.to_data(), hz);

    // SAFETY: every test touching these variables runs serialized.
    unsafe {
        std::env::remove_var("SCW_SECRET_KEY");
        std::env::remove_var("HCLOUD_TOKEN");
    }
}

#[test]
fn test_provider_ref_wire_shape() {
    let parsed: ProviderRef = serde_json::from_str(r#"{"type":"qemu"}"#).expect("parse");
    assert_eq!(parsed.kind, ProviderKind::Qemu);
    assert_eq!(parsed.args, json!({}));

    let rendered = serde_json::to_value(ProviderRef::bare(ProviderKind::Hetzner)).expect("render");
    assert_eq!(rendered["type"], "hetzner");

    assert!(serde_json::from_str::<ProviderRef>(r#"{"type":"vsphere"}"#).is_err());
}
