//! Property-based tests for instance naming, secret sealing, store
//! reconciliation, and port probing.

#![allow(clippy::expect_used)]

use proptest::prelude::*;
use vdesk::instance::{generate_instance_name, validate_instance_name};
use vdesk::provider::reconcile::{self, LiveResource};
use vdesk::util::{find_open_port, random_password, short_hash};
use vdesk::{DesktopInstance, InstanceStatus, ProviderKind};

use crate::helpers;

// ============================================================================
// Instance names
// ============================================================================

proptest! {
    /// Anything matching the documented shape is accepted.
    #[test]
    fn prop_conforming_names_are_accepted(name in "[a-z0-9][a-z0-9-]{0,59}") {
        prop_assert!(validate_instance_name(&name).is_ok());
    }

    /// One character outside the allowed set poisons the whole name.
    #[test]
    fn prop_foreign_characters_are_rejected(
        prefix in "[a-z0-9]{1,8}",
        bad in "[A-Z_.@ ]",
        suffix in "[a-z0-9]{0,8}",
    ) {
        let name = format!("{prefix}{bad}{suffix}");
        prop_assert!(validate_instance_name(&name).is_err(), "accepted {:?}", name);
    }

    /// Length is capped.
    #[test]
    fn prop_overlong_names_are_rejected(name in "[a-z]{61,100}") {
        prop_assert!(validate_instance_name(&name).is_err());
    }
}

#[test]
fn test_generated_names_are_unique_and_valid() {
    let mut seen = std::collections::HashSet::new();
    for _ in 0..128 {
        let name = generate_instance_name();
        assert!(validate_instance_name(&name).is_ok());
        assert!(name.starts_with("desk-"));
        assert_eq!(name.len(), 11);
        seen.insert(name);
    }
    // Allow for the rare birthday collision in the six-hex-char space.
    assert!(seen.len() >= 126, "too many collisions: {}", seen.len());
}

// ============================================================================
// Secret sealing
// ============================================================================

proptest! {
    /// Whatever gets sealed comes back intact.
    #[test]
    fn prop_sealed_payloads_round_trip(secret in ".{0,200}") {
        let (_dir, ctx) = helpers::temp_context();
        let sealed = ctx.cipher().encrypt(&secret).expect("encrypt");
        prop_assert_eq!(ctx.cipher().decrypt(&sealed).expect("decrypt"), secret);
    }

    /// The sealed form never shows its plaintext.
    #[test]
    fn prop_sealed_form_is_opaque(secret in "[a-zA-Z0-9]{12,64}") {
        let (_dir, ctx) = helpers::temp_context();
        let sealed = ctx.cipher().encrypt(&secret).expect("encrypt");
        prop_assert!(!sealed.contains(&secret));
    }

    /// Passwords come out alphanumeric at the requested length.
    #[test]
    fn prop_generated_passwords_have_shape(len in 1usize..64) {
        let password = random_password(len);
        prop_assert_eq!(password.chars().count(), len);
        prop_assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    /// Short hashes are stable six-char lowercase hex.
    #[test]
    fn prop_short_hash_shape(input in ".{0,100}") {
        let digest = short_hash(&input);
        prop_assert_eq!(digest.len(), 6);
        prop_assert!(digest.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
        prop_assert_eq!(short_hash(&input), digest);
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Build a record set plus its live view from per-desktop flags
/// (still present on the backend, address drifted).
fn record_set(flags: &[(bool, bool)]) -> (Vec<DesktopInstance>, Vec<LiveResource>) {
    let mut records = Vec::new();
    let mut live = Vec::new();
    for (i, (present, drifted)) in flags.iter().copied().enumerate() {
        let mut record = helpers::instance_record(&format!("box-{i}"), ProviderKind::Hetzner);
        record.resource_name = Some(format!("srv-{i}"));
        record.addr = format!("10.0.0.{i}");
        records.push(record);
        if present {
            live.push(LiveResource {
                resource_name: format!("srv-{i}"),
                addr: if drifted {
                    format!("10.9.9.{i}")
                } else {
                    format!("10.0.0.{i}")
                },
                status: InstanceStatus::Running,
            });
        }
    }
    (records, live)
}

proptest! {
    /// One pass removes every vanished desktop and patches every drifted
    /// one; a second pass over the patched set has nothing left to do.
    #[test]
    fn prop_diff_converges_in_one_pass(
        flags in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..10),
    ) {
        let (records, live) = record_set(&flags);
        let plan = reconcile::diff(records.clone(), &live);

        let expect_removed: Vec<String> = flags
            .iter()
            .enumerate()
            .filter(|&(_, &(present, _))| !present)
            .map(|(i, _)| format!("box-{i}"))
            .collect();
        let removed: Vec<String> = plan.remove.iter().map(|r| r.name.clone()).collect();
        prop_assert_eq!(removed, expect_removed);

        let expect_updated: Vec<String> = flags
            .iter()
            .enumerate()
            .filter(|&(_, &(present, drifted))| present && drifted)
            .map(|(i, _)| format!("box-{i}"))
            .collect();
        let updated: Vec<String> = plan.update.iter().map(|r| r.name.clone()).collect();
        prop_assert_eq!(updated, expect_updated);

        let patched: Vec<DesktopInstance> = records
            .into_iter()
            .filter(|r| plan.remove.iter().all(|gone| gone.id != r.id))
            .map(|r| match plan.update.iter().find(|u| u.id == r.id) {
                Some(updated) => updated.clone(),
                None => r,
            })
            .collect();
        prop_assert!(reconcile::diff(patched, &live).is_empty());
    }
}

// ============================================================================
// Port probing
// ============================================================================

proptest! {
    /// A found port always lies inside the half-open request range.
    #[test]
    fn prop_found_ports_lie_in_range(lower in 20000u16..40000, span in 1u16..64) {
        let upper = lower + span;
        if let Some(port) = find_open_port(lower, upper) {
            prop_assert!(port >= lower && port < upper, "got {}", port);
        }
    }
}
