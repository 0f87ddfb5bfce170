//! The scenario catalogue end to end against the reference relayer.

mod common;

use common::{default_setup, setup};
use ffa_memval::ffa::*;
use ffa_memval::status::Failure;
use ffa_memval::stub::{Quirks, StubConfig};
use ffa_memval::suite::{self, Verdict};

fn run(env: &suite::TestEnv, name: &str) -> Verdict {
    let test = suite::find(name).unwrap();
    suite::run_test(env, test)
}

#[test]
fn test_catalogue() {
    let names: Vec<&str> = suite::all().iter().map(|t| t.name).collect();
    assert_eq!(
        names,
        [
            "share_input_error_checks",
            "share_retrieve_input_checks",
            "share_invalid_handle_tag",
            "donate_lower_upper_boundary_32",
            "donate_lifecycle",
            "lend_retrieve_align_hint",
            "lend_retrieve_fragmented",
        ]
    );
    assert!(suite::find("share_input_error_checks").is_some());
    assert!(suite::find("nope").is_none());
}

#[test]
fn test_everything_passes_against_a_conforming_relayer() {
    let (env, relayer) = default_setup();
    let summary = suite::run_all(&env, suite::all());
    assert_eq!(summary.passed, 7, "{summary:?}");
    assert!(summary.is_success());

    assert_eq!(relayer.outstanding_handles(), 0);
    assert_eq!(relayer.mapped_mailboxes(), 0);
    assert_eq!(env.memory.outstanding_pages(), 0);
}

#[test]
fn test_each_scenario_alone() {
    for test in suite::all() {
        let (env, _relayer) = default_setup();
        assert!(
            matches!(suite::run_test(&env, test), Verdict::Pass),
            "{}",
            test.name
        );
    }
}

#[test]
fn test_missing_abi_skips() {
    let (env, _relayer) = setup(|stub| stub.without(FFA_MEM_DONATE_32));
    assert!(matches!(
        run(&env, "donate_lower_upper_boundary_32"),
        Verdict::Skip
    ));
    // Still runs over the 64-bit ABI
    assert!(matches!(run(&env, "donate_lifecycle"), Verdict::Pass));

    let summary = suite::run_all(&env, suite::all());
    assert_eq!((summary.passed, summary.skipped, summary.failed), (6, 1, 0));
}

#[test]
fn test_lax_transfer_checks_fail_without_leaking() {
    let (env, relayer) = setup(|stub| {
        stub.with_quirks(Quirks {
            skip_transfer_checks: true,
            ..Quirks::default()
        })
    });
    match run(&env, "share_input_error_checks") {
        Verdict::Fail(e) => {
            assert_eq!(e.point, 2, "{e}");
            assert!(matches!(e.failure, Failure::Mismatch { .. }));
        }
        other => panic!("expected a failure, got {other:?}"),
    }
    assert_eq!(relayer.outstanding_handles(), 0);
    assert_eq!(relayer.mapped_mailboxes(), 0);
    assert_eq!(env.memory.outstanding_pages(), 0);
}

#[test]
fn test_lax_retrieve_checks_fail_on_the_server() {
    let (env, relayer) = setup(|stub| {
        stub.with_quirks(Quirks {
            skip_retrieve_checks: true,
            ..Quirks::default()
        })
    });
    match run(&env, "share_retrieve_input_checks") {
        // The server's first rejected mutation, not the client's reaction
        Verdict::Fail(e) => assert_eq!(e.point, 1, "{e}"),
        other => panic!("expected a failure, got {other:?}"),
    }
    assert_eq!(relayer.outstanding_handles(), 0);

    // Runs after a failed test start from a clean relayer
    assert!(matches!(run(&env, "donate_lifecycle"), Verdict::Pass));
}

#[test]
fn test_small_fragments() {
    let (env, _relayer) = setup(|stub| StubConfig {
        max_fragment: 256,
        ..stub
    });
    assert!(matches!(run(&env, "lend_retrieve_fragmented"), Verdict::Pass));
    assert!(matches!(run(&env, "donate_lower_upper_boundary_32"), Verdict::Pass));
}

#[test]
fn test_relayer_without_aligned_mappings() {
    let (env, _relayer) = setup(|stub| StubConfig {
        max_alignment_order: 0,
        ..stub
    });
    assert!(matches!(run(&env, "lend_retrieve_align_hint"), Verdict::Pass));
}
