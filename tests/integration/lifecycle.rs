//! Lifecycle behavior against live (in-memory) kernel state

use std::fs;

use tpgate::compiler::{Table, CHAIN_FAILSAFE, CHAIN_OUTPUT};
use tpgate::error::TpgateError;
use tpgate::kernel::{AddressSets, Netfilter, PolicyRoutes};
use tpgate::lifecycle::{AdvisoryRecord, LifecycleState};
use tpgate::policy::{Family, Mode};
use tpgate::process::ProcessControl;
use tpgate::routing::DEFAULT_TABLE;

use super::support::{chain_text, Fixture, Origin, Packet, Verdict};

#[test]
fn test_start_twice_is_idempotent() {
    let fx = Fixture::new(Mode::Chnroute, |c| c.ipv6 = true);
    let engine = fx.engine();

    let first = engine.start().unwrap();
    assert!(!first.replaced_running);
    let once = fx.kernel.snapshot();

    let second = engine.start().unwrap();
    assert!(second.replaced_running);
    assert_eq!(fx.kernel.snapshot(), once);
    assert_eq!(fx.kernel.policy_rule_count(Family::V4), 1);

    // only the second resolver survives
    assert!(!fx.procs.is_alive(first.resolver_pid.unwrap()));
    assert_eq!(fx.procs.pids_by_name("chinadns-ng"), vec![second.resolver_pid.unwrap()]);
}

#[test]
fn test_stop_on_never_started_system() {
    let fx = Fixture::new(Mode::Gfwlist, |c| c.ipv6 = true);
    let report = fx.engine().stop();

    assert!(!report.was_started);
    assert!(report.is_clean());
    assert!(fx.kernel.set_names().is_empty());
    for family in Family::ALL {
        assert_eq!(fx.kernel.policy_rule_count(family), 0);
        assert!(fx.kernel.table_routes(family, DEFAULT_TABLE).unwrap().is_empty());
        for table in Table::ALL {
            assert!(fx.kernel.user_chains(family, table).is_empty());
        }
    }
}

#[test]
fn test_start_stop_leaves_only_failsafe() {
    let fx = Fixture::new(Mode::Chnroute, |c| {
        c.dns.failsafe = Some("223.5.5.5".parse().unwrap());
        c.nat.masquerade_v4 = true;
    });
    let engine = fx.engine();
    engine.start().unwrap();
    assert_eq!(engine.status().state, LifecycleState::Started);

    let report = engine.stop();
    assert!(report.was_started);
    assert!(report.is_clean());
    assert_eq!(engine.status().state, LifecycleState::Stopped);

    assert!(fx.kernel.set_names().is_empty());
    assert_eq!(fx.kernel.policy_rule_count(Family::V4), 0);
    let mut chains = fx.kernel.user_chains(Family::V4, Table::Nat);
    chains.sort();
    assert_eq!(chains, vec!["TPGATE_FAILSAFE", "TPGATE_FAILSAFE_POST"]);
    assert!(fx.kernel.user_chains(Family::V4, Table::Mangle).is_empty());

    // starting again replaces the fail-safe
    engine.start().unwrap();
    assert!(!fx.kernel.chain_exists(Family::V4, Table::Nat, CHAIN_FAILSAFE).unwrap());
}

#[test]
fn test_stop_with_dead_resolver() {
    let fx = Fixture::new(Mode::Chnroute, |c| {
        c.dns.failsafe = Some("223.5.5.5".parse().unwrap());
    });
    let engine = fx.engine();
    let pid = engine.start().unwrap().resolver_pid.unwrap();
    let record_path = fx.config.runtime.record_path.clone();
    assert!(record_path.exists());

    fx.procs.crash(pid);
    assert!(!engine.status().resolver_running);

    let report = engine.stop();
    assert!(report.was_started);
    assert!(report.failsafe_error.is_none());
    assert!(!record_path.exists());
    assert_eq!(
        fx.walker().verdict(&Packet::udp(Origin::Lan, "192.168.1.1", 53)),
        Verdict::Dnat("223.5.5.5".parse().unwrap(), 53)
    );
}

#[test]
fn test_busy_sets_are_retried() {
    let fx = Fixture::new(Mode::Chnroute, |_| {});
    let engine = fx.engine();
    engine.start().unwrap();

    fx.kernel.inject_busy_set("deny-v4", 2);
    let report = engine.stop();
    assert!(report.is_clean());
    assert!(fx.kernel.set_names().is_empty());
}

#[test]
fn test_stuck_set_is_reported_not_fatal() {
    let fx = Fixture::new(Mode::Chnroute, |c| {
        c.dns.failsafe = Some("223.5.5.5".parse().unwrap());
    });
    let engine = fx.engine();
    engine.start().unwrap();

    fx.kernel.inject_busy_set("allow-v4", 100);
    let report = engine.stop();
    assert_eq!(report.teardown_errors.len(), 1);
    assert!(report.teardown_errors[0].step.contains("allow-v4"));
    assert_eq!(fx.kernel.set_names(), vec!["allow-v4".to_string()]);
    assert!(fx.kernel.chain_exists(Family::V4, Table::Nat, CHAIN_FAILSAFE).unwrap());
}

#[test]
fn test_missing_list_aborts_before_mutation() {
    let fx = Fixture::new(Mode::Chnroute, |c| c.ipv6 = true);
    fs::remove_file(&fx.config.lists.chnroute6).unwrap();

    let err = fx.engine().start().unwrap_err();
    assert!(matches!(err, TpgateError::Config(_)));
    assert_eq!(fx.kernel.mutations(), 0);
    assert!(fx.procs.spawns().is_empty());
}

#[test]
fn test_recovery_after_failed_start() {
    let fx = Fixture::new(Mode::Gfwlist, |_| {});
    fx.kernel.fail_appends_to(CHAIN_OUTPUT);
    assert!(matches!(fx.engine().start(), Err(TpgateError::Apply(_))));
    assert!(fx.engine().facts().is_started());
    assert!(!fx.config.runtime.record_path.exists());

    fx.kernel.fail_appends_to("NONE");
    fx.engine().start().unwrap();
    assert!(fx.kernel.chain_exists(Family::V4, Table::Mangle, CHAIN_OUTPUT).unwrap());
    assert!(AdvisoryRecord::load(&fx.config.runtime.record_path).unwrap().is_some());
}

#[test]
fn test_reboot_leaves_stale_record() {
    let fx = Fixture::new(Mode::Global, |_| {});
    fx.engine().start().unwrap();

    // a reboot wipes the kernel but not the record
    let rebooted = Fixture {
        dir: tempfile::tempdir().unwrap(),
        config: fx.config.clone(),
        kernel: tpgate::kernel::MemoryKernel::new(),
        procs: tpgate::process::MemoryProcesses::new(),
    };
    let engine = rebooted.engine();
    assert_eq!(engine.status().state, LifecycleState::Stopped);
    assert_eq!(engine.status().resolver_pid, None);
    assert!(!engine.restart_dns().unwrap());

    engine.start().unwrap();
    assert!(rebooted.kernel.list_members("deny-v4").is_ok());
}

#[test]
fn test_ipv6_dns_reaches_a_dual_stack_resolver() {
    let fx = Fixture::new(Mode::Gfwlist, |c| {
        c.ipv4 = false;
        c.ipv6 = true;
    });
    fx.engine().start().unwrap();

    let spawns = fx.procs.spawns();
    let args = &spawns[0].args;
    let bind = args.iter().position(|a| a == "--bind-addr").map(|i| args[i + 1].as_str());
    assert_eq!(bind, Some("::"));

    let nat_output = chain_text(&fx.kernel, Family::V6, Table::Nat, CHAIN_OUTPUT);
    assert!(nat_output
        .iter()
        .any(|r| r.contains("--dport 53") && r.ends_with("REDIRECT --to-ports 60053")));
}

#[test]
fn test_ipv4_only_bind_rejected_with_ipv6() {
    let fx = Fixture::new(Mode::Chnroute, |c| {
        c.ipv6 = true;
        c.dns.bind = Some("127.0.0.1".parse().unwrap());
    });
    let err = tpgate::lifecycle::Lifecycle::new(&fx.config, &fx.kernel, &fx.procs).err().unwrap();
    assert!(matches!(err, TpgateError::Config(_)));
    assert_eq!(fx.kernel.mutations(), 0);
}
