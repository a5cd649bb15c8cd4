//! Packet classification through the installed rules

use tpgate::compiler::{Match, Proto, Table, CHAIN_DECIDE, CHAIN_OUTPUT, CHAIN_PREROUTING, CHAIN_QUIC};
use tpgate::config::PortSpec;
use tpgate::policy::{DropQuicPolicy, Family, ForwardingStrategy, Mode};

use super::support::{chain_text, local, Fixture, Origin, Packet, Verdict};

const PROXY_PORT: u16 = 60080;
const DNS_PORT: u16 = 60053;

#[test]
fn test_family_isolation_all_modes() {
    for mode in [Mode::Global, Mode::Gfwlist, Mode::Chnroute] {
        let v4_only = Fixture::new(mode, |_| {});
        v4_only.engine().start().unwrap();
        for table in Table::ALL {
            assert!(v4_only.kernel.user_chains(Family::V6, table).is_empty(), "{mode} {table}");
            assert!(!v4_only.kernel.user_chains(Family::V4, table).is_empty(), "{mode} {table}");
        }
        assert_eq!(v4_only.kernel.policy_rule_count(Family::V6), 0);

        let v6_only = Fixture::new(mode, |c| {
            c.ipv4 = false;
            c.ipv6 = true;
        });
        v6_only.engine().start().unwrap();
        for table in Table::ALL {
            assert!(v6_only.kernel.user_chains(Family::V4, table).is_empty(), "{mode} {table}");
            assert!(!v6_only.kernel.user_chains(Family::V6, table).is_empty(), "{mode} {table}");
        }
        assert_eq!(v6_only.kernel.policy_rule_count(Family::V4), 0);
    }
}

#[test]
fn test_chnroute_deny_takes_precedence() {
    let fx = Fixture::new(Mode::Chnroute, |_| {});
    fx.engine().start().unwrap();
    let walker = fx.walker();

    // 1.0.1.5 is both a national route and a deny entry
    assert_eq!(
        walker.verdict(&Packet::tcp(Origin::Lan, "1.0.1.5", 443)),
        Verdict::Tproxy(PROXY_PORT)
    );
    assert_eq!(walker.verdict(&Packet::tcp(Origin::Lan, "1.0.1.6", 443)), Verdict::Direct);
    assert_eq!(
        walker.verdict(&Packet::tcp(Origin::Lan, "8.8.4.4", 443)),
        Verdict::Tproxy(PROXY_PORT)
    );
    assert_eq!(walker.verdict(&Packet::tcp(Origin::Lan, "192.168.1.20", 22)), Verdict::Direct);
}

#[test]
fn test_global_and_gfwlist_decisions() {
    let fx = Fixture::new(Mode::Global, |_| {});
    fx.engine().start().unwrap();
    let walker = fx.walker();
    assert_eq!(
        walker.verdict(&Packet::tcp(Origin::Lan, "1.0.1.6", 80)),
        Verdict::Tproxy(PROXY_PORT)
    );
    assert_eq!(walker.verdict(&Packet::udp(Origin::Lan, "10.1.2.3", 5000)), Verdict::Direct);

    let fx = Fixture::new(Mode::Gfwlist, |_| {});
    fx.engine().start().unwrap();
    let walker = fx.walker();
    assert_eq!(walker.verdict(&Packet::tcp(Origin::Lan, "8.8.4.4", 443)), Verdict::Direct);
    assert_eq!(
        walker.verdict(&Packet::udp(Origin::Lan, "203.0.113.7", 443)),
        Verdict::Tproxy(PROXY_PORT)
    );
}

#[test]
fn test_gfwlist_owner_exemption_local_only() {
    let fx = Fixture::new(Mode::Gfwlist, |c| c.proxy_other = false);
    fx.engine().start().unwrap();
    let walker = fx.walker();

    let from_proxy = Packet::tcp(local("proxy"), "203.0.113.10", 443);
    assert_eq!(walker.verdict(&from_proxy), Verdict::Direct);

    let from_user = Packet::tcp(local("users"), "203.0.113.10", 443);
    assert_eq!(walker.verdict(&from_user), Verdict::Tproxy(PROXY_PORT));

    let from_lan = Packet::tcp(Origin::Lan, "203.0.113.10", 443);
    assert_eq!(walker.verdict(&from_lan), Verdict::Direct);
}

#[test]
fn test_udp_path_identical_across_strategies() {
    let udp_rules = |strategy: ForwardingStrategy| {
        let fx = Fixture::new(Mode::Chnroute, |c| {
            c.strategy = strategy;
            c.ipv6 = true;
        });
        fx.engine().start().unwrap();

        let mut rules = Vec::new();
        for family in Family::ALL {
            for chain in [CHAIN_OUTPUT, CHAIN_PREROUTING] {
                let installed = fx.kernel.rules(family, Table::Mangle, chain).unwrap_or_default();
                rules.extend(
                    installed
                        .iter()
                        .filter(|r| r.protocol() == Some(Proto::Udp) && !r.matches.contains(&Match::DstPort(53)))
                        .map(ToString::to_string),
                );
            }
            rules.extend(chain_text(&fx.kernel, family, Table::Mangle, CHAIN_DECIDE));
        }
        let verdict = fx.walker().verdict(&Packet::udp(Origin::Lan, "8.8.4.4", 443));
        (rules, verdict)
    };

    let (tproxy_rules, tproxy_verdict) = udp_rules(ForwardingStrategy::Tproxy);
    let (redirect_rules, redirect_verdict) = udp_rules(ForwardingStrategy::Redirect);
    assert!(!tproxy_rules.is_empty());
    assert_eq!(tproxy_rules, redirect_rules);
    assert_eq!(tproxy_verdict, Verdict::Tproxy(PROXY_PORT));
    assert_eq!(tproxy_verdict, redirect_verdict);
}

#[test]
fn test_redirect_strategy_nats_tcp() {
    let fx = Fixture::new(Mode::Chnroute, |c| {
        c.strategy = ForwardingStrategy::Redirect;
        c.ipv6 = true;
    });
    fx.engine().start().unwrap();
    let walker = fx.walker();

    assert_eq!(walker.verdict(&Packet::tcp(Origin::Lan, "8.8.4.4", 80)), Verdict::Nat(PROXY_PORT));
    assert_eq!(
        walker.verdict(&Packet::tcp(local("users"), "2001:db8:dead::1", 443)),
        Verdict::Nat(PROXY_PORT)
    );
    assert_eq!(walker.verdict(&Packet::tcp(Origin::Lan, "240e::1", 443)), Verdict::Direct);
}

#[test]
fn test_drop_quic_tcp_only() {
    let fx = Fixture::new(Mode::Chnroute, |c| {
        c.drop_quic = DropQuicPolicy::TcpOnly;
        c.udp = false;
    });
    fx.engine().start().unwrap();
    let walker = fx.walker();
    assert_eq!(walker.verdict(&Packet::udp(Origin::Lan, "8.8.4.4", 443)), Verdict::Dropped);
    assert_eq!(walker.verdict(&Packet::udp(local("users"), "8.8.4.4", 443)), Verdict::Dropped);
    // national destinations keep working over QUIC
    assert_eq!(walker.verdict(&Packet::udp(Origin::Lan, "1.0.1.6", 443)), Verdict::Direct);
    assert_eq!(walker.verdict(&Packet::udp(Origin::Lan, "8.8.4.4", 8443)), Verdict::Direct);

    let fx = Fixture::new(Mode::Chnroute, |c| {
        c.drop_quic = DropQuicPolicy::TcpOnly;
        c.udp = true;
    });
    fx.engine().start().unwrap();
    assert!(fx.kernel.rules(Family::V4, Table::Mangle, CHAIN_QUIC).is_none());
    assert_eq!(
        fx.walker().verdict(&Packet::udp(Origin::Lan, "8.8.4.4", 443)),
        Verdict::Tproxy(PROXY_PORT)
    );
}

#[test]
fn test_dns_redirect_and_resolver_exemption() {
    let fx = Fixture::new(Mode::Chnroute, |_| {});
    fx.engine().start().unwrap();
    let walker = fx.walker();

    assert_eq!(walker.verdict(&Packet::udp(Origin::Lan, "192.168.1.1", 53)), Verdict::Nat(DNS_PORT));
    assert_eq!(walker.verdict(&Packet::udp(local("users"), "1.0.1.6", 53)), Verdict::Nat(DNS_PORT));

    // the resolver's own queries to the remote upstream go through the proxy
    assert_eq!(
        walker.verdict(&Packet::tcp(local("proxy_dns"), "8.8.8.8", 53)),
        Verdict::Tproxy(PROXY_PORT)
    );
    // and to the direct upstream they do not
    assert_eq!(walker.verdict(&Packet::udp(local("proxy_dns"), "223.5.5.5", 53)), Verdict::Direct);
}

#[test]
fn test_dst_ports_limit_interception() {
    let fx = Fixture::new(Mode::Global, |c| {
        c.dst_ports = vec![PortSpec::Single(80), PortSpec::Range(443, 444)];
    });
    fx.engine().start().unwrap();
    let walker = fx.walker();
    assert_eq!(walker.verdict(&Packet::tcp(Origin::Lan, "8.8.4.4", 444)), Verdict::Tproxy(PROXY_PORT));
    assert_eq!(walker.verdict(&Packet::tcp(Origin::Lan, "8.8.4.4", 22)), Verdict::Direct);
}
