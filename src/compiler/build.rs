//! Policy → rule plan

use std::net::IpAddr;

use super::plan::{FamilyPlan, RulePlan, TablePlan};
use super::rule::{CtDir, CtState, Hook, Match, Proto, Rule, Table, Target};
use super::{
    CHAIN_DECIDE, CHAIN_FAILSAFE, CHAIN_FAILSAFE_POST, CHAIN_OUTPUT, CHAIN_POSTROUTING,
    CHAIN_PREROUTING, CHAIN_QUIC,
};
use crate::policy::{Family, Mode, Policy};
use crate::sets::{set_name, SetKind};

const DNS_PORT: u16 = 53;
const QUIC_PORT: u16 = 443;

/// Mode logic shared by every decision chain. `proxy` is whatever
/// "send to the proxy" means in the calling chain.
fn decide(mode: Mode, family: Family, proxy: &Target) -> Vec<Rule> {
    let allow = set_name(SetKind::Allow, family);
    let deny = set_name(SetKind::Deny, family);
    let to_proxy = || Rule::to(proxy.clone());

    match mode {
        Mode::Global => vec![
            Rule::to(Target::Return).dst_set(allow, false),
            to_proxy(),
        ],
        Mode::Gfwlist => vec![to_proxy().dst_set(deny, false)],
        // deny is checked first so an address in both sets is proxied
        Mode::Chnroute => vec![
            to_proxy().dst_set(deny, false),
            Rule::to(Target::Return).dst_set(allow, false),
            to_proxy(),
        ],
    }
}

/// Send-to-local for nat rules. IPv6 cannot DNAT LAN traffic to ::1, so
/// REDIRECT (the ingress address) is used there.
fn nat_to_local(family: Family, port: u16) -> Target {
    match family {
        Family::V4 => Target::Dnat {
            addr: family.loopback(),
            port,
        },
        Family::V6 => Target::Redirect { port },
    }
}

fn local_dst() -> Match {
    Match::DstLocal { negate: false }
}

fn new_or_related() -> Match {
    Match::CtState {
        states: vec![CtState::New, CtState::Related],
        negate: false,
    }
}

struct FamilyCompiler<'a> {
    policy: &'a Policy,
    family: Family,
}

impl FamilyCompiler<'_> {
    /// Exempt DNS that the nat table redirects to the resolver.
    fn dns_exemptions(&self, exempt_resolver: bool) -> Vec<Rule> {
        [Proto::Udp, Proto::Tcp]
            .into_iter()
            .map(|proto| {
                let rule = Rule::to(Target::Return).proto(proto).dport(DNS_PORT);
                if exempt_resolver {
                    rule.owner(&self.policy.dns_group, true)
                } else {
                    rule
                }
            })
            .collect()
    }

    /// QUIC jump plus the TCP/UDP decision jumps.
    fn classification_jumps(&self) -> Vec<Rule> {
        let p = self.policy;
        let mut rules = Vec::new();

        if p.drops_quic() {
            rules.push(
                Rule::jump(CHAIN_QUIC)
                    .proto(Proto::Udp)
                    .dport(QUIC_PORT)
                    .with(new_or_related()),
            );
        }
        if p.tcp_via_tproxy() {
            rules.push(
                Rule::jump(CHAIN_DECIDE)
                    .proto(Proto::Tcp)
                    .with(Match::TcpSyn)
                    .dports(&p.dst_ports),
            );
        }
        if p.udp {
            rules.push(
                Rule::jump(CHAIN_DECIDE)
                    .proto(Proto::Udp)
                    .with(new_or_related())
                    .dports(&p.dst_ports),
            );
        }
        rules
    }

    fn mangle(&self) -> TablePlan {
        let p = self.policy;
        let mut table = TablePlan::new(Table::Mangle);
        if !p.uses_mark_path() && !p.drops_quic() {
            return table;
        }

        let reply = Rule::to(Target::Return).with(Match::CtDirection(CtDir::Reply));
        let restore_mark = Rule::to(Target::SetMark(p.mark)).with(Match::ConnMark(p.mark));

        table.chain(
            CHAIN_DECIDE,
            if p.uses_mark_path() {
                decide(p.mode, self.family, &Target::SetConnMark(p.mark))
            } else {
                Vec::new()
            },
        );
        table.chain(
            CHAIN_QUIC,
            if p.drops_quic() {
                decide(p.mode, self.family, &Target::Drop)
            } else {
                Vec::new()
            },
        );

        let mut output = vec![
            Rule::to(Target::Return).with(local_dst()),
            reply.clone(),
            Rule::to(Target::Return).owner(&p.proxy_group, false),
        ];
        output.extend(self.dns_exemptions(true));
        output.extend(self.classification_jumps());
        if p.uses_mark_path() {
            output.push(restore_mark.clone());
        }
        table.chain(CHAIN_OUTPUT, output);

        let mut prerouting = vec![Rule::to(Target::Return).with(local_dst()), reply];
        if p.proxy_other {
            // rerouted local traffic arrives already marked and must not
            // hit the LAN DNS exemption
            if p.uses_mark_path() {
                prerouting.extend(self.deliveries());
            }
            prerouting.extend(self.dns_exemptions(false));
            prerouting.extend(self.classification_jumps());
        }
        if p.uses_mark_path() {
            prerouting.push(restore_mark);
            prerouting.extend(self.deliveries());
        }
        table.chain(CHAIN_PREROUTING, prerouting);

        table.link(Hook::Prerouting, CHAIN_PREROUTING);
        table.link(Hook::Output, CHAIN_OUTPUT);
        table
    }

    /// TPROXY of marked packets to the proxy listeners
    fn deliveries(&self) -> Vec<Rule> {
        let p = self.policy;
        let loopback = self.family.loopback();
        let mut rules = Vec::new();
        if p.tcp_via_tproxy() {
            rules.push(self.tproxy(Proto::Tcp, loopback, p.proxy_tcp_port));
        }
        if p.udp {
            rules.push(self.tproxy(Proto::Udp, loopback, p.proxy_udp_port));
        }
        rules
    }

    fn tproxy(&self, proto: Proto, addr: IpAddr, port: u16) -> Rule {
        let mark = self.policy.mark;
        Rule::to(Target::Tproxy { addr, port, mark })
            .proto(proto)
            .with(Match::Mark(mark))
    }

    fn dns_redirects(&self, exclude_resolver: bool) -> Vec<Rule> {
        let target = nat_to_local(self.family, self.policy.dns_port);
        [Proto::Udp, Proto::Tcp]
            .into_iter()
            .map(|proto| {
                let rule = Rule::to(target.clone()).proto(proto).dport(DNS_PORT);
                if exclude_resolver {
                    rule.owner(&self.policy.dns_group, true)
                } else {
                    rule
                }
            })
            .collect()
    }

    fn nat(&self) -> TablePlan {
        let p = self.policy;
        let family = self.family;
        let mut table = TablePlan::new(Table::Nat);

        let syn_to_decide = || {
            Rule::jump(CHAIN_DECIDE)
                .proto(Proto::Tcp)
                .with(Match::TcpSyn)
                .dports(&p.dst_ports)
        };

        table.chain(
            CHAIN_DECIDE,
            if p.tcp_via_redirect() {
                decide(p.mode, family, &nat_to_local(family, p.proxy_tcp_port))
            } else {
                Vec::new()
            },
        );

        let mut output = vec![
            Rule::to(Target::Return).with(local_dst()),
            Rule::to(Target::Return).owner(&p.proxy_group, false),
        ];
        output.extend(self.dns_redirects(true));
        if p.tcp_via_redirect() {
            output.push(syn_to_decide());
        }
        table.chain(CHAIN_OUTPUT, output);

        let mut prerouting = Vec::new();
        if p.proxy_other {
            prerouting.extend(self.dns_redirects(false));
            prerouting.push(Rule::to(Target::Return).with(local_dst()));
            if p.tcp_via_redirect() {
                prerouting.push(syn_to_decide());
            }
        }
        table.chain(CHAIN_PREROUTING, prerouting);

        let loopback = family.loopback();
        let mut postrouting = vec![Rule::to(Target::Snat { addr: loopback })
            .with(Match::Dst {
                addr: loopback,
                negate: false,
            })
            .with(Match::Src {
                addr: loopback,
                negate: true,
            })];
        if p.masquerade(family) {
            postrouting.extend(masquerade_rules());
        }
        table.chain(CHAIN_POSTROUTING, postrouting);

        table.link(Hook::Prerouting, CHAIN_PREROUTING);
        table.link(Hook::Output, CHAIN_OUTPUT);
        table.link(Hook::Postrouting, CHAIN_POSTROUTING);
        table
    }
}

/// Source NAT for forwarded LAN traffic that is not already NATed.
fn masquerade_rules() -> Vec<Rule> {
    vec![
        Rule::to(Target::Return).with(Match::SrcLocal { negate: false }),
        Rule::to(Target::Return).with(Match::CtState {
            states: vec![CtState::Snat, CtState::Dnat],
            negate: false,
        }),
        Rule::to(Target::Masquerade),
    ]
}

/// Compile the running rule set for every enabled family. Pure.
#[must_use]
pub fn compile(policy: &Policy) -> RulePlan {
    let mut plan = RulePlan {
        families: policy
            .families
            .iter()
            .map(|&family| {
                let compiler = FamilyCompiler { policy, family };
                FamilyPlan {
                    family,
                    tables: vec![compiler.mangle(), compiler.nat()],
                }
            })
            .collect(),
    };
    plan.prune();
    plan
}

/// Compile the fail-safe rule set installed while stopped: LAN DNS goes to
/// the configured direct resolver, masquerade stays on if configured.
#[must_use]
pub fn compile_failsafe(policy: &Policy) -> RulePlan {
    let mut plan = RulePlan {
        families: policy
            .families
            .iter()
            .map(|&family| {
                let mut table = TablePlan::new(Table::Nat);

                let dns = policy.failsafe_dns_for(family).map_or_else(Vec::new, |addr| {
                    [Proto::Udp, Proto::Tcp]
                        .into_iter()
                        .map(|proto| {
                            Rule::to(Target::Dnat { addr, port: DNS_PORT })
                                .proto(proto)
                                .dport(DNS_PORT)
                        })
                        .collect()
                });
                table.chain(CHAIN_FAILSAFE, dns);
                table.chain(
                    CHAIN_FAILSAFE_POST,
                    if policy.masquerade(family) {
                        masquerade_rules()
                    } else {
                        Vec::new()
                    },
                );
                table.link(Hook::Prerouting, CHAIN_FAILSAFE);
                table.link(Hook::Postrouting, CHAIN_FAILSAFE_POST);

                FamilyPlan {
                    family,
                    tables: vec![table],
                }
            })
            .collect(),
    };
    plan.prune();
    plan
}
