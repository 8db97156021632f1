// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Eroute-driven decisions: shunts, traps, holds, and the key
//! management bypass.

use common::verify;
use common::*;
use klips_test_utils as common;
use smoltcp::wire::Icmpv4Message;

fn local_cfg() -> TunnelCfg {
    TunnelCfg { local_addrs: vec![ip("10.0.0.5")], ..Default::default() }
}

fn refusing_tunnel() -> Tunnel {
    Tunnel::new(
        TunnelCfg::default(),
        Arc::new(ExecCtx { log: Box::new(PrintlnLog) }),
        Arc::new(SaStore::default()),
        Arc::new(Eroutes::default()),
        Arc::new(NoKeyMgmt),
        Arc::new(RecordingIcmp::default()),
    )
    .unwrap()
}

fn host_sel(src: &str, dst: &str, proto: u8, sport: u16, dport: u16) -> Selector {
    Selector::new(AddrSpec::host(ip(src)), AddrSpec::host(ip(dst)))
        .with_proto(proto)
        .with_ports(sport, dport)
}

#[test]
fn ike_bypasses_drop_eroute() {
    let t = TestTunnel::new(local_cfg());
    t.add_eroute("10.0.0.0/24", "10.0.0.1/32", SaId::shunt(Shunt::Drop));

    for sport in [500, 4500] {
        let pkt = udp4("10.0.0.5", "10.0.0.1", sport, 500, b"ike");
        let orig = pkt.data().to_vec();
        match t.xmit(pkt) {
            ProcessResult::Bypass(out) => assert_eq!(out.data(), &orig[..]),
            res => panic!("expected bypass, got {res:?}"),
        }
    }

    // Not from a local address, and not from a key-management port.
    assert_drop!(
        t.xmit(udp4("10.0.0.6", "10.0.0.1", 500, 500, b"ike")),
        DropReason::Policy(PolicyDrop::Drop)
    );
    assert_drop!(
        t.xmit(udp4("10.0.0.5", "10.0.0.1", 501, 500, b"ike")),
        DropReason::Policy(PolicyDrop::Drop)
    );

    let stats = t.tunnel.stats();
    assert_eq!(stats.out_pkts, 4);
    assert_eq!(stats.out_bypass, 2);
    assert_eq!(stats.out_drop_shunt, 2);

    // The bypass never counts as a match.
    assert_eq!(t.eroutes().dump().entries[0].count, 2);
}

#[test]
fn ike_to_other_gateway_is_tunneled() {
    let t = TestTunnel::new(local_cfg());
    let gw = SaId::new(SaProto::Esp, 0x1001, ip("192.168.0.1"));
    t.add_eroute("10.0.0.0/24", "10.0.0.1/32", gw);

    // Bound for a tunnel to someone else, so it takes the normal path
    // and finds no SA.
    assert_drop!(
        t.xmit(udp4("10.0.0.5", "10.0.0.1", 500, 500, b"ike")),
        DropReason::Error(XmitError::LookupMiss(said)) if said == gw
    );
    assert_eq!(t.tunnel.stats().out_err_lookup_miss, 1);
}

#[test]
fn pass_and_unknown_shunts() {
    let t = TestTunnel::default();
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", SaId::shunt(Shunt::Pass));
    t.add_eroute(
        "10.0.0.0/24",
        "10.0.9.0/24",
        SaId::new(SaProto::Int, 0x7777, Ipv4Addr::ANY_ADDR),
    );

    let pkt = tcp4("10.0.0.5", "10.0.1.7", 1234, 80, b"clear");
    let orig = pkt.data().to_vec();
    match t.xmit(pkt) {
        ProcessResult::Bypass(out) => assert_eq!(out.data(), &orig[..]),
        res => panic!("expected bypass, got {res:?}"),
    }

    assert_drop!(
        t.xmit(tcp4("10.0.0.5", "10.0.9.7", 1234, 80, b"odd")),
        DropReason::Policy(PolicyDrop::UnknownShunt(0x7777))
    );
    assert_eq!(t.tunnel.stats().out_drop_unknown_shunt, 1);
}

#[test]
fn trap_sends_one_acquire_and_holds_latest() {
    let t = TestTunnel::default();
    let west = Identity { kind: 2, id: "@west".into() };
    t.eroutes()
        .add(
            Eroute::new(
                sel("10.0.0.0/24", "10.0.1.0/24"),
                SaId::shunt(Shunt::Trap),
            )
            .with_pid(4242)
            .with_idents(Some(west.clone()), None),
        )
        .unwrap();

    let first = tcp4("10.0.0.5", "10.0.1.7", 1234, 80, b"first");
    let first_bytes = first.data().to_vec();
    assert_drop!(t.xmit(first), DropReason::Policy(PolicyDrop::Trap));

    let (acquires, expires) = t.drain_notices();
    assert!(expires.is_empty());
    assert_eq!(acquires.len(), 1);
    let tmpl = &acquires[0];
    assert_eq!(
        tmpl.flow,
        FlowId {
            src: ip("10.0.0.5"),
            dst: ip("10.0.1.7"),
            proto: PROTO_TCP,
            sport: 1234,
            dport: 80,
        }
    );
    assert_eq!(tmpl.pid, 4242);
    assert_eq!(tmpl.ident_s, Some(west));

    let hold = host_sel("10.0.0.5", "10.0.1.7", PROTO_TCP, 1234, 80);
    assert_eq!(t.eroutes().retained_copy(&hold), Some(first_bytes));

    // The rest of the flow waits behind the hold, and only the newest
    // packet is kept.
    let second = tcp4("10.0.0.5", "10.0.1.7", 1234, 80, b"second");
    let second_bytes = second.data().to_vec();
    assert_drop!(t.xmit(second), DropReason::Policy(PolicyDrop::Hold));
    assert!(t.drain_notices().0.is_empty());
    assert_eq!(t.eroutes().retained_copy(&hold), Some(second_bytes));

    let dump = t.eroutes().dump();
    assert_eq!(dump.entries.len(), 2);
    let held = dump.entries.iter().find(|e| e.sel == hold).unwrap();
    assert_eq!(held.said, SaId::shunt(Shunt::Hold));
    assert_eq!(held.pid, 4242);
    assert!(held.retained);

    let stats = t.tunnel.stats();
    assert_eq!(stats.acquire_sent, 1);
    assert_eq!(stats.out_drop_trap, 1);
    assert_eq!(stats.out_drop_hold, 1);
}

#[test]
fn trap_subnet_turns_into_hold() {
    let t = TestTunnel::default();
    let subnet = sel("10.0.0.0/24", "10.0.1.0/24");
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", SaId::shunt(Shunt::TrapSubnet));

    assert_drop!(
        t.xmit(tcp4("10.0.0.5", "10.0.1.7", 1234, 80, b"one")),
        DropReason::Policy(PolicyDrop::Trap)
    );
    assert_eq!(t.drain_notices().0.len(), 1);

    let dump = t.eroutes().dump();
    assert_eq!(dump.entries.len(), 1);
    assert_eq!(dump.entries[0].said, SaId::shunt(Shunt::Hold));

    // Any other host in the subnet now waits on the same negotiation.
    let other = tcp4("10.0.0.9", "10.0.1.3", 999, 22, b"two");
    let other_bytes = other.data().to_vec();
    assert_drop!(t.xmit(other), DropReason::Policy(PolicyDrop::Hold));
    assert!(t.drain_notices().0.is_empty());
    assert_eq!(t.eroutes().retained_copy(&subnet), Some(other_bytes));
}

#[test]
fn refused_acquire_rolls_back() {
    let t = refusing_tunnel();
    let trap = sel("10.0.0.0/24", "10.0.1.0/24");
    let trap_subnet = sel("10.0.0.0/24", "10.0.2.0/24");
    t.eroutes().add(Eroute::new(trap, SaId::shunt(Shunt::Trap))).unwrap();
    t.eroutes()
        .add(Eroute::new(trap_subnet, SaId::shunt(Shunt::TrapSubnet)))
        .unwrap();

    assert_drop!(
        t.xmit(tcp4("10.0.0.5", "10.0.1.7", 1234, 80, b"a")),
        DropReason::Policy(PolicyDrop::Trap)
    );
    assert_drop!(
        t.xmit(tcp4("10.0.0.5", "10.0.2.7", 1234, 80, b"b")),
        DropReason::Policy(PolicyDrop::Trap)
    );

    // No hold is left behind, and the subnet trap is armed again.
    let dump = t.eroutes().dump();
    assert_eq!(dump.entries.len(), 2);
    let sub = dump.entries.iter().find(|e| e.sel == trap_subnet).unwrap();
    assert_eq!(sub.said, SaId::shunt(Shunt::TrapSubnet));
    assert!(!sub.retained);
    assert_eq!(t.eroutes().retained_copy(&trap), None);

    let stats = t.stats();
    assert_eq!(stats.acquire_failed, 2);
    assert_eq!(stats.acquire_sent, 0);
}

#[test]
fn reject_signals_source() {
    let t = TestTunnel::default();
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", SaId::shunt(Shunt::Reject));

    let pkt = tcp4("10.0.0.5", "10.0.1.7", 1234, 80, b"knock");
    let orig = pkt.data().to_vec();
    assert_drop!(t.xmit(pkt), DropReason::Policy(PolicyDrop::Reject));

    let sent = t.icmp.take();
    assert_eq!(sent.len(), 1);
    let msg = verify::icmp(sent[0].data());
    assert_eq!(msg.msg, Icmpv4Message::DstUnreachable);
    assert_eq!(msg.code, 13);
    assert_eq!(msg.ip.dst, ip("10.0.0.5"));
    assert_eq!(msg.ip.src, ip("10.0.1.7"));
    assert_eq!(&msg.quote[..], &orig[..IPV4_HDR_LEN + 8]);
    assert_eq!(t.tunnel.stats().icmp_sent, 1);
}

#[test]
fn reject_never_answers_errors_or_fragments() {
    let t = TestTunnel::default();
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", SaId::shunt(Shunt::Reject));

    // A port unreachable on its way back to a remote host.
    let mut unreach = vec![3u8, 3, 0, 0, 0, 0, 0, 0];
    unreach.extend_from_slice(tcp4("10.0.1.7", "10.0.0.5", 80, 1234, b"").data());
    let pkt = ipv4("10.0.0.5", "10.0.1.7", PROTO_ICMP, &unreach);
    assert_drop!(t.xmit(pkt), DropReason::Policy(PolicyDrop::Reject));

    // The tail of a fragmented datagram.
    let mut pkt = udp4("10.0.0.5", "10.0.1.7", 5000, 5000, &[0u8; 64]);
    {
        let hdr = Ipv4HdrRaw::parse_mut(pkt.data_mut()).unwrap();
        hdr.frag_and_flags = 185u16.to_be_bytes();
        hdr.fill_csum();
    }
    assert_drop!(t.xmit(pkt), DropReason::Policy(PolicyDrop::Reject));

    assert!(t.icmp.take().is_empty());
    let stats = t.tunnel.stats();
    assert_eq!(stats.icmp_sent, 0);
    assert_eq!(stats.icmp_suppressed, 2);
    assert_eq!(stats.out_drop_reject, 2);

    // An echo request still gets its answer.
    let echo = ipv4("10.0.0.5", "10.0.1.7", PROTO_ICMP, &[8, 0, 0, 0, 0, 1, 0, 1]);
    assert_drop!(t.xmit(echo), DropReason::Policy(PolicyDrop::Reject));
    assert_eq!(t.icmp.take().len(), 1);
}

#[test]
fn drops_without_eroute_or_ttl() {
    let t = TestTunnel::default();
    assert_drop!(
        t.xmit(tcp4("10.0.0.5", "10.0.1.7", 1, 2, b"")),
        DropReason::Policy(PolicyDrop::NoEroute)
    );
    assert!(t.icmp.take().is_empty());

    let mut pkt = tcp4("10.0.0.5", "10.0.1.7", 1, 2, b"");
    {
        let hdr = Ipv4HdrRaw::parse_mut(pkt.data_mut()).unwrap();
        hdr.ttl = 0;
        hdr.fill_csum();
    }
    assert_drop!(t.xmit(pkt), DropReason::Policy(PolicyDrop::TtlExpired));

    let sent = t.icmp.take();
    assert_eq!(sent.len(), 1);
    let msg = verify::icmp(sent[0].data());
    assert_eq!(msg.msg, Icmpv4Message::TimeExceeded);
    assert_eq!(msg.code, 0);

    let stats = t.tunnel.stats();
    assert_eq!(stats.out_drop_no_eroute, 1);
    assert_eq!(stats.out_drop_ttl, 1);
    assert_eq!(stats.out_drop, 2);
}

#[test]
fn link_padding_is_trimmed() {
    let t = TestTunnel::default();
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", SaId::shunt(Shunt::Pass));

    let pkt = tcp4("10.0.0.5", "10.0.1.7", 1234, 80, b"");
    let mut padded = pkt.data().to_vec();
    let orig = padded.clone();
    padded.extend_from_slice(&[0u8; 6]);

    match t.xmit(Packet::new(padded)) {
        ProcessResult::Bypass(out) => assert_eq!(out.data(), &orig[..]),
        res => panic!("expected bypass, got {res:?}"),
    }
}
