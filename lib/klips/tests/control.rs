// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The control side: keys, teardown, configuration and dumps, and
//! traffic running alongside all of it.

use common::alg::TRACE_CIPHER_ID;
use common::alg::TraceCipher;
use common::*;
use itertools::iproduct;
use klips::engine::alg::ESP_NULL;
use klips::engine::alg::RegistryError;
use klips::engine::sa::SaError;
use klips::print::print_eroutes_into;
use klips::print::print_kstats_into;
use klips::print::print_sas_into;
use klips_test_utils as common;
use std::thread;

const TRACE_KEY: [u8; 8] = [0xA5, 1, 2, 3, 4, 5, 6, 7];

fn gw() -> Ipv4Addr {
    ip("192.168.0.1")
}

fn trace_tunnel() -> (TestTunnel, Arc<TraceCipher>, SaId) {
    let t = TestTunnel::default();
    let cipher = Arc::new(TraceCipher::default());
    t.algs.register(cipher.clone()).unwrap();

    let said = SaId::new(SaProto::Esp, 0x1001, gw());
    let enc = t.algs.bind(AlgType::Encrypt, TRACE_CIPHER_ID, &TRACE_KEY).unwrap();
    t.add_sa(mature(Sa::new(said, Direction::Out).with_enc(enc)));
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", said);
    (t, cipher, said)
}

fn render<F>(f: F) -> String
where
    F: FnOnce(&mut Vec<u8>) -> std::io::Result<()>,
{
    let mut buf = vec![];
    f(&mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}

#[test]
fn delete_scrubs_key_through_provider() {
    let (t, cipher, said) = trace_tunnel();
    expect_modified!(t.xmit(tcp4("10.0.0.5", "10.0.1.7", 1, 2, b"x")));
    assert!(cipher.destroyed().is_empty());

    t.sas().delete(&said).unwrap();
    assert!(t.sas().lookup(&said).is_none());
    assert_eq!(t.sas().stats().wipes, 1);

    // Wiping and then dropping the SA reaches the hook exactly once,
    // with the live key.
    let recs = cipher.destroyed();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].key, TRACE_KEY.to_vec());
    assert!(recs[0].zeroed);

    assert_drop!(
        t.xmit(tcp4("10.0.0.5", "10.0.1.7", 1, 2, b"x")),
        DropReason::Error(XmitError::LookupMiss(_))
    );
}

#[test]
fn expiry_teardown_scrubs_keys() {
    let (t, cipher, said) = trace_tunnel();
    t.sas()
        .with_sa(&said, |sa| sa.life.packets.update_hard(1))
        .unwrap();

    expect_modified!(t.xmit(tcp4("10.0.0.5", "10.0.1.7", 1, 2, b"x")));
    assert_drop!(
        t.xmit(tcp4("10.0.0.5", "10.0.1.7", 1, 2, b"x")),
        DropReason::Error(XmitError::LifetimeHardExpired { .. })
    );

    let recs = cipher.destroyed();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].key, TRACE_KEY.to_vec());
    assert!(recs[0].zeroed);
    assert_eq!(t.sas().stats().wipes, 1);
}

#[test]
fn provider_cannot_leave_while_bound() {
    let (t, cipher, said) = trace_tunnel();
    assert!(matches!(
        t.algs.unregister(AlgType::Encrypt, TRACE_CIPHER_ID),
        Err(RegistryError::InUse { name: "trace", .. })
    ));

    t.sas().delete(&said).unwrap();
    drop(cipher);
    t.algs.unregister(AlgType::Encrypt, TRACE_CIPHER_ID).unwrap();
    assert!(t.algs.lookup(AlgType::Encrypt, TRACE_CIPHER_ID).is_none());
}

#[test]
fn bundles_go_as_a_unit() {
    let t = TestTunnel::default();
    let tun = SaId::new(SaProto::Ipip, 0x1002, gw());
    let esp = SaId::new(SaProto::Esp, 0x1001, gw());
    let ah = SaId::new(SaProto::Ah, 0x1003, ip("192.168.0.9"));
    let enc = t.algs.bind(AlgType::Encrypt, ESP_NULL, &[]).unwrap();
    t.add_sa(mature(Sa::new(tun, Direction::Out)));
    t.add_sa(mature(Sa::new(esp, Direction::Out).with_enc(enc)));
    t.add_sa(mature(Sa::new(ah, Direction::Out)));
    t.bundle(&[tun, esp]);

    assert_eq!(t.sas().delete(&esp), Err(SaError::StillLinked(esp)));
    assert!(matches!(
        t.sas().link(&ah, &esp),
        Err(SaError::AlreadyLinked(s)) if s == esp
    ));
    assert!(matches!(t.sas().link(&esp, &tun), Err(SaError::AlreadyLinked(_))));

    // Tearing down from the tail takes the head with it.
    let td = t.sas().delete_chain(&esp).unwrap();
    assert_eq!(td.removed.len(), 2);
    assert!(td.errors.is_empty());
    assert!(t.sas().lookup(&tun).is_none());
    assert!(t.sas().lookup(&ah).is_some());

    let td = t.sas().cleanup(Some(SaProto::Ah));
    assert_eq!(td.removed, vec![ah]);
    assert_eq!(t.sas().dump(T0).entries.len(), 0);
}

#[test]
fn lifetimes_never_cross() {
    for (kind, (soft, hard), first_soft) in iproduct!(
        LifeKind::ALL,
        [(0, 0), (10, 100), (100, 10), (50, 50), (0, 7), (7, 0)],
        [true, false]
    ) {
        let said = SaId::new(SaProto::Esp, 1, gw());
        let mut sa = Sa::new(said, Direction::Out);
        let lt = sa.life.get_mut(kind);
        if first_soft {
            lt.update_soft(soft);
            lt.update_hard(hard);
        } else {
            lt.update_hard(hard);
            lt.update_soft(soft);
        }

        let lt = sa.life.get(kind);
        if lt.hard() != 0 && lt.soft() != 0 {
            assert!(
                lt.soft() <= lt.hard(),
                "{kind:?} soft {} above hard {}",
                lt.soft(),
                lt.hard()
            );
        }
        if hard != 0 {
            assert_eq!(lt.hard(), hard);
        }
    }
}

#[test]
fn dumps_render() {
    let t = TestTunnel::default();
    let esp = SaId::new(SaProto::Esp, 0x1001, gw());
    let enc = t.algs.bind(AlgType::Encrypt, ESP_NULL, &[]).unwrap();
    t.add_sa(mature(
        Sa::new(esp, Direction::Out)
            .with_enc(enc)
            .with_replay_window(32)
            .with_lifetime(LifeKind::Bytes, 900, 1000),
    ));
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", esp);
    t.add_eroute("10.0.0.0/24", "10.0.2.0/24", SaId::shunt(Shunt::Trap));

    expect_modified!(t.xmit(ipv4("10.0.0.5", "10.0.1.7", 253, &[0; 21])));
    let _ = t.xmit(ipv4("10.0.0.5", "10.0.2.7", 253, &[]));

    let eroutes = render(|w| print_eroutes_into(w, &t.eroutes().dump()));
    assert!(eroutes.starts_with("Eroutes (3/8192)"));
    assert!(eroutes.contains("=> esp0x1001@192.168.0.1"));
    assert!(eroutes.contains("=> %trap"));
    assert!(eroutes.contains("=> %hold"));
    assert!(eroutes.contains("held"));

    let sas = render(|w| print_sas_into(w, &t.sas().dump(T0)));
    let row = sas.lines().find(|l| l.starts_with("esp0x1001")).unwrap();
    assert!(row.contains("mature"));
    assert!(row.contains("1/32"));
    assert!(row.contains("null"));
    assert!(row.contains("bytes(41,900,1000)"));

    let stats = render(|w| {
        print_kstats_into(w, t.tunnel.name(), &t.tunnel.kstats().pairs())
    });
    assert!(stats.contains("Stats ipsec0"));
    assert!(stats.contains("out_modified"));
    assert!(stats.contains("acquire_sent"));
    assert!(!stats.contains("out_err"));
}

#[test]
fn config_file_drives_tunnel() {
    let cfg = TunnelCfg::from_toml(
        r#"
        name = "ipsec1"
        mtu = 1400
        key_mgmt_ports = [500]
        local_addrs = ["10.0.0.5"]
        "#,
    )
    .unwrap();
    let t = TestTunnel::new(cfg);
    assert_eq!(t.tunnel.name(), "ipsec1");
    assert_eq!(t.tunnel.mtu(), 1400);
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", SaId::shunt(Shunt::Drop));

    assert!(matches!(
        t.xmit(udp4("10.0.0.5", "10.0.1.7", 500, 500, b"")),
        ProcessResult::Bypass(_)
    ));
    assert_drop!(
        t.xmit(udp4("10.0.0.5", "10.0.1.7", 4500, 4500, b"")),
        DropReason::Policy(PolicyDrop::Drop)
    );
}

#[test]
fn concurrent_senders_and_control() {
    let t = Arc::new(TestTunnel::default());
    let said = SaId::new(SaProto::Esp, 0x1001, gw());
    let enc = t.algs.bind(AlgType::Encrypt, ESP_NULL, &[]).unwrap();
    t.add_sa(mature(Sa::new(said, Direction::Out).with_enc(enc)));
    t.add_eroute("10.0.0.0/24", "10.0.1.0/24", said);

    const SENDERS: u16 = 4;
    const PER_SENDER: usize = 100;

    let senders: Vec<_> = (0..SENDERS)
        .map(|n| {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                let mut seqs = vec![];
                for _ in 0..PER_SENDER {
                    let pkt = tcp4("10.0.0.5", "10.0.1.7", 1000 + n, 80, b"");
                    let out = expect_modified!(t.xmit(pkt));
                    let esp = &out.data()[IPV4_HDR_LEN..];
                    seqs.push(u32::from_be_bytes([esp[4], esp[5], esp[6], esp[7]]));
                }
                seqs
            })
        })
        .collect();

    // Policy churn on an unrelated subnet while traffic flows.
    for i in 0..50u8 {
        let s = sel("10.0.0.0/24", &format!("10.9.{i}.0/24"));
        t.eroutes().add(Eroute::new(s, SaId::shunt(Shunt::Drop))).unwrap();
        t.eroutes().remove(&s).unwrap();
    }

    let mut seqs: Vec<u32> =
        senders.into_iter().flat_map(|h| h.join().unwrap()).collect();
    seqs.sort_unstable();

    let total = usize::from(SENDERS) * PER_SENDER;
    let want: Vec<u32> = (1..=total as u32).collect();
    assert_eq!(seqs, want);
    assert_eq!(t.counters(&said).1, total as u64);
    assert_eq!(t.tunnel.stats().out_modified, total as u64);
}
