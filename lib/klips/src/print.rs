// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print dumps in a human-friendly manner.
//!
//! These back the eroute and SA listings and are shared with the
//! integration tests.

use crate::api::DumpErouteResp;
use crate::api::DumpSaResp;
use crate::api::ErouteDump;
use crate::api::SaDump;
use itertools::Itertools;
use std::io::Write;
use std::string::ToString;
use tabwriter::TabWriter;

/// Print a [`DumpErouteResp`].
pub fn print_eroutes(resp: &DumpErouteResp) -> std::io::Result<()> {
    print_eroutes_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpErouteResp`].
pub fn print_eroutes_into(
    writer: &mut impl Write,
    resp: &DumpErouteResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Eroutes ({}/{})", resp.entries.len(), resp.limit)?;
    write_hrb(&mut t)?;
    for e in &resp.entries {
        print_eroute(&mut t, e)?;
    }
    t.flush()
}

/// One entry in the classic `count src -> dst => said (idents)` form.
fn print_eroute(t: &mut impl Write, e: &ErouteDump) -> std::io::Result<()> {
    write!(t, "{}\t{}\t=> {}", e.count, e.sel, e.said)?;

    if e.ident_s.is_some() || e.ident_d.is_some() {
        let s = e.ident_s.as_ref().map(|i| i.to_string()).unwrap_or_default();
        let d = e.ident_d.as_ref().map(|i| i.to_string()).unwrap_or_default();
        write!(t, "\t({s}:{d})")?;
    }

    if e.pid != 0 {
        write!(t, "\tpid {}", e.pid)?;
    }

    if e.retained {
        write!(t, "\theld")?;
    }

    writeln!(t)
}

/// Print a [`DumpSaResp`].
pub fn print_sas(resp: &DumpSaResp) -> std::io::Result<()> {
    print_sas_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpSaResp`].
pub fn print_sas_into(
    writer: &mut impl Write,
    resp: &DumpSaResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "SAs ({})", resp.entries.len())?;
    write_hrb(&mut t)?;
    writeln!(t, "SAID\tSTATE\tDIR\tSEQ\tENC\tAUTH\tNEXT\tLIFETIMES")?;
    for sa in &resp.entries {
        print_sa(&mut t, sa)?;
    }
    t.flush()
}

fn print_sa(t: &mut impl Write, sa: &SaDump) -> std::io::Result<()> {
    let next = sa.next.map(|n| n.to_string()).unwrap_or("-".to_string());
    let lives = sa
        .lifetimes
        .iter()
        .filter(|l| !l.text.is_empty())
        .map(|l| l.text.as_str())
        .join(" ");

    writeln!(
        t,
        "{}\t{}\t{}\t{}/{}\t{}\t{}\t{}\t{}",
        sa.said,
        sa.state,
        sa.dir,
        sa.replay_seq,
        sa.replay_window,
        sa.enc_alg.as_deref().unwrap_or("-"),
        sa.auth_alg.as_deref().unwrap_or("-"),
        next,
        if lives.is_empty() { "-" } else { &lives },
    )
}

/// Print a set of named counters, as from
/// [`crate::ddi::kstat::KStatNamed::pairs()`].
pub fn print_kstats_into(
    writer: &mut impl Write,
    name: &str,
    pairs: &[(&'static str, u64)],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Stats {name}")?;
    write_hr(&mut t)?;
    for (k, v) in pairs.iter().filter(|(_, v)| *v != 0) {
        writeln!(t, "{k}\t{v}")?;
    }
    t.flush()
}

/// Print horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
