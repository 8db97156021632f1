// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Notifications from the outbound path to key management.
//!
//! Two events flow this way: an acquire, asking for SAs to be
//! negotiated for a trapped flow, and an expire, reporting that an
//! SA crossed a soft or hard lifetime. Nothing flows back through
//! this boundary; new SAs and eroutes arrive as direct calls on the
//! stores.

use super::ip4::FlowId;
use super::life::LifeKind;
use super::life::SaLifetimes;
use crate::api::Identity;
use crate::api::SaId;
use crate::ddi::sync::KMutex;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;

/// The request for SAs covering a trapped packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcquireTemplate {
    pub flow: FlowId,
    /// The pid of the process that installed the trapping eroute.
    pub pid: u32,
    pub ident_s: Option<Identity>,
    pub ident_d: Option<Identity>,
}

/// Why an SA is being reported as expired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExpireReason {
    Lifetime(LifeKind),
    /// The outbound sequence number reached its limit.
    ReplayWrap,
}

impl Display for ExpireReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Lifetime(kind) => write!(f, "{kind}"),
            Self::ReplayWrap => write!(f, "replay-wrap"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExpireNotice {
    pub said: SaId,
    pub reason: ExpireReason,
    pub hard: bool,
    /// The SA's lifetimes at the moment it expired, taken before any
    /// teardown.
    pub lifetimes: SaLifetimes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyMgmtMsg {
    Acquire(AcquireTemplate),
    Expire(ExpireNotice),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyError {
    /// No key-management listener is attached.
    NoListener,
    QueueFull(usize),
}

impl Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoListener => write!(f, "no key management listener"),
            Self::QueueFull(depth) => write!(f, "queue full at depth {depth}"),
        }
    }
}

/// The key-management side of the boundary.
///
/// Implementations are called with no engine lock held and must not
/// block.
pub trait KeyMgmt: Send + Sync {
    fn acquire(&self, tmpl: &AcquireTemplate) -> Result<(), NotifyError>;
    fn expire(&self, notice: &ExpireNotice) -> Result<(), NotifyError>;
}

/// Refuses every message.
pub struct NoKeyMgmt;

impl KeyMgmt for NoKeyMgmt {
    fn acquire(&self, _tmpl: &AcquireTemplate) -> Result<(), NotifyError> {
        Err(NotifyError::NoListener)
    }

    fn expire(&self, _notice: &ExpireNotice) -> Result<(), NotifyError> {
        Err(NotifyError::NoListener)
    }
}

/// A bounded queue of messages for a consumer to drain at its own
/// pace. A full queue refuses new messages.
pub struct QueuedKeyMgmt {
    depth: usize,
    queue: KMutex<VecDeque<KeyMgmtMsg>>,
}

impl QueuedKeyMgmt {
    pub fn new(depth: usize) -> Self {
        Self { depth, queue: KMutex::new(VecDeque::with_capacity(depth)) }
    }

    fn push(&self, msg: KeyMgmtMsg) -> Result<(), NotifyError> {
        let mut q = self.queue.lock();
        if q.len() >= self.depth {
            return Err(NotifyError::QueueFull(self.depth));
        }
        q.push_back(msg);
        Ok(())
    }

    pub fn pop(&self) -> Option<KeyMgmtMsg> {
        self.queue.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<KeyMgmtMsg> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl KeyMgmt for QueuedKeyMgmt {
    fn acquire(&self, tmpl: &AcquireTemplate) -> Result<(), NotifyError> {
        self.push(KeyMgmtMsg::Acquire(tmpl.clone()))
    }

    fn expire(&self, notice: &ExpireNotice) -> Result<(), NotifyError> {
        self.push(KeyMgmtMsg::Expire(notice.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Ipv4Addr;
    use crate::api::SaProto;

    fn tmpl() -> AcquireTemplate {
        AcquireTemplate {
            flow: FlowId {
                src: "10.0.0.5".parse().unwrap(),
                dst: "10.0.1.7".parse().unwrap(),
                proto: 6,
                sport: 1234,
                dport: 80,
            },
            pid: 42,
            ident_s: None,
            ident_d: None,
        }
    }

    #[test]
    fn bounded_queue() {
        let km = QueuedKeyMgmt::new(2);
        km.acquire(&tmpl()).unwrap();
        let notice = ExpireNotice {
            said: SaId::new(SaProto::Esp, 0x1234, Ipv4Addr::BROADCAST),
            reason: ExpireReason::Lifetime(LifeKind::Bytes),
            hard: true,
            lifetimes: SaLifetimes::default(),
        };
        km.expire(&notice).unwrap();
        assert_eq!(km.acquire(&tmpl()), Err(NotifyError::QueueFull(2)));
        assert_eq!(km.len(), 2);

        assert!(matches!(km.pop(), Some(KeyMgmtMsg::Acquire(t)) if t.pid == 42));
        assert_eq!(km.drain(), vec![KeyMgmtMsg::Expire(notice)]);
        assert_eq!(km.len(), 0);
    }

    #[test]
    fn no_listener() {
        assert_eq!(NoKeyMgmt.acquire(&tmpl()), Err(NotifyError::NoListener));
    }
}
