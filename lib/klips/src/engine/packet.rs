// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The outbound packet buffer.
//!
//! A [`Packet`] owns a single contiguous allocation with the datagram
//! sitting between a head and a tail cursor. Encapsulation pushes
//! headers into the headroom and trailers into the tailroom; when
//! either runs short [`Packet::grow()`] moves the datagram into a new,
//! larger allocation and the old one is released.
//!
//! Link-layer framing handed in by the caller is stripped on entry
//! and put back on emit so the transforms only ever see IP.

use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketError {
    /// Not enough headroom or tailroom for the request.
    NoRoom { want: usize, have: usize },
    /// The request runs past the end of the datagram.
    OutOfBounds { off: usize, len: usize },
    /// The allocator refused a grow.
    AllocFailed(usize),
}

impl Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoRoom { want, have } => {
                write!(f, "no room: want {want}, have {have}")
            }
            Self::OutOfBounds { off, len } => {
                write!(f, "out of bounds: {len} bytes at {off}")
            }
            Self::AllocFailed(sz) => write!(f, "failed to allocate {sz} bytes"),
        }
    }
}

pub struct Packet {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    l2: Vec<u8>,
}

impl Packet {
    /// Wrap `data` with no spare room at either end.
    pub fn new(data: Vec<u8>) -> Self {
        let tail = data.len();
        Self { buf: data, head: 0, tail, l2: Vec::new() }
    }

    /// Copy `data` into a fresh buffer with the given headroom and
    /// tailroom.
    pub fn copy_from_slice(data: &[u8], headroom: usize, tailroom: usize) -> Self {
        let mut buf = vec![0u8; headroom + data.len() + tailroom];
        buf[headroom..headroom + data.len()].copy_from_slice(data);
        Self { buf, head: headroom, tail: headroom + data.len(), l2: Vec::new() }
    }

    /// Wrap a frame whose first `l2_len` bytes are link-layer framing.
    /// The framing is set aside and restored by [`Self::emit()`].
    pub fn with_l2(data: Vec<u8>, l2_len: usize) -> Result<Self, PacketError> {
        let mut pkt = Self::new(data);
        let l2 = pkt.pull_head(l2_len)?.to_vec();
        pkt.l2 = l2;
        Ok(pkt)
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.tail
    }

    /// The size of the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn l2_len(&self) -> usize {
        self.l2.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..self.tail]
    }

    /// Make sure there are at least `head` bytes of headroom and
    /// `tail` bytes of tailroom. If the current allocation can't
    /// satisfy that the datagram moves to a new one.
    pub fn grow(&mut self, head: usize, tail: usize) -> Result<(), PacketError> {
        if self.headroom() >= head && self.tailroom() >= tail {
            return Ok(());
        }

        let len = self.len();
        let new_head = head.max(self.headroom());
        let new_tail = tail.max(self.tailroom());
        let sz = new_head + len + new_tail;
        let mut buf = Vec::new();
        buf.try_reserve_exact(sz)
            .map_err(|_| PacketError::AllocFailed(sz))?;
        buf.resize(sz, 0);
        buf[new_head..new_head + len].copy_from_slice(self.data());
        self.buf = buf;
        self.head = new_head;
        self.tail = new_head + len;
        Ok(())
    }

    /// Claim `n` bytes of headroom and return them.
    pub fn push_head(&mut self, n: usize) -> Result<&mut [u8], PacketError> {
        if n > self.head {
            return Err(PacketError::NoRoom { want: n, have: self.head });
        }
        self.head -= n;
        Ok(&mut self.buf[self.head..self.head + n])
    }

    /// Claim `n` bytes of tailroom and return them.
    pub fn put_tail(&mut self, n: usize) -> Result<&mut [u8], PacketError> {
        let have = self.tailroom();
        if n > have {
            return Err(PacketError::NoRoom { want: n, have });
        }
        let start = self.tail;
        self.tail += n;
        Ok(&mut self.buf[start..self.tail])
    }

    /// Drop `n` bytes from the front and return them.
    pub fn pull_head(&mut self, n: usize) -> Result<&[u8], PacketError> {
        if n > self.len() {
            return Err(PacketError::OutOfBounds { off: 0, len: n });
        }
        let start = self.head;
        self.head += n;
        Ok(&self.buf[start..self.head])
    }

    /// Drop `n` bytes from the end.
    pub fn trim_tail(&mut self, n: usize) -> Result<(), PacketError> {
        if n > self.len() {
            return Err(PacketError::OutOfBounds { off: self.len(), len: n });
        }
        self.tail -= n;
        Ok(())
    }

    /// Open an `n`-byte gap after the first `keep` bytes of the
    /// datagram, moving those bytes forward into the headroom. This
    /// is how a header is inserted between the IP header and its
    /// payload.
    pub fn insert_after(
        &mut self,
        keep: usize,
        n: usize,
    ) -> Result<&mut [u8], PacketError> {
        if keep > self.len() {
            return Err(PacketError::OutOfBounds { off: 0, len: keep });
        }
        let old_head = self.head;
        self.push_head(n)?;
        self.buf.copy_within(old_head..old_head + keep, self.head);
        let gap = self.head + keep;
        Ok(&mut self.buf[gap..gap + n])
    }

    /// Replace the datagram from `off` to the end with `bytes`. The
    /// replacement must not be longer than what it replaces.
    pub fn replace_tail_from(
        &mut self,
        off: usize,
        bytes: &[u8],
    ) -> Result<(), PacketError> {
        let avail = self.len().saturating_sub(off);
        if off > self.len() || bytes.len() > avail {
            return Err(PacketError::OutOfBounds { off, len: bytes.len() });
        }
        let start = self.head + off;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.tail = start + bytes.len();
        Ok(())
    }

    /// Put the link-layer framing set aside by [`Self::with_l2()`]
    /// back in front of the datagram.
    pub fn restore_l2(&mut self) -> Result<(), PacketError> {
        if !self.l2.is_empty() {
            let l2 = core::mem::take(&mut self.l2);
            self.grow(l2.len(), 0)?;
            self.push_head(l2.len())?.copy_from_slice(&l2);
        }
        Ok(())
    }

    /// Restore any link-layer framing and hand back the bytes.
    pub fn emit(mut self) -> Result<Vec<u8>, PacketError> {
        self.restore_l2()?;

        if self.head == 0 && self.tail == self.buf.len() {
            return Ok(self.buf);
        }

        Ok(self.data().to_vec())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("tailroom", &self.tailroom())
            .field("l2_len", &self.l2.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_and_put() {
        let mut pkt = Packet::copy_from_slice(b"payload", 4, 2);
        pkt.push_head(4).unwrap().copy_from_slice(b"HDR:");
        pkt.put_tail(2).unwrap().copy_from_slice(b"!!");
        assert_eq!(pkt.data(), b"HDR:payload!!");
        assert!(matches!(pkt.push_head(1), Err(PacketError::NoRoom { .. })));
        assert!(matches!(pkt.put_tail(1), Err(PacketError::NoRoom { .. })));
    }

    #[test]
    fn grow_moves_data() {
        let mut pkt = Packet::new(b"abc".to_vec());
        assert_eq!(pkt.capacity(), 3);
        pkt.grow(8, 16).unwrap();
        assert_eq!(pkt.data(), b"abc");
        assert_eq!(pkt.headroom(), 8);
        assert_eq!(pkt.tailroom(), 16);

        // Already big enough: nothing moves.
        let cap = pkt.capacity();
        pkt.grow(4, 4).unwrap();
        assert_eq!(pkt.capacity(), cap);
    }

    #[test]
    fn insert_after_header() {
        let mut pkt = Packet::copy_from_slice(b"IPIPpayload", 8, 0);
        pkt.insert_after(4, 3).unwrap().copy_from_slice(b"ESP");
        assert_eq!(pkt.data(), b"IPIPESPpayload");
        assert_eq!(pkt.headroom(), 5);
    }

    #[test]
    fn replace_tail() {
        let mut pkt = Packet::new(b"hdr-long-payload".to_vec());
        pkt.replace_tail_from(4, b"short").unwrap();
        assert_eq!(pkt.data(), b"hdr-short");
        assert!(pkt.replace_tail_from(4, b"much-too-long!").is_err());
    }

    #[test]
    fn l2_round_trip() {
        let mut frame = vec![0xAA; 14];
        frame.extend_from_slice(b"ip");
        let mut pkt = Packet::with_l2(frame, 14).unwrap();
        assert_eq!(pkt.data(), b"ip");
        pkt.grow(4, 0).unwrap();
        pkt.push_head(4).unwrap().copy_from_slice(b"new:");
        let out = pkt.emit().unwrap();
        assert_eq!(&out[..14], &[0xAA; 14]);
        assert_eq!(&out[14..], b"new:ip");
    }
}
