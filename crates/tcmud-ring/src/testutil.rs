//! Fixtures for exercising the ring without a kernel.
//!
//! `RingBuilder` plays the kernel's role: it lays a mailbox, ring entries,
//! CDBs, and data areas into an anonymous region so readers, writers, and
//! the dispatcher can be driven end to end in tests. Compiled only for
//! tests and behind the `test-util` feature.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::layout::{self, OffsetProfile, PROFILE_64, pack_len_op};
use crate::mailbox::Mailbox;
use crate::region::SharedRegion;

/// Offset of the command ring in every built region.
pub const CMDR_OFF: u32 = 128;

const DATA_AREA: usize = 64 * 1024;

/// Builds TCM-User rings in anonymous memory, entry by entry.
#[derive(Debug)]
pub struct RingBuilder {
    region: Arc<SharedRegion>,
    profile: OffsetProfile,
    cmdr_size: u32,
    data_cursor: usize,
}

impl RingBuilder {
    /// Creates a region holding a mailbox and a ring of `cmdr_size` bytes,
    /// with a data area behind the ring for CDBs and iovec payloads.
    ///
    /// # Panics
    ///
    /// On region write failures, which cannot happen for a fresh region.
    #[must_use]
    pub fn new(cmdr_size: u32) -> Self {
        let map = CMDR_OFF as usize + cmdr_size as usize + DATA_AREA;
        let region = Arc::new(SharedRegion::anonymous(map));
        region.write_u16(layout::mailbox::VERSION, 2).unwrap();
        region.write_u32(layout::mailbox::CMDR_OFF, CMDR_OFF).unwrap();
        region.write_u32(layout::mailbox::CMDR_SIZE, cmdr_size).unwrap();
        Self {
            region,
            profile: PROFILE_64,
            cmdr_size,
            data_cursor: CMDR_OFF as usize + cmdr_size as usize,
        }
    }

    /// The backing region.
    #[must_use]
    pub fn region(&self) -> Arc<SharedRegion> {
        Arc::clone(&self.region)
    }

    /// A mailbox over the backing region.
    ///
    /// # Panics
    ///
    /// Never for a builder-made region.
    #[must_use]
    pub fn mailbox(&self) -> Mailbox {
        Mailbox::new(Arc::clone(&self.region)).unwrap()
    }

    /// Sets the kernel-owned producer index.
    ///
    /// # Panics
    ///
    /// Never for a builder-made region.
    pub fn set_head(&self, head: u32) {
        self.region.write_u32(layout::mailbox::CMD_HEAD, head).unwrap();
    }

    /// Sets the shared consumer index.
    ///
    /// # Panics
    ///
    /// Never for a builder-made region.
    pub fn set_tail(&self, tail: u32) {
        self.region.write_u32(layout::mailbox::CMD_TAIL, tail).unwrap();
    }

    fn field(&self, ring_off: u32, field: usize) -> usize {
        CMDR_OFF as usize + ((ring_off as usize + field) % self.cmdr_size as usize)
    }

    /// Writes a bare entry header with an arbitrary opcode.
    ///
    /// # Panics
    ///
    /// Never for in-ring offsets.
    pub fn raw_entry_at(&self, ring_off: u32, len: u32, opcode: u32) {
        self.region
            .write_u32(self.field(ring_off, layout::ent_hdr::LEN_OP), pack_len_op(len, opcode))
            .unwrap();
    }

    /// Writes a pad entry of `len` bytes at `ring_off`.
    pub fn pad_at(&self, ring_off: u32, len: u32) {
        self.raw_entry_at(ring_off, len, 0);
    }

    /// Writes a command entry at `ring_off`: the CDB goes into the data
    /// area, and each requested iovec gets a freshly allocated payload
    /// span there too. Returns the data-area offsets of the iovec spans.
    ///
    /// # Panics
    ///
    /// When the entry cannot hold the requested iovec count or the data
    /// area runs out.
    pub fn cmd_at(
        &mut self,
        ring_off: u32,
        ent_len: u32,
        id: u16,
        cdb: &[u8],
        vec_lens: &[usize],
    ) -> Vec<usize> {
        assert!(
            self.profile.iov_base(vec_lens.len()) <= ent_len as usize,
            "entry length {ent_len} cannot hold {} iovecs",
            vec_lens.len()
        );
        self.raw_entry_at(ring_off, ent_len, 1);
        self.region
            .write_u16(self.field(ring_off, layout::ent_hdr::CMD_ID), id)
            .unwrap();

        let cdb_off = self.alloc(cdb.len());
        self.region.write_bytes(cdb_off, cdb).unwrap();
        self.region
            .write_u64(self.field(ring_off, self.profile.cdb_off), cdb_off as u64)
            .unwrap();

        self.region
            .write_u32(self.field(ring_off, self.profile.iov_cnt), vec_lens.len() as u32)
            .unwrap();
        let mut spans = Vec::with_capacity(vec_lens.len());
        for (idx, &len) in vec_lens.iter().enumerate() {
            let span = self.alloc(len);
            self.region
                .write_u64(self.field(ring_off, self.profile.iov_base(idx)), span as u64)
                .unwrap();
            self.region
                .write_u64(self.field(ring_off, self.profile.iov_len(idx)), len as u64)
                .unwrap();
            spans.push(span);
        }
        spans
    }

    fn alloc(&mut self, len: usize) -> usize {
        let off = self.data_cursor;
        self.data_cursor = (off + len + 7) & !7;
        assert!(self.data_cursor <= self.region.len(), "data area exhausted");
        off
    }
}

/// An OS pipe as a stand-in for the uio file descriptor: the write end
/// goes to the code under test, the read end to the assertion.
///
/// # Panics
///
/// When the pipe cannot be created.
#[must_use]
pub fn pipe_fds() -> (OwnedFd, OwnedFd) {
    nix::unistd::pipe().unwrap()
}
