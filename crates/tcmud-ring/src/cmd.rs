//! Decoded commands and their responses.
//!
//! A [`ScsiCmd`] is produced by the ring reader, queued to exactly one
//! worker, and consumed there; its data buffer is the ordered list of
//! kernel iovecs viewed as one scatter-gather stream. A [`ScsiResponse`]
//! travels back to the ring writer.

use std::sync::Arc;

use tcmud_scsi::{CdbError, cdb, defs::status, sense};

use crate::region::SharedRegion;

/// One kernel iovec, as a byte range of the shared mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    /// Byte offset from the mailbox base.
    pub offset: usize,
    /// Length in bytes.
    pub len: usize,
}

/// Errors from the scatter-gather data buffer of a command.
#[derive(Debug, thiserror::Error)]
pub enum DataBufferError {
    /// A write ran past the last iovec.
    #[error("out of command buffer space after {written} bytes")]
    OutOfSpace {
        /// Bytes copied before the cursor hit the end.
        written: usize,
    },

    /// A read exhausted the iovec list before filling its destination.
    #[error("command buffer exhausted after {read} bytes")]
    EndOfBuffer {
        /// Bytes copied before the cursor hit the end.
        read: usize,
    },

    /// An iovec pointed outside the shared mapping.
    #[error(transparent)]
    Region(#[from] crate::error::RingError),
}

/// A single SCSI command received from the kernel.
///
/// Owned by one worker at a time; the dispatcher's queue enforces that.
#[derive(Debug)]
pub struct ScsiCmd {
    id: u16,
    cdb: Vec<u8>,
    vecs: Vec<IoVec>,
    region: Arc<SharedRegion>,
    vec_idx: usize,
    vec_off: usize,
    /// Reusable scratch space lent by the worker for the duration of one
    /// `handle_command` call. Handlers may replace it with a larger buffer;
    /// the worker keeps whatever comes back.
    pub scratch: Option<Vec<u8>>,
}

impl ScsiCmd {
    /// Assembles a command from its decoded parts. `cdb` must be the
    /// complete CDB (at least six bytes).
    #[must_use]
    pub fn new(id: u16, cdb: Vec<u8>, vecs: Vec<IoVec>, region: Arc<SharedRegion>) -> Self {
        Self {
            id,
            cdb,
            vecs,
            region,
            vec_idx: 0,
            vec_off: 0,
            scratch: None,
        }
    }

    /// The kernel's id for this command; its response must echo it.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The SCSI operation code (first CDB byte).
    #[must_use]
    pub fn command(&self) -> u8 {
        self.cdb[0]
    }

    /// The raw CDB bytes.
    #[must_use]
    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    /// One CDB byte by index. Panics past the CDB length, like any slice
    /// index; callers dispatch on [`Self::command`] first, which fixes the
    /// length.
    #[must_use]
    pub fn cdb_byte(&self, idx: usize) -> u8 {
        self.cdb[idx]
    }

    /// The logical block address this command targets.
    ///
    /// # Errors
    ///
    /// Propagates CDB decoding failures.
    pub fn lba(&self) -> std::result::Result<u64, CdbError> {
        cdb::lba(&self.cdb)
    }

    /// The transfer length in logical blocks.
    ///
    /// # Errors
    ///
    /// Propagates CDB decoding failures.
    pub fn xfer_len(&self) -> std::result::Result<u32, CdbError> {
        cdb::transfer_len(&self.cdb)
    }

    /// Total bytes of data buffer the kernel attached.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.vecs.iter().map(|v| v.len).sum()
    }

    /// Copies `src` into the data buffer at the cursor, advancing across
    /// iovec boundaries. This is how read-type commands return data to the
    /// kernel.
    ///
    /// # Errors
    ///
    /// [`DataBufferError::OutOfSpace`] when the iovec list ends before
    /// `src` does; the prefix already copied stays written.
    pub fn write_data(&mut self, src: &[u8]) -> std::result::Result<usize, DataBufferError> {
        let mut written = 0;
        while written < src.len() {
            let Some(vec) = self.vecs.get(self.vec_idx) else {
                return Err(DataBufferError::OutOfSpace { written });
            };
            let n = (src.len() - written).min(vec.len - self.vec_off);
            self.region
                .write_bytes(vec.offset + self.vec_off, &src[written..written + n])?;
            written += n;
            self.vec_off += n;
            if self.vec_off == vec.len {
                self.vec_idx += 1;
                self.vec_off = 0;
            }
        }
        Ok(written)
    }

    /// Copies from the data buffer at the cursor into `dst`, advancing
    /// across iovec boundaries. This is how write-type commands obtain the
    /// data the kernel attached.
    ///
    /// # Errors
    ///
    /// [`DataBufferError::EndOfBuffer`] when the iovec list ends before
    /// `dst` is full; the prefix already copied stays valid.
    pub fn read_data(&mut self, dst: &mut [u8]) -> std::result::Result<usize, DataBufferError> {
        let mut read = 0;
        while read < dst.len() {
            let Some(vec) = self.vecs.get(self.vec_idx) else {
                return Err(DataBufferError::EndOfBuffer { read });
            };
            let n = (dst.len() - read).min(vec.len - self.vec_off);
            self.region
                .read_bytes(vec.offset + self.vec_off, &mut dst[read..read + n])?;
            read += n;
            self.vec_off += n;
            if self.vec_off == vec.len {
                self.vec_idx += 1;
                self.vec_off = 0;
            }
        }
        Ok(read)
    }

    /// A response reporting successful completion.
    #[must_use]
    pub fn ok(&self) -> ScsiResponse {
        ScsiResponse {
            id: self.id,
            status: status::GOOD,
            sense: None,
        }
    }

    /// A response with an arbitrary SAM status and no sense data.
    #[must_use]
    pub fn respond_status(&self, status: u8) -> ScsiResponse {
        ScsiResponse {
            id: self.id,
            status,
            sense: None,
        }
    }

    /// A check-condition response carrying fixed-format sense data for the
    /// given sense key and packed additional sense code.
    #[must_use]
    pub fn check_condition(&self, key: u8, asc: u16) -> ScsiResponse {
        ScsiResponse {
            id: self.id,
            status: status::CHECK_CONDITION,
            sense: Some(sense::fixed_sense(key, asc)),
        }
    }

    /// The stock response for an unrecovered backend read or write failure.
    #[must_use]
    pub fn medium_error(&self) -> ScsiResponse {
        ScsiResponse {
            id: self.id,
            status: status::CHECK_CONDITION,
            sense: Some(sense::medium_error()),
        }
    }

    /// The stock response for a malformed or unexpected request.
    #[must_use]
    pub fn illegal_request(&self) -> ScsiResponse {
        ScsiResponse {
            id: self.id,
            status: status::CHECK_CONDITION,
            sense: Some(sense::illegal_request()),
        }
    }

    /// The stock response for an internal target failure.
    #[must_use]
    pub fn target_failure(&self) -> ScsiResponse {
        ScsiResponse {
            id: self.id,
            status: status::CHECK_CONDITION,
            sense: Some(sense::target_failure()),
        }
    }

    /// The stock response telling the kernel this device does not emulate
    /// the command's operation code.
    #[must_use]
    pub fn not_handled(&self) -> ScsiResponse {
        ScsiResponse {
            id: self.id,
            status: status::CHECK_CONDITION,
            sense: Some(sense::not_handled()),
        }
    }
}

/// The completion of one command, ready for the ring writer.
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    id: u16,
    status: u8,
    sense: Option<[u8; tcmud_scsi::SENSE_BUFFER_SIZE]>,
}

impl ScsiResponse {
    /// The id of the command being completed.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The SAM status byte.
    #[must_use]
    pub fn status(&self) -> u8 {
        self.status
    }

    /// The sense data, when the status calls for any.
    #[must_use]
    pub fn sense(&self) -> Option<&[u8; tcmud_scsi::SENSE_BUFFER_SIZE]> {
        self.sense.as_ref()
    }
}

#[cfg(test)]
pub(crate) fn cmd_with_vecs(vec_lens: &[usize]) -> ScsiCmd {
    // Lays the vecs out back to back from offset 0 of a private region.
    let total: usize = vec_lens.iter().sum();
    let region = Arc::new(SharedRegion::anonymous(total.max(1)));
    let mut vecs = Vec::new();
    let mut off = 0;
    for &len in vec_lens {
        vecs.push(IoVec { offset: off, len });
        off += len;
    }
    ScsiCmd::new(1, vec![0u8; 6], vecs, region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_three_bytes_three_vecs() {
        let mut cmd = cmd_with_vecs(&[1, 1, 1]);
        assert_eq!(cmd.write_data(&[0, 1, 2]).unwrap(), 3);
        let mut out = [0u8; 3];
        cmd.region.read_bytes(0, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2]);
    }

    #[test]
    fn test_write_three_bytes_one_vec() {
        let mut cmd = cmd_with_vecs(&[3]);
        assert_eq!(cmd.write_data(&[0, 1, 2]).unwrap(), 3);
    }

    #[test]
    fn test_write_out_of_space() {
        let mut cmd = cmd_with_vecs(&[1, 1]);
        let err = cmd.write_data(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, DataBufferError::OutOfSpace { written: 2 }));
    }

    #[test]
    fn test_read_three_bytes_three_vecs() {
        let mut cmd = cmd_with_vecs(&[1, 1, 1]);
        cmd.region.write_bytes(0, &[7, 8, 9]).unwrap();
        let mut out = [0u8; 3];
        assert_eq!(cmd.read_data(&mut out).unwrap(), 3);
        assert_eq!(out, [7, 8, 9]);
    }

    #[test]
    fn test_read_three_bytes_one_vec() {
        let mut cmd = cmd_with_vecs(&[3]);
        let mut out = [0u8; 3];
        assert_eq!(cmd.read_data(&mut out).unwrap(), 3);
    }

    #[test]
    fn test_read_end_of_buffer() {
        let mut cmd = cmd_with_vecs(&[1, 1]);
        let mut out = [0u8; 3];
        let err = cmd.read_data(&mut out).unwrap_err();
        assert!(matches!(err, DataBufferError::EndOfBuffer { read: 2 }));
    }

    #[test]
    fn test_cursor_spans_calls() {
        let mut cmd = cmd_with_vecs(&[2, 2]);
        assert_eq!(cmd.write_data(&[1]).unwrap(), 1);
        assert_eq!(cmd.write_data(&[2, 3]).unwrap(), 2);
        assert_eq!(cmd.write_data(&[4]).unwrap(), 1);
        let mut out = [0u8; 4];
        cmd.region.read_bytes(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_buffer_len() {
        let cmd = cmd_with_vecs(&[4, 8, 4]);
        assert_eq!(cmd.buffer_len(), 16);
    }

    #[test]
    fn test_response_constructors() {
        let cmd = cmd_with_vecs(&[1]);
        assert_eq!(cmd.ok().status(), status::GOOD);
        assert!(cmd.ok().sense().is_none());

        let resp = cmd.not_handled();
        assert_eq!(resp.id(), cmd.id());
        assert_eq!(resp.status(), status::CHECK_CONDITION);
        let sense = resp.sense().unwrap();
        assert_eq!(
            [sense[0], sense[2], sense[7], sense[12], sense[13]],
            [0x70, 0x05, 0x0a, 0x20, 0x00]
        );

        let resp = cmd.medium_error();
        assert_eq!(resp.sense().unwrap()[2], 0x03);

        let resp = cmd.check_condition(0x05, 0x1a00);
        assert_eq!(resp.sense().unwrap()[12], 0x1a);
    }
}
