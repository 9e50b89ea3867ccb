//! The block-device emulator: the minimum SCSI command set a Linux
//! initiator needs to bring up, format, and use a disk.
//!
//! Every path here ends in a well-formed response. Backend failures become
//! medium errors, malformed CDBs become illegal requests, and operation
//! codes outside the emulated set are answered with invalid-opcode sense
//! so the initiator can fall back.

use std::sync::Arc;

use async_trait::async_trait;
use tcmud_ring::{ScsiCmd, ScsiResponse};
use tcmud_scsi::cdb;
use tcmud_scsi::defs::{asc, op, sense_key, service_action};

use crate::config::DeviceConfig;
use crate::handler::{BlockBackend, HandlerError, ScsiCmdHandler};

/// Caching mode page code.
const CACHING_PAGE: u8 = 0x08;
/// "Return all pages" page code in Mode Sense.
const ALL_PAGES: u8 = 0x3f;
/// Device-specific parameter byte: DPO and FUA supported.
const DSP_DPO_FUA: u8 = 0x10;

/// Emulates a SCSI direct-access device over a positional-I/O backend.
pub struct BlockEmulator<B> {
    backend: B,
    config: Arc<DeviceConfig>,
}

impl<B: BlockBackend> BlockEmulator<B> {
    /// Creates an emulator serving `config`'s volume from `backend`.
    #[must_use]
    pub fn new(backend: B, config: Arc<DeviceConfig>) -> Self {
        Self { backend, config }
    }

    fn emulate_inquiry(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        if cmd.cdb_byte(1) & 0x01 == 0 {
            if cmd.cdb_byte(2) == 0 {
                self.emulate_std_inquiry(cmd)
            } else {
                // A page code without the EVPD bit is a contradiction.
                cmd.illegal_request()
            }
        } else {
            self.emulate_evpd_inquiry(cmd)
        }
    }

    fn emulate_std_inquiry(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        let inq = &self.config.inquiry;
        let mut buf = [0u8; 36];
        buf[2] = 0x05; // SPC-3
        buf[3] = 0x02; // response data format
        buf[4] = 31; // additional length
        buf[7] = 0x02; // CmdQue
        buf[8..16].copy_from_slice(&fixed_string(&inq.vendor_id, 8));
        buf[16..32].copy_from_slice(&fixed_string(&inq.product_id, 16));
        buf[32..36].copy_from_slice(&fixed_string(&inq.product_rev, 4));
        respond_data(cmd, &buf)
    }

    fn emulate_evpd_inquiry(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        let page = cmd.cdb_byte(2);
        tracing::debug!(page, "EVPD inquiry");
        match page {
            0x00 => {
                // Supported pages: this one and device identification.
                let data = [0, 0, 0, 2, 0x00, 0x83];
                respond_data(cmd, &data)
            }
            0x83 => self.emulate_device_id_page(cmd),
            _ => cmd.illegal_request(),
        }
    }

    /// Device identification page: a T10 vendor descriptor, an NAA binary
    /// descriptor, and a vendor-specific descriptor carrying the config
    /// string. The NAA tail and the T10 suffix come from the device's
    /// configured WWN.
    fn emulate_device_id_page(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        let mut data = [0u8; 512];
        data[1] = 0x83;
        let device_id = self.config.wwn.device_id();
        let wwn_hex = device_id.strip_prefix("naa.").unwrap_or(&device_id);
        let mut used = 4;

        // 1/3: T10 vendor id, ASCII.
        {
            data[used] = 2; // code set: ASCII
            data[used + 1] = 1; // identifier type: T10 vendor id
            data[used + 4..used + 12].copy_from_slice(&fixed_string(&self.config.inquiry.vendor_id, 8));
            let tail = wwn_hex.as_bytes();
            data[used + 12..used + 12 + tail.len()].copy_from_slice(tail);
            data[used + 3] = (8 + tail.len() + 1) as u8;
            used += 8 + tail.len() + 1 + 4;
        }

        // 2/3: NAA, binary. Type 6 with the OpenFabrics IEEE company id,
        // then the WWN hex digits packed two to a byte.
        {
            let naa = &mut data[used..used + 20];
            naa[0] = 1; // code set: binary
            naa[1] = 3; // identifier type: NAA
            naa[3] = 16; // body length, registered extended format
            naa[4..8].copy_from_slice(&[0x60, 0x01, 0x40, 0x50]);
            let mut i = 7;
            let mut low_nibble = true;
            for c in wwn_hex.bytes() {
                if i >= 20 {
                    break;
                }
                let Some(v) = hex_value(c) else { continue };
                if low_nibble {
                    naa[i] |= v;
                    i += 1;
                    low_nibble = false;
                } else {
                    naa[i] = v << 4;
                    low_nibble = true;
                }
            }
            used += 20;
        }

        // 3/3: vendor specific, ASCII: the config string.
        {
            let cfg = self.config.config_string();
            let bytes = cfg.as_bytes();
            let n = bytes.len().min(data.len() - used - 4);
            data[used] = 2; // code set: ASCII
            data[used + 1] = 0; // identifier type: vendor specific
            data[used + 4..used + 4 + n].copy_from_slice(&bytes[..n]);
            data[used + 3] = (n + 1) as u8;
            used += n + 1 + 4;
        }

        let page_len = ((used - 4) as u16).to_be_bytes();
        data[2..4].copy_from_slice(&page_len);
        respond_data(cmd, &data[..used])
    }

    fn emulate_service_action_in(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        match cdb::service_action(cmd.cdb()) {
            Ok(action) if action == service_action::READ_CAPACITY_16 => {
                self.emulate_read_capacity_16(cmd)
            }
            _ => cmd.not_handled(),
        }
    }

    fn emulate_read_capacity_16(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        let sizes = &self.config.sizes;
        let mut buf = [0u8; 32];
        // Returned as the index of the last LBA, hence the minus one.
        buf[..8].copy_from_slice(&(sizes.block_count() - 1).to_be_bytes());
        buf[8..12].copy_from_slice(&sizes.block_size.to_be_bytes());
        respond_data(cmd, &buf)
    }

    fn caching_mode_page(&self) -> [u8; 20] {
        let mut page = [0u8; 20];
        page[0] = CACHING_PAGE;
        page[1] = 0x12; // page length
        if self.config.write_cache {
            page[2] |= 0x04; // WCE
        }
        page
    }

    fn emulate_mode_sense(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        let Ok(alloc) = cmd.xfer_len() else {
            return cmd.illegal_request();
        };
        let page = cmd.cdb_byte(2);

        let mut pages: Vec<u8> = Vec::new();
        if page == ALL_PAGES || page == CACHING_PAGE {
            pages.extend_from_slice(&self.caching_mode_page());
        }

        let mut data = if cmd.command() == op::MODE_SENSE_6 {
            let mut hdr = vec![0u8; 4];
            hdr[0] = (pages.len() + 3) as u8;
            hdr[2] = DSP_DPO_FUA;
            hdr
        } else {
            let mut hdr = vec![0u8; 8];
            hdr[..2].copy_from_slice(&((pages.len() + 6) as u16).to_be_bytes());
            hdr[3] = DSP_DPO_FUA;
            hdr
        };
        data.extend_from_slice(&pages);
        data.truncate(alloc as usize);
        respond_data(cmd, &data)
    }

    /// Mode Select against a device with nothing selectable: accept only a
    /// byte-exact echo of our own caching page.
    fn emulate_mode_select(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        let select_ten = cmd.command() == op::MODE_SELECT_10;
        let page = cmd.cdb_byte(2) & 0x3f;
        let subpage = cmd.cdb_byte(3);
        let Ok(alloc) = cmd.xfer_len() else {
            return cmd.illegal_request();
        };
        let alloc = alloc as usize;
        let hdr_len = if select_ten { 8 } else { 4 };

        if alloc == 0 {
            return cmd.ok();
        }

        let mut inbuf = [0u8; 512];
        let got = match cmd.read_data(&mut inbuf) {
            Ok(n) => n,
            Err(tcmud_ring::DataBufferError::EndOfBuffer { read }) => read,
            Err(err) => {
                tracing::warn!(%err, "mode select parameter list unreadable");
                return cmd.target_failure();
            }
        };
        if got >= inbuf.len() {
            return cmd.check_condition(
                sense_key::ILLEGAL_REQUEST,
                asc::PARAMETER_LIST_LENGTH_ERROR,
            );
        }

        let flags = cmd.cdb_byte(1);
        if flags & 0x10 == 0 || flags & 0x01 != 0 {
            // PF must be set, SP must not: there is nowhere to save pages.
            return cmd.illegal_request();
        }
        if page != CACHING_PAGE || subpage != 0 {
            return cmd.illegal_request();
        }

        let expected = self.caching_mode_page();
        if alloc < hdr_len + expected.len() {
            return cmd.check_condition(
                sense_key::ILLEGAL_REQUEST,
                asc::PARAMETER_LIST_LENGTH_ERROR,
            );
        }
        if inbuf[hdr_len..hdr_len + expected.len()] != expected {
            return cmd.check_condition(
                sense_key::ILLEGAL_REQUEST,
                asc::INVALID_FIELD_IN_PARAMETER_LIST,
            );
        }
        cmd.ok()
    }

    fn emulate_read(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        let Some((offset, length)) = self.transfer_span(cmd) else {
            return cmd.illegal_request();
        };

        let mut buf = cmd.scratch.take().unwrap_or_default();
        if buf.len() < length {
            buf.resize(length, 0);
        }
        let read = self.backend.read_at(&mut buf[..length], offset);
        let wrote = match read {
            Ok(n) if n == length => cmd.write_data(&buf[..length]).map_err(|err| {
                tracing::error!(%err, "read data did not fit the command buffer");
            }),
            Ok(n) => {
                tracing::error!(n, length, offset, "backend read came up short");
                Err(())
            }
            Err(err) => {
                tracing::error!(%err, offset, length, "backend read failed");
                Err(())
            }
        };
        cmd.scratch = Some(buf);
        match wrote {
            Ok(_) => cmd.ok(),
            Err(()) => cmd.medium_error(),
        }
    }

    fn emulate_write(&self, cmd: &mut ScsiCmd) -> ScsiResponse {
        let Some((offset, length)) = self.transfer_span(cmd) else {
            return cmd.illegal_request();
        };

        let mut buf = cmd.scratch.take().unwrap_or_default();
        if buf.len() < length {
            buf.resize(length, 0);
        }
        let result = match cmd.read_data(&mut buf[..length]) {
            Ok(_) => match self.backend.write_at(&buf[..length], offset) {
                Ok(n) if n == length => Ok(()),
                Ok(n) => {
                    tracing::error!(n, length, offset, "backend write came up short");
                    Err(())
                }
                Err(err) => {
                    tracing::error!(%err, offset, length, "backend write failed");
                    Err(())
                }
            },
            Err(err) => {
                tracing::error!(%err, "write data missing from the command buffer");
                Err(())
            }
        };
        cmd.scratch = Some(buf);
        match result {
            Ok(()) => cmd.ok(),
            Err(()) => cmd.medium_error(),
        }
    }

    /// Byte offset and length of a read/write transfer, or `None` for a
    /// CDB whose block fields cannot be decoded or overflow.
    fn transfer_span(&self, cmd: &ScsiCmd) -> Option<(u64, usize)> {
        let lba = cmd.lba().ok()?;
        let blocks = cmd.xfer_len().ok()?;
        let bs = u64::from(self.config.sizes.block_size);
        let offset = lba.checked_mul(bs)?;
        let length = u64::from(blocks).checked_mul(bs)?;
        Some((offset, usize::try_from(length).ok()?))
    }
}

#[async_trait]
impl<B: BlockBackend> ScsiCmdHandler for BlockEmulator<B> {
    async fn handle_command(&self, cmd: &mut ScsiCmd) -> Result<ScsiResponse, HandlerError> {
        let resp = match cmd.command() {
            op::INQUIRY => self.emulate_inquiry(cmd),
            op::TEST_UNIT_READY => cmd.ok(),
            op::SERVICE_ACTION_IN_16 => self.emulate_service_action_in(cmd),
            op::MODE_SENSE_6 | op::MODE_SENSE_10 => self.emulate_mode_sense(cmd),
            op::MODE_SELECT_6 | op::MODE_SELECT_10 => self.emulate_mode_select(cmd),
            op::READ_6 | op::READ_10 | op::READ_12 | op::READ_16 => self.emulate_read(cmd),
            op::WRITE_6 | op::WRITE_10 | op::WRITE_12 | op::WRITE_16 => self.emulate_write(cmd),
            other => {
                tracing::debug!(op = %format_args!("{other:#04x}"), "unemulated SCSI command");
                cmd.not_handled()
            }
        };
        Ok(resp)
    }
}

/// Space-pads or truncates `s` to exactly `len` ASCII bytes.
fn fixed_string(s: &str, len: usize) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.resize(len, b' ');
    out
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Copies a fully-formed response payload into the command buffer. The
/// kernel sizes that buffer from the CDB's allocation length, so a payload
/// that does not fit is a target-side defect, answered as such.
fn respond_data(cmd: &mut ScsiCmd, data: &[u8]) -> ScsiResponse {
    match cmd.write_data(data) {
        Ok(_) => cmd.ok(),
        Err(err) => {
            tracing::warn!(%err, len = data.len(), "response payload exceeds the command buffer");
            cmd.target_failure()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use tcmud_ring::{IoVec, SharedRegion};
    use tcmud_scsi::cdb::build;
    use tcmud_scsi::defs::status;

    use crate::config::DataSizes;

    fn test_config() -> Arc<DeviceConfig> {
        Arc::new(DeviceConfig::basic(
            "testvol",
            DataSizes {
                volume_size: 1024 * 1024 * 1024,
                block_size: 1024,
            },
        ))
    }

    fn emulator_with_file(content: &[u8]) -> BlockEmulator<std::fs::File> {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(content).unwrap();
        BlockEmulator::new(file, test_config())
    }

    /// A command whose whole data buffer is one iovec at region offset 0.
    fn cmd_for(cdb: &[u8], buffer_len: usize) -> (ScsiCmd, Arc<SharedRegion>) {
        let region = Arc::new(SharedRegion::anonymous(buffer_len.max(1)));
        let vecs = if buffer_len == 0 {
            Vec::new()
        } else {
            vec![IoVec {
                offset: 0,
                len: buffer_len,
            }]
        };
        (
            ScsiCmd::new(1, cdb.to_vec(), vecs, Arc::clone(&region)),
            region,
        )
    }

    fn buffer_bytes(region: &SharedRegion, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        region.read_bytes(0, &mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_std_inquiry_layout() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, region) = cmd_for(&build::inquiry(false, 0, 36), 36);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);

        let buf = buffer_bytes(&region, 36);
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[2], 0x05);
        assert_eq!(buf[3], 0x02);
        assert_eq!(buf[4], 31);
        assert_eq!(buf[7], 0x02);
        assert_eq!(&buf[8..16], b"tcmud   ");
        assert_eq!(&buf[16..32], b"TCMU Device     ");
        assert_eq!(&buf[32..36], b"0001");
    }

    #[tokio::test]
    async fn test_inquiry_page_without_evpd_is_illegal() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, _region) = cmd_for(&build::inquiry(false, 0x83, 255), 255);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::CHECK_CONDITION);
        assert_eq!(resp.sense().unwrap()[12], 0x24);
    }

    #[tokio::test]
    async fn test_evpd_supported_pages() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, region) = cmd_for(&build::inquiry(true, 0x00, 255), 255);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);
        assert_eq!(buffer_bytes(&region, 6), [0, 0, 0, 2, 0x00, 0x83]);
    }

    #[tokio::test]
    async fn test_evpd_device_id_page() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, region) = cmd_for(&build::inquiry(true, 0x83, 255), 255);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);

        let buf = buffer_bytes(&region, 255);
        assert_eq!(buf[1], 0x83);
        let page_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));

        // First descriptor: T10 vendor id in ASCII.
        assert_eq!(buf[4], 2);
        assert_eq!(buf[5], 1);
        assert_eq!(&buf[8..16], b"tcmud   ");

        // Second descriptor: NAA binary with the OEM prefix, at a
        // position derived from the first descriptor's length.
        let naa = 4 + 4 + usize::from(buf[7]);
        assert_eq!(buf[naa], 1);
        assert_eq!(buf[naa + 1], 3);
        assert_eq!(buf[naa + 3], 16);
        assert_eq!(&buf[naa + 4..naa + 7], &[0x60, 0x01, 0x40]);
        // The WWN's leading "5" lands in the low nibble of the fourth
        // prefix byte.
        assert_eq!(buf[naa + 7], 0x50 | 0x05);

        // Third descriptor: the config string in ASCII.
        let vendor = naa + 20;
        assert_eq!(buf[vendor], 2);
        assert_eq!(buf[vendor + 1], 0);
        let n = usize::from(buf[vendor + 3]) - 1;
        assert_eq!(&buf[vendor + 4..vendor + 4 + n], b"tcmud//testvol");

        // Page length covers exactly the three descriptors.
        assert_eq!(4 + page_len, vendor + 4 + n + 1);
    }

    #[tokio::test]
    async fn test_evpd_unknown_page_is_illegal() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, _region) = cmd_for(&build::inquiry(true, 0xb0, 255), 255);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::CHECK_CONDITION);
    }

    #[tokio::test]
    async fn test_test_unit_ready() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, _region) = cmd_for(&build::test_unit_ready(), 0);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);
        assert!(resp.sense().is_none());
    }

    #[tokio::test]
    async fn test_read_capacity_16() {
        // 1 GiB volume, 1 KiB blocks: last LBA index is 2^20 - 1.
        let emu = emulator_with_file(&[]);
        let (mut cmd, region) = cmd_for(&build::read_capacity_16(32), 32);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);

        let buf = buffer_bytes(&region, 32);
        assert_eq!(u64::from_be_bytes(buf[..8].try_into().unwrap()), (1 << 20) - 1);
        assert_eq!(u32::from_be_bytes(buf[8..12].try_into().unwrap()), 1024);
        assert!(buf[12..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_service_action_other_not_handled() {
        let emu = emulator_with_file(&[]);
        let mut cdb = build::read_capacity_16(32);
        cdb[1] = service_action::GET_LBA_STATUS;
        let (mut cmd, _region) = cmd_for(&cdb, 32);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.sense().unwrap()[12], 0x20);
    }

    #[tokio::test]
    async fn test_mode_sense_6_caching_page() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, region) = cmd_for(&build::mode_sense_6(0x08, 64), 64);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);

        let buf = buffer_bytes(&region, 24);
        assert_eq!(buf[0], 23); // 20-byte page + 3
        assert_eq!(buf[2], 0x10); // DPO/FUA
        assert_eq!(buf[4], 0x08);
        assert_eq!(buf[5], 0x12);
        assert_eq!(buf[6] & 0x04, 0); // write cache off by default
    }

    #[tokio::test]
    async fn test_mode_sense_10_header_and_wce() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[]).unwrap();
        let mut config = DeviceConfig::basic(
            "testvol",
            DataSizes {
                volume_size: 1 << 30,
                block_size: 1024,
            },
        );
        config.write_cache = true;
        let emu = BlockEmulator::new(file, Arc::new(config));

        let (mut cmd, region) = cmd_for(&build::mode_sense_10(ALL_PAGES, 64), 64);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);

        let buf = buffer_bytes(&region, 28);
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 26); // 20 + 6
        assert_eq!(buf[3], 0x10);
        assert_eq!(buf[8], 0x08);
        assert_eq!(buf[10] & 0x04, 0x04); // WCE on
    }

    #[tokio::test]
    async fn test_mode_sense_truncates_to_allocation() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, _region) = cmd_for(&build::mode_sense_6(0x08, 4), 4);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        // Only the header fits; still a clean completion.
        assert_eq!(resp.status(), status::GOOD);
    }

    #[tokio::test]
    async fn test_mode_sense_unknown_page_header_only() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, region) = cmd_for(&build::mode_sense_6(0x1c, 64), 64);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);
        let buf = buffer_bytes(&region, 4);
        assert_eq!(buf[0], 3); // header only, no pages
    }

    fn mode_select_payload(emu: &BlockEmulator<std::fs::File>, hdr_len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; hdr_len];
        payload.extend_from_slice(&emu.caching_mode_page());
        payload
    }

    #[tokio::test]
    async fn test_mode_select_matching_page_is_good() {
        let emu = emulator_with_file(&[]);
        let payload = mode_select_payload(&emu, 4);
        let (mut cmd, region) = cmd_for(&build::mode_select_6(true, false, 24), 24);
        region.write_bytes(0, &payload).unwrap();
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);
    }

    #[tokio::test]
    async fn test_mode_select_zero_allocation_is_good() {
        let emu = emulator_with_file(&[]);
        let (mut cmd, _region) = cmd_for(&build::mode_select_6(true, false, 0), 0);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);
    }

    #[tokio::test]
    async fn test_mode_select_requires_pf_and_no_sp() {
        let emu = emulator_with_file(&[]);
        let payload = mode_select_payload(&emu, 4);

        for (pf, sp) in [(false, false), (true, true)] {
            let (mut cmd, region) = cmd_for(&build::mode_select_6(pf, sp, 24), 24);
            region.write_bytes(0, &payload).unwrap();
            let resp = emu.handle_command(&mut cmd).await.unwrap();
            assert_eq!(resp.status(), status::CHECK_CONDITION);
            assert_eq!(resp.sense().unwrap()[12], 0x24);
        }
    }

    #[tokio::test]
    async fn test_mode_select_mismatched_page_data() {
        let emu = emulator_with_file(&[]);
        let mut payload = mode_select_payload(&emu, 4);
        payload[6] ^= 0x01; // corrupt one page byte
        let (mut cmd, region) = cmd_for(&build::mode_select_6(true, false, 24), 24);
        region.write_bytes(0, &payload).unwrap();
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::CHECK_CONDITION);
        assert_eq!(resp.sense().unwrap()[12], 0x26);
    }

    #[tokio::test]
    async fn test_mode_select_overlong_parameter_list() {
        let emu = emulator_with_file(&[]);
        // Mode Select (10) so the allocation length can reach 512.
        let mut cdb = [0u8; 10];
        cdb[0] = op::MODE_SELECT_10;
        cdb[1] = 0x10;
        cdb[2] = 0x08;
        cdb[7..9].copy_from_slice(&600u16.to_be_bytes());
        let (mut cmd, _region) = cmd_for(&cdb, 600);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::CHECK_CONDITION);
        assert_eq!(resp.sense().unwrap()[12], 0x1a);
    }

    #[tokio::test]
    async fn test_read_returns_backing_data() {
        let mut content = vec![0u8; 4096];
        content[1024..1024 + 8].copy_from_slice(b"blocksix");
        let emu = emulator_with_file(&content);

        let (mut cmd, region) = cmd_for(&build::read_10(1, 2), 2048);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);
        assert_eq!(&buffer_bytes(&region, 8), b"blocksix");
    }

    #[tokio::test]
    async fn test_read_past_end_is_medium_error() {
        let emu = emulator_with_file(&[0u8; 1024]);
        let (mut cmd, _region) = cmd_for(&build::read_10(4, 1), 1024);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::CHECK_CONDITION);
        assert_eq!(resp.sense().unwrap()[2], 0x03);
        assert_eq!(resp.sense().unwrap()[12], 0x11);
    }

    #[tokio::test]
    async fn test_write_lands_in_backing_store() {
        let emu = emulator_with_file(&[0u8; 4096]);
        let (mut cmd, region) = cmd_for(&build::write_10(2, 1), 1024);
        region.write_bytes(0, b"written through").unwrap();

        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);

        let mut out = [0u8; 15];
        BlockBackend::read_at(&emu.backend, &mut out, 2048).unwrap();
        assert_eq!(&out, b"written through");
    }

    #[tokio::test]
    async fn test_write_with_short_buffer_is_medium_error() {
        let emu = emulator_with_file(&[0u8; 4096]);
        // One block declared, half a block of buffer attached.
        let (mut cmd, _region) = cmd_for(&build::write_10(0, 1), 512);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::CHECK_CONDITION);
        assert_eq!(resp.sense().unwrap()[2], 0x03);
    }

    #[tokio::test]
    async fn test_unhandled_opcode_sense() {
        let emu = emulator_with_file(&[]);
        let cdb = [op::SYNCHRONIZE_CACHE_10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let (mut cmd, _region) = cmd_for(&cdb, 0);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), 0x02);
        let sense = resp.sense().unwrap();
        assert_eq!(
            [sense[0], sense[2], sense[7], sense[12], sense[13]],
            [0x70, 0x05, 0x0a, 0x20, 0x00]
        );
    }

    #[tokio::test]
    async fn test_scratch_buffer_reused_and_returned() {
        let emu = emulator_with_file(&[0u8; 4096]);
        let (mut cmd, _region) = cmd_for(&build::read_10(0, 2), 2048);
        cmd.scratch = Some(vec![0u8; 32 * 1024]);
        let resp = emu.handle_command(&mut cmd).await.unwrap();
        assert_eq!(resp.status(), status::GOOD);
        // The worker's buffer comes back, still at least as large.
        assert!(cmd.scratch.as_ref().unwrap().len() >= 32 * 1024);
    }
}
