//! KWP71/KWP1281 application request family (C7): block "title" bytes
//! stand in for KWP2000 service IDs, and responses are distinguished by
//! address-space-specific title bytes rather than a `sid+0x40` rule.
//! DTCs use KWP71's fixed 5-byte-per-entry encoding (no status-mask
//! request).

use crate::error::{seterr, Error, Result};
use crate::l2::Connection;
use crate::l7::{Dtc, DtcReadWitness};
use crate::message::Message;
use crate::os::sleep_ms;

mod title {
    pub const READ_RAM: u8 = 0x01;
    pub const READ_RAM_RESPONSE: u8 = 0xFE;
    pub const READ_ROM: u8 = 0x03;
    pub const READ_ROM_RESPONSE: u8 = 0xFD;
    pub const READ_ADC: u8 = 0x08;
    pub const READ_ADC_RESPONSE: u8 = 0xFB;
    pub const READ_DTC: u8 = 0x07;
    pub const READ_DTC_RESPONSE: u8 = 0xFC;
    pub const CLEAR_DTC: u8 = 0x05;
    pub const ACK: u8 = 0x09;
}

const DTC_STRIDE: usize = 5;
const CLEAR_DTC_PAUSE_MS: u64 = 500;

fn request(conn: &Connection, req_title: u8, data: Vec<u8>, expect_title: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    let mut msg = Message::from_bytes(data);
    msg.ty = req_title;
    let reply = conn.request(&msg, timeout_ms)?;
    if reply.ty != expect_title {
        return Err(seterr(Error::BadData));
    }
    Ok(reply.data().to_vec())
}

pub fn read_memory(conn: &Connection, address: u16, count: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    let data = vec![count, (address >> 8) as u8, (address & 0xFF) as u8];
    request(conn, title::READ_RAM, data, title::READ_RAM_RESPONSE, timeout_ms)
}

pub fn read_rom(conn: &Connection, address: u16, count: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    let data = vec![count, (address >> 8) as u8, (address & 0xFF) as u8];
    request(conn, title::READ_ROM, data, title::READ_ROM_RESPONSE, timeout_ms)
}

pub fn read_adc(conn: &Connection, channel: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    request(conn, title::READ_ADC, vec![channel], title::READ_ADC_RESPONSE, timeout_ms)
}

/// Fixed 5-byte-per-entry DTC block: `[hi, lo, status, freeze_hi, freeze_lo]`.
pub fn read_diagnostic_trouble_codes(conn: &Connection, timeout_ms: u64) -> Result<(Vec<Dtc>, DtcReadWitness)> {
    let data = request(conn, title::READ_DTC, vec![], title::READ_DTC_RESPONSE, timeout_ms)?;
    let mut dtcs = Vec::new();
    for chunk in data.chunks_exact(DTC_STRIDE) {
        let code = ((chunk[0] as u16) << 8) | chunk[1] as u16;
        if code != 0 {
            dtcs.push(Dtc::new(code, chunk[2]));
        }
    }
    Ok((dtcs, DtcReadWitness(())))
}

/// Clear DTCs, requiring the same read-first witness as the D2 family,
/// then pause `CLEAR_DTC_PAUSE_MS` for the ECU's clear-and-rewrite cycle
/// to complete before the connection is used again.
pub fn clear_diagnostic_information(conn: &Connection, _witness: DtcReadWitness, timeout_ms: u64) -> Result<()> {
    request(conn, title::CLEAR_DTC, vec![], title::ACK, timeout_ms)?;
    sleep_ms(CLEAR_DTC_PAUSE_MS);
    Ok(())
}

pub fn tester_present(conn: &Connection, timeout_ms: u64) -> Result<()> {
    request(conn, title::ACK, vec![], title::ACK, timeout_ms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l0::RawDriver;
    use crate::l1::L1Flags;
    use crate::l2::{start_communications, L2Flags, L2Protocol};

    struct StubProto {
        reply_ty: u8,
        reply_data: Vec<u8>,
    }
    impl L2Protocol for StubProto {
        fn flags(&self) -> L2Flags {
            L2Flags::empty()
        }
        fn startcomms(
            &mut self,
            _l0: &mut dyn crate::l0::L0Driver,
            _l1_flags: L1Flags,
            _bitrate: u32,
            _target: u8,
            _source: u8,
        ) -> Result<(u8, u8)> {
            Ok((0, 0))
        }
        fn send(&mut self, _l0: &mut dyn crate::l0::L0Driver, _msg: &Message) -> Result<()> {
            Ok(())
        }
        fn recv(&mut self, _l0: &mut dyn crate::l0::L0Driver, _timeout_ms: u64) -> Result<Message> {
            let mut m = Message::from_bytes(self.reply_data.clone());
            m.ty = self.reply_ty;
            Ok(m)
        }
    }

    #[test]
    fn read_dtc_parses_fixed_stride_entries() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let reply_data = vec![0x01, 0x23, 0x08, 0x00, 0x00];
        let conn = start_communications(
            l0,
            Box::new(StubProto {
                reply_ty: title::READ_DTC_RESPONSE,
                reply_data,
            }),
            9600,
            0x01,
            0xF1,
        )
        .unwrap();
        let (dtcs, _witness) = read_diagnostic_trouble_codes(&conn, 1000).unwrap();
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].label, "P0123");
    }

    #[test]
    fn mismatched_response_title_is_bad_data() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let conn = start_communications(
            l0,
            Box::new(StubProto {
                reply_ty: 0x00,
                reply_data: vec![],
            }),
            9600,
            0x01,
            0xF1,
        )
        .unwrap();
        let err = read_adc(&conn, 0x03, 1000).unwrap_err();
        assert!(matches!(err, Error::BadData));
    }
}
