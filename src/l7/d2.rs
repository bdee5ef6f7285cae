//! D2/KWP2000 application request family (C7): the standard diagnostic
//! services layered on top of an open [`crate::l2::Connection`]. This
//! crate is protocol-generic rather than tied to any one vehicle's PID
//! table; callers supply local/long-local identifiers directly.

use crate::error::{seterr, Error, Result};
use crate::l2::Connection;
use crate::l7::{Dtc, DtcReadWitness};
use crate::message::Message;

/// Service identifiers live in the manufacturer-defined 0xA0..0xBF range;
/// the names below follow KWP2000 convention but the wire formats are this
/// dialect's own, not standard KWP2000.
mod sid {
    pub const TESTER_PRESENT: u8 = 0xA1;
    pub const READ_DATA_BY_LOCAL_ID: u8 = 0xA5;
    pub const READ_DATA_BY_LONG_LOCAL_ID: u8 = 0xA6;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0xA7;
    pub const READ_FREEZE_FRAME_BY_DTC: u8 = 0xAD;
    pub const READ_DIAGNOSTIC_TROUBLE_CODES: u8 = 0xAE;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0xAF;
    pub const READ_NV_BY_LOCAL_ID: u8 = 0xB9;
    // Not present in the source this dialect was learned from; chosen as
    // unused slots in the manufacturer range and documented as such.
    pub const INPUT_OUTPUT_CONTROL: u8 = 0xB0;
    pub const START_ROUTINE_BY_LOCAL_ID: u8 = 0xB1;
}

fn positive(sid: u8) -> u8 {
    sid.wrapping_add(0x40)
}

/// Send a request and validate the response's leading service-ID byte,
/// mapping a `0x7F` negative response to [`Error::EcuSaidNo`].
fn call(conn: &Connection, sid: u8, params: &[u8], timeout_ms: u64) -> Result<Vec<u8>> {
    let mut payload = vec![sid];
    payload.extend_from_slice(params);
    let reply = conn.request(&Message::from_bytes(payload), timeout_ms)?;
    let data = reply.data();
    if data.is_empty() {
        return Err(seterr(Error::IncompleteData));
    }
    if data[0] == 0x7F {
        return Err(seterr(Error::EcuSaidNo));
    }
    if data[0] != positive(sid) {
        return Err(seterr(Error::BadData));
    }
    Ok(data[1..].to_vec())
}

/// `TesterPresent`, used here as a liveness check. Unlike every other
/// service in this family, the positive reply is a literal echo of the
/// request byte, not `sid + 0x40`.
pub fn ping(conn: &Connection, timeout_ms: u64) -> Result<()> {
    let reply = conn.request(&Message::from_bytes(vec![sid::TESTER_PRESENT]), timeout_ms)?;
    let data = reply.data();
    if data.is_empty() {
        return Err(seterr(Error::IncompleteData));
    }
    if data[0] == 0x7F {
        return Err(seterr(Error::EcuSaidNo));
    }
    if data[0] != sid::TESTER_PRESENT {
        return Err(seterr(Error::EcuSaidNo));
    }
    Ok(())
}

/// `ReadMemoryByAddress`: a fixed 6-byte request `[sid, 0x00, addr_hi,
/// addr_lo, 0x01, count]`. The `0x00`/`0x01` marker bytes and the
/// address are echoed in the reply (`[sid+0x40, 0x00, addr_hi, addr_lo,
/// data...]`); a mismatch on either marker or address is treated the
/// same as an explicit negative response.
pub fn read_memory_by_address(conn: &Connection, address: u16, size: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    let req = [
        sid::READ_MEMORY_BY_ADDRESS,
        0x00,
        (address >> 8) as u8,
        (address & 0xFF) as u8,
        0x01,
        size,
    ];
    let reply = conn.request(&Message::from_bytes(req.to_vec()), timeout_ms)?;
    let data = reply.data();
    if data.len() < 4 {
        return Err(seterr(Error::IncompleteData));
    }
    if data[0] == 0x7F {
        return Err(seterr(Error::EcuSaidNo));
    }
    if data[0] != positive(sid::READ_MEMORY_BY_ADDRESS) || data[1..4] != req[1..4] {
        return Err(seterr(Error::EcuSaidNo));
    }
    if data.len() != 4 + size as usize {
        return Err(seterr(Error::EcuSaidNo));
    }
    Ok(data[4..].to_vec())
}

pub fn read_data_by_local_identifier(conn: &Connection, local_id: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    let data = call(conn, sid::READ_DATA_BY_LOCAL_ID, &[local_id], timeout_ms)?;
    Ok(data.into_iter().skip(1).collect())
}

pub fn read_data_by_long_local_identifier(conn: &Connection, local_id: &[u8], timeout_ms: u64) -> Result<Vec<u8>> {
    call(conn, sid::READ_DATA_BY_LONG_LOCAL_ID, local_id, timeout_ms)
}

pub fn read_nv_by_local_identifier(conn: &Connection, local_id: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    call(conn, sid::READ_NV_BY_LOCAL_ID, &[local_id], timeout_ms)
}

pub fn read_freeze_frame_by_dtc(conn: &Connection, dtc: u16, frame: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    let params = [(dtc >> 8) as u8, (dtc & 0xFF) as u8, frame];
    call(conn, sid::READ_FREEZE_FRAME_BY_DTC, &params, timeout_ms)
}

/// `ReadDiagnosticTroubleCodes`. Returns both the decoded DTCs and a
/// witness permitting a subsequent [`clear_diagnostic_information`].
pub fn read_diagnostic_trouble_codes(conn: &Connection, timeout_ms: u64) -> Result<(Vec<Dtc>, DtcReadWitness)> {
    let data = call(conn, sid::READ_DIAGNOSTIC_TROUBLE_CODES, &[0x00, 0xFF], timeout_ms)?;
    let mut dtcs = Vec::new();
    if data.len() >= 2 {
        let mut i = 1; // skip count byte
        while i + 2 < data.len() {
            let code = ((data[i] as u16) << 8) | data[i + 1] as u16;
            let status = data[i + 2];
            if code != 0 {
                dtcs.push(Dtc::new(code, status));
            }
            i += 3;
        }
    }
    Ok((dtcs, DtcReadWitness(())))
}

/// `ClearDiagnosticInformation`. Requires a [`DtcReadWitness`] obtained
/// from [`read_diagnostic_trouble_codes`] on the same connection — the
/// compiler enforces "read before you clear" statically rather than at
/// runtime.
pub fn clear_diagnostic_information(conn: &Connection, _witness: DtcReadWitness, timeout_ms: u64) -> Result<()> {
    call(conn, sid::CLEAR_DIAGNOSTIC_INFO, &[0xFF, 0x00], timeout_ms)?;
    Ok(())
}

pub fn input_output_control(conn: &Connection, local_id: u8, control: &[u8], timeout_ms: u64) -> Result<Vec<u8>> {
    let mut params = vec![local_id];
    params.extend_from_slice(control);
    call(conn, sid::INPUT_OUTPUT_CONTROL, &params, timeout_ms)
}

pub fn start_routine_by_local_identifier(conn: &Connection, routine_id: u8, timeout_ms: u64) -> Result<Vec<u8>> {
    call(conn, sid::START_ROUTINE_BY_LOCAL_ID, &[routine_id], timeout_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l0::RawDriver;
    use crate::l1::L1Flags;
    use crate::l2::{start_communications, L2Flags, L2Protocol};

    struct StubProto {
        reply: Vec<u8>,
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
            Ok(Message::from_bytes(self.reply.clone()))
        }
    }

    #[test]
    fn ping_accepts_literal_echo() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let reply = vec![0xA1];
        let conn = start_communications(l0, Box::new(StubProto { reply }), 10400, 0x7A, 0xF1).unwrap();
        ping(&conn, 1000).unwrap();
    }

    #[test]
    fn ping_rejects_negative_response() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let reply = vec![0x7F, 0xA1, 0x11];
        let conn = start_communications(l0, Box::new(StubProto { reply }), 10400, 0x7A, 0xF1).unwrap();
        let err = ping(&conn, 1000).unwrap_err();
        assert!(matches!(err, Error::EcuSaidNo));
    }

    #[test]
    fn read_memory_by_address_validates_mirror_and_returns_data() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let reply = vec![0xE7, 0x00, 0x12, 0x34, 0xAA, 0xBB, 0xCC, 0xDD];
        let conn = start_communications(l0, Box::new(StubProto { reply }), 10400, 0x7A, 0xF1).unwrap();
        let data = read_memory_by_address(&conn, 0x1234, 4, 1000).unwrap();
        assert_eq!(data, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn read_memory_by_address_rejects_mirror_mismatch() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let reply = vec![0xE7, 0x00, 0x99, 0x99, 0xAA, 0xBB, 0xCC, 0xDD];
        let conn = start_communications(l0, Box::new(StubProto { reply }), 10400, 0x7A, 0xF1).unwrap();
        let err = read_memory_by_address(&conn, 0x1234, 4, 1000).unwrap_err();
        assert!(matches!(err, Error::EcuSaidNo));
    }

    #[test]
    fn read_dtc_parses_two_codes() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let reply = vec![0xEE, 0x02, 0x01, 0x23, 0x08, 0x00, 0x00, 0x00];
        let conn = start_communications(l0, Box::new(StubProto { reply }), 10400, 0x10, 0xF1).unwrap();
        let (dtcs, _witness) = read_diagnostic_trouble_codes(&conn, 1000).unwrap();
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].code, 0x0123);
        assert_eq!(dtcs[0].label, "P0123");
    }

    #[test]
    fn clear_accepts_a_witness_from_read() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let read_reply = vec![0xEE, 0x00];
        let conn = start_communications(l0, Box::new(StubProto { reply: read_reply }), 10400, 0x10, 0xF1).unwrap();
        let (_dtcs, _witness) = read_diagnostic_trouble_codes(&conn, 1000).unwrap();

        // A fresh connection whose stub replies positively to Clear; the
        // witness type only proves a read happened on *some* connection
        // (the compile-time guard this module enforces), so it transfers.
        let l0_clear = Box::new(RawDriver::with_canned_echo(vec![]));
        let clear_conn = start_communications(
            l0_clear,
            Box::new(StubProto { reply: vec![0xEF] }),
            10400,
            0x10,
            0xF1,
        )
        .unwrap();
        clear_diagnostic_information(&clear_conn, DtcReadWitness(()), 1000).unwrap();
    }

    #[test]
    fn negative_response_maps_to_ecu_said_no() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let reply = vec![0x7F, 0xA5, 0x11];
        let conn = start_communications(l0, Box::new(StubProto { reply }), 10400, 0x10, 0xF1).unwrap();
        let err = read_data_by_local_identifier(&conn, 0x01, 1000).unwrap_err();
        assert!(matches!(err, Error::EcuSaidNo));
    }
}
