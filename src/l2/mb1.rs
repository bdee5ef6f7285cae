//! Mercedes MB1 L2 protocol (`mb1`, C6): `[dest, cmd, total_len, data.., cksum_lo, cksum_hi]`
//! framing with a 16-bit additive checksum and a 1-second keep-alive.

use crate::error::{seterr, Error, Result};
use crate::l0::L0Driver;
use crate::l1::{InitBusArgs, InitType, L1Flags};
use crate::l2::{L2Flags, L2Protocol};
use crate::message::Message;
use crate::os::sleep_ms;

const KEEPALIVE_CMD: u8 = 0x50;
const HDRLEN: usize = 3;
const CKSUMLEN: usize = 2;
const MAXLEN: usize = 255;

fn checksum16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

pub struct Mb1 {
    target: u8,
}

impl Default for Mb1 {
    fn default() -> Self {
        Mb1 { target: 0 }
    }
}

impl L2Protocol for Mb1 {
    fn flags(&self) -> L2Flags {
        L2Flags::FRAMED | L2Flags::KEEPALIVE
    }

    fn startcomms(
        &mut self,
        l0: &mut dyn L0Driver,
        _l1_flags: L1Flags,
        bitrate: u32,
        target: u8,
        _source: u8,
    ) -> Result<(u8, u8)> {
        self.target = target;
        l0.set_baud(bitrate)?;
        sleep_ms(300);
        l0.init(InitBusArgs::new(InitType::TwoSlow, target))
    }

    fn send(&mut self, l0: &mut dyn L0Driver, msg: &Message) -> Result<()> {
        let data = msg.data();
        if data.is_empty() || data.len() > MAXLEN - HDRLEN - CKSUMLEN {
            return Err(seterr(Error::BadLen));
        }
        let cmd = data[0];
        let payload = &data[1..];
        let mut buf = Vec::with_capacity(HDRLEN + payload.len() + CKSUMLEN);
        buf.push(self.target);
        buf.push(cmd);
        buf.push((HDRLEN + payload.len()) as u8);
        buf.extend_from_slice(payload);
        let cks = checksum16(&buf);
        buf.push((cks & 0xFF) as u8);
        buf.push((cks >> 8) as u8);
        l0.send(&buf)
    }

    fn recv(&mut self, l0: &mut dyn L0Driver, timeout_ms: u64) -> Result<Message> {
        let mut buf = [0u8; 256];
        let n = l0.recv(&mut buf, timeout_ms)?;
        if n < HDRLEN + CKSUMLEN {
            return Err(seterr(Error::IncompleteData));
        }
        let body = &buf[..n - CKSUMLEN];
        let expect = checksum16(body);
        let got = buf[n - 2] as u16 | ((buf[n - 1] as u16) << 8);
        if expect != got {
            return Err(seterr(Error::BadCsum));
        }
        let mut data = vec![buf[1]];
        data.extend_from_slice(&buf[HDRLEN..n - CKSUMLEN]);
        let mut msg = Message::from_bytes(data);
        msg.src = buf[0];
        Ok(msg)
    }

    fn timeout(&mut self, l0: &mut dyn L0Driver) -> Result<()> {
        let req = Message::from_bytes(vec![KEEPALIVE_CMD]);
        let _ = self.request(l0, &req, 1000);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l0::RawDriver;

    #[test]
    fn send_rejects_empty_payload() {
        let mut proto = Mb1 { target: 0x01 };
        let mut l0 = RawDriver::with_canned_echo(vec![]);
        assert!(matches!(
            proto.send(&mut l0, &Message::from_bytes(vec![])).unwrap_err(),
            Error::BadLen
        ));
    }

    #[test]
    fn send_builds_checksummed_frame() {
        let mut proto = Mb1 { target: 0x01 };
        let mut l0 = RawDriver::with_canned_echo(vec![]);
        proto.send(&mut l0, &Message::from_bytes(vec![0x30, 0xAA])).unwrap();
        assert_eq!(l0.sent[0], 0x01);
        assert_eq!(l0.sent[1], 0x30);
        assert_eq!(l0.sent[2], 4);
        assert_eq!(l0.sent[3], 0xAA);
        let cks = checksum16(&l0.sent[..4]);
        assert_eq!(l0.sent[4], (cks & 0xFF) as u8);
        assert_eq!(l0.sent[5], (cks >> 8) as u8);
    }

    #[test]
    fn recv_detects_checksum_mismatch() {
        let mut proto = Mb1::default();
        let mut l0 = RawDriver::with_canned_echo(vec![0x01, 0x30, 4, 0xAA, 0x00, 0x00]);
        assert!(matches!(
            proto.recv(&mut l0, 10).unwrap_err(),
            Error::BadCsum
        ));
    }
}
