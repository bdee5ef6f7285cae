//! D2 (Volvo KWP2000 dialect) L2 protocol (`d2`, C6): a framed,
//! checksummed message format handled by an intelligent L0.

use tracing::warn;

use crate::error::{seterr, Error, Result};
use crate::l0::L0Driver;
use crate::l1::{InitBusArgs, InitType, L1Flags};
use crate::l2::{L2Flags, L2Protocol, Timing};
use crate::message::{checksum, Fmt, Message};
use crate::os::sleep_ms;

const DEFAULT_TESTER_ADDR: u8 = 0x13;
const KB1_EXPECTED: u8 = 0xD3;
const KB2_EXPECTED: u8 = 0xB0;
const STOP_DIAGNOSTIC_SESSION: u8 = 0xA0;
const TESTER_PRESENT: u8 = 0xA1;

pub struct D2 {
    target: u8,
    source: u8,
}

impl Default for D2 {
    fn default() -> Self {
        D2 { target: 0, source: 0 }
    }
}

impl L2Protocol for D2 {
    fn flags(&self) -> L2Flags {
        L2Flags::FRAMED | L2Flags::KEEPALIVE
    }

    fn startcomms(
        &mut self,
        l0: &mut dyn L0Driver,
        l1_flags: L1Flags,
        _bitrate: u32,
        target: u8,
        source: u8,
    ) -> Result<(u8, u8)> {
        if !l1_flags.contains(L1Flags::DOES_FULLINIT) || !l1_flags.contains(L1Flags::DOES_L2_CKSUM) {
            return Err(seterr(Error::ProtoNotSupported));
        }
        if !l1_flags.contains(L1Flags::DOES_SLOWINIT) && !l1_flags.contains(L1Flags::SLOW) {
            return Err(seterr(Error::InitNotSupported));
        }
        if source != DEFAULT_TESTER_ADDR {
            warn!(source, "D2 tester address is conventionally 0x13");
        }

        self.target = target;
        self.source = source;

        l0.set_baud(10400)?;
        sleep_ms(300);

        let (kb1, kb2) = l0.init(InitBusArgs::new(InitType::FiveBaud, target))?;
        if kb1 == 0 && kb2 == 0 {
            warn!("adapter returned no key bytes; defaulting to D3B0");
            return Ok((KB1_EXPECTED, KB2_EXPECTED));
        }
        if kb1 != KB1_EXPECTED || kb2 != KB2_EXPECTED {
            return Err(seterr(Error::WrongKeyBytes));
        }
        Ok((kb1, kb2))
    }

    fn stopcomms(&mut self, l0: &mut dyn L0Driver) -> Result<()> {
        let req = Message::from_bytes(vec![STOP_DIAGNOSTIC_SESSION]);
        if self.request(l0, &req, 1000).is_err() {
            sleep_ms(5000);
        }
        Ok(())
    }

    fn send(&mut self, l0: &mut dyn L0Driver, msg: &Message) -> Result<()> {
        let len = msg.len();
        if len == 0 || len > 62 {
            return Err(seterr(Error::BadLen));
        }
        let mut buf = Vec::with_capacity(len + 4);
        buf.push(0x80 + (len as u8 + 1));
        buf.push(self.target);
        buf.push(self.source);
        buf.extend_from_slice(msg.data());
        buf.push(checksum(&buf));
        sleep_ms(Timing::default().p3min);
        l0.send(&buf)
    }

    fn recv(&mut self, l0: &mut dyn L0Driver, timeout_ms: u64) -> Result<Message> {
        let mut buf = [0u8; 256];
        let n = l0.recv(&mut buf, timeout_ms + 100)?;
        if n < 5 {
            return Err(seterr(Error::IncompleteData));
        }
        let mut msg = Message::from_bytes(buf[3..n - 1].to_vec());
        msg.dest = buf[1];
        msg.src = buf[2];
        msg.fmt.insert(Fmt::FRAMED);
        Ok(msg)
    }

    fn timeout(&mut self, l0: &mut dyn L0Driver) -> Result<()> {
        let req = Message::from_bytes(vec![TESTER_PRESENT]);
        let _ = self.request(l0, &req, 1000);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_rejects_zero_and_overlong_payload() {
        let mut proto = D2 {
            target: 0x7A,
            source: 0x13,
        };
        let mut l0 = crate::l0::RawDriver::with_canned_echo(vec![]);
        assert!(matches!(
            proto.send(&mut l0, &Message::from_bytes(vec![])).unwrap_err(),
            Error::BadLen
        ));
        assert!(matches!(
            proto.send(&mut l0, &Message::from_bytes(vec![0u8; 63])).unwrap_err(),
            Error::BadLen
        ));
    }

    #[test]
    fn send_accepts_boundary_62_bytes() {
        let mut proto = D2 {
            target: 0x7A,
            source: 0x13,
        };
        let mut l0 = crate::l0::RawDriver::with_canned_echo(vec![]);
        assert!(proto.send(&mut l0, &Message::from_bytes(vec![0u8; 62])).is_ok());
    }

    #[test]
    fn send_builds_expected_frame() {
        let mut proto = D2 {
            target: 0x7A,
            source: 0x13,
        };
        let mut l0 = crate::l0::RawDriver::with_canned_echo(vec![]);
        proto.send(&mut l0, &Message::from_bytes(vec![0xA1])).unwrap();
        let expected_len = 0x80 + 2u8;
        assert_eq!(l0.sent[0], expected_len);
        assert_eq!(l0.sent[1], 0x7A);
        assert_eq!(l0.sent[2], 0x13);
        assert_eq!(l0.sent[3], 0xA1);
        assert_eq!(l0.sent[4], checksum(&l0.sent[..4]));
    }
}
