//! Raw L2 protocol (`raw`, C6): no framing, no checksum, no handshake —
//! a passthrough for interfaces that already deliver clean application
//! bytes, or for exercising an L0 driver directly in tests.

use crate::error::Result;
use crate::l0::L0Driver;
use crate::l1::L1Flags;
use crate::l2::{L2Flags, L2Protocol};
use crate::message::Message;

#[derive(Default)]
pub struct Raw;

impl L2Protocol for Raw {
    fn flags(&self) -> L2Flags {
        L2Flags::empty()
    }

    fn startcomms(
        &mut self,
        _l0: &mut dyn L0Driver,
        _l1_flags: L1Flags,
        _bitrate: u32,
        _target: u8,
        _source: u8,
    ) -> Result<(u8, u8)> {
        Ok((0, 0))
    }

    fn send(&mut self, l0: &mut dyn L0Driver, msg: &Message) -> Result<()> {
        l0.send(msg.data())
    }

    fn recv(&mut self, l0: &mut dyn L0Driver, timeout_ms: u64) -> Result<Message> {
        let mut buf = [0u8; 256];
        let n = l0.recv(&mut buf, timeout_ms)?;
        Ok(Message::from_bytes(buf[..n].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l0::RawDriver;

    #[test]
    fn send_passes_payload_through_unframed() {
        let mut proto = Raw;
        let mut l0 = RawDriver::with_canned_echo(vec![]);
        proto.send(&mut l0, &Message::from_bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(l0.sent, vec![1, 2, 3]);
    }

    #[test]
    fn recv_returns_whatever_l0_delivers() {
        let mut proto = Raw;
        let mut l0 = RawDriver::with_canned_echo(vec![9, 8, 7]);
        let msg = proto.recv(&mut l0, 10).unwrap();
        assert_eq!(msg.data(), &[9, 8, 7]);
    }
}
