//! ISO 9141-2 L2 protocol (`iso9141`, C6): 5-baud handshake plus a
//! three-state receive machine that splits overlong messages.

use tracing::warn;

use crate::error::{seterr, Error, Result};
use crate::l0::L0Driver;
use crate::l1::{InitBusArgs, InitType, L1Flags};
use crate::l2::{L2Flags, L2Protocol};
use crate::message::{checksum, Fmt, Message};
use crate::os::sleep_ms;

const HDR: [u8; 2] = [0x48, 0x6B];
const SEND_HDR: [u8; 2] = [0x68, 0x6A];
const MAXLEN_ISO9141: usize = 11;
const OHLEN_ISO9141: usize = 4; // 3-byte header + 1 checksum byte
const RXTOFFSET_MS: u64 = 5;
const W5_MIN_MS: u64 = 300;
const W4_MIN_MS: u64 = 25;
const W4_MAX_MS: u64 = 59;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitMode {
    Monitor,
    SlowInit,
}

pub struct Iso9141 {
    mode: InitMode,
    target: u8,
    source: u8,
    p2min: u64,
}

impl Default for Iso9141 {
    fn default() -> Self {
        Iso9141 {
            mode: InitMode::SlowInit,
            target: 0,
            source: 0xF1,
            p2min: 25,
        }
    }
}

impl Iso9141 {
    pub fn monitor() -> Self {
        Iso9141 {
            mode: InitMode::Monitor,
            ..Iso9141::default()
        }
    }

    fn wakeup_ecu(&mut self, l0: &mut dyn L0Driver, l1_flags: L1Flags, addr: u8) -> Result<()> {
        l0.set_baud(10400)?;
        sleep_ms(W5_MIN_MS);

        l0.init(InitBusArgs::new(InitType::FiveBaud, addr))?;

        if l1_flags.contains(L1Flags::DOES_FULLINIT) {
            // The adapter performed the whole handshake on-board and we
            // never see real key bytes. Reproduced verbatim from the
            // original: "possibly not true, but who cares" — callers in
            // this state never observe real key bytes anyway.
            self.p2min = 25;
            return Ok(());
        }

        let mut kb = [0u8; 2];
        let n1 = l0.recv(&mut kb[..1], 24 + RXTOFFSET_MS)?;
        let n2 = l0.recv(&mut kb[1..], 24 + RXTOFFSET_MS)?;
        if n1 != 1 || n2 != 1 {
            return Err(seterr(Error::IncompleteData));
        }
        if kb[0] != kb[1] || (kb[0] != 0x08 && kb[0] != 0x94) {
            return Err(seterr(Error::WrongKeyBytes));
        }
        self.p2min = if kb[0] == 0x94 { 0 } else { 25 };

        if !l1_flags.contains(L1Flags::DOES_SLOWINIT) {
            sleep_ms(W4_MIN_MS);
            l0.send(&[!kb[1]])?;
            let mut inv_addr = [0u8; 1];
            let n = l0.recv(&mut inv_addr, W4_MAX_MS + RXTOFFSET_MS)?;
            if n != 1 || inv_addr[0] != !addr {
                return Err(seterr(Error::BadData));
            }
        }
        Ok(())
    }

    /// Three-state receive machine.
    fn int_recv(&mut self, l0: &mut dyn L0Driver, timeout_ms: u64, l1_flags: L1Flags) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut first = [0u8; 1];
        let n = l0.recv(&mut first, timeout_ms)?;
        if n == 0 {
            return Err(Error::Timeout);
        }
        buf.push(first[0]);

        if !l1_flags.contains(L1Flags::DOES_L2_FRAME) {
            let state2_timeout = (20u64).max(self.p2min.saturating_sub(2)).max(1);
            loop {
                let mut b = [0u8; 1];
                match l0.recv(&mut b, state2_timeout) {
                    Ok(1) => buf.push(b[0]),
                    _ => break,
                }
            }
        } else {
            let mut rest = [0u8; 256];
            if let Ok(n) = l0.recv(&mut rest, timeout_ms) {
                buf.extend_from_slice(&rest[..n]);
            }
        }
        Ok(buf)
    }

    fn decode(&self, raw: &[u8], l1_flags: L1Flags) -> Result<Message> {
        let mut msg = if l1_flags.contains(L1Flags::NO_HDRS) {
            Message::from_bytes(raw.to_vec())
        } else {
            if raw.len() < 3 || raw[0] != HDR[0] || raw[1] != HDR[1] {
                return Err(seterr(Error::BadData));
            }
            let mut m = Message::from_bytes(raw[3..].to_vec());
            m.src = raw[2];
            m.dest = 0xF1;
            m
        };

        if !l1_flags.contains(L1Flags::STRIP_L2_CKSUM) {
            let body = &raw[..raw.len().saturating_sub(1)];
            let cs = checksum(body);
            if raw.last().copied().unwrap_or(0) != cs {
                msg.fmt.insert(Fmt::BAD_CS);
            }
            msg.truncate(msg.len().saturating_sub(1));
        }
        msg.fmt.insert(Fmt::CKSUMMED);
        Ok(msg)
    }
}

impl L2Protocol for Iso9141 {
    fn flags(&self) -> L2Flags {
        L2Flags::FRAMED
    }

    fn startcomms(
        &mut self,
        l0: &mut dyn L0Driver,
        l1_flags: L1Flags,
        _bitrate: u32,
        target: u8,
        source: u8,
    ) -> Result<(u8, u8)> {
        self.target = target;
        self.source = source;
        match self.mode {
            InitMode::Monitor => Ok((0, 0)),
            InitMode::SlowInit => {
                self.wakeup_ecu(l0, l1_flags, target)?;
                Ok((0x08, 0x08))
            }
        }
    }

    fn send(&mut self, l0: &mut dyn L0Driver, msg: &Message) -> Result<()> {
        if msg.len() + OHLEN_ISO9141 > MAXLEN_ISO9141 + OHLEN_ISO9141 {
            return Err(seterr(Error::BadLen));
        }
        sleep_ms(crate::l2::Timing::default().p3min);

        let l1_flags = l0.getflags();
        if l1_flags.contains(L1Flags::DATA_ONLY) {
            return l0.send(msg.data());
        }

        let mut buf = Vec::with_capacity(msg.len() + OHLEN_ISO9141);
        buf.extend_from_slice(&SEND_HDR);
        buf.push(self.source);
        buf.extend_from_slice(msg.data());
        if !l1_flags.contains(L1Flags::DOES_L2_CKSUM) {
            buf.push(checksum(&buf));
        }
        l0.send(&buf)
    }

    fn recv(&mut self, l0: &mut dyn L0Driver, timeout_ms: u64) -> Result<Message> {
        let l1_flags = l0.getflags();
        let raw = self.int_recv(l0, timeout_ms, l1_flags)?;

        if raw.len() <= MAXLEN_ISO9141 + OHLEN_ISO9141 {
            self.decode(&raw, l1_flags)
        } else {
            // Overlong message: split into <= 11-byte payload chunks,
            // the predecessor duplicated and trimmed so payload
            // concatenation equals the original.
            let mut whole = self.decode(&raw, l1_flags)?;
            let mut chain: Option<Message> = None;
            while whole.len() > MAXLEN_ISO9141 {
                let head = whole.split_prefix(MAXLEN_ISO9141);
                match &mut chain {
                    Some(c) => c.push_back(head),
                    None => chain = Some(head),
                }
            }
            match &mut chain {
                Some(c) => {
                    c.push_back(whole);
                    Ok(chain.unwrap())
                }
                None => Ok(whole),
            }
        }
    }

    fn timeout(&mut self, _l0: &mut dyn L0Driver) -> Result<()> {
        warn!("ISO9141 has no keep-alive handler; nothing to do");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l0::RawDriver;

    #[test]
    fn send_rejects_overlong_payload() {
        let mut proto = Iso9141::default();
        let mut l0 = RawDriver::with_canned_echo(vec![]);
        let msg = Message::from_bytes(vec![0u8; 20]);
        let err = proto.send(&mut l0, &msg).unwrap_err();
        assert!(matches!(err, Error::BadLen));
    }

    #[test]
    fn decode_validates_header_and_checksum() {
        let proto = Iso9141::default();
        let mut body = vec![0x48, 0x6B, 0x10, 0xAA, 0xBB];
        let cs = checksum(&body);
        body.push(cs);
        let msg = proto.decode(&body, L1Flags::empty()).unwrap();
        assert_eq!(msg.data(), &[0xAA, 0xBB]);
        assert!(!msg.fmt.contains(Fmt::BAD_CS));
    }

    #[test]
    fn decode_flags_bad_checksum() {
        let proto = Iso9141::default();
        let mut body = vec![0x48, 0x6B, 0x10, 0xAA, 0xBB];
        body.push(0x00);
        let msg = proto.decode(&body, L1Flags::empty()).unwrap();
        assert!(msg.fmt.contains(Fmt::BAD_CS));
    }
}
