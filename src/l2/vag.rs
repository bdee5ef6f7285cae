//! KWP1281 (VAG) L2 protocol (`vag`, C6): byte-level echo-inversion
//! reliability plus block-level sequence numbering with retransmit.
//!
//! The sequence-increment-on-retry behavior is a deliberate deviation
//! from SAE J2818, reproduced here as the shipped default (see
//! DESIGN.md "Open Question decisions").

use crate::error::{seterr, Error, Result};
use crate::l0::L0Driver;
use crate::l1::{InitBusArgs, InitType, L1Flags};
use crate::l2::{L2Flags, L2Protocol};
use crate::message::Message;
use crate::os::sleep_ms;

const KB1_EXPECTED: u8 = 0x01;
const KB2_EXPECTED: u8 = 0x8A;
const KWP1281_END_BYTE: u8 = 0x03;
const SID_ACK: u8 = 0x09;
const SID_NO_ACK: u8 = 0x0A;

const T_R0_MS: u64 = 300;
const T_R4_MIN_MS: u64 = 25;
const T_R5_MAX_MS: u64 = 5000;
const T_R7_MAX_MS: u64 = 50;
const T_R8_MS: u64 = 55;
const T_RB_MAX_MS: u64 = 1100;

const NA_RETRIES: u32 = 5;
const TO_RETRIES: u32 = 3;

/// Restores the literal SAE J2818 sequence-retention behavior on retry
/// instead of the incrementing default (DESIGN.md Open Question).
pub struct Vag {
    seq_nr: u8,
    master: bool,
    first_telegram: Option<Message>,
    strict_sae: bool,
}

impl Default for Vag {
    fn default() -> Self {
        Vag {
            seq_nr: 0,
            master: false,
            first_telegram: None,
            strict_sae: false,
        }
    }
}

impl Vag {
    pub fn with_strict_sae(strict_sae: bool) -> Self {
        Vag {
            strict_sae,
            ..Vag::default()
        }
    }

    fn send_byte_with_echo_retry(&self, l0: &mut dyn L0Driver, byte: u8) -> Result<()> {
        for _ in 0..TO_RETRIES {
            l0.send(&[byte])?;
            let mut echo = [0u8; 1];
            if l0.recv(&mut echo, T_R8_MS)? == 1 && echo[0] == !byte {
                return Ok(());
            }
        }
        Err(seterr(Error::BadCsum))
    }

    fn recv_byte_with_echo(&self, l0: &mut dyn L0Driver, timeout_ms: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        let n = l0.recv(&mut b, timeout_ms)?;
        if n == 0 {
            return Err(Error::Timeout);
        }
        l0.send(&[!b[0]])?;
        Ok(b[0])
    }

    /// Send one block `[len, seq, title, data.., 0x03]`, byte by byte,
    /// each validated by its echo-inverted reply.
    fn send_block(&mut self, l0: &mut dyn L0Driver, title: u8, data: &[u8]) -> Result<()> {
        let len = (data.len() + 3) as u8;
        let mut block = vec![len, self.seq_nr, title];
        block.extend_from_slice(data);
        block.push(KWP1281_END_BYTE);

        for &byte in &block {
            self.send_byte_with_echo_retry(l0, byte)?;
        }
        self.master = false;
        Ok(())
    }

    /// Receive one block, retrying up to [`NA_RETRIES`] times with a
    /// `NO_ACK_RETRY` block on a sequence mismatch.
    fn recv_block(&mut self, l0: &mut dyn L0Driver, first_timeout_ms: u64) -> Result<(u8, u8, Vec<u8>)> {
        for attempt in 0..=NA_RETRIES {
            let timeout = if attempt == 0 { first_timeout_ms } else { T_RB_MAX_MS };
            let len = self.recv_byte_with_echo(l0, timeout).map_err(|e| {
                if attempt == 0 {
                    seterr(Error::BadBaudRate)
                } else {
                    e
                }
            })? as usize;

            let mut rest = Vec::with_capacity(len);
            for _ in 0..len {
                rest.push(self.recv_byte_with_echo(l0, T_R7_MAX_MS)?);
            }
            if rest.last().copied() != Some(KWP1281_END_BYTE) || rest.len() < 3 {
                return Err(seterr(Error::BadData));
            }

            let seq = rest[0];
            let title = rest[1];
            let data = rest[2..rest.len() - 1].to_vec();

            let expected = self.seq_nr.wrapping_add(1);
            if seq == expected {
                self.seq_nr = seq.wrapping_add(1);
                self.master = true;
                return Ok((seq, title, data));
            }

            if !self.strict_sae {
                self.seq_nr = self.seq_nr.wrapping_add(2);
            }
            let last_accepted = self.seq_nr.wrapping_sub(1);
            self.master = true;
            self.send_block(l0, SID_NO_ACK, &[last_accepted])?;
        }
        Err(seterr(Error::EcuSaidNo))
    }
}

impl L2Protocol for Vag {
    fn flags(&self) -> L2Flags {
        L2Flags::KEEPALIVE
    }

    fn startcomms(
        &mut self,
        l0: &mut dyn L0Driver,
        _l1_flags: L1Flags,
        bitrate: u32,
        target: u8,
        _source: u8,
    ) -> Result<(u8, u8)> {
        l0.set_baud(bitrate)?;
        sleep_ms(T_R0_MS);

        let (kb1, kb2) = l0.init(InitBusArgs::new(InitType::FiveBaud, target))?;
        if kb1 != KB1_EXPECTED || kb2 != KB2_EXPECTED {
            return Err(seterr(Error::WrongKeyBytes));
        }

        sleep_ms(T_R4_MIN_MS);
        l0.send(&[!kb2])?;

        self.seq_nr = 0;
        self.master = false;
        let (_seq, title, data) = self.recv_block(l0, T_R5_MAX_MS)?;
        let mut telegram = Message::from_bytes(data);
        telegram.ty = title;
        self.first_telegram = Some(telegram);

        Ok((kb1, kb2))
    }

    fn stopcomms(&mut self, _l0: &mut dyn L0Driver) -> Result<()> {
        sleep_ms(T_RB_MAX_MS);
        Ok(())
    }

    fn send(&mut self, l0: &mut dyn L0Driver, msg: &Message) -> Result<()> {
        self.send_block(l0, msg.ty, msg.data())
    }

    fn recv(&mut self, l0: &mut dyn L0Driver, timeout_ms: u64) -> Result<Message> {
        if let Some(stashed) = self.first_telegram.take() {
            return Ok(stashed);
        }
        let (_seq, title, data) = self.recv_block(l0, timeout_ms)?;
        let mut msg = Message::from_bytes(data);
        msg.ty = title;
        Ok(msg)
    }

    fn request(&mut self, l0: &mut dyn L0Driver, msg: &Message, timeout_ms: u64) -> Result<Message> {
        self.send(l0, msg)?;
        let mut head: Option<Message> = None;
        loop {
            let (_seq, title, data) = self.recv_block(l0, timeout_ms)?;
            let mut m = Message::from_bytes(data);
            m.ty = title;
            let is_final_ack = title == SID_ACK;
            match &mut head {
                None => head = Some(m),
                Some(h) => h.push_back(m),
            }
            if is_final_ack {
                break;
            }
            self.send_block(l0, SID_ACK, &[])?;
        }
        head.ok_or_else(|| seterr(Error::IncompleteData))
    }

    fn timeout(&mut self, l0: &mut dyn L0Driver) -> Result<()> {
        self.master = true;
        let _ = self.send_block(l0, SID_ACK, &[]);
        let _ = self.recv_block(l0, T_RB_MAX_MS);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l0::RawDriver;

    fn echo_driver(bytes_from_ecu: &[u8]) -> RawDriver {
        // Each byte we send gets echoed inverted by the ECU side, and
        // each byte the ECU "sends" we must echo-invert back to it; the
        // canned stream here only models the ECU->tester direction,
        // which is sufficient to exercise recv_block in isolation.
        RawDriver::with_canned_echo(bytes_from_ecu.to_vec())
    }

    #[test]
    fn recv_block_validates_trailer() {
        let mut proto = Vag::default();
        // len=4 (seq+title+1databyte+trailer), seq=1 (== seq_nr+1==1), title=0xF6, data=0x41, trailer
        let mut l0 = echo_driver(&[4, 1, 0xF6, 0x41, KWP1281_END_BYTE]);
        let (seq, title, data) = proto.recv_block(&mut l0, 100).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(title, 0xF6);
        assert_eq!(data, vec![0x41]);
        assert_eq!(proto.seq_nr, 2);
        assert!(proto.master);
    }

    #[test]
    fn send_block_builds_correct_framing() {
        let mut proto = Vag::default();
        proto.seq_nr = 2;
        let mut l0 = RawDriver::with_canned_echo(vec![]);
        // Every echo is the bitwise complement of what we just sent, so
        // feed a driver that simply inverts whatever it last received:
        // approximate with a generous canned stream of complements.
        let expected_block = [5u8, 2, 0x09, 0xAA, KWP1281_END_BYTE];
        let mut echo = Vec::new();
        for b in expected_block {
            echo.push(!b);
        }
        l0 = RawDriver::with_canned_echo(echo);
        proto.send_block(&mut l0, 0x09, &[0xAA]).unwrap();
        assert_eq!(l0.sent, vec![5, 2, 0x09, 0xAA, KWP1281_END_BYTE]);
        assert!(!proto.master);
    }
}
