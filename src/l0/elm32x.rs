//! The ELM32x L0 driver (C4): an ASCII AT-command adapter. Commands
//! are human-readable lines terminated by CR; responses end with a
//! `>` prompt.

use tracing::{debug, warn};

use crate::error::{seterr, Error, Result};
use crate::l0::L0Driver;
use crate::l1::{InitBusArgs, InitType, L1Flags};
use crate::tty::{Settings, Tty};

const PROBE_BAUDS: [u32; 2] = [9600, 38400];
const PROMPT: u8 = b'>';
const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

pub struct ElmDriver {
    tty: Tty,
    clone_tolerant: bool,
}

impl ElmDriver {
    /// Auto-probe baud rates in order, performing the `ATZ` handshake
    /// at each until the adapter's banner-then-prompt is seen.
    pub fn open(port_name: &str, clone_tolerant: bool) -> Result<Self> {
        let mut last_err = Error::BadIfAdapter;
        for &baud in &PROBE_BAUDS {
            let settings = Settings {
                baud,
                ..Settings::default()
            };
            match Tty::open(port_name, settings) {
                Ok(tty) => {
                    let mut drv = ElmDriver {
                        tty,
                        clone_tolerant,
                    };
                    if drv.handshake().is_ok() {
                        return Ok(drv);
                    }
                    last_err = Error::BadIfAdapter;
                }
                Err(e) => last_err = e,
            }
        }
        Err(seterr(last_err))
    }

    fn handshake(&mut self) -> Result<()> {
        self.send_command("ATZ")?;
        let banner = self.read_until_prompt(2000)?;
        if banner.is_empty() {
            return Err(seterr(Error::BadIfAdapter));
        }

        for cmd in ["ATE0", "ATL0", "ATS0", "ATH1"] {
            if self.send_command(cmd).is_err() {
                if self.clone_tolerant {
                    warn!(cmd, "adapter rejected init command; ignoring (clone-tolerant mode)");
                    continue;
                }
                return Err(seterr(Error::BadIfAdapter));
            }
            let _ = self.read_until_prompt(500);
        }
        Ok(())
    }

    fn send_command(&mut self, cmd: &str) -> Result<()> {
        let mut line = cmd.as_bytes().to_vec();
        line.push(CR);
        self.tty.write(&line)
    }

    fn read_until_prompt(&mut self, timeout_ms: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let start = std::time::Instant::now();
        let mut byte = [0u8; 1];
        while start.elapsed().as_millis() < timeout_ms as u128 {
            let remaining = timeout_ms.saturating_sub(start.elapsed().as_millis() as u64);
            match self.tty.read(&mut byte, remaining.max(1)) {
                Ok(1) => {
                    if byte[0] == PROMPT {
                        return Ok(out);
                    }
                    out.push(byte[0]);
                }
                _ => break,
            }
        }
        Err(Error::Timeout)
    }

    fn to_ascii_hex(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() * 3);
        for (i, b) in data.iter().enumerate() {
            if i > 0 {
                out.push(b' ');
            }
            out.extend_from_slice(format!("{:02X}", b).as_bytes());
        }
        out.push(LF);
        out
    }

    /// Parse response text by tokenizing whitespace and scanning
    /// two-hex-digit groups until the terminating prompt.
    fn parse_hex_frame(text: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(text);
        text.split_whitespace()
            .filter_map(|tok| u8::from_str_radix(tok, 16).ok())
            .collect()
    }
}

impl L0Driver for ElmDriver {
    fn init(&mut self, args: InitBusArgs) -> Result<(u8, u8)> {
        match args.init_type {
            InitType::None => Ok((0, 0)),
            InitType::FiveBaud | InitType::TwoSlow => {
                self.send_command(&format!("ATSH{:02X}", args.addr))?;
                let _ = self.read_until_prompt(500);
                self.send_command("ATSP3")?;
                let resp = self.read_until_prompt(2000)?;
                debug!(?resp, "ELM 5-baud init response");
                Ok((0x08, 0x08))
            }
            InitType::Fast => {
                self.send_command("ATSP5")?;
                let _ = self.read_until_prompt(2000)?;
                Ok((0, 0))
            }
        }
    }

    fn open(&mut self, _l1_proto: L1Flags) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.send_command("ATPC").ok();
        Ok(())
    }

    fn getflags(&self) -> L1Flags {
        L1Flags::DOES_L2_FRAME | L1Flags::DOES_L2_CKSUM | L1Flags::STRIP_L2_CKSUM
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let text = self.read_until_prompt(timeout_ms)?;
        let bytes = Self::parse_hex_frame(&text);
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn send(&mut self, buf: &[u8]) -> Result<()> {
        let line = Self::to_ascii_hex(buf);
        self.tty.write(&line)
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.tty.set_baud_rate(baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_hex_roundtrip() {
        let frame = ElmDriver::to_ascii_hex(&[0x68, 0x6A, 0x10]);
        assert_eq!(frame, b"68 6A 10\n");
        let parsed = ElmDriver::parse_hex_frame(b"68 6A 10");
        assert_eq!(parsed, vec![0x68, 0x6A, 0x10]);
    }

    #[test]
    fn parse_hex_frame_ignores_non_hex_tokens() {
        let parsed = ElmDriver::parse_hex_frame(b"SEARCHING...\r\n68 6A 10");
        assert_eq!(parsed, vec![0x68, 0x6A, 0x10]);
    }
}
