//! The `dumb` L0 driver (C4): plain K-line over a UART with no
//! onboard framing intelligence — everything (5-baud bit-bang, fast
//! init, half-duplex echo) happens in software, driven through the
//! `serialport` crate's `set_break`/`clear_break` primitives.

use crate::config::DumbOpts;
use crate::error::{seterr, Error, Result};
use crate::l0::L0Driver;
use crate::l1::{InitBusArgs, InitType, L1Flags};
use crate::os::sleep_ms;
use crate::tty::{Settings, Tty};

const W1_MIN_MS: u64 = 60;
const P2_ISO14230_MS: u64 = 300;
const P2_ISO9141_MS: u64 = 291;
const W4_MIN_MS: u64 = 25;
const TWUP_MS: u64 = 50;
const TINIL_MS: u64 = 25;

pub struct DumbDriver {
    tty: Tty,
    opts: DumbOpts,
    flags: L1Flags,
}

impl DumbDriver {
    pub fn open(port_name: &str, opts: DumbOpts) -> Result<Self> {
        let tty = Tty::open(port_name, Settings::default())?;
        Ok(DumbDriver {
            tty,
            opts,
            flags: L1Flags::HALFDUPLEX | L1Flags::SLOW | L1Flags::FAST | L1Flags::PREFFAST,
        })
    }

    /// Software bit-bang 5-baud init: each bit is 200 ms; consecutive
    /// zero bits are coalesced into a single long break rather than
    /// toggling the line redundantly.
    fn bitbang_5baud(&mut self, addr: u8) -> Result<()> {
        let clear_dtr = self.opts.contains(DumbOpts::CLEAR_DTR);
        let set_rts = self.opts.contains(DumbOpts::SET_RTS);
        self.tty.control(!clear_dtr, set_rts)?;
        sleep_ms(300);

        // Bits, LSB first, framed by a low start bit and a high stop bit.
        let bits: Vec<bool> = std::iter::once(false)
            .chain((0..8).map(|i| (addr >> i) & 1 == 1))
            .chain(std::iter::once(true))
            .collect();

        let mut i = 0;
        while i < bits.len() {
            let level = bits[i];
            let mut run = 1;
            while i + run < bits.len() && bits[i + run] == level {
                run += 1;
            }
            let line_low = !level; // a 0 data bit drives the line low
            self.drive_line(line_low)?;
            sleep_ms(200 * run as u64);
            i += run;
        }
        self.drive_line(false)?;
        Ok(())
    }

    fn drive_line(&mut self, low: bool) -> Result<()> {
        let clear_dtr = self.opts.contains(DumbOpts::CLEAR_DTR);
        let dtr = if clear_dtr { false } else { !low };
        let mut rts = self.opts.contains(DumbOpts::SET_RTS);
        if self.opts.contains(DumbOpts::USE_LLINE) {
            let l_low = if self.opts.contains(DumbOpts::LLINE_INV) {
                !low
            } else {
                low
            };
            rts = l_low;
        }
        self.tty.control(dtr, rts)
    }
}

impl L0Driver for DumbDriver {
    fn init(&mut self, args: InitBusArgs) -> Result<(u8, u8)> {
        match args.init_type {
            InitType::None => Ok((0, 0)),
            InitType::FiveBaud | InitType::TwoSlow => {
                self.tty.iflush()?;
                if self.opts.contains(DumbOpts::MAN_BREAK) {
                    self.bitbang_5baud(args.addr)?;
                } else {
                    // Hardware 5 bps path: briefly drop to 5 baud, send
                    // the address byte, and let the UART frame it.
                    self.tty.set_baud_rate(5)?;
                    self.tty.write(&[args.addr])?;
                    self.tty.set_baud_rate(10400)?;
                }

                sleep_ms(W1_MIN_MS);
                let mut kb = [0u8; 2];
                let n = self.tty.read(&mut kb, P2_ISO14230_MS)?;
                if n < 2 {
                    return Err(seterr(Error::IncompleteData));
                }
                Ok((kb[0], kb[1]))
            }
            InitType::Fast => {
                self.tty.set_baud_rate(10400)?;
                if self.opts.contains(DumbOpts::FAST_BREAK) {
                    self.tty.fastbreak(50)?;
                } else {
                    self.tty.break_(TINIL_MS)?;
                    sleep_ms(TWUP_MS - TINIL_MS);
                }
                Ok((0, 0))
            }
        }
    }

    fn open(&mut self, _l1_proto: L1Flags) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn getflags(&self) -> L1Flags {
        let mut f = self.flags;
        if self.opts.contains(DumbOpts::BLOCK_DUPLEX) {
            f = f | L1Flags::BLOCK_DUPLEX;
        }
        f
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        self.tty.read(buf, timeout_ms)
    }

    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.tty.write(buf)
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.tty.set_baud_rate(baud)
    }
}

/// Acknowledge W4 gap, used by protocols driving the dumb driver's
/// 5-baud handshake to completion above L0 (sending `~KB2`, reading
/// back `~addr`): exposed here since it's shared timing, not per-driver
/// state.
pub fn w4_gap() {
    sleep_ms(W4_MIN_MS);
}

pub fn p2_iso9141_ms() -> u64 {
    P2_ISO9141_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_duplex_flag_follows_dumbopts() {
        // getflags is exercised indirectly via the opts field since
        // DumbDriver::open requires a real port; test the bit math in
        // isolation instead.
        let opts = DumbOpts::BLOCK_DUPLEX;
        assert!(opts.contains(DumbOpts::BLOCK_DUPLEX));
        let base = L1Flags::HALFDUPLEX;
        let with_bd = base | L1Flags::BLOCK_DUPLEX;
        assert!(with_bd.contains(L1Flags::BLOCK_DUPLEX));
        assert!(with_bd.contains(L1Flags::HALFDUPLEX));
    }

    #[test]
    fn w4_gap_is_at_least_25ms() {
        let start = std::time::Instant::now();
        w4_gap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(20));
    }
}
