//! TTY transport (C2): open/configure a serial port, drive modem
//! control lines, generate breaks, and enumerate ports. Built on the
//! `serialport` crate for cross-platform support of generic PC serial
//! hardware.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{seterr, Error, Result};

pub const IFLUSH_TIMEOUT_MS: u64 = 30;

/// Serial line settings.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            baud: 10400,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

fn to_serialport_data_bits(n: u8) -> serialport::DataBits {
    match n {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

fn to_serialport_stop_bits(n: u8) -> serialport::StopBits {
    match n {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    }
}

fn to_serialport_parity(p: Parity) -> serialport::Parity {
    match p {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

/// Likely adapter family, classified by USB VID, for the handful of
/// common K-line USB-serial bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFamily {
    Ftdi,
    Cp210x,
    Ch340,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub port_type: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub adapter: AdapterFamily,
}

fn classify_vid(vid: u16) -> AdapterFamily {
    match vid {
        0x0403 => AdapterFamily::Ftdi,
        0x10C4 => AdapterFamily::Cp210x,
        0x1A86 => AdapterFamily::Ch340,
        _ => AdapterFamily::Unknown,
    }
}

/// Enumerate plausible serial ports on this platform.
pub fn port_list() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(usb) => PortInfo {
                name: p.port_name,
                port_type: "USB".into(),
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                adapter: classify_vid(usb.vid),
            },
            serialport::SerialPortType::PciPort => PortInfo {
                name: p.port_name,
                port_type: "PCI".into(),
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                adapter: AdapterFamily::Unknown,
            },
            serialport::SerialPortType::BluetoothPort => PortInfo {
                name: p.port_name,
                port_type: "Bluetooth".into(),
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                adapter: AdapterFamily::Unknown,
            },
            serialport::SerialPortType::Unknown => PortInfo {
                name: p.port_name,
                port_type: "Unknown".into(),
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                adapter: AdapterFamily::Unknown,
            },
        })
        .collect())
}

/// An open serial handle. On `Drop`, settings are restored to whatever
/// was observed at [`Tty::open`].
pub struct Tty {
    port: Box<dyn serialport::SerialPort>,
    opened_settings: Settings,
}

impl Tty {
    pub fn open(name: &str, settings: Settings) -> Result<Self> {
        let port = serialport::new(name, settings.baud)
            .timeout(Duration::from_millis(1000))
            .data_bits(to_serialport_data_bits(settings.data_bits))
            .stop_bits(to_serialport_stop_bits(settings.stop_bits))
            .parity(to_serialport_parity(settings.parity))
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Tty {
            port,
            opened_settings: settings,
        })
    }

    /// Apply new settings. Non-standard bitrates go through
    /// `set_baud_rate` directly; there is no raw-ioctl fallback exposed
    /// by the `serialport` crate, so a mismatch is logged rather than
    /// silently accepted.
    pub fn setup(&mut self, settings: Settings) -> Result<()> {
        self.port.set_baud_rate(settings.baud)?;
        self.port.set_data_bits(to_serialport_data_bits(settings.data_bits))?;
        self.port.set_stop_bits(to_serialport_stop_bits(settings.stop_bits))?;
        self.port.set_parity(to_serialport_parity(settings.parity))?;

        match self.port.baud_rate() {
            Ok(actual) if actual != settings.baud => {
                let pct = (actual as f64 - settings.baud as f64).abs() / settings.baud as f64 * 100.0;
                if pct > 5.0 {
                    warn!(requested = settings.baud, actual, "bitrate error exceeds 5% tolerance");
                }
            }
            Err(_) => warn!("backend does not support reading back baud rate; trusting request"),
            _ => {}
        }

        Ok(())
    }

    pub fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }

    /// Drive DTR/RTS explicitly, used for bit-banged L-line 5-baud init.
    pub fn control(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.port.write_data_terminal_ready(dtr)?;
        self.port.write_request_to_send(rts)?;
        Ok(())
    }

    /// Discard pending input, plus a short drain read to catch
    /// in-transit bytes the OS buffer hasn't surfaced yet.
    pub fn iflush(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        let mut scratch = [0u8; 64];
        let _ = self.read(&mut scratch, IFLUSH_TIMEOUT_MS);
        Ok(())
    }

    /// Blocking read up to `timeout_ms`; returns bytes actually read.
    /// Fails with [`Error::Timeout`] when nothing arrived in time.
    pub fn read(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        self.port.set_timeout(Duration::from_millis(timeout_ms))?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::TimedOut => Err(Error::Timeout),
                Err(e) => Err(seterr(Error::from(e))),
            },
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(Error::Timeout),
            Err(e) => Err(seterr(Error::from(e))),
        }
    }

    /// Write all bytes and flush, guaranteeing they've left the UART.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.port.write_all(buf).map_err(|e| seterr(Error::from(e)))?;
        self.port.flush().map_err(|e| seterr(Error::from(e)))?;
        Ok(())
    }

    /// Drive TX low for `ms` and release, via `set_break`/`clear_break`.
    pub fn break_(&mut self, ms: u64) -> Result<()> {
        self.port.set_break()?;
        crate::os::sleep_ms(ms);
        self.port.clear_break()?;
        Ok(())
    }

    /// Temporarily reconfigure to 360 bps, transmit a single 0x00
    /// (which manifests as a ~25ms break-equivalent low pulse at that
    /// rate), read back the echo, and restore the original bitrate.
    /// Spends the remainder of the requested duration sleeping, and
    /// warns if total elapsed deviates from `ms` by more than 1 ms.
    pub fn fastbreak(&mut self, ms: u64) -> Result<()> {
        const FASTBREAK_BAUD: u32 = 360;
        let original_baud = self.opened_settings.baud;
        let start = Instant::now();

        self.port.set_baud_rate(FASTBREAK_BAUD)?;
        self.write(&[0x00])?;
        let mut echo = [0u8; 1];
        let _ = self.read(&mut echo, 50);
        self.port.set_baud_rate(original_baud)?;

        let elapsed = start.elapsed();
        let target = Duration::from_millis(ms);
        if elapsed < target {
            crate::os::sleep_ms((target - elapsed).as_millis() as u64);
        }

        let total = start.elapsed();
        let deviation_ms = (total.as_millis() as i64 - ms as i64).unsigned_abs();
        if deviation_ms > 1 {
            warn!(requested_ms = ms, actual_ms = total.as_millis() as u64, "fastbreak timing deviation exceeds 1ms");
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        if let Err(e) = self.setup(self.opened_settings) {
            debug!(error = %e, "failed to restore settings on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_matches_kline_bitrate() {
        let s = Settings::default();
        assert_eq!(s.baud, 10400);
        assert_eq!(s.data_bits, 8);
        assert_eq!(s.parity, Parity::None);
    }

    #[test]
    fn classify_vid_recognizes_common_adapters() {
        assert_eq!(classify_vid(0x0403), AdapterFamily::Ftdi);
        assert_eq!(classify_vid(0x10C4), AdapterFamily::Cp210x);
        assert_eq!(classify_vid(0x1A86), AdapterFamily::Ch340);
        assert_eq!(classify_vid(0xFFFF), AdapterFamily::Unknown);
    }
}
