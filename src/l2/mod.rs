//! L2 core (C5): connection registry, `StartCommunications` /
//! `StopCommunications`, and send/recv/request dispatch to a protocol
//! handler.
//!
//! The registry is a process-wide, mutex-protected `Vec` of weak
//! handles: the periodic timer upgrades each weak reference and
//! try-locks it for a non-blocking keep-alive sweep.

pub mod d2;
pub mod iso9141;
pub mod mb1;
pub mod raw;
pub mod vag;

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{seterr, Error, Result};
use crate::l0::L0Driver;
use crate::l1::L1Flags;
use crate::message::Message;

/// Protocol-characteristic flags (was `DIAG_L2_FLAG_*`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L2Flags(u8);

impl L2Flags {
    pub const FRAMED: L2Flags = L2Flags(0x01);
    pub const KEEPALIVE: L2Flags = L2Flags(0x02);

    pub const fn empty() -> Self {
        L2Flags(0)
    }

    pub fn contains(self, other: L2Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for L2Flags {
    type Output = L2Flags;
    fn bitor(self, rhs: L2Flags) -> L2Flags {
        L2Flags(self.0 | rhs.0)
    }
}

/// ISO 14230 inter-byte/inter-message timing parameters, in
/// milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub p1min: u64,
    pub p1max: u64,
    pub p2min: u64,
    pub p2max: u64,
    pub p2emin: u64,
    pub p2emax: u64,
    pub p3min: u64,
    pub p3max: u64,
    pub p4min: u64,
    pub p4max: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            p1min: 0,
            p1max: 20,
            p2min: 25,
            p2max: 50,
            p2emin: 25,
            p2emax: 5000,
            p3min: 55,
            p3max: 5000,
            p4min: 5,
            p4max: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Data returned by the `GetL2Data` ioctl.
#[derive(Debug, Clone, Copy)]
pub struct L2Data {
    /// ECU physical address, learned from the first message received on
    /// the connection; falls back to the configured target address if
    /// nothing has been received yet.
    pub physaddr: u8,
    pub kb1: u8,
    pub kb2: u8,
}

pub enum Ioctl {
    GetL1Type,
    GetL1Flags,
    GetL2Flags,
    GetL2Data,
}

pub enum IoctlReply {
    L1Flags(L1Flags),
    L2Flags(L2Flags),
    L2Data(L2Data),
}

/// Per-protocol behavior, dispatched to by the L2 core. Mirrors
/// `diag_l2_proto`'s function-pointer table.
pub trait L2Protocol: Send {
    fn flags(&self) -> L2Flags;

    /// Perform the bus handshake and return the observed (or assumed)
    /// key bytes.
    fn startcomms(
        &mut self,
        l0: &mut dyn L0Driver,
        l1_flags: L1Flags,
        bitrate: u32,
        target: u8,
        source: u8,
    ) -> Result<(u8, u8)>;

    fn stopcomms(&mut self, l0: &mut dyn L0Driver) -> Result<()> {
        let _ = l0;
        Ok(())
    }

    fn send(&mut self, l0: &mut dyn L0Driver, msg: &Message) -> Result<()>;
    fn recv(&mut self, l0: &mut dyn L0Driver, timeout_ms: u64) -> Result<Message>;

    fn request(&mut self, l0: &mut dyn L0Driver, msg: &Message, timeout_ms: u64) -> Result<Message> {
        self.send(l0, msg)?;
        self.recv(l0, timeout_ms)
    }

    /// Keep-alive handler, called by the periodic timer for protocols
    /// whose L1 link doesn't already do keep-alive in hardware.
    fn timeout(&mut self, l0: &mut dyn L0Driver) -> Result<()> {
        let _ = l0;
        Ok(())
    }
}

struct ConnectionInner {
    l0: Box<dyn L0Driver>,
    proto: Box<dyn L2Protocol>,
    target: u8,
    source: u8,
    state: SessionState,
    timing: Timing,
    keepalive_interval: Duration,
    tlast: Instant,
    rx_queue: Vec<Message>,
    kb1: u8,
    kb2: u8,
    monitor: bool,
    /// ECU physical source address, learned from the first received
    /// message header; `None` until then.
    learned_physaddr: Option<u8>,
}

/// A handle to a live L2 connection. Cloning shares the same
/// underlying session (registered once in the timer's sweep list);
/// `StopCommunications` is `drop`-triggered via [`Connection::stop`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<crate::os::Mutex<ConnectionInner>>,
}

fn registry() -> &'static crate::os::Mutex<Vec<Weak<crate::os::Mutex<ConnectionInner>>>> {
    static REGISTRY: OnceLock<crate::os::Mutex<Vec<Weak<crate::os::Mutex<ConnectionInner>>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| crate::os::Mutex::new(Vec::new()))
}

/// `L2.StartCommunications`: allocate a connection, install default
/// ISO 14230 timings and a ⅔·P3max keep-alive interval, and hand off
/// to the protocol's `startcomms`.
#[allow(clippy::too_many_arguments)]
pub fn start_communications(
    mut l0: Box<dyn L0Driver>,
    mut proto: Box<dyn L2Protocol>,
    bitrate: u32,
    target: u8,
    source: u8,
) -> Result<Connection> {
    let timing = Timing::default();
    let keepalive_interval = Duration::from_millis(timing.p3max * 2 / 3);
    let l1_flags = l0.getflags();

    info!(target, source, bitrate, "L2 StartCommunications");
    let (kb1, kb2) = proto.startcomms(l0.as_mut(), l1_flags, bitrate, target, source)?;

    let inner = ConnectionInner {
        l0,
        proto,
        target,
        source,
        state: SessionState::Open,
        timing,
        keepalive_interval,
        tlast: Instant::now(),
        rx_queue: Vec::new(),
        kb1,
        kb2,
        monitor: false,
        learned_physaddr: None,
    };

    let conn = Connection {
        inner: Arc::new(crate::os::Mutex::new(inner)),
    };
    registry().lock().push(Arc::downgrade(&conn.inner));
    Ok(conn)
}

impl Connection {
    pub fn send(&self, msg: &Message) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.proto.send(inner.l0.as_mut(), msg)?;
        inner.tlast = Instant::now();
        Ok(())
    }

    pub fn recv(&self, timeout_ms: u64) -> Result<Message> {
        let mut inner = self.inner.lock();
        let msg = inner.proto.recv(inner.l0.as_mut(), timeout_ms)?;
        inner.tlast = Instant::now();
        inner.learned_physaddr.get_or_insert(msg.src);
        Ok(msg)
    }

    pub fn request(&self, msg: &Message, timeout_ms: u64) -> Result<Message> {
        let mut inner = self.inner.lock();
        let (l0, proto) = (inner.l0.as_mut(), inner.proto.as_mut());
        let reply = proto.request(l0, msg, timeout_ms)?;
        inner.tlast = Instant::now();
        inner.learned_physaddr.get_or_insert(reply.src);
        Ok(reply)
    }

    pub fn push_received(&self, msg: Message) {
        self.inner.lock().rx_queue.push(msg);
    }

    pub fn drain_received(&self) -> Vec<Message> {
        std::mem::take(&mut self.inner.lock().rx_queue)
    }

    pub fn set_monitor(&self, monitor: bool) {
        self.inner.lock().monitor = monitor;
    }

    pub fn ioctl(&self, cmd: Ioctl) -> Result<IoctlReply> {
        let inner = self.inner.lock();
        match cmd {
            Ioctl::GetL1Type => Err(seterr(Error::IoctlNotSupported)),
            Ioctl::GetL1Flags => Ok(IoctlReply::L1Flags(inner.l0.getflags())),
            Ioctl::GetL2Flags => Ok(IoctlReply::L2Flags(inner.proto.flags())),
            Ioctl::GetL2Data => Ok(IoctlReply::L2Data(L2Data {
                physaddr: inner.learned_physaddr.unwrap_or(inner.target),
                kb1: inner.kb1,
                kb2: inner.kb2,
            })),
        }
    }

    /// `L2.StopCommunications`: tear down the protocol session and
    /// drop any residual received messages.
    pub fn stop(self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Closing;
        let result = inner.proto.stopcomms(inner.l0.as_mut());
        inner.rx_queue.clear();
        inner.state = SessionState::Closed;
        drop(inner);
        result
    }
}

/// `L2.timer()`: invoked by the periodic timer. Try-lock each live
/// connection; for any that is open, not in monitor mode, whose L1
/// link doesn't already keep itself alive, and whose last activity
/// exceeds the keep-alive interval, fire the protocol's `timeout`.
pub fn timer_tick() {
    let mut reg = registry().lock();
    reg.retain(|weak| weak.strong_count() > 0);

    for weak in reg.iter() {
        let Some(inner) = weak.upgrade() else { continue };
        let Some(mut conn) = inner.try_lock() else {
            debug!("connection busy, skipping keep-alive this tick");
            continue;
        };
        if conn.state != SessionState::Open || conn.monitor {
            continue;
        }
        if conn.l0.getflags().contains(L1Flags::DOES_KEEPALIVE) {
            continue;
        }
        if conn.tlast.elapsed() > conn.keepalive_interval {
            let (l0, proto) = (conn.l0.as_mut(), conn.proto.as_mut());
            if let Err(e) = proto.timeout(l0) {
                debug!(error = %e, "keep-alive timeout handler failed");
            } else {
                conn.tlast = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l0::RawDriver;

    struct EchoProto;
    impl L2Protocol for EchoProto {
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
            let mut buf = [0u8; 8];
            let n = l0.recv(&mut buf, timeout_ms)?;
            Ok(Message::from_bytes(buf[..n].to_vec()))
        }
    }

    #[test]
    fn tlast_is_monotonic_after_send() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let conn = start_communications(l0, Box::new(EchoProto), 10400, 0x10, 0xF1).unwrap();
        let t0 = conn.inner.lock().tlast;
        std::thread::sleep(Duration::from_millis(5));
        conn.send(&Message::from_bytes(vec![1])).unwrap();
        let t1 = conn.inner.lock().tlast;
        assert!(t1 >= t0);
    }

    #[test]
    fn stop_clears_residual_received_messages() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let conn = start_communications(l0, Box::new(EchoProto), 10400, 0x10, 0xF1).unwrap();
        conn.push_received(Message::from_bytes(vec![1]));
        conn.push_received(Message::from_bytes(vec![2]));
        conn.push_received(Message::from_bytes(vec![3]));
        conn.stop().unwrap();
    }

    #[test]
    fn timer_tick_skips_busy_connection_without_deadlock() {
        let l0 = Box::new(RawDriver::with_canned_echo(vec![]));
        let conn = start_communications(l0, Box::new(EchoProto), 10400, 0x10, 0xF1).unwrap();
        let _guard = conn.inner.lock();
        timer_tick();
    }
}
