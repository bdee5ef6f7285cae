//! Demo binary: list candidate serial ports, run the startup timing
//! calibration, and — if a port is configured — open a session and
//! read back the ECU's DTCs. A thin smoke test of the stack rather
//! than a long-running server.

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kdiag::config::{ProtocolKind, SessionConfig};
use kdiag::l0::{self, DriverKind};
use kdiag::l2;
use kdiag::l7;
use kdiag::os::{self, PeriodicTimer};
use kdiag::tty;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    println!("kdiag — layered K-line / ISO 9141-2 / KWP2000 / KWP1281 diagnostic stack");

    let report = os::calibrate();
    if !report.adequate {
        warn!("timing calibration flagged this platform as marginal; protocol margins will be tight");
    }

    info!("enumerating serial ports");
    let ports = tty::port_list().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    } else {
        println!("found {} port(s):", ports.len());
        for p in &ports {
            println!(
                "  {} [{}] {}",
                p.name,
                p.port_type,
                p.product.as_deref().unwrap_or("")
            );
        }
    }

    let cfg = SessionConfig::from_env();
    let Some(port_name) = cfg.port_name.clone() else {
        println!("set KDIAG_PORT to run a session against a real ECU; exiting after port scan.");
        return Ok(());
    };

    let timer = PeriodicTimer::spawn(l2::timer_tick);

    let driver = l0::open_driver(DriverKind::Dumb, &port_name, &cfg).context("opening L0 driver")?;
    let bitrate = cfg.baud_override.unwrap_or(kdiag::config::defaults::BAUD);

    let conn = match cfg.protocol {
        ProtocolKind::Iso9141 => l2::start_communications(
            driver,
            Box::<kdiag::l2::iso9141::Iso9141>::default(),
            bitrate,
            cfg.ecu_address,
            cfg.tester_address,
        ),
        ProtocolKind::D2 => l2::start_communications(
            driver,
            Box::<kdiag::l2::d2::D2>::default(),
            bitrate,
            cfg.ecu_address,
            cfg.tester_address,
        ),
        ProtocolKind::Vag => l2::start_communications(
            driver,
            Box::<kdiag::l2::vag::Vag>::default(),
            bitrate,
            cfg.ecu_address,
            cfg.tester_address,
        ),
        ProtocolKind::Raw => l2::start_communications(
            driver,
            Box::<kdiag::l2::raw::Raw>::default(),
            bitrate,
            cfg.ecu_address,
            cfg.tester_address,
        ),
        ProtocolKind::Mb1 => l2::start_communications(
            driver,
            Box::<kdiag::l2::mb1::Mb1>::default(),
            bitrate,
            cfg.ecu_address,
            cfg.tester_address,
        ),
    }
    .context("StartCommunications")?;

    info!(protocol = ?cfg.protocol, port = %port_name, "session open, reading DTCs");

    let read_result = match cfg.protocol {
        ProtocolKind::D2 => l7::d2::read_diagnostic_trouble_codes(&conn, 1000)
            .map(|(dtcs, _witness)| dtcs)
            .map_err(anyhow::Error::from),
        ProtocolKind::Vag | ProtocolKind::Iso9141 => l7::kwp71::read_diagnostic_trouble_codes(&conn, 1000)
            .map(|(dtcs, _witness)| dtcs)
            .map_err(anyhow::Error::from),
        ProtocolKind::Raw | ProtocolKind::Mb1 => {
            println!("no DTC service defined for this protocol; skipping");
            Ok(Vec::new())
        }
    };

    match read_result {
        Ok(dtcs) if dtcs.is_empty() => println!("no DTCs stored"),
        Ok(dtcs) => {
            println!("{} DTC(s):", dtcs.len());
            for dtc in dtcs {
                println!("  {} (status 0x{:02X})", dtc.label, dtc.status);
            }
        }
        Err(e) => warn!(error = %e, "reading DTCs failed"),
    }

    conn.stop().context("StopCommunications")?;
    timer.stop();
    Ok(())
}
