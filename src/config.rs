//! Session configuration (C9, ambient): a small struct read from
//! environment variables with documented in-process defaults — not a
//! config-file parser (that layer is explicitly out of scope).

use std::env;

/// L2 session protocol selection, mirroring the three concrete
/// protocols this crate implements (see `crate::l2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Iso9141,
    D2,
    Vag,
    Raw,
    Mb1,
}

impl ProtocolKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "iso9141" | "iso-9141" => Some(ProtocolKind::Iso9141),
            "d2" | "kwp2000" => Some(ProtocolKind::D2),
            "vag" | "kwp1281" => Some(ProtocolKind::Vag),
            "raw" => Some(ProtocolKind::Raw),
            "mb1" => Some(ProtocolKind::Mb1),
            _ => None,
        }
    }
}

impl Default for ProtocolKind {
    fn default() -> Self {
        ProtocolKind::Iso9141
    }
}

/// L0 `dumb` driver option bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumbOpts(u8);

impl DumbOpts {
    pub const USE_LLINE: DumbOpts = DumbOpts(0x01);
    pub const CLEAR_DTR: DumbOpts = DumbOpts(0x02);
    pub const SET_RTS: DumbOpts = DumbOpts(0x04);
    pub const MAN_BREAK: DumbOpts = DumbOpts(0x08);
    pub const LLINE_INV: DumbOpts = DumbOpts(0x10);
    pub const FAST_BREAK: DumbOpts = DumbOpts(0x20);
    pub const BLOCK_DUPLEX: DumbOpts = DumbOpts(0x40);

    pub const fn empty() -> Self {
        DumbOpts(0)
    }

    pub fn contains(self, other: DumbOpts) -> bool {
        self.0 & other.0 == other.0
    }

    /// The VAGTool/SE adapters are `dumb` instances with DTR/RTS
    /// polarity inverted relative to a generic interface, not a
    /// separate driver.
    pub const fn vagtool_preset() -> Self {
        DumbOpts(Self::CLEAR_DTR.0 | Self::USE_LLINE.0 | Self::LLINE_INV.0)
    }

    fn parse(s: &str) -> Self {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if let Ok(bits) = u8::from_str_radix(hex, 16) {
                return DumbOpts(bits);
            }
        }
        if let Ok(bits) = s.parse::<u8>() {
            return DumbOpts(bits);
        }
        DumbOpts::empty()
    }
}

impl std::ops::BitOr for DumbOpts {
    type Output = DumbOpts;
    fn bitor(self, rhs: DumbOpts) -> DumbOpts {
        DumbOpts(self.0 | rhs.0)
    }
}

pub mod defaults {
    pub const BAUD: u32 = 10400;
    pub const ECU_ADDRESS: u8 = 0x10;
    pub const TESTER_ADDRESS: u8 = 0xF1;
    pub const ELM_CLONE_TOLERANT: bool = false;
    pub const VAG_STRICT_SAE: bool = false;
}

/// Process-wide session configuration, built from the environment with
/// documented fallbacks so it can equally be constructed in-process
/// with no environment present (`SessionConfig::from_env` simply reads
/// what's set and defaults the rest).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port_name: Option<String>,
    pub baud_override: Option<u32>,
    pub protocol: ProtocolKind,
    pub ecu_address: u8,
    pub tester_address: u8,
    pub dumbopts: DumbOpts,
    pub elm_clone_tolerant: bool,
    pub vag_strict_sae: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            port_name: None,
            baud_override: None,
            protocol: ProtocolKind::default(),
            ecu_address: defaults::ECU_ADDRESS,
            tester_address: defaults::TESTER_ADDRESS,
            dumbopts: DumbOpts::empty(),
            elm_clone_tolerant: defaults::ELM_CLONE_TOLERANT,
            vag_strict_sae: defaults::VAG_STRICT_SAE,
        }
    }
}

impl SessionConfig {
    /// Read `KDIAG_PORT`, `KDIAG_BAUD`, `KDIAG_PROTOCOL`,
    /// `KDIAG_ECU_ADDR`, `KDIAG_TESTER_ADDR`, `KDIAG_DUMBOPTS` from the
    /// environment, falling back to [`SessionConfig::default`] field by
    /// field. `RUST_LOG` is consumed separately by
    /// `tracing_subscriber::EnvFilter` at startup, not stored here.
    pub fn from_env() -> Self {
        let mut cfg = SessionConfig::default();

        if let Ok(v) = env::var("KDIAG_PORT") {
            if !v.is_empty() {
                cfg.port_name = Some(v);
            }
        }
        if let Ok(v) = env::var("KDIAG_BAUD") {
            if let Ok(b) = v.parse::<u32>() {
                cfg.baud_override = Some(b);
            }
        }
        if let Ok(v) = env::var("KDIAG_PROTOCOL") {
            if let Some(p) = ProtocolKind::parse(&v) {
                cfg.protocol = p;
            }
        }
        if let Ok(v) = env::var("KDIAG_ECU_ADDR") {
            if let Some(addr) = parse_u8(&v) {
                cfg.ecu_address = addr;
            }
        }
        if let Ok(v) = env::var("KDIAG_TESTER_ADDR") {
            if let Some(addr) = parse_u8(&v) {
                cfg.tester_address = addr;
            }
        }
        if let Ok(v) = env::var("KDIAG_DUMBOPTS") {
            cfg.dumbopts = DumbOpts::parse(&v);
        }

        cfg
    }
}

fn parse_u8(s: &str) -> Option<u8> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u8>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_documented_fallbacks() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.ecu_address, 0x10);
        assert_eq!(cfg.tester_address, 0xF1);
        assert_eq!(cfg.protocol, ProtocolKind::Iso9141);
        assert!(cfg.port_name.is_none());
    }

    #[test]
    fn protocol_kind_parses_aliases() {
        assert_eq!(ProtocolKind::parse("KWP2000"), Some(ProtocolKind::D2));
        assert_eq!(ProtocolKind::parse("kwp1281"), Some(ProtocolKind::Vag));
        assert_eq!(ProtocolKind::parse("bogus"), None);
    }

    #[test]
    fn dumbopts_parses_hex_and_decimal() {
        assert_eq!(DumbOpts::parse("0x40"), DumbOpts::BLOCK_DUPLEX);
        assert_eq!(DumbOpts::parse("1"), DumbOpts::USE_LLINE);
    }

    #[test]
    fn vagtool_preset_inverts_polarity_flags() {
        let preset = DumbOpts::vagtool_preset();
        assert!(preset.contains(DumbOpts::CLEAR_DTR));
        assert!(preset.contains(DumbOpts::LLINE_INV));
        assert!(!preset.contains(DumbOpts::SET_RTS));
    }
}
