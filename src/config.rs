//! Master configuration. Loaded from a TOML file; every knob has the
//! daemon's built-in default so an empty file is a valid configuration.
//! Values that make no sense are clamped with a warning rather than
//! rejected, except where starting up would be unsafe.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MasterError, Result};

pub const MAX_BACK_LOGS: u32 = 1000;

/// How much raw space stays unreported to the filesystem layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReserveSpace {
    Bytes(u64),
    Percent(f64),
    /// Multiple of the most-used single server.
    ChunkserverUsed(f64),
    /// Multiple of the largest single server.
    ChunkserverTotal(f64),
}

impl Default for ReserveSpace {
    fn default() -> Self {
        ReserveSpace::Bytes(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Working directory: metadata files, changelogs and lock files.
    pub data_path: PathBuf,
    pub matocs_listen: String,
    pub matoml_listen: String,
    pub matocs_timeout: u32,
    pub matocs_force_timeout: u32,
    pub matoml_timeout: u32,
    pub matoml_force_timeout: u32,
    /// When set, chunk servers must answer the register nonce challenge.
    pub auth_code: Option<String>,
    pub remap_bits: u8,
    pub remap_source_ip_class: Option<String>,
    pub remap_destination_ip_class: Option<String>,
    /// "1000000", "2.5%", "1.5U" (x most-used server), "1C" (x largest server).
    pub reserve_space: String,
    pub cs_heavy_load_grace_period: u32,
    pub cs_heavy_load_threshold: u32,
    pub cs_heavy_load_ratio_threshold: f64,
    pub cs_maintenance_mode_timeout: u32,
    pub cs_temp_maintenance_mode_timeout: u32,
    pub cs_days_to_remove_unused: u32,
    pub cs_check_mode: u8,
    pub back_logs: u32,
    pub back_meta_keep_previous: u32,
    pub changelog_preserve_seconds: u32,
    pub changelog_preserve_mb: u32,
    /// 0 = background saver, 1 = async file, 2 = fsync every line.
    pub changelog_save_mode: u8,
    pub multilan_bits: u8,
    pub multilan_classes: Option<String>,
    pub topology_filename: Option<PathBuf>,
    pub ipmap_filename: Option<PathBuf>,
    /// Bytes per second for metadata streaming through the saver; 0 = no cap.
    pub meta_save_speed_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("."),
            matocs_listen: "0.0.0.0:9420".to_string(),
            matoml_listen: "0.0.0.0:9419".to_string(),
            matocs_timeout: 10,
            matocs_force_timeout: 0,
            matoml_timeout: 10,
            matoml_force_timeout: 0,
            auth_code: None,
            remap_bits: 0,
            remap_source_ip_class: None,
            remap_destination_ip_class: None,
            reserve_space: "0".to_string(),
            cs_heavy_load_grace_period: 900,
            cs_heavy_load_threshold: 150,
            cs_heavy_load_ratio_threshold: 3.0,
            cs_maintenance_mode_timeout: 0,
            cs_temp_maintenance_mode_timeout: 1800,
            cs_days_to_remove_unused: 7,
            cs_check_mode: 0,
            back_logs: 50,
            back_meta_keep_previous: 1,
            changelog_preserve_seconds: 5000,
            changelog_preserve_mb: 500,
            changelog_save_mode: 0,
            multilan_bits: 0,
            multilan_classes: None,
            topology_filename: None,
            ipmap_filename: None,
            meta_save_speed_limit: 0,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| MasterError::Config(format!("can't read {}: {}", path.display(), e)))?;
        let mut cfg: Config = toml::from_str(&raw)
            .map_err(|e| MasterError::Config(format!("{}: {}", path.display(), e)))?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Clamps out-of-range values in place, logging each correction.
    pub fn normalize(&mut self) {
        if self.matocs_timeout < 10 {
            self.matocs_timeout = 10;
        }
        if self.matocs_timeout > 65535 {
            self.matocs_timeout = 65535;
        }
        if self.matocs_force_timeout > 0 && self.matocs_force_timeout < 10 {
            self.matocs_force_timeout = 10;
        }
        if self.matocs_force_timeout > 65535 {
            self.matocs_force_timeout = 65535;
        }
        if self.matoml_timeout < 10 {
            self.matoml_timeout = 10;
        }
        if self.matoml_timeout > 65535 {
            self.matoml_timeout = 65535;
        }
        if self.matoml_force_timeout > 0 && self.matoml_force_timeout < 10 {
            self.matoml_force_timeout = 10;
        }
        if self.matoml_force_timeout > 65535 {
            self.matoml_force_timeout = 65535;
        }
        if self.back_logs > MAX_BACK_LOGS {
            warn!("back_logs value too big ({}) - using {}", self.back_logs, MAX_BACK_LOGS);
            self.back_logs = MAX_BACK_LOGS;
        }
        if self.back_meta_keep_previous > 99 {
            self.back_meta_keep_previous = 99;
        }
        if self.changelog_preserve_seconds > 100_000 {
            warn!(
                "changelog_preserve_seconds too big ({}) - decreasing to 100000",
                self.changelog_preserve_seconds
            );
            self.changelog_preserve_seconds = 100_000;
        }
        if self.changelog_preserve_mb < 100 {
            warn!(
                "changelog_preserve_mb too low ({}) - increasing to 100",
                self.changelog_preserve_mb
            );
            self.changelog_preserve_mb = 100;
        }
        if self.changelog_preserve_mb > 10_000 {
            warn!(
                "changelog_preserve_mb too big ({}) - decreasing to 10000",
                self.changelog_preserve_mb
            );
            self.changelog_preserve_mb = 10_000;
        }
        if self.changelog_save_mode > 2 {
            warn!("changelog_save_mode - wrong value - using 0 (write in background)");
            self.changelog_save_mode = 0;
        }
        if self.cs_days_to_remove_unused > 365 {
            warn!("cs_days_to_remove_unused too big (max 365) - using 0 (never remove)");
            self.cs_days_to_remove_unused = 0;
        }
    }

    pub fn seconds_to_remove_unused_cs(&self) -> u32 {
        self.cs_days_to_remove_unused * 86400
    }

    pub fn changelog_max_bytes(&self) -> u64 {
        self.changelog_preserve_mb as u64 * 1024 * 1024
    }

    pub fn topology_path(&self) -> PathBuf {
        self.topology_filename
            .clone()
            .unwrap_or_else(|| PathBuf::from("/etc/mfs/mfstopology.cfg"))
    }

    pub fn ipmap_path(&self) -> PathBuf {
        self.ipmap_filename
            .clone()
            .unwrap_or_else(|| PathBuf::from("/etc/mfs/mfsipmap.cfg"))
    }

    pub fn parse_reserve_space(&self) -> Result<ReserveSpace> {
        parse_reserve_space(&self.reserve_space)
    }

    /// Effective value of a configuration knob by name, as peers query it
    /// over GET_CONFIG. Unknown names yield `None`.
    pub fn lookup(&self, name: &str) -> Option<String> {
        let value = toml::Value::try_from(self).ok()?;
        let table = value.as_table()?;
        match table.get(&name.to_ascii_lowercase())? {
            toml::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// The ip remap triple (mask, source class, destination class), when all
    /// three knobs are set and consistent.
    pub fn remap(&self) -> Option<(u32, u32, u32)> {
        let src = self.remap_source_ip_class.as_deref()?;
        let dst = self.remap_destination_ip_class.as_deref()?;
        if self.remap_bits == 0 || self.remap_bits > 32 {
            warn!("remap_bits out of range ({})", self.remap_bits);
            return None;
        }
        let mask: u32 = (!0u32).checked_shl(32 - self.remap_bits as u32).unwrap_or(0);
        let src = match parse_ip(src) {
            Some(ip) => ip,
            None => {
                warn!("error parsing remap_source_ip_class ({})", src);
                return None;
            }
        };
        let dst = match parse_ip(dst) {
            Some(ip) => ip,
            None => {
                warn!("error parsing remap_destination_ip_class ({})", dst);
                return None;
            }
        };
        if src & mask != src || dst & mask != dst {
            warn!("garbage bits at the end of remap ip classes");
            return None;
        }
        Some((mask, src, dst))
    }
}

/// Parses a dotted-quad address into a host-order u32.
pub fn parse_ip(s: &str) -> Option<u32> {
    let mut ip: u32 = 0;
    let mut octets = 0;
    for part in s.trim().split('.') {
        let octet: u32 = part.parse().ok()?;
        if octet > 255 {
            return None;
        }
        ip = (ip << 8) | octet;
        octets += 1;
    }
    if octets == 4 {
        Some(ip)
    } else {
        None
    }
}

pub fn parse_reserve_space(s: &str) -> Result<ReserveSpace> {
    let s = s.trim();
    let (num, suffix) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    // size multipliers accepted in front of the mode suffix
    let (mult, suffix) = match suffix.chars().next() {
        Some('k') | Some('K') => (1u64 << 10, &suffix[1..]),
        Some('M') => (1u64 << 20, &suffix[1..]),
        Some('G') => (1u64 << 30, &suffix[1..]),
        Some('T') => (1u64 << 40, &suffix[1..]),
        _ => (1, suffix),
    };
    let value: f64 = if num.is_empty() {
        0.0
    } else {
        num.parse()
            .map_err(|_| MasterError::Config(format!("error parsing reserve_space (\"{}\")", s)))?
    };
    match suffix {
        "" | "B" => Ok(ReserveSpace::Bytes((value * mult as f64) as u64)),
        "%" => Ok(ReserveSpace::Percent(value)),
        "U" => Ok(ReserveSpace::ChunkserverUsed(value)),
        "C" => Ok(ReserveSpace::ChunkserverTotal(value)),
        _ => Err(MasterError::Config(format!(
            "error parsing reserve_space (\"{}\") ; error on '{}'",
            s, suffix
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.matocs_timeout, 10);
        assert_eq!(cfg.cs_heavy_load_grace_period, 900);
        assert_eq!(cfg.back_logs, 50);
        assert_eq!(cfg.changelog_preserve_mb, 500);
        assert_eq!(cfg.parse_reserve_space().unwrap(), ReserveSpace::Bytes(0));
    }

    #[test]
    fn clamping() {
        let mut cfg = Config {
            matocs_timeout: 1,
            back_logs: 5000,
            changelog_preserve_mb: 1,
            cs_days_to_remove_unused: 1000,
            changelog_save_mode: 9,
            ..Config::default()
        };
        cfg.normalize();
        assert_eq!(cfg.matocs_timeout, 10);
        assert_eq!(cfg.back_logs, MAX_BACK_LOGS);
        assert_eq!(cfg.changelog_preserve_mb, 100);
        assert_eq!(cfg.cs_days_to_remove_unused, 0);
        assert_eq!(cfg.changelog_save_mode, 0);
    }

    #[test]
    fn reserve_space_forms() {
        assert_eq!(parse_reserve_space("0").unwrap(), ReserveSpace::Bytes(0));
        assert_eq!(
            parse_reserve_space("10G").unwrap(),
            ReserveSpace::Bytes(10 << 30)
        );
        assert_eq!(parse_reserve_space("2.5%").unwrap(), ReserveSpace::Percent(2.5));
        assert_eq!(
            parse_reserve_space("1.5U").unwrap(),
            ReserveSpace::ChunkserverUsed(1.5)
        );
        assert_eq!(
            parse_reserve_space("2C").unwrap(),
            ReserveSpace::ChunkserverTotal(2.0)
        );
        assert!(parse_reserve_space("7Q").is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let cfg: Config = toml::from_str(
            r#"
            data_path = "/var/lib/chunkmaster"
            matocs_listen = "0.0.0.0:9420"
            cs_heavy_load_threshold = 200
            auth_code = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cs_heavy_load_threshold, 200);
        assert_eq!(cfg.auth_code.as_deref(), Some("secret"));
        assert_eq!(cfg.matoml_timeout, 10);
    }

    #[test]
    fn ip_parsing() {
        assert_eq!(parse_ip("10.0.0.1"), Some(0x0A000001));
        assert_eq!(parse_ip("255.255.255.255"), Some(0xFFFFFFFF));
        assert_eq!(parse_ip("10.0.0"), None);
        assert_eq!(parse_ip("10.0.0.256"), None);
    }
}
