//! Device identity derived from the network MAC address.
//!
//! The terminal answers `0x0b` (UUID), `0x0c` (chip id) and `0x10` (MAC)
//! with strings derived from one 6-byte address:
//!
//! - MAC: `de:ad:be:ef:ca:fe`
//! - UUID: the 12 hex digits of the MAC, lowercase
//! - chip id: `VG-EFCAFE` (last 3 bytes, uppercase)
//!
//! On a host without a usable interface a fixed address is used so the
//! values stay deterministic across runs.

use core::fmt::Write;

use crate::app::ports::DeviceIdentity;

/// Full 6-byte MAC address.
pub type MacAddress = [u8; 6];

pub type IdString = heapless::String<24>;

const FALLBACK_MAC: MacAddress = [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE];

/// Parse `aa:bb:cc:dd:ee:ff` (either case).
pub fn parse_mac(text: &str) -> Option<MacAddress> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

/// First non-zero interface address under `/sys/class/net`, else a fixed
/// fallback.
pub fn read_mac() -> MacAddress {
    let Ok(dir) = std::fs::read_dir("/sys/class/net") else {
        return FALLBACK_MAC;
    };
    let mut names: Vec<_> = dir.filter_map(Result::ok).map(|e| e.path()).collect();
    names.sort();
    names
        .iter()
        .filter_map(|p| std::fs::read_to_string(p.join("address")).ok())
        .filter_map(|s| parse_mac(&s))
        .find(|mac| mac.iter().any(|&b| b != 0))
        .unwrap_or(FALLBACK_MAC)
}

pub fn format_mac(mac: &MacAddress) -> IdString {
    let mut s = IdString::new();
    let _ = write!(
        s,
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
    s
}

pub fn uuid(mac: &MacAddress) -> IdString {
    let mut s = IdString::new();
    for b in mac {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Short chip id from the last 3 MAC bytes, e.g. `VG-EFCAFE`.
pub fn chip_id(mac: &MacAddress) -> IdString {
    let mut s = IdString::new();
    let _ = write!(s, "VG-{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5]);
    s
}

/// Identity block for the device port.
pub fn identity(mac: &MacAddress, serial_number: &str) -> DeviceIdentity {
    DeviceIdentity {
        serial_number: serial_number.to_owned(),
        uuid: uuid(mac).as_str().to_owned(),
        chip_id: chip_id(mac).as_str().to_owned(),
        mac: format_mac(mac).as_str().to_owned(),
    }
}
