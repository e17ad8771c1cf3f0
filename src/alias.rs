//! Operator-assigned display names for sensor addresses.
//!
//! Readings carry the address in canonical lowercase form, so alias keys are
//! normalized the same way when they are parsed.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;

/// Canonical address to display name.
pub type AliasMap = BTreeMap<String, String>;

/// A parsed alias mapping a MAC address to a human-readable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// Canonical address (e.g., "aa:bb:cc:dd:ee:ff")
    pub address: String,
    /// The human-readable name (e.g., "Sauna")
    pub name: String,
}

/// Parse an alias from a string in the format "MAC=NAME".
///
/// # Example
/// ```
/// use ble_sensor_gateway::alias::parse_alias;
///
/// let alias = parse_alias("AA:BB:CC:DD:EE:FF=Kitchen").unwrap();
/// assert_eq!(alias.address, "aa:bb:cc:dd:ee:ff");
/// assert_eq!(alias.name, "Kitchen");
/// ```
pub fn parse_alias(src: &str) -> Result<Alias, String> {
    let (address, name) = src
        .split_once('=')
        .ok_or_else(|| "invalid alias: expected format MAC=NAME".to_string())?;

    let mac: MacAddress = address
        .trim()
        .parse()
        .map_err(|e| format!("invalid alias address '{address}': {e}"))?;

    Ok(Alias {
        address: mac.to_string(),
        name: name.into(),
    })
}

/// Convert a slice of Alias values into an AliasMap. Later duplicates win.
pub fn to_map(aliases: &[Alias]) -> AliasMap {
    aliases
        .iter()
        .map(|a| (a.address.clone(), a.name.clone()))
        .collect()
}

/// Display name for a device: its alias if one is configured, else the name
/// it advertised.
pub fn resolve_name(address: &str, decoded_name: &str, aliases: &AliasMap) -> String {
    aliases
        .get(address)
        .cloned()
        .unwrap_or_else(|| decoded_name.to_string())
}
