//! Relay list validation against the external VPN inventory.

use crate::error::BootstrapError;
use serde::Deserialize;
use tracing::info;

/// Public inventory of WireGuard exit relays.
pub const INVENTORY_URL: &str = "https://api.mullvad.net/app/v1/relays";

#[derive(Debug, Deserialize)]
struct Inventory {
    wireguard: WireguardRelays,
}

#[derive(Debug, Deserialize)]
struct WireguardRelays {
    relays: Vec<RelayEntry>,
}

/// One relay as advertised by the inventory. Only the fields the
/// coordinator checks; everything else in the feed is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayEntry {
    pub hostname: String,
    #[serde(default)]
    pub daita: bool,
}

/// Fetch the WireGuard relay inventory.
pub async fn fetch_inventory(url: &str) -> Result<Vec<RelayEntry>, reqwest::Error> {
    let inventory: Inventory = reqwest::get(url).await?.error_for_status()?.json().await?;
    info!("Fetched {} relays from inventory", inventory.wireguard.relays.len());
    Ok(inventory.wireguard.relays)
}

/// Reject configured relays the inventory does not know, and relays that
/// cannot run the shaping mode (every cell with mode=on needs it).
pub fn validate(relays: &[String], inventory: &[RelayEntry]) -> Result<(), BootstrapError> {
    let unknown: Vec<String> = relays
        .iter()
        .filter(|name| !inventory.iter().any(|e| &e.hostname == *name))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(BootstrapError::UnknownRelays(unknown));
    }

    let no_daita: Vec<String> = relays
        .iter()
        .filter(|name| {
            inventory
                .iter()
                .any(|e| &e.hostname == *name && !e.daita)
        })
        .cloned()
        .collect();
    if !no_daita.is_empty() {
        return Err(BootstrapError::RelaysWithoutDaita(no_daita));
    }

    Ok(())
}
