//! Peripheral identifier helpers.

use btleplug::platform::PeripheralId;

/// Address reported by platforms that hide the radio address.
pub(crate) const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a string.
///
/// On macOS peripheral IDs are UUIDs; elsewhere they wrap the radio address.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Identifier for a peripheral: its address, or the platform ID when the address is hidden.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    identifier_or(address, || format_peripheral_id(peripheral_id))
}

fn identifier_or(address: &str, fallback: impl FnOnce() -> String) -> String {
    if address == HIDDEN_ADDRESS {
        fallback().to_lowercase()
    } else {
        address.to_lowercase()
    }
}
