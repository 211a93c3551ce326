//! Bluetooth UUIDs and protocol constants for Mi Flora devices.
//!
//! Mi Flora (HHCCJCY01) sensors broadcast MiBeacon frames under the Xiaomi
//! service UUID and expose their full reading only through three GATT
//! characteristics on a connection.

use uuid::{Uuid, uuid};

// --- Advertisement ---

/// Xiaomi MiBeacon service UUID (16-bit `0xFE95`) carried in service data.
pub const MIBEACON_SERVICE: Uuid = uuid!("0000fe95-0000-1000-8000-00805f9b34fb");

/// MiBeacon product id of the Mi Flora plant sensor (HHCCJCY01).
pub const MIFLORA_PRODUCT_ID: u16 = 0x0098;

/// Local names the Mi Flora firmware advertises. Devices with these names accept connections.
pub const MIFLORA_LOCAL_NAMES: [&str; 2] = ["Flower care", "Flower mate"];

// --- GATT ---

/// Mi Flora data service.
pub const MIFLORA_DATA_SERVICE: Uuid = uuid!("00001204-0000-1000-8000-00805f9b34fb");

/// Mode register. Writing [`READ_MODE_COMMAND`] arms a realtime data read.
pub const CMD: Uuid = uuid!("00001a00-0000-1000-8000-00805f9b34fb");

/// 16-byte realtime sensor data.
pub const DATA: Uuid = uuid!("00001a01-0000-1000-8000-00805f9b34fb");

/// 7-byte battery level and firmware version.
pub const FIRMWARE: Uuid = uuid!("00001a02-0000-1000-8000-00805f9b34fb");

/// Command bytes written to [`CMD`] before reading [`DATA`].
pub const READ_MODE_COMMAND: [u8; 2] = [0xa0, 0x1f];
