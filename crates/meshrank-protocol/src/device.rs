use meshrank_geo::{hash_byte, Gps};
use serde::{Deserialize, Serialize};

/// Admin/ingest-set flags that affect whether a device is displayed on the
/// map or used as a route/neighbour endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFlags {
    #[serde(default)]
    pub hidden_on_map: bool,
    #[serde(default)]
    pub gps_implausible: bool,
    #[serde(default)]
    pub gps_flagged: bool,
    #[serde(default)]
    pub gps_estimated: bool,
    /// Room-server/chat role: excluded from displayed routes (not the map).
    #[serde(default)]
    pub exclude_from_routes: bool,
}

/// A node identified by its 64-hex public key.
///
/// `hash_byte` (the first two hex characters, upper-cased) is derived, not
/// stored; callers should use [`Device::hash_byte`] rather than recomputing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub pub_key: String,
    pub name: String,
    pub is_repeater: bool,
    pub is_observer: bool,
    #[serde(default)]
    pub gps: Option<Gps>,
    #[serde(default)]
    pub flags: DeviceFlags,
    pub last_seen: String,
    #[serde(default)]
    pub last_advert_heard_ms: Option<i64>,
    #[serde(default)]
    pub verified_advert: bool,
    #[serde(default)]
    pub name_valid: bool,
    /// Present iff this device's JSON overlay record carries `raw.meta.backfilled`;
    /// bypasses the repeat-evidence test in the repeater rank engine.
    #[serde(default)]
    pub backfilled: bool,
}

impl Device {
    pub fn hash_byte(&self) -> String {
        hash_byte(&self.pub_key)
    }

    /// A GPS fix this device can use for ranking/display purposes: present
    /// and passing the coordinate-validity rule, and not flagged/implausible.
    pub fn usable_gps(&self) -> Option<Gps> {
        match self.gps {
            Some(gps) if gps.is_valid() && !self.flags.gps_implausible && !self.flags.gps_flagged => {
                Some(gps)
            }
            _ => None,
        }
    }
}

/// An observer node: a collaborator's receiver, not itself mesh hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observer {
    pub id: String,
    pub first_seen: String,
    pub last_seen: String,
    pub count: u64,
    #[serde(default)]
    pub gps: Option<Gps>,
    #[serde(default)]
    pub best_repeater_pub: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(gps: Option<Gps>, flags: DeviceFlags) -> Device {
        Device {
            pub_key: "AB".to_owned() + &"0".repeat(62),
            name: "Test".to_owned(),
            is_repeater: true,
            is_observer: false,
            gps,
            flags,
            last_seen: "2026-01-01T00:00:00Z".to_owned(),
            last_advert_heard_ms: Some(0),
            verified_advert: true,
            name_valid: true,
            backfilled: false,
        }
    }

    #[test]
    fn hash_byte_is_first_two_hex_chars_upper() {
        let d = device(None, DeviceFlags::default());
        assert_eq!(d.hash_byte(), "AB");
    }

    #[test]
    fn usable_gps_none_when_flagged() {
        let mut flags = DeviceFlags::default();
        flags.gps_flagged = true;
        let d = device(Some(Gps::new(51.5, -0.1)), flags);
        assert!(d.usable_gps().is_none());
    }

    #[test]
    fn usable_gps_none_when_invalid_coords() {
        let d = device(Some(Gps::new(0.0, 0.0)), DeviceFlags::default());
        assert!(d.usable_gps().is_none());
    }

    #[test]
    fn usable_gps_present_for_valid_unflagged() {
        let d = device(Some(Gps::new(51.5, -0.1)), DeviceFlags::default());
        assert!(d.usable_gps().is_some());
    }
}
