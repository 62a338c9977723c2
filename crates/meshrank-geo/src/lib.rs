//! Geo primitives shared by the storage façade and the rank engines: GPS
//! validity rules and great-circle distance, factored out of the handlers so
//! both the repeater-rank and observer-rank engines apply the same rules.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres, matching the constant used throughout the
/// rank engines' 200km/300km/60km distance cutoffs.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gps {
    pub lat: f64,
    pub lon: f64,
}

impl Gps {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// A GPS fix is valid iff both coordinates are finite, not exactly (0,0),
    /// and within the normal lat/lon ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && !(self.lat == 0.0 && self.lon == 0.0)
            && self.lat.abs() <= 90.0
            && self.lon.abs() <= 180.0
    }

    /// Great-circle distance to `other`, in kilometres.
    pub fn distance_km(&self, other: &Gps) -> f64 {
        haversine_km(self.lat, self.lon, other.lat, other.lon)
    }
}

/// Haversine great-circle distance between two lat/lon points, in kilometres.
///
/// `haversine_km(a, a) == 0` within floating tolerance and the function is
/// symmetric in its two points.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1r, lat2r) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1r.cos() * lat2r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

/// Normalises a mesh path hop token to exactly two upper-case hex characters,
/// returning the sentinel `"??"` for anything that doesn't parse as hex.
///
/// Idempotent: `normalize_path_hash(normalize_path_hash(x)) == normalize_path_hash(x)`.
pub fn normalize_path_hash(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.len() >= 2 && trimmed[..2].chars().all(|c| c.is_ascii_hexdigit()) {
        trimmed[..2].to_ascii_uppercase()
    } else {
        "??".to_owned()
    }
}

/// Derives the two-hex `hashByte` from a 64-hex device public key.
pub fn hash_byte(pub_key: &str) -> String {
    normalize_path_hash(pub_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_same_point_is_zero() {
        assert!(haversine_km(51.5, -0.1, 51.5, -0.1) < 1e-9);
    }

    #[test]
    fn haversine_is_symmetric() {
        let a = haversine_km(51.5, -0.1, 48.8, 2.3);
        let b = haversine_km(48.8, 2.3, 51.5, -0.1);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn haversine_london_paris_is_roughly_344km() {
        let d = haversine_km(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((300.0..400.0).contains(&d), "got {d}");
    }

    #[test]
    fn gps_zero_zero_is_invalid() {
        assert!(!Gps::new(0.0, 0.0).is_valid());
    }

    #[test]
    fn gps_out_of_range_is_invalid() {
        assert!(!Gps::new(91.0, 0.0).is_valid());
        assert!(!Gps::new(0.0, 181.0).is_valid());
    }

    #[test]
    fn gps_nan_is_invalid() {
        assert!(!Gps::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn gps_valid_point() {
        assert!(Gps::new(51.5, -0.1).is_valid());
    }

    #[test]
    fn normalize_path_hash_upper_cases_and_truncates() {
        assert_eq!(normalize_path_hash("ab"), "AB");
        assert_eq!(normalize_path_hash("abcdef"), "AB");
    }

    #[test]
    fn normalize_path_hash_is_idempotent() {
        let once = normalize_path_hash("aB12");
        let twice = normalize_path_hash(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_path_hash_rejects_non_hex() {
        assert_eq!(normalize_path_hash("zz"), "??");
        assert_eq!(normalize_path_hash(""), "??");
        assert_eq!(normalize_path_hash("a"), "??");
    }
}
