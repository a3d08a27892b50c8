//! Just enough positional astronomy for feasibility checks.
//!
//! Low-precision formulas (sidereal time to well under a second over a few
//! decades, no precession, nutation, or refraction). Good for deciding
//! whether a source is above a horizon limit, not for pointing.

use chrono::{DateTime, Utc};

use crate::hardware::SkyPosition;

/// Observatory location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Site {
    /// North positive.
    pub latitude_deg: f64,
    /// East positive.
    pub longitude_deg: f64,
}

impl Site {
    /// Site at the given latitude and longitude, degrees.
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
        }
    }

    /// Local apparent sidereal time, hours in [0, 24).
    pub fn local_sidereal_hours(&self, at: DateTime<Utc>) -> f64 {
        (gmst_hours(at) + self.longitude_deg / 15.0).rem_euclid(24.0)
    }

    /// Elevation of a position above the horizon, degrees.
    pub fn elevation_deg(&self, position: SkyPosition, at: DateTime<Utc>) -> f64 {
        let hour_angle = (self.local_sidereal_hours(at) - position.ra_hours) * 15.0;
        let (lat, dec, ha) = (
            self.latitude_deg.to_radians(),
            position.dec_deg.to_radians(),
            hour_angle.to_radians(),
        );
        let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * ha.cos();
        sin_alt.clamp(-1.0, 1.0).asin().to_degrees()
    }
}

fn julian_date(at: DateTime<Utc>) -> f64 {
    let secs = at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) * 1e-9;
    secs / 86_400.0 + 2_440_587.5
}

/// Greenwich mean sidereal time, hours in [0, 24).
pub fn gmst_hours(at: DateTime<Utc>) -> f64 {
    let d = julian_date(at) - 2_451_545.0;
    (18.697_374_558 + 24.065_709_824_419_08 * d).rem_euclid(24.0)
}

/// Great-circle distance between two positions, degrees.
pub fn separation_deg(a: SkyPosition, b: SkyPosition) -> f64 {
    let (ra1, dec1) = ((a.ra_hours * 15.0).to_radians(), a.dec_deg.to_radians());
    let (ra2, dec2) = ((b.ra_hours * 15.0).to_radians(), b.dec_deg.to_radians());
    let cos_sep = dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * (ra1 - ra2).cos();
    cos_sep.clamp(-1.0, 1.0).acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_gmst_at_j2000() {
        let j2000 = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((gmst_hours(j2000) - 18.697_374_558).abs() < 1e-6);
    }

    #[test]
    fn test_pole_elevation_equals_latitude() {
        let site = Site::new(40.8, -121.5);
        let pole = SkyPosition::new(0.0, 90.0);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 4, 0, 0).unwrap();
        assert!((site.elevation_deg(pole, at) - 40.8).abs() < 1e-6);
    }

    #[test]
    fn test_transit_elevation() {
        let site = Site::new(40.8, -121.5);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 4, 0, 0).unwrap();
        let transiting = SkyPosition::new(site.local_sidereal_hours(at), 10.0);
        assert!((site.elevation_deg(transiting, at) - 59.2).abs() < 1e-6);
    }

    #[test]
    fn test_separation() {
        let a = SkyPosition::new(0.0, 0.0);
        assert!((separation_deg(a, SkyPosition::new(6.0, 0.0)) - 90.0).abs() < 1e-9);
        assert!((separation_deg(a, SkyPosition::new(0.0, -30.0)) - 30.0).abs() < 1e-9);
        assert!(separation_deg(a, a).abs() < 1e-6);
    }
}
