//! Geographic points and their fixed-point encoding.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::FIXPOINT_BITS;

/// Mean Earth radius in meters, for great-circle distances.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

const MANTISSA_MASK: u64 = (1u64 << FIXPOINT_BITS) - 1;
const FIXPOINT_SHIFT: u32 = 64 - FIXPOINT_BITS;

/// A point on the surface of Earth.
///
/// Latitude in degrees in [-90, +90], longitude in degrees in
/// [-180, +180). Two points are identical when their 52-bit fixed-point
/// encodings agree.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoPoint {
    /// Creates a point and canonicalizes it.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        let mut pt = Self {
            latitude,
            longitude,
        };
        pt.canonicalize();
        pt
    }

    /// Wraps longitude modulo 360 into [-180, 180) and clamps latitude
    /// to [-90, +90].
    pub fn canonicalize(&mut self) {
        self.longitude = (self.longitude + 180.0).rem_euclid(360.0) - 180.0;
        self.latitude = self.latitude.clamp(-90.0, 90.0);
    }

    /// Encodes the point as a pair of 64-bit fixed-point words
    /// `(latitude, longitude)`, each carrying 52 bits of precision in
    /// its high bits.
    #[must_use]
    pub fn to_fixed_point(&self) -> (u64, u64) {
        (
            latitude_to_fixpoint(self.latitude),
            longitude_to_fixpoint(self.longitude),
        )
    }

    /// Decodes a fixed-point pair produced by [`Self::to_fixed_point`].
    #[must_use]
    pub fn from_fixed_point(lat_fix: u64, lon_fix: u64) -> Self {
        Self {
            latitude: latitude_from_fixpoint(lat_fix),
            longitude: longitude_from_fixpoint(lon_fix),
        }
    }

    /// Great-circle distance to `other` in meters (haversine formula).
    #[must_use]
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let phi1 = self.latitude.to_radians();
        let phi2 = other.latitude.to_radians();
        let dphi = (other.latitude - self.latitude).to_radians();
        let dlambda = (other.longitude - self.longitude).to_radians();

        let a = (dphi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }
}

/// Longitude is periodic (-180 == +180), so it maps cleanly onto the
/// mantissa of a double in [1, 2): the mantissa bits are exactly the
/// fixed-point fraction of (longitude + 180) / 360.
fn longitude_to_fixpoint(longitude: f64) -> u64 {
    debug_assert!((-180.0..=180.0).contains(&longitude));

    let longitude = if longitude == 180.0 { -180.0 } else { longitude };
    let scaled = 1.0 + (longitude + 180.0) / 360.0;
    debug_assert!((1.0..2.0).contains(&scaled));

    (scaled.to_bits() & MANTISSA_MASK) << FIXPOINT_SHIFT
}

/// Latitude is not periodic (-90 and +90 are opposite poles), so it is
/// scaled over the closed interval instead.
fn latitude_to_fixpoint(latitude: f64) -> u64 {
    debug_assert!((-90.0..=90.0).contains(&latitude));

    let scaled = (latitude + 90.0) / 180.0;
    debug_assert!((0.0..=1.0).contains(&scaled));

    ((scaled * MANTISSA_MASK as f64).floor() as u64) << FIXPOINT_SHIFT
}

fn longitude_from_fixpoint(fix: u64) -> f64 {
    let mantissa = fix >> FIXPOINT_SHIFT;
    // exponent bits for [1, 2)
    let value = f64::from_bits((1023u64 << FIXPOINT_BITS) | mantissa);
    (value - 1.0) * 360.0 - 180.0
}

fn latitude_from_fixpoint(fix: u64) -> f64 {
    let mantissa = fix >> FIXPOINT_SHIFT;
    (mantissa as f64 / MANTISSA_MASK as f64) * 180.0 - 90.0
}

impl fmt::Debug for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeoPoint({}, {})", self.latitude, self.longitude)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lat {:.5} {}, lon {:.5} {}",
            self.latitude.abs(),
            if self.latitude >= 0.0 { "north" } else { "south" },
            self.longitude.abs(),
            if self.longitude >= 0.0 { "east" } else { "west" },
        )
    }
}
