//! Mapping between geographic points, curve indices, and node ids.
//!
//! A node id is built from a point at an even resolution `R`
//! (0 < R <= 104): each coordinate is encoded to 52-bit fixed point, the
//! high `R/2` bits of each axis select a cell on a `2^(R/2)` by
//! `2^(R/2)` grid, the Hilbert curve turns the cell into an `R`-bit
//! index, and that index becomes the high `R` bits of the id. The
//! lowest bit of the id is then forced to 1 as the validity flag.

pub mod hilbert;

use crate::constants::MAX_RESOLUTION;
use crate::error::{LocusError, LocusResult};
use crate::types::{GeoPoint, NodeId};

fn check_resolution(resolution: u8) -> LocusResult<()> {
    if resolution == 0 || resolution > MAX_RESOLUTION || resolution % 2 != 0 {
        return Err(LocusError::invalid_argument(format!(
            "resolution must be even and in (0, {MAX_RESOLUTION}], got {resolution}"
        )));
    }
    Ok(())
}

/// Builds the node id for a point at the given resolution.
pub fn node_id_for_point(point: &GeoPoint, resolution: u8) -> LocusResult<NodeId> {
    check_resolution(resolution)?;

    let order = u32::from(resolution) / 2;
    let (lat_fix, lon_fix) = point.to_fixed_point();
    let x = lat_fix >> (64 - order);
    let y = lon_fix >> (64 - order);
    let d = hilbert::xy_to_d(order, x, y);

    let mut id = node_id_from_hilbert_unchecked(d, resolution);
    id.mark_set();
    Ok(id)
}

/// Recovers the grid-cell point a node id was built from.
///
/// The returned point is the center of the cell selected by the id's
/// high `resolution` bits; at high resolutions this is within
/// centimeters of the original position. Decoding to the center keeps
/// re-encoding inside the same cell despite floating-point rounding.
pub fn point_for_node_id(id: &NodeId, resolution: u8) -> LocusResult<GeoPoint> {
    check_resolution(resolution)?;

    let order = u32::from(resolution) / 2;
    let d = hilbert_for_node_id(id, resolution)?;
    let (x, y) = hilbert::d_to_xy(order, d);
    let half_cell = 1u64 << (63 - order);
    Ok(GeoPoint::from_fixed_point(
        (x << (64 - order)) | half_cell,
        (y << (64 - order)) | half_cell,
    ))
}

/// Extracts the curve index from the high `resolution` bits of an id.
pub fn hilbert_for_node_id(id: &NodeId, resolution: u8) -> LocusResult<u128> {
    check_resolution(resolution)?;

    let mut d: u128 = 0;
    for pos in 0..resolution {
        d = (d << 1) | u128::from(id.bit_at(pos));
    }
    Ok(d)
}

/// Builds the node id whose high `resolution` bits are the given curve
/// index, with the validity flag set.
pub fn node_id_for_hilbert(d: u128, resolution: u8) -> LocusResult<NodeId> {
    check_resolution(resolution)?;
    if d >> resolution != 0 {
        return Err(LocusError::invalid_argument(format!(
            "curve index does not fit in {resolution} bits"
        )));
    }

    let mut id = node_id_from_hilbert_unchecked(d, resolution);
    id.mark_set();
    Ok(id)
}

fn node_id_from_hilbert_unchecked(d: u128, resolution: u8) -> NodeId {
    let mut id = NodeId::ZERO;
    for pos in 0..resolution {
        let bit = (d >> (resolution - 1 - pos)) & 1 == 1;
        id.set_bit_at(pos, bit);
    }
    id
}

/// The half-open curve-index interval `[lower, upper)` covered by the
/// high `resolution` bits of a prefix range.
///
/// The range's mask must not exceed the resolution.
pub fn hilbert_interval(
    range: &crate::types::NodeIdRange,
    resolution: u8,
) -> LocusResult<(u128, u128)> {
    check_resolution(resolution)?;
    if range.mask() > resolution {
        return Err(LocusError::invalid_argument(format!(
            "range {range} is finer than resolution {resolution}"
        )));
    }

    let lower = hilbert_for_node_id(range.from(), resolution)?;
    let size = 1u128 << (resolution - range.mask());
    Ok((lower, lower + size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeIdRange;

    #[test]
    fn test_rejects_bad_resolution() {
        let pt = GeoPoint::new(0.0, 0.0);
        assert!(node_id_for_point(&pt, 0).is_err());
        assert!(node_id_for_point(&pt, 3).is_err());
        assert!(node_id_for_point(&pt, 106).is_err());
        assert!(node_id_for_point(&pt, 64).is_ok());
        assert!(node_id_for_point(&pt, 104).is_ok());
    }

    #[test]
    fn test_node_id_has_validity_flag_and_alignment() {
        let pt = GeoPoint::new(37.4, -122.1);
        let id = node_id_for_point(&pt, 64).unwrap();
        assert!(id.is_set());
        // coordinate bits live in the high 64 bits only
        for pos in 64..159 {
            assert!(!id.bit_at(pos), "unexpected bit at {pos}");
        }
    }

    #[test]
    fn test_hilbert_roundtrip_through_node_id() {
        for resolution in [2u8, 16, 64, 104] {
            for d in [0u128, 1, 2, 3] {
                let id = node_id_for_hilbert(d, resolution).unwrap();
                assert_eq!(hilbert_for_node_id(&id, resolution).unwrap(), d);
            }
            let max = (1u128 << resolution) - 1;
            let id = node_id_for_hilbert(max, resolution).unwrap();
            assert_eq!(hilbert_for_node_id(&id, resolution).unwrap(), max);
        }
    }

    #[test]
    fn test_point_roundtrip_is_stable() {
        // encoding the decoded point must produce the same id
        for resolution in [16u8, 32, 64] {
            let pt = GeoPoint::new(48.8566, 2.3522);
            let id = node_id_for_point(&pt, resolution).unwrap();
            let decoded = point_for_node_id(&id, resolution).unwrap();
            let again = node_id_for_point(&decoded, resolution).unwrap();
            assert_eq!(id, again, "resolution {resolution}");
        }
    }

    #[test]
    fn test_nearby_points_share_prefix() {
        // two clients a few meters apart at the equator share at least
        // the high 40 bits at the finest resolution; the pair sits just
        // east of the -180 meridian so both grid cells fall in the same
        // aligned subsquare
        let a = GeoPoint::new(0.0, -180.0);
        let b = GeoPoint::new(0.0, -179.99997);
        assert!(a.distance_m(&b) < 1_000.0);

        let id_a = node_id_for_point(&a, 104).unwrap();
        let id_b = node_id_for_point(&b, 104).unwrap();
        assert_ne!(id_a, id_b);
        let shared = (0..160).take_while(|&i| id_a.bit_at(i) == id_b.bit_at(i)).count();
        assert!(shared >= 40, "only {shared} shared bits");
    }

    #[test]
    fn test_hilbert_interval() {
        let (lower, upper) = hilbert_interval(&NodeIdRange::UNIVERSAL, 8).unwrap();
        assert_eq!((lower, upper), (0, 256));

        let (left, right) = NodeIdRange::UNIVERSAL.split();
        assert_eq!(hilbert_interval(&left, 8).unwrap(), (0, 128));
        assert_eq!(hilbert_interval(&right, 8).unwrap(), (128, 256));

        let (_, rr) = right.split();
        assert_eq!(hilbert_interval(&rr, 8).unwrap(), (192, 256));
    }

    #[test]
    fn test_interval_rejects_overfine_range() {
        let mut range = NodeIdRange::UNIVERSAL;
        for _ in 0..10 {
            range = range.split().0;
        }
        assert!(hilbert_interval(&range, 8).is_err());
    }
}
