//! Great-circle helpers for location fixes

use crate::reading::GeoPoint;

const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Haversine distance between two fixes in meters, ignoring altitude
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_point_is_zero() {
        let p = GeoPoint::new(59.9139, 10.7522);
        assert_eq!(haversine_m(&p, &p), 0.0);
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(1.0, 0.0);
        let d = haversine_m(&a, &b);
        assert!((d - 111_195.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn test_symmetric() {
        let a = GeoPoint::new(48.8566, 2.3522);
        let b = GeoPoint::new(51.5074, -0.1278);
        assert!((haversine_m(&a, &b) - haversine_m(&b, &a)).abs() < 1e-6);
        assert!((haversine_m(&a, &b) - 343_500.0).abs() < 1_500.0);
    }
}
