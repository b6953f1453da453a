use crate::models::courier::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Great-circle distance between two points.
pub fn distance_km(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lng = (to.lng - from.lng).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + from.lat.to_radians().cos() * to.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    EARTH_RADIUS_KM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

pub fn is_valid(point: &GeoPoint) -> bool {
    (-90.0..=90.0).contains(&point.lat) && (-180.0..=180.0).contains(&point.lng)
}

pub fn within_radius(from: &GeoPoint, to: &GeoPoint, radius_km: f64) -> bool {
    distance_km(from, to) <= radius_km
}

#[cfg(test)]
mod tests {
    use super::{distance_km, is_valid, within_radius};
    use crate::models::courier::GeoPoint;

    const CHORSU: GeoPoint = GeoPoint { lat: 41.3265, lng: 69.2361 };
    const AMIR_TEMUR_SQUARE: GeoPoint = GeoPoint { lat: 41.3111, lng: 69.2797 };
    const SAMARKAND: GeoPoint = GeoPoint { lat: 39.6542, lng: 66.9597 };

    #[test]
    fn same_point_is_zero() {
        assert!(distance_km(&CHORSU, &CHORSU) < 1e-9);
    }

    #[test]
    fn tashkent_to_samarkand_is_around_270_km() {
        let distance = distance_km(&AMIR_TEMUR_SQUARE, &SAMARKAND);
        assert!((distance - 270.0).abs() < 10.0, "got {distance}");
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(is_valid(&CHORSU));
        assert!(!is_valid(&GeoPoint { lat: 91.0, lng: 69.0 }));
        assert!(!is_valid(&GeoPoint { lat: 41.0, lng: f64::NAN }));
    }

    #[test]
    fn radius_check_uses_inclusive_bound() {
        let distance = distance_km(&CHORSU, &AMIR_TEMUR_SQUARE);
        assert!(within_radius(&CHORSU, &AMIR_TEMUR_SQUARE, distance));
        assert!(!within_radius(&CHORSU, &AMIR_TEMUR_SQUARE, distance - 0.1));
    }
}
