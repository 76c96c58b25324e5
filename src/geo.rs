/// Corridor half-width around a route's anchor points, in km.
pub const CORRIDOR_RADIUS_KM: f64 = 2.0;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates, in km.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Whether a point lies within the route corridor: within 2 km of the origin,
/// the destination, or their midpoint.
pub fn within_corridor(
    lat: f64,
    lng: f64,
    origin: (f64, f64),
    destination: (f64, f64),
) -> bool {
    let mid = (
        (origin.0 + destination.0) / 2.0,
        (origin.1 + destination.1) / 2.0,
    );
    for anchor in [origin, destination, mid] {
        if haversine_km(lat, lng, anchor.0, anchor.1) <= CORRIDOR_RADIUS_KM {
            return true;
        }
    }
    false
}
