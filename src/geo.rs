use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;
const KM_PER_DEGREE_LAT: f64 = 111.32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lamin: f64,
    pub lamax: f64,
    pub lomin: f64,
    pub lomax: f64,
}

impl BoundingBox {
    /// Box of half-width `radius_km` centred on a point. Longitude span widens with latitude.
    pub fn around(latitude: f64, longitude: f64, radius_km: f64) -> Self {
        let dlat = radius_km / KM_PER_DEGREE_LAT;
        let cos = latitude.to_radians().cos().abs().max(1e-6);
        let dlon = (radius_km / (KM_PER_DEGREE_LAT * cos)).min(180.0);
        Self {
            lamin: (latitude - dlat).max(-90.0),
            lamax: (latitude + dlat).min(90.0),
            lomin: (longitude - dlon).max(-180.0),
            lomax: (longitude + dlon).min(180.0),
        }
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lamin..=self.lamax).contains(&latitude) && (self.lomin..=self.lomax).contains(&longitude)
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}
