use serde::{Deserialize, Serialize};

use crate::aircraft::AircraftState;
use crate::errors::{Result, invalid_viewport};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// The visible map area of one client, as sent by the map on every pan/zoom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub south_west: LatLng,
    pub north_east: LatLng,
}

impl Viewport {
    pub fn new(south_west: LatLng, north_east: LatLng) -> Result<Self> {
        Viewport { south_west, north_east }.validated()
    }

    /// Parse and validate a client message.
    pub fn from_json(text: &str) -> Result<Self> {
        let viewport: Viewport = serde_json::from_str(text).map_err(invalid_viewport)?;
        viewport.validated()
    }

    /// Rejects non-finite or inverted bounds and clamps latitudes to the poles.
    /// Longitudes are left alone, see [`Viewport::contains`].
    pub fn validated(mut self) -> Result<Self> {
        let sw = self.south_west;
        let ne = self.north_east;
        if ![sw.lat, sw.lng, ne.lat, ne.lng].iter().all(|v| v.is_finite()) {
            return Err(invalid_viewport("non-finite coordinate"));
        }
        if sw.lat > ne.lat {
            return Err(invalid_viewport(format!("south-west lat {} above north-east lat {}", sw.lat, ne.lat)));
        }

        self.south_west.lat = sw.lat.clamp(-90.0, 90.0);
        self.north_east.lat = ne.lat.clamp(-90.0, 90.0);
        Ok(self)
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.south_west.lat <= lat && lat <= self.north_east.lat && self.contains_lng(lon)
    }

    // the map reports longitudes beyond +-180 once panned across world copies, and a
    // west bound east of the east bound means the box crosses the antimeridian
    fn contains_lng(&self, lon: f64) -> bool {
        if self.north_east.lng - self.south_west.lng >= 360.0 {
            return true;
        }

        let west = normalize_lng(self.south_west.lng);
        let east = normalize_lng(self.north_east.lng);
        let lon = normalize_lng(lon);

        if west <= east {
            west <= lon && lon <= east
        } else {
            lon >= west || lon <= east
        }
    }
}

/// Map any longitude into `[-180, 180)`.
pub fn normalize_lng(lng: f64) -> f64 {
    (lng + 180.0).rem_euclid(360.0) - 180.0
}

/// Records inside the viewport, in input order. No viewport means no filtering.
pub fn filter(records: &[AircraftState], viewport: Option<&Viewport>) -> Vec<AircraftState> {
    match viewport {
        None => records.to_vec(),
        Some(vp) => records.iter().filter(|ac| vp.contains(ac.lat, ac.lon)).cloned().collect(),
    }
}
