//! Geographic coordinates, bounds and the projected-meters system.
//!
//! The projected space is spherical (web) Mercator on the WGS84 semi-major
//! axis, in meters.

use serde::{Deserialize, Serialize};

/// Sphere radius used by the web Mercator projection.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude limit of the web Mercator projection.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Longitude/latitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl LonLat {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn to_array(self) -> [f64; 2] {
        [self.lon, self.lat]
    }

    pub fn from_array(p: [f64; 2]) -> Self {
        Self { lon: p[0], lat: p[1] }
    }
}

/// Axis-aligned geographic rectangle in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl GeoBounds {
    pub fn new(min_lon: f64, max_lon: f64, min_lat: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }
    }

    /// Square region of `half_size_m` meters around `center`.
    pub fn around(center: LonLat, half_size_m: f64) -> Self {
        let (m_lon, m_lat) = meters_per_degree(center.lat);
        let half_lon = half_size_m / m_lon.max(1e-9);
        let half_lat = half_size_m / m_lat;
        Self {
            min_lon: center.lon - half_lon,
            max_lon: center.lon + half_lon,
            min_lat: (center.lat - half_lat).max(-90.0),
            max_lat: (center.lat + half_lat).min(90.0),
        }
    }

    pub fn width_deg(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height_deg(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn center(&self) -> LonLat {
        LonLat::new(
            0.5 * (self.min_lon + self.max_lon),
            0.5 * (self.min_lat + self.max_lat),
        )
    }

    pub fn contains(&self, p: LonLat) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }

    /// Same center, each half-extent multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        let c = self.center();
        let half_w = 0.5 * self.width_deg() * factor;
        let half_h = 0.5 * self.height_deg() * factor;
        Self {
            min_lon: c.lon - half_w,
            max_lon: c.lon + half_w,
            min_lat: (c.lat - half_h).max(-90.0),
            max_lat: (c.lat + half_h).min(90.0),
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.min_lon, self.max_lon, self.min_lat, self.max_lat]
            .iter()
            .all(|v| v.is_finite())
            && self.max_lon > self.min_lon
            && self.max_lat > self.min_lat
    }
}

impl std::fmt::Display for GeoBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lon [{:.6}, {:.6}] lat [{:.6}, {:.6}]",
            self.min_lon, self.max_lon, self.min_lat, self.max_lat
        )
    }
}

// ── Projection ───────────────────────────────────────────────────────────

/// Longitude/latitude (degrees) to web Mercator meters.
pub fn lonlat_to_projected(p: [f64; 2]) -> [f64; 2] {
    let lat = p[1].clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let x = EARTH_RADIUS_M * p[0].to_radians();
    let y = EARTH_RADIUS_M * (std::f64::consts::FRAC_PI_4 + 0.5 * lat).tan().ln();
    [x, y]
}

/// Web Mercator meters to longitude/latitude (degrees).
pub fn projected_to_lonlat(p: [f64; 2]) -> [f64; 2] {
    let lon = (p[0] / EARTH_RADIUS_M).to_degrees();
    let lat = (2.0 * (p[1] / EARTH_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    [lon, lat]
}

/// Approximate length of one degree of longitude and of latitude, in meters,
/// at the given latitude (degrees).
pub fn meters_per_degree(lat_deg: f64) -> (f64, f64) {
    let lat = lat_deg.to_radians();
    let m_lat = 111_132.92 - 559.82 * (2.0 * lat).cos() + 1.175 * (4.0 * lat).cos()
        - 0.0023 * (6.0 * lat).cos();
    let m_lon = 111_412.84 * lat.cos() - 93.5 * (3.0 * lat).cos() + 0.118 * (5.0 * lat).cos();
    (m_lon, m_lat)
}

/// True when both the longitude and the latitude difference are within
/// `max_deg`.
pub fn within_degrees(a: LonLat, b: LonLat, max_deg: f64) -> bool {
    (a.lon - b.lon).abs() <= max_deg && (a.lat - b.lat).abs() <= max_deg
}

/// Planar distance in degrees, used only to rank nearby candidates.
pub fn degree_distance(a: LonLat, b: LonLat) -> f64 {
    (a.lon - b.lon).hypot(a.lat - b.lat)
}
