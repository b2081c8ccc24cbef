//! Grid geometry, map projection and great-circle helpers
//!
//! The tracker works in grid coordinates while clumping and in geographic
//! coordinates while matching and forecasting. Projection from the grid to
//! latitude/longitude is a collaborator concern expressed by the
//! [`Projection`] trait; [`FlatProjection`] is the tangent-plane projection
//! used by single-radar grids.

use serde::{Deserialize, Serialize};

use crate::types::{Result, TrackError};

/// Mean earth radius in km
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A geographic position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees north
    pub lat: f64,
    /// Longitude in degrees east, normalized to [-180, 180)
    pub lon: f64,
}

impl GeoPoint {
    /// Create a point, normalizing the longitude
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon: normalize_lon(lon),
        }
    }

    /// Great-circle distance to another point in km (haversine)
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }

    /// Move the point by (east, north) km on a local tangent plane.
    ///
    /// Longitude wraps across the date line.
    pub fn offset_km(&self, east_km: f64, north_km: f64) -> GeoPoint {
        let lat = (self.lat + (north_km / EARTH_RADIUS_KM).to_degrees()).clamp(-90.0, 90.0);
        let cos_lat = self.lat.to_radians().cos().max(1.0e-6);
        let lon = self.lon + (east_km / (EARTH_RADIUS_KM * cos_lat)).to_degrees();
        GeoPoint::new(lat, lon)
    }

    /// Local (east, north) displacement in km from `self` to `other`.
    ///
    /// The longitude difference is taken the short way round the globe.
    pub fn displacement_km(&self, other: &GeoPoint) -> (f64, f64) {
        let dlon = normalize_lon(other.lon - self.lon);
        let mean_lat = ((self.lat + other.lat) / 2.0).to_radians();
        let east = dlon.to_radians() * EARTH_RADIUS_KM * mean_lat.cos();
        let north = (other.lat - self.lat).to_radians() * EARTH_RADIUS_KM;
        (east, north)
    }
}

/// Normalize a longitude into [-180, 180)
pub fn normalize_lon(lon: f64) -> f64 {
    let mut l = (lon + 180.0) % 360.0;
    if l < 0.0 {
        l += 360.0;
    }
    l - 180.0
}

/// Map projection from grid km coordinates to latitude/longitude
pub trait Projection {
    /// Convert projected (x, y) km to a geographic point
    fn xy_to_latlon(&self, x_km: f64, y_km: f64) -> GeoPoint;
}

/// Tangent-plane projection about an origin (radar site)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlatProjection {
    /// Origin latitude in degrees
    pub origin_lat: f64,
    /// Origin longitude in degrees
    pub origin_lon: f64,
}

impl FlatProjection {
    /// Create a projection about the given origin
    pub fn new(origin_lat: f64, origin_lon: f64) -> Self {
        Self {
            origin_lat,
            origin_lon,
        }
    }
}

impl Projection for FlatProjection {
    fn xy_to_latlon(&self, x_km: f64, y_km: f64) -> GeoPoint {
        GeoPoint::new(self.origin_lat, self.origin_lon).offset_km(x_km, y_km)
    }
}

/// Cartesian grid geometry of the thresholded volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridGeometry {
    /// Number of columns
    pub nx: u32,
    /// Number of rows per plane
    pub ny: u32,
    /// Number of planes
    pub nz: u32,
    /// X coordinate of column 0 (km)
    pub minx_km: f64,
    /// Y coordinate of row 0 (km)
    pub miny_km: f64,
    /// Height of plane 0 (km)
    pub minz_km: f64,
    /// Column spacing (km)
    pub dx_km: f64,
    /// Row spacing (km)
    pub dy_km: f64,
    /// Plane spacing (km)
    pub dz_km: f64,
    /// Projection origin latitude
    pub origin_lat: f64,
    /// Projection origin longitude
    pub origin_lon: f64,
}

impl Default for GridGeometry {
    fn default() -> Self {
        Self {
            nx: 100,
            ny: 100,
            nz: 1,
            minx_km: 0.0,
            miny_km: 0.0,
            minz_km: 1.0,
            dx_km: 1.0,
            dy_km: 1.0,
            dz_km: 1.0,
            origin_lat: 40.0,
            origin_lon: -105.0,
        }
    }
}

impl GridGeometry {
    /// Create a single-plane grid with square cells
    pub fn new_2d(nx: u32, ny: u32, cell_km: f64) -> Self {
        Self {
            nx,
            ny,
            nz: 1,
            dx_km: cell_km,
            dy_km: cell_km,
            ..Self::default()
        }
    }

    /// Builder method: set the projection origin
    pub fn with_origin(mut self, lat: f64, lon: f64) -> Self {
        self.origin_lat = lat;
        self.origin_lon = lon;
        self
    }

    /// Builder method: set the vertical levels
    pub fn with_planes(mut self, nz: u32, minz_km: f64, dz_km: f64) -> Self {
        self.nz = nz;
        self.minz_km = minz_km;
        self.dz_km = dz_km;
        self
    }

    /// Check dimensions and spacings
    pub fn validate(&self) -> Result<()> {
        if self.nx == 0 || self.ny == 0 || self.nz == 0 {
            return Err(TrackError::Config(format!(
                "grid dimensions must be non-zero: {}x{}x{}",
                self.nx, self.ny, self.nz
            )));
        }
        if !(self.dx_km > 0.0 && self.dy_km > 0.0 && self.dz_km > 0.0) {
            return Err(TrackError::Config(format!(
                "grid spacing must be positive: dx={} dy={} dz={}",
                self.dx_km, self.dy_km, self.dz_km
            )));
        }
        if !(-90.0..=90.0).contains(&self.origin_lat) {
            return Err(TrackError::Config(format!(
                "origin latitude out of range: {}",
                self.origin_lat
            )));
        }
        Ok(())
    }

    /// True if fractional grid coordinates fall inside the grid
    pub fn contains(&self, x: f64, y: f64, z: f64) -> bool {
        x >= 0.0
            && y >= 0.0
            && z >= 0.0
            && x < self.nx as f64
            && y < self.ny as f64
            && z < self.nz as f64
    }

    /// Convert fractional grid coordinates to projected km
    pub fn grid_to_km(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64) {
        (
            self.minx_km + x * self.dx_km,
            self.miny_km + y * self.dy_km,
            self.minz_km + z * self.dz_km,
        )
    }

    /// Horizontal area of one cell (km^2)
    pub fn cell_area_km2(&self) -> f64 {
        self.dx_km * self.dy_km
    }

    /// Volume of one cell (km^3)
    pub fn cell_volume_km3(&self) -> f64 {
        self.dx_km * self.dy_km * self.dz_km
    }

    /// Flat projection about this grid's origin
    pub fn flat_projection(&self) -> FlatProjection {
        FlatProjection::new(self.origin_lat, self.origin_lon)
    }
}
