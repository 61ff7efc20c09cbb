//! Grid projection for device coordinates
//!
//! Device exports carry WGS84 longitude/latitude, but every stored geometry
//! is in a projected metric grid so planar lengths and areas are meaningful.
//! The projection is an ellipsoidal transverse Mercator in the USGS series
//! form, with a New Zealand Transverse Mercator 2000 preset.

use geo::Coord;

/// GRS80 semi-major axis in meters
pub const GRS80_SEMI_MAJOR_M: f64 = 6_378_137.0;

/// GRS80 inverse flattening
pub const GRS80_INVERSE_FLATTENING: f64 = 298.257_222_101;

/// Ellipsoidal transverse Mercator projection (forward only)
#[derive(Clone, Copy, Debug)]
pub struct TransverseMercator {
    /// Central meridian in radians
    central_meridian: f64,
    /// Latitude of origin in radians
    origin_latitude: f64,
    /// Scale factor on the central meridian
    scale_factor: f64,
    false_easting: f64,
    false_northing: f64,
    /// First eccentricity squared
    e2: f64,
    /// Second eccentricity squared
    ep2: f64,
    /// Meridional arc series coefficients, precomputed from `e2`
    arc_c0: f64,
    arc_c2: f64,
    arc_c4: f64,
    arc_c6: f64,
    /// Meridional arc at the origin latitude
    arc_origin: f64,
}

impl TransverseMercator {
    /// Build a projection on the GRS80 ellipsoid
    ///
    /// # Arguments
    /// * `central_meridian_deg` - Central meridian in degrees
    /// * `origin_latitude_deg` - Latitude of origin in degrees
    /// * `scale_factor` - Scale on the central meridian (e.g. 0.9996)
    /// * `false_easting` / `false_northing` - Grid offsets in meters
    pub fn new(
        central_meridian_deg: f64,
        origin_latitude_deg: f64,
        scale_factor: f64,
        false_easting: f64,
        false_northing: f64,
    ) -> Self {
        let f = 1.0 / GRS80_INVERSE_FLATTENING;
        let e2 = 2.0 * f - f * f;
        let e4 = e2 * e2;
        let e6 = e4 * e2;

        let arc_c0 = 1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0;
        let arc_c2 = 3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0;
        let arc_c4 = 15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0;
        let arc_c6 = 35.0 * e6 / 3072.0;

        let mut projection = TransverseMercator {
            central_meridian: central_meridian_deg.to_radians(),
            origin_latitude: origin_latitude_deg.to_radians(),
            scale_factor,
            false_easting,
            false_northing,
            e2,
            ep2: e2 / (1.0 - e2),
            arc_c0,
            arc_c2,
            arc_c4,
            arc_c6,
            arc_origin: 0.0,
        };
        projection.arc_origin = projection.meridional_arc(projection.origin_latitude);
        projection
    }

    /// New Zealand Transverse Mercator 2000 (EPSG:2193)
    pub fn nztm2000() -> Self {
        Self::new(173.0, 0.0, 0.9996, 1_600_000.0, 10_000_000.0)
    }

    /// Project WGS84 (lon, lat) in degrees to grid (easting, northing) in meters
    ///
    /// # Returns
    /// A `Coord<f64>` with x (easting) and y (northing) in meters
    pub fn project(&self, lon_deg: f64, lat_deg: f64) -> Coord<f64> {
        let lat = lat_deg.to_radians();
        let lon = lon_deg.to_radians();

        let sin_lat = lat.sin();
        let cos_lat = lat.cos();
        let tan_lat = lat.tan();

        let n = GRS80_SEMI_MAJOR_M / (1.0 - self.e2 * sin_lat * sin_lat).sqrt();
        let t = tan_lat * tan_lat;
        let c = self.ep2 * cos_lat * cos_lat;
        let a = (lon - self.central_meridian) * cos_lat;
        let a2 = a * a;
        let a3 = a2 * a;
        let a4 = a3 * a;
        let a5 = a4 * a;
        let a6 = a5 * a;

        let x = self.false_easting
            + self.scale_factor
                * n
                * (a
                    + (1.0 - t + c) * a3 / 6.0
                    + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * self.ep2) * a5 / 120.0);

        let m = self.meridional_arc(lat);
        let y = self.false_northing
            + self.scale_factor
                * (m - self.arc_origin
                    + n * tan_lat
                        * (a2 / 2.0
                            + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                            + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * self.ep2) * a6
                                / 720.0));

        Coord { x, y }
    }

    /// Meridional arc length from the equator in meters
    #[inline]
    fn meridional_arc(&self, lat: f64) -> f64 {
        GRS80_SEMI_MAJOR_M
            * (self.arc_c0 * lat - self.arc_c2 * (2.0 * lat).sin()
                + self.arc_c4 * (4.0 * lat).sin()
                - self.arc_c6 * (6.0 * lat).sin())
    }
}
