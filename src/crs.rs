//! Coordinate reference systems understood by the boundary loader, and the
//! forward projections used to bring WGS84 stops into the layer's CRS.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use geo::Point;

use crate::error::{PipelineError, Result};

const WGS84_A: f64 = 6_378_137.0;
// GRS80 first eccentricity.
const GRS80_E: f64 = 0.081_819_191_042_815_8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// Geographic longitude/latitude, EPSG:4326 or OGC CRS84.
    Wgs84,
    /// EPSG:3857.
    WebMercator,
    /// EPSG:2154, the French metropolitan Lambert conformal conic.
    Lambert93,
}

impl Crs {
    /// Parses an authority string as found in a GeoJSON `crs` member.
    ///
    /// Accepts `EPSG:2154`, `urn:ogc:def:crs:EPSG::2154`,
    /// `urn:ogc:def:crs:OGC:1.3:CRS84` and similar spellings.
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        if upper.ends_with("CRS84") {
            return Ok(Crs::Wgs84);
        }
        let code = upper
            .rsplit(':')
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PipelineError::UnsupportedCrs(name.to_string()))?;
        match code {
            "4326" => Ok(Crs::Wgs84),
            "3857" | "900913" => Ok(Crs::WebMercator),
            "2154" => Ok(Crs::Lambert93),
            _ => Err(PipelineError::UnsupportedCrs(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Crs::Wgs84 => "EPSG:4326",
            Crs::WebMercator => "EPSG:3857",
            Crs::Lambert93 => "EPSG:2154",
        }
    }

    /// Projects a WGS84 `(longitude, latitude)` point into this CRS.
    pub fn project(&self, lonlat: Point<f64>) -> Point<f64> {
        match self {
            Crs::Wgs84 => lonlat,
            Crs::WebMercator => web_mercator(lonlat),
            Crs::Lambert93 => lambert93(lonlat),
        }
    }
}

fn web_mercator(p: Point<f64>) -> Point<f64> {
    let x = WGS84_A * p.x().to_radians();
    let y = WGS84_A * (FRAC_PI_4 + p.y().to_radians() / 2.0).tan().ln();
    Point::new(x, y)
}

// Lambert conformal conic, two standard parallels (49N, 44N), origin 46.5N 3E.
fn lambert93(p: Point<f64>) -> Point<f64> {
    let phi0 = 46.5_f64.to_radians();
    let phi1 = 49.0_f64.to_radians();
    let phi2 = 44.0_f64.to_radians();
    let lambda0 = 3.0_f64.to_radians();
    let (x0, y0) = (700_000.0, 6_600_000.0);

    let m1 = lcc_m(phi1);
    let m2 = lcc_m(phi2);
    let t0 = lcc_t(phi0);
    let t1 = lcc_t(phi1);
    let t2 = lcc_t(phi2);

    let n = (m1.ln() - m2.ln()) / (t1.ln() - t2.ln());
    let f = m1 / (n * t1.powf(n));
    let rho0 = WGS84_A * f * t0.powf(n);

    let phi = p.y().to_radians();
    let rho = WGS84_A * f * lcc_t(phi).powf(n);
    let theta = n * (p.x().to_radians() - lambda0);

    Point::new(x0 + rho * theta.sin(), y0 + rho0 - rho * theta.cos())
}

fn lcc_m(phi: f64) -> f64 {
    let s = phi.sin();
    phi.cos() / (1.0 - GRS80_E * GRS80_E * s * s).sqrt()
}

fn lcc_t(phi: f64) -> f64 {
    let s = phi.sin();
    (FRAC_PI_4 - phi / 2.0).tan()
        / ((1.0 - GRS80_E * s) / (1.0 + GRS80_E * s)).powf(GRS80_E / 2.0)
}

// Latitude must stay strictly inside the poles for both projections.
pub fn is_projectable(lonlat: Point<f64>) -> bool {
    let lat = lonlat.y().to_radians();
    lat.abs() < FRAC_PI_2 && lonlat.x().abs() <= 180.0
}
