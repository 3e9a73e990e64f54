//! Built-in naming convention of the MERA archive.
//!
//! Variables are CF standard names, optionally suffixed with a vertical
//! level (`air_temperature_at_2_metres`, `geopotential_at_500_hPa`). Each
//! maps to a GRIB1 identifier (indicatorOfParameter, indicatorOfTypeOfLevel,
//! level, timeRangeIndicator) which in turn names one monthly file per
//! stream:
//!
//! `mera/{iop}/{itl}/{lev}/{tri}/MERA_PRODYEAR_{yyyy}_{mm}_{iop}_{itl}_{lev}_{tri}_{stream}`
//!
//! Older drives hold the same files bz2-compressed, so the `.bz2` spelling
//! is kept as a second candidate.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::catalog::{ArchivePathPattern, PathTemplate};
use crate::domain::{Granularity, VariableName};

pub const DEFAULT_STREAM: &str = "ANALYSIS";

const MERA_TEMPLATE: &str =
    "mera/{iop}/{itl}/{lev}/{tri}/MERA_PRODYEAR_{yyyy}_{mm}_{iop}_{itl}_{lev}_{tri}_{stream}";
const COMPRESSED_SUFFIX: &str = ".bz2";
const LEVEL_SEPARATOR: &str = "_at_";

/// CF standard name → default (IOP, ITL, LEV, TRI).
const DEFAULT_GRIB1_IDS: &[(&str, (u16, u16, u32, u16))] = &[
    ("air_pressure", (1, 105, 0, 0)),
    ("geopotential", (6, 105, 0, 0)),
    ("geopotential_height", (7, 100, 850, 0)),
    ("air_temperature", (11, 105, 2, 0)),
    ("virtual_temperature", (12, 105, 2, 0)),
    ("air_potential_temperature", (13, 105, 2, 0)),
    ("wet_bulb_potential_temperature", (14, 105, 2, 0)),
    ("maximum_temperature", (15, 105, 2, 2)),
    ("minimum_temperature", (16, 105, 2, 2)),
    ("dew_point_temperature", (17, 105, 0, 0)),
    ("visibility_in_air", (20, 105, 0, 0)),
    ("wind_from_direction", (31, 105, 10, 0)),
    ("wind_speed", (32, 105, 10, 0)),
    ("eastward_wind", (33, 105, 10, 0)),
    ("northward_wind", (34, 105, 10, 0)),
    ("upward_air_velocity", (40, 100, 850, 0)),
    ("atmosphere_absolute_vorticity", (41, 100, 850, 0)),
    ("atmosphere_relative_vorticity", (43, 100, 850, 0)),
    ("divergence_of_wind", (44, 100, 850, 0)),
    ("specific_humidity", (51, 105, 2, 0)),
    ("relative_humidity", (52, 105, 2, 0)),
    ("atmosphere_mass_content_of_water_vapor", (54, 200, 0, 0)),
    ("atmosphere_cloud_ice_content", (58, 200, 0, 0)),
    ("precipitation_amount", (61, 105, 0, 4)),
    ("surface_snow_amount", (65, 105, 0, 4)),
    ("ocean_mixed_layer_thickness", (67, 105, 0, 0)),
    ("cloud_area_fraction", (71, 105, 0, 0)),
    ("low_type_cloud_area_fraction", (73, 105, 0, 0)),
    ("medium_type_cloud_area_fraction", (74, 105, 0, 0)),
    ("high_type_cloud_area_fraction", (75, 105, 0, 0)),
    ("atmosphere_mass_content_of_cloud_condensed_water", (76, 200, 0, 0)),
    ("land_binary_mask", (81, 105, 0, 0)),
    ("surface_roughness_length", (83, 105, 0, 0)),
    ("surface_albedo", (84, 105, 0, 0)),
    ("vegetation_area_fraction", (87, 105, 0, 0)),
    ("surface_net_upward_shortwave_flux", (111, 105, 0, 4)),
    ("surface_net_upward_longwave_flux", (112, 105, 0, 4)),
    ("toa_net_upward_shortwave_flux", (113, 8, 0, 4)),
    ("toa_outgoing_longwave_flux", (114, 8, 0, 4)),
    ("net_upward_longwave_flux_in_air", (115, 105, 0, 4)),
    ("net_upward_shortwave_flux_in_air", (116, 105, 0, 4)),
    ("surface_downwelling_shortwave_flux_in_air", (117, 105, 0, 4)),
    ("surface_upward_latent_heat_flux", (121, 105, 0, 4)),
    ("surface_upward_sensible_heat_flux", (122, 105, 0, 4)),
    ("x_wind_gust", (162, 105, 10, 2)),
    ("y_wind_gust", (163, 105, 10, 2)),
];

/// Level unit → indicatorOfTypeOfLevel.
const LEVEL_UNITS: &[(&str, u16)] = &[("hPa", 100), ("metres", 105), ("kelvin", 20)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Grib1Id {
    pub iop: u16,
    pub itl: u16,
    pub lev: u32,
    pub tri: u16,
}

impl fmt::Display for Grib1Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.iop, self.itl, self.lev, self.tri)
    }
}

/// GRIB1 identifier of a CF standard name, with an optional `_at_<lvl>_<unit>`
/// suffix overriding the default level.
pub fn grib1_id(cf_name: &str) -> Option<Grib1Id> {
    let (base, level) = match cf_name.split_once(LEVEL_SEPARATOR) {
        Some((base, level)) => (base, Some(level)),
        None => (cf_name, None),
    };
    let &(_, (iop, itl, lev, tri)) = DEFAULT_GRIB1_IDS.iter().find(|(name, _)| *name == base)?;
    let mut id = Grib1Id { iop, itl, lev, tri };

    if let Some(level) = level {
        let (value, unit) = level.split_once('_')?;
        match LEVEL_UNITS.iter().find(|(name, _)| *name == unit) {
            Some(&(_, itl)) => {
                id.itl = itl;
                id.lev = value.parse().ok()?;
            }
            None if unit == "level" => {
                id.itl = if value == "sea" { 103 } else { 105 };
                id.lev = 0;
            }
            None => return None,
        }
    }
    Some(id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeraConvention {
    streams: Vec<String>,
}

impl Default for MeraConvention {
    fn default() -> Self {
        Self {
            streams: vec![DEFAULT_STREAM.to_string()],
        }
    }
}

impl MeraConvention {
    pub fn new(streams: Vec<String>) -> Self {
        if streams.is_empty() {
            return Self::default();
        }
        Self { streams }
    }

    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Naming pattern for a CF name, or `None` when the name is not in the
    /// MERA table.
    pub fn pattern_for(&self, variable: &VariableName) -> Option<ArchivePathPattern> {
        let id = grib1_id(variable.as_str())?;
        let mut candidates = Vec::with_capacity(self.streams.len() * 2);
        for stream in &self.streams {
            let fields = BTreeMap::from([
                ("iop".to_string(), id.iop.to_string()),
                ("itl".to_string(), id.itl.to_string()),
                ("lev".to_string(), id.lev.to_string()),
                ("tri".to_string(), id.tri.to_string()),
                ("stream".to_string(), stream.clone()),
            ]);
            let plain = PathTemplate::parse(MERA_TEMPLATE, &fields).ok()?;
            let compressed =
                PathTemplate::parse(&format!("{MERA_TEMPLATE}{COMPRESSED_SUFFIX}"), &fields)
                    .ok()?;
            candidates.push(plain);
            candidates.push(compressed);
        }
        ArchivePathPattern::new(Granularity::Monthly, candidates).ok()
    }
}
