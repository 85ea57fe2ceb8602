use serde::{Deserialize, Serialize};

/// SensorKind tags the raw on-disk format of a dataset and selects the
/// conversion pipeline which turns it into the streamable tiled layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    #[serde(rename = "IDX")]
    Idx,
    #[serde(rename = "TIFF")]
    Tiff,
    #[serde(rename = "TIFF_RGB")]
    TiffRgb,
    #[serde(rename = "4D_NEXUS")]
    FourDNexus,
    #[serde(rename = "HDF5")]
    Hdf5,
    #[serde(rename = "NETCDF")]
    NetCdf,
    #[serde(rename = "RGB_DRONE")]
    RgbDrone,
    #[serde(rename = "MAPIR_DRONE")]
    MapirDrone,
    #[serde(rename = "OTHER")]
    Other,
}

impl SensorKind {
    pub const ALL: &'static [SensorKind] = &[
        SensorKind::Idx,
        SensorKind::Tiff,
        SensorKind::TiffRgb,
        SensorKind::FourDNexus,
        SensorKind::Hdf5,
        SensorKind::NetCdf,
        SensorKind::RgbDrone,
        SensorKind::MapirDrone,
        SensorKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Idx => "IDX",
            SensorKind::Tiff => "TIFF",
            SensorKind::TiffRgb => "TIFF_RGB",
            SensorKind::FourDNexus => "4D_NEXUS",
            SensorKind::Hdf5 => "HDF5",
            SensorKind::NetCdf => "NETCDF",
            SensorKind::RgbDrone => "RGB_DRONE",
            SensorKind::MapirDrone => "MAPIR_DRONE",
            SensorKind::Other => "OTHER",
        }
    }

    /// The 4D NeXus converter is the only one which takes a JSON parameter
    /// blob; every other kind is invoked with input and output paths alone.
    pub fn wants_extra_params(&self) -> bool {
        matches!(self, SensorKind::FourDNexus)
    }
}

impl std::str::FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("invalid sensor kind {s:?}"))
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
