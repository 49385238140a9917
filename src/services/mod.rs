/// External geodata services the engine throttles independently
///
/// Each service owns exactly one rate limiter bucket for the lifetime of the
/// engine. Names are used as cache key prefixes and log fields.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    /// Address geocoder (forward and reverse lookups)
    Geocode,
    /// Map feature query service (POIs, amenities, boundaries)
    MapFeatures,
    /// Route computation service
    Routing,
}

impl ServiceId {
    pub const ALL: [ServiceId; 3] = [ServiceId::Geocode, ServiceId::MapFeatures, ServiceId::Routing];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Geocode => "geocode",
            ServiceId::MapFeatures => "map_features",
            ServiceId::Routing => "routing",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "geocode" | "geocoding" => Ok(ServiceId::Geocode),
            "map_features" | "features" | "overpass" => Ok(ServiceId::MapFeatures),
            "routing" | "route" => Ok(ServiceId::Routing),
            other => Err(format!("unknown service '{}'", other)),
        }
    }
}
