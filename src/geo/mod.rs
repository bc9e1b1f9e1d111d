pub mod nominatim;

use async_trait::async_trait;
use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use std::collections::HashMap;
use std::sync::{ Arc, Mutex };
use thiserror::Error;

pub use nominatim::NominatimGeocoder;

/// Coordinate used when a place cannot be geocoded.
pub const DEFAULT_FALLBACK: Coordinates = Coordinates {
    latitude: 39.94961,
    longitude: -75.150282,
};

pub const DEFAULT_ZOOM: u8 = 16;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geocoding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geocoder returned an unreadable coordinate: {0}")]
    BadCoordinate(String),
    #[error("invalid geocoder URL: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the provider answered but had no match.
    async fn geocode(&self, place: &str) -> Result<Option<Coordinates>, GeoError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub place: String,
    pub coordinates: Coordinates,
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub position: Coordinates,
    pub popup: String,
    pub tooltip: String,
}

/// A map centred on one place with a single marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapView {
    pub center: Coordinates,
    pub zoom: u8,
    pub marker: Marker,
}

impl MapView {
    pub fn new(place: &str, position: Coordinates, zoom: u8) -> Self {
        Self {
            center: position,
            zoom,
            marker: Marker {
                position,
                popup: place.to_string(),
                tooltip: place.to_string(),
            },
        }
    }

    pub fn osm_url(&self) -> String {
        format!(
            "https://www.openstreetmap.org/?mlat={lat:.6}&mlon={lon:.6}#map={zoom}/{lat:.6}/{lon:.6}",
            lat = self.marker.position.latitude,
            lon = self.marker.position.longitude,
            zoom = self.zoom
        )
    }
}

/// Geocodes place names with a fallback coordinate and an unbounded memo.
pub struct MapResolver {
    geocoder: Arc<dyn Geocoder>,
    fallback: Coordinates,
    zoom: u8,
    cache: Mutex<HashMap<String, Resolution>>,
}

impl MapResolver {
    pub fn new(geocoder: Arc<dyn Geocoder>, fallback: Coordinates, zoom: u8) -> Self {
        Self {
            geocoder,
            fallback,
            zoom,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn fallback(&self) -> Coordinates {
        self.fallback
    }

    pub async fn resolve(&self, place: &str) -> Resolution {
        if let Some(hit) = self.cached(place) {
            return hit;
        }

        let resolution = match self.geocoder.geocode(place).await {
            Ok(Some(coordinates)) => {
                info!(
                    "Geocoded '{}' to ({}, {})",
                    place,
                    coordinates.latitude,
                    coordinates.longitude
                );
                Resolution { place: place.to_string(), coordinates, found: true }
            }
            Ok(None) => {
                warn!("No geocoding match for '{}', using fallback coordinate", place);
                self.fallback_for(place)
            }
            Err(e) => {
                warn!("Geocoding '{}' failed: {}. Using fallback coordinate", place, e);
                self.fallback_for(place)
            }
        };

        // A concurrent resolve of the same place may have landed first; keep it.
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.entry(place.to_string()).or_insert(resolution).clone()
    }

    pub async fn map_for(&self, place: &str) -> (MapView, Resolution) {
        let resolution = self.resolve(place).await;
        (MapView::new(place, resolution.coordinates, self.zoom), resolution)
    }

    pub fn cached_places(&self) -> usize {
        self.cache
            .lock()
            .map(|c| c.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    fn cached(&self, place: &str) -> Option<Resolution> {
        let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.get(place).cloned()
    }

    fn fallback_for(&self, place: &str) -> Resolution {
        Resolution {
            place: place.to_string(),
            coordinates: self.fallback,
            found: false,
        }
    }
}
