use async_trait::async_trait;
use log::debug;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use url::Url;

use super::{ Coordinates, GeoError, Geocoder };

pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";

/// OpenStreetMap Nominatim search client.
pub struct NominatimGeocoder {
    http: HttpClient,
    search_url: Url,
}

#[derive(Deserialize, Debug)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self, GeoError> {
        let search_url = Url::parse(&format!("{}/search", base_url.trim_end_matches('/')))?;
        let http = HttpClient::builder().user_agent(user_agent.to_string()).build()?;
        Ok(Self { http, search_url })
    }

    fn query_url(&self, place: &str) -> Url {
        let mut url = self.search_url.clone();
        url.query_pairs_mut()
            .append_pair("q", place)
            .append_pair("format", "json")
            .append_pair("limit", "1");
        url
    }
}

fn first_coordinates(places: &[NominatimPlace]) -> Result<Option<Coordinates>, GeoError> {
    let Some(place) = places.first() else {
        return Ok(None);
    };
    let latitude = place.lat
        .parse::<f64>()
        .map_err(|_| GeoError::BadCoordinate(place.lat.clone()))?;
    let longitude = place.lon
        .parse::<f64>()
        .map_err(|_| GeoError::BadCoordinate(place.lon.clone()))?;
    if let Some(name) = &place.display_name {
        debug!("Nominatim matched '{}'", name);
    }
    Ok(Some(Coordinates { latitude, longitude }))
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, place: &str) -> Result<Option<Coordinates>, GeoError> {
        let places = self.http
            .get(self.query_url(place))
            .send().await?
            .error_for_status()?
            .json::<Vec<NominatimPlace>>().await?;
        first_coordinates(&places)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_url_is_encoded() {
        let geocoder = NominatimGeocoder::new("https://nominatim.example.org/", "mapchat-test").unwrap();
        let url = geocoder.query_url("Taipei 101");
        assert_eq!(url.path(), "/search");
        assert_eq!(url.query(), Some("q=Taipei+101&format=json&limit=1"));
    }

    #[test]
    fn first_hit_is_parsed() {
        let places: Vec<NominatimPlace> = serde_json
            ::from_str(
                r#"[{"lat":"22.6203348","lon":"120.3120375","display_name":"Kaohsiung, Taiwan"},
                    {"lat":"0","lon":"0"}]"#
            )
            .unwrap();
        let coords = first_coordinates(&places).unwrap().unwrap();
        assert!((coords.latitude - 22.6203348).abs() < 1e-9);
        assert!((coords.longitude - 120.3120375).abs() < 1e-9);
    }

    #[test]
    fn empty_result_is_no_match() {
        assert!(first_coordinates(&[]).unwrap().is_none());
    }

    #[test]
    fn garbage_coordinate_is_an_error() {
        let places = vec![NominatimPlace {
            lat: "north".into(),
            lon: "1.0".into(),
            display_name: None,
        }];
        assert!(matches!(first_coordinates(&places), Err(GeoError::BadCoordinate(_))));
    }
}
