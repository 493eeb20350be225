//! Reverse geocoding through the Google Geocoding API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::http::{get_json_with_retry, BackoffPolicy, HttpClientConfig, HttpError};

pub const GOOGLE_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Only the best few candidates are consulted; later results are usually
/// coarser (city, state, country only).
const RESULTS_CONSULTED: usize = 3;

#[derive(Debug, Error)]
pub enum GeocodingError {
    #[error("geocoding request failed: {0}")]
    Http(#[from] HttpError),
    #[error("geocoding API returned status {status}: {message}")]
    Api { status: String, message: String },
    #[error("invalid coordinates ({lat}, {lng})")]
    InvalidCoordinates { lat: f64, lng: f64 },
}

/// Both values finite and non-zero, within the WGS84 ranges.
pub fn are_coordinates_valid(lat: f64, lng: f64) -> bool {
    lat.is_finite()
        && lng.is_finite()
        && lat != 0.0
        && lng != 0.0
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressComponent {
    #[serde(default)]
    pub long_name: String,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    #[serde(default)]
    pub address_components: Vec<AddressComponent>,
    #[serde(default)]
    pub formatted_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResponse {
    #[serde(default)]
    pub results: Vec<GeocodeResult>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Structured address from geocoding. `None` means no consulted result had a
/// component of that type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeocodedAddress {
    pub street: Option<String>,
    pub number: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub real_city: Option<String>,
    pub state: Option<String>,
    pub state_code: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

fn fill(slot: &mut Option<String>, value: &str) {
    if slot.is_none() && !value.is_empty() {
        *slot = Some(value.to_string());
    }
}

/// Walks the first three results and every component in each; the first
/// component of a given type wins.
pub fn parse_google_address(results: &[GeocodeResult]) -> GeocodedAddress {
    let mut out = GeocodedAddress::default();
    for result in results.iter().take(RESULTS_CONSULTED) {
        for component in &result.address_components {
            let long = component.long_name.as_str();
            let short = component.short_name.as_str();
            for kind in &component.types {
                match kind.as_str() {
                    "route" => fill(&mut out.street, short),
                    "street_number" => fill(&mut out.number, short),
                    "sublocality_level_1" => fill(&mut out.neighborhood, short),
                    "administrative_area_level_2" => {
                        fill(&mut out.city, long);
                        fill(&mut out.real_city, long);
                    }
                    "administrative_area_level_1" => {
                        fill(&mut out.state, long);
                        fill(&mut out.state_code, short);
                    }
                    "postal_code" => fill(&mut out.postal_code, long),
                    "country" => fill(&mut out.country, long),
                    _ => {}
                }
            }
        }
    }
    out
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse_geocode(&self, lat: f64, lng: f64) -> Result<GeocodedAddress, GeocodingError>;
}

#[derive(Debug, Clone)]
pub struct GoogleGeocoder {
    api_key: String,
    endpoint: String,
    http: reqwest::Client,
    backoff: BackoffPolicy,
}

impl GoogleGeocoder {
    pub fn new(api_key: impl Into<String>, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            endpoint: GOOGLE_GEOCODE_URL.to_string(),
            http: http.build_client()?,
            backoff: http.backoff,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn reverse_geocode(&self, lat: f64, lng: f64) -> Result<GeocodedAddress, GeocodingError> {
        if !are_coordinates_valid(lat, lng) {
            return Err(GeocodingError::InvalidCoordinates { lat, lng });
        }
        let query = [
            ("latlng", format!("{lat},{lng}")),
            ("key", self.api_key.clone()),
            ("language", "pt-BR".to_string()),
        ];
        let response: GeocodeResponse =
            get_json_with_retry(&self.http, &self.backoff, &self.endpoint, &query).await?;

        if response.status != "OK" && response.status != "ZERO_RESULTS" {
            return Err(GeocodingError::Api {
                status: response.status,
                message: response.error_message.unwrap_or_default(),
            });
        }
        debug!(results = response.results.len(), status = %response.status, "geocoding response");
        let address = parse_google_address(&response.results);
        info!(
            city = address.city.as_deref().unwrap_or(""),
            neighborhood = address.neighborhood.as_deref().unwrap_or(""),
            "reverse geocoded"
        );
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    fn component(long: &str, short: &str, kind: &str) -> AddressComponent {
        AddressComponent {
            long_name: long.into(),
            short_name: short.into(),
            types: vec![kind.into(), "political".into()],
        }
    }

    #[test]
    fn coordinate_bounds_are_inclusive_and_zero_is_invalid() {
        assert!(are_coordinates_valid(90.0, 180.0));
        assert!(are_coordinates_valid(-90.0, -180.0));
        assert!(!are_coordinates_valid(90.1, 10.0));
        assert!(!are_coordinates_valid(10.0, -180.1));
        assert!(!are_coordinates_valid(0.0, -46.6));
        assert!(!are_coordinates_valid(-23.5, 0.0));
        assert!(!are_coordinates_valid(f64::NAN, 1.0));
        assert!(!are_coordinates_valid(1.0, f64::INFINITY));
    }

    #[test]
    fn first_match_wins_across_the_first_three_results() {
        let results = vec![
            GeocodeResult {
                address_components: vec![
                    component("Rua Pernambuco", "R. Pernambuco", "route"),
                    component("1000", "1000", "street_number"),
                    component("Belo Horizonte", "Belo Horizonte", "administrative_area_level_2"),
                ],
                ..Default::default()
            },
            GeocodeResult {
                address_components: vec![
                    component("Funcionários", "Funcionários", "sublocality_level_1"),
                    component("Contagem", "Contagem", "administrative_area_level_2"),
                    component("Minas Gerais", "MG", "administrative_area_level_1"),
                ],
                ..Default::default()
            },
            GeocodeResult {
                address_components: vec![component("Brasil", "BR", "country")],
                ..Default::default()
            },
            GeocodeResult {
                address_components: vec![component("30130-151", "30130-151", "postal_code")],
                ..Default::default()
            },
        ];

        let address = parse_google_address(&results);
        assert_eq!(address.street.as_deref(), Some("R. Pernambuco"));
        assert_eq!(address.number.as_deref(), Some("1000"));
        assert_eq!(address.neighborhood.as_deref(), Some("Funcionários"));
        assert_eq!(address.city.as_deref(), Some("Belo Horizonte"));
        assert_eq!(address.real_city.as_deref(), Some("Belo Horizonte"));
        assert_eq!(address.state.as_deref(), Some("Minas Gerais"));
        assert_eq!(address.state_code.as_deref(), Some("MG"));
        assert_eq!(address.country.as_deref(), Some("Brasil"));
        assert_eq!(address.postal_code, None);
    }

    async fn geocode_stub(State(calls): State<Arc<AtomicUsize>>) -> Response {
        match calls.fetch_add(1, Ordering::SeqCst) {
            0 => StatusCode::SERVICE_UNAVAILABLE.into_response(),
            1 => Json(json!({
                "status": "OK",
                "results": [{
                    "formatted_address": "R. Pernambuco, 1000",
                    "address_components": [
                        {
                            "long_name": "Rua Pernambuco",
                            "short_name": "R. Pernambuco",
                            "types": ["route"]
                        }
                    ]
                }]
            }))
            .into_response(),
            _ => Json(json!({
                "status": "REQUEST_DENIED",
                "error_message": "bad key",
                "results": []
            }))
            .into_response(),
        }
    }

    #[tokio::test]
    async fn retries_unavailable_and_rejects_non_ok_status() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/geocode", get(geocode_stub))
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = HttpClientConfig::default();
        config.backoff.base_delay = std::time::Duration::from_millis(1);
        let geocoder = GoogleGeocoder::new("key", &config)
            .unwrap()
            .with_endpoint(format!("http://{addr}/geocode"));

        let address = geocoder.reverse_geocode(-19.93, -43.93).await.unwrap();
        assert_eq!(address.street.as_deref(), Some("R. Pernambuco"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = geocoder.reverse_geocode(-19.93, -43.93).await.unwrap_err();
        assert!(matches!(
            err,
            GeocodingError::Api { ref status, .. } if status == "REQUEST_DENIED"
        ));

        let err = geocoder.reverse_geocode(0.0, -43.93).await.unwrap_err();
        assert!(matches!(err, GeocodingError::InvalidCoordinates { .. }));
    }
}
