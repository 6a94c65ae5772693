use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::config::{GEOCODER_URL, REMOTE_API_TOKEN};
use super::{Coordinates, Geocoder, RemoteError, ResolvedAddress, status_error};
use crate::http::build_client;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(from: Coordinates, to: Coordinates) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lng = (to.lng - from.lng).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from.lat.to_radians().cos() * to.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[derive(Debug, Clone)]
pub struct HttpGeocoder {
    base_url: String,
    token: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct DistanceResponse {
    km: f64,
}

impl HttpGeocoder {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            base_url: GEOCODER_URL.clone()?,
            token: REMOTE_API_TOKEN.clone(),
            http: build_client(),
        })
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, RemoteError> {
        let mut request = self
            .http
            .get(format!("{}/{path}", self.base_url))
            .query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|err| RemoteError::Request(err.to_string()))
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn address_to_coordinates(
        &self,
        query: &str,
    ) -> Result<Option<Coordinates>, RemoteError> {
        let response = self.get("geocode", &[("q", query.to_string())]).await?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT
        ) {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response.status(), "geocode"));
        }
        response
            .json::<Option<Coordinates>>()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))
    }

    async fn coordinates_to_address(
        &self,
        lat: f64,
        lng: f64,
    ) -> Result<ResolvedAddress, RemoteError> {
        let response = self
            .get("reverse", &[("lat", lat.to_string()), ("lng", lng.to_string())])
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "reverse geocode"));
        }
        response
            .json()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))
    }

    async fn distance_between(
        &self,
        from: Coordinates,
        to: Coordinates,
    ) -> Result<f64, RemoteError> {
        let response = self
            .get(
                "distance",
                &[
                    ("lat1", from.lat.to_string()),
                    ("lng1", from.lng.to_string()),
                    ("lat2", to.lat.to_string()),
                    ("lng2", to.lng.to_string()),
                ],
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "distance"));
        }
        let body: DistanceResponse = response
            .json()
            .await
            .map_err(|err| RemoteError::Deserialize(err.to_string()))?;
        Ok(body.km)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_distance() {
        let mumbai = Coordinates {
            lat: 19.0760,
            lng: 72.8777,
        };
        let pune = Coordinates {
            lat: 18.5204,
            lng: 73.8567,
        };
        let km = haversine_km(mumbai, pune);
        assert!((118.0..122.0).contains(&km), "got {km}");
        assert!(haversine_km(pune, pune).abs() < 1e-9);
    }
}
