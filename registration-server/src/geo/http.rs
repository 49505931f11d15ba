use super::{GeoError, GeoLocator};
use crate::models::participant::GeoInfo;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const USER_AGENT: &str = concat!("registration-server/", env!("CARGO_PKG_VERSION"));

/// ip-api.com for client addresses and Nominatim for reverse geocoding.
#[derive(Clone)]
pub struct HttpGeoLocator {
    http: reqwest::Client,
    ip_api_url: String,
    reverse_url: String,
}

#[derive(Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    city: Option<String>,
    #[serde(default, rename = "regionName")]
    region_name: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

#[derive(Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<Address>,
}

#[derive(Deserialize)]
struct Address {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    town: Option<String>,
    #[serde(default)]
    village: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

impl HttpGeoLocator {
    pub fn new(
        ip_api_url: impl Into<String>,
        reverse_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GeoError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            ip_api_url: ip_api_url.into().trim_end_matches('/').to_string(),
            reverse_url: reverse_url.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GeoError> {
        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(GeoError::Status(resp.status().as_u16()));
        }
        resp.json().await.map_err(|e| GeoError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl GeoLocator for HttpGeoLocator {
    async fn locate_ip(&self, ip: &str) -> Result<Option<GeoInfo>, GeoError> {
        let url = format!("{}/{}", self.ip_api_url, ip);
        let body: IpApiResponse = self.get_json(self.http.get(url)).await?;
        if body.status != "success" {
            return Ok(None);
        }
        Ok(Some(GeoInfo {
            city: body.city,
            region: body.region_name,
            country: body.country,
            ..Default::default()
        }))
    }

    async fn reverse(&self, lat: f64, lng: f64) -> Result<Option<GeoInfo>, GeoError> {
        let request = self.http.get(&self.reverse_url).query(&[
            ("format", "json".to_string()),
            ("lat", lat.to_string()),
            ("lon", lng.to_string()),
            ("zoom", "18".to_string()),
            ("addressdetails", "1".to_string()),
        ]);
        let body: ReverseResponse = self.get_json(request).await?;
        Ok(body.address.map(|a| {
            let city = [a.city, a.town, a.village]
                .into_iter()
                .flatten()
                .find(|c| !c.is_empty());
            GeoInfo {
                city,
                region: a.state,
                country: a.country,
                ..Default::default()
            }
        }))
    }
}
