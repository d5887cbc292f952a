use anyhow::Result;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::Trip;

const CACHE_DECIMALS: i32 = 4;

#[derive(Deserialize, Debug)]
struct ReverseResponse {
    display_name: Option<String>,
}

/// Reverse geocoding against a Nominatim-compatible endpoint. Answers,
/// including "no address", are cached per rounded coordinate.
pub struct Geocoder {
    client: Client,
    base_url: String,
    cache: HashMap<(i64, i64), Option<String>>,
}

pub fn cache_key(latitude: f64, longitude: f64) -> (i64, i64) {
    let factor = 10f64.powi(CACHE_DECIMALS);
    (
        (latitude * factor).round() as i64,
        (longitude * factor).round() as i64,
    )
}

impl Geocoder {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Geocoder {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: HashMap::new(),
        })
    }

    pub async fn reverse(&mut self, latitude: f64, longitude: f64) -> Option<String> {
        let key = cache_key(latitude, longitude);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }

        match self.fetch(latitude, longitude).await {
            Ok(address) => {
                self.cache.insert(key, address.clone());
                address
            }
            // Not cached: the lookup may work next time.
            Err(e) => {
                warn!(error = %e, latitude, longitude, "Reverse geocoding failed");
                None
            }
        }
    }

    async fn fetch(&self, latitude: f64, longitude: f64) -> Result<Option<String>> {
        let url = format!("{}/reverse", self.base_url);
        let response: ReverseResponse = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(latitude, longitude, address = ?response.display_name, "Reverse geocoded");
        Ok(response.display_name)
    }

    /// Attach start and end addresses to a trip that has none yet.
    pub async fn annotate(&mut self, trip: &mut Trip) {
        if trip.start_address.is_none() {
            if let Some(p) = trip.first_position() {
                let (lat, lon) = (p.latitude, p.longitude);
                trip.start_address = self.reverse(lat, lon).await;
            }
        }
        if trip.end_address.is_none() {
            if let Some(p) = trip.last_position() {
                let (lat, lon) = (p.latitude, p.longitude);
                trip.end_address = self.reverse(lat, lon).await;
            }
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
