use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Coarse host location shared with guests through the host context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) timezone: Option<String>,
}

/// One geolocation lookup per process. Concurrent first callers share the
/// in-flight request; failures are cached as "no location" until restart.
pub(crate) struct LocationCache {
    url: Option<String>,
    cell: OnceCell<Option<UserLocation>>,
}

impl LocationCache {
    pub(crate) fn new(url: Option<String>) -> Self {
        Self {
            url,
            cell: OnceCell::new(),
        }
    }

    pub(crate) async fn get(&self) -> Option<UserLocation> {
        let url = self.url.clone()?;
        self.get_with(|| fetch(url)).await
    }

    pub(crate) async fn get_with<F, Fut>(&self, lookup: F) -> Option<UserLocation>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<UserLocation>>,
    {
        self.cell.get_or_init(lookup).await.clone()
    }
}

async fn fetch(url: String) -> Option<UserLocation> {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(error) => {
            warn!("failed to build geolocation client: {error}");
            return None;
        }
    };

    let body = match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => response.json::<Value>().await,
        Ok(response) => {
            warn!(status = response.status().as_u16(), "geolocation lookup failed");
            return None;
        }
        Err(error) => {
            warn!("geolocation lookup failed: {error}");
            return None;
        }
    };

    match body {
        Ok(value) => {
            let location = parse_location(&value);
            debug!(?location, "geolocation resolved");
            location
        }
        Err(error) => {
            warn!("invalid geolocation response: {error}");
            None
        }
    }
}

/// Accepts the common field spellings of public IP-geolocation services.
fn parse_location(value: &Value) -> Option<UserLocation> {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| value.get(*name).and_then(Value::as_str))
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string)
    };
    let location = UserLocation {
        city: field(&["city"]),
        region: field(&["region", "regionName", "region_name"]),
        country: field(&["country", "country_name", "countryCode", "country_code"]),
        timezone: field(&["timezone", "time_zone"]),
    };
    (location != UserLocation::default()).then_some(location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn concurrent_callers_share_one_lookup() {
        let cache = Arc::new(LocationCache::new(None));
        let lookups = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let lookups = lookups.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_with(|| async move {
                        lookups.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Some(UserLocation {
                            city: Some("Lisbon".to_string()),
                            ..UserLocation::default()
                        })
                    })
                    .await
            }));
        }

        for handle in handles {
            let location = handle.await.expect("join");
            assert_eq!(location.and_then(|l| l.city).as_deref(), Some("Lisbon"));
        }
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_cached_too() {
        let cache = LocationCache::new(None);
        assert_eq!(cache.get_with(|| async { None }).await, None);
        let later = cache
            .get_with(|| async {
                Some(UserLocation {
                    city: Some("Oslo".to_string()),
                    ..UserLocation::default()
                })
            })
            .await;
        assert_eq!(later, None);
    }

    #[tokio::test]
    async fn no_url_means_no_location() {
        assert_eq!(LocationCache::new(None).get().await, None);
    }

    #[test]
    fn parses_common_field_spellings() {
        let location = parse_location(&json!({
            "city": "Austin",
            "regionName": "Texas",
            "country_code": "US",
            "timezone": "America/Chicago"
        }))
        .expect("location");
        assert_eq!(location.region.as_deref(), Some("Texas"));
        assert_eq!(location.country.as_deref(), Some("US"));
        assert_eq!(parse_location(&json!({ "ip": "1.2.3.4" })), None);
    }
}
