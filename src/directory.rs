//! Route directory.
//!
//! A route's stops come from two lookups: the ordered stop-name list for the
//! route, then one station lookup per name for its coordinate. Stops whose
//! name has no exact directory match are left out of the list rather than
//! inserted without geometry, so sequence indices may have gaps.

use std::future::Future;

use futures_util::future::join_all;
use reqwest::StatusCode;

use crate::error::{Result, TrackerError};
use crate::models::{ApiEnvelope, BusAtStation, Coordinate, Station, Stop};

/// Read-through access to the backend station directory.
pub trait DirectoryClient: Send + Sync {
    /// Ordered stop names of a route.
    fn station_names(&self, route_id: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Stations matching a name search; may include partial matches.
    fn stations_by_name(&self, name: &str) -> impl Future<Output = Result<Vec<Station>>> + Send;

    /// Buses currently serving a station.
    fn buses_at_station(
        &self,
        station_id: &str,
    ) -> impl Future<Output = Result<Vec<BusAtStation>>> + Send;
}

#[derive(Clone)]
pub struct HttpDirectory {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDirectory {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token,
        }
    }

    async fn get_data<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        // The directory endpoints are readable without a credential.
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| TrackerError::Network(format!("Failed to fetch {}: {}", what, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(TrackerError::NotFound(what.to_string()));
        }

        if !response.status().is_success() {
            return Err(TrackerError::Network(format!(
                "{} request returned {}",
                what,
                response.status()
            )));
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| TrackerError::Parse(format!("Invalid {} response: {}", what, e)))?;

        Ok(envelope.data)
    }
}

impl DirectoryClient for HttpDirectory {
    async fn station_names(&self, route_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/bus/stationNames/{}", self.base_url, route_id);
        self.get_data(self.http.get(&url), "stop names").await
    }

    async fn stations_by_name(&self, name: &str) -> Result<Vec<Station>> {
        let url = format!("{}/station", self.base_url);
        let request = self.http.get(&url).query(&[("stationName", name)]);
        self.get_data(request, "station").await
    }

    async fn buses_at_station(&self, station_id: &str) -> Result<Vec<BusAtStation>> {
        let url = format!("{}/bus/stations/{}", self.base_url, station_id);
        self.get_data(self.http.get(&url), "station buses").await
    }
}

/// Resolves routes into ordered stop lists for one route screen.
pub struct RouteDirectory<D> {
    client: D,
}

impl<D: DirectoryClient> RouteDirectory<D> {
    pub fn new(client: D) -> Self {
        Self { client }
    }

    /// Load the ordered stops of a route with their coordinates.
    ///
    /// Fails only when the name list itself cannot be fetched.
    pub async fn load_route(&self, route_id: &str) -> Result<Vec<Stop>> {
        let names = self.client.station_names(route_id).await?;

        let lookups = names.iter().map(|name| self.resolve_stop_detail(name));
        let coordinates = join_all(lookups).await;

        let mut stops = Vec::with_capacity(names.len());
        for (index, (name, coordinate)) in names.iter().zip(coordinates).enumerate() {
            match coordinate {
                Ok(coordinate) => stops.push(Stop::new(index, name.clone(), coordinate)),
                Err(e) => {
                    tracing::warn!(route_id, stop = %name, index, error = %e, "Excluding stop from route");
                }
            }
        }

        tracing::info!(
            route_id,
            stops = stops.len(),
            excluded = names.len() - stops.len(),
            "Route loaded"
        );

        Ok(stops)
    }

    /// Coordinate of the first station whose name matches exactly.
    pub async fn resolve_stop_detail(&self, name: &str) -> Result<Coordinate> {
        self.resolve_station(name)
            .await?
            .location
            .map(Coordinate::from)
            .ok_or_else(|| TrackerError::NotFound(name.to_string()))
    }

    /// First station whose name matches exactly.
    pub async fn resolve_station(&self, name: &str) -> Result<Station> {
        self.client
            .stations_by_name(name)
            .await?
            .into_iter()
            .find(|station| station.name == name)
            .ok_or_else(|| TrackerError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::StationLocation;
    use std::collections::HashMap;

    /// In-memory directory keyed by exact name.
    #[derive(Clone, Default)]
    pub struct MockDirectory {
        pub routes: HashMap<String, Vec<String>>,
        pub stations: Vec<Station>,
        pub buses: HashMap<String, Vec<BusAtStation>>,
    }

    impl MockDirectory {
        pub fn with_route(route_id: &str, stops: &[(&str, Option<(f64, f64)>)]) -> Self {
            let mut directory = Self::default();
            directory.routes.insert(
                route_id.to_string(),
                stops.iter().map(|(name, _)| name.to_string()).collect(),
            );
            for (i, (name, location)) in stops.iter().enumerate() {
                if let Some((x, y)) = location {
                    directory.stations.push(Station {
                        id: format!("st-{}", i),
                        name: name.to_string(),
                        location: Some(StationLocation { x: *x, y: *y }),
                    });
                }
            }
            directory
        }
    }

    impl DirectoryClient for MockDirectory {
        async fn station_names(&self, route_id: &str) -> Result<Vec<String>> {
            self.routes
                .get(route_id)
                .cloned()
                .ok_or_else(|| TrackerError::NotFound(route_id.to_string()))
        }

        async fn stations_by_name(&self, name: &str) -> Result<Vec<Station>> {
            // Substring search, like the backend
            Ok(self
                .stations
                .iter()
                .filter(|s| s.name.contains(name))
                .cloned()
                .collect())
        }

        async fn buses_at_station(&self, station_id: &str) -> Result<Vec<BusAtStation>> {
            Ok(self.buses.get(station_id).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_load_route_keeps_order_and_indices() {
        let directory = RouteDirectory::new(MockDirectory::with_route(
            "401",
            &[
                ("울산대학교", Some((35.54, 129.25))),
                ("신복로터리", Some((35.55, 129.26))),
                ("공업탑", Some((35.53, 129.31))),
            ],
        ));

        let stops = directory.load_route("401").await.unwrap();
        let summary: Vec<_> = stops
            .iter()
            .map(|s| (s.sequence_index, s.name.as_str()))
            .collect();
        assert_eq!(summary, vec![(0, "울산대학교"), (1, "신복로터리"), (2, "공업탑")]);
        assert_eq!(stops[2].coordinate, Some(Coordinate::new(35.53, 129.31)));
        assert!(stops.iter().all(|s| !s.is_passed && !s.is_current));
    }

    #[tokio::test]
    async fn test_unresolved_stop_is_excluded_leaving_gap() {
        let directory = RouteDirectory::new(MockDirectory::with_route(
            "401",
            &[
                ("A", Some((35.0, 129.0))),
                ("B", None),
                ("C", Some((35.2, 129.2))),
            ],
        ));

        let stops = directory.load_route("401").await.unwrap();
        let indices: Vec<_> = stops.iter().map(|s| s.sequence_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_resolve_requires_exact_name() {
        let mut mock = MockDirectory::default();
        mock.stations.push(Station {
            id: "1".to_string(),
            name: "공업탑로터리".to_string(),
            location: Some(StationLocation { x: 35.5, y: 129.3 }),
        });
        let directory = RouteDirectory::new(mock);

        let result = directory.resolve_stop_detail("공업탑").await;
        assert!(matches!(result, Err(TrackerError::NotFound(name)) if name == "공업탑"));
    }

    #[tokio::test]
    async fn test_unknown_route_propagates_error() {
        let directory = RouteDirectory::new(MockDirectory::default());
        assert!(directory.load_route("999").await.is_err());
    }
}
