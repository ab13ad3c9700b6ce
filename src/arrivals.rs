//! Arrival board for the selected station.
//!
//! Lists the buses serving the station with their time to reach it. Rows are
//! rebuilt on every refresh (selection change or poll tick) and count down
//! locally once per second in between.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::directory::DirectoryClient;
use crate::error::Result;
use crate::eta::{CacheKey, EtaClient, EtaOracle, format_duration};
use crate::models::{Arrival, NamedCoordinate, Station};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct ArrivalBoard<D, O> {
    directory: D,
    eta: EtaClient<O>,
}

impl<D, O> ArrivalBoard<D, O>
where
    D: DirectoryClient + 'static,
    O: EtaOracle + 'static,
{
    pub fn new(directory: D, oracle: O, eta_ttl: Duration) -> Self {
        Self {
            directory,
            eta: EtaClient::new(oracle, CacheKey::Origin, eta_ttl),
        }
    }

    /// Fetch the buses serving `station` and their ETA to it.
    ///
    /// A bus without a location, or whose ETA could not be resolved, shows 0.
    pub async fn refresh(&self, station: &Station) -> Result<Vec<Arrival>> {
        let buses = self.directory.buses_at_station(&station.id).await?;

        let destination = station
            .location
            .map(|location| NamedCoordinate::new(station.name.clone(), location.into()));

        let queries = buses.iter().filter_map(|bus| {
            let destination = destination.as_ref()?;
            let origin = NamedCoordinate::new(bus.bus_number.clone(), bus.location?.into());
            Some(async move { self.eta.eta(&origin, destination).await })
        });

        let replies: HashMap<String, u32> = join_all(queries)
            .await
            .into_iter()
            .flatten()
            .map(|estimate| (estimate.name, estimate.duration_seconds))
            .collect();

        let rows: Vec<Arrival> = buses
            .into_iter()
            .map(|bus| {
                let remaining_seconds = replies.get(&bus.bus_number).copied().unwrap_or(0);
                Arrival {
                    duration_message: format_duration(remaining_seconds),
                    bus_number: bus.bus_number,
                    occupied_seats: bus.occupied_seats,
                    remaining_seconds,
                }
            })
            .collect();

        tracing::debug!(
            station_id = %station.id,
            buses = rows.len(),
            resolved = replies.len(),
            "Arrival board refreshed"
        );

        Ok(rows)
    }

    /// Run the board for whatever station `session` holds.
    pub fn spawn(
        self: Arc<Self>,
        session: watch::Receiver<Option<Station>>,
        poll_interval: Duration,
    ) -> ArrivalHandle {
        let (rows_tx, rows_rx) = watch::channel(Vec::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(self.run(session, poll_interval, rows_tx, shutdown_rx));

        ArrivalHandle {
            rows: rows_rx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        self: Arc<Self>,
        mut session: watch::Receiver<Option<Station>>,
        poll_interval: Duration,
        rows: watch::Sender<Vec<Arrival>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut station = session.borrow_and_update().clone();

        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = session.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    station = session.borrow_and_update().clone();
                    // Cached answers were computed against the previous station
                    self.eta.clear_cache();
                    rows.send_replace(Vec::new());
                    self.publish(station.as_ref(), &rows).await;
                }
                _ = poll.tick() => self.publish(station.as_ref(), &rows).await,
                _ = tick.tick() => {
                    rows.send_if_modified(|rows| tick_arrivals(rows));
                }
            }
        }

        tracing::info!("Arrival board stopped");
    }

    async fn publish(&self, station: Option<&Station>, rows: &watch::Sender<Vec<Arrival>>) {
        let Some(station) = station else {
            return;
        };

        match self.refresh(station).await {
            Ok(fresh) => {
                rows.send_replace(fresh);
            }
            Err(e) => {
                tracing::warn!(station_id = %station.id, error = %e, "Failed to refresh arrival board");
            }
        }
    }
}

/// Count every row down by one second. Returns whether anything changed.
pub fn tick_arrivals(rows: &mut [Arrival]) -> bool {
    let mut changed = false;
    for row in rows.iter_mut().filter(|row| row.remaining_seconds > 0) {
        row.remaining_seconds -= 1;
        row.duration_message = format_duration(row.remaining_seconds);
        changed = true;
    }
    changed
}

pub struct ArrivalHandle {
    rows: watch::Receiver<Vec<Arrival>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ArrivalHandle {
    pub fn rows(&self) -> Vec<Arrival> {
        self.rows.borrow().clone()
    }

    /// False once the board task has exited.
    pub fn is_running(&self) -> bool {
        self.rows.has_changed().is_ok()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Arrival>> {
        self.rows.clone()
    }

    pub async fn shutdown(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Arrival board task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::MockDirectory;
    use crate::eta::tests::MockOracle;
    use crate::models::{BusAtStation, StationLocation};
    use crate::session::SessionContext;

    fn station() -> Station {
        Station {
            id: "st-7".to_string(),
            name: "공업탑".to_string(),
            location: Some(StationLocation { x: 35.53, y: 129.31 }),
        }
    }

    fn bus(number: &str, seats: u32, location: Option<(f64, f64)>) -> BusAtStation {
        BusAtStation {
            id: format!("bus-{}", number),
            bus_number: number.to_string(),
            occupied_seats: seats,
            location: location.map(|(x, y)| StationLocation { x, y }),
        }
    }

    fn directory() -> MockDirectory {
        let mut directory = MockDirectory::default();
        directory.buses.insert(
            "st-7".to_string(),
            vec![
                bus("401", 12, Some((35.50, 129.25))),
                bus("133", 3, Some((35.52, 129.28))),
                bus("1401", 30, None),
            ],
        );
        directory
    }

    fn arrival(bus_number: &str, occupied_seats: u32, remaining_seconds: u32) -> Arrival {
        Arrival {
            bus_number: bus_number.to_string(),
            occupied_seats,
            remaining_seconds,
            duration_message: format_duration(remaining_seconds),
        }
    }

    #[tokio::test]
    async fn test_refresh_builds_rows_per_bus() {
        let oracle = MockOracle::default();
        oracle.answer("401", "6분 10초");
        oracle.answer("133", "2분 0초");
        let board = ArrivalBoard::new(directory(), oracle.clone(), Duration::from_secs(30));

        let rows = board.refresh(&station()).await.unwrap();

        assert_eq!(
            rows,
            vec![arrival("401", 12, 370), arrival("133", 3, 120), arrival("1401", 30, 0)]
        );
        assert_eq!(rows[0].duration_message, "6분 10초");
        // The bus without a location is not queried
        assert_eq!(oracle.calls(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_bus_shows_zero() {
        let oracle = MockOracle::default();
        oracle.answer("401", "6분 10초");
        oracle.fail("133", 503);
        let board = ArrivalBoard::new(directory(), oracle, Duration::from_secs(30));

        let rows = board.refresh(&station()).await.unwrap();
        assert_eq!(rows[1], arrival("133", 3, 0));
    }

    #[tokio::test]
    async fn test_station_without_location_queries_nothing() {
        let oracle = MockOracle::default();
        oracle.answer("401", "6분 10초");
        let board = ArrivalBoard::new(directory(), oracle.clone(), Duration::from_secs(30));

        let mut unlocated = station();
        unlocated.location = None;
        let rows = board.refresh(&unlocated).await.unwrap();

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.remaining_seconds == 0));
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn test_tick_counts_down_and_floors_at_zero() {
        let mut rows = vec![arrival("401", 12, 61), arrival("133", 3, 0)];

        assert!(tick_arrivals(&mut rows));
        assert_eq!(rows[0].remaining_seconds, 60);
        assert_eq!(rows[0].duration_message, "1분 0초");
        assert_eq!(rows[1].remaining_seconds, 0);

        let mut idle = vec![arrival("133", 3, 0)];
        assert!(!tick_arrivals(&mut idle));
    }

    #[tokio::test]
    async fn test_board_follows_session() {
        let oracle = MockOracle::default();
        oracle.answer("401", "6분 10초");
        oracle.answer("133", "2분 0초");
        let board = Arc::new(ArrivalBoard::new(directory(), oracle, Duration::from_secs(30)));
        let session = SessionContext::new();

        let handle = board.spawn(session.subscribe(), Duration::from_secs(30));
        let mut rows = handle.subscribe();
        assert!(handle.rows().is_empty());

        session.select(station());
        tokio::time::timeout(Duration::from_secs(5), rows.wait_for(|rows| rows.len() == 3))
            .await
            .expect("board refreshed in time")
            .unwrap();
        assert_eq!(handle.rows()[2], arrival("1401", 30, 0));

        session.clear();
        tokio::time::timeout(Duration::from_secs(5), rows.wait_for(|rows| rows.is_empty()))
            .await
            .expect("board cleared in time")
            .unwrap();

        handle.shutdown().await;
    }
}
