//! Session context: the station the user picked on the route screen.
//!
//! The arrival board reads it, the route screen writes it. It is passed to
//! both explicitly; there is no process-wide store.

use tokio::sync::watch;

use crate::models::Station;

#[derive(Debug)]
pub struct SessionContext {
    selected: watch::Sender<Option<Station>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            selected: watch::Sender::new(None),
        }
    }

    /// Select a station. Re-selecting the same station does not notify readers.
    pub fn select(&self, station: Station) -> bool {
        let changed = self.selected.send_if_modified(|current| {
            if current.as_ref() == Some(&station) {
                return false;
            }
            *current = Some(station.clone());
            true
        });
        if changed {
            tracing::info!(station_id = %station.id, station = %station.name, "Station selected");
        }
        changed
    }

    pub fn clear(&self) -> bool {
        self.selected.send_if_modified(|current| current.take().is_some())
    }

    pub fn current(&self) -> Option<Station> {
        self.selected.borrow().clone()
    }

    /// Readers are notified on every selection change.
    pub fn subscribe(&self) -> watch::Receiver<Option<Station>> {
        self.selected.subscribe()
    }
}
