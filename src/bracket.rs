//! Bracket location.
//!
//! The vehicle is placed between the two stops with the smallest ETA from
//! its position, not the two geometrically closest ones: on loops and
//! backtracking roads a passed stop can be nearer in a straight line. The
//! pair is then ordered by sequence index. Nothing forces the two stops to be
//! adjacent in the route; when ETA and route order disagree the bracket can
//! skip stops in between, and that pair is reported as is.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::error::{Result, TrackerError};
use crate::eta::{EtaClient, EtaOracle};
use crate::models::{Bracket, NamedCoordinate, Stop, VehiclePosition};
use crate::progress::visual_progress;

/// ETA of one stop in a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEta {
    pub sequence_index: usize,
    pub remaining_seconds: u32,
}

/// Pick the bracket from the ETAs resolved in one cycle.
pub fn select_bracket(etas: &[StopEta]) -> Result<Bracket> {
    if etas.len() < 2 {
        return Err(TrackerError::InsufficientBracketData {
            resolved: etas.len(),
        });
    }

    // Stable sort: equal ETAs keep route order
    let mut by_time = etas.to_vec();
    by_time.sort_by_key(|eta| eta.remaining_seconds);

    let mut pair = [by_time[0], by_time[1]];
    pair.sort_by_key(|eta| eta.sequence_index);
    let [current, next] = pair;

    Ok(Bracket {
        current_index: current.sequence_index,
        next_index: next.sequence_index,
        remaining_seconds: next.remaining_seconds,
        visual_progress: visual_progress(current.remaining_seconds, next.remaining_seconds),
    })
}

/// Copy of `stops` marked against `bracket`, carrying this cycle's ETAs.
///
/// Stops before the current index are passed; stops without an ETA this
/// cycle have no remaining time.
pub fn annotate_stops(stops: &[Stop], etas: &[StopEta], bracket: &Bracket) -> Vec<Stop> {
    let by_index: HashMap<usize, u32> = etas
        .iter()
        .map(|eta| (eta.sequence_index, eta.remaining_seconds))
        .collect();

    stops
        .iter()
        .map(|stop| Stop {
            is_passed: stop.sequence_index < bracket.current_index,
            is_current: stop.sequence_index == bracket.current_index,
            remaining_seconds: by_index.get(&stop.sequence_index).copied(),
            ..stop.clone()
        })
        .collect()
}

/// Outcome of one refresh cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    pub etas: Vec<StopEta>,
    pub bracket: Result<Bracket>,
    /// Every resolved ETA came from the cache; nothing new was learned.
    pub from_cache: bool,
}

pub struct BracketLocator<O> {
    eta: Arc<EtaClient<O>>,
}

impl<O: EtaOracle> BracketLocator<O> {
    pub fn new(eta: Arc<EtaClient<O>>) -> Self {
        Self { eta }
    }

    /// Query every stop with a coordinate and select the bracket.
    pub async fn locate(&self, vehicle: &VehiclePosition, stops: &[Stop]) -> CycleOutcome {
        let origin = vehicle.named();

        let queries = stops.iter().filter_map(|stop| {
            let coordinate = stop.coordinate?;
            let destination = NamedCoordinate::new(stop.name.clone(), coordinate);
            let origin = &origin;
            let index = stop.sequence_index;
            Some(async move {
                self.eta
                    .eta(origin, &destination)
                    .await
                    .map(|estimate| {
                        let eta = StopEta {
                            sequence_index: index,
                            remaining_seconds: estimate.duration_seconds,
                        };
                        (eta, estimate.from_cache)
                    })
            })
        });

        let resolved: Vec<(StopEta, bool)> =
            join_all(queries).await.into_iter().flatten().collect();
        let from_cache = !resolved.is_empty() && resolved.iter().all(|(_, cached)| *cached);
        let etas: Vec<StopEta> = resolved.into_iter().map(|(eta, _)| eta).collect();
        let bracket = select_bracket(&etas);

        tracing::debug!(
            vehicle = %vehicle.vehicle_id,
            queried = stops.len(),
            resolved = etas.len(),
            cached = self.eta.cached_len(),
            from_cache,
            bracket = ?bracket.as_ref().ok(),
            "Bracket cycle finished"
        );

        CycleOutcome {
            etas,
            bracket,
            from_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eta::CacheKey;
    use crate::eta::tests::MockOracle;
    use crate::models::Coordinate;
    use std::time::Duration;

    fn eta(sequence_index: usize, remaining_seconds: u32) -> StopEta {
        StopEta {
            sequence_index,
            remaining_seconds,
        }
    }

    fn route() -> Vec<Stop> {
        (0..4)
            .map(|i| Stop::new(i, format!("S{}", i), Coordinate::new(35.0 + i as f64 * 0.01, 129.0)))
            .collect()
    }

    #[test]
    fn test_two_smallest_then_sorted_by_index() {
        let bracket = select_bracket(&[eta(2, 40), eta(5, 10), eta(7, 90)]).unwrap();
        assert_eq!(bracket.current_index, 2);
        assert_eq!(bracket.next_index, 5);
        assert_eq!(bracket.remaining_seconds, 10);
        assert_eq!(bracket.visual_progress, visual_progress(40, 10));
    }

    #[test]
    fn test_remaining_is_next_stop_not_minimum() {
        let bracket = select_bracket(&[eta(3, 5), eta(4, 60), eta(9, 600)]).unwrap();
        assert_eq!((bracket.current_index, bracket.next_index), (3, 4));
        assert_eq!(bracket.remaining_seconds, 60);
    }

    #[test]
    fn test_non_adjacent_pair_is_kept() {
        let bracket = select_bracket(&[eta(1, 30), eta(2, 70), eta(3, 20)]).unwrap();
        assert_eq!((bracket.current_index, bracket.next_index), (1, 3));
    }

    #[test]
    fn test_fewer_than_two_is_insufficient() {
        assert!(matches!(
            select_bracket(&[eta(1, 30)]),
            Err(TrackerError::InsufficientBracketData { resolved: 1 })
        ));
        assert!(matches!(
            select_bracket(&[]),
            Err(TrackerError::InsufficientBracketData { resolved: 0 })
        ));
    }

    #[test]
    fn test_equal_etas_keep_route_order() {
        let bracket = select_bracket(&[eta(4, 10), eta(6, 10), eta(1, 10)]).unwrap();
        assert_eq!((bracket.current_index, bracket.next_index), (4, 6));
    }

    #[test]
    fn test_annotate_marks_passed_and_current() {
        let stops = route();
        let etas = [eta(1, 30), eta(2, 45)];
        let bracket = select_bracket(&etas).unwrap();
        let annotated = annotate_stops(&stops, &etas, &bracket);

        let flags: Vec<_> = annotated
            .iter()
            .map(|s| (s.is_passed, s.is_current, s.remaining_seconds))
            .collect();
        assert_eq!(
            flags,
            vec![
                (true, false, None),
                (false, true, Some(30)),
                (false, false, Some(45)),
                (false, false, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_locate_queries_stops_with_coordinates() {
        let oracle = MockOracle::default();
        oracle.answer("S0", "9분 0초");
        oracle.answer("S1", "1분 0초");
        oracle.answer("S2", "2분 30초");
        oracle.answer("S3", "6분 0초");
        let client = Arc::new(EtaClient::new(oracle.clone(), CacheKey::Destination, Duration::from_secs(30)));
        let locator = BracketLocator::new(client);

        let mut stops = route();
        stops[3].coordinate = None;

        let vehicle = VehiclePosition {
            vehicle_id: "401".to_string(),
            coordinate: Coordinate::new(34.0, 128.0),
            occupancy: None,
        };
        let outcome = locator.locate(&vehicle, &stops).await;

        assert_eq!(oracle.calls(), 3);
        assert_eq!(outcome.etas.len(), 3);
        assert!(!outcome.from_cache);
        let bracket = outcome.bracket.unwrap();
        assert_eq!((bracket.current_index, bracket.next_index), (1, 2));
        assert_eq!(bracket.remaining_seconds, 150);
    }

    #[tokio::test]
    async fn test_locate_with_single_answer_has_no_bracket() {
        let oracle = MockOracle::default();
        oracle.answer("S2", "2분 30초");
        let client = Arc::new(EtaClient::new(oracle, CacheKey::Destination, Duration::from_secs(30)));
        let locator = BracketLocator::new(client);

        let vehicle = VehiclePosition {
            vehicle_id: "401".to_string(),
            coordinate: Coordinate::new(34.0, 128.0),
            occupancy: None,
        };
        let outcome = locator.locate(&vehicle, &route()).await;

        assert_eq!(outcome.etas, vec![eta(2, 150)]);
        assert!(matches!(
            outcome.bracket,
            Err(TrackerError::InsufficientBracketData { resolved: 1 })
        ));
    }

    #[test]
    fn test_annotate_matches_etas_by_sequence_index() {
        let mut stops = route();
        stops.remove(1);
        // Unordered ETAs, one for a stop no longer in the list
        let etas = [eta(3, 90), eta(1, 5), eta(2, 40), eta(0, 70)];
        let bracket = Bracket {
            current_index: 2,
            next_index: 3,
            remaining_seconds: 90,
            visual_progress: visual_progress(40, 90),
        };
        let annotated = annotate_stops(&stops, &etas, &bracket);

        let remaining: Vec<_> = annotated
            .iter()
            .map(|s| (s.sequence_index, s.remaining_seconds))
            .collect();
        assert_eq!(remaining, vec![(0, Some(70)), (2, Some(40)), (3, Some(90))]);
    }

    #[tokio::test]
    async fn test_repeat_locate_at_same_position_is_cached() {
        let oracle = MockOracle::default();
        oracle.answer("S1", "1분 0초");
        oracle.answer("S2", "2분 30초");
        let client = Arc::new(EtaClient::new(oracle.clone(), CacheKey::Destination, Duration::from_secs(30)));
        let locator = BracketLocator::new(client);

        let vehicle = VehiclePosition {
            vehicle_id: "401".to_string(),
            coordinate: Coordinate::new(34.0, 128.0),
            occupancy: None,
        };
        let first = locator.locate(&vehicle, &route()).await;
        let calls = oracle.calls();
        let second = locator.locate(&vehicle, &route()).await;

        assert!(!first.from_cache);
        assert!(second.from_cache);
        // Only the stops that failed are asked again
        assert_eq!(oracle.calls(), calls + 2);
    }
}
