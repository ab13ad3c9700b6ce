//! Vehicle position stream.
//!
//! Frames arrive over a WebSocket as newline-separated CSV records
//! `vehicleId,longitude,latitude,occupancy`. [`decode_frame`] turns one frame
//! into the positions it carries; records with unusable coordinates are
//! dropped without failing the frame.
//!
//! [`PositionSource`] is the seam the refresh orchestrator subscribes
//! through. The WebSocket implementation sends the subscribe handshake on
//! open and forwards decoded frames over a channel. It never reconnects on
//! its own: when the connection closes the subscription ends and the
//! orchestrator decides when to subscribe again.

use std::future::Future;
use std::time::Duration;

use csv::StringRecord;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Result, TrackerError};
use crate::models::{Coordinate, VehiclePosition};

/// Decoded frames buffered between the socket reader and the orchestrator.
const FRAME_BUFFER: usize = 16;

/// Decode one stream frame. An empty result means no usable positions.
pub fn decode_frame(frame: &str) -> Vec<VehiclePosition> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(frame.as_bytes());

    reader
        .records()
        .filter_map(|record| match record {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::trace!(error = %e, "Skipping unreadable stream record");
                None
            }
        })
        .filter_map(|record| match parse_record(&record) {
            Ok(position) => Some(position),
            Err(e) => {
                tracing::trace!(error = %e, "Dropping stream record");
                None
            }
        })
        .collect()
}

fn parse_record(record: &StringRecord) -> Result<VehiclePosition> {
    if record.len() < 3 {
        return Err(TrackerError::MalformedTelemetry(format!(
            "expected at least 3 fields, got {}",
            record.len()
        )));
    }

    let vehicle_id = record[0].trim().to_string();
    let lon = parse_axis(&record[1])?;
    let lat = parse_axis(&record[2])?;
    let occupancy = record.get(3).and_then(|v| v.trim().parse().ok());

    Ok(VehiclePosition {
        vehicle_id,
        coordinate: Coordinate::new(lat, lon),
        occupancy,
    })
}

fn parse_axis(value: &str) -> Result<f64> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(TrackerError::MalformedTelemetry(format!(
            "coordinate {:?} is not a finite number",
            value
        ))),
    }
}

pub fn subscribe_message(topic: &str) -> String {
    serde_json::json!({
        "type": "SUBSCRIBE",
        "destination": topic,
    })
    .to_string()
}

/// An open position subscription.
///
/// Dropping it closes the underlying connection.
pub struct PositionSubscription {
    frames: mpsc::Receiver<Vec<VehiclePosition>>,
    _close: Option<oneshot::Sender<()>>,
}

impl PositionSubscription {
    #[cfg(test)]
    pub fn new(frames: mpsc::Receiver<Vec<VehiclePosition>>) -> Self {
        Self {
            frames,
            _close: None,
        }
    }

    fn with_close(frames: mpsc::Receiver<Vec<VehiclePosition>>, close: oneshot::Sender<()>) -> Self {
        Self {
            frames,
            _close: Some(close),
        }
    }

    /// Next decoded frame, or `None` once the stream has closed.
    pub async fn next_frame(&mut self) -> Option<Vec<VehiclePosition>> {
        self.frames.recv().await
    }
}

pub trait PositionSource: Send + Sync {
    fn subscribe(&self) -> impl Future<Output = Result<PositionSubscription>> + Send;
}

pub struct WebSocketFeed {
    url: String,
    topic: String,
    /// Upper bound on opening the connection.
    connect_timeout: Duration,
}

impl WebSocketFeed {
    pub fn new(url: impl Into<String>, topic: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            topic: topic.into(),
            connect_timeout,
        }
    }
}

impl PositionSource for WebSocketFeed {
    async fn subscribe(&self) -> Result<PositionSubscription> {
        let (socket, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    TrackerError::Stream(format!(
                        "Connecting to {} timed out after {}s",
                        self.url,
                        self.connect_timeout.as_secs()
                    ))
                })??;
        let (mut write, mut read) = socket.split();

        write
            .send(Message::Text(subscribe_message(&self.topic)))
            .await?;

        tracing::info!(url = %self.url, topic = %self.topic, "Position stream connected");

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = write.send(Message::Close(None)).await;
                        tracing::debug!("Position stream closed locally");
                        break;
                    }
                    message = read.next() => {
                        let text = match message {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                Ok(text) => text,
                                Err(_) => {
                                    tracing::trace!("Ignoring non-UTF-8 stream frame");
                                    continue;
                                }
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::warn!("Position stream closed by server");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "Position stream failed");
                                break;
                            }
                        };

                        let positions = decode_frame(&text);
                        if frame_tx.send(positions).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(PositionSubscription::with_close(frame_rx, close_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_frame_trims_vehicle_id() {
        let positions = decode_frame(" 401 ,129.25,35.54,12\n133,129.31,35.53,3");
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].vehicle_id, "401");
        assert_eq!(positions[0].coordinate, Coordinate::new(35.54, 129.25));
        assert_eq!(positions[0].occupancy, Some(12));
        assert_eq!(positions[1].vehicle_id, "133");
    }

    #[test]
    fn test_decode_drops_non_numeric_coordinates() {
        let frame = "401,abc,35.54,1\n402,129.25,,1\n403,129.25,35.54,1\n404,NaN,35.5,1\n405,inf,35.5,1";
        let positions = decode_frame(frame);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].vehicle_id, "403");
    }

    #[test]
    fn test_decode_output_is_bounded_and_finite() {
        let frame = "1,1.0,2.0,0\n2,x,2.0,0\n\n3,1.5\n4,-1e3,3.25,\n5,7,8,seats";
        let record_count = frame.lines().count();
        let positions = decode_frame(frame);

        assert!(positions.len() <= record_count);
        assert!(positions.iter().all(|p| p.coordinate.lat.is_finite() && p.coordinate.lon.is_finite()));
        let ids: Vec<_> = positions.iter().map(|p| p.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4", "5"]);
    }

    #[test]
    fn test_unparsable_occupancy_keeps_record() {
        let positions = decode_frame("401,129.25,35.54,full");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].occupancy, None);
    }

    #[test]
    fn test_empty_frame_yields_no_positions() {
        assert!(decode_frame("").is_empty());
        assert!(decode_frame("\n\n").is_empty());
    }

    #[test]
    fn test_reencode_is_lossless_apart_from_trimming() {
        let frame = "  401,129.2512345,35.5412345,12\n133,-0.5,51.25,0";
        let reencoded: Vec<String> = decode_frame(frame).iter().map(|p| p.to_string()).collect();
        assert_eq!(
            reencoded,
            vec!["401,129.2512345,35.5412345,12", "133,-0.5,51.25,0"]
        );

        let again = decode_frame(&reencoded.join("\n"));
        assert_eq!(again, decode_frame(frame));
    }

    #[test]
    fn test_subscribe_message_shape() {
        let message: serde_json::Value =
            serde_json::from_str(&subscribe_message("/topic/bus-locations")).unwrap();
        assert_eq!(message["type"], "SUBSCRIBE");
        assert_eq!(message["destination"], "/topic/bus-locations");
    }

    #[tokio::test]
    async fn test_subscription_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut subscription = PositionSubscription::new(rx);

        tx.send(decode_frame("401,129.25,35.54,1")).await.unwrap();
        drop(tx);

        assert_eq!(subscription.next_frame().await.map(|f| f.len()), Some(1));
        assert!(subscription.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_timeout() {
        // Accepts TCP but never answers the WebSocket handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let feed = WebSocketFeed::new(
            format!("ws://{}/bus-location", addr),
            "/topic/bus-locations",
            Duration::from_millis(200),
        );
        let result = tokio::time::timeout(Duration::from_secs(3), feed.subscribe())
            .await
            .expect("subscribe returns within its own timeout");
        assert!(matches!(result, Err(TrackerError::Stream(message)) if message.contains("timed out")));
    }
}
