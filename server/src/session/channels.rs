//! The per-session bus: typed queues wiring the WebSocket bridge to the
//! upstream connector.
//!
//! Queues toward the client (`input`, `output`) are capacity-1 mpsc channels,
//! so a stalled consumer back-pressures its producer end-to-end. The two
//! client-to-upstream legs (`stdin`, `window`) are unbounded: they stand in
//! for the stdin pipe's elastic write half, and keeping the bridge driver's
//! sends on them non-blocking is what rules out a cycle where the driver
//! waits on the connector while the connector waits on the driver's output
//! drain. The bundle is allocated exactly once per connect (and once per
//! monitor attach); the sender half lives on the [`super::Session`], the
//! receiver half is distributed at wiring time — the connector takes the ends
//! it consumes, the rest is parked for the bridge.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::errors::ApiError;
use crate::session::ServerResp;

/// How long an admin-close waits for a stuck session to take the closer name
/// before dropping it.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Resolves the connector handshake: `Ok` with the relay/tunnel response, or
/// the typed failure. One per connection attempt.
pub type HandshakeTx = oneshot::Sender<Result<ServerResp, ApiError>>;
pub type HandshakeRx = oneshot::Receiver<Result<ServerResp, ApiError>>;

/// Sender half of the bus. Cloneable; held by the session for admin close and
/// by whichever tasks produce on each queue.
#[derive(Clone, Debug)]
pub struct SessionBus {
    /// Client frames (WebSocket reader → driver or guacd writer).
    pub input: mpsc::Sender<Vec<u8>>,
    /// Upstream frames (connector → driver).
    pub output: mpsc::Sender<Vec<u8>>,
    /// `"w,h[,dpi]"` resize messages (bridge → connector).
    pub window: mpsc::UnboundedSender<String>,
    /// Username of the closing admin (admin close → driver).
    pub close: mpsc::Sender<String>,
    /// Post-handshake fatal connector error (connector → driver).
    pub err: mpsc::Sender<ApiError>,
    /// SSH stdin pipe (driver → connector → relay).
    pub stdin: mpsc::UnboundedSender<Vec<u8>>,
    /// One-shot shutdown signal: cancelled when the bridge goes away.
    pub away: CancellationToken,
}

impl SessionBus {
    /// Signal the connector side that the bridge is gone.
    pub fn close_away(&self) {
        self.away.cancel();
    }

    /// Bounded hand-off of the closer name; a stuck driver drops it after one
    /// second so admin close can never deadlock.
    pub async fn send_close(&self, closer: &str) -> bool {
        timeout(CLOSE_SEND_TIMEOUT, self.close.send(closer.to_string()))
            .await
            .map(|sent| sent.is_ok())
            .unwrap_or(false)
    }

    /// Deliver one upstream frame, abandoning the attempt if the session is
    /// torn down first (a primary client that never binds must not wedge the
    /// connector). Returns false when the producer should stop.
    pub async fn send_output(&self, frame: Vec<u8>) -> bool {
        tokio::select! {
            sent = self.output.send(frame) => sent.is_ok(),
            () = self.away.cancelled() => false,
        }
    }
}

/// Receiver ends consumed by the SSH bridge driver.
#[derive(Debug)]
pub struct SshBridgeRx {
    pub input: mpsc::Receiver<Vec<u8>>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub close: mpsc::Receiver<String>,
    pub err: mpsc::Receiver<ApiError>,
}

/// Receiver ends consumed by the graphical bridge driver. Client input is
/// consumed by the guacd connector instead, so it is absent here.
#[derive(Debug)]
pub struct GuacdBridgeRx {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub close: mpsc::Receiver<String>,
    pub err: mpsc::Receiver<ApiError>,
}

/// The bridge-side receivers parked on a session between the connect POST and
/// the one-time WebSocket attach.
#[derive(Debug)]
pub enum BridgeRx {
    Ssh(SshBridgeRx),
    Guacd(GuacdBridgeRx),
}

/// All receiver ends, as built; the wiring code moves fields out per
/// protocol.
pub struct BusRx {
    pub input: mpsc::Receiver<Vec<u8>>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub window: mpsc::UnboundedReceiver<String>,
    pub close: mpsc::Receiver<String>,
    pub err: mpsc::Receiver<ApiError>,
    pub stdin: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Allocate a fresh bus.
pub fn session_bus() -> (SessionBus, BusRx) {
    let (input_tx, input_rx) = mpsc::channel(1);
    let (output_tx, output_rx) = mpsc::channel(1);
    let (window_tx, window_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(1);
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    (
        SessionBus {
            input: input_tx,
            output: output_tx,
            window: window_tx,
            close: close_tx,
            err: err_tx,
            stdin: stdin_tx,
            away: CancellationToken::new(),
        },
        BusRx {
            input: input_rx,
            output: output_rx,
            window: window_rx,
            close: close_rx,
            err: err_rx,
            stdin: stdin_rx,
        },
    )
}

/// Allocate the handshake result slot.
pub fn handshake_slot() -> (HandshakeTx, HandshakeRx) {
    oneshot::channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_hand_off_reaches_a_live_consumer() {
        let (bus, mut rx) = session_bus();
        let consumer = tokio::spawn(async move { rx.close.recv().await });
        assert!(bus.send_close("admin").await);
        assert_eq!(consumer.await.unwrap().as_deref(), Some("admin"));
    }

    #[tokio::test(start_paused = true)]
    async fn close_hand_off_drops_on_a_stuck_consumer() {
        let (bus, rx) = session_bus();
        // Saturate the capacity-1 queue so the next send must wait.
        bus.close.send("first".to_string()).await.unwrap();
        assert!(!bus.send_close("second").await);
        drop(rx);
    }

    #[tokio::test]
    async fn away_is_sticky_for_late_observers() {
        let (bus, _rx) = session_bus();
        bus.close_away();
        bus.away.cancelled().await;
        // A clone observed after cancellation still sees it.
        bus.away.clone().cancelled().await;
    }

    #[tokio::test]
    async fn output_send_abandons_on_teardown() {
        let (bus, rx) = session_bus();
        // Fill the queue so the next send must wait, then tear down.
        assert!(bus.send_output(b"first".to_vec()).await);
        let teardown = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                bus.close_away();
            })
        };
        assert!(!bus.send_output(b"second".to_vec()).await);
        teardown.await.unwrap();
        drop(rx);
    }

    #[tokio::test]
    async fn queues_back_pressure_at_capacity_one() {
        let (bus, mut rx) = session_bus();
        bus.output.send(b"a".to_vec()).await.unwrap();
        assert!(bus.output.try_send(b"b".to_vec()).is_err());
        assert_eq!(rx.output.recv().await.unwrap(), b"a".to_vec());
        assert!(bus.output.try_send(b"b".to_vec()).is_ok());
    }
}
