//! In-process channel transport.
//!
//! Backs embedded clients and the integration tests: both ends of a
//! connection live in the same process and exchange frames over a pair of
//! unbounded channels. Dropping either end reads as a clean peer close on
//! the other.

use async_trait::async_trait;
use tokio::sync::mpsc;

use syncd_core::ports::transport::{Transport, TransportError};

/// One end of an in-process framed duplex.
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Create a connected pair of transports.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pair() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send_frame(b"hello".to_vec()).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn close_reads_as_end_of_stream() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.close().await;
        assert_eq!(b.recv_frame().await.unwrap(), None);
        assert!(matches!(
            b.send_frame(vec![]).await,
            Ok(()) // a's receiver still exists until a is dropped
        ));
        drop(a);
        assert!(matches!(
            b.send_frame(vec![]).await,
            Err(TransportError::Closed)
        ));
    }
}
