//! In-memory packet pipe, for tests and same-process peers.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::{PacketConn, TransportError};

/// One end of an in-memory pipe created by [`pipe`].
pub struct PipeConn {
    tx: UnboundedSender<Vec<u8>>,
    rx: Mutex<UnboundedReceiver<Vec<u8>>>,
}

/// Creates a connected pair of in-memory packet pipes.
pub fn pipe() -> (PipeConn, PipeConn) {
    let (a_tx, b_rx) = unbounded_channel();
    let (b_tx, a_rx) = unbounded_channel();
    (
        PipeConn {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        PipeConn {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}

impl PacketConn for PipeConn {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.rx.lock().await.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_arrive_in_order() {
        let (a, b) = pipe();
        a.send(&[1]).await.unwrap();
        a.send(&[2, 2]).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(vec![1]));
        assert_eq!(b.recv().await.unwrap(), Some(vec![2, 2]));
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (a, b) = pipe();
        drop(a);
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(b.send(&[1]).await.is_err());
    }
}
