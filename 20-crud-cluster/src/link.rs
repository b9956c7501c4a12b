//! Bidirectional message link between a worker and the supervisor.
//!
//! A link is a pair of halves: [`Link`] sends frames, [`Inbox`] receives
//! them. Frames from one sender arrive in the order they were sent. In
//! production the halves sit on top of a child's stdin/stdout pipes; tests
//! use [`memory_pair`] to wire two ends together without any process.

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::message::{read_frame, write_frame, ReplicationMessage};

/// Sending half. Cheap to clone; sends never block.
#[derive(Debug, Clone)]
pub struct Link {
    outbound: mpsc::UnboundedSender<String>,
}

/// Receiving half. Yields raw frames; decoding is left to the consumer so
/// that the supervisor can relay frames it never needs to understand.
#[derive(Debug)]
pub struct Inbox {
    frames: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Encodes and sends a message.
    pub fn send(&self, message: &ReplicationMessage) -> Result<(), LinkError> {
        self.send_frame(message.encode()?)
    }

    /// Sends an already-encoded frame as-is.
    pub fn send_frame(&self, frame: String) -> Result<(), LinkError> {
        self.outbound.send(frame).map_err(|_| LinkError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl Inbox {
    /// Next frame, or `None` once the other end has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    /// A frame that has already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }

    /// Calls `handler` for every inbound frame, in arrival order, on a
    /// background task. The task finishes when the link closes.
    pub fn subscribe<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(String) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(frame) = self.frames.recv().await {
                handler(frame);
            }
        })
    }
}

/// Runs a link over an async byte pipe.
///
/// Two tasks are spawned: one reads newline-delimited frames from `reader`,
/// the other drains queued frames into `writer`. Either side stops quietly
/// when its pipe closes.
pub fn open<R, W>(reader: R, writer: W) -> (Link, Inbox)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(err) = write_frame(&mut writer, &frame).await {
                debug!(error = ?err, "link writer closed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = ?err, "link reader failed");
                    break;
                }
            }
        }
    });

    (
        Link {
            outbound: outbound_tx,
        },
        Inbox { frames: inbound_rx },
    )
}

/// The worker's end of its link to the supervisor: stdin in, stdout out.
pub fn stdio() -> (Link, Inbox) {
    open(tokio::io::stdin(), tokio::io::stdout())
}

/// Two connected ends held in memory. Whatever one end sends, the other
/// end's inbox receives.
pub fn memory_pair() -> ((Link, Inbox), (Link, Inbox)) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        (Link { outbound: a_tx }, Inbox { frames: b_rx }),
        (Link { outbound: b_tx }, Inbox { frames: a_rx }),
    )
}
