// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Session styles.
//!
//! Each style wraps the control socket handed over by `SESSION CREATE` (or,
//! for subsessions, the dedicated connection opened after `SESSION ADD`)
//! together with its transport-specific resources. The datagram styles share
//! the forwarded-receive machinery defined here: one background task per
//! session reading the UDP socket and pushing decoded packets into a bounded
//! channel.

use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot, Mutex, RwLock},
};

use std::{sync::Arc, time::Duration};

use crate::error::Error;

pub mod datagram;
pub mod primary;
pub mod raw;
pub mod stream;

/// Logging target for the file.
const LOG_TARGET: &str = "shasta::session";

/// Depth of the packet channel between the receive task and the session.
const PACKET_CHANNEL_SIZE: usize = 16;

/// Largest datagram the bridge may forward.
const MAX_FORWARDED_SIZE: usize = 32768;

/// How long `close()` waits for the receive task to acknowledge the close
/// signal before giving up.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Run `future` under an optional deadline.
///
/// `None` and a zero duration both disable the deadline. On expiry the
/// future is dropped, which closes any control socket it was reading.
pub(crate) async fn with_deadline<T>(
    deadline: Option<Duration>,
    future: impl std::future::Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match deadline {
        Some(deadline) if !deadline.is_zero() => tokio::time::timeout(deadline, future)
            .await
            .map_err(|_| Error::Timeout)?,
        _ => future.await,
    }
}

/// Mutable reader state, read-locked by `recv`, write-locked by `close`.
struct ReaderState {
    /// Whether the reader has been closed.
    closed: bool,

    /// Close signal, consumed by the first `close()` call.
    ///
    /// Only the closer uses this end; only the receive task completes `done`.
    close_signal: Option<oneshot::Sender<()>>,

    /// Completed by the receive task right before it exits.
    done: Option<oneshot::Receiver<()>>,
}

/// Receiving half of a forwarded-datagram session.
///
/// Owns the background task reading the session's UDP socket. The packet and
/// error channels are never closed from this side; they are dropped with the
/// reader after the task has exited.
pub(crate) struct Reader<T> {
    /// Decoded packets, in bridge delivery order.
    packets: Mutex<mpsc::Receiver<T>>,

    /// Fatal error of the receive task, if any.
    errors: Mutex<mpsc::Receiver<Error>>,

    /// Reader state.
    state: RwLock<ReaderState>,
}

impl<T: Send + 'static> Reader<T> {
    /// Spawn the receive task for `socket` and return the reader coupled to
    /// it.
    ///
    /// `decode` turns one raw forwarded packet into a `T`; packets it
    /// rejects are dropped with a warning, everything else is pushed into
    /// the bounded packet channel.
    pub fn spawn(
        socket: Arc<UdpSocket>,
        decode: impl Fn(&[u8]) -> Result<T, Error> + Send + 'static,
    ) -> Self {
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_CHANNEL_SIZE);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(receive_loop(
            socket, decode, packet_tx, error_tx, close_rx, done_tx,
        ));

        Self {
            packets: Mutex::new(packet_rx),
            errors: Mutex::new(error_rx),
            state: RwLock::new(ReaderState {
                closed: false,
                close_signal: Some(close_tx),
                done: Some(done_rx),
            }),
        }
    }

    /// Receive the next packet.
    ///
    /// Packets already queued when the task died are drained first; after
    /// that the task's fatal error is returned, or [`Error::Closed`] when
    /// the reader was closed.
    pub async fn recv(&self) -> Result<T, Error> {
        if self.state.read().await.closed {
            return Err(Error::Closed);
        }

        let mut packets = self.packets.lock().await;

        match packets.recv().await {
            Some(packet) => Ok(packet),
            None => match self.errors.lock().await.try_recv() {
                Ok(error) => Err(error),
                Err(_) => Err(Error::Closed),
            },
        }
    }

    /// Close the reader.
    ///
    /// Idempotent; the second and any further call is a no-op. The receive
    /// task is given [`CLOSE_GRACE_PERIOD`] to acknowledge the close signal;
    /// if it does not, a warning is logged and close returns anyway.
    pub async fn close(&self) {
        let (close_signal, done) = {
            let mut state = self.state.write().await;

            if state.closed {
                return;
            }
            state.closed = true;

            (state.close_signal.take(), state.done.take())
        };

        if let Some(close_signal) = close_signal {
            let _ = close_signal.send(());
        }

        if let Some(done) = done {
            if tokio::time::timeout(CLOSE_GRACE_PERIOD, done).await.is_err() {
                tracing::warn!(
                    target: LOG_TARGET,
                    "receive task did not stop within the grace period",
                );
            }
        }
    }

    /// Whether the reader has been closed.
    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }
}

/// Receive loop of a forwarded-datagram session.
///
/// Exits on the close signal, on a socket error, or once the session side of
/// the packet channel is gone. Only this task completes `done`.
async fn receive_loop<T: Send + 'static>(
    socket: Arc<UdpSocket>,
    decode: impl Fn(&[u8]) -> Result<T, Error>,
    packet_tx: mpsc::Sender<T>,
    error_tx: mpsc::Sender<Error>,
    mut close_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) {
    let mut buffer = vec![0u8; MAX_FORWARDED_SIZE];

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                tracing::trace!(
                    target: LOG_TARGET,
                    "close signal received, stopping receive task",
                );
                break;
            }
            result = socket.recv(&mut buffer) => match result {
                Ok(nread) => match decode(&buffer[..nread]) {
                    Ok(packet) => {
                        if packet_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            target: LOG_TARGET,
                            %error,
                            "dropping malformed forwarded datagram",
                        );
                    }
                },
                Err(error) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        %error,
                        "udp socket read failed, stopping receive task",
                    );

                    let _ = error_tx.send(Error::Transport(error)).await;
                    break;
                }
            }
        }
    }

    let _ = done_tx.send(());
}
