//! Duplex transport between the coordinator and the worker.
//!
//! [`SignalingChannel::new`] returns two connected endpoints. Each endpoint can
//! send to and receive from its peer; closing either one closes the channel for
//! both, and a closed channel is never reopened. The worker learns its endpoint
//! through a one-shot bootstrap port carrying an [`InitMessage`].

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::message::Message;

pub struct SignalingChannel;

impl SignalingChannel {
    /// Create a connected pair `(port1, port2)`.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Endpoint, Endpoint) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let port1 = Endpoint {
            sender: EndpointSender {
                tx: tx2,
                closed: closed.clone(),
            },
            receiver: EndpointReceiver {
                rx: rx1,
                closed: closed.clone(),
            },
        };
        let port2 = Endpoint {
            sender: EndpointSender { tx: tx1, closed: closed.clone() },
            receiver: EndpointReceiver { rx: rx2, closed },
        };
        (port1, port2)
    }
}

/// One side of a [`SignalingChannel`].
pub struct Endpoint {
    sender: EndpointSender,
    receiver: EndpointReceiver,
}

impl Endpoint {
    pub fn split(self) -> (EndpointSender, EndpointReceiver) {
        (self.sender, self.receiver)
    }

    pub fn sender(&self) -> EndpointSender {
        self.sender.clone()
    }

    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.sender.send(message)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn close(&self) {
        self.sender.close()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Sending half of an [`Endpoint`]; cheap to clone.
#[derive(Clone)]
pub struct EndpointSender {
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

impl EndpointSender {
    /// Post `message` to the peer. Never blocks; fails once the channel is closed.
    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }

    pub fn close(&self) {
        self.closed.cancel()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Receiving half of an [`Endpoint`].
pub struct EndpointReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
}

impl EndpointReceiver {
    /// Next message from the peer, in send order. `None` once the channel is closed
    /// or the peer is gone; the latter also closes the channel.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;

            _ = self.closed.cancelled() => None,
            message = self.rx.recv() => {
                if message.is_none() {
                    self.closed.cancel();
                }
                message
            }
        }
    }

    pub fn close(&self) {
        self.closed.cancel()
    }
}

/// The one-time handshake message handing the worker its endpoint.
pub struct InitMessage {
    pub signaling_channel: Endpoint,
}

/// Coordinator side of the bootstrap port.
pub struct ParentSender(oneshot::Sender<InitMessage>);

impl ParentSender {
    /// Hand the message over; ownership of the endpoint moves to the worker.
    pub fn post(self, message: InitMessage) -> Result<(), ChannelError> {
        self.0.send(message).map_err(|_| ChannelError::Closed)
    }
}

/// Worker side of the bootstrap port.
pub struct ParentPort(oneshot::Receiver<InitMessage>);

impl ParentPort {
    /// `None` if the coordinator dropped its side without posting.
    pub async fn recv(self) -> Option<InitMessage> {
        self.0.await.ok()
    }
}

pub fn parent_port() -> (ParentSender, ParentPort) {
    let (tx, rx) = oneshot::channel();
    (ParentSender(tx), ParentPort(rx))
}
