//! In-process fan-out of price updates to live client connections.
//!
//! One task owns the subscriber set. Everything else talks to it through a
//! [`BroadcastHandle`], so the set is never touched from two places.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{PricingError, PricingResult};

pub type SubscriberId = u64;

const COMMAND_BUFFER: usize = 256;

#[derive(Debug)]
enum BroadcastCommand {
    Register {
        response: oneshot::Sender<(SubscriberId, mpsc::Receiver<String>)>,
    },
    Unregister {
        id: SubscriberId,
    },
    Broadcast {
        message: String,
    },
    Count {
        response: oneshot::Sender<usize>,
    },
    Shutdown,
}

pub struct BroadcastManager {
    commands: mpsc::Receiver<BroadcastCommand>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<String>>,
    next_id: SubscriberId,
    subscriber_buffer: usize,
}

impl BroadcastManager {
    /// `subscriber_buffer` bounds each client's delivery queue. A client
    /// whose queue is full when a message arrives is disconnected.
    pub fn new(subscriber_buffer: usize) -> (Self, BroadcastHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let manager = Self {
            commands: rx,
            subscribers: HashMap::new(),
            next_id: 1,
            subscriber_buffer: subscriber_buffer.max(1),
        };
        (manager, BroadcastHandle { commands: tx })
    }

    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                BroadcastCommand::Register { response } => {
                    let id = self.next_id;
                    self.next_id += 1;
                    let (tx, rx) = mpsc::channel(self.subscriber_buffer);
                    if response.send((id, rx)).is_ok() {
                        self.subscribers.insert(id, tx);
                        debug!("Subscriber {} registered ({} live)", id, self.subscribers.len());
                    }
                }
                BroadcastCommand::Unregister { id } => {
                    if self.subscribers.remove(&id).is_some() {
                        debug!("Subscriber {} unregistered ({} live)", id, self.subscribers.len());
                    }
                }
                BroadcastCommand::Broadcast { message } => self.deliver(message),
                BroadcastCommand::Count { response } => {
                    let _ = response.send(self.subscribers.len());
                }
                BroadcastCommand::Shutdown => break,
            }
        }

        self.commands.close();
        info!(
            "Broadcast manager stopped, closing {} subscriber(s)",
            self.subscribers.len()
        );
        self.subscribers.clear();
    }

    fn deliver(&mut self, message: String) {
        self.subscribers.retain(|id, queue| match queue.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Evicting stalled subscriber {}", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[derive(Clone)]
pub struct BroadcastHandle {
    commands: mpsc::Sender<BroadcastCommand>,
}

impl BroadcastHandle {
    pub async fn subscribe(&self) -> PricingResult<Subscription> {
        let (response, reply) = oneshot::channel();
        self.send(BroadcastCommand::Register { response }).await?;
        let (id, receiver) = reply.await.map_err(|_| PricingError::BroadcastClosed)?;
        Ok(Subscription {
            id,
            receiver,
            handle: self.clone(),
        })
    }

    pub async fn broadcast(&self, message: String) -> PricingResult<()> {
        self.send(BroadcastCommand::Broadcast { message }).await
    }

    pub async fn subscriber_count(&self) -> PricingResult<usize> {
        let (response, reply) = oneshot::channel();
        self.send(BroadcastCommand::Count { response }).await?;
        reply.await.map_err(|_| PricingError::BroadcastClosed)
    }

    /// Stops the manager. Every open subscription sees the end of its stream.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(BroadcastCommand::Shutdown).await;
    }

    async fn send(&self, command: BroadcastCommand) -> PricingResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PricingError::BroadcastClosed)
    }
}

/// A registered client's delivery queue. Dropping it unregisters the client.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<String>,
    handle: BroadcastHandle,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next message, or `None` once the manager has dropped this client.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let command = BroadcastCommand::Unregister { id: self.id };
        if let Err(mpsc::error::TrySendError::Full(command)) = self.handle.commands.try_send(command) {
            let commands = self.handle.commands.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = commands.send(command).await;
                });
            }
        }
    }
}
