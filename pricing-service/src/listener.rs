//! Long-running consumers of the database change channels.
//!
//! A sale reprices the product it touched; a price adjustment is turned into
//! a [`PriceUpdate`] and pushed to every live client. Neither loop exits on
//! error.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use futures::StreamExt;
use shared::db::DbPool;
use shared::schema::products;
use shared::{fallback_product_name, PriceAdjustmentEvent, PriceUpdate, SaleEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::adjuster::PriceAdjuster;
use crate::broadcast::BroadcastHandle;

const NOTIFICATION_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// A subscription to one change channel.
pub trait ChangeFeed: Send {
    fn recv(&mut self) -> impl Future<Output = Result<Notification>> + Send;

    /// Checks that the underlying subscription is still alive.
    fn probe(&mut self) -> impl Future<Output = Result<()>> + Send;
}

pub trait NotificationHandler: Send + Sync {
    fn handle(&self, payload: &str) -> impl Future<Output = Result<()>> + Send;
}

pub trait ProductDirectory: Send + Sync {
    fn product_name(&self, product_id: i32) -> impl Future<Output = Result<String>> + Send;
}

/// Exponential reconnect delay with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

struct LiveConnection {
    client: Client,
    notifications: mpsc::Receiver<Notification>,
    driver: JoinHandle<()>,
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// `LISTEN`s on one channel over a dedicated connection, reconnecting with
/// [`Backoff`] whenever the connection is lost.
pub struct PgChangeFeed {
    database_url: String,
    channel: &'static str,
    live: Option<LiveConnection>,
    backoff: Backoff,
    // Survives a cancelled `recv`, so an idle probe cannot cut the delay short.
    retry_at: Option<Instant>,
}

impl PgChangeFeed {
    pub fn new(database_url: impl Into<String>, channel: &'static str) -> Self {
        Self {
            database_url: database_url.into(),
            channel,
            live: None,
            backoff: Backoff::default(),
            retry_at: None,
        }
    }

    async fn connect(&self) -> Result<LiveConnection> {
        let (client, mut connection) = tokio_postgres::connect(&self.database_url, NoTls)
            .await
            .with_context(|| format!("connecting listener for '{}'", self.channel))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let channel = self.channel;
        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let notification = Notification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        };
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => debug!("Notice on '{}': {}", channel, notice),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Listener connection for '{}' failed: {}", channel, e);
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", self.channel))
            .await
            .with_context(|| format!("subscribing to '{}'", self.channel))?;

        Ok(LiveConnection {
            client,
            notifications: rx,
            driver,
        })
    }
}

impl ChangeFeed for PgChangeFeed {
    async fn recv(&mut self) -> Result<Notification> {
        if self.live.is_none() {
            if let Some(at) = self.retry_at {
                tokio::time::sleep_until(at).await;
            }
            match self.connect().await {
                Ok(live) => {
                    info!("Listening on '{}'", self.channel);
                    self.retry_at = None;
                    self.live = Some(live);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    self.retry_at = Some(Instant::now() + delay);
                    return Err(e.context(format!("retrying in {:?}", delay)));
                }
            }
        }

        let received = match self.live.as_mut() {
            Some(live) => live.notifications.recv().await,
            None => None,
        };
        match received {
            Some(notification) => {
                self.backoff.reset();
                Ok(notification)
            }
            None => {
                self.live = None;
                Err(anyhow!("connection for '{}' closed", self.channel))
            }
        }
    }

    async fn probe(&mut self) -> Result<()> {
        let Some(live) = self.live.as_ref() else {
            return Ok(());
        };
        let probed = live.client.simple_query("SELECT 1").await;
        if let Err(e) = probed {
            self.live = None;
            return Err(anyhow::Error::new(e).context(format!("probing '{}'", self.channel)));
        }
        Ok(())
    }
}

/// Drives one feed forever, probing it after `idle` without traffic.
pub struct ChangeListener<F, H> {
    name: &'static str,
    feed: F,
    handler: H,
    idle: Duration,
}

impl<F: ChangeFeed, H: NotificationHandler> ChangeListener<F, H> {
    pub fn new(name: &'static str, feed: F, handler: H, idle: Duration) -> Self {
        Self {
            name,
            feed,
            handler,
            idle,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                received = self.feed.recv() => match received {
                    Ok(notification) => {
                        if let Err(e) = self.handler.handle(&notification.payload).await {
                            error!(
                                "{} listener failed to handle event from '{}': {:#}",
                                self.name, notification.channel, e
                            );
                        }
                    }
                    Err(e) => warn!("{} listener receive error: {:#}", self.name, e),
                },
                _ = tokio::time::sleep(self.idle) => {
                    debug!("{} listener idle, probing connection", self.name);
                    if let Err(e) = self.feed.probe().await {
                        warn!("{} listener probe failed: {:#}", self.name, e);
                    }
                }
            }
        }
    }
}

pub struct SaleHandler<A> {
    adjuster: A,
}

impl<A: PriceAdjuster> SaleHandler<A> {
    pub fn new(adjuster: A) -> Self {
        Self { adjuster }
    }
}

impl<A: PriceAdjuster> NotificationHandler for SaleHandler<A> {
    async fn handle(&self, payload: &str) -> Result<()> {
        let sale: SaleEvent = serde_json::from_str(payload).context("decoding sale event")?;
        let quote = self
            .adjuster
            .adjust_price(sale.product_id)
            .await
            .with_context(|| format!("adjusting price of product {}", sale.product_id))?;
        info!(
            "Sale {} repriced product {}: {} -> {}",
            sale.id, quote.product_id, quote.old_price, quote.new_price
        );
        Ok(())
    }
}

pub struct PriceAdjustmentHandler<D> {
    directory: D,
    broadcaster: BroadcastHandle,
}

impl<D: ProductDirectory> PriceAdjustmentHandler<D> {
    pub fn new(directory: D, broadcaster: BroadcastHandle) -> Self {
        Self {
            directory,
            broadcaster,
        }
    }
}

impl<D: ProductDirectory> NotificationHandler for PriceAdjustmentHandler<D> {
    async fn handle(&self, payload: &str) -> Result<()> {
        let event: PriceAdjustmentEvent =
            serde_json::from_str(payload).context("decoding price adjustment event")?;

        let name = match self.directory.product_name(event.product_id).await {
            Ok(name) => name,
            Err(e) => {
                debug!("No name for product {}: {:#}", event.product_id, e);
                fallback_product_name(event.product_id)
            }
        };

        let update = PriceUpdate::from_adjustment(&event, name);
        self.broadcaster
            .broadcast(serde_json::to_string(&update)?)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct DbProductDirectory {
    pool: DbPool,
}

impl DbProductDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl ProductDirectory for DbProductDirectory {
    async fn product_name(&self, product_id: i32) -> Result<String> {
        let mut conn = self.pool.get().await?;
        let name = products::table
            .filter(products::id.eq(product_id))
            .select(products::name)
            .first::<String>(&mut conn)
            .await?;
        Ok(name)
    }
}
