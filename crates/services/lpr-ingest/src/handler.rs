//! Application hooks for accepted detections
//!
//! The listener calls [`PlateEventHandler::on_plate`] once per accepted push,
//! inside the request's task. Errors and panics raised by a handler are
//! caught by [`deliver`] and logged; they never change the response the
//! camera receives.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;

use crate::event::PlateNotification;

/// Receives every accepted detection
///
/// # Cancellation
///
/// A handler still running when `stop()` times out is abandoned together
/// with its connection task.
#[async_trait]
pub trait PlateEventHandler: Send + Sync + 'static {
    async fn on_plate(&self, notification: PlateNotification) -> anyhow::Result<()>;
}

/// Forwards notifications into a bounded channel
///
/// A full channel applies backpressure to the pushing camera; a closed
/// channel is reported as a handler failure.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<PlateNotification>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<PlateNotification>) -> Self {
        Self { tx }
    }

    /// Create a handler and the receiver the application consumes
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PlateNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl PlateEventHandler for ChannelHandler {
    async fn on_plate(&self, notification: PlateNotification) -> anyhow::Result<()> {
        self.tx
            .send(notification)
            .await
            .map_err(|_| anyhow::anyhow!("Detection channel closed"))
    }
}

/// Adapts a synchronous closure
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(PlateNotification) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> PlateEventHandler for FnHandler<F>
where
    F: Fn(PlateNotification) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn on_plate(&self, notification: PlateNotification) -> anyhow::Result<()> {
        (self.f)(notification)
    }
}

/// Outcome of a single handler invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Delivered,
    Failed(String),
    Panicked(String),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// Invoke a handler, containing its errors and panics
pub async fn deliver(handler: &dyn PlateEventHandler, notification: PlateNotification) -> Delivery {
    let request_id = notification.request_id;
    let plate = notification.event.plate().to_string();

    match AssertUnwindSafe(handler.on_plate(notification)).catch_unwind().await {
        Ok(Ok(())) => Delivery::Delivered,
        Ok(Err(e)) => {
            tracing::error!(
                request_id = %request_id,
                plate = %plate,
                error = %e,
                "Plate handler failed"
            );
            Delivery::Failed(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(
                request_id = %request_id,
                plate = %plate,
                panic = %message,
                "Plate handler panicked"
            );
            Delivery::Panicked(message)
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
