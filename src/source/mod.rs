//! Log sources
//!
//! A source pushes [`LogLine`]s into a bounded channel until shutdown and
//! then drops its sender, which closes the stream for the processor.
//! Transport errors travel in-band as lines with `error` set.

pub mod file;
pub mod kubernetes;

pub use file::FileTail;
pub use kubernetes::{KubernetesSource, PodSelector};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use traefik_officer_common::LogLine;

/// Channel capacity of the file source
pub const FILE_CHANNEL_SIZE: usize = 100;
/// Channel capacity of the Kubernetes source
pub const K8S_CHANNEL_SIZE: usize = 1000;

#[async_trait]
pub trait LogSource: Send {
    fn name(&self) -> &'static str;

    /// Bound of the output channel
    fn capacity(&self) -> usize;

    /// Produce lines until `shutdown` fires; returning closes the stream
    async fn run(self: Box<Self>, tx: mpsc::Sender<LogLine>, shutdown: CancellationToken);
}

/// Start `source` on its own task
pub fn spawn(
    source: Box<dyn LogSource>,
    shutdown: CancellationToken,
) -> (mpsc::Receiver<LogLine>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(source.capacity());
    let name = source.name();
    info!(source = name, "Starting log source");

    let handle = tokio::spawn(async move {
        source.run(tx, shutdown).await;
        info!(source = name, "Log source stopped");
    });

    (rx, handle)
}
