//! TCP transport for the sofa line protocol

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use sofa_core::{ChangeFeed, Store};
use sofa_protocol::Response;

use crate::error::TransportError;
use crate::handler::{change_frame, ConnectionHandler};
use crate::metrics::Metrics;
use crate::registry::ReplicationRegistry;

/// Frames buffered between a feed task and the socket
const FEED_BUFFER: usize = 256;

/// TCP Server for sofa
pub struct TcpServer {
    store: Store,
    replications: Arc<ReplicationRegistry>,
    addr: SocketAddr,
    client_counter: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl TcpServer {
    pub fn new(store: Store, replications: Arc<ReplicationRegistry>, addr: SocketAddr) -> Self {
        Self {
            store,
            replications,
            addr,
            client_counter: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the TCP server
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Sofa TCP server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "tcp:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let mut handler = ConnectionHandler::new(
                        client_id.clone(),
                        self.store.clone(),
                        self.replications.clone(),
                    );
                    if let Some(ref metrics) = self.metrics {
                        handler = handler.with_metrics(metrics.clone());
                    }
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        if let Some(ref m) = metrics {
                            m.record_connection("tcp");
                        }
                        if let Err(e) = Self::handle_connection(stream, handler, metrics.clone()).await {
                            error!(client = %client_id, error = %e, "Connection error");
                        }
                        if let Some(ref m) = metrics {
                            m.record_disconnection("tcp");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        mut handler: ConnectionHandler,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<(), TransportError> {
        let client_id = handler.client_id.clone();
        info!(client = %client_id, "Client connected");

        let mut buf = vec![0u8; 4096];
        let (frame_tx, mut frame_rx) = mpsc::channel::<Response>(FEED_BUFFER);
        let mut feed_task: Option<JoinHandle<()>> = None;

        let result = 'conn: loop {
            tokio::select! {
                // Handle incoming data from client
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            info!(client = %client_id, "Client disconnected");
                            break Ok(());
                        }
                        Ok(n) => {
                            let responses = handler.process(&buf[..n]).await;
                            let mut sent = 0;
                            for response in responses {
                                let data = response.encode();
                                sent += data.len();
                                if let Err(e) = stream.write_all(&data).await {
                                    break 'conn Err(e.into());
                                }
                            }
                            if let Some(ref m) = metrics {
                                m.record_bytes(n as u64, sent as u64);
                            }

                            // A new continuous feed replaces the previous one
                            if let Some(feed) = handler.take_feed() {
                                if let Some(task) = feed_task.take() {
                                    stop_feed(task).await;
                                }
                                feed_task = Some(spawn_feed(feed, frame_tx.clone(), metrics.clone()));
                            }

                            if handler.is_closed() {
                                break Ok(());
                            }
                        }
                        Err(e) => {
                            error!(client = %client_id, error = %e, "Read error");
                            break Ok(());
                        }
                    }
                }

                // Stream change frames from the active feed
                Some(frame) = frame_rx.recv() => {
                    let data = frame.encode();
                    if let Err(e) = stream.write_all(&data).await {
                        error!(client = %client_id, error = %e, "Write error");
                        break Ok(());
                    }
                    if let Some(ref m) = metrics {
                        m.record_bytes(0, data.len() as u64);
                    }
                }
            }
        };

        if let Some(task) = feed_task {
            stop_feed(task).await;
        }
        result
    }
}

/// Holds `feeds_active` up for as long as a feed task is alive, aborted or not
struct FeedGauge(Option<Arc<Metrics>>);

impl FeedGauge {
    fn open(metrics: Option<Arc<Metrics>>) -> Self {
        if let Some(ref m) = metrics {
            m.feeds_active.inc();
        }
        Self(metrics)
    }
}

impl Drop for FeedGauge {
    fn drop(&mut self) {
        if let Some(ref m) = self.0 {
            m.feeds_active.dec();
        }
    }
}

/// Abort a feed task and wait until it has been dropped
async fn stop_feed(task: JoinHandle<()>) {
    task.abort();
    if let Err(e) = task.await {
        if !e.is_cancelled() {
            warn!(error = %e, "Change feed task panicked");
        }
    }
}

/// Forward a continuous feed to the connection as change frames
fn spawn_feed(
    mut feed: ChangeFeed,
    frames: mpsc::Sender<Response>,
    metrics: Option<Arc<Metrics>>,
) -> JoinHandle<()> {
    let gauge = FeedGauge::open(metrics);
    tokio::spawn(async move {
        loop {
            let frame = match feed.next().await {
                Ok(Some(record)) => change_frame(&record),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, last_seq = feed.last_seq(), "Change feed failed");
                    let _ = frames.send(e.into()).await;
                    break;
                }
            };
            if frames.send(frame).await.is_err() {
                break;
            }
            if let Some(ref m) = gauge.0 {
                m.changes_delivered.inc();
            }
        }
        debug!(last_seq = feed.last_seq(), "Change feed finished");
        drop(gauge);
    })
}
