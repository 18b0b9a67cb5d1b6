//! Line-oriented TCP front end.
//!
//! Each request is one line. `\status` reports the pool, `\quit` closes the
//! connection, anything else is executed as a query on a pooled broker.
//! Every response is one line of JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arbor_broker::BrokerPool;
use arbor_common::types::Subject;
use arbor_xquery::{DynamicContext, XQueryService};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Snapshot of the broker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Pool name.
    pub pool: String,
    /// Lifecycle state.
    pub state: String,
    /// Idle brokers.
    pub free: usize,
    /// Checked-out brokers.
    pub active: usize,
    /// Upper bound on brokers.
    pub max: usize,
    /// Brokers created so far.
    pub brokers_created: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
    /// Distinct cached queries.
    pub cached_queries: usize,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    /// Query result items, as strings.
    Ok {
        /// Items of the result sequence.
        items: Vec<String>,
    },
    /// Pool status.
    Pool(PoolStatus),
    /// The request failed.
    Error {
        /// What went wrong.
        message: String,
    },
}

/// Stops a running [`StatusServer`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Stops accepting connections and closes the open ones.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Accepts client connections until stopped.
pub struct StatusServer {
    pool: Arc<BrokerPool>,
    service: Arc<XQueryService>,
    query_timeout: Option<Duration>,
    connections: Arc<Semaphore>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl StatusServer {
    /// Creates a server lending brokers from `pool`.
    pub fn new(
        pool: Arc<BrokerPool>,
        service: Arc<XQueryService>,
        query_timeout: Option<Duration>,
        max_connections: usize,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            pool,
            service,
            query_timeout,
            connections: Arc::new(Semaphore::new(max_connections)),
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Returns a handle that stops the server.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Returns the current pool status.
    pub fn status(&self) -> PoolStatus {
        pool_status(&self.pool, &self.service)
    }

    /// Serves connections from `listener` until stopped.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("listener has no local address")?;
        info!(%addr, "listening");

        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&self.connections).try_acquire_owned() else {
                        warn!(%peer, "connection limit reached, refusing");
                        drop(stream);
                        continue;
                    };
                    debug!(%peer, "connection accepted");

                    let connection = Connection {
                        pool: Arc::clone(&self.pool),
                        service: Arc::clone(&self.service),
                        query_timeout: self.query_timeout,
                    };
                    let stop_rx = self.stop_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = connection.run(stream, stop_rx).await {
                            debug!(%peer, error = %e, "connection closed with error");
                        }
                        drop(permit);
                    });
                }
                _ = stop_rx.changed() => break,
            }
        }

        info!(%addr, "listener stopped");
        Ok(())
    }
}

fn pool_status(pool: &BrokerPool, service: &XQueryService) -> PoolStatus {
    let stats = pool.stats();
    PoolStatus {
        pool: pool.name().to_string(),
        state: pool.state().to_string(),
        free: stats.free,
        active: stats.active,
        max: stats.max,
        brokers_created: stats.brokers_created,
        timeouts: stats.timeouts,
        cached_queries: service.cache().len(),
    }
}

struct Connection {
    pool: Arc<BrokerPool>,
    service: Arc<XQueryService>,
    query_timeout: Option<Duration>,
}

impl Connection {
    async fn run(self, stream: TcpStream, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = stop_rx.changed() => None,
            };
            let Some(line) = line else {
                return Ok(());
            };

            let request = line.trim();
            let response = match request {
                "" => continue,
                "\\quit" => return Ok(()),
                "\\status" => Response::Pool(pool_status(&self.pool, &self.service)),
                query => self.query(query.to_string()).await,
            };

            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
        }
    }

    async fn query(&self, source: String) -> Response {
        let pool = Arc::clone(&self.pool);
        let service = Arc::clone(&self.service);
        let timeout = self.query_timeout;

        let result = tokio::task::spawn_blocking(move || {
            let broker = pool.get(Subject::guest()).map_err(|e| e.to_string())?;
            let mut context = DynamicContext::for_broker(&broker);
            if let Some(timeout) = timeout {
                context = context.with_timeout(timeout);
            }
            let result = service
                .execute(&broker, &source, &context)
                .map_err(|e| e.to_string())?;
            result.strings().map_err(|e| e.to_string())
        })
        .await;

        match result {
            Ok(Ok(items)) => Response::Ok { items },
            Ok(Err(message)) => Response::Error { message },
            Err(e) => Response::Error {
                message: format!("query task failed: {e}"),
            },
        }
    }
}
