//! Server lifecycle: start, serve, shut down.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::serialize::binary::BinDecodable;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{AnswerCache, Cache, DecisionCache, PersistError, Ttl};
use crate::config::Config;
use crate::dns::{
    DnsResolver, ErrorQueue, HandlerOptions, MAX_UDP_DNS_SIZE, QueryHandler, UdpResponder,
    UpstreamResolver,
};
use crate::error::{ResolveError, Result};
use crate::rules::{RuleSet, loader};

/// A running resolver bound to its UDP socket.
pub struct Server {
    local_addr: SocketAddr,
    rules: Arc<RuleSet>,
    decisions: Arc<DecisionCache>,
    answers: Arc<AnswerCache>,
    errors: ErrorQueue,
    cache_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Server {
    /// Start serving with UDP upstreams taken from the configuration.
    ///
    /// Upstream host names are resolved once, here. Returns the server and
    /// the receiving end of its error queue.
    pub async fn start(config: &Config) -> Result<(Self, UnboundedReceiver<ResolveError>)> {
        let resolvers =
            UpstreamResolver::lookup_all(&config.dns.forwards, config.upstream_timeout()).await?;
        Self::start_with(config, resolvers).await
    }

    /// Start serving with the given upstream resolvers, in priority order.
    ///
    /// Rule errors abort the start. A missing or unreadable answer cache
    /// snapshot does not: the server starts with an empty cache.
    pub async fn start_with<R>(
        config: &Config,
        resolvers: Vec<R>,
    ) -> Result<(Self, UnboundedReceiver<ResolveError>)>
    where
        R: DnsResolver,
    {
        let files = loader::load_directory(&config.rules.directory).await?;
        let rules = Arc::new(RuleSet::from_files(&files));
        info!(
            directory = ?config.rules.directory,
            files = files.len(),
            rules = rules.len(),
            "loaded rules"
        );

        let ttl = Ttl::Finite(config.cache_ttl());
        let answers = Arc::new(restore_answers(&config.cache.path, ttl).await);
        let decisions = Arc::new(DecisionCache::new(ttl));

        let socket = Arc::new(UdpSocket::bind(config.listen_addr()).await?);
        let local_addr = socket.local_addr()?;

        let (errors, error_rx) = ErrorQueue::new();
        let handler = QueryHandler::new(
            Arc::clone(&rules),
            Arc::clone(&decisions),
            Arc::clone(&answers),
            resolvers,
            errors.clone(),
            HandlerOptions::from_config(config),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(listen(socket, handler, shutdown_rx.clone())),
            tokio::spawn(sweep(
                Arc::clone(&decisions),
                Arc::clone(&answers),
                config.sweep_interval(),
                shutdown_rx,
            )),
        ];

        info!(address = %local_addr, "listening for DNS queries");

        let server = Self {
            local_addr,
            rules,
            decisions,
            answers,
            errors,
            cache_path: config.cache.path.clone(),
            shutdown_tx,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        };
        Ok((server, error_rx))
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn decisions(&self) -> &DecisionCache {
        &self.decisions
    }

    pub fn answers(&self) -> &AnswerCache {
        &self.answers
    }

    /// Stop serving and persist the answer cache.
    ///
    /// Calling this more than once is harmless. Forwarding tasks still in
    /// flight are not awaited. The socket is released as soon as the
    /// listener stops, so their late replies fail and the errors are dropped.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // Receivers only need to observe a change.
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "server task ended abnormally");
            }
        }

        self.decisions.clear();

        let swept = self.answers.clean();
        match self.answers.save(&self.cache_path).await {
            Ok(()) => info!(
                path = ?self.cache_path,
                entries = self.answers.len(),
                swept,
                "saved answer cache"
            ),
            Err(err) => warn!(path = ?self.cache_path, error = %err, "could not save answer cache"),
        }

        self.errors.close();
        info!("server stopped");
    }
}

async fn restore_answers(path: &std::path::Path, ttl: Ttl) -> AnswerCache {
    match AnswerCache::load(path, ttl).await {
        Ok(answers) => {
            info!(path = ?path, entries = answers.len(), "restored answer cache");
            answers
        }
        Err(PersistError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            info!(path = ?path, "no answer cache snapshot, starting empty");
            AnswerCache::new(ttl)
        }
        Err(err) => {
            warn!(path = ?path, error = %err, "could not restore answer cache, starting empty");
            AnswerCache::new(ttl)
        }
    }
}

/// Receive loop. Each datagram is parsed and handed to the handler.
async fn listen<R>(
    socket: Arc<UdpSocket>,
    handler: QueryHandler<R>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: DnsResolver,
{
    let mut buf = vec![0u8; MAX_UDP_DNS_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "failed to receive datagram");
                        continue;
                    }
                };

                let query = match Message::from_bytes(&buf[..len]) {
                    Ok(query) if query.message_type() == MessageType::Query => query,
                    Ok(_) => {
                        debug!(%peer, "ignoring DNS response sent to the listener");
                        continue;
                    }
                    Err(err) => {
                        debug!(%peer, error = %err, "ignoring malformed datagram");
                        continue;
                    }
                };

                handler
                    .handle(query, UdpResponder::new(Arc::downgrade(&socket), peer))
                    .await;
            }
        }
    }

    debug!("listener stopped");
}

/// Periodically drop expired entries from both caches.
async fn sweep(
    decisions: Arc<DecisionCache>,
    answers: Arc<AnswerCache>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let decisions_swept = decisions.clean();
                let answers_swept = answers.clean();
                debug!(decisions_swept, answers_swept, "swept expired cache entries");
            }
        }
    }
}
