//! The proxy actor and its handle.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::cache::{CacheClass, CacheStorage};
use super::strategy::{RequestClass, Strategy, classify};
use super::{
    CacheStats, PartitionStats, ProxyConfig, ProxyError, ProxyEvent, ProxyResponse,
    ResponseSource, WorkerState,
};
use crate::api::{HttpRequest, HttpResponse, NetworkError, SOURCE_HEADER, Transport};

const MAILBOX_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 16;

type FetchReply = oneshot::Sender<Result<ProxyResponse, ProxyError>>;

/// Messages understood by the worker.
pub(super) enum ProxyCommand {
    Fetch {
        request: HttpRequest,
        reply: FetchReply,
    },
    Install {
        reply: oneshot::Sender<Result<usize, ProxyError>>,
    },
    SkipWaiting {
        reply: oneshot::Sender<Result<Vec<String>, ProxyError>>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
    ClearCaches {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<CacheStorage>,
    },
    /// A network fetch spawned by the worker has finished.
    NetworkSettled {
        key: String,
        result: Result<HttpResponse, NetworkError>,
        then: Settle,
    },
}

/// What to do once a spawned network fetch settles.
pub(super) enum Settle {
    /// Someone is waiting for the response
    Reply {
        class: RequestClass,
        partition: String,
        reply: FetchReply,
    },
    /// Background refresh of a cache-first entry
    Revalidate { partition: String },
}

struct Worker {
    config: ProxyConfig,
    state: WorkerState,
    storage: CacheStorage,
    network: Arc<dyn Transport>,
    mailbox: mpsc::WeakSender<ProxyCommand>,
    events: broadcast::Sender<ProxyEvent>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<ProxyCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                ProxyCommand::Fetch { request, reply } => self.on_fetch(request, reply),
                ProxyCommand::Install { reply } => {
                    let _ = reply.send(self.install().await);
                }
                ProxyCommand::SkipWaiting { reply } => {
                    let _ = reply.send(self.activate());
                }
                ProxyCommand::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                ProxyCommand::ClearCaches { reply } => {
                    let names = self.storage.names();
                    self.storage.clear();
                    info!(partitions = names.len(), "cleared proxy caches");
                    let _ = reply.send(names.len());
                }
                ProxyCommand::Shutdown { reply } => {
                    let _ = reply.send(std::mem::take(&mut self.storage));
                    break;
                }
                ProxyCommand::NetworkSettled { key, result, then } => {
                    self.on_settled(key, result, then)
                }
            }
        }
        debug!(version = %self.config.version, "proxy worker stopped");
    }

    fn on_fetch(&mut self, request: HttpRequest, reply: FetchReply) {
        if self.state != WorkerState::Active {
            self.spawn_passthrough(request, RequestClass::Passthrough, reply);
            return;
        }

        let class = classify(&request, &self.config.passthrough);
        match class.strategy() {
            Strategy::NetworkOnly => self.spawn_passthrough(request, class, reply),
            Strategy::CacheFirst(cache_class) => {
                let partition = cache_class.partition_name(&self.config.version);
                let key = request.cache_key();
                match self.storage.lookup(&partition, &key).cloned() {
                    Some(response) => {
                        debug!(%key, "cache hit");
                        let _ = reply.send(Ok(ProxyResponse {
                            response,
                            source: ResponseSource::Cache,
                            class,
                        }));
                        self.spawn_network(request, Settle::Revalidate { partition });
                    }
                    None => {
                        debug!(%key, "cache miss");
                        self.spawn_network(
                            request,
                            Settle::Reply {
                                class,
                                partition,
                                reply,
                            },
                        );
                    }
                }
            }
            Strategy::NetworkFirst(cache_class) => {
                let partition = cache_class.partition_name(&self.config.version);
                self.spawn_network(
                    request,
                    Settle::Reply {
                        class,
                        partition,
                        reply,
                    },
                );
            }
        }
    }

    fn on_settled(&mut self, key: String, result: Result<HttpResponse, NetworkError>, then: Settle) {
        match then {
            Settle::Revalidate { partition } => match result {
                Ok(response) => self.store(&partition, key, response),
                Err(e) => debug!(%key, error = %e, "background revalidation failed"),
            },
            Settle::Reply {
                class,
                partition,
                reply,
            } => {
                let outcome = match result {
                    Ok(response) => {
                        self.store(&partition, key, response.clone());
                        Ok(ProxyResponse {
                            response,
                            source: ResponseSource::Network,
                            class,
                        })
                    }
                    Err(e) => self.fallback(class, &partition, &key, e),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    /// Resolve a failed network fetch from the cache where the strategy allows.
    fn fallback(
        &self,
        class: RequestClass,
        partition: &str,
        key: &str,
        error: NetworkError,
    ) -> Result<ProxyResponse, ProxyError> {
        if !matches!(class.strategy(), Strategy::NetworkFirst(_)) {
            return Err(error.into());
        }

        if let Some(response) = self.storage.lookup(partition, key) {
            debug!(%key, "network failed, serving cached response");
            return Ok(ProxyResponse {
                response: response.clone(),
                source: ResponseSource::Cache,
                class,
            });
        }

        if class == RequestClass::Navigation {
            if let Some(response) = self.offline_document() {
                debug!(%key, "network failed, serving offline document");
                return Ok(ProxyResponse {
                    response,
                    source: ResponseSource::OfflineFallback,
                    class,
                });
            }
        }

        Err(error.into())
    }

    fn offline_document(&self) -> Option<HttpResponse> {
        let url = self.config.offline_document.as_ref()?;
        let partition = CacheClass::Static.partition_name(&self.config.version);
        self.storage
            .lookup(&partition, &HttpRequest::get(url.clone()).cache_key())
            .cloned()
    }

    /// Cache a response if it is a plain 200, then trim the partition.
    fn store(&mut self, partition: &str, key: String, response: HttpResponse) {
        if response.status != 200 {
            debug!(%key, status = response.status, "not caching non-200 response");
            return;
        }
        let cap = self.cap_for(partition);
        let evicted = self.storage.open(partition).put(key, response, cap);
        if !evicted.is_empty() {
            debug!(partition, evicted = evicted.len(), "trimmed cache partition");
        }
    }

    fn cap_for(&self, partition: &str) -> usize {
        CacheClass::ALL
            .into_iter()
            .find(|class| class.partition_name(&self.config.version) == partition)
            .map(|class| self.config.caps.for_class(class))
            .unwrap_or(usize::MAX)
    }

    fn spawn_network(&self, request: HttpRequest, then: Settle) {
        let network = Arc::clone(&self.network);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let key = request.cache_key();
            let result = network.fetch(request).await;
            match mailbox.upgrade() {
                Some(tx) => {
                    let _ = tx
                        .send(ProxyCommand::NetworkSettled { key, result, then })
                        .await;
                }
                // Worker is going away; answer without touching the cache.
                None => {
                    if let Settle::Reply { class, reply, .. } = then {
                        let _ = reply.send(
                            result
                                .map(|response| ProxyResponse {
                                    response,
                                    source: ResponseSource::Network,
                                    class,
                                })
                                .map_err(ProxyError::from),
                        );
                    }
                }
            }
        });
    }

    fn spawn_passthrough(&self, request: HttpRequest, class: RequestClass, reply: FetchReply) {
        let network = Arc::clone(&self.network);
        tokio::spawn(async move {
            let result = network.fetch(request).await;
            let _ = reply.send(
                result
                    .map(|response| ProxyResponse {
                        response,
                        source: ResponseSource::Network,
                        class,
                    })
                    .map_err(ProxyError::from),
            );
        });
    }

    /// Precache the configured static assets. All-or-nothing.
    async fn install(&mut self) -> Result<usize, ProxyError> {
        if self.state != WorkerState::Parsed {
            return Ok(0);
        }

        let mut urls = self.config.precache.clone();
        if let Some(doc) = &self.config.offline_document {
            if !urls.contains(doc) {
                urls.push(doc.clone());
            }
        }

        let mut fetched = Vec::with_capacity(urls.len());
        for url in urls {
            let request = HttpRequest::get(url.clone());
            let key = request.cache_key();
            let response = self
                .network
                .fetch(request)
                .await
                .map_err(|e| ProxyError::InstallFailed(format!("{}: {}", url, e)))?;
            if response.status != 200 {
                return Err(ProxyError::InstallFailed(format!(
                    "{}: HTTP {}",
                    url, response.status
                )));
            }
            fetched.push((key, response));
        }

        let count = fetched.len();
        let partition = CacheClass::Static.partition_name(&self.config.version);
        for (key, response) in fetched {
            self.store(&partition, key, response);
        }

        self.state = WorkerState::Installed;
        let suffix = format!("-{}", self.config.version);
        let update_ready = self
            .storage
            .names()
            .iter()
            .any(|name| !name.ends_with(&suffix));
        info!(version = %self.config.version, precached = count, update_ready, "proxy worker installed");
        let _ = self.events.send(ProxyEvent::Installed {
            version: self.config.version.clone(),
            update_ready,
        });
        Ok(count)
    }

    /// Take over and delete partitions that belong to other versions.
    fn activate(&mut self) -> Result<Vec<String>, ProxyError> {
        match self.state {
            WorkerState::Parsed => return Err(ProxyError::NotInstalled),
            WorkerState::Active => return Ok(Vec::new()),
            WorkerState::Installed => {}
        }

        let keep: Vec<String> = CacheClass::ALL
            .iter()
            .map(|class| class.partition_name(&self.config.version))
            .collect();
        let purged = self.storage.retain_only(&keep);
        self.state = WorkerState::Active;

        if !purged.is_empty() {
            warn!(purged = ?purged, "deleted stale cache partitions");
        }
        info!(version = %self.config.version, "proxy worker activated");
        let _ = self.events.send(ProxyEvent::Activated {
            version: self.config.version.clone(),
            purged: purged.clone(),
        });
        Ok(purged)
    }

    fn stats(&self) -> CacheStats {
        let partitions = self
            .storage
            .names()
            .into_iter()
            .map(|name| {
                let entries = self.storage.get(&name).map(|p| p.len()).unwrap_or(0);
                let cap = CacheClass::ALL
                    .into_iter()
                    .find(|class| class.partition_name(&self.config.version) == name)
                    .map(|class| self.config.caps.for_class(class));
                PartitionStats { name, entries, cap }
            })
            .collect();
        CacheStats {
            version: self.config.version.clone(),
            state: self.state,
            partitions,
        }
    }
}

/// Cloneable handle to a running proxy worker.
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<ProxyCommand>,
    events: broadcast::Sender<ProxyEvent>,
}

impl ProxyHandle {
    /// Spawn a worker with empty cache storage.
    pub fn spawn(config: ProxyConfig, network: Arc<dyn Transport>) -> Self {
        Self::spawn_with_storage(config, network, CacheStorage::new())
    }

    /// Spawn a worker over existing cache storage, e.g. one handed back by
    /// [`ProxyHandle::shutdown`] of an older version.
    pub fn spawn_with_storage(
        config: ProxyConfig,
        network: Arc<dyn Transport>,
        storage: CacheStorage,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let worker = Worker {
            config,
            state: WorkerState::Parsed,
            storage,
            network,
            mailbox: tx.downgrade(),
            events: events.clone(),
        };
        tokio::spawn(worker.run(rx));
        Self { tx, events }
    }

    /// Spawn, install and activate in one go.
    pub async fn start(
        config: ProxyConfig,
        network: Arc<dyn Transport>,
        storage: CacheStorage,
    ) -> Result<Self, ProxyError> {
        let handle = Self::spawn_with_storage(config, network, storage);
        handle.install().await?;
        handle.skip_waiting().await?;
        Ok(handle)
    }

    async fn call<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> ProxyCommand,
    ) -> Result<R, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| ProxyError::Closed)?;
        rx.await.map_err(|_| ProxyError::Closed)
    }

    pub async fn fetch(&self, request: HttpRequest) -> Result<ProxyResponse, ProxyError> {
        self.call(|reply| ProxyCommand::Fetch { request, reply })
            .await?
    }

    /// Run the install step. Returns the number of precached assets.
    pub async fn install(&self) -> Result<usize, ProxyError> {
        self.call(|reply| ProxyCommand::Install { reply }).await?
    }

    /// Activate an installed worker. Returns the purged partition names.
    pub async fn skip_waiting(&self) -> Result<Vec<String>, ProxyError> {
        self.call(|reply| ProxyCommand::SkipWaiting { reply })
            .await?
    }

    pub async fn stats(&self) -> Result<CacheStats, ProxyError> {
        self.call(|reply| ProxyCommand::Stats { reply }).await
    }

    /// Delete every partition. Returns how many were deleted.
    pub async fn clear_caches(&self) -> Result<usize, ProxyError> {
        self.call(|reply| ProxyCommand::ClearCaches { reply })
            .await
    }

    /// Stop the worker and take its cache storage.
    pub async fn shutdown(&self) -> Result<CacheStorage, ProxyError> {
        self.call(|reply| ProxyCommand::Shutdown { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl Transport for ProxyHandle {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError> {
        match ProxyHandle::fetch(self, request).await {
            Ok(ProxyResponse {
                response,
                source: ResponseSource::Network,
                ..
            }) => Ok(response),
            // Callers that need the live server can tell a cached reply apart.
            Ok(ProxyResponse { response, source, .. }) => {
                Ok(response.with_header(SOURCE_HEADER, source.as_str()))
            }
            Err(ProxyError::Network(e)) => Err(e),
            Err(other) => Err(NetworkError::Other(other.to_string())),
        }
    }
}
