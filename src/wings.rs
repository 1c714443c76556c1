//! The registry: endpoints, the link state bus and the dispatcher behind one value.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{LinkBus, LinkSubscription};
use crate::config::{Config, ConfigError};
use crate::db::{self, Pool};
use crate::dispatcher::{Dispatcher, DispatcherOptions};
use crate::endpoint::Endpoint;
use crate::error::{Result, WingsError};
use crate::model::{EndpointKind, LinkState, ShareNotification};
use crate::notification::{LogNotifier, Notifier};
use crate::transport::{Deliverer, HttpDeliverer};

pub struct WingsBuilder {
    config: Config,
    endpoints: Vec<(EndpointKind, Arc<dyn Deliverer>)>,
    notifier: Arc<dyn Notifier>,
    executor: Option<Handle>,
    background: bool,
}

impl WingsBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            endpoints: Vec::new(),
            notifier: Arc::new(LogNotifier),
            executor: None,
            background: true,
        }
    }

    pub fn endpoint(mut self, kind: EndpointKind, deliverer: Arc<dyn Deliverer>) -> Self {
        self.endpoints.push((kind, deliverer));
        self
    }

    /// Register an `HttpDeliverer` for every endpoint in the `endpoints` config section.
    pub fn configured_endpoints(mut self) -> Result<Self> {
        let timeout = self.config.delivery_timeout();
        let mut registered = Vec::new();
        for (kind, settings) in self.config.endpoints.enabled() {
            let url = reqwest::Url::parse(settings.upload_url.trim())
                .map_err(|_| ConfigError::Invalid("endpoint upload_url must be a valid URL"))?;
            let deliverer: Arc<dyn Deliverer> = Arc::new(HttpDeliverer::new(url, timeout)?);
            registered.push((kind, deliverer));
        }
        self.endpoints.extend(registered);
        Ok(self)
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Runtime the dispatcher is spawned on. Defaults to the current one.
    pub fn executor(mut self, executor: Handle) -> Self {
        self.executor = Some(executor);
        self
    }

    /// With `false` no worker is spawned and startup recovery is skipped;
    /// deliveries happen only through `Wings::flush`. Suits short-lived
    /// commands running beside a long-lived instance on the same database.
    pub fn background(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    pub async fn build(self) -> Result<Wings> {
        let mut seen = BTreeMap::new();
        for (kind, deliverer) in self.endpoints {
            if seen.insert(kind, deliverer).is_some() {
                return Err(WingsError::DuplicateEndpointId(kind.endpoint_id()));
            }
        }

        self.config.ensure_dirs().map_err(ConfigError::Io)?;
        let pool = db::init_pool(&self.config.database_url()).await?;
        db::run_migrations(&pool).await?;
        let claim_lease = self.config.claim_lease();
        if self.background {
            let recovered = db::recover_interrupted(&pool, claim_lease).await?;
            if recovered > 0 {
                warn!(recovered, "share requests from an interrupted cycle marked failed");
            }
        }
        let instance = Uuid::new_v4().to_string();

        let mut initial = Vec::with_capacity(seen.len());
        for kind in seen.keys() {
            let record = db::load_link_record(&pool, kind.endpoint_id()).await?;
            let linked = matches!(record.link_state()?, LinkState::Linked(_));
            initial.push((kind.endpoint_id(), linked));
        }
        let bus = LinkBus::new(initial);

        let delivery_timeout = self.config.delivery_timeout();
        let endpoints: BTreeMap<EndpointKind, Arc<Endpoint>> = seen
            .into_iter()
            .map(|(kind, deliverer)| {
                let endpoint = Endpoint::new(
                    kind,
                    pool.clone(),
                    deliverer,
                    Arc::clone(&self.notifier),
                    bus.clone(),
                    delivery_timeout,
                    instance.as_str(),
                );
                (kind, Arc::new(endpoint))
            })
            .collect();

        let options = DispatcherOptions {
            poll_interval: self.config.poll_interval(),
            failed_retention: self.config.failed_retention(),
            claim_lease: Some(claim_lease),
        };
        let ordered: Vec<Arc<Endpoint>> = endpoints.values().cloned().collect();
        let notifier = Arc::clone(&self.notifier);
        let dispatcher = if self.background {
            let executor = self.executor.unwrap_or_else(Handle::current);
            Dispatcher::spawn(pool.clone(), ordered, notifier, options, &executor)
        } else {
            Dispatcher::manual(pool.clone(), ordered, notifier, options)
        };

        info!(
            endpoints = ?endpoints.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
            %instance,
            background = self.background,
            "wings initialized"
        );
        Ok(Wings {
            pool,
            endpoints,
            bus,
            dispatcher,
        })
    }
}

#[derive(Debug)]
pub struct Wings {
    pool: Pool,
    endpoints: BTreeMap<EndpointKind, Arc<Endpoint>>,
    bus: LinkBus,
    dispatcher: Dispatcher,
}

impl Wings {
    pub fn builder(config: Config) -> WingsBuilder {
        WingsBuilder::new(config)
    }

    /// Queue `file_path` for the destination `kind` is linked to and wake the
    /// dispatcher. False when the endpoint is unregistered or unlinked, or the
    /// request could not be stored.
    pub async fn share(&self, file_path: &str, kind: EndpointKind) -> bool {
        let Some(endpoint) = self.endpoints.get(&kind) else {
            warn!(%kind, "share to unregistered endpoint");
            return false;
        };
        let info = match endpoint.link_info().await {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!(%kind, "share to unlinked endpoint");
                return false;
            }
            Err(err) => {
                error!(%kind, ?err, "failed to read link state");
                return false;
            }
        };
        match db::create_linked_share_request(&self.pool, file_path, info.destination).await {
            Ok(Some(id)) => {
                info!(id, %kind, destination = %info.destination, file_path, "share request queued");
                self.dispatcher.wake();
                true
            }
            Ok(None) => {
                debug!(%kind, "endpoint unlinked before the request was stored");
                false
            }
            Err(err) => {
                error!(%kind, ?err, "failed to queue share request");
                false
            }
        }
    }

    /// Attach a subscriber. It first receives the persisted link state of
    /// every endpoint, including changes made by other processes.
    pub async fn subscribe(&self) -> LinkSubscription {
        for endpoint in self.endpoints.values() {
            if let Err(err) = endpoint.refresh_link_state().await {
                warn!(kind = %endpoint.kind(), ?err, "refreshing link state failed; replaying cached state");
            }
        }
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, subscription: &LinkSubscription) {
        self.bus.unsubscribe(subscription)
    }

    pub fn wake(&self) {
        self.dispatcher.wake()
    }

    /// Run a cycle now and return its notifications.
    pub async fn flush(&self) -> Vec<ShareNotification> {
        self.dispatcher.flush().await
    }

    /// Re-queue transient failures of `kind` and wake the dispatcher.
    pub async fn retry_failed(&self, kind: EndpointKind) -> Result<u64> {
        let count = self.endpoint(kind)?.retry_failed().await?;
        if count > 0 {
            self.dispatcher.wake();
        }
        Ok(count)
    }

    pub fn endpoint(&self, kind: EndpointKind) -> Result<&Arc<Endpoint>> {
        self.endpoints
            .get(&kind)
            .ok_or_else(|| WingsError::EndpointNotRegistered(kind.to_string()))
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.values()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stop the dispatcher after its current cycle and close the pool.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.pool.close().await;
        info!("wings shut down");
    }
}
