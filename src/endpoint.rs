//! One backend: its link flow, its queued share requests and their delivery.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::bus::LinkBus;
use crate::db::{self, Pool, ShareCounts};
use crate::error::{LinkError, Result, WingsError};
use crate::model::{
    Credential, Destination, EndpointKind, FailureKind, LinkEvent, LinkGrant, LinkInfo, LinkState,
    LinkStep, LinkedAccount, ShareNotification, ShareRequest, StepId, StepResult,
};
use crate::notification::{Notifier, ShareTally, SHARE_URL_SETTING};
use crate::transport::{Deliverer, DeliveryOutcome};

/// Where a link flow stands after `Endpoint::complete_link_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkProgress {
    /// The host must perform this step next.
    Next(LinkStep),
    Linked(LinkInfo),
    /// The flow was abandoned and the endpoint is unlinked.
    Failed(LinkError),
}

pub struct Endpoint {
    kind: EndpointKind,
    pool: Pool,
    deliverer: Arc<dyn Deliverer>,
    notifier: Arc<dyn Notifier>,
    bus: LinkBus,
    delivery_timeout: Duration,
    claim_owner: String,
    // Held across a link transition and its bus event.
    transition: Mutex<()>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub fn new(
        kind: EndpointKind,
        pool: Pool,
        deliverer: Arc<dyn Deliverer>,
        notifier: Arc<dyn Notifier>,
        bus: LinkBus,
        delivery_timeout: Duration,
        claim_owner: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            pool,
            deliverer,
            notifier,
            bus,
            delivery_timeout,
            claim_owner: claim_owner.into(),
            transition: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn endpoint_id(&self) -> i32 {
        self.kind.endpoint_id()
    }

    pub async fn link_state(&self) -> Result<LinkState> {
        db::load_link_record(&self.pool, self.endpoint_id())
            .await?
            .link_state()
    }

    pub async fn is_linked(&self) -> Result<bool> {
        Ok(matches!(self.link_state().await?, LinkState::Linked(_)))
    }

    pub async fn link_info(&self) -> Result<Option<LinkInfo>> {
        match self.link_state().await? {
            LinkState::Linked(account) => Ok(Some(account.info())),
            _ => Ok(None),
        }
    }

    /// Begin (or restart) the link flow and return the first step the host
    /// must perform. The move into `LinkInProgress` is published as unlinked.
    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn start_link_request(&self) -> Result<LinkStep> {
        let _guard = self.transition.lock().await;
        if let LinkState::Linked(_) = self.link_state().await? {
            return Err(WingsError::AlreadyLinked(self.kind.to_string()));
        }
        db::begin_link(&self.pool, self.endpoint_id()).await?;
        self.publish(false);
        let first = self.kind.link_steps()[0];
        info!(step = %first, "link request started");
        Ok(first)
    }

    /// Report the result of `step`. Any failure resets the endpoint to
    /// unlinked and purges its queue.
    #[instrument(skip_all, fields(kind = %self.kind, %step))]
    pub async fn complete_link_request(
        &self,
        step: LinkStep,
        result: StepResult,
    ) -> Result<LinkProgress> {
        let _guard = self.transition.lock().await;
        let steps = self.kind.link_steps();
        let record = db::load_link_record(&self.pool, self.endpoint_id()).await?;

        let current = match record.link_state()? {
            LinkState::LinkInProgress(current) => current,
            _ => return self.fail_link(LinkError::NoLinkInProgress).await,
        };
        let Some(&expected) = steps.get(current as usize) else {
            return self.fail_link(LinkError::NoLinkInProgress).await;
        };
        if expected != step {
            return self
                .fail_link(LinkError::StepMismatch {
                    expected,
                    got: step,
                })
                .await;
        }
        let grant = match result {
            StepResult::Granted(grant) => grant,
            StepResult::Denied(reason) => return self.fail_link(LinkError::Denied(reason)).await,
        };

        let draft = record.draft()?.merge(grant);
        let next = current as usize + 1;
        if let Some(&next_step) = steps.get(next) {
            db::advance_link(&self.pool, self.endpoint_id(), next as StepId, &draft).await?;
            debug!(next = %next_step, "link step completed");
            return Ok(LinkProgress::Next(next_step));
        }

        let account = match self.finish_link(draft) {
            Ok(account) => account,
            Err(err) => return self.fail_link(err).await,
        };
        db::store_link(&self.pool, &account).await?;
        self.publish(true);
        info!(
            account = %account.account_name,
            destination = %account.destination,
            "endpoint linked"
        );
        Ok(LinkProgress::Linked(account.info()))
    }

    fn finish_link(&self, draft: LinkGrant) -> Result<LinkedAccount, LinkError> {
        let account_name = draft
            .account_name
            .filter(|name| !name.trim().is_empty())
            .ok_or(LinkError::Incomplete("an account name"))?;
        let token = draft
            .credential
            .filter(|token| !token.is_empty())
            .ok_or(LinkError::Incomplete("a credential"))?;

        let owned = self.kind.destinations();
        let destination = match (draft.destination_id, owned.as_slice()) {
            (Some(id), _) => {
                let destination = Destination::new(self.endpoint_id(), id);
                if !owned.contains(&destination) {
                    return Err(LinkError::UnknownDestination(id));
                }
                destination
            }
            (None, [only]) => *only,
            (None, _) => return Err(LinkError::Incomplete("a destination")),
        };

        Ok(LinkedAccount {
            destination_description: draft
                .destination_description
                .unwrap_or_else(|| account_name.clone()),
            account_name,
            destination,
            credential: Credential {
                token,
                settings: draft.settings,
            },
        })
    }

    // Caller holds the transition lock.
    async fn fail_link(&self, error: LinkError) -> Result<LinkProgress> {
        warn!(kind = %self.kind, %error, "link request failed");
        let purged = db::unlink_and_purge(&self.pool, self.endpoint_id()).await?;
        debug!(purged, "share requests purged");
        self.publish(false);
        self.notifier.link_failed(self.kind, &error);
        Ok(LinkProgress::Failed(error))
    }

    /// Forget the link and every queued request. Emits an unlinked event on
    /// every call, linked or not.
    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn unlink(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        let purged = db::unlink_and_purge(&self.pool, self.endpoint_id()).await?;
        self.publish(false);
        info!(purged, "endpoint unlinked");
        Ok(())
    }

    /// Publish the persisted link state if the bus has not seen it yet, as
    /// after a link or unlink made by another process.
    pub async fn refresh_link_state(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        let is_linked = self.is_linked().await?;
        self.bus.refresh(LinkEvent {
            endpoint_id: self.endpoint_id(),
            is_linked,
        });
        Ok(())
    }

    fn publish(&self, is_linked: bool) {
        self.bus.publish(LinkEvent {
            endpoint_id: self.endpoint_id(),
            is_linked,
        });
    }

    /// Deliver every pending request of every owned destination, one
    /// destination at a time. Returns a notification per destination with at
    /// least one success.
    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn process_share_requests(&self) -> Result<Vec<ShareNotification>> {
        let LinkState::Linked(account) = self.link_state().await? else {
            debug!("endpoint not linked; nothing to deliver");
            return Ok(Vec::new());
        };
        let share_url = account.credential.settings.get(SHARE_URL_SETTING).cloned();
        let mut tally = ShareTally::new(self.kind, &account.destination_description, share_url);

        'destinations: for destination in self.kind.destinations() {
            let requests =
                db::checkout_share_requests(&self.pool, destination, &self.claim_owner).await?;
            if requests.is_empty() {
                continue;
            }
            info!(%destination, count = requests.len(), "delivering share requests");

            for request in requests {
                if !db::renew_claim(&self.pool, request.id, &self.claim_owner).await? {
                    warn!(id = request.id, "claim lost before delivery; skipping");
                    continue;
                }
                match self.deliver(&request, &account.credential).await {
                    DeliveryOutcome::Success { receipt } => {
                        db::mark_successful(&self.pool, request.id).await?;
                        tally.record_success(destination, receipt);
                        debug!(id = request.id, "share request delivered");
                    }
                    DeliveryOutcome::AuthFailure(reason) => {
                        warn!(id = request.id, %reason, "credential rejected; unlinking");
                        db::mark_failed(&self.pool, request.id, FailureKind::Auth).await?;
                        self.unlink().await?;
                        break 'destinations;
                    }
                    DeliveryOutcome::TransientFailure(reason) => {
                        warn!(id = request.id, %reason, "delivery failed; retryable");
                        db::mark_failed(&self.pool, request.id, FailureKind::Transient).await?;
                    }
                    DeliveryOutcome::PermanentFailure(reason) => {
                        warn!(id = request.id, %reason, "delivery failed permanently");
                        db::mark_failed(&self.pool, request.id, FailureKind::Permanent).await?;
                    }
                }
            }
        }

        Ok(tally.into_notifications())
    }

    async fn deliver(&self, request: &ShareRequest, credential: &Credential) -> DeliveryOutcome {
        let file = Path::new(&request.file_path);
        match tokio::fs::metadata(file).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return DeliveryOutcome::PermanentFailure(format!(
                    "file not found: {}",
                    request.file_path
                ))
            }
        }
        let attempt = self.deliverer.deliver(file, &request.destination, credential);
        match tokio::time::timeout(self.delivery_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::TransientFailure(format!(
                "delivery timed out after {}s",
                self.delivery_timeout.as_secs_f64()
            )),
        }
    }

    /// Put transient failures of every owned destination back in the queue.
    pub async fn retry_failed(&self) -> Result<u64> {
        let mut total = 0;
        for destination in self.kind.destinations() {
            total += db::retry_failed(&self.pool, destination).await?;
        }
        if total > 0 {
            info!(kind = %self.kind, count = total, "failed share requests re-queued");
        }
        Ok(total)
    }

    pub async fn share_counts(&self) -> Result<Vec<(Destination, ShareCounts)>> {
        let mut counts = Vec::new();
        for destination in self.kind.destinations() {
            counts.push((destination, db::count_share_requests(&self.pool, destination).await?));
        }
        Ok(counts)
    }
}
