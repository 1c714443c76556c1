#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use wings::config::{App, Config, Endpoints, Logging};
use wings::model::{Credential, Destination, LinkGrant, StepResult};
use wings::{
    Deliverer, DeliveryOutcome, EndpointKind, LinkError, LinkProgress, LinkStep, Notifier,
    ShareNotification, Wings,
};

pub fn test_config(data_dir: &Path) -> Config {
    Config {
        app: App {
            data_dir: data_dir.to_string_lossy().to_string(),
            poll_interval_ms: 0,
            delivery_timeout_seconds: 5,
            failed_retention_hours: 0,
        },
        logging: Logging::default(),
        endpoints: Endpoints::default(),
    }
}

pub async fn open_pool(data_dir: &Path) -> wings::db::Pool {
    let pool = wings::db::init_pool(&test_config(data_dir).database_url())
        .await
        .unwrap();
    wings::db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn write_file(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, b"image bytes").unwrap();
    path.to_string_lossy().to_string()
}

#[derive(Debug, Clone)]
pub struct DeliveryCall {
    pub file: PathBuf,
    pub destination: Destination,
    pub token: String,
}

/// Scripted deliverer. Outcomes are popped in order; an empty script succeeds.
#[derive(Clone, Default)]
pub struct RecordingDeliverer {
    outcomes: Arc<Mutex<VecDeque<DeliveryOutcome>>>,
    calls: Arc<Mutex<Vec<DeliveryCall>>>,
    panic_on_deliver: bool,
    delay: Option<Duration>,
    entered: Option<Arc<Notify>>,
    release: Option<Arc<Notify>>,
}

impl RecordingDeliverer {
    pub fn with_outcomes(outcomes: Vec<DeliveryOutcome>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(VecDeque::from(outcomes))),
            ..Default::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic_on_deliver: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Signals `entered` on each call, then waits for `release`.
    pub fn gated(entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            entered: Some(entered),
            release: Some(release),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<DeliveryCall> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl Deliverer for RecordingDeliverer {
    async fn deliver(
        &self,
        file: &Path,
        destination: &Destination,
        credential: &Credential,
    ) -> DeliveryOutcome {
        self.calls.lock().push(DeliveryCall {
            file: file.to_path_buf(),
            destination: *destination,
            token: credential.token.clone(),
        });
        if self.panic_on_deliver {
            panic!("deliverer exploded");
        }
        if let Some(entered) = &self.entered {
            entered.notify_one();
        }
        if let Some(release) = &self.release {
            release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.outcomes.lock().pop_front();
        next.unwrap_or_else(|| DeliveryOutcome::Success {
            receipt: Some(format!("receipt/{}", file.display())),
        })
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    shares: Arc<Mutex<Vec<ShareNotification>>>,
    link_failures: Arc<Mutex<Vec<(EndpointKind, LinkError)>>>,
    panic_on_share: bool,
}

impl RecordingNotifier {
    /// Records each share notification, then panics.
    pub fn panicking() -> Self {
        Self {
            panic_on_share: true,
            ..Default::default()
        }
    }

    pub fn shares(&self) -> Vec<ShareNotification> {
        self.shares.lock().clone()
    }

    pub fn link_failures(&self) -> Vec<(EndpointKind, LinkError)> {
        self.link_failures.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn share_completed(&self, notification: &ShareNotification) {
        self.shares.lock().push(notification.clone());
        if self.panic_on_share {
            panic!("notifier exploded");
        }
    }

    fn link_failed(&self, kind: EndpointKind, error: &LinkError) {
        self.link_failures.lock().push((kind, error.clone()));
    }
}

pub fn granted(grant: LinkGrant) -> StepResult {
    StepResult::Granted(grant)
}

/// Drive the link flow of `kind` to completion with a valid grant per step.
pub async fn link(wings: &Wings, kind: EndpointKind) {
    let endpoint = wings.endpoint(kind).unwrap();
    let mut step = endpoint.start_link_request().await.unwrap();
    loop {
        let grant = grant_for(step);
        match endpoint.complete_link_request(step, granted(grant)).await.unwrap() {
            LinkProgress::Next(next) => step = next,
            LinkProgress::Linked(_) => return,
            LinkProgress::Failed(err) => panic!("link failed: {err}"),
        }
    }
}

pub fn grant_for(step: LinkStep) -> LinkGrant {
    match step {
        LinkStep::Login | LinkStep::Authorize => LinkGrant {
            credential: Some("token-1".into()),
            ..Default::default()
        },
        LinkStep::OpenSession => LinkGrant {
            account_name: Some("alice".into()),
            ..Default::default()
        },
        LinkStep::PublishPermissions => LinkGrant {
            settings: BTreeMap::from([("privacy".to_string(), "friends".to_string())]),
            ..Default::default()
        },
        LinkStep::SelectAlbum => LinkGrant {
            destination_id: Some(wings::model::SOCIAL_PROFILE),
            destination_description: Some("Holiday".into()),
            ..Default::default()
        },
        LinkStep::FetchAccount => LinkGrant {
            account_name: Some("alice@example.com".into()),
            destination_description: Some("Apps/wings".into()),
            settings: BTreeMap::from([(
                "share_url".to_string(),
                "https://cloud.example.com/s/abc".to_string(),
            )]),
            ..Default::default()
        },
        LinkStep::SelectPrinter => LinkGrant {
            account_name: Some("alice".into()),
            credential: Some("printer-token".into()),
            destination_description: Some("Office printer".into()),
            ..Default::default()
        },
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
