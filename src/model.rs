use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Index of a step within an endpoint's link flow.
pub type StepId = u8;

/// A backend plus a sub-target within it (e.g. a profile vs. a page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    endpoint_id: i32,
    destination_id: i32,
}

impl Destination {
    pub const fn new(endpoint_id: i32, destination_id: i32) -> Self {
        Self {
            endpoint_id,
            destination_id,
        }
    }

    pub fn endpoint_id(&self) -> i32 {
        self.endpoint_id
    }

    pub fn destination_id(&self) -> i32 {
        self.destination_id
    }

    /// Grouping key for notifications. Stable across processes and releases.
    pub fn hash(&self) -> u64 {
        ((self.endpoint_id as u32 as u64) << 32) | (self.destination_id as u32 as u64)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint_id, self.destination_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Auth => "auth",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }

    pub fn parse_kind(value: &str) -> Option<Self> {
        match value {
            "auth" => Some(FailureKind::Auth),
            "transient" => Some(FailureKind::Transient),
            "permanent" => Some(FailureKind::Permanent),
            _ => None,
        }
    }
}

/// Persisted state of a queued share request. Successful requests are deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShareState {
    Pending,
    Processing,
    Failed(FailureKind),
}

impl ShareState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareState::Pending => "pending",
            ShareState::Processing => "processing",
            ShareState::Failed(_) => "failed",
        }
    }

    pub fn parse_state(state: &str, failure: Option<&str>) -> Option<Self> {
        match state {
            "pending" => Some(ShareState::Pending),
            "processing" => Some(ShareState::Processing),
            // Rows written before the failure column was populated count as transient.
            "failed" => Some(ShareState::Failed(
                failure
                    .and_then(FailureKind::parse_kind)
                    .unwrap_or(FailureKind::Transient),
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareRequest {
    pub id: i64,
    pub file_path: String,
    pub destination: Destination,
    pub state: ShareState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("unknown endpoint kind: {0}")]
pub struct UnknownEndpointKind(String);

/// The closed set of backends a file can be shared to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    SocialAlbum,
    CloudFolder,
    PrintQueue,
}

pub const SOCIAL_PROFILE: i32 = 0;
pub const SOCIAL_PAGE: i32 = 1;
pub const CLOUD_APP_FOLDER: i32 = 0;
pub const PRINT_QUEUE: i32 = 0;

impl EndpointKind {
    pub const ALL: [EndpointKind; 3] = [
        EndpointKind::SocialAlbum,
        EndpointKind::CloudFolder,
        EndpointKind::PrintQueue,
    ];

    pub fn endpoint_id(&self) -> i32 {
        match self {
            EndpointKind::SocialAlbum => 0,
            EndpointKind::CloudFolder => 1,
            EndpointKind::PrintQueue => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::SocialAlbum => "social_album",
            EndpointKind::CloudFolder => "cloud_folder",
            EndpointKind::PrintQueue => "print_queue",
        }
    }

    /// Human-readable service name used in notifications.
    pub fn service_name(&self) -> &'static str {
        match self {
            EndpointKind::SocialAlbum => "social album",
            EndpointKind::CloudFolder => "cloud folder",
            EndpointKind::PrintQueue => "print queue",
        }
    }

    pub fn destinations(&self) -> Vec<Destination> {
        let id = self.endpoint_id();
        match self {
            EndpointKind::SocialAlbum => vec![
                Destination::new(id, SOCIAL_PROFILE),
                Destination::new(id, SOCIAL_PAGE),
            ],
            EndpointKind::CloudFolder => vec![Destination::new(id, CLOUD_APP_FOLDER)],
            EndpointKind::PrintQueue => vec![Destination::new(id, PRINT_QUEUE)],
        }
    }

    pub fn owns(&self, destination: &Destination) -> bool {
        self.destinations().contains(destination)
    }

    /// Ordered round trips needed to link this backend.
    pub fn link_steps(&self) -> &'static [LinkStep] {
        match self {
            EndpointKind::SocialAlbum => &[
                LinkStep::Login,
                LinkStep::OpenSession,
                LinkStep::PublishPermissions,
                LinkStep::SelectAlbum,
            ],
            EndpointKind::CloudFolder => &[LinkStep::Authorize, LinkStep::FetchAccount],
            EndpointKind::PrintQueue => &[LinkStep::SelectPrinter],
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointKind {
    type Err = UnknownEndpointKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEndpointKind(s.to_string()))
    }
}

/// An outstanding external round trip in a link flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkStep {
    Login,
    OpenSession,
    PublishPermissions,
    SelectAlbum,
    Authorize,
    FetchAccount,
    SelectPrinter,
}

impl LinkStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStep::Login => "login",
            LinkStep::OpenSession => "open_session",
            LinkStep::PublishPermissions => "publish_permissions",
            LinkStep::SelectAlbum => "select_album",
            LinkStep::Authorize => "authorize",
            LinkStep::FetchAccount => "fetch_account",
            LinkStep::SelectPrinter => "select_printer",
        }
    }
}

impl fmt::Display for LinkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown link step: {0}")]
pub struct UnknownLinkStep(String);

impl FromStr for LinkStep {
    type Err = UnknownLinkStep;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointKind::ALL
            .iter()
            .flat_map(|kind| kind.link_steps())
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| UnknownLinkStep(s.to_string()))
    }
}

/// What one link step handed back. Steps fill in different fields; the final
/// step validates the merged result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkGrant {
    pub account_name: Option<String>,
    pub credential: Option<String>,
    pub destination_id: Option<i32>,
    pub destination_description: Option<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl LinkGrant {
    /// Later grants win field by field.
    pub fn merge(mut self, later: LinkGrant) -> LinkGrant {
        if later.account_name.is_some() {
            self.account_name = later.account_name;
        }
        if later.credential.is_some() {
            self.credential = later.credential;
        }
        if later.destination_id.is_some() {
            self.destination_id = later.destination_id;
        }
        if later.destination_description.is_some() {
            self.destination_description = later.destination_description;
        }
        self.settings.extend(later.settings);
        self
    }
}

/// Result of the external round trip reported back by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Granted(LinkGrant),
    Denied(String),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub settings: BTreeMap<String, String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("settings", &self.settings.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedAccount {
    pub account_name: String,
    pub destination: Destination,
    pub destination_description: String,
    pub credential: Credential,
}

impl LinkedAccount {
    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            account_name: self.account_name.clone(),
            destination: self.destination,
            destination_description: self.destination_description.clone(),
        }
    }
}

/// Public view of a link; never carries the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub account_name: String,
    pub destination: Destination,
    pub destination_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Unlinked,
    LinkInProgress(StepId),
    Linked(LinkedAccount),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkEvent {
    pub endpoint_id: i32,
    pub is_linked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareNotification {
    pub id: u64,
    pub destination: Destination,
    pub success_count: u32,
    pub destination_description: String,
    pub title: String,
    pub message: String,
    pub ticker: String,
    pub launch_target: Option<String>,
}
