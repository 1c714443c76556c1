//! Per-cycle share summaries.

use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::LinkError;
use crate::model::{Destination, EndpointKind, ShareNotification};

/// Setting a cloud folder link stores its browsable URL under.
pub const SHARE_URL_SETTING: &str = "share_url";

#[derive(Debug, Default)]
struct DestinationTally {
    successes: u32,
    first_receipt: Option<String>,
}

/// Successful deliveries of one endpoint within a single cycle.
#[derive(Debug)]
pub struct ShareTally {
    kind: EndpointKind,
    destination_description: String,
    share_url: Option<String>,
    entries: BTreeMap<Destination, DestinationTally>,
}

impl ShareTally {
    pub fn new(
        kind: EndpointKind,
        destination_description: impl Into<String>,
        share_url: Option<String>,
    ) -> Self {
        Self {
            kind,
            destination_description: destination_description.into(),
            share_url,
            entries: BTreeMap::new(),
        }
    }

    pub fn record_success(&mut self, destination: Destination, receipt: Option<String>) {
        let entry = self.entries.entry(destination).or_default();
        entry.successes += 1;
        if entry.first_receipt.is_none() {
            entry.first_receipt = receipt;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One notification per destination with at least one success.
    pub fn into_notifications(self) -> Vec<ShareNotification> {
        let ShareTally {
            kind,
            destination_description,
            share_url,
            entries,
        } = self;
        entries
            .into_iter()
            .filter(|(_, tally)| tally.successes > 0)
            .map(|(destination, tally)| {
                let launch_target = match kind {
                    EndpointKind::CloudFolder => share_url.clone(),
                    EndpointKind::SocialAlbum => tally.first_receipt,
                    EndpointKind::PrintQueue => None,
                };
                build(kind, destination, tally.successes, &destination_description, launch_target)
            })
            .collect()
    }
}

fn build(
    kind: EndpointKind,
    destination: Destination,
    success_count: u32,
    destination_description: &str,
    launch_target: Option<String>,
) -> ShareNotification {
    let service = kind.service_name();
    ShareNotification {
        id: destination.hash(),
        destination,
        success_count,
        destination_description: destination_description.to_string(),
        message: message(success_count, destination_description),
        title: format!("Shared to {service}"),
        ticker: format!("Shared to {service}"),
        launch_target,
    }
}

fn message(success_count: u32, destination_description: &str) -> String {
    match success_count {
        1 => format!("1 file shared to {destination_description}"),
        n => format!("{n} files shared to {destination_description}"),
    }
}

/// Merge notifications sharing an id, summing their counts. The first launch
/// target wins. Output is ordered by id.
pub fn coalesce(notifications: impl IntoIterator<Item = ShareNotification>) -> Vec<ShareNotification> {
    let mut merged: BTreeMap<u64, ShareNotification> = BTreeMap::new();
    for notification in notifications {
        match merged.get_mut(&notification.id) {
            Some(existing) => {
                existing.success_count += notification.success_count;
                if existing.launch_target.is_none() {
                    existing.launch_target = notification.launch_target;
                }
                existing.message = message(existing.success_count, &existing.destination_description);
            }
            None => {
                merged.insert(notification.id, notification);
            }
        }
    }
    merged.into_values().collect()
}

/// Presentation side of the pipeline: share summaries and link failures.
pub trait Notifier: Send + Sync {
    fn share_completed(&self, notification: &ShareNotification);
    fn link_failed(&self, kind: EndpointKind, error: &LinkError);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn share_completed(&self, notification: &ShareNotification) {
        info!(
            id = notification.id,
            destination = %notification.destination,
            count = notification.success_count,
            launch_target = notification.launch_target.as_deref().unwrap_or(""),
            "{}: {}",
            notification.title,
            notification.message
        );
    }

    fn link_failed(&self, kind: EndpointKind, error: &LinkError) {
        warn!(%kind, %error, "{}", error.user_message());
    }
}
