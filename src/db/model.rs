//! Row views returned by the repository.
//!
//! Keep these structs focused on the data returned by queries. Transitions
//! between link states live in `endpoint`.

use crate::error::Result;
use crate::model::{Credential, Destination, LinkGrant, LinkState, LinkedAccount, StepId};
use std::collections::BTreeMap;

/// Raw `endpoint_links` row. A missing row reads as the default (unlinked).
#[derive(Debug, Clone, Default)]
pub struct LinkRecord {
    pub endpoint_id: i32,
    pub linked: bool,
    pub account_name: Option<String>,
    pub destination_id: Option<i32>,
    pub destination_description: Option<String>,
    pub credential: Option<String>,
    pub settings: Option<String>,
    pub link_step: Option<i64>,
    pub link_draft: Option<String>,
}

impl LinkRecord {
    /// Accumulated grants of an in-progress link flow.
    pub fn draft(&self) -> Result<LinkGrant> {
        match self.link_draft.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(raw)?),
            _ => Ok(LinkGrant::default()),
        }
    }

    pub fn link_state(&self) -> Result<LinkState> {
        if let Some(step) = self.link_step {
            return Ok(LinkState::LinkInProgress(step.clamp(0, StepId::MAX as i64) as StepId));
        }
        if !self.linked {
            return Ok(LinkState::Unlinked);
        }
        // A linked flag without the fields to deliver with is treated as unlinked.
        let (Some(account_name), Some(destination_id), Some(token)) = (
            self.account_name.clone().filter(|s| !s.is_empty()),
            self.destination_id,
            self.credential.clone().filter(|s| !s.is_empty()),
        ) else {
            return Ok(LinkState::Unlinked);
        };
        let settings: BTreeMap<String, String> = match self.settings.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => BTreeMap::new(),
        };
        Ok(LinkState::Linked(LinkedAccount {
            account_name,
            destination: Destination::new(self.endpoint_id, destination_id),
            destination_description: self.destination_description.clone().unwrap_or_default(),
            credential: Credential { token, settings },
        }))
    }
}

/// Row counts per state for one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareCounts {
    pub pending: i64,
    pub processing: i64,
    pub failed: i64,
}

impl ShareCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.failed
    }
}
