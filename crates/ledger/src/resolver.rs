//! Payer resolution: phone number to candidate learners

use std::sync::Arc;

use uuid::Uuid;

use crate::error::LedgerResult;
use crate::models::PendingReason;
use crate::phone;
use crate::repository::{AliasRepository, LearnerDirectory};

/// Candidates found for a paying phone number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `None` when the number could not be normalized
    pub normalized_phone: Option<String>,
    /// De-duplicated, in discovery order (guardians, own phone, aliases)
    pub learners: Vec<Uuid>,
    /// Only the alias store knew this number
    pub matched_via_alias: bool,
}

impl Resolution {
    fn unresolved(normalized_phone: Option<String>) -> Self {
        Self {
            normalized_phone,
            learners: Vec::new(),
            matched_via_alias: false,
        }
    }

    /// The learner, when exactly one matched
    pub fn single(&self) -> Option<Uuid> {
        match self.learners.as_slice() {
            [learner] => Some(*learner),
            _ => None,
        }
    }

    /// Pending reason when resolution is not a single learner
    pub fn pending_reason(&self) -> Option<PendingReason> {
        match self.learners.len() {
            0 => Some(PendingReason::NoStudent),
            1 => None,
            _ => Some(PendingReason::MultipleStudents),
        }
    }
}

/// Resolves a phone number against guardians, learners and learned aliases
#[derive(Clone)]
pub struct PayerResolver {
    directory: Arc<dyn LearnerDirectory>,
    aliases: Arc<dyn AliasRepository>,
    country_code: String,
}

impl PayerResolver {
    pub fn new(
        directory: Arc<dyn LearnerDirectory>,
        aliases: Arc<dyn AliasRepository>,
        phone_country_code: &str,
    ) -> Self {
        Self {
            directory,
            aliases,
            country_code: phone_country_code.to_string(),
        }
    }

    pub fn normalize(&self, raw: &str) -> Option<String> {
        phone::normalize(raw, &self.country_code)
    }

    /// Union of every source, exact match on the normalized number only
    pub async fn resolve(&self, raw_phone: &str) -> LedgerResult<Resolution> {
        let Some(normalized) = self.normalize(raw_phone) else {
            tracing::debug!(phone = %raw_phone, "Phone number could not be normalized");
            return Ok(Resolution::unresolved(None));
        };

        let mut learners: Vec<Uuid> = Vec::new();

        push_unique(
            self.directory.learners_by_guardian_phone(&normalized).await?,
            &mut learners,
        );
        push_unique(
            self.directory.learners_by_own_phone(&normalized).await?,
            &mut learners,
        );
        let direct_count = learners.len();

        let aliased = self.aliases.learners_for_phone(&normalized).await?;
        let alias_hit = !aliased.is_empty();
        push_unique(aliased, &mut learners);

        let resolution = Resolution {
            normalized_phone: Some(normalized),
            matched_via_alias: direct_count == 0 && alias_hit,
            learners,
        };

        tracing::debug!(
            phone = ?resolution.normalized_phone,
            candidates = resolution.learners.len(),
            via_alias = resolution.matched_via_alias,
            "Resolved payer"
        );

        Ok(resolution)
    }
}

fn push_unique(ids: Vec<Uuid>, learners: &mut Vec<Uuid>) {
    for id in ids {
        if !learners.contains(&id) {
            learners.push(id);
        }
    }
}
