//! Fee target selection: which outstanding line a payment settles

use std::sync::Arc;

use uuid::Uuid;

use crate::channels::{AllocationPolicy, ChannelRegistry};
use crate::error::LedgerResult;
use crate::fee_line::FeeLine;
use crate::models::PendingReason;
use crate::repository::{FeeCategoryRepository, FeeLineRepository};

/// Result of target selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelection {
    /// The single line this payment settles
    FeeLine(FeeLine),
    /// No line can take the payment automatically
    Pending(PendingReason),
}

/// Picks one outstanding fee line per payment, oldest first
#[derive(Clone)]
pub struct FeeTargetSelector {
    channels: Arc<ChannelRegistry>,
    categories: Arc<dyn FeeCategoryRepository>,
    fee_lines: Arc<dyn FeeLineRepository>,
}

impl FeeTargetSelector {
    pub fn new(
        channels: Arc<ChannelRegistry>,
        categories: Arc<dyn FeeCategoryRepository>,
        fee_lines: Arc<dyn FeeLineRepository>,
    ) -> Self {
        Self {
            channels,
            categories,
            fee_lines,
        }
    }

    pub async fn select_target(
        &self,
        learner_id: Uuid,
        channel_id: &str,
        bill_reference: &str,
    ) -> LedgerResult<TargetSelection> {
        let Some(policy) = self.channels.policy_for(channel_id, bill_reference) else {
            tracing::info!(
                channel = %channel_id,
                bill_reference = %bill_reference,
                "No allocation policy for channel"
            );
            return Ok(TargetSelection::Pending(PendingReason::Other));
        };

        let filter = match policy {
            AllocationPolicy::Dedicated { category } => match self.category_id(category).await? {
                Some(id) => CategoryFilter::Only(id),
                None => return Ok(TargetSelection::Pending(PendingReason::Other)),
            },
            AllocationPolicy::General { exclude: Some(category) } => {
                match self.category_id(category).await? {
                    Some(id) => CategoryFilter::AllExcept(id),
                    None => return Ok(TargetSelection::Pending(PendingReason::Other)),
                }
            }
            AllocationPolicy::General { exclude: None } => CategoryFilter::Any,
        };

        let mut candidates: Vec<FeeLine> = self
            .fee_lines
            .outstanding_for_learner(learner_id)
            .await?
            .into_iter()
            .filter(|line| line.is_outstanding() && filter.admits(line.category_id))
            .collect();
        candidates.sort_by_key(FeeLine::allocation_key);

        Ok(match candidates.into_iter().next() {
            Some(line) => TargetSelection::FeeLine(line),
            None => TargetSelection::Pending(PendingReason::NoFees),
        })
    }

    async fn category_id(&self, code: &str) -> LedgerResult<Option<Uuid>> {
        let category = self.categories.find_by_code(code).await?;
        if category.is_none() {
            tracing::warn!(category = %code, "Channel policy names an unknown fee category");
        }
        Ok(category.map(|c| c.id))
    }
}

enum CategoryFilter {
    Only(Uuid),
    AllExcept(Uuid),
    Any,
}

impl CategoryFilter {
    fn admits(&self, category_id: Uuid) -> bool {
        match self {
            CategoryFilter::Only(id) => category_id == *id,
            CategoryFilter::AllExcept(id) => category_id != *id,
            CategoryFilter::Any => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee_line::Term;
    use crate::models::FeeFrequency;
    use crate::store::memory::MemoryStore;

    const TABLE: &str = r#"[
        {"channel": "522533", "policy": {"dedicated": {"category": "TRANSPORT"}}},
        {"channel": "522522", "policy": {"general": {"exclude": "TRANSPORT"}}},
        {"channel": "700700", "policy": {"dedicated": {"category": "LIBRARY"}}}
    ]"#;

    fn selector(store: &Arc<MemoryStore>) -> FeeTargetSelector {
        FeeTargetSelector::new(
            Arc::new(ChannelRegistry::from_json(TABLE).unwrap()),
            store.clone(),
            store.clone(),
        )
    }

    #[tokio::test]
    async fn test_general_channel_picks_oldest_outside_excluded_category() {
        let store = Arc::new(MemoryStore::default());
        let tuition = store.add_category("TUITION", FeeFrequency::Termly).await;
        let transport = store.add_category("TRANSPORT", FeeFrequency::Termly).await;
        let learner = store.add_learner(None).await;

        store
            .add_fee_line(learner, transport.id, Some(Term::Term1), 2024, 5_000)
            .await;
        let term2 = store
            .add_fee_line(learner, tuition.id, Some(Term::Term2), 2025, 10_000)
            .await;
        let term1 = store
            .add_fee_line(learner, tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;

        let selection = selector(&store)
            .select_target(learner, "522522", "")
            .await
            .unwrap();
        assert_ne!(selection, TargetSelection::FeeLine(term2));
        assert_eq!(selection, TargetSelection::FeeLine(term1));
    }

    #[tokio::test]
    async fn test_dedicated_channel_only_sees_its_category() {
        let store = Arc::new(MemoryStore::default());
        let tuition = store.add_category("TUITION", FeeFrequency::Termly).await;
        let transport = store.add_category("TRANSPORT", FeeFrequency::Termly).await;
        let learner = store.add_learner(None).await;

        store
            .add_fee_line(learner, tuition.id, Some(Term::Term1), 2024, 10_000)
            .await;
        let bus = store
            .add_fee_line(learner, transport.id, Some(Term::Term3), 2025, 5_000)
            .await;

        let selection = selector(&store)
            .select_target(learner, "522533", "anything")
            .await
            .unwrap();
        assert_eq!(selection, TargetSelection::FeeLine(bus));
    }

    #[tokio::test]
    async fn test_settled_lines_are_skipped() {
        let store = Arc::new(MemoryStore::default());
        let transport = store.add_category("TRANSPORT", FeeFrequency::Termly).await;
        let learner = store.add_learner(None).await;

        let mut paid = store
            .add_fee_line(learner, transport.id, Some(Term::Term1), 2025, 5_000)
            .await;
        paid.amount_paid_minor = 5_000;
        store.insert_fee_line(paid).await;

        let selection = selector(&store)
            .select_target(learner, "522533", "")
            .await
            .unwrap();
        assert_eq!(selection, TargetSelection::Pending(PendingReason::NoFees));
    }

    #[tokio::test]
    async fn test_unknown_channel_or_category_is_other() {
        let store = Arc::new(MemoryStore::default());
        let learner = store.add_learner(None).await;

        let unknown_channel = selector(&store)
            .select_target(learner, "111111", "")
            .await
            .unwrap();
        assert_eq!(unknown_channel, TargetSelection::Pending(PendingReason::Other));

        // LIBRARY is configured on the channel but no such category exists
        let unknown_category = selector(&store)
            .select_target(learner, "700700", "")
            .await
            .unwrap();
        assert_eq!(unknown_category, TargetSelection::Pending(PendingReason::Other));
    }
}
