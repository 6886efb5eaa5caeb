//! Fee structure propagation
//!
//! Applies a class's fee schedule to every enrolled learner's fee lines.
//! Learners are processed with bounded concurrency; a failure for one
//! learner is collected in the report and never aborts the rest of the
//! class. Likewise a class that cannot be read is reported by `apply_all`
//! and the remaining classes still run. Rerunning is safe: a line already in
//! step with its schedule row comes back `Unchanged`.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::fee_line::ScheduleChange;
use crate::models::{Actor, ClassFeeSchedule};
use crate::repository::{FeeLineRepository, FeeScheduleRepository, LearnerDirectory, Stores};

pub const DEFAULT_CONCURRENCY: usize = 8;

/// One learner/schedule pair that could not be written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationFailure {
    pub learner_id: Uuid,
    pub schedule_id: Uuid,
    pub error: String,
}

/// What a propagation run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub class_id: Uuid,
    pub academic_year: i32,
    pub learners: usize,
    pub schedules: usize,
    /// Fee lines created or modified
    pub affected: usize,
    pub created: usize,
    pub updated: usize,
    pub locked: usize,
    pub relinked: usize,
    pub unchanged: usize,
    pub failures: Vec<PropagationFailure>,
    /// The class itself could not be propagated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PropagationReport {
    fn new(class_id: Uuid, academic_year: i32) -> Self {
        Self {
            class_id,
            academic_year,
            ..Default::default()
        }
    }

    fn count(&mut self, change: ScheduleChange) {
        match change {
            ScheduleChange::Created => self.created += 1,
            ScheduleChange::Updated => self.updated += 1,
            ScheduleChange::Locked => self.locked += 1,
            ScheduleChange::Relinked => self.relinked += 1,
            ScheduleChange::Unchanged => self.unchanged += 1,
        }
        if change.is_write() {
            self.affected += 1;
        }
    }

    /// Every learner/schedule pair was written or already current
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct FeeStructurePropagator {
    directory: Arc<dyn LearnerDirectory>,
    schedules: Arc<dyn FeeScheduleRepository>,
    fee_lines: Arc<dyn FeeLineRepository>,
    concurrency: usize,
}

impl FeeStructurePropagator {
    pub fn new(stores: &Stores, concurrency: usize) -> Self {
        Self {
            directory: stores.directory.clone(),
            schedules: stores.schedules.clone(),
            fee_lines: stores.fee_lines.clone(),
            concurrency: concurrency.max(1),
        }
    }

    /// Apply the class/year schedule to every learner enrolled in the class
    pub async fn apply(
        &self,
        class_id: Uuid,
        academic_year: i32,
        actor: &Actor,
    ) -> LedgerResult<PropagationReport> {
        let learners = self
            .directory
            .enrolled_learners(class_id, academic_year)
            .await?;
        self.apply_to(class_id, academic_year, learners, actor).await
    }

    /// A learner joined the school in `class_id`
    pub async fn on_learner_enrolled(
        &self,
        learner_id: Uuid,
        class_id: Uuid,
        academic_year: i32,
        actor: &Actor,
    ) -> LedgerResult<PropagationReport> {
        self.apply_to(class_id, academic_year, vec![learner_id], actor)
            .await
    }

    /// A learner moved classes; only the destination schedule is applied
    pub async fn on_learner_transferred(
        &self,
        learner_id: Uuid,
        to_class_id: Uuid,
        academic_year: i32,
        actor: &Actor,
    ) -> LedgerResult<PropagationReport> {
        self.apply_to(to_class_id, academic_year, vec![learner_id], actor)
            .await
    }

    /// Every class with a schedule for the year, one report per class
    ///
    /// Errs only when the class list itself cannot be read. A class that
    /// fails gets a report carrying the error.
    pub async fn apply_all(
        &self,
        academic_year: i32,
        actor: &Actor,
    ) -> LedgerResult<Vec<PropagationReport>> {
        let classes = self.schedules.scheduled_classes(academic_year).await?;
        let mut reports = Vec::with_capacity(classes.len());
        for class_id in classes {
            match self.apply(class_id, academic_year, actor).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!(
                        class_id = %class_id,
                        academic_year,
                        error = %e,
                        "Fee schedule propagation failed for class"
                    );
                    reports.push(PropagationReport {
                        error: Some(e.to_string()),
                        ..PropagationReport::new(class_id, academic_year)
                    });
                }
            }
        }
        Ok(reports)
    }

    async fn apply_to(
        &self,
        class_id: Uuid,
        academic_year: i32,
        learners: Vec<Uuid>,
        actor: &Actor,
    ) -> LedgerResult<PropagationReport> {
        let schedules = self.schedules.for_class(class_id, academic_year).await?;
        let mut report = PropagationReport::new(class_id, academic_year);
        report.learners = learners.len();
        report.schedules = schedules.len();

        if schedules.is_empty() || learners.is_empty() {
            tracing::info!(
                class_id = %class_id,
                academic_year,
                learners = learners.len(),
                schedules = schedules.len(),
                "Nothing to propagate"
            );
            return Ok(report);
        }

        let schedules = schedules.as_slice();
        let per_learner: Vec<Vec<(Uuid, Uuid, LedgerResult<ScheduleChange>)>> =
            stream::iter(learners)
                .map(move |learner_id| self.sync_learner(learner_id, schedules))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        for (learner_id, schedule_id, result) in per_learner.into_iter().flatten() {
            match result {
                Ok(change) => report.count(change),
                Err(e) => {
                    tracing::warn!(
                        learner_id = %learner_id,
                        schedule_id = %schedule_id,
                        error = %e,
                        "Fee schedule propagation failed for learner"
                    );
                    report.failures.push(PropagationFailure {
                        learner_id,
                        schedule_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            class_id = %class_id,
            academic_year,
            actor = %actor,
            affected = report.affected,
            created = report.created,
            locked = report.locked,
            failures = report.failures.len(),
            "Fee schedule propagated"
        );

        Ok(report)
    }

    async fn sync_learner(
        &self,
        learner_id: Uuid,
        schedules: &[ClassFeeSchedule],
    ) -> Vec<(Uuid, Uuid, LedgerResult<ScheduleChange>)> {
        let mut results = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            let result = self
                .fee_lines
                .sync_from_schedule(learner_id, schedule)
                .await
                .map(|(_, change)| change);
            results.push((learner_id, schedule.id, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fee_line::{FeeStatus, Term};
    use crate::models::FeeFrequency;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_creates_then_unchanged_on_rerun() {
        let store = Arc::new(MemoryStore::default());
        let tuition = store.add_category("TUITION", FeeFrequency::Termly).await;
        let class_id = Uuid::new_v4();
        let learner = store.add_learner(None).await;
        store.enroll(learner, class_id, 2025).await;
        store
            .set_schedule(class_id, tuition.id, Some(Term::Term1), 2025, 10_000)
            .await;
        store
            .set_schedule(class_id, tuition.id, Some(Term::Term2), 2025, 10_000)
            .await;

        let propagator = FeeStructurePropagator::new(&Stores::memory(store.clone()), 4);
        let actor = Actor::staff(None);

        let first = propagator.apply(class_id, 2025, &actor).await.unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.affected, 2);

        let second = propagator.apply(class_id, 2025, &actor).await.unwrap();
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.affected, 0);

        let lines = store.list_for_learner(learner).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.status == FeeStatus::Unpaid));
    }

    #[tokio::test]
    async fn test_yearly_schedule_keys_on_term1() {
        let store = Arc::new(MemoryStore::default());
        let activity = store.add_category("ACTIVITY", FeeFrequency::Yearly).await;
        let class_id = Uuid::new_v4();
        let learner = store.add_learner(None).await;
        store.enroll(learner, class_id, 2025).await;

        // An existing TERM1 line absorbs the untermed schedule row
        let existing = store
            .add_fee_line(learner, activity.id, Some(Term::Term1), 2025, 2_000)
            .await;
        store.set_schedule(class_id, activity.id, None, 2025, 3_000).await;

        let propagator = FeeStructurePropagator::new(&Stores::memory(store.clone()), 1);
        let report = propagator
            .apply(class_id, 2025, &Actor::system("test"))
            .await
            .unwrap();

        assert_eq!(report.updated, 1);
        let lines = store.list_for_learner(learner).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, existing.id);
        assert_eq!(lines[0].amount_due_minor, 3_000);
    }

    #[tokio::test]
    async fn test_transfer_applies_destination_class_only() {
        let store = Arc::new(MemoryStore::default());
        let tuition = store.add_category("TUITION", FeeFrequency::Termly).await;
        let (from_class, to_class) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .set_schedule(from_class, tuition.id, Some(Term::Term1), 2025, 8_000)
            .await;
        store
            .set_schedule(to_class, tuition.id, Some(Term::Term1), 2025, 12_000)
            .await;
        let learner = store.add_learner(None).await;

        let propagator = FeeStructurePropagator::new(&Stores::memory(store.clone()), 2);
        let report = propagator
            .on_learner_transferred(learner, to_class, 2025, &Actor::staff(Some("registrar".into())))
            .await
            .unwrap();

        assert_eq!(report.learners, 1);
        assert_eq!(report.created, 1);
        let lines = store.list_for_learner(learner).await.unwrap();
        assert_eq!(lines[0].amount_due_minor, 12_000);
    }

    #[tokio::test]
    async fn test_failed_class_does_not_stop_other_classes() {
        let store = Arc::new(MemoryStore::default());
        let tuition = store.add_category("TUITION", FeeFrequency::Termly).await;
        let (broken, healthy) = (Uuid::new_v4(), Uuid::new_v4());
        for class_id in [broken, healthy] {
            store
                .set_schedule(class_id, tuition.id, Some(Term::Term1), 2025, 10_000)
                .await;
            let learner = store.add_learner(None).await;
            store.enroll(learner, class_id, 2025).await;
        }
        store.fail_reads_for_class(broken).await;

        let propagator = FeeStructurePropagator::new(&Stores::memory(store.clone()), 2);
        let reports = propagator
            .apply_all(2025, &Actor::system("test"))
            .await
            .unwrap();

        assert_eq!(reports.len(), 2);
        let failed = reports.iter().find(|r| r.class_id == broken).unwrap();
        assert!(!failed.is_complete());
        assert!(failed.error.as_deref().unwrap().contains("injected read failure"));
        assert_eq!(failed.affected, 0);

        let done = reports.iter().find(|r| r.class_id == healthy).unwrap();
        assert!(done.is_complete());
        assert_eq!(done.error, None);
        assert_eq!(done.created, 1);
    }

    #[tokio::test]
    async fn test_no_schedules_is_empty_report() {
        let store = Arc::new(MemoryStore::default());
        let propagator = FeeStructurePropagator::new(&Stores::memory(store.clone()), 0);
        let report = propagator
            .on_learner_enrolled(Uuid::new_v4(), Uuid::new_v4(), 2025, &Actor::system("test"))
            .await
            .unwrap();
        assert_eq!(report.affected, 0);
        assert!(report.is_complete());
    }
}
