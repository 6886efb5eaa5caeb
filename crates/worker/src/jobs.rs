//! Scheduled job bodies

use schoolpay_ledger::{Actor, FeeStructurePropagator, InvariantChecker, PropagationReport};
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Academic year the nightly propagation targets
///
/// `CURRENT_ACADEMIC_YEAR` wins when set, otherwise the current UTC year.
pub fn academic_year(configured: Option<&str>, now: OffsetDateTime) -> anyhow::Result<i32> {
    match configured.map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<i32>()
            .map_err(|e| anyhow::anyhow!("CURRENT_ACADEMIC_YEAR '{}' is invalid: {}", raw, e)),
        None => Ok(now.year()),
    }
}

/// Totals across the per-class reports of one run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PropagationTotals {
    pub classes: usize,
    pub learners: usize,
    pub affected: usize,
    pub locked: usize,
    pub failures: usize,
    pub failed_classes: usize,
}

pub fn totals(reports: &[PropagationReport]) -> PropagationTotals {
    reports.iter().fold(
        PropagationTotals::default(),
        |mut acc, report| {
            acc.classes += 1;
            acc.learners += report.learners;
            acc.affected += report.affected;
            acc.locked += report.locked;
            acc.failures += report.failures.len();
            acc.failed_classes += usize::from(report.error.is_some());
            acc
        },
    )
}

/// Re-apply every class schedule for the year
///
/// Reruns are no-ops for lines already in step, so this also finishes any
/// rollout that failed part-way.
pub async fn propagate_all(propagator: &FeeStructurePropagator, academic_year: i32) {
    info!(academic_year, "Running scheduled fee structure propagation");

    let actor = Actor::system("nightly-propagation");
    let reports = match propagator.apply_all(academic_year, &actor).await {
        Ok(reports) => reports,
        Err(e) => {
            error!(academic_year, error = %e, "Fee structure propagation failed");
            return;
        }
    };

    for report in reports.iter().filter(|r| !r.is_complete()) {
        if let Some(error) = &report.error {
            warn!(class_id = %report.class_id, error = %error, "Class could not be propagated");
        }
        for failure in &report.failures {
            warn!(
                class_id = %report.class_id,
                learner_id = %failure.learner_id,
                schedule_id = %failure.schedule_id,
                error = %failure.error,
                "Fee line could not be propagated"
            );
        }
    }

    let totals = totals(&reports);
    info!(
        academic_year,
        classes = totals.classes,
        learners = totals.learners,
        affected = totals.affected,
        locked = totals.locked,
        failures = totals.failures,
        failed_classes = totals.failed_classes,
        "Fee structure propagation complete"
    );
}

/// Run the ledger invariant checks and log every violation
pub async fn check_invariants(checker: &InvariantChecker) {
    info!("Running ledger invariant checks");

    match checker.run_all_checks().await {
        Ok(summary) if summary.healthy => {
            info!(checks_run = summary.checks_run, "Ledger invariants hold");
        }
        Ok(summary) => {
            for violation in &summary.violations {
                error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    entity_ids = ?violation.entity_ids,
                    context = %violation.context,
                    "{}",
                    violation.description
                );
            }
            error!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Ledger invariant violations found"
            );
        }
        Err(e) => error!(error = %e, "Ledger invariant checks failed to run"),
    }
}
