use crate::core::{Outcome, TerminalCondition};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct IndexMetrics {
    pub(crate) dispatched: Counter,
    pub(crate) queue_full: Counter,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciles: Family<ConditionLabels, Counter>,
    objects: Family<ObjectLabels, Counter>,
    duration: Histogram,
    status_conflicts: Counter,
    status_failures: Counter,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ConditionLabels {
    condition: &'static str,
    reason: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ObjectLabels {
    result: &'static str,
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let dispatched = Counter::default();
        reg.register(
            "dispatched",
            "Count of TemplateInstances handed to the controller",
            dispatched.clone(),
        );

        let queue_full = Counter::default();
        reg.register(
            "queue_full",
            "Count of dispatches deferred because the controller queue was full",
            queue_full.clone(),
        );

        Self {
            dispatched,
            queue_full,
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<ConditionLabels, Counter>::default();
        reg.register(
            "reconciles",
            "Count of TemplateInstances reconciled, by terminal condition",
            reconciles.clone(),
        );

        let objects = Family::<ObjectLabels, Counter>::default();
        reg.register(
            "objects",
            "Count of template objects, by creation result",
            objects.clone(),
        );

        let duration = Histogram::new([0.01, 0.1, 1.0, 10.0, 60.0]);
        reg.register(
            "instantiate_duration_seconds",
            "Time taken to instantiate a template",
            duration.clone(),
        );

        let status_conflicts = Counter::default();
        reg.register(
            "status_conflicts",
            "Count of status writes retried after a conflict",
            status_conflicts.clone(),
        );

        let status_failures = Counter::default();
        reg.register(
            "status_failures",
            "Count of status writes that failed",
            status_failures.clone(),
        );

        Self {
            reconciles,
            objects,
            duration,
            status_conflicts,
            status_failures,
        }
    }

    pub(crate) fn record(
        &self,
        condition: &TerminalCondition,
        outcome: &Outcome,
        elapsed: time::Duration,
    ) {
        self.reconciles
            .get_or_create(&ConditionLabels {
                condition: condition.type_.as_str(),
                reason: condition.reason,
            })
            .inc();
        self.duration.observe(elapsed.as_secs_f64());

        let created = outcome.created().count() as u64;
        let failed = outcome.failures().count() as u64;
        let skipped = outcome.not_attempted() as u64;
        for (result, n) in [("created", created), ("failed", failed), ("skipped", skipped)] {
            if n > 0 {
                self.objects.get_or_create(&ObjectLabels { result }).inc_by(n);
            }
        }
    }

    pub(crate) fn status_conflict(&self) {
        self.status_conflicts.inc();
    }

    pub(crate) fn status_failure(&self) {
        self.status_failures.inc();
    }
}
