//! Job history inspection: which migration job finished successfully last.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobCondition};

/// Condition type a Job reports once it ran to completion.
pub const JOB_COMPLETE: &str = "Complete";
pub const CONDITION_TRUE: &str = "True";

/// Label selector that marks migration jobs as history.
pub const MIGRATION_SELECTOR: &str = "workload-type=db-migration";

/// Selector used to pre-filter jobs before looking for a completion.
/// `MigrationJobSpec::selector` overrides it per spec.
pub fn completion_label_selector() -> &'static str { MIGRATION_SELECTOR }

/// Transition time of a true `Complete` condition; unset times do not count.
fn completion_transition(cond: &JobCondition) -> Option<DateTime<Utc>> {
    if cond.type_ != JOB_COMPLETE || cond.status != CONDITION_TRUE {
        return None;
    }
    cond.last_transition_time.as_ref().map(|t| t.0)
}

fn conditions(job: &Job) -> impl Iterator<Item = &JobCondition> {
    job.status
        .iter()
        .flat_map(|s| s.conditions.iter().flatten())
}

/// Most recent successful completion across `jobs`, by condition transition time.
///
/// Equal timestamps keep the job seen first; callers get whatever order the
/// API returned, so ties are not meaningful.
pub fn latest_successful(jobs: &[Job]) -> Option<&Job> {
    let mut latest: Option<&Job> = None;
    let mut latest_time: Option<DateTime<Utc>> = None;
    for job in jobs {
        for at in conditions(job).filter_map(completion_transition) {
            if latest_time.map_or(true, |t| at > t) {
                latest = Some(job);
                latest_time = Some(at);
            }
        }
    }
    latest
}
