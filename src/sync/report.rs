//! Text report summarizing a reconciliation run.

use super::model::{ResourceOperation, SubjectType, SyncResult, SyncStatus, TraceLevel};
use super::resource::ExternalResource;
use std::fmt::Write;

const DRY_RUN_BANNER: &str = "==> Dry run only, no modifications were made <==\n\n";
const INTERRUPTED_BANNER: &str = "==> Execution was interrupted <==\n\n";

const SUBJECT_TYPES: [SubjectType; 3] = [SubjectType::User, SubjectType::Group, SubjectType::AnyObject];

/// Whether the execution of a provisioning run is worth persisting.
pub fn has_to_be_registered(failed: bool, trace_level: TraceLevel) -> bool {
    (failed && trace_level >= TraceLevel::Failures) || trace_level >= TraceLevel::Summary
}

#[derive(Default)]
struct Buckets<'a> {
    created: Vec<&'a SyncResult>,
    created_failed: Vec<&'a SyncResult>,
    updated: Vec<&'a SyncResult>,
    updated_failed: Vec<&'a SyncResult>,
    deleted: Vec<&'a SyncResult>,
    deleted_failed: Vec<&'a SyncResult>,
    no_operation: Vec<&'a SyncResult>,
    /// Failures that never got as far as choosing an operation.
    failed: Vec<&'a SyncResult>,
    ignored: Vec<&'a SyncResult>,
}

impl<'a> Buckets<'a> {
    fn of(results: &'a [SyncResult], subject_type: SubjectType) -> Self {
        let mut buckets = Self::default();
        for result in results.iter().filter(|r| r.subject_type == subject_type) {
            let failed = result.status == SyncStatus::Failure;
            match (result.status, result.operation) {
                (SyncStatus::Ignore, _) => buckets.ignored.push(result),
                (_, ResourceOperation::Create) if failed => buckets.created_failed.push(result),
                (_, ResourceOperation::Create) => buckets.created.push(result),
                (_, ResourceOperation::Update) if failed => buckets.updated_failed.push(result),
                (_, ResourceOperation::Update) => buckets.updated.push(result),
                (_, ResourceOperation::Delete) if failed => buckets.deleted_failed.push(result),
                (_, ResourceOperation::Delete) => buckets.deleted.push(result),
                (_, ResourceOperation::None) if failed => buckets.failed.push(result),
                (_, ResourceOperation::None) => buckets.no_operation.push(result),
            }
        }
        buckets
    }

    fn summary_line(&self, label: &str) -> String {
        let mut line = format!(
            "{} [created/failures]: {}/{} [updated/failures]: {}/{} [deleted/failures]: {}/{} [no operation/ignored]: {}/{}",
            label,
            self.created.len(),
            self.created_failed.len(),
            self.updated.len(),
            self.updated_failed.len(),
            self.deleted.len(),
            self.deleted_failed.len(),
            self.no_operation.len(),
            self.ignored.len()
        );
        if !self.failed.is_empty() {
            let _ = write!(line, " [failed without operation]: {}", self.failed.len());
        }
        line
    }
}

/// One line per result; nothing at `Summary` level.
pub fn generate(results: &[&SyncResult], level: TraceLevel) -> String {
    let mut out = String::new();
    if level == TraceLevel::Summary {
        return out;
    }
    for result in results {
        let key = result.key.as_deref().unwrap_or("");
        if level == TraceLevel::Failures && result.status == SyncStatus::Failure {
            let _ = writeln!(
                out,
                "Failed {} (key/name): {}/{} with message: {}",
                result.operation,
                key,
                result.name,
                result.message.as_deref().unwrap_or("")
            );
        } else {
            let message = result
                .message
                .as_deref()
                .map(|m| format!("with message: {}", m))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{} {} (key/name): {}/{} {}",
                result.operation,
                result.status.as_str(),
                key,
                result.name,
                message
            );
        }
    }
    out
}

fn append_section(report: &mut String, heading: String, results: &[&SyncResult], level: TraceLevel) {
    if !results.is_empty() {
        report.push_str(&heading);
        report.push_str(&generate(results, level));
    }
}

/// Builds the end-of-run report for `resource`. `None` when its trace level
/// suppresses reporting. Only subject types the resource provisions appear.
pub fn create_report(
    results: &[SyncResult],
    resource: &ExternalResource,
    dry_run: bool,
    interrupted: bool,
) -> Option<String> {
    let level = resource.trace_level;
    if level == TraceLevel::None {
        return None;
    }

    let mut report = String::new();
    if dry_run {
        report.push_str(DRY_RUN_BANNER);
    }
    if interrupted {
        report.push_str(INTERRUPTED_BANNER);
    }

    let buckets: Vec<(SubjectType, Buckets)> = SUBJECT_TYPES
        .iter()
        .filter(|t| resource.provision(**t).is_some())
        .map(|t| (*t, Buckets::of(results, *t)))
        .collect();

    for (subject_type, b) in &buckets {
        report.push_str(&b.summary_line(subject_type.report_label()));
        if *subject_type != SubjectType::AnyObject {
            report.push('\n');
        }
    }

    if level == TraceLevel::Failures || level == TraceLevel::All {
        for (subject_type, b) in &buckets {
            let label = subject_type.report_label();
            let lead = if *subject_type == SubjectType::AnyObject { "\n" } else { "\n\n" };
            append_section(&mut report, format!("{}{} failed to create: ", lead, label), &b.created_failed, level);
            append_section(&mut report, format!("\n{} failed to update: ", label), &b.updated_failed, level);
            append_section(&mut report, format!("\n{} failed to delete: ", label), &b.deleted_failed, level);
            append_section(&mut report, format!("\n{} failed: ", label), &b.failed, level);
        }
    }

    if level == TraceLevel::All {
        for (subject_type, b) in &buckets {
            let label = subject_type.report_label();
            append_section(&mut report, format!("\n\n{} created:\n", label), &b.created, level);
            append_section(&mut report, format!("\n{} updated:\n", label), &b.updated, level);
            append_section(&mut report, format!("\n{} deleted:\n", label), &b.deleted, level);
            append_section(&mut report, format!("\n{} no operation:\n", label), &b.no_operation, level);
            append_section(&mut report, format!("\n{} ignored:\n", label), &b.ignored, level);
        }
    }

    Some(report)
}
