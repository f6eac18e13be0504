//! Dispatch of queued notification tasks.

use crate::job::context::JobContext;
use crate::job::delegate::JobDependencies;
use crate::job::envelope::{JobBody, JobKind};
use crate::job::error::JobError;
use crate::store::NotificationTask;
use std::sync::Arc;
use tracing::{debug, info, warn};

const BATCH_SIZE: usize = 100;

/// Delivers one notification, e.g. by mail.
pub trait NotificationSender: Send + Sync {
    fn send(&self, domain: &str, task: &NotificationTask) -> anyhow::Result<()>;
}

pub struct LogNotificationSender;

impl NotificationSender for LogNotificationSender {
    fn send(&self, domain: &str, task: &NotificationTask) -> anyhow::Result<()> {
        info!(
            "Notification '{}' to {:?} for {} in {}",
            task.subject, task.recipients, task.event, domain
        );
        Ok(())
    }
}

/// Sends every pending notification task of the given domains. Runs on the
/// master domain only.
pub struct NotificationJob {
    deps: Arc<JobDependencies>,
    domains: Vec<String>,
}

impl NotificationJob {
    pub fn new(deps: Arc<JobDependencies>, domains: Vec<String>) -> Self {
        Self { deps, domains }
    }

    fn dispatch(&self, ctx: &JobContext, domain: &str) -> Result<(usize, usize), JobError> {
        let store = &self.deps.store;
        let (mut sent, mut failed) = (0, 0);
        loop {
            let pending = store.pending_notification_tasks(domain, BATCH_SIZE)?;
            if pending.is_empty() {
                break;
            }
            for task in &pending {
                ctx.check_cancelled()?;
                match self.deps.notification_sender.send(domain, task) {
                    Ok(()) => {
                        store.mark_notification_task_executed(task.id, None)?;
                        sent += 1;
                    }
                    Err(e) => {
                        warn!("Could not send notification task {}: {:#}", task.id, e);
                        store.mark_notification_task_executed(task.id, Some(&format!("{e:#}")))?;
                        failed += 1;
                    }
                }
            }
        }
        Ok((sent, failed))
    }
}

impl JobBody for NotificationJob {
    fn kind(&self) -> JobKind {
        JobKind::Notification
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        for domain in &self.domains {
            let (sent, failed) = self.dispatch(ctx, domain)?;
            if sent + failed > 0 {
                info!("Notifications for {}: {} sent, {} failed", domain, sent, failed);
            } else {
                debug!("No pending notifications for {}", domain);
            }
        }
        Ok(())
    }
}
