//! Transfer: one shard's batch of hosts

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetsync_api::Application;
use fleetsync_api::requests::{HostEntry, TransactionPutRequest, TransferPostRequest};
use fleetsync_api::responses::{HostResult, StatusResponse, TransferView};
use tracing::{debug, error, info, warn};

use crate::activity::Activity;
use crate::bus::{BusError, Endpoint, topic};
use crate::context::{Context, Kind, Payload, Target};
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::registry::Deduplicate;
use crate::runtime::{LoopEvent, Runtime};
use crate::state::{Stage, Status, TaskStage, TransferStage};
use crate::tunnel::task::Task;

/// Code forced onto tasks still outstanding when the transfer watchdog fires
pub const TIMEOUT_CODE: i32 = 522;

/// Fan-out of one host batch into tasks
pub struct Transfer {
    /// Provisional until the record is persisted
    pub id: ObjectId,
    pub transaction_id: String,
    pub hosts: Vec<HostEntry>,
    pub retry: u32,
    pub timeout: u64,
    pub application: Application,
    pub create_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
    /// Tasks by task id (by index until created)
    pub tasks: BTreeMap<String, Status<Task>>,
    /// Tasks whose end was counted
    pub finished: BTreeSet<String>,
    /// Aggregate results, written once the barrier completes
    pub results: Vec<HostResult>,
    /// Finish notifications rescheduled so far
    pub finish_retries: u32,
}

impl Transfer {
    #[must_use]
    pub fn new(request: TransferPostRequest) -> Self {
        let now = Utc::now();
        Self {
            id: ObjectId::new(),
            transaction_id: request.transaction_id,
            hosts: request.hosts,
            retry: request.retry,
            timeout: request.timeout,
            application: request.application,
            create_time: now,
            last_time: now,
            tasks: BTreeMap::new(),
            finished: BTreeSet::new(),
            results: Vec::new(),
            finish_retries: 0,
        }
    }

    fn request(&self) -> TransferPostRequest {
        TransferPostRequest {
            transaction_id: self.transaction_id.clone(),
            hosts: self.hosts.clone(),
            retry: self.retry,
            timeout: self.timeout,
            application: self.application.clone(),
        }
    }

    /// Per-host outcomes in host order
    fn collect_results(&self) -> Vec<HostResult> {
        let mut tasks: Vec<&Status<Task>> = self.tasks.values().collect();
        tasks.sort_by_key(|task| task.activity.index);
        tasks.into_iter().map(Task::result).collect()
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tasks.len() - self.finished.len()
    }

    /// Current view, with live task outcomes until the results are written
    #[must_use]
    pub fn view(status: &Status<Self>) -> TransferView {
        let transfer = &status.activity;
        let results = if transfer.results.is_empty() {
            transfer.collect_results()
        } else {
            transfer.results.clone()
        };

        TransferView {
            transfer_id: transfer.id.to_string(),
            transaction_id: transfer.transaction_id.clone(),
            code: status.code,
            message: status.message.clone(),
            create_time: Some(transfer.create_time),
            last_time: Some(transfer.last_time),
            hosts: transfer.hosts.clone(),
            results,
        }
    }

    /// Fan-in barrier: write the aggregate results and end the transfer
    async fn seal(status: &mut Status<Self>, rt: &mut Runtime) -> Result<bool, CoreError> {
        let stage = TransferStage::Ended;
        let results = status.activity.collect_results();
        rt.tunnel_store()?
            .update_transfer(&status.activity.id, stage.code(), stage.message(), Some(&results))
            .await?;

        info!(
            transfer = %status.activity.id,
            tasks = results.len(),
            "all tasks ended"
        );
        status.activity.results = results;
        status.activity.last_time = Utc::now();
        status.record_stage(stage, rt);
        Ok(true)
    }

    /// Handle the sync side's answer to the finish notification
    ///
    /// Returns the stage to enter next, `None` when the notification was
    /// rescheduled.
    pub async fn on_finish_acked(
        status: &mut Status<Self>,
        result: Result<StatusResponse, BusError>,
        rt: &mut Runtime,
    ) -> Result<Option<TransferStage>, CoreError> {
        if status.state != Some(TransferStage::Finished) {
            return Ok(None);
        }

        match result {
            Ok(_) => {}
            Err(e) if e.is_retryable() && status.activity.finish_retries < status.activity.retry => {
                let transfer = &mut status.activity;
                transfer.finish_retries += 1;
                warn!(
                    transfer = %transfer.id,
                    attempt = transfer.finish_retries,
                    retry = transfer.retry,
                    error = %e,
                    "finish notification failed, rescheduling"
                );
                rt.schedule_after(
                    Duration::from_secs(transfer.timeout),
                    LoopEvent::Advance {
                        target: transfer.target(),
                        code: TransferStage::Finished.code(),
                        ctx: Context::default(),
                    },
                );
                return Ok(None);
            }
            Err(e) => {
                error!(
                    transfer = %status.activity.id,
                    transaction = %status.activity.transaction_id,
                    error = %e,
                    "finish notification not delivered"
                );
            }
        }

        let stage = TransferStage::Finished;
        rt.tunnel_store()?
            .update_transfer(&status.activity.id, stage.code(), stage.message(), None)
            .await?;
        status.record_stage(stage, rt);
        Ok(Some(TransferStage::Deleted))
    }
}

impl Deduplicate<TransferPostRequest> for Status<Transfer> {
    fn same_work(&self, candidate: &TransferPostRequest) -> bool {
        let transfer = &self.activity;
        transfer.transaction_id == candidate.transaction_id
            && transfer.hosts == candidate.hosts
            && transfer.application == candidate.application
            && transfer.retry == candidate.retry
            && transfer.timeout == candidate.timeout
    }
}

#[async_trait]
impl Activity for Transfer {
    type Stage = TransferStage;

    const KIND: Kind = Kind::Transfer;

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn target(&self) -> Target {
        Target::Transfer(self.id)
    }

    async fn create(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let stage = TransferStage::Created;
        let transfer = &mut status.activity;
        let id = rt
            .tunnel_store()?
            .create_transfer(&transfer.request(), stage.code(), stage.message())
            .await?;
        transfer.id = id;

        let manager = rt.services.manager::<Task>()?;
        for (index, host) in transfer.hosts.iter().enumerate() {
            let mut task = Status::new(Task::new(
                id,
                index,
                host,
                &transfer.application,
                transfer.retry,
                transfer.timeout,
            ));
            let mut ctx = Context::child(id, index, Payload::Empty);
            if !manager
                .transition(&mut task, Some(TaskStage::Created), &mut ctx, rt)
                .await
            {
                return Err(CoreError::Conflict(format!(
                    "task {index} of transfer {id} could not be created"
                )));
            }
            transfer.tasks.insert(index.to_string(), task);
        }

        debug!(transfer = %id, tasks = transfer.tasks.len(), "transfer created");
        status.record_stage(stage, rt);
        Ok(true)
    }

    async fn start(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let stage = TransferStage::Started;
        rt.tunnel_store()?
            .update_transfer(&status.activity.id, stage.code(), stage.message(), None)
            .await?;
        status.activity.last_time = Utc::now();
        status.record_stage(stage, rt);

        let manager = rt.services.manager::<Task>()?;
        for task in status.activity.tasks.values_mut() {
            let mut ctx = Context::keyed(task.activity.key());
            manager
                .transition(task, Some(TaskStage::Sending), &mut ctx, rt)
                .await;
        }

        if status.activity.tasks.is_empty() {
            rt.wake(LoopEvent::Advance {
                target: status.activity.target(),
                code: TransferStage::Ended.code(),
                ctx: Context::default(),
            });
        }
        Ok(true)
    }

    async fn end(
        status: &mut Status<Self>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        if let Some(Target::Task { key, .. }) = &ctx.sender {
            let transfer = &mut status.activity;
            if !transfer.tasks.contains_key(key) {
                warn!(transfer = %transfer.id, task = %key, "end from unknown task");
                return Ok(false);
            }
            if !transfer.finished.insert(key.clone()) {
                return Ok(false);
            }
            debug!(
                transfer = %transfer.id,
                task = %key,
                outstanding = transfer.outstanding(),
                "task end counted"
            );
            if transfer.outstanding() > 0 {
                return Ok(false);
            }
            return Self::seal(status, rt).await;
        }

        let manager = rt.services.manager::<Task>()?;
        match &ctx.data {
            Payload::Report(report) => {
                let key = report.task_id.clone();
                let Some(task) = status.activity.tasks.get_mut(&key) else {
                    return Err(CoreError::not_found("task", key));
                };
                manager
                    .transition(task, Some(TaskStage::Ended), ctx, rt)
                    .await;
                Ok(false)
            }
            Payload::Timeout => {
                warn!(
                    transfer = %status.activity.id,
                    outstanding = status.activity.outstanding(),
                    "transfer watchdog fired"
                );
                for (key, task) in &mut status.activity.tasks {
                    if task.state == Some(TaskStage::Ended) {
                        continue;
                    }
                    let mut forced = Context::forced(key.clone(), TIMEOUT_CODE, "Timeout");
                    manager
                        .transition(task, Some(TaskStage::Ended), &mut forced, rt)
                        .await;
                }
                Ok(false)
            }
            _ if status.activity.tasks.is_empty() => Self::seal(status, rt).await,
            _ => Ok(false),
        }
    }

    async fn finish(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let transfer = &status.activity;
        let id = transfer.id;
        let request = TransactionPutRequest {
            transaction_id: transfer.transaction_id.clone(),
            transfer_id: id.to_string(),
        };
        let payload = serde_json::to_value(request).map_err(|e| CoreError::Bus(e.to_string()))?;
        rt.call(Endpoint::Sync, topic::TRANSACTION_PUT, payload, move |result| {
            LoopEvent::FinishAcked {
                transfer: id,
                result,
            }
        });
        Ok(true)
    }

    async fn delete(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        rt.wake(LoopEvent::Retire(status.activity.target()));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn finished(retry: u32, timeout: u64) -> Status<Transfer> {
        let request = TransferPostRequest {
            transaction_id: ObjectId::new().to_string(),
            hosts: vec![HostEntry {
                host: "0000000a-1".to_string(),
                hostname: "edge-01".to_string(),
                context: serde_json::Map::new(),
            }],
            retry,
            timeout,
            application: json!({"cmd": "sync"}).as_object().cloned().unwrap(),
        };
        let mut status = Status::new(Transfer::new(request));
        status.state = Some(TransferStage::Finished);
        status.code = TransferStage::Ended.code();
        status
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_notification_retried_within_budget() {
        let (mut rt, mut rx) = Runtime::detached();
        let mut status = finished(2, 7);

        for attempt in 1..=2 {
            let next = Transfer::on_finish_acked(&mut status, Err(BusError::Timeout), &mut rt)
                .await
                .unwrap();
            assert!(next.is_none());
            assert_eq!(status.activity.finish_retries, attempt);
        }
        assert_eq!(rt.pending_timers(), 2);

        // The budget is spent: the transfer moves on without the acknowledgement
        let next = Transfer::on_finish_acked(&mut status, Err(BusError::Timeout), &mut rt)
            .await
            .unwrap();
        assert_eq!(next, Some(TransferStage::Deleted));
        assert_eq!(status.code, TransferStage::Finished.code());

        // Reschedules wait the transfer's own timeout
        let started = tokio::time::Instant::now();
        let Some(LoopEvent::Timer { event, .. }) = rx.recv().await else {
            panic!("expected timer");
        };
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(7) && waited < Duration::from_secs(8));
        assert!(matches!(
            *event,
            LoopEvent::Advance { code, .. } if code == TransferStage::Finished.code()
        ));
    }

    #[tokio::test]
    async fn test_finish_notification_not_retried_on_remote_rejection() {
        let (mut rt, _rx) = Runtime::detached();
        let mut status = finished(3, 5);

        let rejected = Err(BusError::Remote {
            code: 404,
            message: "unknown transaction".to_string(),
        });
        let next = Transfer::on_finish_acked(&mut status, rejected, &mut rt)
            .await
            .unwrap();
        assert_eq!(next, Some(TransferStage::Deleted));
        assert_eq!(status.activity.finish_retries, 0);
        assert_eq!(rt.pending_timers(), 0);
    }
}
