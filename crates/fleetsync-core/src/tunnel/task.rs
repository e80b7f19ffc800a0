//! Task: one command delivered to one host's agent

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetsync_api::Application;
use fleetsync_api::events::FleetEvent;
use fleetsync_api::requests::{HostEntry, TaskCommandRequest};
use fleetsync_api::responses::{HostResult, TaskCommandResponse, TraceEntry};
use tracing::{debug, info, warn};

use crate::activity::Activity;
use crate::bus::{BusError, Endpoint, topic};
use crate::context::{Context, Kind, Payload, Target};
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::observer::Signal;
use crate::runtime::{LoopEvent, Runtime, TimerId};
use crate::state::{Stage, Status, TaskStage};

/// Code recorded when every agent call attempt failed
pub const CALL_FAILED: i32 = 502;

/// Per-host unit of work inside a transfer
#[derive(Debug, Clone)]
pub struct Task {
    /// Stored id, `None` until the record is persisted
    pub id: Option<ObjectId>,
    pub transfer_id: ObjectId,
    /// Position inside the transfer, the provisional key
    pub index: usize,
    pub host: String,
    pub hostname: String,
    /// Transfer application merged with the host's context
    pub application: Application,
    pub retry: u32,
    pub timeout: u64,
    /// Agent calls re-issued so far
    pub attempts: u32,
    pub retry_timer: Option<TimerId>,
    /// Time of the last status update
    pub timestamp: DateTime<Utc>,
    pub duration: u64,
    pub trace: Vec<TraceEntry>,
}

impl Task {
    #[must_use]
    pub fn new(
        transfer_id: ObjectId,
        index: usize,
        host: &HostEntry,
        application: &Application,
        retry: u32,
        timeout: u64,
    ) -> Self {
        let mut merged = application.clone();
        merged.extend(host.context.clone());

        Self {
            id: None,
            transfer_id,
            index,
            host: host.host.clone(),
            hostname: host.hostname.clone(),
            application: merged,
            retry,
            timeout,
            attempts: 0,
            retry_timer: None,
            timestamp: Utc::now(),
            duration: 0,
            trace: Vec::new(),
        }
    }

    /// Add (or replace) the trace entry for `code`, closing the current interval
    fn step(&mut self, code: i32, duration: u64) {
        let now = Utc::now();
        let duration = if duration == 0 {
            u64::try_from((now - self.timestamp).num_seconds()).unwrap_or_default()
        } else {
            duration
        };

        let entry = TraceEntry {
            code,
            start_time: self.timestamp,
            end_time: now,
            duration,
        };
        match self.trace.iter_mut().find(|e| e.code == code) {
            Some(existing) => *existing = entry,
            None => self.trace.push(entry),
        }
        self.timestamp = now;
    }

    async fn persist(&self, code: i32, message: &str, rt: &Runtime) -> Result<(), CoreError> {
        if let Some(id) = &self.id {
            rt.tunnel_store()?
                .update_task(id, code, message, self.timestamp, self.duration, &self.trace)
                .await?;
        }
        Ok(())
    }

    fn command(&self, code: i32) -> TaskCommandRequest {
        TaskCommandRequest {
            task_id: self.key(),
            transfer_id: self.transfer_id.to_string(),
            application: self.application.clone(),
            code,
            timeout: self.timeout,
            retry: self.retry,
        }
    }

    /// Issue the agent call for the current attempt
    pub fn dial(status: &Status<Self>, rt: &Runtime) -> Result<(), CoreError> {
        let task = &status.activity;
        let payload = serde_json::to_value(task.command(status.code))
            .map_err(|e| CoreError::Bus(e.to_string()))?;
        let transfer = task.transfer_id;
        let key = task.key();

        debug!(transfer = %transfer, task = %key, host = %task.host, attempt = task.attempts, "calling agent");
        rt.call(
            Endpoint::Agent {
                host: task.host.clone(),
            },
            topic::TASK_COMMAND,
            payload,
            move |result| LoopEvent::TaskCalled {
                transfer,
                task: key,
                result,
            },
        );
        Ok(())
    }

    /// Classify the agent's answer to a command
    ///
    /// Returns the stage to enter next, or `None` when the call was
    /// rescheduled or the task no longer waits for it.
    pub fn on_called(
        status: &mut Status<Self>,
        result: Result<TaskCommandResponse, BusError>,
        rt: &mut Runtime,
    ) -> Option<(TaskStage, Context)> {
        if status.state != Some(TaskStage::Sending) {
            debug!(task = %status.activity.key(), state = ?status.state, "late agent reply ignored");
            return None;
        }

        let reason = match result {
            Ok(reply) if reply.code < 400 => {
                let task = &mut status.activity;
                if let Some(timer) = task.retry_timer.take() {
                    rt.cancel(timer);
                }
                task.duration = reply.duration;
                return Some((TaskStage::Sent, Context::default()));
            }
            Ok(reply) if matches!(reply.code, 429 | 503) => {
                format!("agent busy ({}): {}", reply.code, reply.message)
            }
            Ok(reply) => {
                let ctx = Context::forced(status.activity.key(), reply.code, reply.message);
                return Some((TaskStage::Ended, ctx));
            }
            Err(e) if e.is_retryable() => e.to_string(),
            Err(BusError::Remote { code, message }) => {
                let ctx = Context::forced(status.activity.key(), i32::from(code), message);
                return Some((TaskStage::Ended, ctx));
            }
            Err(e) => {
                let message = format!("agent call failed: {e}");
                let ctx = Context::forced(status.activity.key(), CALL_FAILED, message);
                return Some((TaskStage::Ended, ctx));
            }
        };

        let task = &mut status.activity;
        if task.attempts < task.retry {
            task.attempts += 1;
            let key = task.key();
            warn!(
                transfer = %task.transfer_id,
                task = %key,
                attempt = task.attempts,
                retry = task.retry,
                error = %reason,
                "agent call failed, rescheduling"
            );

            let timer = rt.schedule_after(
                Duration::from_secs(task.timeout),
                LoopEvent::TaskRetry {
                    transfer: task.transfer_id,
                    task: key.clone(),
                },
            );
            if let Some(previous) = task.retry_timer.replace(timer) {
                rt.cancel(previous);
            }
            rt.emit(FleetEvent::TaskRetried {
                transfer: task.transfer_id.to_string(),
                task: key,
                attempt: task.attempts,
            });
            None
        } else {
            let message = format!("agent call failed: {reason}");
            Some((
                TaskStage::Ended,
                Context::forced(task.key(), CALL_FAILED, message),
            ))
        }
    }

    /// Re-issue the command after a rescheduled failure
    pub fn redial(status: &mut Status<Self>, rt: &Runtime) -> Result<(), CoreError> {
        status.activity.retry_timer = None;
        if status.state != Some(TaskStage::Sending) {
            return Ok(());
        }
        Self::dial(status, rt)
    }

    /// Outcome of this task as reported in the transfer results
    #[must_use]
    pub fn result(status: &Status<Self>) -> HostResult {
        HostResult {
            host: status.activity.host.clone(),
            code: status.code,
            message: status.message.clone(),
            trace: status.activity.trace.clone(),
        }
    }
}

#[async_trait]
impl Activity for Task {
    type Stage = TaskStage;

    const KIND: Kind = Kind::Task;

    fn key(&self) -> String {
        self.id
            .map_or_else(|| self.index.to_string(), |id| id.to_string())
    }

    fn target(&self) -> Target {
        Target::Task {
            transfer: self.transfer_id,
            key: self.key(),
        }
    }

    async fn create(
        status: &mut Status<Self>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let stage = TaskStage::Created;
        let task = &mut status.activity;
        let host = HostEntry {
            host: task.host.clone(),
            hostname: task.hostname.clone(),
            context: Application::new(),
        };
        let id = rt
            .tunnel_store()?
            .create_task(
                &task.transfer_id,
                &host,
                &task.application,
                task.retry,
                task.timeout,
                stage.code(),
            )
            .await?;

        let provisional = task.target();
        task.id = Some(id);
        task.timestamp = Utc::now();
        status.record_stage(stage, rt);

        let mut created = Context::keyed(id.to_string());
        created.attachment = Some(status.activity.transfer_id);
        created.index = ctx.index.or(Some(status.activity.index));
        rt.fire(Kind::Task, Signal::Created, provisional, created);
        Ok(true)
    }

    async fn send(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let stage = TaskStage::Sending;
        status.activity.step(stage.code(), 0);
        status.activity.persist(stage.code(), stage.message(), rt).await?;
        status.record_stage(stage, rt);
        Self::dial(status, rt)?;
        Ok(true)
    }

    async fn recv(
        status: &mut Status<Self>,
        _ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        if status.code != TaskStage::Sending.code() {
            return Ok(false);
        }

        let stage = TaskStage::Sent;
        let duration = status.activity.duration;
        status.activity.step(stage.code(), duration);
        status.activity.persist(stage.code(), stage.message(), rt).await?;
        status.record_stage(stage, rt);
        Ok(true)
    }

    async fn end(
        status: &mut Status<Self>,
        ctx: &mut Context,
        rt: &mut Runtime,
    ) -> Result<bool, CoreError> {
        let Payload::Report(report) = &ctx.data else {
            return Err(CoreError::Validation(
                "task end requires a completion report".to_string(),
            ));
        };

        if status.state == Some(TaskStage::Ended) {
            debug!(
                task = %status.activity.key(),
                code = report.code,
                "duplicate completion ignored"
            );
            return Ok(false);
        }

        if let Some(timer) = status.activity.retry_timer.take() {
            rt.cancel(timer);
        }

        let task = &mut status.activity;
        if report.duration > 0 {
            task.duration = report.duration;
        }
        task.step(report.code, report.duration);
        task.persist(report.code, &report.message, rt).await?;

        info!(
            transfer = %task.transfer_id,
            task = %task.key(),
            code = report.code,
            "task ended"
        );
        status.record(report.code, report.message.clone(), rt);

        let target = status.activity.target();
        rt.fire(
            Kind::Task,
            Signal::Ended,
            target,
            Context::keyed(status.activity.key()),
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use fleetsync_api::requests::TransferPutRequest;
    use serde_json::json;

    use super::*;

    fn sending() -> Status<Task> {
        let host = HostEntry {
            host: "0000000a-1".to_string(),
            hostname: "edge-01".to_string(),
            context: json!({"port": 8080}).as_object().cloned().unwrap(),
        };
        let application = json!({"cmd": "sync"}).as_object().cloned().unwrap();
        let mut status = Status::new(Task::new(ObjectId::new(), 0, &host, &application, 2, 5));
        status.state = Some(TaskStage::Sending);
        status.code = TaskStage::Sending.code();
        status
    }

    #[test]
    fn test_host_context_is_merged() {
        let status = sending();
        assert_eq!(status.activity.application["cmd"], json!("sync"));
        assert_eq!(status.activity.application["port"], json!(8080));
        assert_eq!(status.activity.key(), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_then_failure() {
        let (mut rt, _rx) = Runtime::detached();
        let mut status = sending();

        for attempt in 1..=2 {
            let next = Task::on_called(
                &mut status,
                Err(BusError::Unreachable("refused".to_string())),
                &mut rt,
            );
            assert!(next.is_none());
            assert_eq!(status.activity.attempts, attempt);
            assert!(status.activity.retry_timer.is_some());
        }

        let (stage, ctx) = Task::on_called(&mut status, Err(BusError::Timeout), &mut rt).unwrap();
        assert_eq!(stage, TaskStage::Ended);
        let Payload::Report(report) = ctx.data else {
            panic!("expected forced report");
        };
        assert_eq!(report.code, CALL_FAILED);
        assert!(report.message.starts_with("agent call failed"));
    }

    #[tokio::test]
    async fn test_reply_classification() {
        let (mut rt, _rx) = Runtime::detached();

        let mut status = sending();
        let ok = TaskCommandResponse {
            code: 200,
            message: String::new(),
            duration: 7,
        };
        let (stage, _) = Task::on_called(&mut status, Ok(ok), &mut rt).unwrap();
        assert_eq!(stage, TaskStage::Sent);
        assert_eq!(status.activity.duration, 7);

        let mut status = sending();
        let missing = TaskCommandResponse {
            code: 404,
            message: "no handler matched".to_string(),
            duration: 0,
        };
        let (stage, ctx) = Task::on_called(&mut status, Ok(missing), &mut rt).unwrap();
        assert_eq!(stage, TaskStage::Ended);
        assert!(matches!(ctx.data, Payload::Report(TransferPutRequest { code: 404, .. })));

        let mut status = sending();
        let busy = TaskCommandResponse {
            code: 503,
            message: "busy".to_string(),
            duration: 0,
        };
        assert!(Task::on_called(&mut status, Ok(busy), &mut rt).is_none());
        assert_eq!(status.activity.attempts, 1);
    }

    #[tokio::test]
    async fn test_end_is_first_wins() {
        let (mut rt, _rx) = Runtime::detached();
        let mut status = sending();

        let mut ctx = Context::forced("0", 200, "done");
        assert!(Task::end(&mut status, &mut ctx, &mut rt).await.unwrap());
        status.state = Some(TaskStage::Ended);
        assert_eq!(status.code, 200);
        assert_eq!(status.activity.trace.last().map(|e| e.code), Some(200));

        let mut late = Context::forced("0", 522, "Timeout");
        assert!(!Task::end(&mut status, &mut late, &mut rt).await.unwrap());
        assert_eq!(status.code, 200);

        let fired = rt.next_fired().unwrap();
        assert_eq!(fired.signal, Signal::Ended);
        assert!(rt.next_fired().is_none());
    }
}
