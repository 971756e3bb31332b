// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JobBlock: rendezvous between job waiters and finishing TreeKeepers.
//!
//! Completions arrive on a priority queue and are always drained before wait
//! requests, so a waiter never misses a job that finished before it arrived.
//! Finished ids are remembered for `done_ttl`; waiters are answered with
//! `released` once their job finishes, or `disconnected` after `wait_timeout`.

use std::collections::HashMap;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span};
use uuid::Uuid;

use crate::config::JobBlockConfig;
use crate::db::Database;
use crate::error::{Result, SomaError};
use crate::handler::{self, Handler, HandlerContext, HandlerKind};
use crate::job::{self, JobStatus};
use crate::msg::{Payload, Request, Response, Status};

/// Spawn JobBlock.
pub fn spawn(ctx: &HandlerContext) -> Handler {
    let token = ctx.root.child_token();
    let (intake, waits) = ctx.request_channel();
    let (notify, done) = mpsc::channel(ctx.config.queue_length);

    let block = JobBlock {
        db: ctx.db.clone(),
        config: ctx.config.job_block.clone(),
        done: HashMap::new(),
        waiters: HashMap::new(),
    };
    let task_token = token.clone();
    let task = tokio::spawn(
        block
            .run(waits, done, task_token)
            .instrument(info_span!("job_block")),
    );

    Handler::new(
        handler::JOB_BLOCK,
        HandlerKind::JobBlock { intake, notify },
        token,
        task,
    )
}

struct Waiter {
    reply: oneshot::Sender<Response>,
    deadline: Instant,
}

struct JobBlock {
    db: Database,
    config: JobBlockConfig,
    /// Finished job ids and when they were reported.
    done: HashMap<Uuid, Instant>,
    waiters: HashMap<Uuid, Vec<Waiter>>,
}

fn released(job_id: Uuid) -> Response {
    Response::ok(json!({ "job_id": job_id, "state": "released" }))
}

fn disconnected(job_id: Uuid) -> Response {
    Response::ok(json!({ "job_id": job_id, "state": "disconnected" }))
}

impl JobBlock {
    async fn run(
        mut self,
        mut waits: mpsc::Receiver<Request>,
        mut done: mpsc::Receiver<Uuid>,
        token: tokio_util::sync::CancellationToken,
    ) {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            wait_timeout_secs = self.config.wait_timeout.as_secs(),
            "JobBlock started"
        );

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                job_id = done.recv() => {
                    let Some(job_id) = job_id else { break };
                    self.finished(job_id);
                }

                request = waits.recv() => {
                    let Some(request) = request else { break };
                    // Completions that raced with this request go first.
                    while let Ok(job_id) = done.try_recv() {
                        self.finished(job_id);
                    }
                    self.wait(request).await;
                }

                _ = tick.tick() => self.expire(Instant::now()),
            }
        }

        waits.close();
        while let Ok(request) = waits.try_recv() {
            request.respond(Response::failure(
                Status::Unavailable,
                "job_block is shutting down",
            ));
        }
        let mut dropped = 0usize;
        for (job_id, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.reply.send(disconnected(job_id));
                dropped += 1;
            }
        }
        info!(disconnected = dropped, "JobBlock stopped");
    }

    fn finished(&mut self, job_id: Uuid) {
        self.done.insert(job_id, Instant::now());
        if let Some(waiters) = self.waiters.remove(&job_id) {
            debug!(job_id = %job_id, waiters = waiters.len(), "Releasing waiters");
            for waiter in waiters {
                let _ = waiter.reply.send(released(job_id));
            }
        }
    }

    async fn wait(&mut self, request: Request) {
        let job_id = match &request.payload {
            Payload::Job(query) => query.job_id,
            _ => None,
        };
        let Some(job_id) = job_id else {
            request.respond_with(Err(SomaError::validation("job id required")));
            return;
        };
        if self.done.contains_key(&job_id) {
            request.respond(released(job_id));
            return;
        }

        // Jobs that finished before JobBlock heard of them.
        match self.stored_finished(job_id).await {
            Ok(true) => {
                self.done.insert(job_id, Instant::now());
                request.respond(released(job_id));
            }
            Ok(false) => {
                let (_, reply) = request.into_parts();
                self.waiters.entry(job_id).or_default().push(Waiter {
                    reply,
                    deadline: Instant::now() + self.config.wait_timeout,
                });
            }
            Err(e) => request.respond_with(Err(e)),
        }
    }

    async fn stored_finished(&self, job_id: Uuid) -> Result<bool> {
        let record = job::get(self.db.pool(), job_id).await?;
        Ok(record.status == JobStatus::Success.as_str() || record.status == JobStatus::Failed.as_str())
    }

    fn expire(&mut self, now: Instant) {
        let ttl = self.config.done_ttl;
        self.done.retain(|_, at| now.duration_since(*at) < ttl);

        let mut timed_out = 0usize;
        self.waiters.retain(|job_id, waiters| {
            let (expired, kept): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|w| w.deadline <= now);
            for waiter in expired {
                let _ = waiter.reply.send(disconnected(*job_id));
                timed_out += 1;
            }
            *waiters = kept;
            !waiters.is_empty()
        });
        if timed_out > 0 {
            debug!(timed_out, "Disconnected waiters");
        }
    }
}
