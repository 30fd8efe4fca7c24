//! One archival pass over an ID range.

use crate::error::{Error, Result};
use crate::retry::retry_delay;
use crate::types::{AbandonedId, Event, FailedId, IdState, ReplayId, RunSummary};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use super::Coordinator;
use super::work_set::WorkSet;
use super::worker::{self, Resolution, WorkerContext};

/// Mutable bookkeeping of an active pass
struct PassState {
    start: ReplayId,
    end: Option<ReplayId>,
    /// Highest ID currently in scope (None until discovery reports one)
    upper: Option<ReplayId>,
    /// Highest ID already checked against the ledger and queued if unresolved
    seeded_through: Option<ReplayId>,
    work: WorkSet,
    summary: RunSummary,
    consecutive_storage_errors: u32,
}

impl PassState {
    fn stopping(&self, cancelled: bool) -> bool {
        cancelled || self.summary.halted.is_some()
    }

    /// First in-scope ID not yet seeded, if any remain
    fn next_unseeded(&self) -> Option<ReplayId> {
        let next = match self.seeded_through {
            Some(seeded) => ReplayId(seeded.0.checked_add(1)?),
            None => self.start,
        };
        (next <= self.upper?).then_some(next)
    }

    /// Upper end of the seeded prefix of `[start, upper]`
    fn seeded_end(&self) -> Option<ReplayId> {
        let seeded = self.seeded_through?;
        Some(self.upper.map_or(seeded, |upper| seeded.min(upper)))
    }
}

/// IDs checked against the ledger per seeding query
fn seed_chunk(concurrency: usize) -> u64 {
    (concurrency as u64).saturating_mul(16).max(256)
}

/// Clamp a discovered bound to the requested range
fn effective_upper(
    start: ReplayId,
    end: Option<ReplayId>,
    discovered: Option<ReplayId>,
) -> Option<ReplayId> {
    let upper = match (end, discovered) {
        (Some(end), Some(found)) => end.min(found),
        (Some(end), None) => end,
        (None, found) => found?,
    };
    (upper >= start).then_some(upper)
}

impl Coordinator {
    /// Archive every unresolved ID in `start..=end`
    ///
    /// With `end == None` the pass runs up to whatever the discovery collaborator
    /// reports, re-querying it every `rediscover_interval`. IDs already in the
    /// ledger are skipped; tombstones older than `tombstone_cooldown` are
    /// retried. Once the queue drains, discovery is asked one last time and the
    /// pass ends when it reports nothing new. The returned summary accounts for
    /// every ID in scope, including those never reached.
    ///
    /// # Errors
    ///
    /// Startup failures (invalid range, ledger or blob store unavailable,
    /// discovery failure) abort before any fetch is dispatched. Failures after
    /// dispatch are reported in the summary instead.
    pub async fn run(&self, start: ReplayId, end: Option<ReplayId>) -> Result<RunSummary> {
        if let Some(end) = end
            && end < start
        {
            return Err(Error::InvalidRange {
                start: start.0,
                end: end.0,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        if self.db.was_unclean_shutdown().await? {
            tracing::warn!("Previous run did not shut down cleanly, sweeping staging files");
        }
        self.blobs.sweep_temp().await?;
        self.db.set_clean_start().await?;

        let discovered = self
            .discovery
            .upper_bound()
            .await
            .map_err(|e| Error::Discovery(format!("initial upper bound query failed: {}", e)))?;

        let mut pass = PassState {
            start,
            end,
            upper: effective_upper(start, end, discovered),
            seeded_through: None,
            work: WorkSet::new(),
            summary: RunSummary {
                start: start.0,
                ..RunSummary::default()
            },
            consecutive_storage_errors: 0,
        };

        let queued = self.top_up(&mut pass).await?;

        tracing::info!(
            start = start.0,
            end = ?pass.upper.map(|u| u.0),
            queued,
            concurrency = self.config.archive.concurrency,
            "Starting archival pass"
        );
        self.emit(Event::RunStarted {
            start: start.0,
            end: pass.upper.map(|u| u.0),
            queued,
        });

        self.drive(&mut pass).await;

        let not_attempted = pass.work.pending() as u64 + self.unseeded_unresolved(&pass).await;
        let mut summary = pass.summary;
        summary.end = pass.upper.map(|u| u.0);
        summary.not_attempted = not_attempted;
        summary.cancelled = self.cancel.is_cancelled();
        summary.abandoned.sort_by_key(|a| a.id);
        summary.storage_errors.sort_by_key(|f| f.id);
        summary.interrupted.sort();

        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in ledger");
        }

        tracing::info!(
            succeeded = summary.succeeded,
            tombstoned = summary.tombstoned,
            deduplicated = summary.deduplicated,
            abandoned = summary.abandoned.len(),
            storage_errors = summary.storage_errors.len(),
            interrupted = summary.interrupted.len(),
            not_attempted = summary.not_attempted,
            halted = summary.halted.is_some(),
            cancelled = summary.cancelled,
            "Archival pass finished"
        );
        self.emit(Event::RunFinished {
            summary: summary.clone(),
        });

        Ok(summary)
    }

    /// Queue the next unseeded IDs until enough work is waiting
    ///
    /// The range is walked in chunks so the queue stays proportional to the
    /// worker count rather than to the size of `[start, upper]`. Each chunk
    /// queues its unresolved IDs plus tombstones whose cooldown has expired.
    async fn top_up(&self, pass: &mut PassState) -> Result<usize> {
        let concurrency = self.config.archive.concurrency;
        let target = concurrency.saturating_mul(2);
        let chunk = seed_chunk(concurrency);
        let mut queued = 0;

        while pass.work.pending() < target {
            let (Some(next), Some(upper)) = (pass.next_unseeded(), pass.upper) else {
                break;
            };
            let chunk_end = ReplayId(next.0.saturating_add(chunk - 1).min(upper.0));

            let now = Instant::now();
            let resolved = self.db.resolved_ids_in(next, chunk_end).await?;
            for raw in next.0..=chunk_end.0 {
                let id = ReplayId(raw);
                if !resolved.contains(&id) && pass.work.enqueue_new(id, now) {
                    queued += 1;
                }
            }
            queued += self.enqueue_expired_tombstones(pass, next, chunk_end, now).await?;

            pass.seeded_through = Some(chunk_end);
        }

        Ok(queued)
    }

    async fn enqueue_expired_tombstones(
        &self,
        pass: &mut PassState,
        from: ReplayId,
        to: ReplayId,
        now: Instant,
    ) -> Result<usize> {
        let Some(cooldown) = self.config.archive.tombstone_cooldown else {
            return Ok(0);
        };

        let due = self
            .db
            .tombstones_eligible_for_retry(from, to, chrono::Utc::now(), cooldown)
            .await?;

        let mut queued = 0;
        for id in due {
            if pass.work.enqueue_new(id, now) {
                tracing::debug!(replay_id = id.0, "Tombstone cooldown expired, retrying");
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// In-scope IDs never seeded that the ledger has not resolved yet
    async fn unseeded_unresolved(&self, pass: &PassState) -> u64 {
        let (Some(next), Some(upper)) = (pass.next_unseeded(), pass.upper) else {
            return 0;
        };
        let span = (upper.0 - next.0).saturating_add(1);

        match self.db.count_resolved_in(next, upper).await {
            Ok(resolved) => span.saturating_sub(resolved),
            Err(e) => {
                tracing::warn!(error = %e, "Could not count resolved IDs, reporting the whole remainder");
                span
            }
        }
    }

    /// Dispatch loop: runs until the queue drains, the pass halts, or shutdown
    async fn drive(&self, pass: &mut PassState) {
        let concurrency = self.config.archive.concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<(ReplayId, u32, Resolution)> = JoinSet::new();
        let ctx = WorkerContext {
            db: self.db.clone(),
            blobs: self.blobs.clone(),
            fetcher: self.fetcher.clone(),
            limiter: self.limiter.clone(),
            cancel: self.cancel.clone(),
        };

        let period = self.config.archive.rediscover_interval;
        let mut rediscover = tokio::time::interval_at(Instant::now() + period, period);
        rediscover.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancel_seen = false;

        loop {
            let mut stopping = pass.stopping(self.cancel.is_cancelled());

            if !stopping && let Err(e) = self.top_up(pass).await {
                let reason = format!("ledger unavailable while seeding: {}", e);
                tracing::error!(reason = %reason, "Halting archival pass");
                pass.summary.halted = Some(reason);
                stopping = true;
            }

            if !stopping {
                let now = Instant::now();
                while let Ok(permit) = semaphore.clone().try_acquire_owned() {
                    let Some(item) = pass.work.pop_ready(now) else {
                        break;
                    };
                    let ctx = ctx.clone();
                    let attempt = item.attempts + 1;
                    tasks.spawn(async move {
                        let _permit = permit;
                        let resolution = AssertUnwindSafe(worker::process(&ctx, item.id))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| Resolution::StorageFailed {
                                error: format!("worker panicked: {}", panic_message(&*panic)),
                            });
                        (item.id, attempt, resolution)
                    });
                }
            }

            if tasks.is_empty() && pass.work.is_empty() && !stopping {
                // Drained: ask discovery once more before declaring the pass done
                if self.rediscover(pass).await {
                    continue;
                }
                break;
            }
            if tasks.is_empty() && stopping {
                break;
            }

            // Only wake for a backoff deadline if a worker slot is free to take it
            let wake_at = if stopping || semaphore.available_permits() == 0 {
                None
            } else {
                pass.work.next_ready_at()
            };

            tokio::select! {
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    tracing::info!(in_flight = tasks.len(), "Shutdown requested, draining in-flight work");
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok((id, attempt, resolution)) => self.resolve(pass, id, attempt, resolution),
                    Err(e) => tracing::error!(error = %e, "Worker task failed to join"),
                },
                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {}
                _ = rediscover.tick(), if !stopping => {
                    self.rediscover(pass).await;
                }
                else => break,
            }
        }
    }

    /// Fold one worker resolution into the pass state
    fn resolve(&self, pass: &mut PassState, id: ReplayId, attempt: u32, resolution: Resolution) {
        match resolution {
            Resolution::Archived {
                local_id,
                sha256,
                size_bytes,
                deduplicated,
            } => {
                pass.work.transition(id, IdState::Succeeded);
                pass.consecutive_storage_errors = 0;
                pass.summary.succeeded += 1;
                pass.summary.bytes_archived += size_bytes;
                if deduplicated {
                    pass.summary.deduplicated += 1;
                }
                tracing::info!(
                    replay_id = id.0,
                    sha256 = %sha256,
                    size = size_bytes,
                    deduplicated,
                    "Archived replay"
                );
                self.emit(Event::Archived {
                    id,
                    local_id,
                    sha256,
                    size_bytes,
                    deduplicated,
                });
            }
            Resolution::Tombstoned { local_id, status } => {
                pass.work.transition(id, IdState::Tombstoned);
                pass.consecutive_storage_errors = 0;
                pass.summary.tombstoned += 1;
                tracing::info!(replay_id = id.0, status, "Replay absent, tombstoned");
                self.emit(Event::Tombstoned { id, local_id });
            }
            Resolution::Transient { reason } => {
                pass.work.transition(id, IdState::Retryable);
                let max_attempts = self.config.retry.max_attempts;

                if attempt >= max_attempts {
                    pass.work.transition(id, IdState::Abandoned);
                    tracing::warn!(
                        replay_id = id.0,
                        attempts = attempt,
                        reason = %reason,
                        "Giving up on replay after repeated transient failures"
                    );
                    self.emit(Event::Abandoned {
                        id,
                        attempts: attempt,
                        reason: reason.clone(),
                    });
                    pass.summary.abandoned.push(AbandonedId {
                        id,
                        attempts: attempt,
                        last_error: reason,
                    });
                    return;
                }

                let delay = retry_delay(&self.config.retry, attempt);
                tracing::warn!(
                    replay_id = id.0,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient failure, retrying"
                );
                self.emit(Event::RetryScheduled {
                    id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason,
                });
                pass.work.requeue(id, attempt, Instant::now() + delay);
            }
            Resolution::StorageFailed { error } => {
                pass.work.transition(id, IdState::StorageFailed);
                pass.consecutive_storage_errors += 1;
                tracing::error!(
                    replay_id = id.0,
                    error = %error,
                    consecutive = pass.consecutive_storage_errors,
                    "Storage failure, replay not recorded"
                );
                self.emit(Event::StorageFailed {
                    id,
                    error: error.clone(),
                });

                let threshold = self.config.archive.max_consecutive_storage_errors;
                if pass.consecutive_storage_errors >= threshold && pass.summary.halted.is_none() {
                    let reason = format!(
                        "{} consecutive storage errors, last: {}",
                        pass.consecutive_storage_errors, error
                    );
                    tracing::error!(reason = %reason, "Halting archival pass");
                    pass.summary.halted = Some(reason);
                }
                pass.summary.storage_errors.push(FailedId { id, error });
            }
            Resolution::Interrupted => {
                pass.work.transition(id, IdState::Interrupted);
                pass.summary.interrupted.push(id);
            }
        }
    }

    /// Re-query discovery, raise the upper bound and queue tombstones now due
    ///
    /// Newly visible IDs are queued lazily by the next top-up. Returns whether
    /// the pass gained work: a higher bound or a tombstone whose cooldown ran out.
    async fn rediscover(&self, pass: &mut PassState) -> bool {
        let discovered = match self.discovery.upper_bound().await {
            Ok(bound) => bound,
            Err(e) => {
                tracing::warn!(error = %e, "Rediscovery failed, keeping current upper bound");
                return false;
            }
        };

        let mut progressed = false;
        let new_upper = effective_upper(pass.start, pass.end, discovered);

        if let Some(current) = new_upper
            && pass.upper.is_none_or(|previous| current > previous)
        {
            tracing::info!(
                previous = ?pass.upper.map(|u| u.0),
                current = current.0,
                "Upper bound grew"
            );
            self.emit(Event::UpperBoundChanged {
                previous: pass.upper.map(|u| u.0),
                current: current.0,
            });
            pass.upper = Some(current);
            progressed = true;
        }

        if let Some(seeded_end) = pass.seeded_end() {
            match self
                .enqueue_expired_tombstones(pass, pass.start, seeded_end, Instant::now())
                .await
            {
                Ok(queued) => progressed |= queued > 0,
                Err(e) => tracing::warn!(error = %e, "Could not check tombstone cooldowns"),
            }
        }

        progressed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_upper_clamps_to_requested_end() {
        let start = ReplayId(0);
        assert_eq!(
            effective_upper(start, Some(ReplayId(10)), Some(ReplayId(50))),
            Some(ReplayId(10))
        );
        assert_eq!(
            effective_upper(start, Some(ReplayId(10)), Some(ReplayId(5))),
            Some(ReplayId(5))
        );
        assert_eq!(
            effective_upper(start, Some(ReplayId(10)), None),
            Some(ReplayId(10))
        );
        assert_eq!(effective_upper(start, None, Some(ReplayId(7))), Some(ReplayId(7)));
        assert_eq!(effective_upper(start, None, None), None);
    }

    #[test]
    fn effective_upper_below_start_is_empty() {
        assert_eq!(
            effective_upper(ReplayId(100), None, Some(ReplayId(50))),
            None
        );
    }

    #[test]
    fn panic_message_extracts_strings() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }
}
