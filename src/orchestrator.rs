//! Nightly fan-out: scan every live schedule, chunk the projections, and
//! publish one queue message per chunk, all under the idempotency lock held
//! in the parameter store.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use crate::config::PipelineConfig;
use crate::models::message::ChunkMessage;
use crate::params::ParamStore;
use crate::queue::{JobQueue, QueueEntry, SEND_BATCH_LIMIT};
use crate::route_store::RouteStore;
use crate::timemath::next_run_delay;
use crate::util::chunk_vec;

const PUBLISH_ATTEMPTS: u32 = 4;

#[derive(Debug, Default)]
pub struct OrchestratorReport {
    /// True when a live lock made this invocation a duplicate.
    pub skipped: bool,
    pub routes: usize,
    pub chunks: usize,
    pub failed_messages: usize,
}

pub fn spawn_orchestrator(
    routes: Arc<RouteStore>,
    queue: Arc<JobQueue>,
    params: Arc<ParamStore>,
    config: PipelineConfig,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(next_run_delay(config.orchestrator_hour_utc, Utc::now())).await;
            match run_orchestration(&routes, &queue, &params, &config, Utc::now()).await {
                Ok(report) if report.skipped => {
                    tracing::info!("orchestrator: duplicate invocation, nothing published")
                }
                Ok(report) => tracing::info!(
                    "orchestrator: {} routes in {} chunks, {} failed messages",
                    report.routes,
                    report.chunks,
                    report.failed_messages,
                ),
                Err(e) => tracing::error!("orchestrator error: {e}"),
            }
        }
    });
}

pub async fn run_orchestration(
    routes: &RouteStore,
    queue: &JobQueue,
    params: &ParamStore,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<OrchestratorReport> {
    let staleness = Duration::minutes(config.lock_staleness_mins);
    if !params.acquire_nightly_lock(now, staleness)? {
        return Ok(OrchestratorReport {
            skipped: true,
            ..Default::default()
        });
    }

    let result = dispatch(routes, queue, config, now).await;

    if let Err(e) = params.release_nightly_lock() {
        tracing::warn!("orchestrator lock release failed (stale semantics cover it): {e}");
    }
    result
}

async fn dispatch(
    routes: &RouteStore,
    queue: &JobQueue,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<OrchestratorReport> {
    let now_epoch = now.timestamp();
    let purged = routes.purge_expired_schedules(now_epoch)?;
    if purged > 0 {
        tracing::debug!("orchestrator: purged {purged} expired schedules");
    }

    // Scan to exhaustion; presence of a schedule is the sole activation signal.
    let mut refs = Vec::new();
    let mut cursor: Option<(String, String)> = None;
    loop {
        let page = routes.scan_schedules_page(
            cursor.as_ref().map(|(u, r)| (u.as_str(), r.as_str())),
            config.scan_page_size,
            now_epoch,
        )?;
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|r| (r.user_id.clone(), r.route_id.clone()));
        refs.extend(page);
    }

    let total_routes = refs.len();
    let chunks = chunk_vec(refs, config.chunk_size);
    let total_chunks = chunks.len();

    let entries: Vec<QueueEntry> = chunks
        .into_iter()
        .enumerate()
        .map(|(chunk_index, routes)| {
            let body = serde_json::to_string(&ChunkMessage { routes })
                .expect("chunk message serialises");
            QueueEntry {
                id: uuid::Uuid::new_v4().to_string(),
                body,
                chunk_index: chunk_index as i64,
                chunk_size: config.chunk_size as i64,
            }
        })
        .collect();

    let mut failed_messages = 0;
    for batch in chunk_vec(entries, SEND_BATCH_LIMIT) {
        let mut pending = batch;
        for attempt in 1..=PUBLISH_ATTEMPTS {
            if pending.is_empty() {
                break;
            }
            if attempt > 1 {
                tokio::time::sleep(StdDuration::from_millis(
                    100 * 2u64.pow(attempt - 2),
                ))
                .await;
            }
            let failed_ids = queue.send_batch(&pending, now_epoch)?;
            pending.retain(|entry| failed_ids.contains(&entry.id));
        }
        if !pending.is_empty() {
            failed_messages += pending.len();
            let ids: Vec<_> = pending.iter().map(|e| e.id.as_str()).collect();
            tracing::warn!(
                "orchestrator: {} messages unpublished after {PUBLISH_ATTEMPTS} attempts: {ids:?}",
                pending.len(),
            );
        }
    }

    Ok(OrchestratorReport {
        skipped: false,
        routes: total_routes,
        chunks: total_chunks,
        failed_messages,
    })
}
