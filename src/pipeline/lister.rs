//! Walks the source bucket in key order and admits unsettled keys.

use backon::Retryable as _;
use std::{collections::HashSet, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Admitted, state::{PipelineState, StageCounters}};
use crate::{
    config::RetryPolicy,
    errors::PipelineError,
    services::store::{ListPage, SourceError, SourceStore},
};

const TRACING_TARGET: &str = "cold_archiver::pipeline::lister";

/// What the lister saw.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingSummary {
    pub admitted: u64,
    pub skipped: u64,
    pub complete: bool,
}

pub(crate) struct Lister {
    pub source: Arc<dyn SourceStore>,
    pub prefix: String,
    pub retry: RetryPolicy,
    pub settled: HashSet<String>,
    pub state: Arc<PipelineState>,
    pub drain: CancellationToken,
    pub halt: CancellationToken,
}

impl Lister {
    /// Admit every unsettled key, in order, until the listing ends or a
    /// drain is requested.
    ///
    /// Each admitted key holds one reorder-window permit; the lister blocks
    /// while the window is full.
    pub async fn run(self, tx: flume::Sender<Admitted>) -> Result<ListingSummary, PipelineError> {
        let mut summary = ListingSummary::default();
        let mut token: Option<String> = None;
        let mut previous: Option<String> = None;

        loop {
            let page = tokio::select! {
                biased;
                _ = self.halt.cancelled() => return Ok(summary),
                _ = self.drain.cancelled() => return Ok(self.stopped(summary)),
                page = self.list_page(token.as_deref()) => page?,
            };
            debug!(
                target: TRACING_TARGET,
                keys = page.keys.len(),
                more = page.next_token.is_some(),
                "listed page"
            );

            for key in page.keys {
                if let Some(prev) = &previous {
                    if key.name <= *prev {
                        return Err(PipelineError::ListingOrder {
                            previous: prev.clone(),
                            next: key.name,
                        });
                    }
                }
                previous = Some(key.name.clone());
                StageCounters::bump(&self.state.counters.listed);

                if self.settled.contains(&key.name) {
                    summary.skipped += 1;
                    StageCounters::bump(&self.state.counters.skipped);
                    continue;
                }

                let ticket = tokio::select! {
                    biased;
                    _ = self.halt.cancelled() => return Ok(summary),
                    _ = self.drain.cancelled() => return Ok(self.stopped(summary)),
                    permit = self.state.window.clone().acquire_owned() => {
                        permit.map_err(|_| PipelineError::StageFailed("reorder window"))?
                    }
                };
                let admitted = Admitted {
                    ordinal: summary.admitted,
                    key,
                    ticket,
                };
                let sent = tokio::select! {
                    biased;
                    _ = self.halt.cancelled() => return Ok(summary),
                    _ = self.drain.cancelled() => return Ok(self.stopped(summary)),
                    sent = tx.send_async(admitted) => sent,
                };
                if sent.is_err() {
                    return Err(PipelineError::StageFailed("fetch"));
                }
                summary.admitted += 1;
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        summary.complete = true;
        self.state.mark_listing_complete();
        info!(
            target: TRACING_TARGET,
            admitted = summary.admitted,
            skipped = summary.skipped,
            "listing complete"
        );
        Ok(summary)
    }

    async fn list_page(&self, token: Option<&str>) -> Result<ListPage, PipelineError> {
        let list = || {
            let source = Arc::clone(&self.source);
            let prefix = self.prefix.clone();
            let token = token.map(str::to_string);
            async move { source.list(&prefix, token.as_deref()).await }
        };
        list.retry(self.retry.backoff())
            .when(SourceError::is_transient)
            .notify(|err, delay| {
                warn!(
                    target: TRACING_TARGET,
                    error = %err,
                    retry_in = ?delay,
                    "listing page failed, retrying"
                );
            })
            .await
            .map_err(PipelineError::Listing)
    }

    fn stopped(&self, summary: ListingSummary) -> ListingSummary {
        info!(
            target: TRACING_TARGET,
            admitted = summary.admitted,
            skipped = summary.skipped,
            "drain requested, listing stopped"
        );
        summary
    }
}
