use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::loader::{RequestHeaders, SourceLoader};
use crate::playlist::{self, PlaylistError};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    #[error("None of the {total} segments of {url} could be downloaded")]
    NoSegments { url: String, total: usize },

    #[error("Failed to write segment data: {0}")]
    Write(#[from] std::io::Error),

    #[error("Segment download cancelled")]
    Cancelled,
}

/// Ordered segment URLs of one variant.
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    pub variant_url: String,
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub total: usize,
    pub fetched: usize,
    /// Playlist indices of segments that failed and were left out.
    pub dropped: Vec<usize>,
    pub bytes_written: u64,
}

/// Downloads segments in fixed-size concurrent batches and concatenates them
/// in playlist order.
#[derive(Clone)]
pub struct SegmentFetcher {
    loader: Arc<dyn SourceLoader>,
    batch_size: usize,
}

impl SegmentFetcher {
    pub fn new(loader: Arc<dyn SourceLoader>, batch_size: usize) -> Self {
        Self {
            loader,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn plan(
        &self,
        variant_url: &str,
        headers: &RequestHeaders,
    ) -> Result<SegmentPlan, FetchError> {
        let text = self
            .loader
            .load_text(variant_url, headers)
            .await
            .map_err(PlaylistError::from)?;
        let segments = playlist::parse_segments(&text, variant_url)?;
        debug!(variant_url, segments = segments.len(), "Planned segment download");
        Ok(SegmentPlan {
            variant_url: variant_url.to_string(),
            segments,
        })
    }

    /// Starts a batch-by-batch walk over `plan`.
    pub fn cursor(&self, plan: SegmentPlan, headers: RequestHeaders) -> SegmentCursor {
        SegmentCursor {
            loader: Arc::clone(&self.loader),
            batch_size: self.batch_size,
            report: FetchReport {
                total: plan.segments.len(),
                ..Default::default()
            },
            plan,
            headers,
            next: 0,
        }
    }

    /// Writes every fetchable segment of `plan` to `writer`.
    ///
    /// Each batch settles completely before the next starts. Failed segments
    /// are logged and skipped; the call fails only when nothing was fetched.
    pub async fn fetch_into<W>(
        &self,
        plan: &SegmentPlan,
        headers: &RequestHeaders,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<FetchReport, FetchError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut cursor = self.cursor(plan.clone(), headers.clone());
        while let Some(chunk) = cursor.next_batch(cancel).await? {
            for bytes in chunk {
                writer.write_all(&bytes).await?;
            }
        }
        writer.flush().await?;

        let report = cursor.into_report();
        info!(
            variant_url = %plan.variant_url,
            fetched = report.fetched,
            dropped = report.dropped.len(),
            bytes = report.bytes_written,
            "Segment download complete"
        );
        Ok(report)
    }
}

/// Walks a plan one batch at a time, yielding each batch's bodies in playlist
/// order.
pub struct SegmentCursor {
    loader: Arc<dyn SourceLoader>,
    batch_size: usize,
    plan: SegmentPlan,
    headers: RequestHeaders,
    next: usize,
    report: FetchReport,
}

impl SegmentCursor {
    pub fn plan(&self) -> &SegmentPlan {
        &self.plan
    }

    pub fn report(&self) -> &FetchReport {
        &self.report
    }

    pub fn into_report(self) -> FetchReport {
        self.report
    }

    /// Downloads the next batch. Failed segments are skipped, so a batch may
    /// come back empty. Returns `None` once the plan is exhausted, or
    /// `NoSegments` if it was exhausted without a single success.
    pub async fn next_batch(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Bytes>>, FetchError> {
        let total = self.plan.segments.len();
        if self.next >= total {
            if self.report.fetched == 0 {
                return Err(FetchError::NoSegments {
                    url: self.plan.variant_url.clone(),
                    total,
                });
            }
            return Ok(None);
        }

        let offset = self.next;
        let end = (offset + self.batch_size).min(total);
        let batch = &self.plan.segments[offset..end];
        let downloads = batch
            .iter()
            .map(|url| self.loader.load_bytes(url, &self.headers));

        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            results = join_all(downloads) => results,
        };

        let mut fetched = Vec::with_capacity(batch.len());
        for (i, result) in results.into_iter().enumerate() {
            let index = offset + i;
            match result {
                Ok(bytes) => {
                    self.report.fetched += 1;
                    self.report.bytes_written += bytes.len() as u64;
                    fetched.push(bytes);
                }
                Err(e) => {
                    warn!(segment = index, url = %batch[i], error = %e, "Dropping failed segment");
                    self.report.dropped.push(index);
                }
            }
        }
        debug!(offset, fetched = fetched.len(), "Segment batch settled");
        self.next = end;
        Ok(Some(fetched))
    }
}
