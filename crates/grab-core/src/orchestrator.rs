//! Request-level glue: validation, strategy selection, persistence and
//! delivery routing.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::GrabConfig;
use crate::delivery::{self, DeliveryMethod, DeliveryRouter, GrantResponse};
use crate::error::{GrabError, Stage};
use crate::extract::{PageScanExtractor, PageScriptExtractor, PlatformExtractor, SessionPool, StrategySelector};
use crate::grant::{GrantParams, GrantSigner};
use crate::loader::{RemoteBody, RequestHeaders, SourceLoader};
use crate::model::{height_from_label, ExtractionRequest, ExtractionResult, RequestStatus};
use crate::playlist::{self, PlaylistError};
use crate::segment::{FetchError, FetchReport, SegmentCursor, SegmentFetcher, SegmentPlan};
use crate::site;
use crate::spool::{ArtifactSpool, SpooledArtifact};
use crate::store::{InMemoryResultStore, ResultStore, StoreStats};
use crate::transcode::{ProgressSink, TranscodeRequest, Transcoder};

/// Route at which grants are redeemed.
pub const PRESIGNED_PATH: &str = "/api/v1/presigned";

/// Grant domain marking artifacts held in the local spool.
pub const LOCAL_DOMAIN: &str = "local";

const SPOOL_PREFIX: &str = "spool/";

/// Response to a submitted extraction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub video_count: usize,
    pub message: String,
}

impl From<&ExtractionResult> for Submission {
    fn from(result: &ExtractionResult) -> Self {
        let message = match result.videos.len() {
            0 => "No videos found on this page".to_string(),
            1 => "Found 1 video".to_string(),
            n => format!("Found {} videos", n),
        };
        Self {
            id: result.id,
            video_count: result.videos.len(),
            message,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertRequest {
    pub url: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
}

#[derive(Debug)]
pub enum ConvertOutcome {
    /// Large artifact, retrievable through the grant.
    Direct(GrantResponse),
    /// Small artifact to stream back in the response. Deleted when dropped.
    Tunnel(SpooledArtifact),
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamEntry {
    pub url: String,
    pub quality: String,
    pub bandwidth: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantListing {
    pub streams: Vec<StreamEntry>,
    pub master_url: String,
}

/// A variant chosen for tunnel streaming, with the headers its origin wants.
#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub plan: SegmentPlan,
    pub headers: RequestHeaders,
}

#[derive(Debug)]
pub enum RemoteRoute {
    Direct(GrantResponse),
    Tunnel {
        url: String,
        headers: RequestHeaders,
        size: u64,
    },
}

/// What a verified grant gives access to.
#[derive(Debug)]
pub enum GrantTarget {
    Local { path: PathBuf, size: u64 },
    Remote {
        url: String,
        headers: RequestHeaders,
        size: u64,
    },
}

/// Segment bodies of one variant, pulled a batch at a time.
pub struct SegmentStream {
    cursor: SegmentCursor,
}

impl SegmentStream {
    pub fn variant_url(&self) -> &str {
        &self.cursor.plan().variant_url
    }

    pub fn report(&self) -> &FetchReport {
        self.cursor.report()
    }

    /// Next batch in playlist order, or `None` once the variant is exhausted.
    pub async fn next_chunk(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Bytes>>, GrabError> {
        self.cursor
            .next_batch(cancel)
            .await
            .map_err(|e| fetch_error(&self.cursor.plan().variant_url, e))
    }

    /// Pulls batches until one carries data. Fails when the variant runs out
    /// first.
    pub async fn first_chunk(&mut self, cancel: &CancellationToken) -> Result<Vec<Bytes>, GrabError> {
        loop {
            match self.next_chunk(cancel).await? {
                Some(chunk) if !chunk.is_empty() => return Ok(chunk),
                Some(_) => continue,
                None => {
                    let err = FetchError::NoSegments {
                        url: self.variant_url().to_string(),
                        total: self.report().total,
                    };
                    return Err(fetch_error(self.variant_url(), err));
                }
            }
        }
    }
}

pub struct Orchestrator {
    config: GrabConfig,
    loader: Arc<dyn SourceLoader>,
    selector: StrategySelector,
    store: Arc<dyn ResultStore>,
    signer: GrantSigner,
    router: DeliveryRouter,
    transcoder: Transcoder,
    fetcher: SegmentFetcher,
    spool: ArtifactSpool,
    public_base_url: String,
}

impl Orchestrator {
    pub fn new(config: GrabConfig, loader: Arc<dyn SourceLoader>, signer: GrantSigner) -> Self {
        let selector = StrategySelector::new(config.user_agent.clone())
            .with_extractor(Arc::new(PlatformExtractor::from_config(&config)))
            .with_extractor(Arc::new(PageScriptExtractor::new(Arc::clone(&loader))))
            .with_extractor(Arc::new(PageScanExtractor::new(
                SessionPool::from_config(&config),
                Arc::clone(&loader),
                config.max_manifest_expansions,
            )));

        Self {
            router: DeliveryRouter::new(config.direct_threshold_bytes),
            transcoder: Transcoder::from_config(&config),
            fetcher: SegmentFetcher::new(Arc::clone(&loader), config.segment_batch_size),
            spool: ArtifactSpool::new(config.spool_dir.clone(), signer.ttl()),
            store: Arc::new(InMemoryResultStore::new()),
            public_base_url: String::new(),
            selector,
            signer,
            loader,
            config,
        }
    }

    pub fn with_selector(mut self, selector: StrategySelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    /// Prefix for grant URLs, e.g. `https://grab.example.com`. Relative when empty.
    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        self.public_base_url = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn config(&self) -> &GrabConfig {
        &self.config
    }

    pub fn signer(&self) -> &GrantSigner {
        &self.signer
    }

    pub fn spool(&self) -> &ArtifactSpool {
        &self.spool
    }

    fn grant_endpoint(&self) -> String {
        format!("{}{}", self.public_base_url, PRESIGNED_PATH)
    }

    /// Accepts absolute http(s) URLs with a host.
    pub fn validate_url(raw: &str) -> Result<Url, GrabError> {
        let url = Url::parse(raw.trim()).map_err(|_| GrabError::validation("Invalid URL provided"))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(GrabError::validation("Invalid URL provided"));
        }
        Ok(url)
    }

    fn validate_manifest_url(raw: &str) -> Result<Url, GrabError> {
        let url = Self::validate_url(raw)?;
        if !playlist::is_manifest_url(url.as_str()) {
            return Err(GrabError::validation(
                "Only HLS streams (.m3u8) can be converted or proxied",
            ));
        }
        Ok(url)
    }

    fn headers_for(&self, url: &Url) -> RequestHeaders {
        site::classify(url).request_headers(&self.config.user_agent, url)
    }

    /// Runs the extraction chain and records the result.
    pub async fn submit(
        &self,
        raw_url: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, GrabError> {
        let url = Self::validate_url(raw_url)?;
        let mut request = ExtractionRequest::new(url.as_str());
        info!(id = %request.id, url = %url, "Extraction submitted");

        let outcome = self.selector.run(&url, cancel).await;

        let failure = if cancel.is_cancelled() {
            Some((
                "Extraction cancelled".to_string(),
                outcome.attempts.last().map(|a| a.strategy),
            ))
        } else {
            outcome.exhausted_failure().map(|a| {
                (
                    format!(
                        "All strategies failed: {}",
                        a.error.as_deref().unwrap_or("unknown error")
                    ),
                    Some(a.strategy),
                )
            })
        };

        let result = match &failure {
            Some((message, strategy)) => {
                request.finish(RequestStatus::Failed);
                let mut result = ExtractionResult::failed(&request, message.as_str());
                result.strategy = strategy.map(str::to_string);
                result
            }
            None => {
                request.finish(RequestStatus::Succeeded);
                ExtractionResult::succeeded(
                    &request,
                    outcome.candidates,
                    outcome.strategy.map(str::to_string),
                )
            }
        };

        if let Err(e) = self.store.insert(result.clone()).await {
            warn!(id = %request.id, error = %e, "Failed to persist extraction result");
        }

        if let Some((message, strategy)) = failure {
            let err = GrabError::upstream(url.as_str(), Stage::Extraction, message);
            return Err(match strategy {
                Some(name) => err.with_strategy(name),
                None => err,
            });
        }
        info!(id = %result.id, videos = result.videos.len(), strategy = ?result.strategy, "Extraction finished");
        Ok(result)
    }

    pub async fn result(&self, id: &str) -> Result<ExtractionResult, GrabError> {
        let id = Uuid::parse_str(id).map_err(|_| GrabError::not_found("Extraction result not found"))?;
        self.store
            .get(&id)
            .await
            .map_err(|e| GrabError::upstream(id.to_string(), Stage::Storage, e))?
            .ok_or_else(|| GrabError::not_found("Extraction result not found"))
    }

    pub async fn stats(&self) -> Result<StoreStats, GrabError> {
        self.store
            .stats()
            .await
            .map_err(|e| GrabError::upstream("", Stage::Storage, e))
    }

    /// Lists a master playlist's variants, best first.
    pub async fn proxy_variants(&self, raw_url: &str) -> Result<VariantListing, GrabError> {
        let url = Self::validate_manifest_url(raw_url)?;
        let headers = self.headers_for(&url);
        let variants = playlist::fetch_variants(self.loader.as_ref(), url.as_str(), &headers)
            .await
            .map_err(|e| playlist_error(url.as_str(), e))?;

        Ok(VariantListing {
            streams: variants
                .iter()
                .map(|v| StreamEntry {
                    url: v.url.clone(),
                    quality: v.quality_label(),
                    bandwidth: v.bandwidth,
                })
                .collect(),
            master_url: url.to_string(),
        })
    }

    /// Picks the best variant of a manifest and resolves its segments.
    pub async fn plan_stream(&self, raw_url: &str) -> Result<StreamPlan, GrabError> {
        let url = Self::validate_manifest_url(raw_url)?;
        let headers = self.headers_for(&url);
        let variants = playlist::fetch_variants(self.loader.as_ref(), url.as_str(), &headers)
            .await
            .map_err(|e| playlist_error(url.as_str(), e))?;
        let best = variants
            .first()
            .ok_or_else(|| GrabError::not_found("No video streams found"))?;

        let plan = self
            .fetcher
            .plan(&best.url, &headers)
            .await
            .map_err(|e| fetch_error(&best.url, e))?;
        Ok(StreamPlan { plan, headers })
    }

    /// Writes a planned stream's segments to `writer` in playlist order.
    pub async fn stream_segments<W>(
        &self,
        stream: &StreamPlan,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<FetchReport, GrabError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.fetcher
            .fetch_into(&stream.plan, &stream.headers, writer, cancel)
            .await
            .map_err(|e| fetch_error(&stream.plan.variant_url, e))
    }

    /// Opens a planned stream for batch-wise delivery.
    pub fn open_stream(&self, stream: StreamPlan) -> SegmentStream {
        SegmentStream {
            cursor: self.fetcher.cursor(stream.plan, stream.headers),
        }
    }

    /// Converts a segmented stream and decides how the artifact is delivered.
    pub async fn convert(
        &self,
        request: &ConvertRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ConvertOutcome, GrabError> {
        self.prune_spool().await;
        let artifact = self.transcode(request, sink, cancel).await?;

        let decision = self.router.decide_by_size(artifact.size());
        match decision.method {
            DeliveryMethod::Tunnel => Ok(ConvertOutcome::Tunnel(artifact)),
            DeliveryMethod::Direct => {
                let size = artifact.size();
                let name = artifact.retain();
                let grant = self
                    .signer
                    .issue(&format!("{}{}", SPOOL_PREFIX, name), size, LOCAL_DOMAIN);
                info!(size, "Conversion delivered through grant");
                Ok(ConvertOutcome::Direct(GrantResponse::new(
                    &grant,
                    &self.grant_endpoint(),
                    "video.mp4",
                )))
            }
        }
    }

    /// Converts a segmented stream into a spooled MP4 without routing it.
    pub async fn transcode(
        &self,
        request: &ConvertRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SpooledArtifact, GrabError> {
        let stream_url = Self::validate_manifest_url(&request.url)?;
        let source_url = match request.source_url.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(Self::validate_url(raw)?),
            None => None,
        };
        let max_height = request.quality.as_deref().and_then(height_from_label);

        let origin = source_url.as_ref().unwrap_or(&stream_url);
        let profile = site::classify(origin);
        let headers = profile.request_headers(&self.config.user_agent, origin);
        info!(
            stream_url = %stream_url,
            profile = profile.name,
            max_height = ?max_height,
            "Conversion requested"
        );

        let transcode = TranscodeRequest {
            stream_url: stream_url.as_str(),
            source_url: source_url.as_ref().map(Url::as_str),
            max_height,
            separate_av: profile.separate_av,
            headers: &headers,
        };
        Ok(self
            .transcoder
            .run(&transcode, &self.spool, sink, cancel)
            .await?)
    }

    /// Reads the headers of a remote file and decides between a grant and a tunnel.
    pub async fn route_remote(&self, raw_url: &str) -> Result<RemoteRoute, GrabError> {
        let url = Self::validate_url(raw_url)?;
        let headers = self.headers_for(&url);
        let info = self
            .loader
            .head(url.as_str(), &headers)
            .await
            .map_err(|e| GrabError::upstream(url.as_str(), Stage::Metadata, e))?;
        let size = self.router.estimate_size(&info);
        let decision = self.router.decide(url.as_str(), size);

        match decision.method {
            DeliveryMethod::Direct => {
                let grant = self
                    .signer
                    .issue(url.as_str(), size, &delivery::extract_domain(url.as_str()));
                Ok(RemoteRoute::Direct(GrantResponse::new(
                    &grant,
                    &self.grant_endpoint(),
                    delivery::file_name_of(url.as_str(), "download"),
                )))
            }
            DeliveryMethod::Tunnel => Ok(RemoteRoute::Tunnel {
                url: url.to_string(),
                headers,
                size,
            }),
        }
    }

    pub async fn open_remote(&self, url: &str, headers: &RequestHeaders) -> Result<RemoteBody, GrabError> {
        self.loader
            .open(url, headers)
            .await
            .map_err(|e| GrabError::upstream(url, Stage::Delivery, e))
    }

    /// Verifies a grant and resolves what it points at. Every failure,
    /// including a missing spooled file, is the same invalid-grant error.
    pub async fn redeem(&self, params: &GrantParams) -> Result<GrantTarget, GrabError> {
        let grant = self.signer.verify(params)?;

        if grant.domain == LOCAL_DOMAIN {
            let name = grant
                .path
                .strip_prefix(SPOOL_PREFIX)
                .ok_or(GrabError::InvalidGrant)?;
            let path = self
                .spool
                .resolve(name, Utc::now().timestamp_millis())
                .ok_or(GrabError::InvalidGrant)?;
            return Ok(GrantTarget::Local {
                path,
                size: grant.size,
            });
        }

        let url = Self::validate_url(&grant.path).map_err(|_| GrabError::InvalidGrant)?;
        if url.host_str() != Some(grant.domain.as_str()) {
            return Err(GrabError::InvalidGrant);
        }
        let headers = RequestHeaders::new(self.config.user_agent.clone())
            .with_referer(site::referer_for_domain(&grant.domain));
        Ok(GrantTarget::Remote {
            url: url.to_string(),
            headers,
            size: grant.size,
        })
    }

    pub async fn prune_spool(&self) -> usize {
        self.spool.prune_expired(Utc::now().timestamp_millis()).await
    }
}

fn playlist_error(url: &str, err: PlaylistError) -> GrabError {
    match err {
        PlaylistError::NotFound { .. } => GrabError::not_found("No video streams found"),
        PlaylistError::InvalidUrl { .. } => GrabError::upstream(url, Stage::Manifest, err),
        PlaylistError::Load(e) => GrabError::upstream(url, Stage::Manifest, e),
    }
}

fn fetch_error(url: &str, err: FetchError) -> GrabError {
    match err {
        FetchError::Playlist(e) => GrabError::upstream(url, Stage::Manifest, e),
        FetchError::NoSegments { .. } => GrabError::upstream(url, Stage::Segments, err),
        FetchError::Write(_) | FetchError::Cancelled => GrabError::upstream(url, Stage::Delivery, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::HttpLoader;
    use std::time::Duration;

    fn orchestrator() -> Orchestrator {
        let spool = std::env::temp_dir().join(format!("grab-orch-test-{}", Uuid::new_v4()));
        let config = GrabConfig::default().with_spool_dir(spool);
        let loader = Arc::new(HttpLoader::new(Duration::from_secs(5), 0, Duration::from_millis(10)));
        Orchestrator::new(config, loader, GrantSigner::new("secret", Duration::from_secs(60)))
            .with_selector(StrategySelector::new("UA"))
            .with_public_base_url("https://grab.example/")
    }

    #[test]
    fn url_validation() {
        assert!(Orchestrator::validate_url("https://a.example/x").is_ok());
        assert!(Orchestrator::validate_url("ftp://a.example/x").is_err());
        assert!(Orchestrator::validate_url("not a url").is_err());
        assert!(Orchestrator::validate_manifest_url("https://a.example/x.mp4").is_err());
    }

    #[tokio::test]
    async fn empty_extraction_is_recorded_and_retrievable() {
        let orch = orchestrator();
        let result = orch
            .submit("https://videos.example.org/v/1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.videos.is_empty());
        assert_eq!(Submission::from(&result).message, "No videos found on this page");

        let stored = orch.result(&result.id.to_string()).await.unwrap();
        assert_eq!(stored.source_url, "https://videos.example.org/v/1");
    }

    #[tokio::test]
    async fn unknown_result_is_not_found() {
        let orch = orchestrator();
        let err = orch.result(&Uuid::new_v4().to_string()).await.unwrap_err();
        assert!(matches!(err, GrabError::NotFound(_)));
        assert!(matches!(orch.result("garbage").await, Err(GrabError::NotFound(_))));
    }

    #[tokio::test]
    async fn remote_grant_redeems_with_site_referer() {
        let orch = orchestrator();
        let grant = orch
            .signer()
            .issue("https://ev.phncdn.com/videos/a.mp4", 20, "ev.phncdn.com");
        match orch.redeem(&GrantParams::from(&grant)).await.unwrap() {
            GrantTarget::Remote { url, headers, size } => {
                assert_eq!(url, "https://ev.phncdn.com/videos/a.mp4");
                assert_eq!(headers.referer.as_deref(), Some("https://www.pornhub.com/"));
                assert_eq!(size, 20);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn grant_with_mismatched_domain_is_rejected() {
        let orch = orchestrator();
        let grant = orch
            .signer()
            .issue("https://internal.example/secret.mp4", 20, "cdn.example");
        assert!(matches!(
            orch.redeem(&GrantParams::from(&grant)).await,
            Err(GrabError::InvalidGrant)
        ));
    }

    #[tokio::test]
    async fn local_grant_for_missing_file_is_rejected() {
        let orch = orchestrator();
        let grant = orch.signer().issue("spool/99999999999999-x.mp4", 20, LOCAL_DOMAIN);
        assert!(matches!(
            orch.redeem(&GrantParams::from(&grant)).await,
            Err(GrabError::InvalidGrant)
        ));
    }

    #[tokio::test]
    async fn convert_rejects_non_manifest() {
        let orch = orchestrator();
        let req = ConvertRequest {
            url: "https://a.example/video.mp4".into(),
            ..Default::default()
        };
        let err = orch
            .convert(&req, &crate::transcode::NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GrabError::Validation(_)));
    }
}
