use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use futures::stream;
use grab_core::site::ExtractorKind;
use grab_core::{
    Admission, AdmissionControl, EndpointCategory, ExtractContext, ExtractError, Extractor,
    GrabConfig, GrabError, GrantParams, GrantSigner, GrantTarget, LoadError, Orchestrator,
    HeadInfo, RemoteBody, RemoteRoute, RequestHeaders, SourceLoader, StrategySelector,
    VideoCandidate,
};
use tokio_util::sync::CancellationToken;

const MASTER_URL: &str = "https://cdn.mock.com/live/master.m3u8";

const MASTER_PLAYLIST: &str = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080
high/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
mid/index.m3u8
";

const HIGH_PLAYLIST: &str = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:6.0,
seg0.ts
#EXTINF:6.0,
seg1.ts
#EXTINF:6.0,
seg2.ts
#EXTINF:6.0,
seg3.ts
#EXT-X-ENDLIST
";

/// Serves canned bodies and HEAD sizes by URL.
#[derive(Default)]
struct MapLoader {
    bodies: HashMap<String, Bytes>,
    sizes: HashMap<String, u64>,
}

impl MapLoader {
    fn with_body(mut self, url: &str, body: impl Into<Bytes>) -> Self {
        self.bodies.insert(url.to_string(), body.into());
        self
    }

    fn with_size(mut self, url: &str, size: u64) -> Self {
        self.sizes.insert(url.to_string(), size);
        self
    }

    fn lookup(&self, url: &str) -> Result<Bytes, LoadError> {
        self.bodies.get(url).cloned().ok_or_else(|| LoadError::Http {
            url: url.to_string(),
            status: 404,
            message: "HTTP 404".into(),
            is_last_retry: true,
        })
    }
}

#[async_trait]
impl SourceLoader for MapLoader {
    async fn load_text(&self, url: &str, _headers: &RequestHeaders) -> Result<String, LoadError> {
        let body = self.lookup(url)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn load_bytes(&self, url: &str, _headers: &RequestHeaders) -> Result<Bytes, LoadError> {
        self.lookup(url)
    }

    async fn head(&self, url: &str, _headers: &RequestHeaders) -> Result<HeadInfo, LoadError> {
        match self.sizes.get(url) {
            Some(&size) => Ok(HeadInfo {
                content_length: Some(size),
                ..Default::default()
            }),
            None => Err(LoadError::Network {
                url: url.to_string(),
                reason: "connection refused".into(),
                is_last_retry: true,
            }),
        }
    }

    async fn open(&self, url: &str, _headers: &RequestHeaders) -> Result<RemoteBody, LoadError> {
        let body = self.lookup(url)?;
        Ok(RemoteBody {
            content_type: None,
            content_length: Some(body.len() as u64),
            stream: Box::pin(stream::iter(vec![Ok(body)])),
        })
    }
}

struct Scripted {
    kind: ExtractorKind,
    found: Vec<&'static str>,
    fail: bool,
    calls: AtomicUsize,
}

impl Scripted {
    fn failing(kind: ExtractorKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            found: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    fn finding(kind: ExtractorKind, found: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            found,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Extractor for Scripted {
    fn kind(&self) -> ExtractorKind {
        self.kind
    }

    async fn extract(&self, _ctx: &ExtractContext<'_>) -> Result<Vec<VideoCandidate>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ExtractError::Parse {
                what: "player config",
                reason: "missing".into(),
            });
        }
        Ok(self.found.iter().map(|u| VideoCandidate::new(*u)).collect())
    }
}

fn orchestrator(loader: Arc<MapLoader>) -> Orchestrator {
    let spool = std::env::temp_dir().join(format!("grab-pipeline-{}", uuid::Uuid::new_v4()));
    Orchestrator::new(
        GrabConfig::default().with_spool_dir(spool),
        loader,
        GrantSigner::new("pipeline-secret", Duration::from_secs(3600)),
    )
    .with_selector(StrategySelector::new("UA"))
}

fn level_url(level: &str) -> String {
    format!("https://cdn.mock.com/live/{}/index.m3u8", level)
}

fn segment_url(i: usize) -> String {
    format!("https://cdn.mock.com/live/high/seg{}.ts", i)
}

#[tokio::test]
async fn failing_strategy_falls_through_to_next() {
    let script = Scripted::failing(ExtractorKind::PageScript);
    let scan = Scripted::finding(
        ExtractorKind::PageScan,
        vec!["https://cdn.mock.com/a.mp4", "https://cdn.mock.com/b.m3u8"],
    );
    let orch = orchestrator(Arc::new(MapLoader::default())).with_selector(
        StrategySelector::new("UA")
            .with_extractor(script.clone())
            .with_extractor(scan.clone()),
    );

    let result = orch
        .submit("https://videos.mock.com/watch/42", &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.videos.len(), 2);
    assert_eq!(result.strategy.as_deref(), Some("page-scan"));
    assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    assert_eq!(scan.calls.load(Ordering::SeqCst), 1);

    let stored = orch.result(&result.id.to_string()).await.unwrap();
    assert_eq!(stored.videos.len(), 2);
}

#[tokio::test]
async fn every_strategy_failing_names_the_last_one() {
    let orch = orchestrator(Arc::new(MapLoader::default())).with_selector(
        StrategySelector::new("UA")
            .with_extractor(Scripted::failing(ExtractorKind::PageScript))
            .with_extractor(Scripted::failing(ExtractorKind::PageScan)),
    );

    let err = orch
        .submit("https://videos.mock.com/watch/42", &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        GrabError::Upstream {
            url,
            stage,
            strategy,
            message,
        } => {
            assert_eq!(url, "https://videos.mock.com/watch/42");
            assert_eq!(stage, grab_core::Stage::Extraction);
            assert_eq!(strategy.as_deref(), Some("page-scan"));
            assert!(message.contains("player config"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(orch.stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn first_successful_strategy_stops_the_chain() {
    let script = Scripted::finding(ExtractorKind::PageScript, vec!["https://cdn.mock.com/a.mp4"]);
    let scan = Scripted::finding(ExtractorKind::PageScan, vec!["https://cdn.mock.com/b.mp4"]);
    let orch = orchestrator(Arc::new(MapLoader::default())).with_selector(
        StrategySelector::new("UA")
            .with_extractor(script.clone())
            .with_extractor(scan.clone()),
    );

    let result = orch
        .submit("https://videos.mock.com/watch/42", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.strategy.as_deref(), Some("page-script"));
    assert_eq!(scan.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_url_is_rejected_before_any_strategy_runs() {
    let scan = Scripted::finding(ExtractorKind::PageScan, vec!["https://cdn.mock.com/b.mp4"]);
    let orch = orchestrator(Arc::new(MapLoader::default()))
        .with_selector(StrategySelector::new("UA").with_extractor(scan.clone()));

    let err = orch
        .submit("javascript:alert(1)", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GrabError::Validation(_)));
    assert_eq!(scan.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn variants_are_listed_best_first() {
    let loader = Arc::new(MapLoader::default().with_body(MASTER_URL, MASTER_PLAYLIST));
    let orch = orchestrator(loader);

    let listing = orch.proxy_variants(MASTER_URL).await.unwrap();
    assert_eq!(listing.master_url, MASTER_URL);
    let qualities: Vec<_> = listing.streams.iter().map(|s| s.quality.as_str()).collect();
    assert_eq!(qualities, vec!["1080p", "720p", "360p"]);
    assert_eq!(listing.streams[0].url, level_url("high"));
    assert_eq!(listing.streams[0].bandwidth, 5_000_000);
}

#[tokio::test]
async fn playlist_without_streams_is_not_found() {
    let loader = Arc::new(MapLoader::default().with_body(MASTER_URL, "#EXTM3U\n#EXT-X-VERSION:3\n"));
    let orch = orchestrator(loader);

    match orch.proxy_variants(MASTER_URL).await {
        Err(GrabError::NotFound(message)) => assert_eq!(message, "No video streams found"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn stream_concatenates_best_variant_in_order_and_skips_missing() {
    let mut loader = MapLoader::default()
        .with_body(MASTER_URL, MASTER_PLAYLIST)
        .with_body(&level_url("high"), HIGH_PLAYLIST);
    for i in [0, 1, 3] {
        loader = loader.with_body(&segment_url(i), format!("[seg{}]", i));
    }
    let orch = orchestrator(Arc::new(loader));

    let plan = orch.plan_stream(MASTER_URL).await.unwrap();
    assert_eq!(plan.plan.variant_url, level_url("high"));
    assert_eq!(plan.plan.segments.len(), 4);

    let mut out = Vec::new();
    let report = orch
        .stream_segments(&plan, &mut out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "[seg0][seg1][seg3]");
    assert_eq!(report.fetched, 3);
    assert_eq!(report.dropped, vec![2]);
}

#[tokio::test]
async fn stream_with_no_reachable_segments_fails() {
    let loader = MapLoader::default()
        .with_body(MASTER_URL, MASTER_PLAYLIST)
        .with_body(&level_url("high"), HIGH_PLAYLIST);
    let orch = orchestrator(Arc::new(loader));

    let plan = orch.plan_stream(MASTER_URL).await.unwrap();
    let mut out = Vec::new();
    let err = orch
        .stream_segments(&plan, &mut out, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GrabError::Upstream { stage: grab_core::Stage::Segments, .. }));
    assert!(out.is_empty());
}

#[tokio::test]
async fn opened_stream_waits_for_first_fetched_segment() {
    let loader = MapLoader::default()
        .with_body(MASTER_URL, MASTER_PLAYLIST)
        .with_body(&level_url("high"), HIGH_PLAYLIST)
        .with_body(&segment_url(1), "[seg1]")
        .with_body(&segment_url(3), "[seg3]");
    let orch = Orchestrator::new(
        GrabConfig::default().with_segment_batch_size(1),
        Arc::new(loader),
        GrantSigner::new("pipeline-secret", Duration::from_secs(3600)),
    );
    let cancel = CancellationToken::new();

    let plan = orch.plan_stream(MASTER_URL).await.unwrap();
    let mut segments = orch.open_stream(plan);
    assert_eq!(segments.first_chunk(&cancel).await.unwrap(), vec![Bytes::from("[seg1]")]);
    assert!(segments.next_chunk(&cancel).await.unwrap().unwrap().is_empty());
    assert_eq!(
        segments.next_chunk(&cancel).await.unwrap().unwrap(),
        vec![Bytes::from("[seg3]")]
    );
    assert!(segments.next_chunk(&cancel).await.unwrap().is_none());
    assert_eq!(segments.report().dropped, vec![0, 2]);
}

#[tokio::test]
async fn opened_stream_with_no_reachable_segments_fails_before_any_data() {
    let loader = MapLoader::default()
        .with_body(MASTER_URL, MASTER_PLAYLIST)
        .with_body(&level_url("high"), HIGH_PLAYLIST);
    let orch = orchestrator(Arc::new(loader));

    let plan = orch.plan_stream(MASTER_URL).await.unwrap();
    let mut segments = orch.open_stream(plan);
    let err = segments.first_chunk(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, GrabError::Upstream { stage: grab_core::Stage::Segments, .. }));
}

#[tokio::test]
async fn large_remote_file_gets_a_redeemable_grant() {
    let file = "https://media.mock.com/files/archive.bin";
    let loader = Arc::new(
        MapLoader::default()
            .with_size(file, 50 * 1024 * 1024)
            .with_body(file, "payload"),
    );
    let orch = orchestrator(loader);

    let grant = match orch.route_remote(file).await.unwrap() {
        RemoteRoute::Direct(grant) => grant,
        other => panic!("expected a grant, got {other:?}"),
    };
    assert_eq!(grant.filename, "archive.bin");
    assert!(grant.download_url.starts_with("/api/v1/presigned?"));

    let query = grant.download_url.split_once('?').unwrap().1;
    let params: GrantParams = grant_params_from_query(query);
    match orch.redeem(&params).await.unwrap() {
        GrantTarget::Remote { url, size, .. } => {
            assert_eq!(url, file);
            assert_eq!(size, 50 * 1024 * 1024);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn small_remote_file_is_tunneled() {
    let file = "https://media.mock.com/files/notes.txt";
    let loader = Arc::new(MapLoader::default().with_size(file, 2048).with_body(file, "hello"));
    let orch = orchestrator(loader);

    match orch.route_remote(file).await.unwrap() {
        RemoteRoute::Tunnel { url, size, .. } => {
            assert_eq!(url, file);
            assert_eq!(size, 2048);
        }
        other => panic!("expected a tunnel, got {other:?}"),
    }
}

#[tokio::test]
async fn tampered_grant_is_rejected() {
    let orch = orchestrator(Arc::new(MapLoader::default()));
    let grant = orch
        .signer()
        .issue("https://media.mock.com/a.mp4", 100, "media.mock.com");
    let mut params = GrantParams::from(&grant);
    params.size = Some("101".into());
    assert!(matches!(orch.redeem(&params).await, Err(GrabError::InvalidGrant)));
}

#[tokio::test]
async fn admission_window_rejects_then_resets() {
    let admission = AdmissionControl::default();
    let start = Utc::now();

    for i in 0..10 {
        let admitted = admission
            .check_at("10.0.0.1", EndpointCategory::Extraction, start)
            .await;
        assert!(admitted.is_allowed(), "request {} should be admitted", i);
    }
    match admission
        .check_at("10.0.0.1", EndpointCategory::Extraction, start)
        .await
    {
        Admission::Rejected { limit, retry_after_secs, .. } => {
            assert_eq!(limit, 10);
            assert!(retry_after_secs <= 60 && retry_after_secs > 0);
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // other categories and clients keep their own budgets
    assert!(admission
        .check_at("10.0.0.1", EndpointCategory::Results, start)
        .await
        .is_allowed());
    assert!(admission
        .check_at("10.0.0.2", EndpointCategory::Extraction, start)
        .await
        .is_allowed());

    let later = start + TimeDelta::seconds(61);
    assert!(admission
        .check_at("10.0.0.1", EndpointCategory::Extraction, later)
        .await
        .is_allowed());
}

/// Splits a grant query string back into its fields.
fn grant_params_from_query(query: &str) -> GrantParams {
    let pairs: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    GrantParams {
        path: pairs.get("path").cloned(),
        size: pairs.get("size").cloned(),
        domain: pairs.get("domain").cloned(),
        expires: pairs.get("expires").cloned(),
        signature: pairs.get("signature").cloned(),
    }
}
