#![deny(unsafe_code)]

pub mod config;
pub mod delivery;
pub mod error;
pub mod extract;
pub mod grant;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod playlist;
pub mod ratelimit;
pub mod segment;
pub mod site;
pub mod spool;
pub mod store;
pub mod transcode;

pub use config::GrabConfig;
pub use delivery::{DeliveryMethod, DeliveryRouter, GrantResponse, RouteDecision, RouteReason};
pub use error::{ErrorKind, GrabError, Stage};
pub use extract::{ExtractContext, ExtractError, Extractor, StrategyOutcome, StrategySelector};
pub use grant::{GrantError, GrantParams, GrantSigner, PresignedGrant, VerifiedGrant};
pub use loader::{HttpLoader, LoadError, HeadInfo, RemoteBody, RequestHeaders, SourceLoader};
pub use model::{ExtractionRequest, ExtractionResult, RequestStatus, VideoCandidate};
pub use orchestrator::{
    ConvertOutcome, ConvertRequest, GrantTarget, Orchestrator, RemoteRoute, SegmentStream,
    StreamEntry, StreamPlan, Submission, VariantListing,
};
pub use playlist::{PlaylistError, VariantDescriptor};
pub use ratelimit::{
    Admission, AdmissionControl, Budget, CounterStore, EndpointCategory, InMemoryCounterStore,
    RateLimitPolicy,
};
pub use segment::{FetchError, FetchReport, SegmentCursor, SegmentFetcher, SegmentPlan};
pub use site::{SiteCategory, SiteProfile};
pub use spool::{ArtifactSpool, SpooledArtifact};
pub use store::{InMemoryResultStore, ResultStore, StoreError, StoreStats};
pub use transcode::{NoProgress, ProgressSink, TranscodeError, Transcoder};
