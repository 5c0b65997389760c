use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{ExtractContext, Extractor};
use crate::model::VideoCandidate;
use crate::site::{self, ExtractorKind, SiteProfile};

/// Record of one strategy run, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub strategy: &'static str,
    pub found: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub profile: &'static SiteProfile,
    pub candidates: Vec<VideoCandidate>,
    /// Strategy that produced the candidates. `None` when every strategy came up empty.
    pub strategy: Option<&'static str>,
    pub attempts: Vec<Attempt>,
}

impl StrategyOutcome {
    /// The last attempt, when every strategy that ran failed outright. A
    /// strategy that ran cleanly and found nothing makes this `None`.
    pub fn exhausted_failure(&self) -> Option<&Attempt> {
        if self.attempts.iter().any(|a| a.error.is_none()) {
            return None;
        }
        self.attempts.last()
    }
}

/// Runs a site profile's extractor chain until one capability finds something.
#[derive(Clone, Default)]
pub struct StrategySelector {
    extractors: HashMap<ExtractorKind, Arc<dyn Extractor>>,
    user_agent: String,
}

impl StrategySelector {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            extractors: HashMap::new(),
            user_agent: user_agent.into(),
        }
    }

    /// Registers an implementation, replacing any earlier one of the same kind.
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.insert(extractor.kind(), extractor);
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn run(&self, url: &Url, cancel: &CancellationToken) -> StrategyOutcome {
        let profile = site::classify(url);
        let headers = profile.request_headers(&self.user_agent, url);
        let ctx = ExtractContext {
            url,
            profile,
            headers: &headers,
            cancel,
        };
        debug!(url = %url, profile = profile.name, "Classified source");

        let mut attempts = Vec::new();
        for kind in profile.extractors {
            if cancel.is_cancelled() {
                break;
            }
            let Some(extractor) = self.extractors.get(kind) else {
                debug!(strategy = kind.name(), "No extractor registered, skipping");
                continue;
            };
            let strategy = extractor.name();

            match extractor.extract(&ctx).await {
                Ok(candidates) if !candidates.is_empty() => {
                    info!(url = %url, strategy, found = candidates.len(), "Strategy found videos");
                    attempts.push(Attempt {
                        strategy,
                        found: candidates.len(),
                        error: None,
                    });
                    return StrategyOutcome {
                        profile,
                        candidates,
                        strategy: Some(strategy),
                        attempts,
                    };
                }
                Ok(_) => {
                    debug!(url = %url, strategy, "Strategy found nothing");
                    attempts.push(Attempt {
                        strategy,
                        found: 0,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(url = %url, strategy, error = %e, "Strategy failed, trying next");
                    attempts.push(Attempt {
                        strategy,
                        found: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(url = %url, tried = attempts.len(), "No strategy found videos");
        StrategyOutcome {
            profile,
            candidates: Vec::new(),
            strategy: None,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        kind: ExtractorKind,
        result: fn() -> Result<Vec<VideoCandidate>, ExtractError>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(kind: ExtractorKind, result: fn() -> Result<Vec<VideoCandidate>, ExtractError>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Extractor for Fixed {
        fn kind(&self) -> ExtractorKind {
            self.kind
        }

        async fn extract(&self, _: &ExtractContext<'_>) -> Result<Vec<VideoCandidate>, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn two() -> Result<Vec<VideoCandidate>, ExtractError> {
        Ok(vec![
            VideoCandidate::new("https://cdn.example/a.mp4").with_height(720),
            VideoCandidate::new("https://cdn.example/b.mp4").with_height(360),
        ])
    }

    fn empty() -> Result<Vec<VideoCandidate>, ExtractError> {
        Ok(vec![])
    }

    fn broken() -> Result<Vec<VideoCandidate>, ExtractError> {
        Err(ExtractError::Parse {
            what: "page",
            reason: "boom".into(),
        })
    }

    fn generic_url() -> Url {
        Url::parse("https://videos.example.org/watch/1").unwrap()
    }

    #[tokio::test]
    async fn empty_first_strategy_falls_through_to_second() {
        let script = Fixed::new(ExtractorKind::PageScript, empty);
        let scan = Fixed::new(ExtractorKind::PageScan, two);
        let selector = StrategySelector::new("UA")
            .with_extractor(script.clone())
            .with_extractor(scan.clone());

        let outcome = selector.run(&generic_url(), &CancellationToken::new()).await;
        assert_eq!(outcome.candidates, two().unwrap());
        assert_eq!(outcome.strategy, Some("page-scan"));
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[tokio::test]
    async fn errors_are_treated_as_empty() {
        let selector = StrategySelector::new("UA")
            .with_extractor(Fixed::new(ExtractorKind::PageScript, broken))
            .with_extractor(Fixed::new(ExtractorKind::PageScan, two));

        let outcome = selector.run(&generic_url(), &CancellationToken::new()).await;
        assert_eq!(outcome.candidates.len(), 2);
        assert!(outcome.attempts[0].error.is_some());
    }

    #[tokio::test]
    async fn all_empty_is_a_normal_outcome() {
        let selector = StrategySelector::new("UA")
            .with_extractor(Fixed::new(ExtractorKind::PageScript, empty))
            .with_extractor(Fixed::new(ExtractorKind::PageScan, broken));

        let outcome = selector.run(&generic_url(), &CancellationToken::new()).await;
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.strategy, None);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.exhausted_failure().is_none());
    }

    #[tokio::test]
    async fn every_strategy_erroring_is_an_exhausted_failure() {
        let selector = StrategySelector::new("UA")
            .with_extractor(Fixed::new(ExtractorKind::PageScript, broken))
            .with_extractor(Fixed::new(ExtractorKind::PageScan, broken));

        let outcome = selector.run(&generic_url(), &CancellationToken::new()).await;
        let failure = outcome.exhausted_failure().unwrap();
        assert_eq!(failure.strategy, "page-scan");
        assert!(failure.error.is_some());
    }

    #[tokio::test]
    async fn first_success_stops_the_chain() {
        let script = Fixed::new(ExtractorKind::PageScript, two);
        let scan = Fixed::new(ExtractorKind::PageScan, two);
        let selector = StrategySelector::new("UA")
            .with_extractor(script.clone())
            .with_extractor(scan.clone());

        selector.run(&generic_url(), &CancellationToken::new()).await;
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scan.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_order_comes_from_profile() {
        let platform = Fixed::new(ExtractorKind::Platform, two);
        let script = Fixed::new(ExtractorKind::PageScript, two);
        let selector = StrategySelector::new("UA")
            .with_extractor(platform.clone())
            .with_extractor(script.clone());

        let outcome = selector
            .run(
                &Url::parse("https://www.youtube.com/watch?v=abc").unwrap(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.strategy, Some("platform"));
        assert_eq!(outcome.profile.name, "youtube");
        assert_eq!(script.calls.load(Ordering::SeqCst), 0);

        // generic sites never use the platform tool
        selector.run(&generic_url(), &CancellationToken::new()).await;
        assert_eq!(platform.calls.load(Ordering::SeqCst), 1);
        assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    }
}
