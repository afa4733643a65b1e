//! Job matching with graceful degradation.
//!
//! The preferred path asks an internal service with the `job-matching`
//! capability. When that fails, matches are approximated by searching the
//! aggregator and scoring keyword overlap locally; failing that, an empty
//! list is served so callers always get an answer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::aggregator::{JobAggregator, SearchContext};
use crate::degradation::{DegradationCoordinator, FallbackStrategy};
use crate::error::AppError;
use crate::models::{Job, JobSearchQuery};
use crate::service::ServiceCaller;
use crate::trace::SpanContext;

pub const MATCHING_CAPABILITY: &str = "job-matching";
pub const AGGREGATOR_FALLBACK: &str = "matching.aggregator";
pub const STATIC_FALLBACK: &str = "matching.static";
const OPERATION: &str = "get_job_matches";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    /// Skills and terms describing the candidate.
    #[serde(default)]
    pub profile_keywords: Vec<String>,
    #[serde(default)]
    pub query: JobSearchQuery,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMatch {
    pub job: Job,
    /// Relevance in `[0, 1]`.
    pub score: f64,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub matches: Vec<JobMatch>,
    /// Which strategy produced the matches.
    pub strategy: String,
}

#[derive(Deserialize)]
struct MatchResponse {
    matches: Vec<JobMatch>,
}

pub struct MatchService {
    caller: ServiceCaller,
    aggregator: Arc<JobAggregator>,
    coordinator: DegradationCoordinator,
}

impl MatchService {
    pub fn new(
        caller: ServiceCaller,
        aggregator: Arc<JobAggregator>,
        coordinator: DegradationCoordinator,
    ) -> Self {
        Self {
            caller,
            aggregator,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &DegradationCoordinator {
        &self.coordinator
    }

    pub async fn get_job_matches(
        &self,
        request: &MatchRequest,
        parent: Option<&SpanContext>,
    ) -> Result<MatchResult, AppError> {
        request.query.validate()?;

        let degraded = self
            .coordinator
            .execute_detailed(
                OPERATION,
                || self.remote_matches(request, parent),
                vec![
                    FallbackStrategy::new("aggregator", 1, move || {
                        self.local_matches(request, parent)
                    })
                    .with_flag(AGGREGATOR_FALLBACK),
                    FallbackStrategy::new("static", 2, || async { Ok(Vec::new()) })
                        .with_flag(STATIC_FALLBACK),
                ],
            )
            .await?;

        Ok(MatchResult {
            matches: degraded.value,
            strategy: degraded.strategy,
        })
    }

    async fn remote_matches(
        &self,
        request: &MatchRequest,
        parent: Option<&SpanContext>,
    ) -> Result<Vec<JobMatch>, AppError> {
        let payload = json!({
            "profile_keywords": request.profile_keywords,
            "query": request.query,
            "user_id": request.user_id,
        });
        let response = self
            .caller
            .call(MATCHING_CAPABILITY, "match", &payload, parent)
            .await?;
        let mut matches = serde_json::from_value::<MatchResponse>(response)?.matches;
        for m in &mut matches {
            m.score = m.score.clamp(0.0, 1.0);
        }
        sort_matches(&mut matches);
        Ok(matches)
    }

    async fn local_matches(
        &self,
        request: &MatchRequest,
        parent: Option<&SpanContext>,
    ) -> Result<Vec<JobMatch>, AppError> {
        let ctx = SearchContext {
            user_id: request.user_id.clone(),
            trace: parent.cloned(),
        };
        let jobs = self.aggregator.search_jobs(&request.query, &ctx).await?;

        let keywords = if request.profile_keywords.is_empty() {
            request.query.terms()
        } else {
            request
                .profile_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect()
        };

        let mut matches: Vec<JobMatch> = jobs
            .into_iter()
            .filter_map(|job| {
                let (score, matched_keywords) = keyword_overlap(&keywords, &job);
                (score > 0.0).then_some(JobMatch {
                    job,
                    score,
                    matched_keywords,
                })
            })
            .collect();
        sort_matches(&mut matches);
        Ok(matches)
    }
}

/// Fraction of `keywords` found anywhere in the job's text.
pub fn keyword_overlap(keywords: &[String], job: &Job) -> (f64, Vec<String>) {
    if keywords.is_empty() {
        return (0.0, Vec::new());
    }
    let haystack = format!(
        "{} {} {} {}",
        job.title,
        job.description,
        job.requirements.join(" "),
        job.responsibilities.join(" ")
    )
    .to_lowercase();

    let matched: Vec<String> = keywords
        .iter()
        .filter(|k| haystack.contains(k.as_str()))
        .cloned()
        .collect();
    (matched.len() as f64 / keywords.len() as f64, matched)
}

/// Highest score first; newer postings win ties.
fn sort_matches(matches: &mut [JobMatch]) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.job.posted_at.cmp(&a.job.posted_at))
            .then_with(|| a.job.id.cmp(&b.job.id))
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::aggregator::AggregatorConfig;
    use crate::degradation::StaticFeatureFlags;
    use crate::models::JobSource;
    use crate::rate_limit::{RateLimitConfig, RateLimiter};
    use crate::registry::{NewService, ServiceRegistry, ServiceStatus};
    use crate::retry::RetryPolicy;
    use crate::testutil::{MockAdapter, MockInvoker, sample_job};
    use crate::trace::Tracer;

    fn jobs() -> Vec<Job> {
        let now = Utc::now();
        let mut rust = sample_job(JobSource::Indeed, "1", "Rust Engineer", "Acme", now);
        rust.requirements = vec!["tokio".into(), "postgres".into()];
        let go = sample_job(
            JobSource::Indeed,
            "2",
            "Go Developer",
            "Globex",
            now - TimeDelta::hours(1),
        );
        let mut both = sample_job(
            JobSource::Indeed,
            "3",
            "Platform Engineer",
            "Initech",
            now - TimeDelta::hours(2),
        );
        both.description = "Rust services and tooling".into();
        vec![rust, go, both]
    }

    fn service(invoker: MockInvoker, registry: ServiceRegistry, disabled: &[&str]) -> MatchService {
        let tracer = Tracer::new("quarry-test");
        let aggregator = JobAggregator::new(
            AggregatorConfig {
                retry: RetryPolicy::none(),
                cache_ttl: None,
                ..Default::default()
            },
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            tracer.clone(),
        )
        .with_adapter(Arc::new(MockAdapter::new(JobSource::Indeed).with_jobs(jobs())));

        MatchService::new(
            ServiceCaller::new(registry, Arc::new(invoker), tracer)
                .with_timeout(Duration::from_secs(1)),
            Arc::new(aggregator),
            DegradationCoordinator::new(Arc::new(StaticFeatureFlags::with_disabled(
                disabled.iter().copied(),
            ))),
        )
    }

    fn request(keywords: &[&str]) -> MatchRequest {
        MatchRequest {
            profile_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            query: JobSearchQuery::new("engineer"),
            user_id: Some("u-1".into()),
        }
    }

    #[test]
    fn overlap_scores_fraction_of_keywords() {
        let jobs = jobs();
        let keywords = vec!["rust".to_string(), "tokio".to_string()];
        let (score, matched) = keyword_overlap(&keywords, &jobs[0]);
        assert_eq!(score, 1.0);
        assert_eq!(matched, keywords);

        let (score, _) = keyword_overlap(&keywords, &jobs[2]);
        assert_eq!(score, 0.5);

        assert_eq!(keyword_overlap(&keywords, &jobs[1]).0, 0.0);
        assert_eq!(keyword_overlap(&[], &jobs[0]).0, 0.0);
    }

    #[tokio::test]
    async fn remote_service_is_preferred() {
        let registry = ServiceRegistry::new();
        registry.register_service(
            NewService::new("ml", "http://ml", "1")
                .with_capability(MATCHING_CAPABILITY)
                .with_status(ServiceStatus::Healthy),
        );
        let invoker = MockInvoker::new();
        let remote_job = jobs().remove(1);
        invoker.respond(
            "ml",
            Ok(json!({ "matches": [{ "job": remote_job, "score": 1.7 }] })),
        );

        let result = service(invoker.clone(), registry, &[])
            .get_job_matches(&request(&["go"]), None)
            .await
            .unwrap();

        assert_eq!(result.strategy, "primary");
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].score, 1.0);
        assert_eq!(invoker.calls()[0].payload["profile_keywords"], json!(["go"]));
    }

    #[tokio::test]
    async fn falls_back_to_local_scoring() {
        let svc = service(MockInvoker::new(), ServiceRegistry::new(), &[]);

        let result = svc
            .get_job_matches(&request(&["Rust", "tokio"]), None)
            .await
            .unwrap();

        assert_eq!(result.strategy, "aggregator");
        let ids: Vec<_> = result
            .matches
            .iter()
            .map(|m| m.job.external_id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(svc.coordinator().stats(OPERATION).fallback_successes, 1);
    }

    #[tokio::test]
    async fn static_fallback_when_aggregator_disabled() {
        let result = service(MockInvoker::new(), ServiceRegistry::new(), &[AGGREGATOR_FALLBACK])
            .get_job_matches(&request(&["rust"]), None)
            .await
            .unwrap();

        assert_eq!(result.strategy, "static");
        assert!(result.matches.is_empty());
    }

    #[tokio::test]
    async fn every_strategy_disabled_surfaces_primary_error() {
        let err = service(
            MockInvoker::new(),
            ServiceRegistry::new(),
            &[AGGREGATOR_FALLBACK, STATIC_FALLBACK],
        )
        .get_job_matches(&request(&["rust"]), None)
        .await
        .unwrap_err();

        match err {
            AppError::AllFallbacksFailed { attempts, last, .. } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last, AppError::ServiceNotFound(_)));
            }
            other => panic!("expected AllFallbacksFailed, got {other:?}"),
        }
    }
}
