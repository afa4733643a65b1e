use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use quarry_core::error::AppError;
use quarry_core::models::{Job, JobSearchQuery, JobSource, RemoteType};
use quarry_core::normalize::{
    classify_employment, epoch_to_datetime, parse_timestamp, salary_from_numbers,
};
use quarry_core::traits::SourceAdapter;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::cleaner::{html_to_text, list_items};
use crate::http::{self, DEFAULT_TIMEOUT};

const DEFAULT_BASE_URL: &str = "https://remoteok.com";
const PROVIDER: &str = "remoteok";

/// Adapter for the RemoteOK public feed.
///
/// The feed has no server-side search: every call downloads the full list
/// and filters, paginates, and looks up ids locally. The decoded feed is
/// cached briefly so paging through results does not refetch it.
#[derive(Clone)]
pub struct RemoteOkAdapter {
    client: Client,
    base_url: String,
    timeout: Duration,
    feed_ttl: Duration,
    feed: Option<Cache<(), Arc<Vec<Job>>>>,
}

impl RemoteOkAdapter {
    pub fn new() -> Result<Self, AppError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, AppError> {
        Self::build(base_url, DEFAULT_TIMEOUT, Duration::from_secs(60))
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.base_url, timeout, self.feed_ttl)
    }

    /// How long a downloaded feed is reused. Zero disables reuse.
    pub fn with_feed_ttl(self, ttl: Duration) -> Result<Self, AppError> {
        Self::build(&self.base_url, self.timeout, ttl)
    }

    fn build(base_url: &str, timeout: Duration, feed_ttl: Duration) -> Result<Self, AppError> {
        let feed = (!feed_ttl.is_zero())
            .then(|| Cache::builder().max_capacity(1).time_to_live(feed_ttl).build());
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            feed_ttl,
            feed,
        })
    }

    async fn listings(&self) -> Result<Arc<Vec<Job>>, AppError> {
        let Some(feed) = &self.feed else {
            return Ok(Arc::new(self.fetch_feed().await?));
        };
        if let Some(jobs) = feed.get(&()).await {
            return Ok(jobs);
        }
        let jobs = Arc::new(self.fetch_feed().await?);
        feed.insert((), jobs.clone()).await;
        Ok(jobs)
    }

    async fn fetch_feed(&self) -> Result<Vec<Job>, AppError> {
        let url = format!("{}/api", self.base_url);
        tracing::debug!(url = %url, "Fetching RemoteOK feed");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| http::send_error(PROVIDER, e, self.timeout))?;
        let response = http::check_status(PROVIDER, response).await?;
        let entries: Vec<Value> = http::read_json(PROVIDER, response).await?;

        // The first element is a legal notice, and the feed occasionally
        // carries other non-listing objects; keep whatever decodes.
        let jobs: Vec<Job> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<Listing>(entry).ok())
            .filter_map(Listing::into_job)
            .collect();
        tracing::debug!(count = jobs.len(), "Decoded RemoteOK listings");
        Ok(jobs)
    }
}

#[async_trait]
impl SourceAdapter for RemoteOkAdapter {
    fn source(&self) -> JobSource {
        JobSource::RemoteOk
    }

    async fn search(&self, query: &JobSearchQuery) -> Result<Vec<Job>, AppError> {
        let listings = self.listings().await?;
        let terms = query.terms();
        let location = query
            .location
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_lowercase);

        let offset = (query.page.saturating_sub(1) as usize).saturating_mul(query.limit as usize);
        Ok(listings
            .iter()
            .filter(|job| matches_terms(job, &terms))
            .filter(|job| location.as_deref().is_none_or(|loc| matches_location(job, loc)))
            .skip(offset)
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn job_details(&self, external_id: &str) -> Result<Option<Job>, AppError> {
        let listings = self.listings().await?;
        Ok(listings.iter().find(|j| j.external_id == external_id).cloned())
    }
}

fn matches_terms(job: &Job, terms: &[String]) -> bool {
    if terms.is_empty() {
        return true;
    }
    let haystack = format!(
        "{} {} {} {}",
        job.title,
        job.company,
        job.requirements.join(" "),
        job.description
    )
    .to_lowercase();
    terms.iter().all(|t| haystack.contains(t.as_str()))
}

/// Listings without a location, or open worldwide, match any location.
fn matches_location(job: &Job, location: &str) -> bool {
    let job_location = job.location.to_lowercase();
    job_location.is_empty()
        || job_location.contains("worldwide")
        || job_location.contains("anywhere")
        || job_location.contains(location)
}

#[derive(Deserialize)]
struct Listing {
    id: Value,
    #[serde(default)]
    epoch: Option<i64>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    company: String,
    position: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    salary_min: Option<f64>,
    #[serde(default)]
    salary_max: Option<f64>,
    #[serde(default)]
    apply_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl Listing {
    fn into_job(self) -> Option<Job> {
        let external_id = match &self.id {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let posted_at = self
            .epoch
            .and_then(epoch_to_datetime)
            .or_else(|| self.date.as_deref().and_then(parse_timestamp));
        let employment = classify_employment(&self.tags.join(" "));
        let salary = salary_from_numbers(self.salary_min, self.salary_max)
            .map(|s| s.with_currency("USD"));

        let mut builder = Job::builder(JobSource::RemoteOk, external_id, self.position, self.company)
            .location(self.location)
            .remote_type(RemoteType::Remote)
            .employment_type(employment)
            .salary(salary)
            .responsibilities(list_items(&self.description))
            .description(html_to_text(&self.description))
            .requirements(self.tags)
            .apply_url(self.apply_url.or(self.url).unwrap_or_default());
        if let Some(posted_at) = posted_at {
            builder = builder.posted_at(posted_at);
        }
        Some(builder.build())
    }
}
