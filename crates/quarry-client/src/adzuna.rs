use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use quarry_core::error::AppError;
use quarry_core::models::{EmploymentType, Job, JobSearchQuery, JobSource};
use quarry_core::normalize::{
    classify_employment, classify_remote, parse_timestamp, salary_from_numbers,
};
use quarry_core::traits::SourceAdapter;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::cleaner::html_to_text;
use crate::http::{self, DEFAULT_TIMEOUT};

const DEFAULT_BASE_URL: &str = "https://api.adzuna.com/v1/api";
const DEFAULT_COUNTRY: &str = "us";
const PROVIDER: &str = "adzuna";

/// Credentials for the Adzuna search API.
#[derive(Debug, Clone)]
pub struct AdzunaCredentials {
    pub app_id: String,
    pub app_key: String,
}

/// Adapter for the Adzuna job search API.
///
/// Search and pagination happen server-side. The API has no single-listing
/// endpoint, so details are served from listings seen by recent searches.
#[derive(Clone)]
pub struct AdzunaAdapter {
    client: Client,
    base_url: String,
    country: String,
    credentials: Option<AdzunaCredentials>,
    timeout: Duration,
    seen: Cache<String, Job>,
}

impl AdzunaAdapter {
    pub fn new(credentials: Option<AdzunaCredentials>) -> Result<Self, AppError> {
        Self::build(DEFAULT_BASE_URL, DEFAULT_COUNTRY, credentials, DEFAULT_TIMEOUT)
    }

    /// Read `ADZUNA_APP_ID`, `ADZUNA_APP_KEY` and `ADZUNA_COUNTRY` (default `us`).
    /// Missing credentials yield an unconfigured adapter, not an error.
    pub fn from_env() -> Result<Self, AppError> {
        let credentials = match (
            std::env::var("ADZUNA_APP_ID").ok().filter(|v| !v.is_empty()),
            std::env::var("ADZUNA_APP_KEY").ok().filter(|v| !v.is_empty()),
        ) {
            (Some(app_id), Some(app_key)) => Some(AdzunaCredentials { app_id, app_key }),
            _ => None,
        };
        let country = std::env::var("ADZUNA_COUNTRY").unwrap_or_else(|_| DEFAULT_COUNTRY.into());
        Self::build(DEFAULT_BASE_URL, &country, credentials, DEFAULT_TIMEOUT)
    }

    pub fn with_base_url(self, base_url: &str) -> Result<Self, AppError> {
        Self::build(base_url, &self.country, self.credentials, self.timeout)
    }

    pub fn with_country(mut self, country: &str) -> Self {
        self.country = country.trim().to_lowercase();
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.base_url, &self.country, self.credentials, timeout)
    }

    fn build(
        base_url: &str,
        country: &str,
        credentials: Option<AdzunaCredentials>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            country: country.trim().to_lowercase(),
            credentials,
            timeout,
            seen: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(3600))
                .build(),
        })
    }

    fn search_url(
        &self,
        credentials: &AdzunaCredentials,
        query: &JobSearchQuery,
    ) -> Result<Url, AppError> {
        let mut url = Url::parse(&format!(
            "{}/jobs/{}/search/{}",
            self.base_url, self.country, query.page
        ))
        .map_err(|e| AppError::ConfigError(format!("Invalid Adzuna base URL: {e}")))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("app_id", &credentials.app_id)
                .append_pair("app_key", &credentials.app_key)
                .append_pair("results_per_page", &query.limit.to_string())
                .append_pair("content-type", "application/json");
            if !query.keywords.trim().is_empty() {
                pairs.append_pair("what", query.keywords.trim());
            }
            if let Some(location) = query.location.as_deref().map(str::trim)
                && !location.is_empty()
            {
                pairs.append_pair("where", location);
            }
            if let Some(floor) = query.filters.min_salary {
                pairs.append_pair("salary_min", &(floor.floor() as u64).to_string());
            }
            match query.filters.employment_type {
                Some(EmploymentType::FullTime) => {
                    pairs.append_pair("full_time", "1");
                }
                Some(EmploymentType::PartTime) => {
                    pairs.append_pair("part_time", "1");
                }
                Some(EmploymentType::Contract) => {
                    pairs.append_pair("contract", "1");
                }
                _ => {}
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl SourceAdapter for AdzunaAdapter {
    fn source(&self) -> JobSource {
        JobSource::Adzuna
    }

    fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    async fn search(&self, query: &JobSearchQuery) -> Result<Vec<Job>, AppError> {
        let Some(credentials) = &self.credentials else {
            tracing::warn!("Adzuna credentials not configured, returning no results");
            return Ok(Vec::new());
        };

        let url = self.search_url(credentials, query)?;
        tracing::debug!(page = query.page, limit = query.limit, "Searching Adzuna");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| http::send_error(PROVIDER, e, self.timeout))?;
        let response = http::check_status(PROVIDER, response).await?;
        let body: SearchResponse = http::read_json(PROVIDER, response).await?;

        let jobs: Vec<Job> = body
            .results
            .into_iter()
            .filter_map(Listing::into_job)
            .collect();
        for job in &jobs {
            self.seen.insert(job.external_id.clone(), job.clone()).await;
        }
        Ok(jobs)
    }

    async fn job_details(&self, external_id: &str) -> Result<Option<Job>, AppError> {
        if self.credentials.is_none() {
            tracing::warn!("Adzuna credentials not configured, no details available");
            return Ok(None);
        }
        Ok(self.seen.get(external_id).await)
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Listing>,
}

#[derive(Deserialize)]
struct Listing {
    id: serde_json::Value,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    company: Option<DisplayName>,
    #[serde(default)]
    location: Option<DisplayName>,
    #[serde(default)]
    salary_min: Option<f64>,
    #[serde(default)]
    salary_max: Option<f64>,
    #[serde(default)]
    contract_time: Option<String>,
    #[serde(default)]
    contract_type: Option<String>,
    #[serde(default)]
    redirect_url: Option<String>,
}

#[derive(Deserialize)]
struct DisplayName {
    #[serde(default)]
    display_name: String,
}

impl Listing {
    fn into_job(self) -> Option<Job> {
        let external_id = match &self.id {
            serde_json::Value::String(s) if !s.is_empty() => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };

        // contract_time (full/part) is more specific than contract_type
        // (permanent/contract), except that "contract" overrides full time.
        let employment = match (
            self.contract_time.as_deref().map(classify_employment),
            self.contract_type.as_deref().map(classify_employment),
        ) {
            (_, Some(EmploymentType::Contract)) => EmploymentType::Contract,
            (Some(time), _) if time != EmploymentType::Unknown => time,
            (_, Some(kind)) => kind,
            _ => EmploymentType::Unknown,
        };

        let title = html_to_text(&self.title);
        let description = html_to_text(&self.description);
        let location = self.location.map(|l| l.display_name).unwrap_or_default();
        let remote = classify_remote(&format!("{title} {location} {description}"));

        let mut builder = Job::builder(
            JobSource::Adzuna,
            external_id,
            title,
            self.company.map(|c| c.display_name).unwrap_or_default(),
        )
        .location(location)
        .remote_type(remote)
        .employment_type(employment)
        .salary(salary_from_numbers(self.salary_min, self.salary_max))
        .description(description)
        .apply_url(self.redirect_url.unwrap_or_default());
        if let Some(posted_at) = self.created.as_deref().and_then(parse_timestamp) {
            builder = builder.posted_at(posted_at);
        }
        Some(builder.build())
    }
}
