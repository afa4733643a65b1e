use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// External job-listing providers known to Quarry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Adzuna,
    Glassdoor,
    Indeed,
    LinkedIn,
    RemoteOk,
    Usajobs,
}

impl JobSource {
    pub const ALL: [JobSource; 6] = [
        JobSource::Adzuna,
        JobSource::Glassdoor,
        JobSource::Indeed,
        JobSource::LinkedIn,
        JobSource::RemoteOk,
        JobSource::Usajobs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Adzuna => "adzuna",
            JobSource::Glassdoor => "glassdoor",
            JobSource::Indeed => "indeed",
            JobSource::LinkedIn => "linkedin",
            JobSource::RemoteOk => "remoteok",
            JobSource::Usajobs => "usajobs",
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobSource {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adzuna" => Ok(JobSource::Adzuna),
            "glassdoor" => Ok(JobSource::Glassdoor),
            "indeed" => Ok(JobSource::Indeed),
            "linkedin" => Ok(JobSource::LinkedIn),
            "remoteok" | "remote_ok" => Ok(JobSource::RemoteOk),
            "usajobs" => Ok(JobSource::Usajobs),
            _ => Err(AppError::UnknownSource(s.to_string())),
        }
    }
}

/// Where the work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    Remote,
    Hybrid,
    Onsite,
    #[default]
    Unknown,
}

impl RemoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteType::Remote => "remote",
            RemoteType::Hybrid => "hybrid",
            RemoteType::Onsite => "onsite",
            RemoteType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RemoteType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "remote" => Ok(RemoteType::Remote),
            "hybrid" => Ok(RemoteType::Hybrid),
            "onsite" | "on-site" => Ok(RemoteType::Onsite),
            "unknown" => Ok(RemoteType::Unknown),
            _ => Err(format!("Unknown remote type: {s}")),
        }
    }
}

/// Contract shape of the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentType {
    FullTime,
    PartTime,
    Contract,
    Internship,
    #[default]
    Unknown,
}

impl EmploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmploymentType::FullTime => "full_time",
            EmploymentType::PartTime => "part_time",
            EmploymentType::Contract => "contract",
            EmploymentType::Internship => "internship",
            EmploymentType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EmploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EmploymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "full_time" | "fulltime" => Ok(EmploymentType::FullTime),
            "part_time" | "parttime" => Ok(EmploymentType::PartTime),
            "contract" => Ok(EmploymentType::Contract),
            "internship" => Ok(EmploymentType::Internship),
            "unknown" => Ok(EmploymentType::Unknown),
            _ => Err(format!("Unknown employment type: {s}")),
        }
    }
}

/// Annual salary bounds. `min <= max` whenever both are present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: Option<String>,
}

impl SalaryRange {
    /// Build a range, swapping inverted bounds. Returns `None` when both
    /// bounds are missing.
    pub fn new(min: Option<f64>, max: Option<f64>) -> Option<Self> {
        let (min, max) = match (min, max) {
            (None, None) => return None,
            (Some(a), Some(b)) if a > b => (Some(b), Some(a)),
            other => other,
        };
        Some(Self {
            min,
            max,
            currency: None,
        })
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    /// The highest figure this range advertises.
    pub fn upper(&self) -> Option<f64> {
        self.max.or(self.min)
    }
}

/// A normalized job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Internal identifier, stable per (source, external_id).
    pub id: String,
    pub external_id: String,
    pub source: JobSource,
    pub title: String,
    pub company: String,
    pub location: String,
    pub remote_type: RemoteType,
    pub employment_type: EmploymentType,
    pub salary: Option<SalaryRange>,
    pub description: String,
    pub requirements: Vec<String>,
    pub responsibilities: Vec<String>,
    pub benefits: Vec<String>,
    pub posted_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub apply_url: String,
}

impl Job {
    /// Start building a job for the given source listing.
    pub fn builder(
        source: JobSource,
        external_id: impl Into<String>,
        title: impl Into<String>,
        company: impl Into<String>,
    ) -> JobBuilder {
        JobBuilder {
            source,
            external_id: external_id.into(),
            title: title.into(),
            company: company.into(),
            location: String::new(),
            remote_type: RemoteType::Unknown,
            employment_type: EmploymentType::Unknown,
            salary: None,
            description: String::new(),
            requirements: Vec::new(),
            responsibilities: Vec::new(),
            benefits: Vec::new(),
            posted_at: None,
            deadline: None,
            apply_url: String::new(),
        }
    }

    /// Key identifying "the same opening" across boards.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            normalize_key_part(&self.title),
            normalize_key_part(&self.company),
            normalize_key_part(&self.location)
        )
    }
}

/// Lowercase, trim, and collapse internal whitespace.
fn normalize_key_part(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Derive the internal identifier for a (source, external id) pair.
pub fn job_id(source: JobSource, external_id: &str) -> String {
    let hash = compute_hash(&format!("{}:{}", source.as_str(), external_id));
    format!("{}_{}", source.as_str(), &hash[..24])
}

/// Builder enforcing the [`Job`] invariants at normalization time.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    source: JobSource,
    external_id: String,
    title: String,
    company: String,
    location: String,
    remote_type: RemoteType,
    employment_type: EmploymentType,
    salary: Option<SalaryRange>,
    description: String,
    requirements: Vec<String>,
    responsibilities: Vec<String>,
    benefits: Vec<String>,
    posted_at: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
    apply_url: String,
}

impl JobBuilder {
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn remote_type(mut self, remote_type: RemoteType) -> Self {
        self.remote_type = remote_type;
        self
    }

    pub fn employment_type(mut self, employment_type: EmploymentType) -> Self {
        self.employment_type = employment_type;
        self
    }

    pub fn salary(mut self, salary: Option<SalaryRange>) -> Self {
        self.salary = salary;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn responsibilities(mut self, responsibilities: Vec<String>) -> Self {
        self.responsibilities = responsibilities;
        self
    }

    pub fn benefits(mut self, benefits: Vec<String>) -> Self {
        self.benefits = benefits;
        self
    }

    pub fn posted_at(mut self, posted_at: DateTime<Utc>) -> Self {
        self.posted_at = Some(posted_at);
        self
    }

    pub fn deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn apply_url(mut self, apply_url: impl Into<String>) -> Self {
        self.apply_url = apply_url.into();
        self
    }

    pub fn build(self) -> Job {
        self.build_at(Utc::now())
    }

    /// Build against an explicit "now": future posting dates are clamped,
    /// deadlines not after the posting date are dropped, and inverted salary
    /// bounds are swapped.
    pub fn build_at(self, now: DateTime<Utc>) -> Job {
        let posted_at = self.posted_at.map_or(now, |p| p.min(now));
        let deadline = self.deadline.filter(|d| *d > posted_at);
        let salary = self.salary.and_then(|s| {
            let currency = s.currency.clone();
            SalaryRange::new(s.min, s.max).map(|mut r| {
                r.currency = currency;
                r
            })
        });

        Job {
            id: job_id(self.source, &self.external_id),
            external_id: self.external_id,
            source: self.source,
            title: self.title.trim().to_string(),
            company: self.company.trim().to_string(),
            location: self.location.trim().to_string(),
            remote_type: self.remote_type,
            employment_type: self.employment_type,
            salary,
            description: self.description,
            requirements: self.requirements,
            responsibilities: self.responsibilities,
            benefits: self.benefits,
            posted_at,
            deadline,
            apply_url: self.apply_url,
        }
    }
}

/// Optional narrowing applied to a search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilters {
    pub remote_type: Option<RemoteType>,
    pub employment_type: Option<EmploymentType>,
    pub min_salary: Option<f64>,
}

impl JobFilters {
    pub fn is_empty(&self) -> bool {
        self.remote_type.is_none() && self.employment_type.is_none() && self.min_salary.is_none()
    }

    /// Whether a job passes every configured filter.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(remote) = self.remote_type
            && job.remote_type != remote
        {
            return false;
        }
        if let Some(kind) = self.employment_type
            && job.employment_type != kind
        {
            return false;
        }
        if let Some(floor) = self.min_salary {
            return job
                .salary
                .as_ref()
                .and_then(SalaryRange::upper)
                .is_some_and(|upper| upper >= floor);
        }
        true
    }
}

pub const MAX_PAGE_SIZE: u32 = 100;

/// A single logical search, passed unchanged to every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSearchQuery {
    pub keywords: String,
    pub location: Option<String>,
    pub page: u32,
    pub limit: u32,
    #[serde(default)]
    pub filters: JobFilters,
}

impl Default for JobSearchQuery {
    fn default() -> Self {
        Self {
            keywords: String::new(),
            location: None,
            page: 1,
            limit: 20,
            filters: JobFilters::default(),
        }
    }
}

impl JobSearchQuery {
    pub fn new(keywords: impl Into<String>) -> Self {
        Self {
            keywords: keywords.into(),
            ..Default::default()
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_page(mut self, page: u32, limit: u32) -> Self {
        self.page = page;
        self.limit = limit;
        self
    }

    pub fn with_filters(mut self, filters: JobFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.page == 0 {
            return Err(AppError::InvalidQuery("page must be at least 1".into()));
        }
        if self.limit == 0 || self.limit > MAX_PAGE_SIZE {
            return Err(AppError::InvalidQuery(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.limit
            )));
        }
        if let Some(floor) = self.filters.min_salary
            && (floor.is_nan() || floor < 0.0)
        {
            return Err(AppError::InvalidQuery(
                "min_salary must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    /// Keywords split into lowercase terms.
    pub fn terms(&self) -> Vec<String> {
        self.keywords
            .split(|c: char| !c.is_alphanumeric() && c != '+' && c != '#')
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    /// Canonical string identifying this query, used as a cache key.
    pub fn cache_key(&self) -> String {
        format!(
            "kw={}|loc={}|p={}|l={}|r={}|t={}|s={}",
            normalize_key_part(&self.keywords),
            self.location
                .as_deref()
                .map(normalize_key_part)
                .unwrap_or_default(),
            self.page,
            self.limit,
            self.filters.remote_type.map(|r| r.as_str()).unwrap_or("-"),
            self.filters
                .employment_type
                .map(|t| t.as_str())
                .unwrap_or("-"),
            self.filters
                .min_salary
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
        )
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
