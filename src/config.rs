//! Startup configuration loaded from TOML.
//!
//! ```toml
//! deadline_ms = 2000
//! consistency = "retry_later"
//!
//! [services]
//! details = ["http://127.0.0.1:8081"]
//!
//! [[dependencies]]
//! name = "details"
//! service = "details"
//! fetch_path = "/api/details/{key}"
//! create_path = "/api/details"
//! fallback = { body = "unavailable" }
//! max_retries = 2
//! backoff_base_ms = 100
//! request_timeout_ms = 500
//! bulkhead_capacity = 10
//! failure_threshold = 3
//! open_state_duration_ms = 10000
//! half_open_trial_count = 1
//! ```
//!
//! Every field except `name` has a default. Validation reports every problem at once; the
//! process must not start with any of them.

use crate::aggregator::{CreateConsistency, DEFAULT_DEADLINE};
use crate::descriptor::DependencyDescriptor;
use crate::discovery::StaticResolver;
use crate::error::{ConfigError, Problem};
use crate::Jitter;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct GatherConfig {
    pub deadline: Duration,
    pub consistency: CreateConsistency,
    /// Logical service name → base URLs.
    pub services: BTreeMap<String, Vec<String>>,
    pub dependencies: Vec<DependencyConfig>,
}

/// One dependency: its resilience descriptor plus where and how to reach it.
#[derive(Debug, Clone)]
pub struct DependencyConfig {
    pub descriptor: DependencyDescriptor,
    pub service: Option<String>,
    pub fetch_path: Option<String>,
    pub create_path: Option<String>,
    pub fallback: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    deadline_ms: Option<u64>,
    #[serde(default)]
    consistency: CreateConsistency,
    #[serde(default)]
    services: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependency {
    name: String,
    service: Option<String>,
    fetch_path: Option<String>,
    create_path: Option<String>,
    #[serde(default)]
    fallback: serde_json::Value,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    backoff_max_ms: Option<u64>,
    #[serde(default)]
    jitter: Jitter,
    request_timeout_ms: Option<u64>,
    bulkhead_capacity: Option<usize>,
    bulkhead_wait_ms: Option<u64>,
    failure_threshold: Option<u32>,
    open_state_duration_ms: Option<u64>,
    half_open_trial_count: Option<u32>,
}

impl RawDependency {
    fn descriptor(&self) -> Result<DependencyDescriptor, ConfigError> {
        let mut builder = DependencyDescriptor::builder(&self.name).jitter(self.jitter);
        if let Some(v) = self.max_retries {
            builder = builder.max_retries(v);
        }
        if let Some(ms) = self.backoff_base_ms {
            builder = builder.backoff_base(Duration::from_millis(ms));
        }
        if let Some(v) = self.backoff_multiplier {
            builder = builder.backoff_multiplier(v);
        }
        if let Some(ms) = self.backoff_max_ms {
            builder = builder.backoff_max(Duration::from_millis(ms));
        }
        if let Some(ms) = self.request_timeout_ms {
            builder = builder.request_timeout(Duration::from_millis(ms));
        }
        if let Some(v) = self.bulkhead_capacity {
            builder = builder.bulkhead_capacity(v);
        }
        if let Some(ms) = self.bulkhead_wait_ms {
            builder = builder.bulkhead_wait(Duration::from_millis(ms));
        }
        if let Some(v) = self.failure_threshold {
            builder = builder.failure_threshold(v);
        }
        if let Some(ms) = self.open_state_duration_ms {
            builder = builder.open_state_duration(Duration::from_millis(ms));
        }
        if let Some(v) = self.half_open_trial_count {
            builder = builder.half_open_trial_count(v);
        }
        builder.build()
    }
}

impl GatherConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        let deadline = match raw.deadline_ms {
            Some(0) => {
                problems.push(Problem::new("deadline_ms", "must be > 0"));
                Duration::ZERO
            }
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_DEADLINE,
        };

        for (service, addresses) in &raw.services {
            if addresses.is_empty() {
                problems.push(Problem::new(format!("services.{service}"), "no addresses"));
            }
            for address in addresses {
                if !(address.starts_with("http://") || address.starts_with("https://")) {
                    problems.push(Problem::new(
                        format!("services.{service}"),
                        format!("'{address}' is not an http(s) URL"),
                    ));
                }
            }
        }

        let mut seen = BTreeSet::new();
        let mut dependencies = Vec::with_capacity(raw.dependencies.len());
        for dep in raw.dependencies {
            if !seen.insert(dep.name.clone()) {
                problems.push(Problem::new(&dep.name, "duplicate dependency name"));
            }
            if dep.fetch_path.is_none() && dep.create_path.is_none() {
                problems.push(Problem::new(&dep.name, "needs fetch_path or create_path"));
            }
            match &dep.service {
                Some(service) if !raw.services.contains_key(service) => problems.push(
                    Problem::new(&dep.name, format!("unknown service '{service}'")),
                ),
                None => problems.push(Problem::new(&dep.name, "service is required")),
                _ => {}
            }

            match dep.descriptor() {
                Ok(descriptor) => dependencies.push(DependencyConfig {
                    descriptor,
                    service: dep.service,
                    fetch_path: dep.fetch_path,
                    create_path: dep.create_path,
                    fallback: dep.fallback,
                }),
                Err(e) => problems.extend(e.problems().iter().cloned()),
            }
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }
        Ok(Self { deadline, consistency: raw.consistency, services: raw.services, dependencies })
    }

    /// Resolver over the `[services]` table.
    pub fn resolver(&self) -> StaticResolver {
        self.services
            .iter()
            .fold(StaticResolver::new(), |r, (name, addresses)| r.with_service(name, addresses))
    }

    /// Aggregator over `store` with one HTTP client per configured path.
    #[cfg(feature = "http")]
    pub fn aggregator<P, S>(
        &self,
        store: std::sync::Arc<S>,
        resolver: std::sync::Arc<dyn crate::discovery::Resolver>,
    ) -> Result<crate::Aggregator<P, serde_json::Value>, ConfigError>
    where
        P: Clone + Send + Sync + 'static,
        S: crate::PrimaryStore<P> + 'static,
    {
        use crate::aggregator::{Aggregator, Dependency};
        use crate::http_client::HttpClient;

        let http = reqwest::Client::new();
        let mut builder = Aggregator::builder(store)
            .deadline(self.deadline)
            .consistency(self.consistency);

        for dep in &self.dependencies {
            let service = dep.service.clone().unwrap_or_default();
            let client = |path: &str| {
                HttpClient::new(resolver.clone(), service.clone(), path)
                    .with_http(http.clone())
                    .with_timeout(dep.descriptor.request_timeout())
            };
            let mut registration = Dependency::new(dep.descriptor.clone(), dep.fallback.clone());
            if let Some(path) = &dep.fetch_path {
                registration = registration.with_fetch(client(path));
            }
            if let Some(path) = &dep.create_path {
                registration = registration.with_create(client(path));
            }
            builder = builder.dependency(registration);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        deadline_ms = 1500
        consistency = "retry_later"

        [services]
        details = ["http://127.0.0.1:8081/"]
        comments = ["http://127.0.0.1:8082", "http://127.0.0.1:8083"]

        [[dependencies]]
        name = "details"
        service = "details"
        fetch_path = "/api/details/{key}"
        create_path = "/api/details"
        fallback = { body = "unavailable" }
        failure_threshold = 3
        jitter = "equal"

        [[dependencies]]
        name = "comments"
        service = "comments"
        fetch_path = "/api/comments/{key}/post"
        fallback = []
        request_timeout_ms = 250
        backoff_multiplier = 1.5
    "#;

    #[test]
    fn parses_valid_config() {
        let config = GatherConfig::from_toml_str(VALID).unwrap();
        assert_eq!(config.deadline, Duration::from_millis(1500));
        assert_eq!(config.consistency, CreateConsistency::RetryLater);
        assert_eq!(config.dependencies.len(), 2);

        let details = &config.dependencies[0];
        assert_eq!(details.descriptor.breaker_config().failure_threshold(), 3);
        assert_eq!(details.descriptor.jitter(), Jitter::Equal);
        assert_eq!(details.fallback, serde_json::json!({"body": "unavailable"}));

        let comments = &config.dependencies[1];
        assert_eq!(comments.descriptor.request_timeout(), Duration::from_millis(250));
        assert_eq!(comments.fallback, serde_json::json!([]));
        assert_eq!(comments.create_path, None);

        let resolver = config.resolver();
        assert_eq!(
            crate::Resolver::resolve(&resolver, "details"),
            vec!["http://127.0.0.1:8081".to_string()]
        );
    }

    #[test]
    fn defaults_apply() {
        let config = GatherConfig::from_toml_str(
            r#"
            [services]
            s = ["http://s"]
            [[dependencies]]
            name = "d"
            service = "s"
            fetch_path = "/d/{key}"
            "#,
        )
        .unwrap();
        assert_eq!(config.deadline, DEFAULT_DEADLINE);
        assert_eq!(config.consistency, CreateConsistency::BestEffort);
        assert_eq!(config.dependencies[0].fallback, serde_json::Value::Null);
        assert_eq!(config.dependencies[0].descriptor.max_retries(), 2);
    }

    #[test]
    fn reports_every_problem() {
        let err = GatherConfig::from_toml_str(
            r#"
            deadline_ms = 0
            [services]
            details = ["ftp://nope"]
            [[dependencies]]
            name = "details"
            service = "details"
            fetch_path = "/d/{key}"
            bulkhead_capacity = 0
            [[dependencies]]
            name = "details"
            service = "ghost"
            "#,
        )
        .unwrap_err();

        let problems: Vec<String> = err.problems().iter().map(ToString::to_string).collect();
        assert_eq!(
            problems,
            vec![
                "deadline_ms: must be > 0",
                "services.details: 'ftp://nope' is not an http(s) URL",
                "details: bulkhead_capacity must be > 0",
                "details: duplicate dependency name",
                "details: needs fetch_path or create_path",
                "details: unknown service 'ghost'",
            ]
        );
    }

    #[test]
    fn huge_bulkhead_capacity_is_a_problem_not_a_panic() {
        let err = GatherConfig::from_toml_str(
            r#"
            [services]
            details = ["http://127.0.0.1:8081"]
            [[dependencies]]
            name = "details"
            service = "details"
            fetch_path = "/d/{key}"
            bulkhead_capacity = 9223372036854775807
            "#,
        )
        .unwrap_err();

        assert_eq!(err.problems().len(), 1);
        assert!(err.problems()[0].to_string().starts_with("details: bulkhead_capacity must be <="));
    }

    #[test]
    fn unknown_fields_are_parse_errors() {
        let err = GatherConfig::from_toml_str("deadline = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = GatherConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
