//! Assembly of a reconciler from its configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use warden_cloud::aws::{Credentials, Wafv2};
use warden_cloud::memory::InMemoryProvider;
use warden_cloud::{ResourceProvider, Throttle};
use warden_notify::Notifier;

use crate::config::{ProviderSettings, WardenConfig};
use crate::fleet::Fleet;
use crate::outcome::OutcomeSink;
use crate::scheduler::{Scheduler, SchedulerSettings};

/// Build the provider described by `settings`.
///
/// # Errors
///
/// Returns an error if credentials are missing, the endpoint is invalid or the
/// fixture cannot be loaded.
pub async fn build_provider(settings: &ProviderSettings) -> Result<Arc<dyn ResourceProvider>> {
    match settings {
        ProviderSettings::Aws {
            region,
            requests_per_second,
            endpoint,
        } => {
            let credentials = Credentials::from_env().context("AWS credentials")?;
            let mut client = Wafv2::new(credentials, region.clone())?
                .with_throttle(Arc::new(Throttle::per_second(*requests_per_second)));
            if let Some(endpoint) = endpoint {
                client = client
                    .with_endpoint(endpoint)
                    .with_context(|| format!("invalid endpoint {endpoint}"))?;
            }
            info!(region = %region, requests_per_second, "Using AWS WAFv2 provider");
            Ok(Arc::new(client))
        }
        ProviderSettings::Memory { fixture } => {
            let provider = match fixture {
                Some(path) => InMemoryProvider::from_fixture(path)
                    .await
                    .with_context(|| format!("loading fixture {}", path.display()))?,
                None => InMemoryProvider::new(),
            };
            info!("Using in-memory provider");
            Ok(Arc::new(provider))
        }
    }
}

/// Build the scheduler, fleet and outcome sink for `config`.
///
/// # Errors
///
/// Returns an error if the provider cannot be built or the outcome log
/// cannot be opened.
pub async fn build_scheduler(config: &WardenConfig) -> Result<Arc<Scheduler>> {
    let provider = build_provider(&config.provider).await?;
    build_scheduler_with(config, provider, Notifier::from_env()).await
}

/// Same as [`build_scheduler`] with an explicit provider and notifier.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the outcome log cannot
/// be opened.
pub async fn build_scheduler_with(
    config: &WardenConfig,
    provider: Arc<dyn ResourceProvider>,
    notifier: Notifier,
) -> Result<Arc<Scheduler>> {
    let fleet = Arc::new(Fleet::from_refs(config.resource_refs()?));
    let policies = Arc::new(config.policy_set()?);

    let sink = match &config.outcome_log {
        Some(path) => OutcomeSink::with_log(path, notifier)
            .await
            .with_context(|| format!("opening outcome log {}", path.display()))?,
        None => OutcomeSink::new(notifier),
    };

    info!(
        resources = fleet.len().await,
        policies = policies.len(),
        workers = config.workers,
        "Reconciler ready"
    );

    Ok(Arc::new(Scheduler::new(
        fleet,
        policies,
        provider,
        Arc::new(sink),
        &SchedulerSettings::from_config(config),
    )))
}
