//! Watcher service for consuming and processing build events
//!
//! This module provides the core watcher service that:
//! 1. Subscribes to the build service's build success events
//! 2. Decodes and validates each event
//! 3. Matches it against the watch-list
//! 4. Runs the artifact pipeline for matched builds

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, Instrument};

use super::matcher::EventMatcher;
use super::pipeline::{ArtifactPipeline, PipelineOutcome, PipelineSettings};
use super::runner::{CommandRunner, ProcessRunner};
use super::watch_list::WatchList;
use crate::broker::{
    AmqpConnector, BrokerMessage, Connector, MessageHandler, Subscription, SubscriptionState,
};
use crate::config::Config;
use crate::error::{Result, WatcherError};

/// What happened to one delivery.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Delivery had no routing key.
    Ignored,
    /// Body could not be decoded.
    Malformed,
    /// Event lacks project, package, repository or arch.
    Incomplete,
    /// No watch entry for this build.
    Unwatched,
    /// A watch entry matched but dry-run mode skipped the pipeline.
    DryRun,
    /// The pipeline ran for the matched entry.
    Processed(PipelineOutcome),
}

/// Per-delivery glue between the subscription, the matcher and the
/// pipeline.
pub struct Dispatcher<R: CommandRunner> {
    matcher: EventMatcher,
    pipeline: ArtifactPipeline<R>,
    dry_run: bool,
}

impl<R: CommandRunner> Dispatcher<R> {
    /// Creates a dispatcher.
    pub fn new(matcher: EventMatcher, pipeline: ArtifactPipeline<R>, dry_run: bool) -> Self {
        Self {
            matcher,
            pipeline,
            dry_run,
        }
    }

    /// The pipeline matched events are handed to.
    pub fn pipeline(&self) -> &ArtifactPipeline<R> {
        &self.pipeline
    }

    /// True if matched events are only logged.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Process one delivery to completion.
    ///
    /// Never fails: every problem is logged and reported through the
    /// returned outcome, so the subscription loop always continues.
    pub async fn dispatch(&self, message: BrokerMessage) -> DispatchOutcome {
        debug!(body = %message.body_lossy(), "Received build event");

        if message.routing_key.is_empty() {
            return DispatchOutcome::Ignored;
        }

        let event = match self.matcher.decode(&message.body) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    routing_key = %message.routing_key,
                    body = %message.body_lossy(),
                    error = %e,
                    "Failed to decode build event"
                );
                return DispatchOutcome::Malformed;
            }
        };

        if !self.matcher.validate(&event) {
            return DispatchOutcome::Incomplete;
        }

        let Some(entry) = self.matcher.find_match(&event) else {
            return DispatchOutcome::Unwatched;
        };

        info!(
            entry = %entry.name,
            project = %entry.project,
            package = %entry.package,
            repo = %entry.repo,
            arch = %entry.build_arch,
            "Found watched package"
        );

        if self.dry_run {
            info!("Dry-run mode enabled: skipping download, install and trigger");
            return DispatchOutcome::DryRun;
        }

        DispatchOutcome::Processed(self.pipeline.run(entry).await)
    }
}

#[async_trait]
impl<R: CommandRunner> MessageHandler for Dispatcher<R> {
    async fn handle(&self, message: BrokerMessage) {
        let span = tracing::info_span!("handle_event", routing_key = %message.routing_key);
        self.dispatch(message).instrument(span).await;
    }
}

/// Main watcher service
///
/// Owns the broker subscription and the dispatcher it feeds.
///
/// # Example
///
/// ```rust,no_run
/// use obs_watcher::config::Config;
/// use obs_watcher::watcher::{SystemUsers, Watcher};
///
/// # async fn example(config: Config) -> anyhow::Result<()> {
/// let watch_list = config.watch_list(&SystemUsers)?;
/// let mut watcher = Watcher::new(&config, watch_list, false)?;
/// watcher.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct Watcher<C: Connector = AmqpConnector, R: CommandRunner = ProcessRunner> {
    subscription: Subscription<C>,
    dispatcher: Dispatcher<R>,
}

impl Watcher {
    /// Create a watcher talking to the configured broker
    ///
    /// # Arguments
    ///
    /// * `config` - Validated service configuration
    /// * `watch_list` - Resolved watch-list
    /// * `dry_run` - If true, match events but don't run the pipeline
    ///
    /// # Errors
    ///
    /// Returns `WatcherError::Config` if the watch-list is empty
    pub fn new(config: &Config, watch_list: WatchList, dry_run: bool) -> Result<Self> {
        if watch_list.is_empty() {
            return Err(WatcherError::Config("no packages to listen for".to_string()).into());
        }

        let target = config.profile().target();
        debug!(
            url = %target.redacted_url(),
            routing_key = %target.routing_key,
            "Configuring broker subscription"
        );

        let runner = match config.tools.max_concurrent_triggers {
            Some(limit) => ProcessRunner::with_trigger_limit(limit),
            None => ProcessRunner::new(),
        };

        let subscription = Subscription::new(AmqpConnector::new(), target, config.reconnect.policy());
        let dispatcher = Dispatcher::new(
            EventMatcher::new(Arc::new(watch_list)),
            ArtifactPipeline::new(PipelineSettings::from_config(config), runner),
            dry_run,
        );

        Ok(Self::from_parts(subscription, dispatcher))
    }
}

impl<C: Connector, R: CommandRunner> Watcher<C, R> {
    /// Assemble a watcher from an existing subscription and dispatcher.
    pub fn from_parts(subscription: Subscription<C>, dispatcher: Dispatcher<R>) -> Self {
        Self {
            subscription,
            dispatcher,
        }
    }

    /// Current subscription state
    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    /// The dispatcher deliveries are handed to
    pub fn dispatcher(&self) -> &Dispatcher<R> {
        &self.dispatcher
    }

    /// Consume events until the subscription hits a fatal error
    ///
    /// Retryable broker errors are handled inside the subscription by
    /// reconnecting; this only returns once reconnecting is pointless.
    ///
    /// # Errors
    ///
    /// Returns `WatcherError::Broker` carrying the fatal condition
    pub async fn start(&mut self) -> Result<()> {
        info!(
            routing_key = %self.subscription.target().routing_key,
            packages = self.dispatcher.matcher.watch_list().len(),
            dry_run = self.dispatcher.dry_run,
            "Starting watcher service"
        );

        let fatal = self.subscription.run(&self.dispatcher).await;

        Err(WatcherError::Broker(fatal.to_string()).into())
    }
}
