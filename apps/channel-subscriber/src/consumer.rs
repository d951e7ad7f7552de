//! One channel, one handler: the session, subscription and dispatcher wired
//! together.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{EventDispatcher, MessageHandler, StatsTracker, Verbosity};
use crate::endpoint::Endpoint;
use crate::error::ConsumerError;
use crate::session::SessionManager;
use crate::subscription::{ChannelHandle, ChannelSubscriptions, StartPosition};

/// What to consume and how chatty to be about it.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub endpoints: Vec<Endpoint>,
    pub channel: String,
    pub filter: Option<String>,
    pub start: StartPosition,
    pub log_level: u8,
    pub report_count: u64,
}

impl ConsumerOptions {
    pub fn new(endpoints: Vec<Endpoint>, channel: impl Into<String>) -> Self {
        Self {
            endpoints,
            channel: channel.into(),
            filter: None,
            start: StartPosition::Latest,
            log_level: 1,
            report_count: crate::dispatch::stats::DEFAULT_REPORT_COUNT,
        }
    }
}

impl From<&Config> for ConsumerOptions {
    fn from(config: &Config) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            channel: config.channel_name.clone(),
            filter: config.selector.clone(),
            start: config.start_position,
            log_level: config.log_level,
            report_count: config.report_count,
        }
    }
}

/// Final tallies returned by [`ChannelConsumer::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub events: u64,
    pub bytes: u64,
    pub gaps: u64,
    pub missed: u64,
    pub handler_faults: u64,
    /// Next sequence id the consumer would have expected.
    pub cursor: i64,
}

pub struct ChannelConsumer {
    session: Arc<SessionManager>,
    subscriptions: Arc<ChannelSubscriptions>,
    channel: Arc<ChannelHandle>,
    dispatcher: Arc<EventDispatcher>,
    watcher: JoinHandle<()>,
}

impl ChannelConsumer {
    /// Connect, resolve the channel and start delivering to `handler`.
    ///
    /// On failure the session is shut down before the error is returned.
    pub async fn start(
        session: Arc<SessionManager>,
        options: &ConsumerOptions,
        handler: impl MessageHandler + 'static,
    ) -> Result<Self, ConsumerError> {
        session
            .connect(&options.endpoints, options.log_level)
            .await?;

        let subscriptions = Arc::new(ChannelSubscriptions::new(Arc::clone(&session)));
        let channel = match subscriptions.resolve(&options.channel).await {
            Ok(channel) => channel,
            Err(err) => {
                session.shutdown().await;
                return Err(err.into());
            }
        };

        let tracker = StatsTracker::new(options.report_count, Verbosity::from_level(options.log_level))
            .with_byte_source(session.clone());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&channel), tracker, handler));
        let watcher = subscriptions.watch_session();

        if let Err(err) = subscriptions
            .subscribe(
                &channel,
                options.filter.as_deref(),
                options.start,
                dispatcher.clone(),
            )
            .await
        {
            session.shutdown().await;
            watcher.abort();
            return Err(err.into());
        }

        Ok(Self {
            session,
            subscriptions,
            channel,
            dispatcher,
            watcher,
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn channel(&self) -> &Arc<ChannelHandle> {
        &self.channel
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Unsubscribe, close the session and report what was consumed.
    pub async fn shutdown(self) -> ConsumerSummary {
        self.subscriptions.unsubscribe_all().await;
        self.session.shutdown().await;
        self.watcher.abort();

        let totals = self.dispatcher.totals();
        let summary = ConsumerSummary {
            events: totals.events,
            bytes: totals.bytes,
            gaps: totals.gaps,
            missed: totals.missed,
            handler_faults: self.dispatcher.handler_faults(),
            cursor: self.channel.cursor(),
        };
        tracing::info!(
            channel = %self.channel.name(),
            events = summary.events,
            gaps = summary.gaps,
            "consumed total of {}",
            summary.events
        );
        summary
    }
}
