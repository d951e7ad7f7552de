use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use channel_subscriber::config::Config;
use channel_subscriber::session::{retry_up_to, SessionOptions};
use channel_subscriber::{
    ChannelConsumer, ConsumerOptions, Credentials, LogHandler, SessionManager, WsTransport,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut credentials = Credentials::new(&config.username);
    credentials.password = match (&config.password, config.prompt_for_password) {
        (Some(password), _) => Some(password.clone()),
        (None, true) => match read_password() {
            Ok(password) => Some(password),
            Err(err) => {
                tracing::error!(error = %err, "failed to read password");
                return ExitCode::FAILURE;
            }
        },
        (None, false) => None,
    };

    let mut session_options = SessionOptions::new(credentials);
    session_options.connect_timeout = config.connect_timeout;
    session_options.reconnect_delay = config.reconnect_delay;

    let session = Arc::new(SessionManager::new(
        Arc::new(WsTransport::new()),
        session_options,
    ));
    session.set_retry_predicate(retry_up_to(config.reconnect_attempts));

    let options = ConsumerOptions::from(&config);
    tracing::info!(
        channel = %options.channel,
        endpoints = options.endpoints.len(),
        start = ?options.start,
        "channel-subscriber configured"
    );

    let consumer = match ChannelConsumer::start(session, &options, LogHandler).await {
        Ok(consumer) => consumer,
        Err(err) => {
            tracing::error!(error = %err, guidance = err.guidance(), "failed to start consumer");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c, shutting down");
    }
    tracing::info!("shutting down");

    consumer.shutdown().await;
    ExitCode::SUCCESS
}

fn read_password() -> io::Result<String> {
    eprint!("Password: ");
    io::stderr().flush()?;
    rpassword::read_password()
}
