//! Runs a burst of chats from several users through the coordinator against an
//! OpenAI-compatible endpoint, printing one session live.
//!
//! ```sh
//! OPENAI_API_KEY=... OPENAI_MODEL_NAME=gpt-4o-mini cargo run -p openai_client --example concurrent_chat
//! ```

use std::{env, sync::Arc, time::Duration};

use chat_coordinator::coordination::{
    CoordinatorSettings,
    coordinator::ChatCoordinator,
    error::AdmissionError,
    persistence::InMemoryPersistence,
    request::{ChatMessage, ChatRequest, RequestId, SessionId},
    session::{SessionObserver, SessionOutcome},
};
use openai_client::{OpenAIClient, OpenAIClientConfig};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const OPENAI_MODEL_NAME_ENV_VAR: &str = "OPENAI_MODEL_NAME";
const DEFAULT_MODEL_NAME: &str = "gpt-4o-mini";
const LOG_FILE_NAME: &str = "concurrent_chat.log";
const USERS: usize = 4;
const CHATS_PER_USER: usize = 4;

const PROMPTS: &[&str] = &[
    "Name three prime numbers.",
    "What is the boiling point of water in Kelvin?",
    "Give one synonym for 'quick'.",
    "What does HTTP stand for?",
];

/// Prints the first user's first session as it streams.
struct Printer;

impl SessionObserver for Printer {
    fn on_chunk(&mut self, _request_id: &RequestId, text: &str) {
        print!("{text}");
    }

    fn on_complete(&mut self, request_id: &RequestId, _content: &str) {
        println!();
        info!(%request_id, "Watched session completed");
    }

    fn on_error(&mut self, request_id: &RequestId, outcome: &SessionOutcome) {
        println!();
        warn!(%request_id, ?outcome, "Watched session ended without a reply");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let file_appender = tracing_appender::rolling::daily(".", LOG_FILE_NAME);
    let (non_blocking_appender, _guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = "info,chat_coordinator=debug,openai_client=debug";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);
    let file_layer = fmt::layer()
        .with_writer(non_blocking_appender)
        .with_ansi(false)
        .with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    dotenvy::dotenv().ok();

    let settings = CoordinatorSettings::from_env();
    settings.validate()?;
    let client_config = OpenAIClientConfig::from_env()?;
    let model =
        env::var(OPENAI_MODEL_NAME_ENV_VAR).unwrap_or_else(|_| DEFAULT_MODEL_NAME.to_owned());
    info!(
        target: "config",
        base_url = client_config.base_url(),
        model = %model,
        ?settings,
        "Starting concurrent chat demo"
    );

    let backend = Arc::new(OpenAIClient::new(client_config)?);
    let persistence = Arc::new(InMemoryPersistence::default());
    let coordinator = ChatCoordinator::new(settings, backend, persistence.clone())?;

    let watched = SessionId::from("user-0-chat-0");
    let _printer = coordinator.subscribe_with(&watched, Printer);

    for turn in 0..CHATS_PER_USER {
        for user in 0..USERS {
            let prompt = PROMPTS[(user + turn) % PROMPTS.len()];
            let request = ChatRequest::new(
                format!("user-{user}"),
                format!("user-{user}-chat-{turn}"),
                model.as_str(),
                vec![
                    ChatMessage::system("Answer in one short sentence."),
                    ChatMessage::user(prompt),
                ],
            );
            match coordinator.submit(request) {
                Ok(request_id) => info!(%request_id, user, turn, "Submitted"),
                Err(AdmissionError::RateLimited { retry_after }) => {
                    warn!(user, retry_after_ms = retry_after.as_millis() as u64, "Rate limited")
                }
                Err(error) => warn!(user, %error, "Rejected"),
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    coordinator.wait_idle().await;
    coordinator.shutdown();

    let status = coordinator.status();
    info!(
        completed = status.completed_requests,
        failed = status.failed_requests,
        rejected = status.rejected_requests,
        retried = status.retried_requests,
        peak = status.concurrent_peak,
        avg_ms = status.average_processing_time,
        "All chats finished"
    );
    println!("{}", serde_json::to_string_pretty(&status)?);
    println!("{} assistant messages stored", persistence.len());
    Ok(())
}
