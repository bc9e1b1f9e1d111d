pub mod agent;
pub mod cli;
pub mod console;
pub mod geo;
pub mod history;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;
pub mod session;
pub mod tools;

use agent::ChatAgent;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("UI: {}", args.ui);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Response Mode: {}", args.response_mode);
    info!("History Store Type: {}", args.history_type);
    info!("History File: {}", args.history_file);
    info!("Geocoder URL: {}", args.geocoder_url);
    info!("Fallback Coordinate: ({}, {})", args.fallback_lat, args.fallback_lon);
    if args.ui == "websocket" {
        info!("Server Address: {}", args.server_addr);
    }
    info!("-------------------------");

    let agent = Arc::new(ChatAgent::new(&args)?);

    match args.ui.to_lowercase().as_str() {
        "console" => console::run_console(agent).await,
        "websocket" | "ws" => {
            info!("Starting server on: {}", args.server_addr);
            let server = Server::new(args.server_addr.clone(), agent, args.server_api_key.clone());
            server.run().await
        }
        other => Err(format!("Unsupported UI: {}", other).into()),
    }
}
