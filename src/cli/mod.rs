use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- UI Args ---
    /// Display surface (console, websocket)
    #[arg(long, env = "UI", default_value = "console")]
    pub ui: String,

    // --- History Store Args ---
    /// History chat store type (jsonl, memory)
    #[arg(long, env = "HISTORY_TYPE", default_value = "jsonl")]
    pub history_type: String,

    /// JSON-lines file the conversation is appended to.
    #[arg(long, env = "HISTORY_FILE", default_value = "chat_app_messages.jsonl")]
    pub history_file: String,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (openai, ollama)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "openai")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., gpt-4o-mini, llama3.1)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    // --- Agent Args ---
    /// System prompt sent at the start of a new conversation. Empty disables it.
    #[arg(
        long,
        env = "SYSTEM_PROMPT",
        default_value = "You are a friendly location assistant helping users find and visualize places on maps by using the create_location_map() tool. Primary Functions: \u{2022} Provide brief location info with nearby attractions \u{2022} Give concise location details \u{2022} Never ask permission - just show the map"
    )]
    pub system_prompt: String,

    /// How the model answers: streamed text, or a structured {location, response} result (text, structured)
    #[arg(long, env = "RESPONSE_MODE", default_value = "text")]
    pub response_mode: String,

    /// Maximum model calls per user turn.
    #[arg(long, env = "MAX_TOOL_ROUNDS", default_value = "5")]
    pub max_tool_rounds: usize,

    /// Maximum retry prompts sent back to the model per user turn.
    #[arg(long, env = "MAX_RETRIES", default_value = "1")]
    pub max_retries: usize,

    /// Minimum interval between partial display updates, in milliseconds.
    #[arg(long, env = "STREAM_DEBOUNCE_MS", default_value = "10")]
    pub stream_debounce_ms: u64,

    // --- Map Args ---
    /// Base URL of the Nominatim geocoding service.
    #[arg(long, env = "GEOCODER_URL", default_value = "https://nominatim.openstreetmap.org")]
    pub geocoder_url: String,

    /// User-Agent sent to the geocoder (Nominatim requires one per application).
    #[arg(long, env = "GEOCODER_USER_AGENT", default_value = "mapchat")]
    pub geocoder_user_agent: String,

    /// Latitude shown when a place cannot be geocoded.
    #[arg(long, env = "FALLBACK_LAT", default_value = "39.949610", allow_hyphen_values = true)]
    pub fallback_lat: f64,

    /// Longitude shown when a place cannot be geocoded.
    #[arg(long, env = "FALLBACK_LON", default_value = "-75.150282", allow_hyphen_values = true)]
    pub fallback_lon: f64,

    /// Initial zoom level of generated maps.
    #[arg(long, env = "MAP_ZOOM", default_value = "16")]
    pub map_zoom: u8,

    // --- Server Args ---
    /// Host address and port for the websocket UI to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional API Key required for clients to connect to the WebSocket server. If set, clients must provide this key.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_demo() {
        let args = Args::try_parse_from(["mapchat"]).unwrap();
        assert_eq!(args.ui, "console");
        assert_eq!(args.history_file, "chat_app_messages.jsonl");
        assert_eq!(args.chat_llm_type, "openai");
        assert_eq!(args.response_mode, "text");
        assert!((args.fallback_lat - 39.94961).abs() < 1e-9);
        assert!((args.fallback_lon + 75.150282).abs() < 1e-9);
        assert_eq!(args.map_zoom, 16);
    }

    #[test]
    fn negative_coordinates_parse() {
        let args = Args::try_parse_from(
            ["mapchat", "--fallback-lat", "-33.8688", "--fallback-lon", "151.2093", "--ui", "websocket"]
        ).unwrap();
        assert!((args.fallback_lat + 33.8688).abs() < 1e-9);
        assert_eq!(args.ui, "websocket");
    }
}
