// Configuration for the synthesis server

use std::{path::PathBuf, str::FromStr, time::Duration};

use tts_core::EngineConfig;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    /// Bearer token required on `/api/v1/*` when set.
    pub auth_token: Option<String>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8848,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            auth_token: None,
            engine: EngineConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env_parse("PORT").unwrap_or(defaults.port);
        let bind_addr = env_string("BIND_ADDR").unwrap_or(defaults.bind_addr);

        let rate_limit_per_minute =
            env_parse("RATE_LIMIT_PER_MINUTE").unwrap_or(defaults.rate_limit_per_minute);

        let request_timeout_secs =
            env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(defaults.request_timeout_secs);

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS").ok().map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        let auth_token = env_string("AUTH_TOKEN");

        let mut engine = defaults.engine;
        if let Some(p) = env_string("ENCODER_PATH") {
            engine.encoder_path = PathBuf::from(p);
        }
        if let Some(p) = env_string("DECODER_PATH") {
            engine.decoder_path = PathBuf::from(p);
        }
        if let Some(p) = env_string("CONFIG_PATH") {
            engine.config_path = PathBuf::from(p);
        } else {
            // Voice configs ship next to the encoder as `<encoder>.json`.
            let mut sibling = engine.encoder_path.clone().into_os_string();
            sibling.push(".json");
            engine.config_path = PathBuf::from(sibling);
        }
        if let Some(a) = env_string("ACCELERATOR") {
            engine.accelerator = a;
        }
        engine.decoder_contexts = env_parse("DECODER_CONTEXTS").unwrap_or(engine.decoder_contexts);
        engine.decoder_fixed_window = env_parse("DECODER_FIXED_WINDOW");
        engine.worker_threads = env_parse("SYNTH_THREADS").unwrap_or(engine.worker_threads);
        engine.speaker_id = env_parse("SPEAKER_ID");
        engine.noise_scale = env_parse("NOISE_SCALE");
        engine.length_scale = env_parse("LENGTH_SCALE");
        engine.noise_w = env_parse("NOISE_W");
        engine.sentence_silence_seconds = env_parse("SENTENCE_SILENCE");

        Self {
            bind_addr,
            port,
            rate_limit_per_minute,
            request_timeout_secs,
            cors_allowed_origins,
            auth_token,
            engine,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}
