use std::{env, path::PathBuf, time::Duration};

const DEFAULT_GRAPH_API_URL: &str = "https://graph.facebook.com/v21.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub database_max_connections: u32,
    pub seed_file: Option<PathBuf>,
    /// Shared secret for `X-Hub-Signature-256`. Empty rejects every delivery.
    pub app_secret: String,
    pub verify_token: String,
    pub graph_api_url: String,
    pub provider_timeout: Duration,
    pub media_storage_dir: PathBuf,
    pub public_base_url: String,
    pub log_level: String,
    pub log_json: bool,
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);
        let store_backend = match env_text("STORE").to_ascii_lowercase().as_str() {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Postgres,
        };
        let public_base_url = env::var("API_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();
        let graph_api_url = Some(env_text("WHATSAPP_GRAPH_URL"))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_GRAPH_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            port,
            store_backend,
            database_url: resolve_database_url(),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(10),
            seed_file: Some(env_text("SEED_FILE"))
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            app_secret: env_text("WHATSAPP_APP_SECRET"),
            verify_token: env_text("WHATSAPP_VERIFY_TOKEN"),
            graph_api_url,
            provider_timeout: Duration::from_secs(
                env::var("PROVIDER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(15),
            ),
            media_storage_dir: env::var("MEDIA_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./media_uploads")),
            public_base_url,
            log_level: Some(env_text("LOG_LEVEL"))
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "info".to_string()),
            log_json: env_text("LOG_FORMAT").eq_ignore_ascii_case("json"),
        }
    }
}

fn env_text(key: &str) -> String {
    env::var(key).unwrap_or_default().trim().to_string()
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "wa_crm".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
