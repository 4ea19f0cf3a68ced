use std::{collections::HashMap, fs};

#[derive(Debug)]
pub struct Settings {
    pub server_url: String,
    pub download_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".into(),
            download_dir: "./downloads".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("download_dir") {
                settings.download_dir = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("VERIFY_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Ok(v) = std::env::var("VERIFY_DOWNLOAD_DIR") {
        settings.download_dir = v;
    }
    if let Ok(v) = std::env::var("APP__DOWNLOAD_DIR") {
        settings.download_dir = v;
    }

    settings
}

/// Endpoint paths are joined with a bare '/', so strip any trailing one.
pub fn normalize_server_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}
