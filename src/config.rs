use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_KEEPALIVE_MS: u64 = 10_000;
pub const FALLBACK_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Deployment presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    Production,
    Localdev,
    Remotedev,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_server: String,
    pub ws_server: String,
    pub web_server: String,
    /// TURN relay URL. When set, every listener connection fetches fresh
    /// credentials for it.
    pub ice_server: Option<String>,
    pub ws_keepalive: Duration,
    pub debug: bool,
}

impl Settings {
    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::Production => Self {
                api_server: "https://radiowo.edwlee.dev/api".into(),
                ws_server: "wss://radiowo.edwlee.dev/ws".into(),
                web_server: "https://radiowo.edwlee.dev".into(),
                ice_server: Some("turn:radiowo.edwlee.dev:3478".into()),
                ws_keepalive: Duration::from_millis(DEFAULT_KEEPALIVE_MS),
                debug: false,
            },
            Profile::Localdev => Self {
                api_server: "http://localhost:3030".into(),
                ws_server: "ws://localhost:3030".into(),
                web_server: "http://localhost:5000".into(),
                ice_server: None,
                ws_keepalive: Duration::from_millis(DEFAULT_KEEPALIVE_MS),
                debug: true,
            },
            Profile::Remotedev => Self {
                api_server: "http://192.168.1.128:58008/api".into(),
                ws_server: "ws://192.168.1.128:58008/ws".into(),
                web_server: "http://192.168.1.128:58008".into(),
                ice_server: None,
                ws_keepalive: Duration::from_millis(DEFAULT_KEEPALIVE_MS),
                debug: true,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ws = self.ws_server.trim().to_ascii_lowercase();
        if !ws.starts_with("ws://") && !ws.starts_with("wss://") {
            return Err(Error::config(format!(
                "signaling server must be a ws:// or wss:// URL, got {}",
                self.ws_server
            )));
        }
        if self.ws_keepalive.is_zero() {
            return Err(Error::config("keepalive interval must be positive"));
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(name = "radiowo-host")]
#[command(about = "Hosts a radiowo room and fans captured audio out to listeners")]
pub struct Cli {
    /// Deployment preset the other options override
    #[arg(long = "env", env = "RADIOWO_ENV", value_enum, default_value = "localdev")]
    pub profile: Profile,

    /// API server base URL (TURN credentials)
    #[arg(long, env = "RADIOWO_API_SERVER")]
    pub api_server: Option<String>,

    /// Signaling hub base URL
    #[arg(long, env = "RADIOWO_WS_SERVER")]
    pub ws_server: Option<String>,

    /// TURN relay URL
    #[arg(long, env = "RADIOWO_ICE_SERVER")]
    pub ice_server: Option<String>,

    /// Hub keepalive interval in milliseconds
    #[arg(long, env = "RADIOWO_KEEPALIVE_MS")]
    pub keepalive_ms: Option<u64>,

    /// Verbose logging
    #[arg(long, env = "RADIOWO_DEBUG")]
    pub debug: bool,
}

impl Cli {
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::for_profile(self.profile);
        if let Some(api) = &self.api_server {
            settings.api_server = api.clone();
        }
        if let Some(ws) = &self.ws_server {
            settings.ws_server = ws.clone();
        }
        if let Some(ice) = &self.ice_server {
            settings.ice_server = Some(ice.clone()).filter(|s| !s.trim().is_empty());
        }
        if let Some(ms) = self.keepalive_ms {
            settings.ws_keepalive = Duration::from_millis(ms);
        }
        settings.debug |= self.debug;
        settings.validate()?;
        Ok(settings)
    }
}
