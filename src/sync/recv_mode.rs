//! `lanthrow recv`: take the connect key, answer the sender, receive.

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{self, JsonConfig, RecvConfig};
use crate::discovery::{ConnectKey, Responder};
use crate::locale::Locale;
use crate::logging;
use crate::streaming::{RecvReport, RecvSession};
use crate::sync::{is_yes, prompt_line};
use crate::transport::local_ip;

/// Command-line input for a receive
#[derive(Debug, Default, Clone)]
pub struct RecvOptions {
    pub folder: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub key: Option<String>,
    pub cache: Option<PathBuf>,
}

impl RecvOptions {
    fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| config::config_dir().join("recv.json"))
    }

    pub fn apply(&self, config: &mut RecvConfig) {
        if let Some(cache) = &self.cache {
            config.block_cache = cache.clone();
        }
    }
}

pub fn run_recv(opts: RecvOptions) -> Result<RecvReport> {
    let config_path = opts.config_path();
    let mut config = RecvConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    opts.apply(&mut config);

    let locale = Arc::new(Locale::load(config.lang_file.as_deref())?);
    let _log = logging::init(config.save_logs, &config::data_dir().join("logs"), "recv")?;

    let result = receive(&opts, &config, locale.clone());

    config
        .save(&config_path)
        .with_context(|| format!("failed to save {}", config_path.display()))?;
    tracing::debug!("{}", locale.format("config.saved", &[&config_path.display()]));
    result
}

fn receive(opts: &RecvOptions, config: &RecvConfig, locale: Arc<Locale>) -> Result<RecvReport> {
    let folder = match &opts.folder {
        Some(folder) => folder.clone(),
        None => PathBuf::from(prompt_line(locale.text("recv.prompt.folder"))?),
    };

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).context("failed to listen")?;
    let tcp_port = listener.local_addr()?.port();
    tracing::info!(ip = %local_ip(), "{}", locale.format("recv.listen", &[&tcp_port]));

    let key = match &opts.key {
        Some(key) => key.parse::<ConnectKey>()?,
        None => ask_key(&locale)?,
    };

    tracing::info!("{}", locale.format("discovery.listen", &[&key.port()]));
    let peer = Responder::new(key, tracing::info_span!("responder")).run(tcp_port)?;
    tracing::info!("{}", locale.format("discovery.replied", &[&peer]));

    let session = RecvSession::new(folder, config.block_cache.clone(), locale.clone());
    let report = session.run(&listener, peer, |attempt| {
        prompt_line(&locale.format("recv.prompt.retry", &[&attempt]))
            .map(|answer| is_yes(&answer))
            .unwrap_or(false)
    })?;
    Ok(report)
}

/// Prompt until a well-formed key is entered.
fn ask_key(locale: &Locale) -> Result<ConnectKey> {
    loop {
        let raw = prompt_line(locale.text("recv.prompt.key"))?;
        match raw.parse::<ConnectKey>() {
            Ok(key) => return Ok(key),
            Err(e) => tracing::warn!("{}", e),
        }
    }
}
