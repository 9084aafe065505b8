//! `lanthrow send`: scan, announce a connect key, find the receiver, push.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{self, JsonConfig, SendConfig};
use crate::discovery::{Beacon, ConnectKey};
use crate::locale::Locale;
use crate::logging;
use crate::streaming::{SendReport, SendSession, TaskConfig};
use crate::sync::prompt_line;
use crate::util::format_size;

/// Command-line input for a send
#[derive(Debug, Default, Clone)]
pub struct SendOptions {
    pub path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub threads: Option<usize>,
    pub split_limit: Option<String>,
}

impl SendOptions {
    fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| config::config_dir().join("send.json"))
    }

    /// Fold command-line overrides into the loaded config.
    pub fn apply(&self, config: &mut SendConfig) {
        if let Some(threads) = self.threads {
            config.thread_count = threads;
        }
        if let Some(limit) = &self.split_limit {
            config.split_limit = limit.clone();
        }
    }
}

/// Number of data connections; 0 means one per CPU.
pub fn effective_threads(configured: usize) -> usize {
    if configured == 0 {
        num_cpus::get()
    } else {
        configured
    }
}

pub fn run_send(opts: SendOptions) -> Result<SendReport> {
    let config_path = opts.config_path();
    let mut config = SendConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    opts.apply(&mut config);

    let split_limit = config.split_limit_bytes()?;
    let threads = effective_threads(config.thread_count);
    let locale = Arc::new(Locale::load(config.lang_file.as_deref())?);
    let _log = logging::init(config.save_logs, &config::data_dir().join("logs"), "send")?;

    let result = send(&opts, threads, split_limit, locale.clone());

    config
        .save(&config_path)
        .with_context(|| format!("failed to save {}", config_path.display()))?;
    tracing::debug!("{}", locale.format("config.saved", &[&config_path.display()]));
    result
}

fn send(opts: &SendOptions, threads: usize, split_limit: u64, locale: Arc<Locale>) -> Result<SendReport> {
    let path = match &opts.path {
        Some(path) => path.clone(),
        None => PathBuf::from(prompt_line(locale.text("send.prompt.path"))?),
    };

    let task = TaskConfig::scan(&path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    tracing::info!(
        kind = ?task.kind,
        path = %task.apex_path.display(),
        files = task.file_count,
        size = %format_size(task.total_size),
        threads,
        "task ready"
    );

    let key = ConnectKey::generate();
    tracing::warn!("{}", locale.format("discovery.key", &[&key]));
    tracing::info!("{}", locale.format("discovery.broadcast", &[&key.port()]));
    let found = Beacon::new(key, tracing::info_span!("beacon")).run()?;
    tracing::info!("{}", locale.format("discovery.found", &[&found.ip, &found.port]));

    let report = SendSession::new(task, threads, split_limit, locale).run(found.addr())?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let mut config = SendConfig::default();
        let opts = SendOptions {
            threads: Some(3),
            split_limit: Some("1MB".into()),
            ..Default::default()
        };
        opts.apply(&mut config);
        assert_eq!(config.thread_count, 3);
        assert_eq!(config.split_limit_bytes().unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = SendConfig::default();
        SendOptions::default().apply(&mut config);
        assert_eq!(config, SendConfig::default());
    }

    #[test]
    fn test_zero_threads_means_cpus() {
        assert_eq!(effective_threads(5), 5);
        assert!(effective_threads(0) >= 1);
    }
}
