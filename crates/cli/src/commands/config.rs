use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use parley_core::config::{AppConfig, LoadOptions};
use toml::Value;

use crate::commands::{CommandResult, FailureClass};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                FailureClass::ConfigValidation,
                format!("configuration issue: {error}"),
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", &["PARLEY_DATABASE_URL"]),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", &["PARLEY_DATABASE_MAX_CONNECTIONS"]),
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        source("database.timeout_secs", &["PARLEY_DATABASE_TIMEOUT_SECS"]),
    ));

    lines.push(render_line(
        "llm.base_url",
        &config.llm.base_url,
        source("llm.base_url", &["PARLEY_LLM_BASE_URL"]),
    ));
    lines.push(render_line("llm.model", &config.llm.model, source("llm.model", &["PARLEY_LLM_MODEL"])));
    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    lines.push(render_line(
        "llm.api_key",
        llm_api_key,
        source("llm.api_key", &["PARLEY_LLM_API_KEY"]),
    ));
    lines.push(render_line(
        "llm.timeout_secs",
        &config.llm.timeout_secs.to_string(),
        source("llm.timeout_secs", &["PARLEY_LLM_TIMEOUT_SECS"]),
    ));
    lines.push(render_line(
        "llm.max_retries",
        &config.llm.max_retries.to_string(),
        source("llm.max_retries", &["PARLEY_LLM_MAX_RETRIES"]),
    ));

    lines.push(render_line(
        "retrieval.top_k",
        &config.retrieval.top_k.to_string(),
        source("retrieval.top_k", &["PARLEY_RETRIEVAL_TOP_K"]),
    ));
    lines.push(render_line(
        "retrieval.candidate_multiplier",
        &config.retrieval.candidate_multiplier.to_string(),
        source("retrieval.candidate_multiplier", &["PARLEY_RETRIEVAL_CANDIDATE_MULTIPLIER"]),
    ));
    let fixed_alpha = config
        .retrieval
        .fixed_alpha
        .map(|alpha| alpha.to_string())
        .unwrap_or_else(|| "<unset>".to_string());
    lines.push(render_line(
        "retrieval.fixed_alpha",
        &fixed_alpha,
        source("retrieval.fixed_alpha", &["PARLEY_RETRIEVAL_FIXED_ALPHA"]),
    ));

    lines.push(render_line(
        "confirmation.ttl_seconds",
        &config.confirmation.ttl_seconds.to_string(),
        source("confirmation.ttl_seconds", &["PARLEY_CONFIRMATION_TTL_SECONDS"]),
    ));

    lines.push(render_line(
        "reflection.max_refine_attempts",
        &config.reflection.max_refine_attempts.to_string(),
        source("reflection.max_refine_attempts", &["PARLEY_REFLECTION_MAX_REFINE_ATTEMPTS"]),
    ));

    lines.push(render_line("experiment.id", &config.experiment.id, source("experiment.id", &[])));
    let variants = if config.experiment.variants.is_empty() {
        "<none>".to_string()
    } else {
        config
            .experiment
            .variants
            .iter()
            .map(|variant| variant.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    lines.push(render_line(
        "experiment.variants",
        &variants,
        source("experiment.variants", &[]),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", &["PARLEY_LOGGING_LEVEL", "PARLEY_LOG_LEVEL"]),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", &["PARLEY_LOGGING_FORMAT", "PARLEY_LOG_FORMAT"]),
    ));

    CommandResult { exit_code: 0, output: lines.join("\n") }
}

/// Mirrors the loader's resolution order: `PARLEY_CONFIG`, then the
/// conventional file locations.
fn detect_config_path() -> Option<PathBuf> {
    if let Some(env_path) = env::var_os("PARLEY_CONFIG") {
        let path = PathBuf::from(env_path);
        return path.exists().then_some(path);
    }

    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    for env_key in env_keys {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
