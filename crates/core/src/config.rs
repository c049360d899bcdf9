use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiments::{ExperimentDefinition, Variant};
use crate::metrics::ModelPricing;
use crate::reflection::StylePolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub confirmation: ConfirmationConfig,
    pub reflection: ReflectionConfig,
    pub experiment: ExperimentConfig,
    pub pricing: PricingConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub top_k: u32,
    pub candidate_multiplier: u32,
    /// Pins the vector weight instead of the per-query adaptive rule.
    pub fixed_alpha: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct ConfirmationConfig {
    pub ttl_seconds: u64,
    pub affirmative_replies: Vec<String>,
    pub negative_replies: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ReflectionConfig {
    pub max_refine_attempts: u32,
    pub banned_phrases: Vec<String>,
    pub max_answer_chars: u32,
    pub min_claim_support: f64,
}

#[derive(Clone, Debug)]
pub struct ExperimentConfig {
    pub id: String,
    /// Empty list disables experimentation entirely.
    pub variants: Vec<Variant>,
}

#[derive(Clone, Debug)]
pub struct PricingConfig {
    pub models: BTreeMap<String, ModelPricing>,
    pub default: ModelPricing,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_model: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://parley.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                base_url: "http://localhost:11434/v1".to_string(),
                model: "llama3.1".to_string(),
                api_key: None,
                timeout_secs: 30,
                max_retries: 2,
            },
            retrieval: RetrievalConfig { top_k: 5, candidate_multiplier: 4, fixed_alpha: None },
            confirmation: ConfirmationConfig {
                ttl_seconds: 300,
                affirmative_replies: default_affirmatives(),
                negative_replies: default_negatives(),
            },
            reflection: ReflectionConfig {
                max_refine_attempts: 2,
                banned_phrases: StylePolicy::default().banned_phrases,
                max_answer_chars: 1_200,
                min_claim_support: 0.5,
            },
            experiment: ExperimentConfig {
                id: "prompt-style-ab".to_string(),
                variants: vec![
                    Variant {
                        id: "control".to_string(),
                        weight: 1,
                        params: crate::experiments::VariantParams::default(),
                    },
                    Variant {
                        id: "citation_forward".to_string(),
                        weight: 1,
                        params: crate::experiments::VariantParams {
                            model: None,
                            prompt_style: crate::experiments::PromptStyle::CitationForward,
                            alpha_override: None,
                        },
                    },
                ],
            },
            pricing: PricingConfig { models: BTreeMap::new(), default: ModelPricing::default() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn default_affirmatives() -> Vec<String> {
    ["yes", "y", "confirm", "do it", "go ahead", "proceed"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_negatives() -> Vec<String> {
    ["no", "n", "cancel", "stop", "don't", "abort"].into_iter().map(str::to_owned).collect()
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("parley.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(retrieval) = patch.retrieval {
            if let Some(top_k) = retrieval.top_k {
                self.retrieval.top_k = top_k;
            }
            if let Some(candidate_multiplier) = retrieval.candidate_multiplier {
                self.retrieval.candidate_multiplier = candidate_multiplier;
            }
            if let Some(fixed_alpha) = retrieval.fixed_alpha {
                self.retrieval.fixed_alpha = Some(fixed_alpha);
            }
        }

        if let Some(confirmation) = patch.confirmation {
            if let Some(ttl_seconds) = confirmation.ttl_seconds {
                self.confirmation.ttl_seconds = ttl_seconds;
            }
            if let Some(affirmative_replies) = confirmation.affirmative_replies {
                self.confirmation.affirmative_replies = affirmative_replies;
            }
            if let Some(negative_replies) = confirmation.negative_replies {
                self.confirmation.negative_replies = negative_replies;
            }
        }

        if let Some(reflection) = patch.reflection {
            if let Some(max_refine_attempts) = reflection.max_refine_attempts {
                self.reflection.max_refine_attempts = max_refine_attempts;
            }
            if let Some(banned_phrases) = reflection.banned_phrases {
                self.reflection.banned_phrases = banned_phrases;
            }
            if let Some(max_answer_chars) = reflection.max_answer_chars {
                self.reflection.max_answer_chars = max_answer_chars;
            }
            if let Some(min_claim_support) = reflection.min_claim_support {
                self.reflection.min_claim_support = min_claim_support;
            }
        }

        if let Some(experiment) = patch.experiment {
            if let Some(id) = experiment.id {
                self.experiment.id = id;
            }
            if let Some(variants) = experiment.variants {
                self.experiment.variants = variants;
            }
        }

        if let Some(pricing) = patch.pricing {
            if let Some(models) = pricing.models {
                self.pricing.models = models;
            }
            if let Some(default) = pricing.default {
                self.pricing.default = default;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PARLEY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("PARLEY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("PARLEY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("PARLEY_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("PARLEY_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PARLEY_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("PARLEY_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("PARLEY_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("PARLEY_RETRIEVAL_TOP_K") {
            self.retrieval.top_k = parse_u32("PARLEY_RETRIEVAL_TOP_K", &value)?;
        }
        if let Some(value) = read_env("PARLEY_RETRIEVAL_CANDIDATE_MULTIPLIER") {
            self.retrieval.candidate_multiplier =
                parse_u32("PARLEY_RETRIEVAL_CANDIDATE_MULTIPLIER", &value)?;
        }
        if let Some(value) = read_env("PARLEY_RETRIEVAL_FIXED_ALPHA") {
            self.retrieval.fixed_alpha = Some(parse_f64("PARLEY_RETRIEVAL_FIXED_ALPHA", &value)?);
        }

        if let Some(value) = read_env("PARLEY_CONFIRMATION_TTL_SECONDS") {
            self.confirmation.ttl_seconds = parse_u64("PARLEY_CONFIRMATION_TTL_SECONDS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_REFLECTION_MAX_REFINE_ATTEMPTS") {
            self.reflection.max_refine_attempts =
                parse_u32("PARLEY_REFLECTION_MAX_REFINE_ATTEMPTS", &value)?;
        }

        let log_level = read_env("PARLEY_LOGGING_LEVEL").or_else(|| read_env("PARLEY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PARLEY_LOGGING_FORMAT").or_else(|| read_env("PARLEY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_retrieval(&self.retrieval)?;
        validate_confirmation(&self.confirmation)?;
        validate_reflection(&self.reflection)?;
        validate_experiment(&self.experiment)?;
        validate_logging(&self.logging)?;
        Ok(())
    }

    pub fn style_policy(&self) -> StylePolicy {
        StylePolicy {
            banned_phrases: self.reflection.banned_phrases.clone(),
            max_answer_chars: self.reflection.max_answer_chars as usize,
            min_claim_support: self.reflection.min_claim_support,
        }
    }

    /// `None` when experimentation is disabled (no variants).
    pub fn experiment_definition(&self) -> Option<ExperimentDefinition> {
        if self.experiment.variants.is_empty() {
            return None;
        }
        Some(ExperimentDefinition {
            id: self.experiment.id.clone(),
            variants: self.experiment.variants.clone(),
        })
    }

    pub fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.confirmation.ttl_seconds as i64)
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    if let Some(env_path) = read_env("PARLEY_CONFIG") {
        let path = PathBuf::from(env_path);
        return path.exists().then_some(path);
    }

    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    let base_url = llm.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_retries > 10 {
        return Err(ConfigError::Validation("llm.max_retries must be at most 10".to_string()));
    }

    Ok(())
}

fn validate_retrieval(retrieval: &RetrievalConfig) -> Result<(), ConfigError> {
    if retrieval.top_k == 0 || retrieval.top_k > 50 {
        return Err(ConfigError::Validation(
            "retrieval.top_k must be in range 1..=50".to_string(),
        ));
    }

    if retrieval.candidate_multiplier == 0 || retrieval.candidate_multiplier > 10 {
        return Err(ConfigError::Validation(
            "retrieval.candidate_multiplier must be in range 1..=10".to_string(),
        ));
    }

    if let Some(alpha) = retrieval.fixed_alpha {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(ConfigError::Validation(
                "retrieval.fixed_alpha must be within [0.0, 1.0]".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_confirmation(confirmation: &ConfirmationConfig) -> Result<(), ConfigError> {
    if confirmation.ttl_seconds == 0 || confirmation.ttl_seconds > 86_400 {
        return Err(ConfigError::Validation(
            "confirmation.ttl_seconds must be in range 1..=86400".to_string(),
        ));
    }

    if confirmation.affirmative_replies.is_empty() {
        return Err(ConfigError::Validation(
            "confirmation.affirmative_replies must not be empty".to_string(),
        ));
    }

    if confirmation.negative_replies.is_empty() {
        return Err(ConfigError::Validation(
            "confirmation.negative_replies must not be empty".to_string(),
        ));
    }

    for reply in &confirmation.affirmative_replies {
        if confirmation.negative_replies.contains(reply) {
            return Err(ConfigError::Validation(format!(
                "confirmation reply `{reply}` appears in both the affirmative and negative sets"
            )));
        }
    }

    Ok(())
}

fn validate_reflection(reflection: &ReflectionConfig) -> Result<(), ConfigError> {
    if reflection.max_refine_attempts > 5 {
        return Err(ConfigError::Validation(
            "reflection.max_refine_attempts must be at most 5".to_string(),
        ));
    }

    if reflection.max_answer_chars == 0 {
        return Err(ConfigError::Validation(
            "reflection.max_answer_chars must be greater than zero".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&reflection.min_claim_support) {
        return Err(ConfigError::Validation(
            "reflection.min_claim_support must be within [0.0, 1.0]".to_string(),
        ));
    }

    Ok(())
}

fn validate_experiment(experiment: &ExperimentConfig) -> Result<(), ConfigError> {
    if experiment.variants.is_empty() {
        return Ok(());
    }

    if experiment.id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "experiment.id must not be empty when variants are configured".to_string(),
        ));
    }

    let mut seen = std::collections::BTreeSet::new();
    for variant in &experiment.variants {
        if variant.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "experiment variant ids must not be empty".to_string(),
            ));
        }
        if !seen.insert(variant.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "experiment variant id `{}` is duplicated",
                variant.id
            )));
        }
        if let Some(alpha) = variant.params.alpha_override {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(ConfigError::Validation(format!(
                    "experiment variant `{}` alpha_override must be within [0.0, 1.0]",
                    variant.id
                )));
            }
        }
    }

    let total: u64 = experiment.variants.iter().map(|variant| u64::from(variant.weight)).sum();
    if total == 0 {
        return Err(ConfigError::Validation(
            "experiment variant weights must sum to a positive total".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    retrieval: Option<RetrievalPatch>,
    confirmation: Option<ConfirmationPatch>,
    reflection: Option<ReflectionPatch>,
    experiment: Option<ExperimentPatch>,
    pricing: Option<PricingPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalPatch {
    top_k: Option<u32>,
    candidate_multiplier: Option<u32>,
    fixed_alpha: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfirmationPatch {
    ttl_seconds: Option<u64>,
    affirmative_replies: Option<Vec<String>>,
    negative_replies: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ReflectionPatch {
    max_refine_attempts: Option<u32>,
    banned_phrases: Option<Vec<String>>,
    max_answer_chars: Option<u32>,
    min_claim_support: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExperimentPatch {
    id: Option<String>,
    variants: Option<Vec<Variant>>,
}

#[derive(Debug, Default, Deserialize)]
struct PricingPatch {
    models: Option<BTreeMap<String, ModelPricing>>,
    default: Option<ModelPricing>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_PARLEY_API_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("parley.toml");
            fs::write(
                &path,
                r#"
[llm]
api_key = "${TEST_PARLEY_API_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let api_key = config
                .llm
                .api_key
                .as_ref()
                .map(|key| key.expose_secret().to_string())
                .unwrap_or_default();
            ensure(api_key == "sk-from-env", "api key should be loaded from environment")?;
            Ok(())
        })();

        clear_vars(&["TEST_PARLEY_API_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LOG_LEVEL", "warn");
        env::set_var("PARLEY_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["PARLEY_LOG_LEVEL", "PARLEY_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("PARLEY_LLM_MODEL", "model-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("parley.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[llm]
model = "model-from-file"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.llm.model == "model-from-env",
                "env model should win over file and defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["PARLEY_DATABASE_URL", "PARLEY_LLM_MODEL"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_RETRIEVAL_TOP_K", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("retrieval.top_k")
            );
            ensure(has_message, "validation failure should mention retrieval.top_k")
        })();

        clear_vars(&["PARLEY_RETRIEVAL_TOP_K"]);
        result
    }

    #[test]
    fn overlapping_confirmation_lexicons_are_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("parley.toml");
        fs::write(
            &path,
            r#"
[confirmation]
affirmative_replies = ["yes", "sure"]
negative_replies = ["no", "sure"]
"#,
        )
        .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected validation failure for overlapping lexicons".to_string()),
            Err(error) => error,
        };

        ensure(
            matches!(error, ConfigError::Validation(ref message) if message.contains("sure")),
            "validation failure should name the overlapping reply",
        )
    }

    #[test]
    fn zero_weight_experiments_are_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("parley.toml");
        fs::write(
            &path,
            r#"
[experiment]
id = "dead-experiment"

[[experiment.variants]]
id = "control"
weight = 0

[[experiment.variants]]
id = "treatment"
weight = 0
"#,
        )
        .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected validation failure for zero weights".to_string()),
            Err(error) => error,
        };

        ensure(
            matches!(error, ConfigError::Validation(ref message) if message.contains("positive total")),
            "validation failure should mention the weight total",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PARLEY_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["PARLEY_LLM_API_KEY"]);
        result
    }
}
