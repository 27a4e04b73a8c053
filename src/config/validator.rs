use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub(super) fn require_non_empty(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidConfig(format!("{field} cannot be empty")));
    }
    Ok(())
}

pub(super) fn require_http_url(value: &str, field: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value)
        .map_err(|e| ConfigError::InvalidConfig(format!("{field} is not a valid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "{field} must use http or https, got {other}"
        ))),
    }
}

pub(super) fn require_matrix_user_id(value: &str, field: &str) -> Result<(), ConfigError> {
    let valid = value.starts_with('@')
        && value
            .split_once(':')
            .is_some_and(|(local, server)| local.len() > 1 && !server.is_empty());
    if !valid {
        return Err(ConfigError::InvalidConfig(format!(
            "{field} entry {value:?} is not a Matrix user id"
        )));
    }
    Ok(())
}
