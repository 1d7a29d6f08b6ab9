use ::config::Config;

/// Looks up `name.key` first and falls back to the bare `key`.
pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

/// Reads a comma-separated list, dropping empty items.
pub(crate) fn get_namespaced_list(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<Vec<String>, config::ConfigError> {
    let raw = get_namespaced_string(config, name, key)?;
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}

/// Turns a missing key into `None`.
pub(crate) fn optional<T>(
    result: Result<T, config::ConfigError>,
) -> Result<Option<T>, config::ConfigError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
