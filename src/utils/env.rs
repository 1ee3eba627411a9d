/// Prefix checked before the bare variable name.
pub const ENV_PREFIX: &str = "SUBGATE_";

/// Get environment variable with SUBGATE_ prefix, falling back to unprefixed version
///
/// Checks `SUBGATE_{key}` first, then `{key}`, so deployments can either namespace
/// their settings or share conventional names like `LOG_LEVEL`.
///
/// # Examples
///
/// ```rust,ignore
/// // Checks SUBGATE_TRIAL_DAYS first, then TRIAL_DAYS
/// let trial_days = get_env_with_prefix("TRIAL_DAYS");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Read and parse a prefixed environment variable.
///
/// Returns `Ok(None)` when the variable is unset and `Err` with the offending
/// key and raw value when it is set but does not parse.
pub fn parse_env_with_prefix<T: std::str::FromStr>(
    key: &str,
) -> Result<Option<T>, (String, String)> {
    match get_env_with_prefix(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| (key.to_string(), raw)),
        None => Ok(None),
    }
}
