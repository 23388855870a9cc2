//! Environment overrides for tunables.

use super::settings::Settings;

const POLL_INTERVAL_ENV: &str = "TURNSTILE_POLL_INTERVAL_MS";
const MAX_POLL_ITERATIONS_ENV: &str = "TURNSTILE_MAX_POLL_ITERATIONS";
const STREAM_IDLE_TIMEOUT_ENV: &str = "TURNSTILE_STREAM_IDLE_TIMEOUT_MS";
const HANDLE_CAPACITY_ENV: &str = "TURNSTILE_HANDLE_CAPACITY";
const DELEGATION_TIMEOUT_ENV: &str = "TURNSTILE_DELEGATION_TIMEOUT_SECS";

/// Apply overrides from `lookup` (normally `std::env::var`). Values that are
/// not positive integers are ignored.
pub(super) fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| lookup(key).as_deref().and_then(parse_positive_usize);

    if let Some(value) = read(POLL_INTERVAL_ENV) {
        settings.runs.poll_interval_ms = value as u64;
    }
    if let Some(value) = read(MAX_POLL_ITERATIONS_ENV) {
        settings.runs.max_poll_iterations = value;
    }
    if let Some(value) = read(STREAM_IDLE_TIMEOUT_ENV) {
        settings.stream.idle_timeout_ms = value as u64;
    }
    if let Some(value) = read(HANDLE_CAPACITY_ENV) {
        settings.cache.handle_capacity = value;
    }
    if let Some(value) = read(DELEGATION_TIMEOUT_ENV) {
        settings.delegation.timeout_secs = value as u64;
    }
}

fn parse_positive_usize(value: &str) -> Option<usize> {
    let parsed = value.trim().parse::<usize>().ok()?;
    if parsed == 0 {
        None
    } else {
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn valid_overrides_apply() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                (POLL_INTERVAL_ENV, "25"),
                (HANDLE_CAPACITY_ENV, " 4 "),
                (DELEGATION_TIMEOUT_ENV, "9"),
            ]),
        );
        assert_eq!(settings.runs.poll_interval_ms, 25);
        assert_eq!(settings.cache.handle_capacity, 4);
        assert_eq!(settings.delegation.timeout_secs, 9);
    }

    #[test]
    fn zero_and_garbage_are_ignored() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            env(&[(MAX_POLL_ITERATIONS_ENV, "0"), (STREAM_IDLE_TIMEOUT_ENV, "soon")]),
        );
        assert_eq!(settings, Settings::default());
    }
}
