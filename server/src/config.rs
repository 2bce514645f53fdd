use std::path::PathBuf;
use std::time::Duration;

/// Process-wide tunables, read once from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
	pub data_dir: PathBuf,
	pub config_file: PathBuf,
	pub monitor_interval: Duration,
	pub monitor_error_backoff: Duration,
	pub start_timeout: Duration,
	pub stop_grace: Duration,
	pub restart_pause: Duration,
	pub start_stagger: Duration,
	pub cache_capacity: usize,
	pub cache_ttl: Duration,
	pub user_cooldown: Duration,
	pub generation_timeout: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from("./data"),
			config_file: PathBuf::from("grugthink_config.json"),
			monitor_interval: Duration::from_millis(30_000),
			monitor_error_backoff: Duration::from_millis(60_000),
			start_timeout: Duration::from_millis(30_000),
			stop_grace: Duration::from_millis(10_000),
			restart_pause: Duration::from_millis(2_000),
			start_stagger: Duration::from_millis(5_000),
			cache_capacity: 100,
			cache_ttl: Duration::from_millis(300_000),
			user_cooldown: Duration::from_millis(5_000),
			generation_timeout: Duration::from_millis(60_000),
		}
	}
}

impl Config {
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		let d = Self::default();
		Ok(Self {
			data_dir: std::env::var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
			config_file: std::env::var("CONFIG_FILE").map(PathBuf::from).unwrap_or(d.config_file),
			monitor_interval: env_ms("MONITOR_INTERVAL_MS")?.unwrap_or(d.monitor_interval),
			monitor_error_backoff: env_ms("MONITOR_ERROR_BACKOFF_MS")?.unwrap_or(d.monitor_error_backoff),
			start_timeout: env_ms("START_TIMEOUT_MS")?.unwrap_or(d.start_timeout),
			stop_grace: env_ms("STOP_GRACE_MS")?.unwrap_or(d.stop_grace),
			restart_pause: env_ms("RESTART_PAUSE_MS")?.unwrap_or(d.restart_pause),
			start_stagger: env_ms("START_STAGGER_MS")?.unwrap_or(d.start_stagger),
			cache_capacity: env_parse::<usize>("CACHE_CAPACITY")?.unwrap_or(d.cache_capacity),
			cache_ttl: env_ms("CACHE_TTL_MS")?.unwrap_or(d.cache_ttl),
			user_cooldown: env_ms("USER_COOLDOWN_MS")?.unwrap_or(d.user_cooldown),
			generation_timeout: env_ms("GENERATION_TIMEOUT_MS")?.unwrap_or(d.generation_timeout),
		})
	}
}

fn env_parse<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
	T::Err: std::fmt::Display,
{
	match std::env::var(key) {
		Ok(raw) if !raw.trim().is_empty() => raw
			.trim()
			.parse::<T>()
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
		_ => Ok(None),
	}
}

fn env_ms(key: &str) -> anyhow::Result<Option<Duration>> {
	Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_millisecond_overrides() {
		std::env::set_var("GRUGTHINK_TEST_MS", "1500");
		assert_eq!(env_ms("GRUGTHINK_TEST_MS").unwrap(), Some(Duration::from_millis(1500)));
		std::env::set_var("GRUGTHINK_TEST_BAD", "soon");
		assert!(env_ms("GRUGTHINK_TEST_BAD").is_err());
		assert_eq!(env_ms("GRUGTHINK_TEST_UNSET").unwrap(), None);
	}

	#[test]
	fn defaults_match_documented_values() {
		let d = Config::default();
		assert_eq!(d.monitor_interval, Duration::from_secs(30));
		assert_eq!(d.cache_capacity, 100);
		assert_eq!(d.cache_ttl, Duration::from_secs(300));
	}
}
