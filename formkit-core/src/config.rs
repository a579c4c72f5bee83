use std::time::Duration;

/// Engine tuning knobs, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// A clean document older than this is reloaded on refresh instead of
    /// re-rendered from cache.
    pub stale_refresh_after: Duration,
    /// Extra delay before a save begins, on top of the mandatory yield
    /// that lets in-flight handlers settle. Zero by default.
    pub save_defer: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stale_refresh_after: Duration::from_secs(120),
            save_defer: Duration::ZERO,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            stale_refresh_after: Duration::from_secs(env_parse(
                "FORMKIT_STALE_REFRESH_SECS",
                120,
            )?),
            save_defer: Duration::from_millis(env_parse("FORMKIT_SAVE_DEFER_MS", 0)?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
