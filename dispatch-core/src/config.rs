//! Process configuration, read once from the environment at startup (§6.4).

use std::env;
use std::time::Duration;

use anyhow::Context;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("parsing {key}=\"{raw}\"")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => {
            anyhow::bail!("{key} is not valid unicode")
        }
    }
}

/// Every tunable named in §6.4, plus the signing secret. Built once via
/// [`Config::from_env`] and shared as `Arc<Config>`.
#[derive(Debug, Clone)]
pub struct Config {
    pub dispatch_tick: Duration,
    pub offer_ttl: Duration,
    pub global_deadline: Duration,
    pub initial_radius_km: f64,
    pub max_radius_km: f64,
    pub radius_growth: f64,
    pub max_providers_per_wave: usize,
    pub dispatch_parallelism: usize,
    pub accept_retry_max: u32,
    pub location_freshness: Duration,
    pub lead_time: Duration,
    pub max_msg_per_min: u32,
    pub max_frame_bytes: usize,
    pub max_conn_per_ip: u32,
    pub auth_timeout: Duration,
    pub jwt_secret: String,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = env::var("DISPATCH_JWT_SECRET")
            .context("DISPATCH_JWT_SECRET must be set (signing secret for bearer tokens)")?;

        Ok(Self {
            dispatch_tick: Duration::from_secs(env_parse("DISPATCH_TICK_SECS", 5)?),
            offer_ttl: Duration::from_secs(env_parse("OFFER_TTL_SECS", 300)?),
            global_deadline: Duration::from_secs(env_parse("GLOBAL_DEADLINE_SECS", 300)?),
            initial_radius_km: env_parse("INITIAL_RADIUS_KM", 15.0)?,
            max_radius_km: env_parse("MAX_RADIUS_KM", 50.0)?,
            radius_growth: env_parse("RADIUS_GROWTH", 1.5)?,
            max_providers_per_wave: env_parse("MAX_PROVIDERS_PER_WAVE", 5usize)?,
            dispatch_parallelism: env_parse("DISPATCH_PARALLELISM", 16usize)?,
            accept_retry_max: env_parse("ACCEPT_RETRY_MAX", 3u32)?,
            location_freshness: Duration::from_secs(env_parse("LOCATION_FRESHNESS_SECS", 600)?),
            lead_time: Duration::from_secs(env_parse("LEAD_TIME_SECS", 1800)?),
            max_msg_per_min: env_parse("MAX_MSG_PER_MIN", 60u32)?,
            max_frame_bytes: env_parse("MAX_FRAME_BYTES", 16 * 1024usize)?,
            max_conn_per_ip: env_parse("MAX_CONN_PER_IP", 5u32)?,
            auth_timeout: Duration::from_secs(env_parse("AUTH_TIMEOUT_SECS", 30)?),
            jwt_secret,
            bind_addr: env::var("DISPATCH_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        env::remove_var("DISPATCH_CORE_TEST_KEY_UNSET");
        let v: u32 = env_parse("DISPATCH_CORE_TEST_KEY_UNSET", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn env_parse_reports_context_on_bad_value() {
        env::set_var("DISPATCH_CORE_TEST_KEY_BAD", "not-a-number");
        let err = env_parse::<u32>("DISPATCH_CORE_TEST_KEY_BAD", 0).unwrap_err();
        assert!(err.to_string().contains("DISPATCH_CORE_TEST_KEY_BAD"));
        env::remove_var("DISPATCH_CORE_TEST_KEY_BAD");
    }
}
