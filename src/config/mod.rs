use std::env;
use std::time::Duration;

pub struct Config {
    pub relay: RelayConfig,
    pub rtc: RtcConfig,
    pub proctoring: ProctoringConfig,
}

pub struct RelayConfig {
    pub url: String,
}

pub struct RtcConfig {
    pub stun_url: String,
    /// How long a failed/disconnected link may linger before teardown
    pub failure_grace: Duration,
}

pub struct ProctoringConfig {
    pub detector_url: Option<String>,
    pub detector_interval: Duration,
    pub default_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            relay: RelayConfig {
                url: env::var("RELAY_URL")
                    .unwrap_or_else(|_| "ws://127.0.0.1:8080/relay".to_string()),
            },
            rtc: RtcConfig {
                stun_url: env::var("STUN_SERVER_URL")
                    .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string()),
                failure_grace: Duration::from_secs(
                    env::var("LINK_FAILURE_GRACE_SECS")
                        .unwrap_or_else(|_| "10".to_string())
                        .parse()
                        .unwrap_or(10),
                ),
            },
            proctoring: ProctoringConfig {
                detector_url: env::var("DETECTOR_URL").ok(),
                detector_interval: Duration::from_secs(
                    env::var("DETECTOR_INTERVAL_SECS")
                        .unwrap_or_else(|_| "3".to_string())
                        .parse()
                        .unwrap_or(3),
                ),
                default_max_attempts: env::var("DEFAULT_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig {
                url: "ws://127.0.0.1:8080/relay".to_string(),
            },
            rtc: RtcConfig {
                stun_url: "stun:stun.l.google.com:19302".to_string(),
                failure_grace: Duration::from_secs(10),
            },
            proctoring: ProctoringConfig {
                detector_url: None,
                detector_interval: Duration::from_secs(3),
                default_max_attempts: 3,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.proctoring.default_max_attempts, 3);
        assert_eq!(config.proctoring.detector_interval, Duration::from_secs(3));
        assert!(config.proctoring.detector_url.is_none());
    }

    #[test]
    fn test_default_grace_period() {
        let config = Config::default();
        assert_eq!(config.rtc.failure_grace, Duration::from_secs(10));
    }
}
