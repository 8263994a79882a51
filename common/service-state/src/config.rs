use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9000")]
    pub port: u16,

    /// How long the worker waits for the coordinator to hand over the signaling channel.
    #[envconfig(from = "SERVICE_STATE_HANDSHAKE_TIMEOUT_MS", default = "10000")]
    pub handshake_timeout: EnvMsDuration,

    /// OS thread name of the health checker worker.
    #[envconfig(from = "SERVICE_STATE_WORKER_NAME", default = "health-checker-worker")]
    pub worker_name: String,

    #[envconfig(from = "SERVICE_STATE_TRAP_SIGNALS", default = "true")]
    pub trap_signals: bool,

    /// Upper bound on the wait for live beacons once shutdown begins.
    #[envconfig(from = "SERVICE_STATE_BEACON_TIMEOUT_MS", default = "60000")]
    pub beacon_timeout: EnvMsDuration,

    /// Upper bound on each registered shutdown handler.
    #[envconfig(from = "SERVICE_STATE_SHUTDOWN_HANDLER_TIMEOUT_MS", default = "60000")]
    pub shutdown_handler_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            handshake_timeout: EnvMsDuration(time::Duration::from_millis(10_000)),
            worker_name: "health-checker-worker".to_string(),
            trap_signals: true,
            beacon_timeout: EnvMsDuration(time::Duration::from_millis(60_000)),
            shutdown_handler_timeout: EnvMsDuration(time::Duration::from_millis(60_000)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
