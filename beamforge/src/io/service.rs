//! Ephemeral backing services (e.g. a database) started for one validation run.

use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::io::config::ServiceConfig;
use crate::io::process::{CommandOutput, command_from_argv, run_command_with_timeout};
use crate::io::sandbox::SandboxError;

/// A running service. Must be stopped with [`EphemeralService::stop`].
#[derive(Debug)]
pub struct EphemeralService {
    id: String,
    port: u16,
    config: ServiceConfig,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl EphemeralService {
    /// Start the service and poll its health command until it succeeds.
    ///
    /// Health polling is bounded by `health_attempts`. On timeout the service is
    /// stopped and [`SandboxError::ServiceUnhealthy`] is returned.
    #[instrument(skip_all)]
    pub async fn start(
        config: &ServiceConfig,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<Self> {
        let service = Self {
            id: generate_short_id(),
            port: free_local_port()?,
            config: config.clone(),
            timeout,
            output_limit_bytes,
        };
        debug!(id = %service.id, port = service.port, "starting ephemeral service");

        let started = service.run(&service.config.start).await?;
        if !started.success() {
            service.stop().await;
            return Err(SandboxError::ServiceStart(started.report("service start")).into());
        }

        let mut last = CommandOutput::default();
        for attempt in 1..=service.config.health_attempts {
            last = service.run(&service.config.health).await?;
            if last.success() {
                info!(id = %service.id, attempt, "ephemeral service healthy");
                return Ok(service);
            }
            debug!(id = %service.id, attempt, "service not healthy yet");
            tokio::time::sleep(Duration::from_millis(service.config.health_interval_ms)).await;
        }

        let attempts = service.config.health_attempts;
        warn!(id = %service.id, attempts, "ephemeral service never became healthy");
        service.stop().await;
        Err(SandboxError::ServiceUnhealthy {
            attempts,
            last_output: last.report("health check"),
        }
        .into())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Container network that sandbox containers join while the service runs.
    pub fn network(&self) -> String {
        self.substitute(&self.config.network)
    }

    /// Environment to pass to commands that use the service.
    pub fn env(&self) -> Vec<(String, String)> {
        self.config
            .env
            .iter()
            .map(|(key, value)| (key.clone(), self.substitute(value)))
            .collect()
    }

    /// Best-effort teardown. Failures are logged, never returned.
    pub async fn stop(self) {
        if self.config.stop.is_empty() {
            return;
        }
        match self.run(&self.config.stop).await {
            Ok(output) if output.success() => debug!(id = %self.id, "ephemeral service stopped"),
            Ok(output) => warn!(id = %self.id, report = %output.report("service stop"), "service stop failed"),
            Err(err) => warn!(id = %self.id, err = %err, "service stop failed"),
        }
    }

    fn substitute(&self, value: &str) -> String {
        value
            .replace("{id}", &self.id)
            .replace("{port}", &self.port.to_string())
    }

    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let argv: Vec<String> = argv.iter().map(|arg| self.substitute(arg)).collect();
        let cmd = command_from_argv(&argv)?;
        run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes).await
    }
}

/// A loopback port that was free a moment ago, for `{port}` substitution.
fn free_local_port() -> Result<u16> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("reserve local service port")?;
    Ok(listener.local_addr().context("read reserved port")?.port())
}

pub(crate) fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(8)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn service(start: &str, health: &str, attempts: u32) -> ServiceConfig {
        ServiceConfig {
            start: vec!["sh".to_string(), "-c".to_string(), start.to_string()],
            health: vec!["sh".to_string(), "-c".to_string(), health.to_string()],
            stop: vec!["true".to_string()],
            env: BTreeMap::from([
                ("DB_NAME".to_string(), "db-{id}".to_string()),
                ("DB_PORT".to_string(), "{port}".to_string()),
            ]),
            network: "host".to_string(),
            health_attempts: attempts,
            health_interval_ms: 10,
        }
    }

    #[tokio::test]
    async fn healthy_service_exposes_substituted_env() {
        let started = EphemeralService::start(
            &service("true", "true", 3),
            Duration::from_secs(10),
            1024,
        )
        .await
        .expect("start");
        let env = started.env();
        assert_eq!(
            env,
            vec![
                ("DB_NAME".to_string(), format!("db-{}", started.id())),
                ("DB_PORT".to_string(), started.port().to_string()),
            ]
        );
        assert_ne!(started.port(), 0);
        started.stop().await;
    }

    /// Verifies the health loop is bounded.
    ///
    /// Health never passes. Asserts: start fails with `ServiceUnhealthy` after the configured attempts.
    #[tokio::test]
    async fn unhealthy_service_fails_after_bounded_attempts() {
        let err = EphemeralService::start(
            &service("true", "echo not ready; exit 1", 3),
            Duration::from_secs(10),
            1024,
        )
        .await
        .expect_err("unhealthy");
        match err.downcast_ref::<SandboxError>() {
            Some(SandboxError::ServiceUnhealthy {
                attempts,
                last_output,
            }) => {
                assert_eq!(*attempts, 3);
                assert!(last_output.contains("not ready"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn short_ids_are_lowercase_alphanumeric() {
        let id = generate_short_id();
        assert_eq!(id.len(), 8);
        assert!(
            id.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }
}
