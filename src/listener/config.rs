use clap::Parser;
use std::time::Duration;

/// Configuration for one listener process. Every setting can be supplied as a
/// command-line flag or through the environment; the listener Deployment
/// created by the operator uses the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "listener")]
#[command(about = "Polls a Forgejo organization for pending jobs and emits ActRunners")]
#[command(version)]
pub struct ListenerConfig {
    /// Forgejo server URL
    #[arg(long, env = "FORGEJO_SERVER")]
    pub forgejo_server: String,

    /// Forgejo organization name to poll
    #[arg(long, env = "ORGANIZATION")]
    pub organization: String,

    /// Label filter for jobs, passed verbatim to Forgejo
    #[arg(long, env = "LABELS")]
    pub labels: String,

    /// Name of the secret containing the Forgejo API token
    #[arg(long, env = "TOKEN_SECRET_NAME")]
    pub token_secret_name: String,

    /// Key within the secret containing the token
    #[arg(long, env = "TOKEN_SECRET_KEY", default_value = "token")]
    pub token_secret_key: String,

    /// Namespace this listener operates in
    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,

    /// Name of the owning ActDeployment resource
    #[arg(long, env = "ACT_DEPLOYMENT_NAME")]
    pub act_deployment_name: String,

    /// Polling interval (e.g. "10s", "1m30s")
    #[arg(long, env = "POLL_INTERVAL", default_value = "10s", value_parser = parse_interval)]
    pub poll_interval: Duration,

    /// Skip TLS certificate verification when talking to Forgejo
    #[arg(long, env = "SKIP_TLS_VERIFY")]
    pub skip_tls_verify: bool,
}

fn parse_interval(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|err| format!("invalid duration {value:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "listener",
            "--forgejo-server",
            "https://git.example.com",
            "--organization",
            "builders",
            "--labels",
            "docker,ubuntu-22.04",
            "--token-secret-name",
            "forgejo-token",
            "--namespace",
            "ci",
            "--act-deployment-name",
            "fleet",
        ]
    }

    #[test]
    fn test_defaults_apply() {
        let config = ListenerConfig::try_parse_from(base_args()).unwrap();
        assert_eq!(config.token_secret_key, "token");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert!(!config.skip_tls_verify);
        assert_eq!(config.labels, "docker,ubuntu-22.04");
    }

    #[test]
    fn test_poll_interval_parses_duration_strings() {
        let mut args = base_args();
        args.extend(["--poll-interval", "1m30s"]);
        let config = ListenerConfig::try_parse_from(args).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(90));
    }

    #[test]
    fn test_invalid_poll_interval_is_rejected() {
        let mut args = base_args();
        args.extend(["--poll-interval", "soon"]);
        assert!(ListenerConfig::try_parse_from(args).is_err());
    }

    #[test]
    fn test_required_settings_are_enforced() {
        assert!(ListenerConfig::try_parse_from(["listener"]).is_err());
    }
}
