use clap::Parser;
use std::path::PathBuf;

/// traind — edge agent daemon for distributed model-train control
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Service config path (default: /etc/traind/config.yaml)
    #[arg(short = 'c', long = "config", default_value = "/etc/traind/config.yaml")]
    pub config: PathBuf,

    /// Runtime config cache path (default: /var/lib/traind/runtime.yaml)
    #[arg(long = "cache", default_value = "/var/lib/traind/runtime.yaml")]
    pub cache: PathBuf,

    /// Use the simulator backend regardless of the assigned hardware type
    #[arg(long = "simulator", default_value = "false")]
    pub simulator: bool,

    /// Override the assigned broker host
    #[arg(long = "broker-host")]
    pub broker_host: Option<String>,

    /// Override the assigned broker port
    #[arg(long = "broker-port")]
    pub broker_port: Option<u16>,

    /// Detach and run as a daemon
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_a_bare_invocation() {
        let cli = Cli::parse_from(["traind"]);
        assert_eq!(cli.config, PathBuf::from("/etc/traind/config.yaml"));
        assert_eq!(cli.cache, PathBuf::from("/var/lib/traind/runtime.yaml"));
        assert!(!cli.simulator);
        assert!(!cli.daemonize);
        assert!(cli.broker_host.is_none());
    }

    #[test]
    fn overrides_parse() {
        let cli = Cli::parse_from([
            "traind",
            "--simulator",
            "--broker-host",
            "10.0.0.9",
            "--broker-port",
            "1884",
            "-c",
            "/tmp/svc.yaml",
        ]);
        assert!(cli.simulator);
        assert_eq!(cli.broker_host.as_deref(), Some("10.0.0.9"));
        assert_eq!(cli.broker_port, Some(1884));
        assert_eq!(cli.config, PathBuf::from("/tmp/svc.yaml"));
    }
}
