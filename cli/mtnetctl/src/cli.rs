//! Command-line arguments.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use mtnet_dispatch::SupervisorConfig;
use mtnet_transport::Reliability;

/// mtnetctl - send lines to an mtnet server and print what comes back.
///
/// Each line read from stdin is sent as one packet. Type `quit` or close
/// stdin to disconnect.
#[derive(Debug, Parser)]
#[command(name = "mtnetctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server address.
    #[arg(long, env = "MTNET_ADDR", default_value = "127.0.0.1:12345")]
    pub addr: SocketAddr,

    /// Give up connecting after this many milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Mark outgoing packets unreliable.
    #[arg(long)]
    pub unreliable: bool,

    /// Log level when `RUST_LOG` is unset. Logs go to stderr.
    #[arg(long, env = "MTNET_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,
}

impl Cli {
    pub fn reliability(&self) -> Reliability {
        if self.unreliable {
            Reliability::Unreliable
        } else {
            Reliability::Reliable
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            thread_name: "mtnetctl".to_string(),
            ..SupervisorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["mtnetctl"]).unwrap();
        assert_eq!(cli.addr, "127.0.0.1:12345".parse().unwrap());
        assert_eq!(cli.reliability(), Reliability::Reliable);
        assert_eq!(cli.supervisor_config().connect_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "mtnetctl",
            "--addr",
            "10.0.0.9:7000",
            "--connect-timeout-ms",
            "250",
            "--unreliable",
        ])
        .unwrap();
        assert_eq!(cli.addr.port(), 7000);
        assert_eq!(cli.reliability(), Reliability::Unreliable);
        assert_eq!(cli.supervisor_config().connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(Cli::try_parse_from(["mtnetctl", "--addr", "nowhere"]).is_err());
    }
}
