// SPDX-License-Identifier: Apache-2.0 OR MIT
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use igmp_proxy::config::ProxyConfig;
use igmp_proxy::logging::{Facility, Logger, Severity};
use igmp_proxy::protocols;
use igmp_proxy::proxy::{
    AlwaysMaster, ChannelTransport, Collaborators, IgmpProxy, LoggingFlowService,
};
use igmp_proxy::{log_debug, log_info, log_notice};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug, PartialEq)]
enum Command {
    /// Run the proxy
    Run {
        #[arg(long, short)]
        config: PathBuf,
        #[arg(long, default_value = "info")]
        log_level: Severity,
    },
    /// Load and validate a configuration file
    CheckConfig { path: PathBuf },
    /// Decode a hex-encoded Ethernet frame carrying IGMP
    Decode { hex: String },
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    anyhow::ensure!(digits.len() % 2 == 0, "odd number of hex digits");
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex at offset {}", i))
        })
        .collect()
}

async fn run(config_path: PathBuf, level: Severity) -> Result<()> {
    let logger = Logger::stderr_json(level);
    let config = ProxyConfig::load_from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    log_info!(
        logger,
        Facility::Config,
        &format!(
            "Loaded {} with {} device(s)",
            config_path.display(),
            config.devices.len()
        )
    );

    let (transport, mut outbound) = ChannelTransport::new(4096);
    let proxy = Arc::new(IgmpProxy::new(
        Collaborators {
            transport: Arc::new(transport),
            flows: Arc::new(LoggingFlowService::new(logger.clone())),
            mastership: Arc::new(AlwaysMaster),
        },
        logger.clone(),
    ));
    proxy.activate(config)?;
    let timer_loop = proxy.spawn_timer_loop();

    // Packet I/O is provided by the embedding datapath; standalone the
    // frames are only logged.
    let io_logger = logger.clone();
    let io_task = tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            log_debug!(
                io_logger,
                Facility::Proxy,
                &format!("Outbound {} byte frame on {}", out.frame.len(), out.out)
            );
        }
    });

    log_info!(logger, Facility::Proxy, "igmpproxyd running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    log_notice!(logger, Facility::Proxy, "Shutting down");
    proxy.deactivate();
    timer_loop.abort();
    io_task.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { config, log_level } => run(config, log_level).await?,
        Command::CheckConfig { path } => {
            let config = ProxyConfig::load_from_file(&path)?;
            config.validate()?;
            println!("{}", config.to_json5());
        }
        Command::Decode { hex } => {
            let frame = parse_hex(&hex)?;
            let packet = protocols::decode(&frame)?;
            println!("{:#?}", packet);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_parsing() {
        let args = Args::parse_from(["igmpproxyd", "run", "--config", "/etc/igmp.json5"]);
        assert_eq!(
            args.command,
            Command::Run {
                config: PathBuf::from("/etc/igmp.json5"),
                log_level: Severity::Info,
            }
        );

        let args = Args::parse_from(["igmpproxyd", "check-config", "proxy.json5"]);
        assert_eq!(
            args.command,
            Command::CheckConfig {
                path: PathBuf::from("proxy.json5")
            }
        );

        let args = Args::parse_from(["igmpproxyd", "decode", "0a0b"]);
        assert_eq!(
            args.command,
            Command::Decode {
                hex: "0a0b".to_string()
            }
        );
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0a ff 10").unwrap(), vec![0x0a, 0xff, 0x10]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }
}
