use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use callcore::{CallDirection, CallKey};
use clap::{Parser, ValueEnum};
use log::info;
use ongoing_call::transport::PeerReflector;

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Outgoing,
    Incoming,
}

#[derive(Parser)]
#[command(name = "call-reflector")]
#[command(about = "Answers call probes and keepalives for one call key and peer tag")]
#[command(
    long_about = "Diagnostic peer for the call datagram protocol. Acknowledges probes and keepalives, counts media frames, and accepts relay bind requests so the same endpoint can stand in for a relay proxy."
)]
struct Cli {
    #[arg(short, long, default_value = "0.0.0.0:3478")]
    bind: String,

    /// Shared call key, hex encoded.
    #[arg(short, long)]
    key: String,

    /// Peer tag, hex encoded.
    #[arg(short, long)]
    tag: String,

    /// This endpoint's side of the call.
    #[arg(short, long, value_enum, default_value = "incoming")]
    side: Side,

    /// Highest protocol layer this endpoint speaks.
    #[arg(long, default_value_t = 92)]
    max_layer: i32,

    #[arg(long, requires = "relay_password")]
    relay_username: Option<String>,

    #[arg(long, requires = "relay_username")]
    relay_password: Option<String>,

    /// Seconds between stats lines; 0 disables them.
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                chrono::Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    let key = CallKey::new(hex::decode(&cli.key).context("--key is not valid hex")?)?;
    let tag = Bytes::from(hex::decode(&cli.tag).context("--tag is not valid hex")?);
    let direction = match cli.side {
        Side::Outgoing => CallDirection::Outgoing,
        Side::Incoming => CallDirection::Incoming,
    };
    let relay_credentials = cli.relay_username.zip(cli.relay_password);

    let reflector =
        PeerReflector::bind(&cli.bind, &key, tag, direction, cli.max_layer, relay_credentials)
            .await
            .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!("Reflector ready on {} (key {})", reflector.local_addr(), key.fingerprint());

    if cli.stats_interval == 0 {
        tokio::signal::ctrl_c().await?;
    } else {
        let mut ticker = tokio::time::interval(Duration::from_secs(cli.stats_interval));
        loop {
            tokio::select! {
                _ = ticker.tick() => info!("{:?}", reflector.stats()),
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
            }
        }
    }

    info!("Shutting down, final {:?}", reflector.stats());
    reflector.close();
    Ok(())
}
