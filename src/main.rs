use clap::{CommandFactory, Parser};
use renogy_bt_read::{telegraf, BatteryClient, BleTransport, SessionConfig, TelegrafSink};
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

/// Read voltage, current, temperature and remaining charge from a Renogy smart battery
/// and send them to Telegraf.
#[derive(Parser, Debug)]
#[command(name = "renogy-bt-read", version, about)]
struct Args {
    /// Bluetooth address of the battery, e.g. F8:33:31:00:00:00
    address: Option<String>,

    /// Telegraf socket listener (UDP) to send the reading to
    #[arg(long, env = "TELEGRAF_ADDR", default_value = telegraf::DEFAULT_ADDR)]
    telegraf: String,

    /// Attempts before giving up. The battery refuses connections while paired with another host.
    #[arg(long, env = "BATTERY_ATTEMPTS", default_value_t = 5)]
    attempts: u32,

    /// Seconds to wait between attempts
    #[arg(long, env = "BATTERY_BACKOFF_SECS", default_value_t = 2)]
    backoff_secs: u64,

    /// Seconds to wait for each reply
    #[arg(long, env = "BATTERY_REPLY_TIMEOUT_SECS", default_value_t = 10)]
    reply_timeout_secs: u64,

    /// Seconds to look for the battery when the adapter does not already know it
    #[arg(long, env = "BATTERY_SCAN_TIMEOUT_SECS", default_value_t = 30)]
    scan_timeout_secs: u64,

    /// Reject replies whose CRC does not match
    #[arg(long, env = "BATTERY_VERIFY_CRC")]
    verify_crc: bool,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let Some(address) = args.address.as_deref() else {
        Args::command().print_help()?;
        println!();
        return Ok(());
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SessionConfig {
        max_attempts: args.attempts,
        backoff: Duration::from_secs(args.backoff_secs),
        reply_timeout: Duration::from_secs(args.reply_timeout_secs),
        verify_reply_crc: args.verify_crc,
    };

    let transport = BleTransport::new(Duration::from_secs(args.scan_timeout_secs)).await?;
    let mut sink = TelegrafSink::connect(&args.telegraf).await?;
    let mut battery_client = BatteryClient::new(transport, config);

    battery_client.read_battery(address, &mut sink).await?;

    Ok(())
}
