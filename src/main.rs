use std::{error::Error, time::Duration};

use clap::Parser;

mod bridge;
mod exporter;
mod meter;
mod mqtt;
mod transport;
mod um25c;

use meter::Meter;
use mqtt::{MqttSettings, OutputFormat, Publisher};
use transport::RfcommTransport;

#[derive(Debug, Parser)]
#[command(version, about = "MQTT bridge for UM25C USB meter", long_about = None)]
struct Args {
    /// Bluetooth address of the meter
    #[arg(long)]
    addr: String,
    /// RFCOMM channel of the meter's serial port
    #[arg(long, default_value_t = 1)]
    channel: u8,
    /// Address of the MQTT server
    #[arg(long, default_value_t = String::from("localhost"))]
    broker: String,
    #[arg(long, default_value_t = 1883)]
    port: u16,
    #[arg(long, default_value_t = String::from("um25c-mqtt"))]
    client_id: String,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Polling interval in seconds
    #[arg(long, default_value_t = 1.0)]
    interval: f64,
    /// Seconds to wait for a complete frame before reconnecting
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,
    /// Custom MQTT topic prefix
    #[arg(long)]
    topic_prefix: Option<String>,
    /// Publish device metadata for Home Assistant
    #[arg(long)]
    ha_config: bool,
    /// Publish data in JSON
    #[arg(long)]
    json: bool,
    /// Publish data as plain numbers
    #[arg(long)]
    plain: bool,
    /// Serve prometheus metrics on this address
    #[arg(long)]
    prometheus: Option<String>,
}

impl Args {
    fn poll_settings(&self) -> Result<bridge::PollSettings, Box<dyn Error>> {
        let fetch_timeout = Duration::try_from_secs_f64(self.timeout)?;
        if fetch_timeout.is_zero() {
            return Err("--timeout must be greater than zero".into());
        }

        return Ok(bridge::PollSettings {
            interval: Duration::try_from_secs_f64(self.interval)?,
            fetch_timeout,
            ..Default::default()
        });
    }

    fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.broker.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();
    let settings = args.poll_settings()?;

    log::info!("start um25c-mqtt bridge");

    if let Some(addr) = &args.prometheus {
        exporter::init_prometheus(addr)?;
        log::info!("start prometheus server at {:}", addr);
    }
    let gauges = exporter::Gauges::new();

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let transport = RfcommTransport::new(&args.addr, args.channel)?;
    let mut meter = Meter::new(transport);
    meter.connect().await?;

    let publisher = Publisher::connect(
        &args.mqtt_settings(),
        meter.identity().clone(),
        args.topic_prefix.clone(),
        OutputFormat::select(args.json, args.plain),
    );
    if args.ha_config {
        publisher.publish_discovery().await?;
    }

    bridge::run(&mut meter, &publisher, &gauges, settings).await?;

    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["um25c-mqtt", "--addr", "AA:BB:CC:DD:EE:FF"]).unwrap();
        assert_eq!(args.broker, "localhost");
        assert_eq!(args.port, 1883);
        assert_eq!(args.channel, 1);
        assert!(!args.ha_config);
        assert!(args.topic_prefix.is_none());

        let settings = args.poll_settings().unwrap();
        assert_eq!(settings.interval, Duration::from_secs(1));
        assert_eq!(settings.fetch_timeout, Duration::from_secs(5));
        assert_eq!(settings.retry_delay, Duration::from_secs(2));
    }

    #[test]
    fn address_is_required() {
        assert!(Args::try_parse_from(["um25c-mqtt"]).is_err());
    }

    #[test]
    fn rejects_negative_interval() {
        let args = Args::try_parse_from([
            "um25c-mqtt",
            "--addr",
            "AA:BB:CC:DD:EE:FF",
            "--interval=-1",
        ])
        .unwrap();
        assert!(args.poll_settings().is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        for timeout in ["--timeout=0", "--timeout=-2.5"] {
            let args =
                Args::try_parse_from(["um25c-mqtt", "--addr", "AA:BB:CC:DD:EE:FF", timeout])
                    .unwrap();
            assert!(args.poll_settings().is_err());
        }

        let args = Args::try_parse_from([
            "um25c-mqtt",
            "--addr",
            "AA:BB:CC:DD:EE:FF",
            "--timeout=0.25",
        ])
        .unwrap();
        assert_eq!(
            args.poll_settings().unwrap().fetch_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn output_flags() {
        let args = Args::try_parse_from([
            "um25c-mqtt",
            "--addr",
            "AA:BB:CC:DD:EE:FF",
            "--plain",
            "--topic-prefix",
            "um25c",
        ])
        .unwrap();
        assert_eq!(
            OutputFormat::select(args.json, args.plain),
            vec![OutputFormat::Plain]
        );
        assert_eq!(args.topic_prefix.as_deref(), Some("um25c"));
    }
}
