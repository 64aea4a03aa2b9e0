//! prometheus gauges for the latest sample

use std::{error::Error, net::SocketAddr, str::FromStr};

use metrics::Gauge;

use crate::um25c::Sample;

pub(crate) fn init_prometheus(addr: &str) -> Result<(), Box<dyn Error>> {
    let socket = SocketAddr::from_str(addr)?;

    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    builder.with_http_listener(socket).install()?;

    return Ok(());
}

/// gauges fed from every sample, no-ops unless a recorder is installed
pub(crate) struct Gauges {
    voltage: Gauge,
    current: Gauge,
    power: Gauge,
    temperature: Gauge,
    energy: Gauge,
    last_measured: Gauge,
}

impl Gauges {
    pub(crate) fn new() -> Self {
        Gauges {
            voltage: metrics::gauge!("voltage_volt"),
            current: metrics::gauge!("current_ampere"),
            power: metrics::gauge!("power_watt"),
            temperature: metrics::gauge!("temperature_celsius"),
            energy: metrics::gauge!("energy_group0_milliwatt_hour"),
            last_measured: metrics::gauge!("last_measured_timestamp_ms"),
        }
    }

    pub(crate) fn record(&self, sample: &Sample) {
        self.voltage.set(sample.voltage_v);
        self.current.set(sample.current_a);
        self.power.set(sample.power_w);
        self.temperature.set(sample.temperature_c as f64);
        self.energy.set(sample.energy_mwh() as f64);
        self.last_measured
            .set(sample.captured_at.timestamp_millis() as f64);
    }
}
