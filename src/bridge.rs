//! poll loop between the meter and the broker

use std::{future::Future, time::Duration};

use tokio::time::{sleep, timeout};

use crate::exporter::Gauges;
use crate::meter::Meter;
use crate::mqtt::Publisher;
use crate::transport::Transport;
use crate::um25c::Sample;

#[derive(Debug, Clone, Copy)]
pub(crate) struct PollSettings {
    /// pause after a successful poll
    pub(crate) interval: Duration,
    /// upper bound for a single `fetch_sample`
    pub(crate) fetch_timeout: Duration,
    /// pause before reconnecting after a failed poll
    pub(crate) retry_delay: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// One poll with a deadline.
///
/// A failed or timed out fetch leaves the link in an unknown state, so the
/// meter is reconnected before returning `None`.
pub(crate) async fn poll_once<T: Transport>(
    meter: &mut Meter<T>,
    settings: &PollSettings,
) -> Option<Sample> {
    match timeout(settings.fetch_timeout, meter.fetch_sample()).await {
        Ok(Ok(sample)) => return Some(sample),
        Ok(Err(e)) => log::warn!("failed to fetch sample: {}", e),
        Err(_) => log::warn!(
            "no complete frame within {:?}, treating as link failure",
            settings.fetch_timeout
        ),
    }

    sleep(settings.retry_delay).await;
    if let Err(e) = meter.reconnect().await {
        log::warn!("reconnect failed: {}", e);
    }
    return None;
}

/// Polls and publishes until Ctrl-C, then closes the meter.
pub(crate) async fn run<T: Transport>(
    meter: &mut Meter<T>,
    publisher: &Publisher,
    gauges: &Gauges,
    settings: PollSettings,
) -> Result<(), std::io::Error> {
    run_until(meter, publisher, gauges, settings, tokio::signal::ctrl_c()).await
}

/// Polls and publishes until `shutdown` resolves, then closes the meter.
///
/// A whole cycle, interval sleep included, is abandoned as soon as
/// `shutdown` fires.
pub(crate) async fn run_until<T, F>(
    meter: &mut Meter<T>,
    publisher: &Publisher,
    gauges: &Gauges,
    settings: PollSettings,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    T: Transport,
    F: Future<Output = Result<(), std::io::Error>>,
{
    tokio::pin!(shutdown);

    loop {
        let cycle = async {
            let Some(sample) = poll_once(meter, &settings).await else {
                return;
            };
            gauges.record(&sample);
            if let Err(e) = publisher.publish_sample(&sample) {
                log::warn!("failed to publish sample: {}", e);
            }
            sleep(settings.interval).await;
        };

        tokio::select! {
            res = &mut shutdown => {
                res?;
                log::info!("shutting down");
                break;
            }

            _ = cycle => {}
        }
    }

    meter.close().await;
    return Ok(());
}
