//! UM25C request/response cycle on top of a [`Transport`]

use crate::transport::{Transport, TransportError};
use crate::um25c::{self, DecodeError, Sample, CMD_POLL, FRAME_LEN};

pub(crate) const DEVICE_TYPE: &str = "UM25C";

#[derive(Debug, thiserror::Error)]
pub(crate) enum MeterError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// who the meter is, used for topic names and discovery ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceIdentity {
    pub(crate) device_type: String,
    pub(crate) serial: String,
}

impl DeviceIdentity {
    pub(crate) fn from_address(device_type: &str, address: &str) -> Self {
        let serial = address.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        return Self {
            device_type: device_type.to_string(),
            serial,
        };
    }
}

/// A UM25C meter reached through `T`.
///
/// Only one request may be in flight, hence `&mut self` everywhere.
pub(crate) struct Meter<T: Transport> {
    transport: T,
    identity: DeviceIdentity,
}

impl<T: Transport> Meter<T> {
    pub(crate) fn new(transport: T) -> Self {
        let identity = DeviceIdentity::from_address(DEVICE_TYPE, transport.address());
        Meter { transport, identity }
    }

    pub(crate) fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) async fn connect(&mut self) -> Result<(), MeterError> {
        self.transport.connect().await?;
        return Ok(());
    }

    /// Drops the current link and dials again.
    ///
    /// A fetch that was abandoned halfway leaves the stream mid-frame, so
    /// this is the only way back to a known alignment.
    pub(crate) async fn reconnect(&mut self) -> Result<(), MeterError> {
        self.transport.close().await;
        self.connect().await
    }

    pub(crate) async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Polls the meter and decodes one frame.
    ///
    /// The poll command goes out again before every read, the meter may
    /// ignore a read that is not paired with a fresh request. There is no
    /// timeout here; callers race this against their own deadline.
    pub(crate) async fn fetch_sample(&mut self) -> Result<Sample, MeterError> {
        let mut buf = Vec::with_capacity(FRAME_LEN);
        while buf.len() < FRAME_LEN {
            self.transport.send(&[CMD_POLL]).await?;
            let chunk = self.transport.receive(FRAME_LEN).await?;
            log::trace!("read {} bytes, have {}", chunk.len(), buf.len() + chunk.len());
            buf.extend_from_slice(&chunk);
        }
        if buf.len() > FRAME_LEN {
            log::debug!("dropping {} bytes past the frame", buf.len() - FRAME_LEN);
        }

        let sample = um25c::parse_frame(&buf)?;
        log::info!(
            "{}: {:.3}V {:.4}A {:.3}W {}mWh",
            sample.captured_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            sample.voltage_v,
            sample.current_a,
            sample.power_w,
            sample.energy_mwh()
        );
        return Ok(sample);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::io;

    use async_trait::async_trait;

    use super::*;
    use crate::um25c::tests::sample_frame;

    /// Scripted transport: each `receive` pops the next step.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub(crate) address: String,
        pub(crate) steps: VecDeque<Result<Vec<u8>, TransportError>>,
        pub(crate) sent: Vec<Vec<u8>>,
        pub(crate) connects: usize,
        pub(crate) closes: usize,
        /// never answer a receive
        pub(crate) stall: bool,
    }

    impl MockTransport {
        pub(crate) fn new(address: &str) -> Self {
            MockTransport {
                address: address.to_string(),
                ..Default::default()
            }
        }

        pub(crate) fn with_chunks(address: &str, data: &[u8], sizes: &[usize]) -> Self {
            let mut mock = Self::new(address);
            let mut at = 0;
            for &size in sizes {
                mock.steps.push_back(Ok(data[at..at + size].to_vec()));
                at += size;
            }
            mock
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            self.connects += 1;
            Ok(())
        }

        async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        async fn receive(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            let step = self.steps.pop_front().unwrap_or(Err(TransportError::Closed));
            step.map(|mut bytes| {
                bytes.truncate(max_bytes);
                bytes
            })
        }

        async fn close(&mut self) {
            self.closes += 1;
        }

        fn address(&self) -> &str {
            &self.address
        }
    }

    #[test]
    fn serial_strips_separators() {
        let identity = DeviceIdentity::from_address(DEVICE_TYPE, "AA:BB:CC:DD:EE:FF");
        assert_eq!(identity.serial, "AABBCCDDEEFF");
        assert_eq!(identity.device_type, "UM25C");

        let meter = Meter::new(MockTransport::new("00:15:a3-01:02:03"));
        assert_eq!(meter.identity().serial, "0015a3010203");
    }

    #[tokio::test]
    async fn polls_again_on_every_short_read() {
        let frame = sample_frame();
        let mut meter = Meter::new(MockTransport::with_chunks(
            "AA:BB:CC:DD:EE:FF",
            &frame,
            &[0, 50, 80],
        ));

        let sample = meter.fetch_sample().await.unwrap();
        assert_eq!(meter.transport.sent, vec![vec![0xF0]; 3]);
        assert_eq!(sample.voltage_v, 5.123);
        assert_eq!(sample.energy_mwh(), 6_321);
    }

    #[tokio::test]
    async fn single_full_read_sends_once() {
        let frame = sample_frame();
        let mut meter = Meter::new(MockTransport::with_chunks("AA:BB:CC:DD:EE:FF", &frame, &[130]));

        meter.fetch_sample().await.unwrap();
        assert_eq!(meter.transport.sent.len(), 1);
    }

    #[tokio::test]
    async fn over_read_decodes_first_frame() {
        let mut data = sample_frame();
        data.extend_from_slice(&[0x55; 60]);
        let mut meter = Meter::new(MockTransport::with_chunks(
            "AA:BB:CC:DD:EE:FF",
            &data,
            &[100, 90],
        ));

        let sample = meter.fetch_sample().await.unwrap();
        assert_eq!(meter.transport.sent.len(), 2);
        assert_eq!(sample.resistance_ohm, 11.3);
        assert!(meter.transport.steps.is_empty());
    }

    #[tokio::test]
    async fn transport_errors_propagate() {
        let mut mock = MockTransport::new("AA:BB:CC:DD:EE:FF");
        mock.steps.push_back(Ok(vec![0u8; 20]));
        mock.steps.push_back(Err(TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        ))));
        let mut meter = Meter::new(mock);

        let err = meter.fetch_sample().await.unwrap_err();
        assert!(matches!(err, MeterError::Transport(TransportError::Io(_))));
        assert_eq!(meter.transport.sent.len(), 2);
    }

    #[tokio::test]
    async fn reconnect_closes_then_dials() {
        let mut meter = Meter::new(MockTransport::new("AA:BB:CC:DD:EE:FF"));
        meter.connect().await.unwrap();
        meter.reconnect().await.unwrap();
        assert_eq!(meter.transport.connects, 2);
        assert_eq!(meter.transport.closes, 1);
    }
}
