//! Acquisition poller: one [`Sample`] per call.
//!
//! The DAQ scan arrives as one flat vector and is redistributed per plane through the
//! [`ChannelMap`]. PSU outputs are read one by one (voltage and current, power computed).
//! A failing instrument aborts the poll with its error; nothing stale or zero-filled is
//! ever returned in its place.

use crate::actuator::ActuationCommand;
use crate::channel_map::ChannelMap;
use crate::error::{AppResult, DaqError};
use crate::instrument::{Acquisition, Instrument, Measure, Setting, Source, TransportKind};
use crate::sample::{local_timestamp, PlaneReadings, PsuReading, Sample};
use tracing::{debug, info, warn};

/// Where an instrument lives.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// Host, `host:port` or device path, depending on the transport.
    pub address: String,
    /// How to reach the address.
    pub transport: TransportKind,
}

impl Endpoint {
    /// Endpoint at `address` over `transport`.
    pub fn new(address: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            address: address.into(),
            transport,
        }
    }
}

struct Attached<T: ?Sized> {
    driver: Box<T>,
    endpoint: Endpoint,
}

/// Owns the channel map and every instrument handle of the bench.
pub struct Poller {
    map: ChannelMap,
    daq: Option<Attached<dyn Acquisition>>,
    psu: Option<Attached<dyn Source>>,
}

impl Poller {
    /// Poller with no instruments attached yet.
    pub fn new(map: ChannelMap) -> Self {
        Self {
            map,
            daq: None,
            psu: None,
        }
    }

    /// Attach the scanner whose scan list is the channel map.
    pub fn with_daq(mut self, driver: Box<dyn Acquisition>, endpoint: Endpoint) -> Self {
        self.daq = Some(Attached { driver, endpoint });
        self
    }

    /// Attach the power supply.
    pub fn with_psu(mut self, driver: Box<dyn Source>, endpoint: Endpoint) -> Self {
        self.psu = Some(Attached { driver, endpoint });
        self
    }

    /// Channel map the DAQ scan is regrouped with.
    pub fn map(&self) -> &ChannelMap {
        &self.map
    }

    /// Number of PSU outputs in every sample.
    pub fn psu_channels(&self) -> usize {
        self.psu
            .as_ref()
            .map(|psu| usize::from(psu.driver.channel_count()))
            .unwrap_or(0)
    }

    /// Check that the instruments match the channel map.
    ///
    /// # Errors
    /// `Configuration` when channels are mapped but no DAQ is attached, or when nothing at
    /// all is attached.
    pub fn validate(&self) -> AppResult<()> {
        if self.daq.is_none() && !self.map.is_empty() {
            return Err(DaqError::Configuration(format!(
                "{} channels mapped but no acquisition unit configured",
                self.map.len()
            )));
        }
        if self.daq.is_none() && self.psu.is_none() {
            return Err(DaqError::Configuration(
                "No instrument configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Connect every attached instrument.
    pub async fn connect_all(&mut self) -> AppResult<()> {
        if let Some(daq) = self.daq.as_mut() {
            daq.driver
                .connect(&daq.endpoint.address, daq.endpoint.transport)
                .await?;
        }
        if let Some(psu) = self.psu.as_mut() {
            psu.driver
                .connect(&psu.endpoint.address, psu.endpoint.transport)
                .await?;
        }
        Ok(())
    }

    /// Names of attached instruments that are currently disconnected.
    pub fn disconnected(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(daq) = &self.daq {
            if !daq.driver.is_connected() {
                names.push(daq.driver.name().to_string());
            }
        }
        if let Some(psu) = &self.psu {
            if !psu.driver.is_connected() {
                names.push(psu.driver.name().to_string());
            }
        }
        names
    }

    /// Reconnect the instruments marked disconnected. Only call between ticks.
    pub async fn reconnect(&mut self) -> AppResult<()> {
        if let Some(daq) = self.daq.as_mut() {
            if !daq.driver.is_connected() {
                info!(instrument = daq.driver.name(), "Reconnecting");
                daq.driver
                    .connect(&daq.endpoint.address, daq.endpoint.transport)
                    .await?;
            }
        }
        if let Some(psu) = self.psu.as_mut() {
            if !psu.driver.is_connected() {
                info!(instrument = psu.driver.name(), "Reconnecting");
                psu.driver
                    .connect(&psu.endpoint.address, psu.endpoint.transport)
                    .await?;
            }
        }
        Ok(())
    }

    /// `*IDN?` of every connected instrument.
    pub async fn identities(&mut self) -> Vec<(String, String)> {
        let mut found = Vec::new();
        if let Some(daq) = self.daq.as_mut() {
            match daq.driver.identify().await {
                Ok(identity) => found.push((daq.driver.name().to_string(), identity)),
                Err(e) => warn!(instrument = daq.driver.name(), "No identity: {}", e),
            }
        }
        if let Some(psu) = self.psu.as_mut() {
            match psu.driver.identify().await {
                Ok(identity) => found.push((psu.driver.name().to_string(), identity)),
                Err(e) => warn!(instrument = psu.driver.name(), "No identity: {}", e),
            }
        }
        found
    }

    /// Produce one sample.
    ///
    /// # Errors
    /// The first instrument error (the instrument is left disconnected), or
    /// `FormatMismatch` when the readings do not fit the channel map.
    pub async fn poll(&mut self) -> AppResult<Sample> {
        let mut sample = Sample::new(local_timestamp());

        sample.planes = match self.daq.as_mut() {
            Some(daq) => {
                let scanned = daq.driver.read_all().await;
                let flat = match scanned {
                    Ok(flat) => flat,
                    Err(e) => return Err(fault(daq.driver.as_mut(), e).await),
                };
                self.map.regroup(&flat)?
            }
            None => PlaneReadings::with_sizes(&self.map.group_sizes()),
        };

        if let Some(psu) = self.psu.as_mut() {
            let channels = psu.driver.channel_count();
            sample.psu.reserve(usize::from(channels));
            for output in 1..=channels {
                let measured = read_output(psu.driver.as_mut(), output).await;
                match measured {
                    Ok((voltage, current)) => {
                        sample.psu.push(PsuReading::from_measured(voltage, current))
                    }
                    Err(e) => return Err(fault(psu.driver.as_mut(), e).await),
                }
            }
        }

        sample.validate(&self.map, self.psu_channels())?;
        debug!(timestamp = sample.timestamp, "Sample acquired");
        Ok(sample)
    }

    /// Switch the outputs named by `command`.
    ///
    /// # Errors
    /// `Configuration` when no PSU is attached, or the PSU error.
    pub async fn apply(&mut self, command: &ActuationCommand) -> AppResult<()> {
        let psu = self.psu.as_mut().ok_or_else(|| {
            DaqError::Configuration(format!(
                "Heater group '{}' needs a power supply",
                command.group
            ))
        })?;
        for output in &command.outputs {
            let result = psu
                .driver
                .write(*output, Setting::Output(command.state.is_on()))
                .await;
            if let Err(e) = result {
                return Err(fault(psu.driver.as_mut(), e).await);
            }
        }
        Ok(())
    }

    /// Abort a scan in progress and release every instrument.
    pub async fn shutdown(&mut self) {
        if let Some(daq) = self.daq.as_mut() {
            if daq.driver.is_connected() {
                if let Err(e) = daq.driver.abort().await {
                    warn!(instrument = daq.driver.name(), "Abort failed: {}", e);
                }
            }
            if let Err(e) = daq.driver.disconnect().await {
                warn!(instrument = daq.driver.name(), "Disconnect failed: {}", e);
            }
        }
        if let Some(psu) = self.psu.as_mut() {
            if let Err(e) = psu.driver.disconnect().await {
                warn!(instrument = psu.driver.name(), "Disconnect failed: {}", e);
            }
        }
    }
}

async fn read_output(psu: &mut dyn Source, output: u8) -> AppResult<(f64, f64)> {
    let voltage = psu.read(output, Measure::Voltage).await?;
    let current = psu.read(output, Measure::Current).await?;
    Ok((voltage, current))
}

/// Mark the instrument disconnected after a fault of its own and hand the error back.
async fn fault<T: Instrument + ?Sized>(driver: &mut T, error: DaqError) -> DaqError {
    if error.is_instrument_fault() {
        warn!(instrument = driver.name(), "Poll aborted: {}", error);
        if driver.is_connected() {
            if let Err(e) = driver.disconnect().await {
                warn!(instrument = driver.name(), "Disconnect failed: {}", e);
            }
        }
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::HeaterState;
    use crate::channel_map::{ChannelSpec, Plane};
    use crate::instrument::mock::MockBench;
    use crate::instrument::{Connector, Daq970a, ScpiPowerSupply};

    fn bench_map() -> ChannelMap {
        ChannelMap::new(vec![
            ChannelSpec::new("101", Plane::Y, "pt01"),
            ChannelSpec::new("211", Plane::U, "pt31"),
            ChannelSpec::new("213", Plane::U, "pt33"),
            ChannelSpec::new("301", Plane::Strain, "strain01"),
        ])
        .unwrap()
    }

    async fn poller() -> (MockBench, Poller) {
        let map = bench_map();
        let bench = MockBench::new(&map, 2, vec![(Plane::U, vec![1])]);
        let connector = Connector::with_mock(bench.clone());
        let daq = Daq970a::new(connector.clone(), map.scan_order().to_vec())
            .unwrap()
            .with_configuration(Vec::new());
        let psu = ScpiPowerSupply::new(connector, 2);
        let mut poller = Poller::new(map)
            .with_daq(Box::new(daq), Endpoint::new("sim", TransportKind::Mock))
            .with_psu(Box::new(psu), Endpoint::new("sim", TransportKind::Mock));
        poller.connect_all().await.unwrap();
        (bench, poller)
    }

    #[tokio::test]
    async fn poll_groups_by_plane() {
        let (_, mut poller) = poller().await;
        let sample = poller.poll().await.unwrap();
        assert_eq!(sample.readings(Plane::U).len(), 2);
        assert_eq!(sample.readings(Plane::Y).len(), 1);
        assert_eq!(sample.readings(Plane::Strain).len(), 1);
        assert_eq!(sample.psu.len(), 2);
        assert_eq!(poller.psu_channels(), 2);
    }

    #[tokio::test]
    async fn short_scan_is_a_format_mismatch() {
        let (bench, mut poller) = poller().await;
        bench.truncate_scan(Some(3)).await;
        let err = poller.poll().await.unwrap_err();
        assert!(matches!(err, DaqError::FormatMismatch { .. }));
        // Not an instrument fault: the DAQ stays connected.
        assert!(poller.disconnected().is_empty());
    }

    #[tokio::test]
    async fn lost_instrument_aborts_and_reconnects() {
        let (bench, mut poller) = poller().await;
        bench.set_offline(true).await;
        assert!(poller.poll().await.unwrap_err().is_connection_loss());
        assert_eq!(poller.disconnected(), vec!["daq970a".to_string()]);

        assert!(poller.reconnect().await.is_err());
        bench.set_offline(false).await;
        poller.reconnect().await.unwrap();
        assert!(poller.disconnected().is_empty());
        assert!(poller.poll().await.is_ok());
    }

    #[tokio::test]
    async fn apply_switches_outputs() {
        let (bench, mut poller) = poller().await;
        let command = ActuationCommand {
            group: "U-plane".to_string(),
            outputs: vec![1, 2],
            state: HeaterState::On,
            reference: 55.0,
            changed: true,
        };
        poller.apply(&command).await.unwrap();
        assert_eq!(bench.output_on(1).await, Some(true));
        assert_eq!(bench.output_on(2).await, Some(true));
    }

    #[test]
    fn channels_without_daq_are_rejected() {
        let poller = Poller::new(bench_map());
        assert!(poller.validate().is_err());
        assert!(Poller::new(ChannelMap::empty()).validate().is_err());
    }
}
