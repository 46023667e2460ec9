//! Periodic run loop: poll, decide, actuate, log, buffer.
//!
//! [`TickHandler`] owns the poller, the actuator state and the log writer. One tick runs to
//! completion before the next is awaited; the stop signal and reconnection attempts are only
//! looked at between ticks.
//!
//! ```text
//! interval ─► poll ─► evaluate(thresholds) ─► apply ─► log ─► live series ─► status
//! ```

use crate::acquisition::{Endpoint, Poller};
use crate::actuator::{ActuationCommand, HeaterState, ThresholdActuator, ThresholdTable};
use crate::channel_map::{ChannelMap, Plane};
use crate::config::{LossPolicy, Settings};
use crate::data::sample_log::{LogMetadata, SampleLogger};
use crate::data::series::LiveSeriesStore;
use crate::error::{AppResult, DaqError};
use crate::instrument::mock::MockBench;
use crate::instrument::{Connector, Daq970a, ScpiPowerSupply};
use crate::sample::Sample;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shared handle to the live series, read by the plot window.
pub type SharedSeries = Arc<RwLock<LiveSeriesStore>>;

/// Last known state of one heater group.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaterStatus {
    /// Heater group name.
    pub group: String,
    /// State commanded at the last evaluation.
    pub state: HeaterState,
    /// Reference temperature of that evaluation, degC.
    pub reference: f64,
}

/// Snapshot published after every tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatus {
    /// Ticks started, including failed ones.
    pub ticks: u64,
    /// Lines written to the log.
    pub records: u64,
    /// Ticks that produced no log line.
    pub skipped: u64,
    /// Timestamp of the last logged sample.
    pub last_timestamp: Option<i64>,
    pub heaters: Vec<HeaterStatus>,
    /// Instruments waiting for a reconnect.
    pub disconnected: Vec<String>,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticks={} records={} skipped={}",
            self.ticks, self.records, self.skipped
        )?;
        if let Some(ts) = self.last_timestamp {
            write!(f, " last={}", ts)?;
        }
        for heater in &self.heaters {
            write!(
                f,
                " | {} {} at {:.2}degC",
                heater.group, heater.state, heater.reference
            )?;
        }
        if !self.disconnected.is_empty() {
            write!(f, " | disconnected: {}", self.disconnected.join(", "))?;
        }
        Ok(())
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The stop signal was raised.
    Requested,
    /// An instrument failed under the `halt` policy.
    InstrumentLost(String),
}

/// Totals of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Ticks started.
    pub ticks: u64,
    /// Lines written to the log.
    pub records: u64,
    /// Ticks that produced no log line.
    pub skipped: u64,
    /// Why the loop ended.
    pub reason: StopReason,
}

/// Drives one tick at a time over exclusively owned instruments and log writer.
pub struct TickHandler<W: Write> {
    poller: Poller,
    actuator: ThresholdActuator,
    logger: SampleLogger<W>,
    series: SharedSeries,
    thresholds: watch::Receiver<ThresholdTable>,
    status: watch::Sender<RunStatus>,
    ticks: u64,
    skipped: u64,
}

impl<W: Write> TickHandler<W> {
    /// The logger must already carry its header line.
    pub fn new(
        poller: Poller,
        actuator: ThresholdActuator,
        logger: SampleLogger<W>,
        series: SharedSeries,
        thresholds: watch::Receiver<ThresholdTable>,
    ) -> Self {
        let (status, _) = watch::channel(RunStatus::default());
        Self {
            poller,
            actuator,
            logger,
            series,
            thresholds,
            status,
            ticks: 0,
            skipped: 0,
        }
    }

    /// Receiver of the status published after every tick.
    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Handle to the live series this handler feeds.
    pub fn series(&self) -> SharedSeries {
        Arc::clone(&self.series)
    }

    /// Run one acquisition cycle.
    ///
    /// Every group is switched even if an earlier one failed. The sample is still logged and
    /// buffered, then the first switching error is returned.
    ///
    /// # Errors
    /// Instrument errors from polling or switching, `FormatMismatch` when the sample does not
    /// fit the channel map (nothing logged), `Io`/`Csv` when the log cannot be written.
    pub async fn tick(&mut self) -> AppResult<Sample> {
        self.ticks += 1;
        let sample = self.poller.poll().await?;

        let thresholds = self.thresholds.borrow().clone();
        let commands = self.actuator.evaluate(&sample, &thresholds)?;
        let mut switch_error = None;
        for command in &commands {
            if command.changed {
                info!(
                    group = %command.group,
                    state = %command.state,
                    reference = command.reference,
                    "Heater switched"
                );
            }
            if let Err(e) = self.poller.apply(command).await {
                warn!(group = %command.group, "Switching failed: {}", e);
                switch_error.get_or_insert(e);
            }
        }

        self.logger.append(&sample)?;
        self.series.write().await.ingest(&sample)?;
        self.publish(Some(&sample), &commands);
        debug!(records = self.logger.records(), "Tick complete");

        match switch_error {
            Some(e) => Err(e),
            None => Ok(sample),
        }
    }

    fn publish(&self, sample: Option<&Sample>, commands: &[ActuationCommand]) {
        let records = self.logger.records();
        let disconnected = self.poller.disconnected();
        let (ticks, skipped) = (self.ticks, self.skipped);
        self.status.send_modify(|status| {
            status.ticks = ticks;
            status.records = records;
            status.skipped = skipped;
            status.disconnected = disconnected;
            if let Some(sample) = sample {
                status.last_timestamp = Some(sample.timestamp);
            }
            if !commands.is_empty() {
                status.heaters = commands
                    .iter()
                    .map(|c| HeaterStatus {
                        group: c.group.clone(),
                        state: c.state,
                        reference: c.reference,
                    })
                    .collect();
            }
        });
    }

    fn skip(&mut self) {
        self.skipped += 1;
        self.publish(None, &[]);
    }

    /// Tick every `period` until `stop` reads true or an instrument is lost under
    /// [`LossPolicy::Halt`]. Heaters are switched off, instruments released and the log
    /// flushed before returning.
    ///
    /// # Errors
    /// Log write failures and configuration errors end the run with an error.
    pub async fn run(
        mut self,
        period: Duration,
        policy: LossPolicy,
        mut stop: watch::Receiver<bool>,
    ) -> AppResult<(RunSummary, W)> {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stop_open = true;
        info!(?period, ?policy, "Run loop started");

        let reason = loop {
            if *stop.borrow() {
                break StopReason::Requested;
            }
            tokio::select! {
                biased;
                changed = stop.changed(), if stop_open => {
                    if changed.is_err() {
                        debug!("Stop signal dropped, running until the loop ends on its own");
                        stop_open = false;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if !self.poller.disconnected().is_empty() {
                let reconnected = self.poller.reconnect().await;
                if let Err(e) = reconnected {
                    warn!("Reconnect failed, tick skipped: {}", e);
                    self.ticks += 1;
                    self.skip();
                    continue;
                }
                info!("Instruments reconnected");
            }

            let result = self.tick().await;
            match result {
                Ok(_) => {}
                Err(e) if e.is_instrument_fault() => match policy {
                    LossPolicy::Halt => {
                        error!("Instrument lost, halting: {}", e);
                        self.publish(None, &[]);
                        break StopReason::InstrumentLost(e.to_string());
                    }
                    LossPolicy::Retry => {
                        warn!("Tick aborted, reconnecting before the next one: {}", e);
                        self.skip();
                    }
                },
                Err(e @ DaqError::FormatMismatch { .. }) => {
                    warn!("Tick skipped: {}", e);
                    self.skip();
                }
                Err(e) => {
                    error!("Run aborted: {}", e);
                    self.shutdown().await;
                    return Err(e);
                }
            }
        };

        self.shutdown().await;
        let summary = RunSummary {
            ticks: self.ticks,
            records: self.logger.records(),
            skipped: self.skipped,
            reason,
        };
        info!(
            ticks = summary.ticks,
            records = summary.records,
            skipped = summary.skipped,
            "Run loop stopped"
        );
        let writer = self.logger.finish()?;
        Ok((summary, writer))
    }

    /// Switch every heater off and release the instruments.
    async fn shutdown(&mut self) {
        let off: Vec<ActuationCommand> = self
            .actuator
            .groups()
            .iter()
            .map(|group| ActuationCommand {
                group: group.name().to_string(),
                outputs: group.outputs().to_vec(),
                state: HeaterState::Off,
                reference: f64::NAN,
                changed: false,
            })
            .collect();
        for command in &off {
            if let Err(e) = self.poller.apply(command).await {
                warn!(group = %command.group, "Heater not switched off: {}", e);
            }
        }
        self.poller.shutdown().await;
    }
}

/// Poller for the instruments enabled in `settings`, not yet connected.
pub fn build_poller(settings: &Settings, map: ChannelMap, connector: &Connector) -> AppResult<Poller> {
    let mut poller = Poller::new(map);
    if settings.daq.enabled {
        let daq = Daq970a::new(connector.clone(), poller.map().scan_order().to_vec())?
            .with_timeout(settings.daq_timeout())
            .with_configuration(settings.daq_configuration());
        poller = poller.with_daq(
            Box::new(daq),
            Endpoint::new(settings.daq.address.clone(), settings.daq.transport),
        );
    }
    if settings.psu.enabled {
        let psu = ScpiPowerSupply::new(connector.clone(), settings.psu.channels)
            .with_timeout(settings.psu_timeout())
            .with_initial_voltages(settings.psu.initial_voltages.clone());
        poller = poller.with_psu(
            Box::new(psu),
            Endpoint::new(settings.psu.address.clone(), settings.psu.transport),
        );
    }
    poller.validate()?;
    Ok(poller)
}

/// Simulated bench matching `settings`: each heater group warms the plane of its first
/// reference sensor.
pub fn simulated_bench(settings: &Settings, map: &ChannelMap) -> MockBench {
    let heaters: Vec<(Plane, Vec<u8>)> = settings
        .heaters
        .iter()
        .filter_map(|heater| {
            let (plane, _) = map.resolve(heater.reference.first()?)?;
            Some((plane, heater.outputs.clone()))
        })
        .collect();
    let channels = if settings.psu.enabled {
        settings.psu.channels
    } else {
        0
    };
    MockBench::new(map, channels, heaters)
}

/// Comment lines opening a new log.
pub fn log_metadata(
    settings: &Settings,
    timestr: &str,
    identities: &[(String, String)],
    thresholds: &ThresholdTable,
) -> LogMetadata {
    identities
        .iter()
        .fold(
            LogMetadata::new(settings.storage.title.clone()).with_date(timestr),
            |metadata, (instrument, identity)| metadata.with_identity(instrument, identity),
        )
        .with_thresholds(thresholds)
}

/// Local time as used in log file names.
pub fn run_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{HeaterGroup, Thresholds};
    use crate::channel_map::ChannelSpec;
    use crate::data::schema::LogSchema;
    use crate::instrument::TransportKind;
    use tracing_test::traced_test;

    const PERIOD: Duration = Duration::from_secs(60);

    fn bench_map() -> ChannelMap {
        ChannelMap::new(vec![
            ChannelSpec::new("211", Plane::U, "pt31"),
            ChannelSpec::new("213", Plane::U, "pt33"),
            ChannelSpec::new("301", Plane::Strain, "strain01"),
        ])
        .unwrap()
    }

    fn table(low: f64, high: f64) -> ThresholdTable {
        let mut table = ThresholdTable::default();
        table.insert("U-plane", Thresholds::new(low, high).unwrap());
        table
    }

    fn u_plane(name: &str, outputs: Vec<u8>) -> HeaterGroup {
        HeaterGroup::resolve(name, &["211".into(), "213".into()], outputs, &bench_map()).unwrap()
    }

    async fn handler(
        bench: &MockBench,
    ) -> (TickHandler<Vec<u8>>, watch::Sender<ThresholdTable>) {
        handler_with(bench, vec![u_plane("U-plane", vec![1])], table(58.0, 60.0)).await
    }

    async fn handler_with(
        bench: &MockBench,
        groups: Vec<HeaterGroup>,
        thresholds: ThresholdTable,
    ) -> (TickHandler<Vec<u8>>, watch::Sender<ThresholdTable>) {
        let map = bench_map();
        let connector = Connector::with_mock(bench.clone());
        let daq = Daq970a::new(connector.clone(), map.scan_order().to_vec())
            .unwrap()
            .with_configuration(Vec::new());
        let psu = ScpiPowerSupply::new(connector, 2);
        let series = Arc::new(RwLock::new(LiveSeriesStore::new(&map, 2, 3).unwrap()));
        let mut logger = SampleLogger::new(Vec::new(), LogSchema::new(&map, 2));
        logger.write_header().unwrap();

        let mut poller = Poller::new(map)
            .with_daq(Box::new(daq), Endpoint::new("sim", TransportKind::Mock))
            .with_psu(Box::new(psu), Endpoint::new("sim", TransportKind::Mock));
        poller.connect_all().await.unwrap();

        let (tx, rx) = watch::channel(thresholds);
        let handler = TickHandler::new(
            poller,
            ThresholdActuator::new(groups),
            logger,
            series,
            rx,
        );
        (handler, tx)
    }

    fn bench() -> MockBench {
        MockBench::new(&bench_map(), 2, vec![(Plane::U, vec![1])])
    }

    #[tokio::test]
    #[traced_test]
    async fn tick_switches_logs_and_buffers() {
        let bench = bench();
        let (mut handler, _tx) = handler(&bench).await;
        let status = handler.subscribe_status();

        let sample = handler.tick().await.unwrap();
        assert_eq!(sample.readings(Plane::U).len(), 2);
        assert_eq!(bench.output_on(1).await, Some(true));
        assert!(logs_contain("Heater switched"));

        let series = handler.series();
        assert_eq!(series.read().await.series("pt31").unwrap().len(), 1);
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.records, 1);
        assert_eq!(snapshot.heaters[0].state, HeaterState::On);
    }

    #[tokio::test]
    async fn threshold_edit_applies_on_next_tick() {
        let bench = bench();
        let (mut handler, tx) = handler(&bench).await;
        handler.tick().await.unwrap();
        assert_eq!(bench.output_on(1).await, Some(true));

        tx.send(table(40.0, 50.0)).unwrap();
        handler.tick().await.unwrap();
        assert_eq!(bench.output_on(1).await, Some(false));
    }

    #[tokio::test]
    async fn failed_switch_still_drives_later_groups() {
        let bench = bench();
        let mut thresholds = table(58.0, 60.0);
        thresholds.insert("spare", Thresholds::new(58.0, 60.0).unwrap());
        // Output 3 does not exist on the 2-output supply.
        let groups = vec![u_plane("spare", vec![3]), u_plane("U-plane", vec![1])];
        let (mut handler, _tx) = handler_with(&bench, groups, thresholds).await;
        let status = handler.subscribe_status();

        assert!(matches!(
            handler.tick().await,
            Err(DaqError::Configuration(_))
        ));
        assert_eq!(bench.output_on(1).await, Some(true));
        assert_eq!(status.borrow().records, 1);
        assert!(handler.poller.disconnected().is_empty());
    }

    #[tokio::test]
    async fn mismatched_scan_is_not_logged() {
        let bench = bench();
        let (mut handler, _tx) = handler(&bench).await;
        bench.truncate_scan(Some(2)).await;
        assert!(matches!(
            handler.tick().await,
            Err(DaqError::FormatMismatch { .. })
        ));
        let series = handler.series();
        assert!(series.read().await.series("pt31").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_stopped() {
        let bench = bench();
        let (handler, _tx) = handler(&bench).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(handler.run(PERIOD, LossPolicy::Halt, stop_rx));

        time::sleep(Duration::from_secs(150)).await;
        stop_tx.send(true).unwrap();
        let (summary, log) = task.await.unwrap().unwrap();

        assert_eq!(summary.reason, StopReason::Requested);
        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.records, 3);
        let text = String::from_utf8(log).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Timestamp,pt31,pt33,strain01,V0,I0,P0,V1,I1,P1");
        // Heaters are left off after the run.
        assert_eq!(bench.output_on(1).await, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn halt_policy_stops_on_lost_instrument() {
        let bench = bench();
        let (handler, _tx) = handler(&bench).await;
        bench.set_offline(true).await;
        let (_stop_tx, stop_rx) = watch::channel(false);

        let (summary, _) = handler
            .run(PERIOD, LossPolicy::Halt, stop_rx)
            .await
            .unwrap();
        assert!(matches!(summary.reason, StopReason::InstrumentLost(_)));
        assert_eq!(summary.ticks, 1);
        assert_eq!(summary.records, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_reconnects_between_ticks() {
        let bench = bench();
        let (handler, _tx) = handler(&bench).await;
        bench.set_offline(true).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(handler.run(PERIOD, LossPolicy::Retry, stop_rx));

        // t=0 poll fails, t=60 reconnect fails, t=120 reconnect and log.
        time::sleep(Duration::from_secs(90)).await;
        bench.set_offline(false).await;
        time::sleep(Duration::from_secs(60)).await;
        stop_tx.send(true).unwrap();

        let (summary, _) = task.await.unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Requested);
        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.records, 1);
    }

    #[test]
    fn default_bench_assembles() {
        let settings = Settings::default();
        let map = settings.channel_map().unwrap();
        let _bench = simulated_bench(&settings, &map);
        assert!(build_poller(&settings, map, &Connector::new()).is_ok());
    }

    #[test]
    fn metadata_lines() {
        let settings = Settings::default();
        let identities = vec![("psu".to_string(), "ROHDE&SCHWARZ,HMP4040".to_string())];
        let metadata = log_metadata(
            &settings,
            "20240312_101500",
            &identities,
            &settings.threshold_table().unwrap(),
        );
        assert_eq!(metadata.lines()[0], "DAQ970A and PSU data");
        assert_eq!(metadata.lines()[1], "Date: 20240312_101500");
        assert_eq!(metadata.lines()[2], "IDN psu: ROHDE&SCHWARZ,HMP4040");
        assert!(metadata.lines()[3].contains("-20degC < U-plane < 30degC"));
    }
}
