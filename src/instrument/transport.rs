//! Line-oriented SCPI transports.
//!
//! Commands are written as one `\n`-terminated line, query replies are read back as one line.
//! Every write and read is bounded by the instrument timeout, so a silent instrument costs
//! one timeout and never stalls the poll loop.

use crate::error::{AppResult, DaqError};
use crate::instrument::mock::MockBench;
use crate::instrument::{not_connected, TransportKind};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Raw SCPI socket port of LXI instruments.
pub const SCPI_PORT: u16 = 5025;

/// Baud rate of the USB virtual COM ports.
pub const SERIAL_BAUD: u32 = 9600;

/// Text command channel to one instrument.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command that has no reply.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a command and read one reply line (terminator stripped).
    async fn query(&mut self, command: &str) -> AppResult<String>;

    /// Release the underlying resource.
    async fn close(&mut self) -> AppResult<()>;

    /// Resource description for logs, e.g. `lan:192.168.1.10:5025`.
    fn describe(&self) -> String;
}

/// What the instrument on the other end is, so the simulated bench can answer for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Scanner (DAQ970A).
    Acquisition,
    /// Power supply.
    Source,
}

/// SCPI over any byte stream (TCP socket, serial port, in-memory pipe).
pub struct LineTransport<S> {
    instrument: String,
    resource: String,
    stream: BufReader<S>,
    timeout: Duration,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    /// Wrap `stream`; `resource` only appears in logs.
    pub fn new(
        instrument: impl Into<String>,
        resource: impl Into<String>,
        stream: S,
        timeout: Duration,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            resource: resource.into(),
            stream: BufReader::new(stream),
            timeout,
        }
    }

    fn timed_out(&self) -> DaqError {
        DaqError::Timeout {
            instrument: self.instrument.clone(),
            after: self.timeout,
        }
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        let line = format!("{}\n", command);
        let stream = self.stream.get_mut();
        let io = async move {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        };
        let result = tokio::time::timeout(self.timeout, io).await;
        match result {
            Err(_) => Err(self.timed_out()),
            Ok(Err(e)) => Err(DaqError::connection(&self.instrument, format!("write failed: {}", e))),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn receive(&mut self) -> AppResult<String> {
        let mut reply = String::new();
        let stream = &mut self.stream;
        let result = tokio::time::timeout(self.timeout, stream.read_line(&mut reply)).await;
        match result {
            Err(_) => Err(self.timed_out()),
            Ok(Err(e)) => Err(DaqError::connection(&self.instrument, format!("read failed: {}", e))),
            Ok(Ok(0)) => Err(DaqError::connection(&self.instrument, "closed by peer")),
            Ok(Ok(_)) => Ok(reply.trim_end_matches(['\r', '\n']).to_string()),
        }
    }
}

#[async_trait]
impl<S> ScpiTransport for LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn write(&mut self, command: &str) -> AppResult<()> {
        debug!(instrument = %self.instrument, command, "SCPI write");
        self.send(command).await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.send(command).await?;
        let reply = self.receive().await?;
        debug!(instrument = %self.instrument, command, reply = %reply, "SCPI query");
        Ok(reply)
    }

    async fn close(&mut self) -> AppResult<()> {
        // The peer may already be gone.
        if let Err(e) = self.stream.get_mut().shutdown().await {
            debug!(instrument = %self.instrument, "Shutdown failed: {}", e);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.resource.clone()
    }
}

/// Connection slot of a driver.
///
/// Drops the transport as soon as it reports a connection loss, so the driver reads as
/// disconnected until the next successful `open`.
pub struct ScpiSession {
    instrument: String,
    transport: Option<Box<dyn ScpiTransport>>,
}

impl ScpiSession {
    /// Closed session for `instrument`.
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            transport: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Install a freshly opened transport, closing any previous one.
    pub async fn attach(&mut self, transport: Box<dyn ScpiTransport>) {
        self.close().await;
        info!(instrument = %self.instrument, resource = %transport.describe(), "Transport attached");
        self.transport = Some(transport);
    }

    /// Close and forget the transport.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(instrument = %self.instrument, "Closing transport failed: {}", e);
            }
        }
    }

    fn lost(&mut self, error: &DaqError) {
        if error.is_connection_loss() && self.transport.take().is_some() {
            warn!(instrument = %self.instrument, "Marked disconnected: {}", error);
        }
    }

    /// Send a command without reply.
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| not_connected(&self.instrument))?;
        let result = transport.write(command).await;
        if let Err(e) = &result {
            self.lost(e);
        }
        result
    }

    /// Send a query and return its reply line.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| not_connected(&self.instrument))?;
        let result = transport.query(command).await;
        if let Err(e) = &result {
            self.lost(e);
        }
        result
    }
}

/// `host:port` for a LAN address given as `host`, `host:port` or `TCPIP::host::INSTR`.
pub fn socket_address(address: &str) -> String {
    let address = address.trim();
    let host = match address.strip_prefix("TCPIP") {
        Some(rest) => rest
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .split("::")
            .find(|part| !part.is_empty())
            .unwrap_or(address),
        None => address,
    };
    match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{}:{}", host, SCPI_PORT),
    }
}

/// Opens transports for drivers.
///
/// Holds the simulated bench when one is in use, so that every mock transport opened by
/// the same connector talks to the same bench.
#[derive(Clone, Default)]
pub struct Connector {
    bench: Option<MockBench>,
}

impl Connector {
    /// Connector for real instruments only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose `mock` transports are served by `bench`.
    pub fn with_mock(bench: MockBench) -> Self {
        Self { bench: Some(bench) }
    }

    /// Open a transport to `address`.
    ///
    /// # Errors
    /// `Connection` or `Timeout` when the instrument cannot be reached,
    /// `FeatureNotEnabled` for `serial` without the `instrument_serial` feature,
    /// `Configuration` for `mock` without a simulated bench.
    pub async fn open(
        &self,
        instrument: &str,
        role: DeviceRole,
        address: &str,
        kind: TransportKind,
        timeout: Duration,
    ) -> AppResult<Box<dyn ScpiTransport>> {
        match kind {
            TransportKind::Lan => open_lan(instrument, address, timeout).await,
            TransportKind::Serial => open_serial(instrument, address, timeout),
            TransportKind::Mock => {
                let bench = self.bench.as_ref().ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "{}: mock transport requested but no simulated bench is set up",
                        instrument
                    ))
                })?;
                Ok(Box::new(bench.open(instrument, role).await?))
            }
        }
    }
}

async fn open_lan(
    instrument: &str,
    address: &str,
    timeout: Duration,
) -> AppResult<Box<dyn ScpiTransport>> {
    let target = socket_address(address);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Err(_) => {
            return Err(DaqError::Timeout {
                instrument: instrument.to_string(),
                after: timeout,
            })
        }
        Ok(Err(e)) => {
            return Err(DaqError::connection(
                instrument,
                format!("cannot reach {}: {}", target, e),
            ))
        }
        Ok(Ok(stream)) => stream,
    };
    // Short SCPI lines: do not wait to coalesce them.
    stream.set_nodelay(true)?;
    info!(instrument, address = %target, "Connected over LAN");
    Ok(Box::new(LineTransport::new(
        instrument,
        format!("lan:{}", target),
        stream,
        timeout,
    )))
}

#[cfg(feature = "instrument_serial")]
fn open_serial(
    instrument: &str,
    address: &str,
    timeout: Duration,
) -> AppResult<Box<dyn ScpiTransport>> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(address, SERIAL_BAUD)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| DaqError::connection(instrument, format!("cannot open {}: {}", address, e)))?;
    info!(instrument, port = address, "Connected over serial");
    Ok(Box::new(LineTransport::new(
        instrument,
        format!("serial:{}", address),
        port,
        timeout,
    )))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial(
    _instrument: &str,
    _address: &str,
    _timeout: Duration,
) -> AppResult<Box<dyn ScpiTransport>> {
    Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn lan_addresses() {
        assert_eq!(socket_address("192.168.1.10"), "192.168.1.10:5025");
        assert_eq!(socket_address("daq.lab:5555"), "daq.lab:5555");
        assert_eq!(
            socket_address("TCPIP::192.168.1.20::INSTR"),
            "192.168.1.20:5025"
        );
        assert_eq!(
            socket_address("TCPIP0::10.0.0.5::5025::SOCKET"),
            "10.0.0.5:5025"
        );
    }

    #[tokio::test]
    async fn query_round_trip() {
        let (client, server) = duplex(1024);
        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            while server.read_line(&mut line).await.unwrap_or(0) > 0 {
                if line.trim() == "*IDN?" {
                    server
                        .get_mut()
                        .write_all(b"Keysight Technologies,DAQ970A,MY0001,A.03\r\n")
                        .await
                        .unwrap();
                }
                line.clear();
            }
        });

        let mut transport =
            LineTransport::new("daq970a", "pipe", client, Duration::from_secs(1));
        transport.write("ABOR").await.unwrap();
        let idn = transport.query("*IDN?").await.unwrap();
        assert_eq!(idn, "Keysight Technologies,DAQ970A,MY0001,A.03");
        assert_eq!(transport.describe(), "pipe");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_instrument_times_out() {
        let (client, _server) = duplex(1024);
        let mut transport = LineTransport::new("psu", "pipe", client, Duration::from_secs(55));
        let err = transport.query("MEAS:VOLT?").await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
        assert!(err.is_connection_loss());
    }

    #[tokio::test]
    async fn closed_peer_is_connection_loss() {
        let (client, server) = duplex(1024);
        drop(server);
        let mut transport = LineTransport::new("psu", "pipe", client, Duration::from_secs(1));
        let err = transport.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
    }

    /// Pipe whose shutdown always fails.
    struct StuckPipe(tokio::io::DuplexStream);

    impl AsyncRead for StuckPipe {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StuckPipe {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("socket already reset")))
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn failed_shutdown_is_logged_not_raised() {
        let (client, _server) = duplex(64);
        let mut transport =
            LineTransport::new("psu", "pipe", StuckPipe(client), Duration::from_secs(1));
        assert!(transport.close().await.is_ok());
        assert!(logs_contain("Shutdown failed: socket already reset"));
    }

    #[tokio::test]
    async fn mock_without_bench_is_a_configuration_error() {
        let err = Connector::new()
            .open(
                "psu",
                DeviceRole::Source,
                "sim",
                TransportKind::Mock,
                Duration::from_secs(1),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[tokio::test]
    async fn serial_needs_feature() {
        let err = Connector::new()
            .open(
                "psu",
                DeviceRole::Source,
                "/dev/ttyACM0",
                TransportKind::Serial,
                Duration::from_secs(1),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::FeatureNotEnabled(_)));
    }
}
