//! Framed Modbus client over any [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;

use super::{BusLogger, Connection, Direction, ModbusClient, NoopLogger, check_quantity};
use crate::error::{Error, Result};
use crate::protocol::{Adu, FrameDecoder, Framing, FunctionCode, ReadRequest};
use crate::transport::{SerialConfig, SerialTransport, TcpTransport, Transport, UdpTransport};

/// Default response timeout on serial lines.
pub const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_millis(300);

/// Default response timeout on network links.
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bus settling delay after switching slaves.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Read buffer size per receive call.
const READ_CHUNK: usize = 260;

/// A Modbus master bound to one link.
pub struct BusConnection {
    transport: Box<dyn Transport>,
    framing: Framing,
    decoder: FrameDecoder,
    logger: Arc<dyn BusLogger>,
    slave: u8,
    previous: Option<u8>,
    transaction: u16,
    timeout: Duration,
    settle_delay: Duration,
    connect_delay: Duration,
}

impl BusConnection {
    /// Creates a connection with the given transport and framing.
    ///
    /// RTU and ASCII framings get the serial timeout and a settling delay,
    /// TCP framing gets the network timeout and none.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, framing: Framing) -> Self {
        let (timeout, settle_delay) = match framing {
            Framing::Tcp => (DEFAULT_TCP_TIMEOUT, Duration::ZERO),
            Framing::Rtu | Framing::Ascii => (DEFAULT_SERIAL_TIMEOUT, DEFAULT_SETTLE_DELAY),
        };
        Self {
            transport,
            framing,
            decoder: FrameDecoder::new(framing),
            logger: Arc::new(NoopLogger),
            slave: 1,
            previous: None,
            transaction: 0,
            timeout,
            settle_delay,
            connect_delay: Duration::ZERO,
        }
    }

    /// RTU over a serial line.
    #[must_use]
    pub fn rtu(config: SerialConfig) -> Self {
        Self::new(Box::new(SerialTransport::new(config)), Framing::Rtu)
    }

    /// ASCII over a serial line.
    #[must_use]
    pub fn ascii(config: SerialConfig) -> Self {
        Self::new(Box::new(SerialTransport::new(config)), Framing::Ascii)
    }

    /// Modbus TCP.
    #[must_use]
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(Box::new(TcpTransport::new(address)), Framing::Tcp)
    }

    /// RTU frames through a TCP gateway.
    #[must_use]
    pub fn rtu_over_tcp(address: impl Into<String>) -> Self {
        Self::new(Box::new(TcpTransport::new(address)), Framing::Rtu)
            .request_timeout(DEFAULT_TCP_TIMEOUT)
    }

    /// RTU frames through a UDP gateway.
    #[must_use]
    pub fn rtu_over_udp(address: impl Into<String>) -> Self {
        Self::new(Box::new(UdpTransport::new(address)), Framing::Rtu)
            .request_timeout(DEFAULT_TCP_TIMEOUT)
    }

    /// ASCII frames through a TCP gateway.
    #[must_use]
    pub fn ascii_over_tcp(address: impl Into<String>) -> Self {
        Self::new(Box::new(TcpTransport::new(address)), Framing::Ascii)
            .request_timeout(DEFAULT_TCP_TIMEOUT)
    }

    /// Sets the response timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the delay applied when the selected slave changes.
    #[must_use]
    pub const fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the delay between opening the link and the first request.
    #[must_use]
    pub const fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Returns the link framing.
    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport.connect().await?;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        Ok(())
    }

    async fn request(&mut self, function: FunctionCode, address: u16, quantity: u16) -> Result<Bytes> {
        check_quantity(quantity)?;
        self.ensure_connected().await?;

        self.transaction = self.transaction.wrapping_add(1);
        let request = ReadRequest::new(
            self.framing,
            self.slave,
            self.transaction,
            function,
            address,
            quantity,
        )?;

        self.decoder.clear();
        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, self.exchange(request.wire())).await;
        let adu = match outcome {
            Ok(Ok(adu)) => adu,
            Ok(Err(e)) => {
                if matches!(e, Error::Io(_) | Error::Serial(_)) {
                    self.transport.disconnect();
                }
                return Err(e);
            }
            Err(_) => {
                // A late reply on a serial framing cannot be told apart from
                // the answer to the next request
                if matches!(self.framing, Framing::Rtu | Framing::Ascii) {
                    self.transport.disconnect();
                    self.decoder.clear();
                }
                return Err(Error::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        if adu.slave != self.slave {
            return Err(Error::protocol(format!(
                "response from slave {}, expected {}",
                adu.slave, self.slave
            )));
        }

        request.parse(&adu.frame)
    }

    async fn exchange(&mut self, frame: &[u8]) -> Result<Adu> {
        let address = self.transport.address().to_string();
        self.logger.frame(&address, Direction::Sent, frame);
        self.transport.send(frame).await?;

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.clear();
            self.transport.recv(&mut buf).await?;
            self.logger.frame(&address, Direction::Received, &buf);
            self.decoder.feed(&buf);

            while let Some(adu) = self.decoder.decode()? {
                if self.framing == Framing::Tcp && adu.transaction != self.transaction {
                    tracing::debug!(
                        "{}: dropping stale response for transaction {}",
                        address,
                        adu.transaction
                    );
                    continue;
                }
                return Ok(adu);
            }
        }
    }
}

impl ModbusClient for BusConnection {
    fn read_holding_registers(&mut self, address: u16, quantity: u16) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.request(FunctionCode::ReadHoldingRegisters, address, quantity))
    }

    fn read_input_registers(&mut self, address: u16, quantity: u16) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.request(FunctionCode::ReadInputRegisters, address, quantity))
    }
}

impl Connection for BusConnection {
    fn address(&self) -> &str {
        self.transport.address()
    }

    fn client(&mut self) -> &mut dyn ModbusClient {
        self
    }

    fn slave(&mut self, id: u8) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.slave = id;
            if self.previous == Some(id) {
                return;
            }
            self.previous = Some(id);
            if !self.settle_delay.is_zero() {
                tokio::time::sleep(self.settle_delay).await;
            }
        })
    }

    fn timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.timeout, timeout)
    }

    fn close(&mut self) {
        self.transport.disconnect();
        self.decoder.clear();
    }

    fn logger(&mut self, logger: Arc<dyn BusLogger>) {
        self.logger = logger;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::ExceptionCode;
    use crate::protocol::frame::tests::{rtu, tcp};

    #[derive(Default)]
    struct Capture(Mutex<Vec<(Direction, Vec<u8>)>>);

    impl BusLogger for Capture {
        fn frame(&self, _address: &str, direction: Direction, data: &[u8]) {
            self.0.lock().unwrap().push((direction, data.to_vec()));
        }
    }

    /// Answers a read with ascending register values from its start
    /// address, or address 0xFFFF with an exception.
    fn answer(pdu: &[u8]) -> Vec<u8> {
        let function = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
        if address == 0xFFFF {
            return vec![function | 0x80, 0x02];
        }
        let mut response = vec![function, (quantity * 2) as u8];
        for i in 0..quantity {
            response.extend_from_slice(&(address + i).to_be_bytes());
        }
        response
    }

    /// Serves MBAP read requests on one connection.
    async fn serve_tcp(listener: TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        while socket.read_exact(&mut request).await.is_ok() {
            let transaction = u16::from_be_bytes([request[0], request[1]]);
            let response = tcp(request[6], transaction, &answer(&request[7..]));
            socket.write_all(&response).await.unwrap();
        }
    }

    /// Serves RTU read requests over TCP, holding back the very first
    /// answer for `delay`.
    async fn serve_rtu_slow_start(listener: TcpListener, delay: Duration) {
        let delayed = Arc::new(AtomicBool::new(false));
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let delayed = Arc::clone(&delayed);
            tokio::spawn(async move {
                let mut request = [0u8; 8];
                while socket.read_exact(&mut request).await.is_ok() {
                    if !delayed.swap(true, Ordering::SeqCst) {
                        tokio::time::sleep(delay).await;
                    }
                    let response = rtu(request[0], &answer(&request[1..6]));
                    if socket.write_all(&response).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_tcp_read_and_exception() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_tcp(listener));

        let capture = Arc::new(Capture::default());
        let mut conn = BusConnection::tcp(addr);
        conn.logger(capture.clone());
        conn.slave(3).await;

        let data = conn.read_holding_registers(0x10, 2).await.unwrap();
        assert_eq!(&data[..], &[0x00, 0x10, 0x00, 0x11]);

        let err = conn.read_input_registers(0xFFFF, 1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Exception {
                function: 0x04,
                code: ExceptionCode::IllegalDataAddress
            }
        ));

        let frames = capture.0.lock().unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].0, Direction::Sent);
        assert_eq!(frames[0].1[6], 3);
        assert_eq!(frames[1].0, Direction::Received);
    }

    #[tokio::test]
    async fn test_timeout_when_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut conn = BusConnection::tcp(addr).request_timeout(Duration::from_millis(50));
        let err = conn.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn test_late_rtu_reply_not_taken_for_next_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_rtu_slow_start(listener, Duration::from_millis(150)));

        let mut conn = BusConnection::rtu_over_tcp(addr)
            .request_timeout(Duration::from_millis(100))
            .settle_delay(Duration::ZERO);
        conn.slave(1).await;

        let err = conn.read_holding_registers(0x0010, 2).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 100 }));

        // Outlast the held-back answer so it would be buffered by now
        tokio::time::sleep(Duration::from_millis(100)).await;

        let data = conn.read_holding_registers(0x0020, 2).await.unwrap();
        assert_eq!(&data[..], &[0x00, 0x20, 0x00, 0x21]);
        let data = conn.read_holding_registers(0x0030, 2).await.unwrap();
        assert_eq!(&data[..], &[0x00, 0x30, 0x00, 0x31]);
    }

    #[tokio::test]
    async fn test_rtu_exception_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_rtu_slow_start(listener, Duration::ZERO));

        let mut conn = BusConnection::rtu_over_tcp(addr).settle_delay(Duration::ZERO);
        conn.slave(4).await;
        let err = conn.read_input_registers(0xFFFF, 1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Exception {
                function: 0x04,
                code: ExceptionCode::IllegalDataAddress
            }
        ));
        let data = conn.read_input_registers(0x0001, 1).await.unwrap();
        assert_eq!(&data[..], &[0x00, 0x01]);
    }

    #[tokio::test]
    async fn test_invalid_quantity_skips_bus() {
        let mut conn = BusConnection::tcp("127.0.0.1:1");
        let err = conn.read_holding_registers(0, 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_on_slave_change() {
        let mut conn = BusConnection::rtu_over_tcp("127.0.0.1:1");

        let start = tokio::time::Instant::now();
        conn.slave(1).await;
        let first = start.elapsed();
        assert!(first >= DEFAULT_SETTLE_DELAY);

        conn.slave(1).await;
        assert_eq!(start.elapsed(), first);

        conn.slave(2).await;
        assert!(start.elapsed() >= first + DEFAULT_SETTLE_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_framing_does_not_settle() {
        let mut conn = BusConnection::tcp("127.0.0.1:1");
        let start = tokio::time::Instant::now();
        conn.slave(1).await;
        conn.slave(2).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_timeout_swap() {
        let mut conn = BusConnection::rtu_over_udp("127.0.0.1:1");
        let previous = conn.timeout(Duration::from_millis(500));
        assert_eq!(previous, DEFAULT_TCP_TIMEOUT);
        assert_eq!(conn.timeout(previous), Duration::from_millis(500));
    }
}
