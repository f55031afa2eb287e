//! MC protocol client over TCP.
//!
//! Two connection lifetimes are offered on purpose:
//! - `McSession`: one long-lived socket for a sequence of raw batch word/bit
//!   operations. It reconnects transparently before an operation when it is
//!   disconnected and stays open until `disconnect` (or an I/O error).
//! - `McClient` helpers (`read_string`, `write_int32`, ...): open a fresh
//!   session, perform one exchange and close it again.

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{PlcError, PlcFuture, PlcPort};
use crate::dispatch::core::config::PlcConfig;
use crate::dispatch::core::device::DeviceAddress;
use crate::dispatch::core::frame::{
    self, FrameError, RESPONSE_HEADER_LEN, RESPONSE_SUBHEADER,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

pub struct McSession {
    config: PlcConfig,
    stream: Option<TcpStream>,
}

impl McSession {
    pub fn new(config: PlcConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.stream.is_some() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    pub async fn connect(&mut self) -> Result<(), PlcError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let target = format!("{}:{}", self.config.host, self.config.port);
        debug!("[agv][plc] connect {target}");

        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(target.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(PlcError::Comm {
                    message: format!("connect {target}: {e}"),
                })
            }
            Err(_) => return Err(PlcError::Timeout),
        };
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            debug!(
                "[agv][plc] disconnect {}:{}",
                self.config.host, self.config.port
            );
            let _ = stream.shutdown().await;
        }
    }

    fn drop_connection(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            warn!(
                "[agv][plc] drop connection {}:{} reason={}",
                self.config.host, self.config.port, reason
            );
        }
    }

    /// Sends one request frame and returns the response data bytes.
    async fn exchange(&mut self, request: Vec<u8>) -> Result<Vec<u8>, PlcError> {
        self.connect().await?;
        let io_timeout = self.config.io_timeout();
        let Some(stream) = self.stream.as_mut() else {
            return Err(PlcError::Comm {
                message: "missing connected stream".to_string(),
            });
        };

        let raw = match tokio::time::timeout(io_timeout, round_trip(stream, &request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.drop_connection("io error");
                return Err(PlcError::Comm {
                    message: e.to_string(),
                });
            }
            Err(_) => {
                self.drop_connection("timeout");
                return Err(PlcError::Timeout);
            }
        };

        match frame::parse_response(&raw) {
            Ok(data) => Ok(data.to_vec()),
            // The whole frame was consumed; the socket is still in sync.
            Err(e @ FrameError::Completion(_)) => Err(e.into()),
            Err(e) => {
                self.drop_connection("malformed response");
                Err(e.into())
            }
        }
    }

    pub async fn read_words(
        &mut self,
        head: DeviceAddress,
        count: usize,
    ) -> Result<Vec<u16>, PlcError> {
        let request = frame::encode_read_words(&self.config.route, head, count)?;
        let data = self.exchange(request).await?;
        Ok(frame::decode_words(&data, count)?)
    }

    pub async fn write_words(&mut self, head: DeviceAddress, words: &[u16]) -> Result<(), PlcError> {
        let request = frame::encode_write_words(&self.config.route, head, words)?;
        self.exchange(request).await?;
        Ok(())
    }

    pub async fn read_bits(
        &mut self,
        head: DeviceAddress,
        count: usize,
    ) -> Result<Vec<bool>, PlcError> {
        let request = frame::encode_read_bits(&self.config.route, head, count)?;
        let data = self.exchange(request).await?;
        Ok(frame::unpack_bits(&data, count)?)
    }

    pub async fn write_bits(&mut self, head: DeviceAddress, bits: &[bool]) -> Result<(), PlcError> {
        let request = frame::encode_write_bits(&self.config.route, head, bits)?;
        self.exchange(request).await?;
        Ok(())
    }
}

async fn round_trip(stream: &mut TcpStream, request: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(request).await?;

    let mut header = [0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    if header[..2] != RESPONSE_SUBHEADER {
        // Length field is meaningless; let the parser report the subheader.
        return Ok(header.to_vec());
    }

    let data_len = usize::from(u16::from_le_bytes([header[7], header[8]]));
    let mut raw = Vec::with_capacity(RESPONSE_HEADER_LEN + data_len);
    raw.extend_from_slice(&header);
    let mut rest = vec![0u8; data_len.saturating_sub(2)];
    stream.read_exact(&mut rest).await?;
    raw.extend_from_slice(&rest);
    Ok(raw)
}

/// Connection settings plus per-call helpers.
#[derive(Clone, Debug)]
pub struct McClient {
    config: PlcConfig,
}

impl McClient {
    pub fn new(config: PlcConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlcConfig {
        &self.config
    }

    /// A long-lived session for raw batch operations; the caller disconnects.
    pub fn session(&self) -> McSession {
        McSession::new(self.config.clone())
    }

    async fn read_once(&self, head: DeviceAddress, count: usize) -> Result<Vec<u16>, PlcError> {
        let mut session = self.session();
        let result = session.read_words(head, count).await;
        session.disconnect().await;
        result
    }

    async fn write_once(&self, head: DeviceAddress, words: &[u16]) -> Result<(), PlcError> {
        let mut session = self.session();
        let result = session.write_words(head, words).await;
        session.disconnect().await;
        result
    }

    pub async fn read_word(&self, address: DeviceAddress) -> Result<u16, PlcError> {
        let words = self.read_once(address, 1).await?;
        Ok(words.first().copied().unwrap_or(0))
    }

    pub async fn write_word(&self, address: DeviceAddress, value: u16) -> Result<(), PlcError> {
        self.write_once(address, &[value]).await
    }

    pub async fn read_string(&self, address: DeviceAddress, words: u16) -> Result<String, PlcError> {
        let raw = self.read_once(address, usize::from(words)).await?;
        Ok(frame::words_to_string(&raw))
    }

    pub async fn write_string(
        &self,
        address: DeviceAddress,
        words: u16,
        text: &str,
    ) -> Result<(), PlcError> {
        let payload = frame::string_to_words(text, usize::from(words));
        self.write_once(address, &payload).await
    }

    pub async fn read_int32(&self, address: DeviceAddress) -> Result<i32, PlcError> {
        let raw = self.read_once(address, 2).await?;
        frame::words_to_i32(&raw).ok_or(PlcError::Frame(FrameError::DataLength {
            expected: 4,
            got: raw.len() * 2,
        }))
    }

    pub async fn write_int32(&self, address: DeviceAddress, value: i32) -> Result<(), PlcError> {
        self.write_once(address, &frame::i32_to_words(value)).await
    }
}

impl PlcPort for McClient {
    fn read_word<'a>(&'a self, address: DeviceAddress) -> PlcFuture<'a, u16> {
        Box::pin(McClient::read_word(self, address))
    }

    fn write_word<'a>(&'a self, address: DeviceAddress, value: u16) -> PlcFuture<'a, ()> {
        Box::pin(McClient::write_word(self, address, value))
    }

    fn read_string<'a>(&'a self, address: DeviceAddress, words: u16) -> PlcFuture<'a, String> {
        Box::pin(McClient::read_string(self, address, words))
    }

    fn write_string<'a>(
        &'a self,
        address: DeviceAddress,
        words: u16,
        text: &'a str,
    ) -> PlcFuture<'a, ()> {
        Box::pin(McClient::write_string(self, address, words, text))
    }

    fn read_int32<'a>(&'a self, address: DeviceAddress) -> PlcFuture<'a, i32> {
        Box::pin(McClient::read_int32(self, address))
    }

    fn write_int32<'a>(&'a self, address: DeviceAddress, value: i32) -> PlcFuture<'a, ()> {
        Box::pin(McClient::write_int32(self, address, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use crate::dispatch::core::frame::{
        pack_bits, unpack_bits, CMD_BATCH_READ, CMD_BATCH_WRITE, SUB_BIT, SUB_WORD,
    };

    #[derive(Default)]
    struct FakeMemory {
        words: HashMap<(u8, u32), u16>,
        bits: HashMap<(u8, u32), bool>,
    }

    struct FakePlc {
        addr: SocketAddr,
        connections: Arc<AtomicUsize>,
    }

    /// Minimal MC 3E server; requests at device number `fail_at` answer 0xC051.
    async fn spawn_fake_plc(fail_at: Option<u32>) -> FakePlc {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let memory = Arc::new(Mutex::new(FakeMemory::default()));

        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let memory = Arc::clone(&memory);
                tokio::spawn(async move {
                    loop {
                        let mut head = [0u8; 9];
                        if stream.read_exact(&mut head).await.is_err() {
                            return;
                        }
                        let len = usize::from(u16::from_le_bytes([head[7], head[8]]));
                        let mut rest = vec![0u8; len];
                        if stream.read_exact(&mut rest).await.is_err() {
                            return;
                        }
                        let body = &rest[2..];
                        let command = u16::from_le_bytes([body[0], body[1]]);
                        let sub = u16::from_le_bytes([body[2], body[3]]);
                        let number = u32::from_le_bytes([body[4], body[5], body[6], 0]);
                        let code = body[7];
                        let count = usize::from(u16::from_le_bytes([body[8], body[9]]));

                        let (end_code, data): (u16, Vec<u8>) = if fail_at == Some(number) {
                            (0xC051, vec![0x00, 0xFF, 0xFF, 0x03, 0x00, 0x01, 0x04, 0x00, 0x00])
                        } else {
                            let mut mem = memory.lock();
                            match (command, sub) {
                                (CMD_BATCH_READ, SUB_WORD) => (
                                    0,
                                    (0..count)
                                        .flat_map(|i| {
                                            mem.words
                                                .get(&(code, number + i as u32))
                                                .copied()
                                                .unwrap_or(0)
                                                .to_le_bytes()
                                        })
                                        .collect(),
                                ),
                                (CMD_BATCH_WRITE, SUB_WORD) => {
                                    for i in 0..count {
                                        let w = u16::from_le_bytes([
                                            body[10 + 2 * i],
                                            body[11 + 2 * i],
                                        ]);
                                        mem.words.insert((code, number + i as u32), w);
                                    }
                                    (0, Vec::new())
                                }
                                (CMD_BATCH_READ, SUB_BIT) => {
                                    let bits: Vec<bool> = (0..count)
                                        .map(|i| {
                                            mem.bits
                                                .get(&(code, number + i as u32))
                                                .copied()
                                                .unwrap_or(false)
                                        })
                                        .collect();
                                    (0, pack_bits(&bits))
                                }
                                (CMD_BATCH_WRITE, SUB_BIT) => {
                                    let bits = unpack_bits(&body[10..], count).unwrap();
                                    for (i, bit) in bits.into_iter().enumerate() {
                                        mem.bits.insert((code, number + i as u32), bit);
                                    }
                                    (0, Vec::new())
                                }
                                _ => (0xC059, Vec::new()),
                            }
                        };

                        let mut resp = vec![0xD0, 0x00, 0x00, 0xFF, 0xFF, 0x03, 0x00];
                        resp.extend_from_slice(&((data.len() + 2) as u16).to_le_bytes());
                        resp.extend_from_slice(&end_code.to_le_bytes());
                        resp.extend_from_slice(&data);
                        if stream.write_all(&resp).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        FakePlc { addr, connections }
    }

    fn config_for(addr: SocketAddr) -> PlcConfig {
        PlcConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            connect_timeout_ms: 1000,
            io_timeout_ms: 1000,
            ..PlcConfig::default()
        }
    }

    fn d(text: &str) -> DeviceAddress {
        DeviceAddress::parse(text).unwrap()
    }

    #[tokio::test]
    async fn string_written_then_read_returns_original_without_padding() {
        let plc = spawn_fake_plc(None).await;
        let client = McClient::new(config_for(plc.addr));

        client.write_string(d("D500"), 10, "LOT-20240611").await.unwrap();
        let back = client.read_string(d("D500"), 10).await.unwrap();

        assert_eq!(back, "LOT-20240611");
        // Each helper call used its own connection.
        assert_eq!(plc.connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn int32_and_word_helpers_round_trip() {
        let plc = spawn_fake_plc(None).await;
        let client = McClient::new(config_for(plc.addr));

        client.write_int32(d("D20"), -70_000).await.unwrap();
        assert_eq!(client.read_int32(d("D20")).await.unwrap(), -70_000);

        client.write_word(d("W1A"), 0xBEEF).await.unwrap();
        assert_eq!(client.read_word(d("W1A")).await.unwrap(), 0xBEEF);
    }

    #[tokio::test]
    async fn session_keeps_one_connection_and_reconnects_after_disconnect() {
        let plc = spawn_fake_plc(None).await;
        let client = McClient::new(config_for(plc.addr));
        let mut session = client.session();
        assert_eq!(session.state(), SessionState::Disconnected);

        session.write_words(d("D0"), &[1, 2, 3]).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.read_words(d("D1"), 2).await.unwrap(), vec![2, 3]);
        session.write_bits(d("M10"), &[true, false, true]).await.unwrap();
        assert_eq!(
            session.read_bits(d("M10"), 3).await.unwrap(),
            vec![true, false, true]
        );
        assert_eq!(plc.connections.load(Ordering::SeqCst), 1);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.read_words(d("D0"), 1).await.unwrap(), vec![1]);
        assert_eq!(plc.connections.load(Ordering::SeqCst), 2);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn nonzero_completion_code_aborts_the_call() {
        let plc = spawn_fake_plc(Some(9000)).await;
        let client = McClient::new(config_for(plc.addr));
        let mut session = client.session();

        let err = session.read_words(d("D9000"), 1).await.unwrap_err();
        assert_eq!(err, PlcError::Frame(FrameError::Completion(0xC051)));
        // Protocol-level rejection leaves the socket usable.
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.read_words(d("D1"), 1).await.is_ok());
        session.disconnect().await;
    }

    #[tokio::test]
    async fn refused_connection_is_a_comm_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = McClient::new(config_for(addr));
        let err = client.read_word(d("D0")).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected_before_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut session = McClient::new(config_for(addr)).session();
        let err = session.read_words(d("D0"), 2000).await.unwrap_err();
        assert!(matches!(
            err,
            PlcError::Frame(FrameError::InvalidCount { count: 2000, .. })
        ));
    }
}
