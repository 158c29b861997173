//! Minimal in-process MQTT 3.1.1 broker over mutual TLS.
//!
//! Handles CONNECT, PUBLISH (QoS 0/1), PINGREQ and DISCONNECT, which is all the
//! agent speaks. Every publish is recorded with the index of the connection
//! it arrived on.

use super::certs::{Issued, TestCa};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RecordedPublish {
    pub connection: usize,
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    publishes: Mutex<Vec<RecordedPublish>>,
    connects: Mutex<Vec<String>>,
    accepted: AtomicUsize,
    handshake_failures: AtomicUsize,
    ack_delay_ms: AtomicUsize,
    live: Mutex<Vec<CancellationToken>>,
    open_sessions: AtomicUsize,
    peak_sessions: AtomicUsize,
}

/// Counts one MQTT session from CONNECT until its socket task ends.
struct SessionGuard(Arc<BrokerState>);

impl SessionGuard {
    fn open(state: &Arc<BrokerState>) -> Self {
        let now = state.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_sessions.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeBroker {
    pub addr: SocketAddr,
    state: Arc<BrokerState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start(ca: &TestCa, server: &Issued) -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap(), ca, server).await
    }

    pub async fn start_on(addr: SocketAddr, ca: &TestCa, server: &Issued) -> Self {
        let mut roots = RootCertStore::empty();
        roots.add(ca.der()).unwrap();
        let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .unwrap();
        let config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(vec![server.der()], server.private_key())
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState::default());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::clone(&state),
            shutdown.clone(),
        ));
        Self {
            addr,
            state,
            shutdown,
            task,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Delays every PUBACK by `delay`.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.state
            .ack_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn publishes(&self) -> Vec<RecordedPublish> {
        self.state.publishes.lock().unwrap().clone()
    }

    /// Client ids of completed MQTT CONNECTs, in order.
    pub fn connects(&self) -> Vec<String> {
        self.state.connects.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connects().len()
    }

    /// Sessions currently between CONNECT and close.
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of sessions ever open at the same time.
    pub fn peak_sessions(&self) -> usize {
        self.state.peak_sessions.load(Ordering::SeqCst)
    }

    pub fn handshake_failures(&self) -> usize {
        self.state.handshake_failures.load(Ordering::SeqCst)
    }

    pub fn tcp_accepts(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Drops every open connection without a DISCONNECT.
    pub fn kick_all(&self) {
        for token in self.state.live.lock().unwrap().drain(..) {
            token.cancel();
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.kick_all();
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<BrokerState>,
    shutdown: CancellationToken,
) {
    loop {
        let (tcp, _) = tokio::select! {
            _ = shutdown.cancelled() => return,
            r = listener.accept() => match r {
                Ok(conn) => conn,
                Err(_) => continue,
            },
        };
        state.accepted.fetch_add(1, Ordering::SeqCst);
        let acceptor = acceptor.clone();
        let state = Arc::clone(&state);
        let token = shutdown.child_token();
        state.live.lock().unwrap().push(token.clone());
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(tls) => serve(tls, state, token).await,
                Err(_) => {
                    state.handshake_failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }
}

async fn serve(stream: TlsStream<TcpStream>, state: Arc<BrokerState>, token: CancellationToken) {
    let (mut rd, wr) = tokio::io::split(stream);
    let wr = Arc::new(tokio::sync::Mutex::new(wr));
    let mut connection: Option<usize> = None;
    let mut session: Option<SessionGuard> = None;
    let mut client_id = String::new();

    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => return,
            p = read_packet(&mut rd) => p,
        };
        let Ok((header, body)) = packet else { return };

        match header >> 4 {
            1 => {
                session.get_or_insert_with(|| SessionGuard::open(&state));
                client_id = parse_connect_client_id(&body).unwrap_or_default();
                {
                    let mut connects = state.connects.lock().unwrap();
                    connection = Some(connects.len());
                    connects.push(client_id.clone());
                }
                if write(&wr, &[0x20, 0x02, 0x00, 0x00]).await.is_err() {
                    return;
                }
            }
            3 => {
                let qos = (header >> 1) & 0x03;
                let Some((topic, pkid, payload)) = parse_publish(&body, qos) else {
                    return;
                };
                state.publishes.lock().unwrap().push(RecordedPublish {
                    connection: connection.unwrap_or(usize::MAX),
                    client_id: client_id.clone(),
                    topic,
                    payload,
                });
                if qos == 1 {
                    let ack = [0x40, 0x02, (pkid >> 8) as u8, pkid as u8];
                    let delay = state.ack_delay_ms.load(Ordering::SeqCst);
                    if delay == 0 {
                        if write(&wr, &ack).await.is_err() {
                            return;
                        }
                    } else {
                        let wr = Arc::clone(&wr);
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                            let _ = write(&wr, &ack).await;
                        });
                    }
                }
            }
            12 => {
                if write(&wr, &[0xD0, 0x00]).await.is_err() {
                    return;
                }
            }
            14 => return,
            _ => {}
        }
    }
}

type Writer = Arc<tokio::sync::Mutex<WriteHalf<TlsStream<TcpStream>>>>;

async fn write(wr: &Writer, bytes: &[u8]) -> std::io::Result<()> {
    let mut wr = wr.lock().await;
    wr.write_all(bytes).await?;
    wr.flush().await
}

async fn read_packet(rd: &mut ReadHalf<TlsStream<TcpStream>>) -> std::io::Result<(u8, Vec<u8>)> {
    let header = rd.read_u8().await?;
    let mut len: usize = 0;
    let mut shift = 0;
    loop {
        let byte = rd.read_u8().await?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "remaining length too long",
            ));
        }
    }
    let mut body = vec![0u8; len];
    rd.read_exact(&mut body).await?;
    Ok((header, body))
}

fn read_str(buf: &[u8], at: usize) -> Option<(String, usize)> {
    let len = u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]) as usize;
    let bytes = buf.get(at + 2..at + 2 + len)?;
    Some((String::from_utf8_lossy(bytes).into_owned(), at + 2 + len))
}

fn parse_connect_client_id(body: &[u8]) -> Option<String> {
    let (_, at) = read_str(body, 0)?;
    // protocol level, connect flags, keep-alive
    let at = at + 4;
    read_str(body, at).map(|(id, _)| id)
}

fn parse_publish(body: &[u8], qos: u8) -> Option<(String, u16, Vec<u8>)> {
    let (topic, mut at) = read_str(body, 0)?;
    let mut pkid = 0;
    if qos > 0 {
        pkid = u16::from_be_bytes([*body.get(at)?, *body.get(at + 1)?]);
        at += 2;
    }
    Some((topic, pkid, body.get(at..)?.to_vec()))
}
