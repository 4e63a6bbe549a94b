// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! rustls-backed [`Engine`] implementations
//!
//! rustls runs its cryptography inline, so these engines never report
//! `NeedTask`. The server engine starts in an [`Acceptor`] phase: the client
//! hello is parsed before a connection exists, the hello's SNI and offered
//! ALPN protocols select the per-connection server configuration, and a
//! selection miss fails the handshake.

use crate::{
    engine::{
        complete_records, DelegatedTask, Engine, Flush, HandshakeStatus, Status, MAX_PLAINTEXT_LEN,
    },
    error::{Error, Kind},
};
use ::rustls::{
    pki_types::ServerName, server::Acceptor, ClientConfig, ClientConnection, ConnectionCommon,
    ServerConfig, ServerConnection,
};
use std::{io, sync::Arc};

/// Resolves the per-connection server configuration from the client hello
///
/// Returning `None` rejects the handshake; the connection surfaces a reset
/// toward the network and an abort toward the application.
pub trait ConfigSelector {
    fn select(&self, sni: Option<&str>, offered_alpn: &[Vec<u8>]) -> Option<Arc<ServerConfig>>;
}

/// Tracks the single edge-triggered `Finished` report
///
/// rustls flips `is_handshaking` before the final flight (client Finished,
/// server session tickets) has drained; `Finished` is withheld until the
/// engine has nothing left to write so the coordinator flushes the flight
/// first.
#[derive(Debug, Default)]
struct FinishedTracker {
    reported: bool,
}

impl FinishedTracker {
    fn track(&mut self, is_handshaking: bool, wants_write: bool) -> HandshakeStatus {
        if is_handshaking {
            return if wants_write {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            };
        }
        if !self.reported {
            if wants_write {
                return HandshakeStatus::NeedWrap;
            }
            self.reported = true;
            return HandshakeStatus::Finished;
        }
        HandshakeStatus::NotHandshaking
    }
}

pub struct ServerEngine {
    phase: Phase,
    selector: Box<dyn ConfigSelector>,
    server_name: Option<String>,
    finished: FinishedTracker,
    inbound_done: bool,
    outbound_closed: bool,
}

enum Phase {
    Accepting(Box<Acceptor>),
    Streaming(Box<ServerConnection>),
}

impl ServerEngine {
    pub fn new(selector: Box<dyn ConfigSelector>) -> Self {
        Self {
            phase: Phase::Accepting(Box::default()),
            selector,
            server_name: None,
            finished: FinishedTracker::default(),
            inbound_done: false,
            outbound_closed: false,
        }
    }

    fn unwrap_accepting(&mut self, src: &[u8], feedable: usize) -> Result<Flush, Error> {
        let Phase::Accepting(acceptor) = &mut self.phase else {
            unreachable!()
        };

        if feedable == 0 {
            return Ok(Flush {
                status: Status::BufferUnderflow,
                handshake: HandshakeStatus::NeedUnwrap,
                consumed: 0,
                produced: 0,
            });
        }

        let mut reader = &src[..feedable];
        let consumed = acceptor
            .read_tls(&mut reader)
            .map_err(|_| Kind::RecordOversize.err())?;

        let accepted = match acceptor.accept() {
            Ok(Some(accepted)) => accepted,
            Ok(None) => {
                return Ok(Flush {
                    status: Status::Ok,
                    handshake: HandshakeStatus::NeedUnwrap,
                    consumed,
                    produced: 0,
                })
            }
            Err((error, _alert)) => return Err(error.into()),
        };

        let (sni, offered) = {
            let hello = accepted.client_hello();
            let sni = hello.server_name().map(str::to_string);
            let offered: Vec<Vec<u8>> = hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default();
            (sni, offered)
        };

        tracing::debug!(sni = ?sni, alpn = offered.len(), "client hello accepted");

        let Some(config) = self.selector.select(sni.as_deref(), &offered) else {
            return Err(Kind::NoRoute {
                hostname: sni,
                protocol: None,
            }
            .err());
        };

        let connection = accepted
            .into_connection(config)
            .map_err(|(error, _alert)| Error::from(error))?;

        self.server_name = sni;
        self.phase = Phase::Streaming(Box::new(connection));

        let handshake = match &self.phase {
            Phase::Streaming(conn) => self
                .finished
                .track(conn.is_handshaking(), conn.wants_write()),
            Phase::Accepting(_) => unreachable!(),
        };

        Ok(Flush {
            status: Status::Ok,
            handshake,
            consumed,
            produced: 0,
        })
    }
}

impl Engine for ServerEngine {
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Flush, Error> {
        let feedable = complete_records(src)?;
        if matches!(self.phase, Phase::Accepting(_)) {
            return self.unwrap_accepting(src, feedable);
        }
        let Phase::Streaming(conn) = &mut self.phase else {
            unreachable!()
        };
        unwrap_streaming(
            conn,
            src,
            feedable,
            dst,
            &mut self.inbound_done,
            &mut self.finished,
        )
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Flush, Error> {
        let Phase::Streaming(conn) = &mut self.phase else {
            return Ok(Flush {
                status: Status::Ok,
                handshake: HandshakeStatus::NeedUnwrap,
                consumed: 0,
                produced: 0,
            });
        };
        wrap_streaming(conn, src, dst, self.outbound_closed, &mut self.finished)
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        match &self.phase {
            Phase::Accepting(_) => HandshakeStatus::NeedUnwrap,
            Phase::Streaming(conn) => self
                .finished
                .track(conn.is_handshaking(), conn.wants_write()),
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn close_inbound(&mut self) {
        self.inbound_done = true;
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            if let Phase::Streaming(conn) = &mut self.phase {
                conn.send_close_notify();
            }
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        match &self.phase {
            Phase::Accepting(_) => self.outbound_closed,
            Phase::Streaming(conn) => self.outbound_closed && !conn.wants_write(),
        }
    }

    fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match &self.phase {
            Phase::Accepting(_) => None,
            Phase::Streaming(conn) => conn.alpn_protocol(),
        }
    }
}

pub struct ClientEngine {
    conn: Box<ClientConnection>,
    server_name: String,
    finished: FinishedTracker,
    inbound_done: bool,
    outbound_closed: bool,
}

impl ClientEngine {
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::from(::rustls::Error::General("invalid server name".into())))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            conn: Box::new(conn),
            server_name: server_name.to_string(),
            finished: FinishedTracker::default(),
            inbound_done: false,
            outbound_closed: false,
        })
    }
}

impl Engine for ClientEngine {
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Flush, Error> {
        let feedable = complete_records(src)?;
        unwrap_streaming(
            &mut self.conn,
            src,
            feedable,
            dst,
            &mut self.inbound_done,
            &mut self.finished,
        )
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Flush, Error> {
        wrap_streaming(
            &mut self.conn,
            src,
            dst,
            self.outbound_closed,
            &mut self.finished,
        )
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        self.finished
            .track(self.conn.is_handshaking(), self.conn.wants_write())
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn close_inbound(&mut self) {
        self.inbound_done = true;
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            self.conn.send_close_notify();
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && !self.conn.wants_write()
    }

    fn server_name(&self) -> Option<&str> {
        Some(&self.server_name)
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }
}

fn unwrap_streaming<D>(
    conn: &mut ConnectionCommon<D>,
    src: &[u8],
    feedable: usize,
    dst: &mut [u8],
    inbound_done: &mut bool,
    finished: &mut FinishedTracker,
) -> Result<Flush, Error> {
    let mut consumed = 0;
    if feedable > 0 {
        let mut reader = &src[..feedable];
        consumed = conn
            .read_tls(&mut reader)
            .map_err(|_| Kind::RecordOversize.err())?;
    }

    let state = conn.process_new_packets()?;

    if state.peer_has_closed() {
        *inbound_done = true;
    }

    let available = state.plaintext_bytes_to_read();
    let mut produced = 0;
    while produced < dst.len() && produced < available {
        match io::Read::read(&mut conn.reader(), &mut dst[produced..]) {
            Ok(0) => break,
            Ok(len) => produced += len,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
            // peer closed without close_notify; the transport END carries it
            Err(_) => break,
        }
    }

    let status = if produced < available {
        Status::BufferOverflow
    } else if *inbound_done {
        Status::Closed
    } else if consumed == 0 && produced == 0 {
        Status::BufferUnderflow
    } else {
        Status::Ok
    };

    let handshake = finished.track(conn.is_handshaking(), conn.wants_write());

    Ok(Flush {
        status,
        handshake,
        consumed,
        produced,
    })
}

fn wrap_streaming<D>(
    conn: &mut ConnectionCommon<D>,
    src: &[u8],
    dst: &mut [u8],
    outbound_closed: bool,
    finished: &mut FinishedTracker,
) -> Result<Flush, Error> {
    let mut consumed = 0;
    if !src.is_empty() && !conn.is_handshaking() && !outbound_closed {
        let chunk = src.len().min(MAX_PLAINTEXT_LEN);
        consumed = io::Write::write(&mut conn.writer(), &src[..chunk])
            .map_err(|error| Error::from(::rustls::Error::General(error.to_string())))?;
    }

    let mut produced = 0;
    while conn.wants_write() && produced < dst.len() {
        let mut out = &mut dst[produced..];
        match conn.write_tls(&mut out) {
            Ok(0) => break,
            Ok(len) => produced += len,
            Err(error) => {
                return Err(Error::from(::rustls::Error::General(error.to_string())))
            }
        }
    }

    let status = if outbound_closed && !conn.wants_write() {
        Status::Closed
    } else {
        Status::Ok
    };

    let handshake = finished.track(conn.is_handshaking(), conn.wants_write());

    Ok(Flush {
        status,
        handshake,
        consumed,
        produced,
    })
}
