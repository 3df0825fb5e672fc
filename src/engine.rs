//! The protocol engine: RRQ/WRQ state machines over the session table.
//!
//! The engine is the single owner of all protocol state. It drains one
//! event channel fed by the transport's socket readers and by armed timers,
//! so every session mutation happens on one task and cancellation never
//! races event handling.
//!
//! Read transfers are lockstep sender-side: send DATA#N, await ACK#N,
//! retransmit from the kept send buffer on timer fire, give up after five
//! retransmissions. Write transfers are acknowledger-side: ACK#0 invites
//! the first block, each in-order DATA is appended to a temporary file and
//! acked, and the short final block triggers an fsync-and-rename commit
//! followed by a dally period that only re-acks a retransmitted final
//! block.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::config::{TftpConfig, WriteConfig};
use crate::filesystem;
use crate::netascii;
use crate::session::{Op, RttClamps, Session};
use crate::table::{SessionTable, canonical, wire_addr};
use crate::timer::{TimerToken, Timers};
use crate::transport::{Event, SocketId, Transport};
use crate::wire::{BLOCK_LEN, ErrorCode, MAX_DATA_PACKET, Mode, Opcode, Packet};

pub struct Engine<T: Transport> {
    transport: T,
    table: SessionTable,
    timers: Timers,
    rx: mpsc::Receiver<Event>,
    root_dir: PathBuf,
    write_policy: WriteConfig,
    clamps: RttClamps,
    audit: bool,
}

/// Details of a finished transfer, extracted for logging once the session
/// borrow is released.
struct Completed {
    client: SocketAddr,
    target: String,
    bytes: u64,
    blocks: u16,
    duration_ms: u64,
}

impl<T: Transport> Engine<T> {
    pub fn new(
        transport: T,
        config: &TftpConfig,
        tx: mpsc::Sender<Event>,
        rx: mpsc::Receiver<Event>,
    ) -> Self {
        Self {
            transport,
            table: SessionTable::new(),
            timers: Timers::new(tx),
            rx,
            root_dir: config.root_dir.clone(),
            write_policy: config.write.clone(),
            clamps: config.rtt.clamps(),
            audit: config.logging.audit_enabled,
        }
    }

    /// Runs until the event channel closes.
    pub async fn run(mut self) {
        info!("serving files from {}", self.root_dir.display());
        while let Some(event) = self.rx.recv().await {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Datagram { socket, peer, data } => {
                if socket == self.transport.listener() {
                    self.on_listener_datagram(peer, &data).await;
                } else {
                    self.on_session_datagram(socket, peer, &data).await;
                }
            }
            Event::TimerFired {
                peer,
                socket,
                token,
            } => self.on_timer(peer, socket, token).await,
        }
    }

    /// The well-known socket only ever originates sessions. Anything that
    /// is not a fresh request is answered without creating one: transfer
    /// datagrams reference a TID we do not have, garbage is an illegal
    /// operation, and peer errors are logged and dropped.
    async fn on_listener_datagram(&mut self, raw_peer: SocketAddr, data: &[u8]) {
        let listener = self.transport.listener();
        match Packet::parse(data) {
            Err(e) => {
                error!("malformed datagram from {}: {}", raw_peer, e);
                self.send_error(listener, raw_peer, ErrorCode::IllegalOperation)
                    .await;
            }
            Ok(Packet::Rrq { filename, mode }) => {
                self.accept_request(raw_peer, false, filename, mode).await;
            }
            Ok(Packet::Wrq { filename, mode }) => {
                self.accept_request(raw_peer, true, filename, mode).await;
            }
            Ok(Packet::Ack { .. }) | Ok(Packet::Data { .. }) => {
                debug!("stray transfer datagram from {} on the listening socket", raw_peer);
                if self.audit {
                    AuditLogger::stray_datagram(raw_peer, "transfer datagram without a session");
                }
                self.send_error(listener, raw_peer, ErrorCode::UnknownTid)
                    .await;
            }
            Ok(Packet::Error { code, message }) => {
                debug!("unsolicited error {} from {}: {:?}", code, raw_peer, message);
            }
        }
    }

    async fn accept_request(
        &mut self,
        raw_peer: SocketAddr,
        is_write: bool,
        filename: String,
        mode: Mode,
    ) {
        let peer = canonical(raw_peer);
        if self.table.contains_peer(peer) {
            // Almost certainly a retransmitted request racing our first
            // reply; the live session will sort itself out.
            debug!("duplicate request from {}", raw_peer);
            return;
        }

        let reply_addr = wire_addr(raw_peer);
        let socket = match self.transport.open_session_socket(reply_addr).await {
            Ok(id) => id,
            Err(e) => {
                error!("failed to open a session socket for {}: {}", raw_peer, e);
                return;
            }
        };

        self.table
            .insert(Session::new(peer, reply_addr, socket, self.clamps));

        if is_write {
            self.start_write(peer, socket, filename, mode).await;
        } else {
            self.start_read(peer, socket, filename, mode).await;
        }
    }

    async fn start_read(&mut self, peer: SocketAddr, socket: SocketId, filename: String, mode: Mode) {
        let client = self.client_addr(peer, socket);
        info!("read request from {} for {:?} ({})", client, filename, mode.as_str());

        if mode == Mode::Mail {
            warn!("mail mode is not valid for read requests");
            if self.audit {
                AuditLogger::request_denied(client, &filename, "mail mode on a read request");
            }
            self.fail(peer, socket, ErrorCode::IllegalOperation).await;
            return;
        }

        let Some(path) = filesystem::resolve_under(&self.root_dir, &filename) else {
            warn!("refusing read of {:?}: escapes the served root", filename);
            if self.audit {
                AuditLogger::request_denied(client, &filename, "path escapes root");
            }
            self.fail(peer, socket, ErrorCode::AccessViolation).await;
            return;
        };

        match filesystem::open_read(&path).await {
            Ok(file) => {
                if let Some(sess) = self.table.get_mut(peer, socket) {
                    sess.op = Op::Reading;
                    sess.mode = mode;
                    sess.target = path;
                    sess.file = Some(file);
                }
                if self.audit {
                    AuditLogger::request_accepted(client, &filename, mode.as_str(), "read");
                }
                if let Err(e) = self.send_next_block(peer, socket).await {
                    error!("reading {:?} failed: {}", filename, e);
                    self.fail(peer, socket, ErrorCode::AccessViolation).await;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("file {:?} not found", filename);
                if self.audit {
                    AuditLogger::request_denied(client, &filename, "file not found");
                }
                self.fail(peer, socket, ErrorCode::FileNotFound).await;
            }
            Err(e) => {
                warn!("unable to open {:?}: {}", filename, e);
                if self.audit {
                    AuditLogger::request_denied(client, &filename, "not readable");
                }
                self.fail(peer, socket, ErrorCode::AccessViolation).await;
            }
        }
    }

    async fn start_write(&mut self, peer: SocketAddr, socket: SocketId, filename: String, mode: Mode) {
        let client = self.client_addr(peer, socket);
        info!("write request from {} for {:?} ({})", client, filename, mode.as_str());

        if !self.write_policy.enabled {
            warn!("write requests are disabled");
            if self.audit {
                AuditLogger::request_denied(client, &filename, "writes disabled in configuration");
            }
            self.fail(peer, socket, ErrorCode::AccessViolation).await;
            return;
        }

        let target = if mode == Mode::Mail {
            match filesystem::mail_user(&filename) {
                Some(user) => filesystem::mail_target(user),
                None => {
                    warn!("refusing mail write for invalid user {:?}", filename);
                    if self.audit {
                        AuditLogger::request_denied(client, &filename, "invalid mail user");
                    }
                    self.fail(peer, socket, ErrorCode::AccessViolation).await;
                    return;
                }
            }
        } else {
            match filesystem::resolve_under(&self.root_dir, &filename) {
                Some(path) => path,
                None => {
                    warn!("refusing write of {:?}: escapes the served root", filename);
                    if self.audit {
                        AuditLogger::request_denied(client, &filename, "path escapes root");
                    }
                    self.fail(peer, socket, ErrorCode::AccessViolation).await;
                    return;
                }
            }
        };

        if mode != Mode::Mail
            && !self.write_policy.allow_overwrite
            && matches!(tokio::fs::try_exists(&target).await, Ok(true))
        {
            warn!("refusing to overwrite {}", target.display());
            if self.audit {
                AuditLogger::request_denied(client, &filename, "file exists and overwrite disabled");
            }
            self.fail(peer, socket, ErrorCode::FileAlreadyExists).await;
            return;
        }

        if mode == Mode::Mail
            && let Err(e) = filesystem::ensure_mail_dir(&target).await
        {
            let code = if e.kind() == io::ErrorKind::NotFound {
                info!("no mail spool for {:?}", filename);
                ErrorCode::NoSuchUser
            } else {
                warn!("mail spool for {:?} unavailable: {}", filename, e);
                ErrorCode::AccessViolation
            };
            if self.audit {
                AuditLogger::request_denied(client, &filename, "mail spool unavailable");
            }
            self.fail(peer, socket, code).await;
            return;
        }

        match filesystem::open_write_tmp(&target).await {
            Ok((file, tmp)) => {
                let (frame, reply, interval) = {
                    let Some(sess) = self.table.get_mut(peer, socket) else {
                        return;
                    };
                    sess.op = Op::Writing;
                    sess.mode = mode;
                    sess.target = target;
                    sess.tmp = Some(tmp);
                    sess.file = Some(file);
                    sess.block_num = 0;
                    sess.out_buffer.clear();
                    sess.out_buffer.put_u16(Opcode::Ack as u16);
                    sess.out_buffer.put_u16(0);
                    sess.rtx.sent();
                    (
                        sess.out_buffer.to_vec(),
                        sess.reply_addr,
                        sess.rtx.write_interval(),
                    )
                };
                if self.audit {
                    AuditLogger::request_accepted(client, &filename, mode.as_str(), "write");
                }
                if let Err(e) = self.transport.send_to(socket, reply, &frame).await {
                    debug!("failed to ack block 0 for {}: {}", reply, e);
                }
                self.arm_oneshot(peer, socket, interval);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let code = if mode == Mode::Mail {
                    ErrorCode::NoSuchUser
                } else {
                    ErrorCode::AccessViolation
                };
                info!("write target for {:?} has no directory: {}", filename, e);
                if self.audit {
                    AuditLogger::request_denied(client, &filename, "target directory missing");
                }
                self.fail(peer, socket, code).await;
            }
            Err(e) => {
                warn!("unable to open a temporary file for {:?}: {}", filename, e);
                if self.audit {
                    AuditLogger::request_denied(client, &filename, "temporary file unavailable");
                }
                self.fail(peer, socket, ErrorCode::AccessViolation).await;
            }
        }
    }

    /// Everything on a session socket belongs to exactly one transfer. A
    /// datagram from anyone else -- or one that raced teardown -- gets
    /// UNKNOWN_TID and the session is left alone.
    async fn on_session_datagram(&mut self, socket: SocketId, raw_peer: SocketAddr, data: &[u8]) {
        let peer = canonical(raw_peer);
        if self.table.get_mut(peer, socket).is_none() {
            debug!("datagram from {} does not match the session on socket {}", raw_peer, socket);
            if self.audit {
                AuditLogger::stray_datagram(raw_peer, "datagram for an unknown session");
            }
            self.send_error(socket, raw_peer, ErrorCode::UnknownTid).await;
            return;
        }

        match Packet::parse(data) {
            Err(e) => {
                error!("malformed datagram from {}: {}", raw_peer, e);
                self.fail(peer, socket, ErrorCode::IllegalOperation).await;
            }
            Ok(Packet::Rrq { .. }) | Ok(Packet::Wrq { .. }) => {
                // Retransmission of the request that created this session.
                debug!("duplicate request from {}", raw_peer);
            }
            Ok(Packet::Ack { block }) => self.on_ack(peer, socket, raw_peer, block).await,
            Ok(Packet::Data { block, payload }) => {
                self.on_data(peer, socket, raw_peer, block, &payload).await;
            }
            Ok(Packet::Error { code, message }) => {
                info!("client {} aborted: error {} {:?}", raw_peer, code, message);
                if self.audit {
                    let target = self
                        .table
                        .get_mut(peer, socket)
                        .map(|s| s.target.display().to_string())
                        .unwrap_or_default();
                    AuditLogger::transfer_failed(raw_peer, &target, "aborted by client");
                }
                self.cleanup(peer, socket).await;
            }
        }
    }

    async fn on_ack(&mut self, peer: SocketAddr, socket: SocketId, raw_peer: SocketAddr, block: u16) {
        enum AckAction {
            NotReading,
            Ignore,
            Continue,
            Finished(Completed),
        }

        let action = {
            let Some(sess) = self.table.get_mut(peer, socket) else {
                return;
            };
            if sess.op != Op::Reading {
                AckAction::NotReading
            } else if block != sess.block_num {
                // Late or duplicated ack; the timer keeps running.
                debug!("stale ack for block {} from {}", block, raw_peer);
                AckAction::Ignore
            } else {
                sess.rtx.acked();
                if sess.last_block_short() {
                    AckAction::Finished(Completed {
                        client: sess.reply_addr,
                        target: sess.target.display().to_string(),
                        bytes: sess.bytes_transferred,
                        blocks: sess.block_num,
                        duration_ms: sess.started.elapsed().as_millis() as u64,
                    })
                } else {
                    AckAction::Continue
                }
            }
        };

        match action {
            AckAction::Ignore => {}
            AckAction::NotReading => {
                debug!("ack from {} for a session that is not reading", raw_peer);
                if self.audit {
                    AuditLogger::stray_datagram(raw_peer, "ack to a non-reading session");
                }
                self.send_error(socket, raw_peer, ErrorCode::UnknownTid).await;
            }
            AckAction::Continue => {
                if let Err(e) = self.send_next_block(peer, socket).await {
                    error!("read transfer for {} failed: {}", raw_peer, e);
                    self.fail(peer, socket, ErrorCode::AccessViolation).await;
                }
            }
            AckAction::Finished(done) => {
                info!(
                    "read of {} served to {} ({} bytes in {} blocks)",
                    done.target, done.client, done.bytes, done.blocks
                );
                if self.audit {
                    AuditLogger::transfer_completed(
                        done.client,
                        &done.target,
                        done.bytes,
                        done.blocks,
                        done.duration_ms,
                    );
                }
                self.cleanup(peer, socket).await;
            }
        }
    }

    async fn on_data(
        &mut self,
        peer: SocketAddr,
        socket: SocketId,
        raw_peer: SocketAddr,
        block: u16,
        payload: &[u8],
    ) {
        enum DataAction {
            NotWriting,
            Ignore,
            ReAck {
                frame: Vec<u8>,
                reply: SocketAddr,
                rearm_dally: Option<(Duration, Option<TimerToken>)>,
            },
            Progress {
                frame: Vec<u8>,
                reply: SocketAddr,
                interval: Duration,
                old_timer: Option<TimerToken>,
                finished: Option<Completed>,
            },
            Failed(ErrorCode),
        }

        let action = {
            let Some(sess) = self.table.get_mut(peer, socket) else {
                return;
            };
            if sess.op != Op::Writing {
                DataAction::NotWriting
            } else if sess.dallying {
                if block == sess.block_num {
                    // The final ack was lost; repeat it and keep dallying.
                    debug!("re-acking retransmitted final block {} from {}", block, raw_peer);
                    DataAction::ReAck {
                        frame: sess.out_buffer.to_vec(),
                        reply: sess.reply_addr,
                        rearm_dally: Some((sess.rtx.write_interval(), sess.timer.take())),
                    }
                } else {
                    debug!("ignoring block {} during dally", block);
                    DataAction::Ignore
                }
            } else {
                let expected = sess.block_num.wrapping_add(1);
                if block == expected {
                    let mut local = BytesMut::with_capacity(payload.len());
                    match sess.mode {
                        Mode::Netascii => sess.decoder.decode_into(payload, &mut local),
                        _ => local.extend_from_slice(payload),
                    }
                    let short = payload.len() < BLOCK_LEN;
                    if short && sess.mode == Mode::Netascii {
                        sess.decoder.finish(&mut local);
                    }

                    let write_result = match sess.file.as_mut() {
                        Some(file) => file.write_all(&local).await,
                        None => Err(io::Error::other("upload file handle missing")),
                    };

                    if let Err(e) = write_result {
                        error!("writing block {} failed: {}", block, e);
                        DataAction::Failed(ErrorCode::DiskFull)
                    } else {
                        sess.block_num = expected;
                        sess.bytes_transferred += local.len() as u64;
                        sess.rtx.acked();
                        sess.out_buffer.clear();
                        sess.out_buffer.put_u16(Opcode::Ack as u16);
                        sess.out_buffer.put_u16(block);
                        sess.rtx.sent();

                        if short {
                            let commit_result = match (&sess.file, &sess.tmp) {
                                (Some(file), Some(tmp)) => {
                                    filesystem::commit(file, tmp, &sess.target).await
                                }
                                _ => Ok(()),
                            };
                            match commit_result {
                                Ok(()) => {
                                    sess.file = None;
                                    sess.tmp = None;
                                    sess.dallying = true;
                                    DataAction::Progress {
                                        frame: sess.out_buffer.to_vec(),
                                        reply: sess.reply_addr,
                                        interval: sess.rtx.write_interval(),
                                        old_timer: sess.timer.take(),
                                        finished: Some(Completed {
                                            client: sess.reply_addr,
                                            target: sess.target.display().to_string(),
                                            bytes: sess.bytes_transferred,
                                            blocks: sess.block_num,
                                            duration_ms: sess.started.elapsed().as_millis()
                                                as u64,
                                        }),
                                    }
                                }
                                Err(e) => {
                                    error!(
                                        "commit of {} failed: {}",
                                        sess.target.display(),
                                        e
                                    );
                                    DataAction::Failed(ErrorCode::AccessViolation)
                                }
                            }
                        } else {
                            DataAction::Progress {
                                frame: sess.out_buffer.to_vec(),
                                reply: sess.reply_addr,
                                interval: sess.rtx.write_interval(),
                                old_timer: sess.timer.take(),
                                finished: None,
                            }
                        }
                    }
                } else if block == sess.block_num {
                    // The previous ack was lost; re-ack without advancing.
                    debug!("duplicate block {} from {}, re-acking", block, raw_peer);
                    DataAction::ReAck {
                        frame: sess.out_buffer.to_vec(),
                        reply: sess.reply_addr,
                        rearm_dally: None,
                    }
                } else {
                    debug!("out-of-order block {} from {} (expecting {})", block, raw_peer, expected);
                    DataAction::Ignore
                }
            }
        };

        match action {
            DataAction::Ignore => {}
            DataAction::NotWriting => {
                debug!("data from {} for a session that is not writing", raw_peer);
                if self.audit {
                    AuditLogger::stray_datagram(raw_peer, "data to a non-writing session");
                }
                self.send_error(socket, raw_peer, ErrorCode::UnknownTid).await;
            }
            DataAction::ReAck {
                frame,
                reply,
                rearm_dally,
            } => {
                if let Err(e) = self.transport.send_to(socket, reply, &frame).await {
                    debug!("failed to re-ack {}: {}", reply, e);
                }
                if let Some((period, old_timer)) = rearm_dally {
                    if let Some(token) = old_timer {
                        self.timers.cancel(token);
                    }
                    self.arm_oneshot(peer, socket, period);
                }
            }
            DataAction::Progress {
                frame,
                reply,
                interval,
                old_timer,
                finished,
            } => {
                if let Some(token) = old_timer {
                    self.timers.cancel(token);
                }
                if let Err(e) = self.transport.send_to(socket, reply, &frame).await {
                    debug!("failed to ack {}: {}", reply, e);
                }
                self.arm_oneshot(peer, socket, interval);
                if let Some(done) = finished {
                    info!(
                        "write of {} from {} committed ({} bytes in {} blocks)",
                        done.target, done.client, done.bytes, done.blocks
                    );
                    if self.audit {
                        AuditLogger::transfer_completed(
                            done.client,
                            &done.target,
                            done.bytes,
                            done.blocks,
                            done.duration_ms,
                        );
                    }
                }
            }
            DataAction::Failed(code) => self.fail(peer, socket, code).await,
        }
    }

    async fn on_timer(&mut self, peer: SocketAddr, socket: SocketId, token: TimerToken) {
        // Expired one-shots leave finished tasks behind; sweep them so the
        // timer map tracks only what is armed.
        self.timers.reap_finished();

        enum TimerAction {
            Stale,
            Retransmit { frame: Vec<u8>, reply: SocketAddr },
            TimedOut { client: SocketAddr, target: String },
            DallyOver,
        }

        let action = {
            let Some(sess) = self.table.get_mut(peer, socket) else {
                return;
            };
            if sess.timer != Some(token) {
                // The fire raced its own cancellation.
                TimerAction::Stale
            } else {
                match sess.op {
                    Op::Reading => {
                        if sess.rtx.fired() {
                            debug!(
                                "retransmitting block {} to {} (attempt {})",
                                sess.block_num,
                                sess.reply_addr,
                                sess.rtx.retries()
                            );
                            let wire_len = sess.out_buffer.len().min(MAX_DATA_PACKET);
                            TimerAction::Retransmit {
                                frame: sess.out_buffer[..wire_len].to_vec(),
                                reply: sess.reply_addr,
                            }
                        } else {
                            TimerAction::TimedOut {
                                client: sess.reply_addr,
                                target: sess.target.display().to_string(),
                            }
                        }
                    }
                    Op::Writing => {
                        if sess.dallying {
                            TimerAction::DallyOver
                        } else {
                            TimerAction::TimedOut {
                                client: sess.reply_addr,
                                target: sess.target.display().to_string(),
                            }
                        }
                    }
                    Op::Idle => TimerAction::Stale,
                }
            }
        };

        match action {
            TimerAction::Stale => {}
            TimerAction::Retransmit { frame, reply } => {
                if let Err(e) = self.transport.send_to(socket, reply, &frame).await {
                    debug!("retransmission to {} failed: {}", reply, e);
                }
            }
            TimerAction::TimedOut { client, target } => {
                error!("transfer of {} with {} timed out", target, client);
                if self.audit {
                    AuditLogger::transfer_failed(client, &target, "timed out");
                }
                self.fail(peer, socket, ErrorCode::TimedOut).await;
            }
            TimerAction::DallyOver => {
                debug!("dally period over for {}", peer);
                self.cleanup(peer, socket).await;
            }
        }
    }

    /// Prepares and sends the next DATA block of a read. `out_buffer` is
    /// repacked in place: the previous frame is discarded, NETASCII
    /// overflow beyond the 516-byte wire frame slides forward as the head
    /// of the new payload, and fresh file bytes top the block up.
    async fn send_next_block(&mut self, peer: SocketAddr, socket: SocketId) -> io::Result<()> {
        let (frame, reply, interval, old_timer) = {
            let Some(sess) = self.table.get_mut(peer, socket) else {
                return Ok(());
            };
            sess.block_num = sess.block_num.wrapping_add(1);

            let overflow = if sess.out_buffer.len() > MAX_DATA_PACKET {
                sess.out_buffer[MAX_DATA_PACKET..].to_vec()
            } else {
                Vec::new()
            };
            sess.out_buffer.clear();
            sess.out_buffer.put_u16(Opcode::Data as u16);
            sess.out_buffer.put_u16(sess.block_num);
            sess.out_buffer.extend_from_slice(&overflow);

            if let Some(file) = sess.file.as_mut() {
                let mut chunk = [0u8; BLOCK_LEN];
                while sess.out_buffer.len() < MAX_DATA_PACKET {
                    // Reading at most what the frame still needs bounds the
                    // buffer at one block of overflow even when NETASCII
                    // doubles every byte.
                    let want = MAX_DATA_PACKET - sess.out_buffer.len();
                    let n = file.read(&mut chunk[..want]).await?;
                    if n == 0 {
                        break;
                    }
                    sess.bytes_transferred += n as u64;
                    match sess.mode {
                        Mode::Netascii => netascii::encode_into(&chunk[..n], &mut sess.out_buffer),
                        _ => sess.out_buffer.extend_from_slice(&chunk[..n]),
                    }
                }
            }

            sess.rtx.sent();
            let wire_len = sess.out_buffer.len().min(MAX_DATA_PACKET);
            (
                sess.out_buffer[..wire_len].to_vec(),
                sess.reply_addr,
                sess.rtx.read_interval(),
                sess.timer.take(),
            )
        };

        if let Some(token) = old_timer {
            self.timers.cancel(token);
        }
        self.transport.send_to(socket, reply, &frame).await?;
        let token = self.timers.arm_periodic(peer, socket, interval);
        if let Some(sess) = self.table.get_mut(peer, socket) {
            sess.timer = Some(token);
        }
        Ok(())
    }

    fn arm_oneshot(&mut self, peer: SocketAddr, socket: SocketId, delay: Duration) {
        let token = self.timers.arm_oneshot(peer, socket, delay);
        if let Some(sess) = self.table.get_mut(peer, socket) {
            sess.timer = Some(token);
        }
    }

    /// Sends the canonical error packet for `code`; failures to send are
    /// logged and swallowed, since an ERROR is never retransmitted anyway.
    async fn send_error(&self, socket: SocketId, addr: SocketAddr, code: ErrorCode) {
        let frame = Packet::error(code).to_bytes();
        if let Err(e) = self.transport.send_to(socket, addr, &frame).await {
            debug!("failed to send {:?} to {}: {}", code, addr, e);
        }
    }

    /// Terminal protocol error: notify the peer, then tear the session
    /// down.
    async fn fail(&mut self, peer: SocketAddr, socket: SocketId, code: ErrorCode) {
        let reply = match self.table.get_mut(peer, socket) {
            Some(sess) => sess.reply_addr,
            None => return,
        };
        self.send_error(socket, reply, code).await;
        self.cleanup(peer, socket).await;
    }

    /// Idempotent teardown: cancel the timer, close the file, delete any
    /// leftover temporary, unsubscribe the socket, drop the table entry.
    async fn cleanup(&mut self, peer: SocketAddr, socket: SocketId) {
        let Some(mut sess) = self.table.remove(peer, socket) else {
            return;
        };
        if let Some(token) = sess.timer.take() {
            self.timers.cancel(token);
        }
        drop(sess.file.take());
        if let Some(tmp) = sess.tmp.take()
            && let Err(e) = tokio::fs::remove_file(&tmp).await
        {
            warn!("failed to delete temporary file {}: {}", tmp.display(), e);
        }
        self.transport.close(socket);
        debug!("session for {} torn down", sess.peer);
    }

    fn client_addr(&mut self, peer: SocketAddr, socket: SocketId) -> SocketAddr {
        self.table
            .get_mut(peer, socket)
            .map(|s| s.reply_addr)
            .unwrap_or(peer)
    }
}
