//! Windowed TFTP client
//!
//! One [`TftpTransfer`] per invocation, living in a sink and driven by
//! `pump`: packets from the server arrive on the sink queue and the sink
//! timer retransmits whatever step is outstanding. Block numbers are kept
//! as 64-bit absolute counters internally and only mapped onto the 16-bit
//! wire counter (with the negotiated rollover) when sent or compared.
//!
//! The server must answer the request with an OACK. A server without
//! option support answers with DATA(1) or ACK(0) instead; that aborts the
//! transfer with [`TftpError::NoOptionAck`].

pub mod packet;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec;
use core::fmt;
use core::net::Ipv4Addr;

use log::{debug, info, trace, warn};

use self::packet::{DATA_HEADER_SIZE, DEFAULT_BLKSIZE, MODE_OCTET, TftpOptions, TftpPacket, error_code};
use super::buffer::{Packet, PacketQueue};
use super::config::{Rollover, TftpConfig};
use super::ethernet::ETHERTYPE_IPV4;
use super::ipv4::protocol;
use super::sink::{Sink, SinkId, SinkKind, SinkMatch};
use super::stack::{NetCore, NetError, NetStack};
use crate::fs::vfs::{read_full, write_all};
use crate::fs::{FileHandle, FileStore, FsError, OpenMode};
use crate::time::{TICKS_PER_SEC, Tick, Timer};

/// Well-known server port for the initial request
pub const SERVER_PORT: u16 = 69;

/// Transfer failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpError {
    /// Interface has no address
    NotConfigured,
    /// Every ephemeral port is taken
    NoPortAvailable,
    /// Local file could not be opened, read or written
    File(FsError),
    /// Server sent an ERROR packet
    Server { code: u16, message: String },
    /// Retry budget exhausted
    Timeout,
    /// Server does not support the option extension
    NoOptionAck,
    /// Server acknowledged options we did not ask for or cannot honour
    BadOption,
    /// Server sent something the protocol does not allow at this point
    Protocol,
    /// Aborted by the user
    Cancelled,
    /// No transfer with this id
    UnknownTransfer,
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TftpError::NotConfigured => write!(f, "Interface not configured"),
            TftpError::NoPortAvailable => write!(f, "No free UDP port"),
            TftpError::File(e) => write!(f, "File error: {}", e),
            TftpError::Server { code, message } => {
                write!(f, "Server error {}: {}", code, message)
            }
            TftpError::Timeout => write!(f, "Transfer timed out"),
            TftpError::NoOptionAck => write!(f, "Server does not support TFTP options"),
            TftpError::BadOption => write!(f, "Server acknowledged an unacceptable option"),
            TftpError::Protocol => write!(f, "TFTP protocol error"),
            TftpError::Cancelled => write!(f, "Transfer cancelled"),
            TftpError::UnknownTransfer => write!(f, "No such transfer"),
        }
    }
}

impl From<FsError> for TftpError {
    fn from(e: FsError) -> Self {
        TftpError::File(e)
    }
}

/// Summary of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u64,
    pub elapsed: Tick,
    pub timeouts: u32,
    pub bytes_per_sec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Get,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Request sent, waiting for the OACK
    Negotiating,
    Transferring,
    Done,
}

/// Wire block number of absolute block `abs`
///
/// Blocks 1..=65535 map to themselves; afterwards the counter restarts at
/// the rollover value.
pub fn wire_block(abs: u64, rollover: Rollover) -> u16 {
    const SPAN: u64 = u16::MAX as u64 + 1;
    match rollover {
        Rollover::Zero => (abs % SPAN) as u16,
        Rollover::One if abs < SPAN => abs as u16,
        Rollover::One => ((abs - SPAN) % (SPAN - 1) + 1) as u16,
    }
}

/// State of one GET or PUT
pub struct TftpTransfer {
    direction: Direction,
    phase: Phase,
    server: Ipv4Addr,
    /// Server's transfer port, locked on the first reply
    server_port: Option<u16>,
    local_port: u16,
    remote: String,
    file: Option<Box<dyn FileHandle>>,
    requested: TftpConfig,
    blksize: u16,
    windowsize: u16,
    rollover: Rollover,
    /// Size announced by the server (GET) or sent to it (PUT)
    tsize: Option<u64>,
    /// GET: last block acknowledged. PUT: last block acknowledged by the server.
    acked: u64,
    /// Next block to receive (GET) or send (PUT)
    next_block: u64,
    /// PUT: number of the final, short block
    final_block: u64,
    /// GET: received blocks waiting to be written
    pending: PacketQueue,
    bytes: u64,
    timeouts: u32,
    retries: u32,
    started: Tick,
    last_report: Tick,
    outcome: Option<Result<TransferReport, TftpError>>,
}

impl TftpTransfer {
    fn new(
        direction: Direction,
        server: Ipv4Addr,
        local_port: u16,
        remote: &str,
        file: Box<dyn FileHandle>,
        requested: TftpConfig,
        now: Tick,
    ) -> Self {
        let tsize = match direction {
            Direction::Get => None,
            Direction::Put => Some(file.size()),
        };
        Self {
            direction,
            phase: Phase::Negotiating,
            server,
            server_port: None,
            local_port,
            remote: remote.to_string(),
            file: Some(file),
            requested,
            blksize: DEFAULT_BLKSIZE,
            windowsize: 1,
            rollover: Rollover::Zero,
            tsize,
            acked: 0,
            next_block: 1,
            final_block: 0,
            pending: PacketQueue::new(),
            bytes: 0,
            timeouts: 0,
            retries: 0,
            started: now,
            last_report: now,
            outcome: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn blksize(&self) -> u16 {
        self.blksize
    }

    pub fn windowsize(&self) -> u16 {
        self.windowsize
    }

    /// Size negotiated through the tsize option
    pub fn tsize(&self) -> Option<u64> {
        self.tsize
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&Result<TransferReport, TftpError>> {
        self.outcome.as_ref()
    }

    fn send_to(&self, core: &mut NetCore, port: u16, packet: &TftpPacket<'_>) -> Result<(), NetError> {
        let datagram = core.udp_packet(self.local_port, self.server, port, &packet.to_bytes());
        core.transmit(datagram)
    }

    fn send(&self, core: &mut NetCore, packet: &TftpPacket<'_>) -> Result<(), NetError> {
        self.send_to(core, self.server_port.unwrap_or(SERVER_PORT), packet)
    }

    fn send_request(&self, core: &mut NetCore) -> Result<(), NetError> {
        let options = TftpOptions {
            blksize: Some(self.requested.blksize),
            tsize: Some(self.tsize.unwrap_or(0)),
            windowsize: Some(self.requested.windowsize),
            rollover: Some(self.requested.rollover),
        };
        let request = match self.direction {
            Direction::Get => TftpPacket::ReadRequest {
                filename: &self.remote,
                mode: MODE_OCTET,
                options,
            },
            Direction::Put => TftpPacket::WriteRequest {
                filename: &self.remote,
                mode: MODE_OCTET,
                options,
            },
        };
        debug!("TFTP: {:?} {} from {}", self.direction, self.remote, self.server);
        self.send_to(core, SERVER_PORT, &request)
    }

    /// Send the request and arm the retransmission timer
    pub fn start(&mut self, core: &mut NetCore, timer: &mut Timer) -> Result<(), NetError> {
        timer.arm(core.now(), self.requested.retry_timeout);
        self.send_request(core)
    }

    /// Receive handler
    pub fn handle_packet(
        &mut self,
        core: &mut NetCore,
        timer: &mut Timer,
        packet: Packet,
    ) -> Result<(), NetError> {
        if self.phase == Phase::Done {
            return Ok(());
        }
        let transport = packet.transport();
        if transport.len() < 2 {
            return Ok(());
        }
        let src_port = u16::from_be_bytes([transport[0], transport[1]]);

        match self.server_port {
            Some(port) if port != src_port => {
                trace!("TFTP: packet from unknown port {}", src_port);
                let reject = TftpPacket::Error {
                    code: error_code::UNKNOWN_TID,
                    message: "Unknown transfer ID",
                };
                return self.send_to(core, src_port, &reject);
            }
            Some(_) => {}
            None => self.server_port = Some(src_port),
        }

        let msg = match TftpPacket::parse(packet.payload()) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("TFTP: dropping packet: {}", e);
                core.stats_mut().rx_malformed += 1;
                return Ok(());
            }
        };

        match (self.phase, msg) {
            (_, TftpPacket::Error { code, message }) => {
                warn!("TFTP: server error {}: {}", code, message);
                self.finish(
                    core,
                    timer,
                    Err(TftpError::Server {
                        code,
                        message: message.to_string(),
                    }),
                );
                Ok(())
            }
            (Phase::Negotiating, TftpPacket::OptionAck(options)) => {
                if let Err(e) = self.accept_options(&options) {
                    return self.fail(core, timer, e, error_code::OPTION_REFUSED);
                }
                self.phase = Phase::Transferring;
                self.progress(core, timer);
                match self.direction {
                    Direction::Get => self.send_ack(core, 0),
                    Direction::Put => self.send_window(core, timer),
                }
            }
            (Phase::Negotiating, TftpPacket::Data { .. } | TftpPacket::Ack { .. }) => {
                warn!("TFTP: {} ignored the option request", self.server);
                self.fail(core, timer, TftpError::NoOptionAck, error_code::OPTION_REFUSED)
            }
            // Our ACK(0) was lost
            (Phase::Transferring, TftpPacket::OptionAck(_))
                if self.direction == Direction::Get && self.acked == 0 =>
            {
                self.send_ack(core, 0)
            }
            (Phase::Transferring, TftpPacket::Data { block, data })
                if self.direction == Direction::Get =>
            {
                if data.len() > self.blksize as usize {
                    return self.fail(core, timer, TftpError::Protocol, error_code::ILLEGAL_OPERATION);
                }
                if block != wire_block(self.next_block, self.rollover) {
                    trace!("TFTP: discarding block {}", block);
                    return Ok(());
                }
                self.receive_block(core, timer, packet)
            }
            (Phase::Transferring, TftpPacket::Ack { block }) if self.direction == Direction::Put => {
                self.receive_ack(core, timer, block)
            }
            (_, other) => {
                debug!("TFTP: unexpected {:?}", other);
                self.fail(core, timer, TftpError::Protocol, error_code::ILLEGAL_OPERATION)
            }
        }
    }

    fn accept_options(&mut self, options: &TftpOptions) -> Result<(), TftpError> {
        let blksize = options.blksize.unwrap_or(DEFAULT_BLKSIZE);
        let windowsize = options.windowsize.unwrap_or(1);
        if blksize > self.requested.blksize || windowsize > self.requested.windowsize {
            return Err(TftpError::BadOption);
        }
        self.blksize = blksize;
        self.windowsize = windowsize;
        self.rollover = options.rollover.unwrap_or(Rollover::Zero);
        if self.direction == Direction::Get {
            self.tsize = options.tsize;
        } else {
            self.final_block = self.tsize.unwrap_or(0) / blksize as u64 + 1;
        }
        debug!(
            "TFTP: blksize {} windowsize {} rollover {:?} tsize {:?}",
            self.blksize, self.windowsize, self.rollover, self.tsize
        );
        Ok(())
    }

    /// Accept the next in-order DATA block
    fn receive_block(
        &mut self,
        core: &mut NetCore,
        timer: &mut Timer,
        packet: Packet,
    ) -> Result<(), NetError> {
        let len = packet.payload().len() - DATA_HEADER_SIZE;
        let last = len < self.blksize as usize;
        self.pending.push_back(packet);
        self.bytes += len as u64;
        self.next_block += 1;
        self.progress(core, timer);

        if last || self.pending.len() >= self.windowsize as usize {
            // ACK first so the server sends the next window while we write
            self.send_ack(core, self.next_block - 1)?;
            if let Err(e) = self.flush() {
                let code = fs_error_code(&e);
                return self.fail(core, timer, e, code);
            }
            if last {
                self.finish(core, timer, Ok(()));
            }
        }
        Ok(())
    }

    /// Write buffered blocks to the file
    fn flush(&mut self) -> Result<(), TftpError> {
        let Some(file) = self.file.as_mut() else {
            self.pending.clear();
            return Ok(());
        };
        while let Some(block) = self.pending.pop_front() {
            write_all(file.as_mut(), &block.payload()[DATA_HEADER_SIZE..])?;
        }
        Ok(())
    }

    fn send_ack(&mut self, core: &mut NetCore, abs: u64) -> Result<(), NetError> {
        self.acked = abs;
        let block = wire_block(abs, self.rollover);
        trace!("TFTP: ACK {}", block);
        self.send(core, &TftpPacket::Ack { block })
    }

    /// Handle an ACK during PUT
    ///
    /// An ACK may cover any block sent so far. A repeat of the last ACK
    /// means the server lost part of the window, which is resent.
    fn receive_ack(&mut self, core: &mut NetCore, timer: &mut Timer, block: u16) -> Result<(), NetError> {
        let Some(abs) = (self.acked..self.next_block).find(|&n| wire_block(n, self.rollover) == block) else {
            debug!("TFTP: ACK {} outside window", block);
            return self.fail(core, timer, TftpError::Protocol, error_code::ILLEGAL_OPERATION);
        };

        if abs == self.acked {
            trace!("TFTP: duplicate ACK {}, resending window", block);
            self.next_block = self.acked + 1;
            return self.send_window(core, timer);
        }

        self.acked = abs;
        self.bytes = (abs * self.blksize as u64).min(self.tsize.unwrap_or(0));
        self.progress(core, timer);
        if abs == self.final_block {
            self.finish(core, timer, Ok(()));
            return Ok(());
        }
        self.send_window(core, timer)
    }

    /// Send DATA blocks until the window past the last ACK is full
    fn send_window(&mut self, core: &mut NetCore, timer: &mut Timer) -> Result<(), NetError> {
        let window_end = (self.acked + self.windowsize as u64).min(self.final_block);
        let mut buf = vec![0u8; self.blksize as usize];
        while self.next_block <= window_end {
            let abs = self.next_block;
            let len = match self.read_block(abs, &mut buf) {
                Ok(len) => len,
                Err(e) => return self.fail(core, timer, e, error_code::ACCESS_VIOLATION),
            };
            let data = TftpPacket::Data {
                block: wire_block(abs, self.rollover),
                data: &buf[..len],
            };
            self.send(core, &data)?;
            self.next_block += 1;
        }
        Ok(())
    }

    fn read_block(&mut self, abs: u64, buf: &mut [u8]) -> Result<usize, TftpError> {
        let file = self.file.as_mut().ok_or(TftpError::File(FsError::IoError))?;
        file.seek((abs - 1) * buf.len() as u64)?;
        Ok(read_full(file.as_mut(), buf)?)
    }

    /// Progress was made: reset the retry budget and push the deadline out
    fn progress(&mut self, core: &mut NetCore, timer: &mut Timer) {
        let now = core.now();
        self.retries = 0;
        timer.arm(now, self.requested.retry_timeout);
        if now.wrapping_sub(self.last_report) >= self.requested.progress_interval {
            self.last_report = now;
            info!("TFTP: {} bytes, {} timeouts", self.bytes, self.timeouts);
        }
    }

    /// Timer handler: redo the outstanding step
    pub fn handle_timeout(&mut self, core: &mut NetCore, timer: &mut Timer) -> Result<(), NetError> {
        if self.phase == Phase::Done {
            return Ok(());
        }
        self.timeouts += 1;
        self.retries += 1;
        if self.retries > self.requested.max_retries {
            warn!("TFTP: giving up after {} retries", self.requested.max_retries);
            return self.fail(core, timer, TftpError::Timeout, error_code::NOT_DEFINED);
        }
        timer.arm(core.now(), self.requested.retry_timeout);
        trace!("TFTP: timeout {} (retry {})", self.timeouts, self.retries);

        match (self.phase, self.direction) {
            (Phase::Negotiating, _) => self.send_request(core),
            (_, Direction::Get) => {
                // Acknowledge whatever arrived in order so the server resends the rest
                self.send_ack(core, self.next_block - 1)?;
                if let Err(e) = self.flush() {
                    let code = fs_error_code(&e);
                    return self.fail(core, timer, e, code);
                }
                Ok(())
            }
            (_, Direction::Put) => {
                self.next_block = self.acked + 1;
                self.send_window(core, timer)
            }
        }
    }

    /// Abort with a local failure, telling the server why
    fn fail(
        &mut self,
        core: &mut NetCore,
        timer: &mut Timer,
        error: TftpError,
        code: u16,
    ) -> Result<(), NetError> {
        let message = error.to_string();
        self.finish(core, timer, Err(error));
        if self.server_port.is_some() {
            self.send(core, &TftpPacket::Error {
                code,
                message: &message,
            })?;
        }
        Ok(())
    }

    fn finish(&mut self, core: &mut NetCore, timer: &mut Timer, result: Result<(), TftpError>) {
        if self.phase == Phase::Done {
            return;
        }
        self.phase = Phase::Done;
        timer.disarm();
        self.pending.clear();

        let closed = self.file.take().map_or(Ok(()), |file| file.close());
        let result = result.and_then(|()| closed.map_err(TftpError::File));

        let elapsed = core.now().wrapping_sub(self.started);
        let report = TransferReport {
            bytes: self.bytes,
            elapsed,
            timeouts: self.timeouts,
            bytes_per_sec: self.bytes * TICKS_PER_SEC as u64 / elapsed.max(1) as u64,
        };
        match &result {
            Ok(()) => info!(
                "TFTP: {} {} bytes in {} ticks ({} B/s, {} timeouts)",
                self.remote, report.bytes, report.elapsed, report.bytes_per_sec, report.timeouts
            ),
            Err(e) => warn!("TFTP: {} failed: {}", self.remote, e),
        }
        self.outcome = Some(result.map(|()| report));
    }

    /// Abandon a transfer that has not finished
    fn cancel(&mut self, core: &mut NetCore) {
        let mut timer = Timer::new();
        if let Err(e) = self.fail(core, &mut timer, TftpError::Cancelled, error_code::NOT_DEFINED) {
            debug!("TFTP: cancel notice not sent: {}", e);
        }
    }
}

fn fs_error_code(error: &TftpError) -> u16 {
    match error {
        TftpError::File(FsError::DiskFull) => error_code::DISK_FULL,
        TftpError::File(FsError::NotFound) => error_code::FILE_NOT_FOUND,
        TftpError::File(FsError::AlreadyExists) => error_code::FILE_EXISTS,
        TftpError::File(_) => error_code::ACCESS_VIOLATION,
        _ => error_code::NOT_DEFINED,
    }
}

impl NetStack {
    /// Open the local file and send the request
    ///
    /// # Arguments
    /// * `fs` - Volume holding `local`
    /// * `server` - TFTP server address
    /// * `remote` - File name on the server
    /// * `local` - File name on `fs`; created for GET, read for PUT
    /// * `is_put` - Upload instead of download
    ///
    /// # Returns
    /// The id of the sink driving the transfer; poll with
    /// [`NetStack::tftp_finished`] and collect with [`NetStack::tftp_finish`].
    pub fn tftp_start(
        &mut self,
        fs: &dyn FileStore,
        server: Ipv4Addr,
        remote: &str,
        local: &str,
        is_put: bool,
    ) -> Result<SinkId, TftpError> {
        let our_ip = self.core.our_ip().ok_or(TftpError::NotConfigured)?;
        let (direction, mode) = if is_put {
            (Direction::Put, OpenMode::Read)
        } else {
            (Direction::Get, OpenMode::Create)
        };
        let port = self.allocate_port().ok_or(TftpError::NoPortAvailable)?;
        let file = fs.open(local, mode)?;

        let config = self.core.config().tftp;
        let mut transfer = Box::new(TftpTransfer::new(
            direction,
            server,
            port,
            remote,
            file,
            config,
            self.core.now(),
        ));
        let mut timer = Timer::new();
        if let Err(e) = transfer.start(&mut self.core, &mut timer) {
            // The timer retries the request
            debug!("TFTP: request not sent: {}", e);
        }

        let filter = SinkMatch::ethertype(ETHERTYPE_IPV4)
            .with_protocol(protocol::UDP)
            .with_local_ip(our_ip)
            .with_remote_ip(server)
            .with_local_port(port);
        info!("TFTP: {:?} {}:{} <-> {} on port {}", direction, server, remote, local, port);
        Ok(self.add_sink(Sink::with_timer(filter, SinkKind::Tftp(transfer), timer)))
    }

    fn tftp(&self, id: SinkId) -> Option<&TftpTransfer> {
        match &self.sinks.get(id)?.kind {
            SinkKind::Tftp(transfer) => Some(&**transfer),
            _ => None,
        }
    }

    /// Whether the transfer has completed, failed, or does not exist
    pub fn tftp_finished(&self, id: SinkId) -> bool {
        self.tftp(id).is_none_or(TftpTransfer::is_finished)
    }

    /// Bytes moved so far
    pub fn tftp_progress(&self, id: SinkId) -> Option<u64> {
        self.tftp(id).map(TftpTransfer::bytes)
    }

    /// Remove the transfer and collect its outcome
    ///
    /// A transfer still running is cancelled: the server is told, the file
    /// is closed and the result is [`TftpError::Cancelled`].
    pub fn tftp_finish(&mut self, id: SinkId) -> Result<TransferReport, TftpError> {
        if self.tftp(id).is_none() {
            return Err(TftpError::UnknownTransfer);
        }
        let sink = self.remove_sink(id).ok_or(TftpError::UnknownTransfer)?;
        let SinkKind::Tftp(mut transfer) = sink.kind else {
            return Err(TftpError::UnknownTransfer);
        };
        if !transfer.is_finished() {
            transfer.cancel(&mut self.core);
        }
        transfer.outcome.take().unwrap_or(Err(TftpError::Cancelled))
    }

    /// Run a transfer to completion
    ///
    /// # Arguments
    /// * `cancel` - Polled once per pump; returning true aborts the transfer
    pub fn tftp_transfer<C>(
        &mut self,
        fs: &dyn FileStore,
        server: Ipv4Addr,
        remote: &str,
        local: &str,
        is_put: bool,
        cancel: C,
    ) -> Result<TransferReport, TftpError>
    where
        C: FnMut() -> bool,
    {
        let id = self.tftp_start(fs, server, remote, local, is_put)?;
        if self.pump_until(|stack| stack.tftp_finished(id), cancel).is_err() {
            info!("TFTP: cancelled by user");
        }
        self.tftp_finish(id)
    }
}
