//! Per-transfer session state and the adaptive retransmission controller.
//!
//! A session is a single tagged struct: read and write transfers share the
//! same fields and the `op` tag selects their interpretation. `block_num`
//! is the last block sent for a read and the last block acknowledged for a
//! write; both wrap modulo 2^16.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::fs::File;

use crate::netascii;
use crate::timer::TimerToken;
use crate::transport::SocketId;
use crate::wire::{MAX_DATA_PACKET, Mode};

/// Retransmissions of a block before the transfer is declared dead.
pub const MAX_RETRIES: u32 = 5;
/// Default lower clamp on the smoothed RTT.
pub const RTT_MIN_DEFAULT: Duration = Duration::from_millis(5);
/// Default upper clamp on the smoothed RTT.
pub const RTT_MAX_DEFAULT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Op {
    #[default]
    Idle,
    Reading,
    Writing,
}

/// Clamp bounds for the RTT estimate, configurable per server.
#[derive(Debug, Clone, Copy)]
pub struct RttClamps {
    pub min: Duration,
    pub max: Duration,
}

impl Default for RttClamps {
    fn default() -> Self {
        Self {
            min: RTT_MIN_DEFAULT,
            max: RTT_MAX_DEFAULT,
        }
    }
}

/// Exponentially weighted RTT estimator plus the retry budget for the
/// current block. The protocol engine reports the three transitions it
/// observes -- `sent`, `acked`, `fired` -- and reads back the intervals to
/// arm timers with.
#[derive(Debug, Clone, Copy)]
pub struct Retransmit {
    start: Instant,
    avg: Duration,
    clamps: RttClamps,
    retries: u32,
}

impl Retransmit {
    /// Starts pessimistic: the estimate sits at the upper clamp, and the
    /// virtual send time is half an interval in the past so the first
    /// sample lands near `max / 2`.
    pub fn new(clamps: RttClamps) -> Self {
        let now = Instant::now();
        Self {
            start: now.checked_sub(clamps.max / 2).unwrap_or(now),
            avg: clamps.max,
            clamps,
            retries: 0,
        }
    }

    /// A datagram whose response we will wait on has been sent.
    pub fn sent(&mut self) {
        self.start = Instant::now();
    }

    /// The expected response arrived: fold the measured interval into the
    /// estimate with weight 1/4 and reset the retry budget.
    pub fn acked(&mut self) {
        let sample = self.start.elapsed();
        self.avg = ((self.avg * 3 + sample) / 4).clamp(self.clamps.min, self.clamps.max);
        self.retries = 0;
    }

    /// The retransmit timer fired. Returns true while retry budget remains,
    /// consuming one retry; false once the transfer should be abandoned.
    pub fn fired(&mut self) -> bool {
        if self.retries >= MAX_RETRIES {
            return false;
        }
        self.retries += 1;
        true
    }

    /// Retransmit interval for the sending side of a read.
    pub fn read_interval(&self) -> Duration {
        (self.avg * 2).clamp(self.clamps.min, self.clamps.max)
    }

    /// Stall timeout for the receiving side of a write, where the peer
    /// drives progress and we only acknowledge.
    pub fn write_interval(&self) -> Duration {
        self.avg * 5
    }

    pub fn avg(&self) -> Duration {
        self.avg
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        self.start = Instant::now().checked_sub(by).unwrap();
    }
}

/// One transfer, owned by the session table and keyed by
/// `(peer, local socket)`.
#[derive(Debug)]
pub struct Session {
    /// Table key: the client endpoint, IPv4 mapped into IPv6 form.
    pub peer: SocketAddr,
    /// Where replies actually go, in the session socket's address family.
    pub reply_addr: SocketAddr,
    /// The ephemeral socket dedicated to this transfer.
    pub socket: SocketId,
    pub op: Op,
    pub mode: Mode,
    /// For reads, the file being served; for writes, the rename destination.
    pub target: PathBuf,
    /// Temporary file backing an in-progress upload.
    pub tmp: Option<PathBuf>,
    pub file: Option<File>,
    /// Last block sent (read) or acknowledged (write); wraps modulo 2^16.
    pub block_num: u16,
    /// The last datagram sent, kept verbatim for retransmission. For
    /// NETASCII reads this also holds up to one block of encoding overflow
    /// past the 516-byte wire frame.
    pub out_buffer: BytesMut,
    /// Carries a split CR across inbound NETASCII payload boundaries.
    pub decoder: netascii::Decoder,
    /// Set once a write has committed; the session lingers only to re-ack
    /// a retransmitted final DATA block.
    pub dallying: bool,
    pub rtx: Retransmit,
    pub timer: Option<TimerToken>,
    pub started: Instant,
    pub bytes_transferred: u64,
}

impl Session {
    pub fn new(
        peer: SocketAddr,
        reply_addr: SocketAddr,
        socket: SocketId,
        clamps: RttClamps,
    ) -> Self {
        Self {
            peer,
            reply_addr,
            socket,
            op: Op::Idle,
            mode: Mode::default(),
            target: PathBuf::new(),
            tmp: None,
            file: None,
            block_num: 0,
            out_buffer: BytesMut::with_capacity(MAX_DATA_PACKET),
            decoder: netascii::Decoder::new(),
            dallying: false,
            rtx: Retransmit::new(clamps),
            timer: None,
            started: Instant::now(),
            bytes_transferred: 0,
        }
    }

    /// Whether the block held in `out_buffer` is a short (final) one.
    pub fn last_block_short(&self) -> bool {
        self.out_buffer.len() < MAX_DATA_PACKET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clamps() -> RttClamps {
        RttClamps::default()
    }

    #[test]
    fn starts_at_the_upper_clamp() {
        let rtx = Retransmit::new(clamps());
        assert_eq!(rtx.avg(), Duration::from_millis(500));
        assert_eq!(rtx.read_interval(), Duration::from_millis(500));
        assert_eq!(rtx.write_interval(), Duration::from_millis(2500));
    }

    #[test]
    fn ewma_blends_with_quarter_weight() {
        let mut rtx = Retransmit::new(clamps());
        rtx.backdate(Duration::from_millis(100));
        rtx.acked();
        // 0.75 * 500 + 0.25 * 100 = 400, within scheduling slop.
        let avg = rtx.avg().as_millis();
        assert!((400..=405).contains(&avg), "avg was {avg} ms");
    }

    #[test]
    fn estimate_is_clamped_from_below() {
        let mut rtx = Retransmit::new(clamps());
        for _ in 0..64 {
            rtx.sent();
            rtx.acked();
        }
        assert_eq!(rtx.avg(), Duration::from_millis(5));
        // The doubled interval still respects the floor.
        assert_eq!(rtx.read_interval(), Duration::from_millis(10));
    }

    #[test]
    fn read_interval_is_clamped_from_above() {
        let rtx = Retransmit::new(RttClamps {
            min: Duration::from_millis(5),
            max: Duration::from_millis(300),
        });
        assert_eq!(rtx.read_interval(), Duration::from_millis(300));
    }

    #[test]
    fn retry_budget_is_five() {
        let mut rtx = Retransmit::new(clamps());
        for _ in 0..MAX_RETRIES {
            assert!(rtx.fired());
        }
        assert!(!rtx.fired());
    }

    #[test]
    fn ack_resets_the_retry_budget() {
        let mut rtx = Retransmit::new(clamps());
        assert!(rtx.fired());
        assert!(rtx.fired());
        rtx.acked();
        assert_eq!(rtx.retries(), 0);
    }
}
