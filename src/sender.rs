//! Sender engine: handshake, congestion-controlled transfer, teardown.
//!
//! Drives one file transfer through the full connection lifecycle:
//!
//! ```text
//! HANDSHAKE → TRANSFER → FIN_WAIT1 → FIN_WAIT2 → TIMED_WAIT → CLOSED
//! ```
//!
//! The transfer loop is a single task alternating between a short timed
//! receive and local work. Loss recovery is go-back-N: the engine tracks
//! only what has been cumulatively acknowledged, and on a retransmission
//! timeout rewinds the byte source to the oldest unacknowledged byte and
//! resends from there.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::congestion::CongestionWindow;
use crate::seq;
use crate::wire::{flags, Segment, MAX_PACKET, MAX_PAYLOAD};

// ── Timing constants ───────────────────────────────────────────────────────
const RTO: Duration = Duration::from_millis(500); // fixed, not RTT-adapted
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_POLL: Duration = Duration::from_millis(5); // steady-state receive timeout
const TIMED_WAIT: Duration = Duration::from_secs(2);

// ── In-flight window ───────────────────────────────────────────────────────

/// One sent-but-unacknowledged segment.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    /// Sequence number of the segment's first byte.
    seq: u32,
    /// Payload length in bytes.
    len: u32,
}

/// Ordered record of segments sent but not yet acknowledged, oldest first.
///
/// Invariant: `bytes` equals the sum of the entry lengths.
#[derive(Debug, Default)]
struct FlightWindow {
    entries: VecDeque<InFlight>,
    bytes: u32,
}

impl FlightWindow {
    fn push(&mut self, seq: u32, len: u32) {
        self.entries.push_back(InFlight { seq, len });
        self.bytes += len;
    }

    /// Retire every entry whose end is at or before `ack`; returns the
    /// number of bytes retired (0 for a duplicate or stale ACK).
    fn retire(&mut self, ack: u32) -> u32 {
        let mut retired = 0;
        while let Some(front) = self.entries.front() {
            let end = seq::advance(front.seq, front.len);
            if seq::is_at_or_after(ack, end) {
                retired += front.len;
                self.entries.pop_front();
            } else {
                break;
            }
        }
        self.bytes -= retired;
        retired
    }

    /// Sequence number of the oldest unacknowledged byte.
    fn oldest_seq(&self) -> Option<u32> {
        self.entries.front().map(|e| e.seq)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    fn bytes(&self) -> u32 {
        self.bytes
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Sender ─────────────────────────────────────────────────────────────────

/// Send side of one connection. Created by [`Sender::handshake`]; owns the
/// connected socket, the congestion state, and the in-flight window for
/// the lifetime of the transfer.
pub struct Sender {
    socket: UdpSocket,
    cwnd: CongestionWindow,
    flight: FlightWindow,
    conn_id: u16,
    /// Sequence number for the next new byte.
    next_seq: u32,
    /// Cumulative ack value stamped on every outgoing segment.
    peer_ack: u32,
}

impl Sender {
    /// Perform the three-way handshake over an already-connected socket.
    ///
    /// Sends a SYN with a random initial sequence number and waits (up to
    /// [`HANDSHAKE_TIMEOUT`]) for a SYNACK carrying the assigned connection
    /// id. The peer's ack number becomes the local send sequence base.
    /// Any other reply, or none, is fatal.
    pub async fn handshake(socket: UdpSocket) -> Result<Self> {
        let isn = rand::thread_rng().gen_range(0..=seq::MAX_SEQ);
        let syn = Segment::header_only(isn, 0, 0, flags::SYN);
        socket.send(&syn.to_bytes()).await.context("sending SYN")?;
        log::debug!("SEND seq={} ack=0 id=0 SYN", isn);

        let mut buf = [0u8; MAX_PACKET];
        let n = timeout(HANDSHAKE_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("handshake failed: no reply from peer"))?
            .context("handshake failed: receiving SYNACK")?;
        let reply = Segment::from_bytes(&buf[..n]).context("handshake failed")?;
        if reply.flags != flags::SYN_ACK {
            bail!("handshake failed: expected SYNACK, got {}", reply.flags_name());
        }
        log::debug!(
            "RECV seq={} ack={} id={} SYNACK",
            reply.seq,
            reply.ack,
            reply.conn_id
        );

        Ok(Self {
            socket,
            cwnd: CongestionWindow::default(),
            flight: FlightWindow::default(),
            conn_id: reply.conn_id,
            next_seq: reply.ack,
            peer_ack: seq::advance(reply.seq, 1),
        })
    }

    /// Stream the byte source until it is exhausted and fully acknowledged.
    ///
    /// Each loop iteration, in order: fire the retransmission timer if due
    /// (congestion backoff + go-back-N rewind), poll for an ACK with a
    /// short timeout, then send the next chunk if the congestion window
    /// has room. A short read marks the end of the source; the loop exits
    /// once the in-flight window drains. Ten seconds without any inbound
    /// traffic is fatal.
    pub async fn transfer<R>(&mut self, source: &mut R) -> Result<()>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        let mut done = false;
        // Byte-source offset of the oldest unacknowledged byte.
        let mut base_offset: u64 = 0;
        let mut last_ack_at = Instant::now();
        let mut last_heard = Instant::now();
        let mut buf = [0u8; MAX_PACKET];
        let mut chunk = [0u8; MAX_PAYLOAD];

        loop {
            if last_heard.elapsed() > IDLE_TIMEOUT {
                bail!("transfer stalled: no reply for {:?}", IDLE_TIMEOUT);
            }

            // 1. Retransmission timeout: collapse the window and go back N.
            if !self.flight.is_empty() && last_ack_at.elapsed() >= RTO {
                self.cwnd.on_timeout();
                let resume = self.flight.oldest_seq().expect("flight window non-empty");
                log::debug!(
                    "retransmission timeout, resuming from seq={} (cwnd={} ssthresh={})",
                    resume,
                    self.cwnd.cwnd,
                    self.cwnd.ssthresh
                );
                self.next_seq = resume;
                source
                    .seek(SeekFrom::Start(base_offset))
                    .await
                    .context("rewinding byte source")?;
                self.flight.clear();
                done = false;
                last_ack_at = Instant::now();
            }

            // 2. Poll for an ACK.
            if !self.flight.is_empty() {
                match timeout(RECV_POLL, self.socket.recv(&mut buf)).await {
                    Ok(recv) => {
                        let n = recv.context("receiving ACK")?;
                        match Segment::from_bytes(&buf[..n]) {
                            Ok(reply) if reply.flags == flags::ACK => {
                                last_heard = Instant::now();
                                let retired = self.flight.retire(reply.ack);
                                log::debug!(
                                    "RECV seq={} ack={} id={} ACK cwnd={} ssthresh={}",
                                    reply.seq,
                                    reply.ack,
                                    reply.conn_id,
                                    self.cwnd.cwnd,
                                    self.cwnd.ssthresh
                                );
                                if retired > 0 {
                                    base_offset += retired as u64;
                                    last_ack_at = Instant::now();
                                    self.cwnd.on_ack();
                                }
                            }
                            Ok(reply) => {
                                last_heard = Instant::now();
                                log::debug!("DROP unexpected {} during transfer", reply.flags_name());
                            }
                            Err(e) => log::debug!("DROP malformed reply: {e}"),
                        }
                    }
                    Err(_) => {} // poll timeout, carry on
                }
            }

            if done && self.flight.is_empty() {
                return Ok(());
            }

            // 3. Send the next chunk while the window has room.
            if !done && self.flight.bytes() <= self.cwnd.cwnd {
                let n = source.read(&mut chunk).await.context("reading byte source")?;
                if n < MAX_PAYLOAD {
                    done = true;
                }
                if n == 0 {
                    continue; // never send an empty segment
                }
                let data = Segment::data(
                    self.next_seq,
                    self.peer_ack,
                    self.conn_id,
                    flags::ACK,
                    Bytes::copy_from_slice(&chunk[..n]),
                );
                self.socket.send(&data.to_bytes()).await.context("sending payload")?;
                log::debug!(
                    "SEND seq={} ack={} id={} len={} cwnd={} ssthresh={}",
                    self.next_seq,
                    self.peer_ack,
                    self.conn_id,
                    n,
                    self.cwnd.cwnd,
                    self.cwnd.ssthresh
                );
                self.flight.push(self.next_seq, n as u32);
                self.next_seq = seq::advance(self.next_seq, n as u32);
            }
        }
    }

    /// Four-way teardown: FIN, wait for FINACK, final ACK, timed-wait.
    ///
    /// The FINACK wait blocks without a timeout; a socket error there is
    /// fatal. During the two-second timed-wait the engine stays reachable
    /// and re-answers any retransmitted FIN (the peer's FINACK resend path
    /// when our final ACK was lost); anything else is dropped. Consumes
    /// the sender, releasing the transport.
    pub async fn shutdown(self) -> Result<()> {
        let fin_seq = self.next_seq;
        let fin = Segment::header_only(fin_seq, 0, self.conn_id, flags::FIN);
        self.socket.send(&fin.to_bytes()).await.context("sending FIN")?;
        log::debug!("SEND seq={} ack=0 id={} FIN", fin_seq, self.conn_id);

        // FIN_WAIT2: block until the FINACK arrives.
        let mut buf = [0u8; MAX_PACKET];
        let finack = loop {
            let n = self
                .socket
                .recv(&mut buf)
                .await
                .context("teardown failed: receiving FINACK")?;
            match Segment::from_bytes(&buf[..n]) {
                Ok(reply) if reply.flags == flags::FIN_ACK => break reply,
                Ok(reply) => {
                    log::debug!("DROP {} while waiting for FINACK", reply.flags_name())
                }
                Err(e) => log::debug!("DROP malformed reply: {e}"),
            }
        };
        log::debug!(
            "RECV seq={} ack={} id={} FINACK",
            finack.seq,
            finack.ack,
            finack.conn_id
        );

        // The FIN consumed one sequence number.
        let final_seq = seq::advance(fin_seq, 1);
        let final_ack =
            Segment::header_only(final_seq, seq::advance(finack.seq, 1), self.conn_id, flags::ACK);
        self.socket
            .send(&final_ack.to_bytes())
            .await
            .context("sending final ACK")?;
        log::debug!(
            "SEND seq={} ack={} id={} ACK",
            final_seq,
            seq::advance(finack.seq, 1),
            self.conn_id
        );

        // TIMED_WAIT: stay reachable for retransmitted FINs.
        let deadline = Instant::now() + TIMED_WAIT;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                break;
            };
            let Ok(recv) = timeout(remaining, self.socket.recv(&mut buf)).await else {
                break;
            };
            let n = match recv {
                Ok(n) => n,
                Err(e) => {
                    log::debug!("ignoring receive error in timed-wait: {e}");
                    continue;
                }
            };
            match Segment::from_bytes(&buf[..n]) {
                Ok(reply) if reply.flags == flags::FIN_ACK || reply.flags == flags::FIN => {
                    let ack = Segment::header_only(
                        final_seq,
                        seq::advance(reply.seq, 1),
                        self.conn_id,
                        flags::ACK,
                    );
                    self.socket.send(&ack.to_bytes()).await.context("re-sending final ACK")?;
                    log::debug!("SEND seq={} ack={} id={} ACK (timed-wait)", final_seq, seq::advance(reply.seq, 1), self.conn_id);
                }
                Ok(reply) => log::debug!("DROP {} in timed-wait", reply.flags_name()),
                Err(e) => log::debug!("DROP malformed segment in timed-wait: {e}"),
            }
        }

        Ok(())
    }
}
