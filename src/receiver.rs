//! Receiver: connection table, out-of-order reassembly, dispatch loop.
//!
//! A single task owns the socket and all per-connection state, so no
//! locking is needed anywhere in here. Each loop iteration either drains
//! one segment from a connection's out-of-order buffer (once the gap
//! before it has closed) or performs a short timed receive, then reaps
//! idle connections and dispatches by flag:
//!
//! - SYN: allocate a connection id from a bounded pool, open a fresh
//!   output sink, reply SYNACK.
//! - FIN: close the sink, reply FINACK; the subsequent closing ACK
//!   removes the connection silently.
//! - ACK / data: in-order payload goes straight to the sink; anything
//!   ahead of expectation is buffered, never written out of order.
//!
//! Every reply is a header-only segment addressed to the datagram's
//! source. Malformed or unknown segments are dropped and logged, never
//! fatal; only socket failures abort the loop.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::seq;
use crate::wire::{flags, Segment, MAX_PACKET};

// ── Tuning constants ───────────────────────────────────────────────────────
const IDLE_REAP: Duration = Duration::from_secs(10);
const RECV_POLL: Duration = Duration::from_millis(5);
/// Connection ids cycle through `1..=MAX_CONN_IDS`; 0 means unassigned.
const MAX_CONN_IDS: u16 = 10;
/// Written to a sink before an abandoned connection is torn down.
const ERROR_MARKER: &[u8] = b"ERROR";

/// Destination for one connection's reassembled byte stream.
pub type Sink = Box<dyn Write + Send>;

/// Opens the sink for a newly accepted connection id.
pub type SinkFactory = Box<dyn FnMut(u16) -> Result<Sink> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    FinReceived,
}

/// Per-connection state, created on SYN and destroyed on completed
/// teardown or idle timeout.
struct Connection {
    /// Next sequence number the sink expects.
    expected_seq: u32,
    /// Our send-sequence value as the peer last acknowledged it; seeded at
    /// SYNACK time, refreshed from each data segment's ack field.
    local_seq: u32,
    last_ack_sent: u32,
    last_activity: Instant,
    /// Source address of the most recent datagram; replies for drained
    /// buffered segments go here.
    peer: SocketAddr,
    /// Taken (closed) on FIN or reap.
    sink: Option<Sink>,
    state: Lifecycle,
    /// Out-of-order buffer: sequence number → segment, drained in order.
    pending: BTreeMap<u32, Segment>,
}

/// All receiver-side connection state, keyed by connection id.
///
/// Owned by the dispatch loop and passed nowhere else; handlers return
/// the reply to emit rather than touching the socket themselves, which
/// keeps the whole table testable without I/O.
pub struct ConnectionTable {
    conns: HashMap<u16, Connection>,
    next_id: u16,
    make_sink: SinkFactory,
}

impl ConnectionTable {
    pub fn new(make_sink: SinkFactory) -> Self {
        Self {
            conns: HashMap::new(),
            next_id: 1,
            make_sink,
        }
    }

    /// Next free connection id from the bounded pool, or `None` when every
    /// id is in use.
    fn allocate_id(&mut self) -> Option<u16> {
        for _ in 0..MAX_CONN_IDS {
            let id = self.next_id;
            self.next_id = self.next_id % MAX_CONN_IDS + 1;
            if !self.conns.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Tear down every connection idle longer than [`IDLE_REAP`]: write an
    /// error marker, close the sink, drop the record and its buffer.
    pub fn sweep_idle(&mut self, now: Instant) {
        let stale: Vec<u16> = self
            .conns
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_activity) > IDLE_REAP)
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            log::warn!("connection {} idle for more than {:?}, closing", id, IDLE_REAP);
            if let Some(mut conn) = self.conns.remove(&id) {
                if let Some(mut sink) = conn.sink.take() {
                    let _ = sink.write_all(ERROR_MARKER);
                    let _ = sink.flush();
                }
            }
        }
    }

    /// Scan the out-of-order buffers: evict entries that fell behind their
    /// connection's expectation, and pull out the first buffered segment
    /// whose gap has closed, to be dispatched instead of a socket read.
    pub fn pop_ready(&mut self) -> Option<(Segment, SocketAddr)> {
        let ids: Vec<u16> = self.conns.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.conns.get_mut(&id) else {
                continue;
            };
            let expected = conn.expected_seq;
            let ready = conn.pending.remove(&expected);
            conn.pending.retain(|&s, _| {
                let keep = seq::is_after(s, expected);
                if !keep {
                    log::debug!("DROP stale buffered seq={} id={} (expected {})", s, id, expected);
                }
                keep
            });
            if let Some(seg) = ready {
                return Some((seg, conn.peer));
            }
        }
        None
    }

    /// Dispatch one decoded segment; returns the header-only reply to send
    /// to `from`, if any.
    pub fn handle_segment(&mut self, seg: Segment, from: SocketAddr, now: Instant) -> Option<Segment> {
        if !seg.has_valid_flags() {
            log::debug!("DROP seq={} id={} invalid flags {}", seg.seq, seg.conn_id, seg.flags);
            return None;
        }
        if seg.conn_id != 0 && !self.conns.contains_key(&seg.conn_id) {
            log::debug!("DROP seq={} id={} unknown connection", seg.seq, seg.conn_id);
            return None;
        }
        match seg.flags {
            flags::SYN => self.on_syn(&seg, from, now),
            flags::FIN => self.on_fin(&seg, from, now),
            flags::ACK => self.on_data(seg, from, now),
            _ => {
                log::debug!("DROP unexpected {} from {}", seg.flags_name(), from);
                None
            }
        }
    }

    fn on_syn(&mut self, seg: &Segment, from: SocketAddr, now: Instant) -> Option<Segment> {
        let Some(id) = self.allocate_id() else {
            log::warn!("connection table full, dropping SYN from {}", from);
            return None;
        };
        let sink = match (self.make_sink)(id) {
            Ok(sink) => sink,
            Err(e) => {
                log::error!("failed to open sink for connection {}: {e:#}", id);
                return None;
            }
        };
        let isn = rand::thread_rng().gen_range(0..=seq::MAX_SEQ);
        // The handshake's agreed value: everything up to the SYN is acked.
        let expected = seq::advance(seg.seq, 1);
        self.conns.insert(
            id,
            Connection {
                expected_seq: expected,
                // The SYNACK consumes one sequence number.
                local_seq: seq::advance(isn, 1),
                last_ack_sent: expected,
                last_activity: now,
                peer: from,
                sink: Some(sink),
                state: Lifecycle::Active,
                pending: BTreeMap::new(),
            },
        );
        log::info!("connection {} accepted from {}", id, from);
        Some(Segment::header_only(isn, expected, id, flags::SYN_ACK))
    }

    fn on_fin(&mut self, seg: &Segment, from: SocketAddr, now: Instant) -> Option<Segment> {
        let Some(conn) = self.conns.get_mut(&seg.conn_id) else {
            log::debug!("DROP FIN for unassigned connection id {}", seg.conn_id);
            return None;
        };
        conn.last_activity = now;
        conn.peer = from;
        conn.state = Lifecycle::FinReceived;
        if let Some(mut sink) = conn.sink.take() {
            let _ = sink.flush();
        }
        log::info!("connection {} closing", seg.conn_id);
        Some(Segment::header_only(
            conn.local_seq,
            seq::advance(seg.seq, 1),
            seg.conn_id,
            flags::FIN_ACK,
        ))
    }

    fn on_data(&mut self, seg: Segment, from: SocketAddr, now: Instant) -> Option<Segment> {
        let conn_id = seg.conn_id;
        let Some(conn) = self.conns.get_mut(&seg.conn_id) else {
            log::debug!("DROP ACK for unassigned connection id {}", seg.conn_id);
            return None;
        };
        conn.last_activity = now;
        conn.peer = from;
        conn.local_seq = seg.ack;

        if conn.state == Lifecycle::FinReceived {
            // The closing acknowledgment for our FINACK: remove the record
            // and its buffer, and send nothing back.
            log::info!("connection {} closed", seg.conn_id);
            self.conns.remove(&seg.conn_id);
            return None;
        }

        if seg.seq == conn.expected_seq {
            if !seg.payload.is_empty() {
                if let Some(sink) = conn.sink.as_mut() {
                    if let Err(e) = sink.write_all(&seg.payload) {
                        log::error!("sink write failed for connection {}: {e}", seg.conn_id);
                        self.conns.remove(&seg.conn_id);
                        return None;
                    }
                }
                conn.expected_seq = seq::advance(conn.expected_seq, seg.payload.len() as u32);
            }
        } else if seq::is_after(seg.seq, conn.expected_seq) {
            log::debug!(
                "buffering out-of-order seq={} id={} (expected {})",
                seg.seq,
                seg.conn_id,
                conn.expected_seq
            );
            conn.pending.insert(seg.seq, seg);
        } else {
            log::debug!(
                "DROP stale seq={} id={} (expected {})",
                seg.seq,
                seg.conn_id,
                conn.expected_seq
            );
        }

        conn.last_ack_sent = conn.expected_seq;
        Some(Segment::header_only(
            conn.local_seq,
            conn.last_ack_sent,
            conn_id,
            flags::ACK,
        ))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.conns.len()
    }
}

/// The receive side of the transfer service: one socket, one table, one
/// control loop.
pub struct Receiver {
    socket: UdpSocket,
    table: ConnectionTable,
}

impl Receiver {
    pub fn new(socket: UdpSocket, make_sink: SinkFactory) -> Self {
        Self {
            socket,
            table: ConnectionTable::new(make_sink),
        }
    }

    /// Serve forever. Only a socket failure returns (fatally).
    pub async fn run(mut self) -> Result<()> {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let now = Instant::now();

            // A reordered segment whose gap has closed takes priority over
            // the transport.
            let (seg, from) = if let Some(ready) = self.table.pop_ready() {
                ready
            } else {
                match timeout(RECV_POLL, self.socket.recv_from(&mut buf)).await {
                    Err(_) => {
                        self.table.sweep_idle(now);
                        continue;
                    }
                    Ok(recv) => {
                        let (n, from) = recv.context("receiving datagram")?;
                        match Segment::from_bytes(&buf[..n]) {
                            Ok(seg) => (seg, from),
                            Err(e) => {
                                log::debug!("DROP malformed datagram from {from}: {e}");
                                continue;
                            }
                        }
                    }
                }
            };

            self.table.sweep_idle(now);

            log::debug!(
                "RECV seq={} ack={} id={} {} len={}",
                seg.seq,
                seg.ack,
                seg.conn_id,
                seg.flags_name(),
                seg.payload.len()
            );
            if let Some(reply) = self.table.handle_segment(seg, from, now) {
                log::debug!(
                    "SEND seq={} ack={} id={} {}",
                    reply.seq,
                    reply.ack,
                    reply.conn_id,
                    reply.flags_name()
                );
                self.socket
                    .send_to(&reply.to_bytes(), from)
                    .await
                    .context("sending reply")?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::Sender;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    type SinkMap = Arc<Mutex<HashMap<u16, Arc<Mutex<Vec<u8>>>>>>;

    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Factory handing out in-memory sinks, with an outside view of every
    /// sink's contents keyed by connection id.
    fn memory_sinks() -> (SinkFactory, SinkMap) {
        let map: SinkMap = Arc::new(Mutex::new(HashMap::new()));
        let registry = Arc::clone(&map);
        let factory: SinkFactory = Box::new(move |id| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            registry.lock().unwrap().insert(id, Arc::clone(&buf));
            Ok(Box::new(SharedSink(buf)) as Sink)
        });
        (factory, map)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn table() -> (ConnectionTable, SinkMap) {
        let (factory, sinks) = memory_sinks();
        (ConnectionTable::new(factory), sinks)
    }

    /// Open a connection and return (id, expected base sequence).
    fn open(table: &mut ConnectionTable, isn: u32) -> (u16, u32) {
        let syn = Segment::header_only(isn, 0, 0, flags::SYN);
        let synack = table.handle_segment(syn, addr(), Instant::now()).unwrap();
        assert_eq!(synack.flags, flags::SYN_ACK);
        assert_eq!(synack.ack, seq::advance(isn, 1));
        (synack.conn_id, synack.ack)
    }

    fn data(seq_num: u32, id: u16, payload: &[u8]) -> Segment {
        Segment::data(seq_num, 0, id, flags::ACK, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_syn_creates_connection() {
        let (mut table, sinks) = table();
        let (id, _) = open(&mut table, 12345);
        assert_ne!(id, 0);
        assert_eq!(table.len(), 1);
        assert!(sinks.lock().unwrap().contains_key(&id));
    }

    #[test]
    fn test_duplicate_syns_get_distinct_connections() {
        let (mut table, sinks) = table();
        let (a, _) = open(&mut table, 100);
        let (b, _) = open(&mut table, 100);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(sinks.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_id_pool_is_bounded() {
        let (mut table, _sinks) = table();
        for _ in 0..MAX_CONN_IDS {
            open(&mut table, 5);
        }
        let extra = Segment::header_only(5, 0, 0, flags::SYN);
        assert!(table.handle_segment(extra, addr(), Instant::now()).is_none());
        assert_eq!(table.len(), MAX_CONN_IDS as usize);
    }

    #[test]
    fn test_in_order_data_written_and_acked() {
        let (mut table, sinks) = table();
        let (id, base) = open(&mut table, 777);
        let reply = table
            .handle_segment(data(base, id, b"hello"), addr(), Instant::now())
            .unwrap();
        assert_eq!(reply.flags, flags::ACK);
        assert_eq!(reply.ack, seq::advance(base, 5));
        assert_eq!(*sinks.lock().unwrap()[&id].lock().unwrap(), b"hello");
    }

    #[test]
    fn test_out_of_order_is_buffered_then_drained() {
        let (mut table, sinks) = table();
        let (id, s0) = open(&mut table, 0);
        let s1 = seq::advance(s0, 512);
        let s2 = seq::advance(s0, 1024);
        let now = Instant::now();

        // Arrival order: third, first, second.
        let reply = table
            .handle_segment(data(s2, id, &[3u8; 476]), addr(), now)
            .unwrap();
        assert_eq!(reply.ack, s0); // gap, ack does not advance
        assert!(sinks.lock().unwrap()[&id].lock().unwrap().is_empty());

        let reply = table
            .handle_segment(data(s0, id, &[1u8; 512]), addr(), now)
            .unwrap();
        assert_eq!(reply.ack, s1);

        let reply = table
            .handle_segment(data(s1, id, &[2u8; 512]), addr(), now)
            .unwrap();
        assert_eq!(reply.ack, s2);

        // The gap before the buffered segment has closed.
        let (seg, from) = table.pop_ready().expect("buffered segment ready");
        assert_eq!(seg.seq, s2);
        let reply = table.handle_segment(seg, from, now).unwrap();
        assert_eq!(reply.ack, seq::advance(s0, 1500));

        let mut expected = vec![1u8; 512];
        expected.extend_from_slice(&[2u8; 512]);
        expected.extend_from_slice(&[3u8; 476]);
        assert_eq!(*sinks.lock().unwrap()[&id].lock().unwrap(), expected);
        assert!(table.pop_ready().is_none());
    }

    #[test]
    fn test_duplicate_data_not_written_twice() {
        let (mut table, sinks) = table();
        let (id, base) = open(&mut table, 50);
        let now = Instant::now();
        table.handle_segment(data(base, id, b"abc"), addr(), now).unwrap();
        let reply = table.handle_segment(data(base, id, b"abc"), addr(), now).unwrap();
        // Duplicate is stale: re-acked but not re-written.
        assert_eq!(reply.ack, seq::advance(base, 3));
        assert_eq!(*sinks.lock().unwrap()[&id].lock().unwrap(), b"abc");
    }

    #[test]
    fn test_stale_buffered_entries_evicted() {
        let (mut table, sinks) = table();
        let (id, base) = open(&mut table, 0);
        let now = Instant::now();

        // A stray segment framed from an older cursor position lands ahead
        // of expectation and is buffered.
        table
            .handle_segment(data(seq::advance(base, 300), id, &[9u8; 212]), addr(), now)
            .unwrap();
        // The live stream then advances straight past the buffered entry.
        table.handle_segment(data(base, id, &[1u8; 512]), addr(), now).unwrap();

        // The entry is now behind expectation: evicted, never delivered.
        assert!(table.pop_ready().is_none());
        assert_eq!(*sinks.lock().unwrap()[&id].lock().unwrap(), vec![1u8; 512]);
    }

    #[test]
    fn test_invalid_flags_dropped_without_state_change() {
        let (mut table, sinks) = table();
        let (id, base) = open(&mut table, 10);
        let bogus = Segment::header_only(base, 0, id, 3); // FIN+SYN
        assert!(table.handle_segment(bogus, addr(), Instant::now()).is_none());
        assert_eq!(table.len(), 1);
        assert!(sinks.lock().unwrap()[&id].lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_connection_dropped() {
        let (mut table, _sinks) = table();
        open(&mut table, 10);
        let stray = data(0, 42, b"data");
        assert!(table.handle_segment(stray, addr(), Instant::now()).is_none());
    }

    #[test]
    fn test_fin_teardown_and_closing_ack() {
        let (mut table, _sinks) = table();
        let (id, base) = open(&mut table, 300);
        let now = Instant::now();
        table.handle_segment(data(base, id, b"xy"), addr(), now).unwrap();

        let fin_seq = seq::advance(base, 2);
        let finack = table
            .handle_segment(Segment::header_only(fin_seq, 0, id, flags::FIN), addr(), now)
            .unwrap();
        assert_eq!(finack.flags, flags::FIN_ACK);
        assert_eq!(finack.ack, seq::advance(fin_seq, 1));

        // The closing ACK removes the record with no reply.
        let closing =
            Segment::header_only(seq::advance(fin_seq, 1), seq::advance(finack.seq, 1), id, flags::ACK);
        assert!(table.handle_segment(closing, addr(), now).is_none());
        assert_eq!(table.len(), 0);

        // Anything further for that id is an unknown connection.
        assert!(table.handle_segment(data(0, id, b"late"), addr(), now).is_none());
    }

    #[test]
    fn test_idle_connections_reaped_with_error_marker() {
        let (mut table, sinks) = table();
        let (id, _) = open(&mut table, 0);
        let later = Instant::now() + IDLE_REAP + Duration::from_secs(1);
        table.sweep_idle(later);
        assert_eq!(table.len(), 0);
        assert_eq!(*sinks.lock().unwrap()[&id].lock().unwrap(), ERROR_MARKER);
    }

    #[tokio::test]
    async fn test_end_to_end_transfer() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (factory, sinks) = memory_sinks();
        let service = tokio::spawn(Receiver::new(server, factory).run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();

        let payload: Vec<u8> = (0..1500u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut sender = Sender::handshake(client).await.unwrap();
        sender.transfer(&mut Cursor::new(payload.clone())).await.unwrap();
        sender.shutdown().await.unwrap();
        service.abort();

        let sinks = sinks.lock().unwrap();
        assert_eq!(sinks.len(), 1);
        let received = sinks.values().next().unwrap().lock().unwrap();
        assert_eq!(*received, payload);
    }
}
