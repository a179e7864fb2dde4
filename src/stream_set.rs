// The registry of all non-idle streams on a connection together with the
// per-partition bookkeeping and the DATA send scheduler.
//
// Streams are partitioned by who initiated them. Clients own the odd id
// space and servers the even one. Within a partition, ids only ever grow by
// two, which is what makes the implicit idle/closed classification work: an
// id at or above next_available_stream_id was never used, an id below
// lowest_stream_id was used and fully discarded, and everything in between
// is either materialized here or implicitly closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use bytes::{Buf, BytesMut};
use tokio::sync::mpsc;

use crate::frame_utils;
use crate::headers::Headers;
use crate::hpack::HeaderEncoder;
use crate::proto::ErrorCode;
use crate::response::StreamResult;
use crate::stream::StreamEvent;
use crate::types::*;

/// Outbound data queued on an active stream.
#[derive(Debug)]
pub enum QueuedData {
    /// No body bytes have been provided yet.
    None,

    /// Bytes waiting for flow control quota.
    Buffered(BytesMut),

    /// The body (and trailers, if any) have been fully flushed to the wire.
    Done,
}

/// A stream that is currently open in some form (this includes the reserved
/// states produced by PUSH_PROMISE).
pub struct ActiveStream {
    pub id: StreamId,

    /// Channel into the task driving this stream's state machine.
    pub events: mpsc::UnboundedSender<StreamEvent>,

    /// Where to announce the end of this stream.
    pub notifier: Option<Notifier>,

    /// Number of bytes the remote endpoint is willing to accept from us.
    pub send_window: WindowSize,

    /// Number of bytes we are willing to accept from the remote endpoint.
    pub recv_window: WindowSize,

    pub queued: QueuedData,

    /// True once the embedder marked the outbound body as complete. The
    /// scheduler owns turning this into an END_STREAM on the wire.
    pub body_complete: bool,

    /// Trailers to emit once the queued body has drained.
    pub trailers: Option<Headers>,

    /// Set once our HEADERS frame for this stream went out. DATA is never
    /// scheduled before it.
    pub headers_sent: bool,
}

impl ActiveStream {
    pub fn new(
        id: StreamId,
        events: mpsc::UnboundedSender<StreamEvent>,
        notifier: Option<Notifier>,
        send_window: WindowSize,
        recv_window: WindowSize,
    ) -> Self {
        Self {
            id,
            events,
            notifier,
            send_window,
            recv_window,
            queued: QueuedData::None,
            body_complete: false,
            trailers: None,
            headers_sent: false,
        }
    }

    /// Appends body bytes to the outbound queue.
    pub fn queue_data(&mut self, data: &[u8]) {
        match &mut self.queued {
            QueuedData::Buffered(buffer) => buffer.extend_from_slice(data),
            QueuedData::None => {
                self.queued = QueuedData::Buffered(BytesMut::from(data));
            }
            QueuedData::Done => {}
        }
    }

    /// Marks the body as complete. Makes sure an empty buffer exists so the
    /// scheduler has something to terminate.
    pub fn complete_body(&mut self) {
        self.body_complete = true;
        if matches!(self.queued, QueuedData::None) {
            self.queued = QueuedData::Buffered(BytesMut::new());
        }
    }
}

/// A stream that reached its terminal state. The record sticks around until
/// the embedder consumes the stored result or the garbage collector walks
/// past it.
pub struct ClosedStream {
    pub id: StreamId,
    pub notifier: Option<Notifier>,

    /// Set only when a client side stream recorded a completed exchange.
    pub response: Option<StreamResult>,

    /// True once nothing references this record anymore, allowing
    /// lowest_stream_id to advance over it.
    pub garbage: bool,
}

pub enum StreamEntry {
    Active(ActiveStream),
    Closed(ClosedStream),
}

/// Read-only view of one stream id as defined by the registry.
pub enum StreamRef<'a> {
    /// The id was never used (and a peer may still open it).
    Idle,

    Active(&'a ActiveStream),

    /// Closed with the materialized record, or None when implicitly closed.
    Closed(Option<&'a ClosedStream>),
}

/// Borrow-free classification of a stream id. Same answers as get(), for
/// callers that want to mutate the entry afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Idle,
    Active,
    Closed,
}

/// Bookkeeping for one half of the stream id space.
pub struct Partition {
    /// Cap on concurrently active streams, from MAX_CONCURRENT_STREAMS.
    /// None means unlimited.
    pub max_active: Option<u32>,

    /// Number of materialized active records with this parity.
    pub active_count: usize,

    /// Ids below this are closed and fully discarded.
    lowest_stream_id: AtomicU32,

    /// Ids at or above this have never been used.
    next_available_stream_id: AtomicU32,
}

impl Partition {
    fn new(first_id: StreamId) -> Self {
        Self {
            max_active: None,
            active_count: 0,
            lowest_stream_id: AtomicU32::new(first_id),
            next_available_stream_id: AtomicU32::new(first_id),
        }
    }

    pub fn lowest_stream_id(&self) -> StreamId {
        self.lowest_stream_id.load(Ordering::Acquire)
    }

    pub fn next_available_stream_id(&self) -> StreamId {
        self.next_available_stream_id.load(Ordering::Acquire)
    }

    fn at_capacity(&self) -> bool {
        match self.max_active {
            Some(max) => self.active_count as u32 >= max,
            None => false,
        }
    }
}

/// Which streams a scheduler pass should consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendScope {
    All,
    Stream(StreamId),
}

pub struct StreamSet {
    is_server: bool,
    streams: HashMap<StreamId, StreamEntry>,
    mine: Partition,
    theirs: Partition,
}

impl StreamSet {
    pub fn new(is_server: bool) -> Self {
        let (first_mine, first_theirs) = if is_server { (2, 1) } else { (1, 2) };

        Self {
            is_server,
            streams: HashMap::new(),
            mine: Partition::new(first_mine),
            theirs: Partition::new(first_theirs),
        }
    }

    /// Clients use odd ids and servers even ids.
    pub fn is_local_stream_id(&self, id: StreamId) -> bool {
        self.is_server == (id % 2 == 0)
    }

    pub fn mine(&self) -> &Partition {
        &self.mine
    }

    pub fn theirs(&self) -> &Partition {
        &self.theirs
    }

    fn partition(&self, id: StreamId) -> &Partition {
        if self.is_local_stream_id(id) {
            &self.mine
        } else {
            &self.theirs
        }
    }

    fn partition_mut(&mut self, id: StreamId) -> &mut Partition {
        if self.is_local_stream_id(id) {
            &mut self.mine
        } else {
            &mut self.theirs
        }
    }

    /// Highest peer initiated stream id that was ever opened. This is what
    /// goes into the last_stream_id field of a GOAWAY frame.
    pub fn highest_peer_stream_id(&self) -> StreamId {
        let next = self.theirs.next_available_stream_id();
        next.saturating_sub(2)
    }

    /// Creates a new active stream.
    ///
    /// With id = None a fresh locally initiated id is allocated. With a
    /// concrete id the stream must currently be idle (the caller validates
    /// this for peer initiated streams) and the partition's
    /// next_available_stream_id jumps past it, implicitly closing any
    /// skipped ids.
    ///
    /// Fails with REFUSED_STREAM when the partition is at its
    /// MAX_CONCURRENT_STREAMS cap.
    pub fn new_stream<F>(&mut self, id: Option<StreamId>, build: F) -> Result<StreamId>
    where
        F: FnOnce(StreamId) -> ActiveStream,
    {
        let id = match id {
            None => {
                if self.mine.at_capacity() {
                    return Err(refused_stream().into());
                }
                self.mine
                    .next_available_stream_id
                    .fetch_add(2, Ordering::AcqRel)
            }
            Some(id) => {
                let partition = self.partition_mut(id);
                if partition.at_capacity() {
                    return Err(refused_stream().into());
                }

                let next = partition.next_available_stream_id.load(Ordering::Acquire);
                if id < next {
                    return Err(ProtocolError {
                        code: ErrorCode::PROTOCOL_ERROR,
                        message: "Stream id was already used",
                        local: true,
                    }
                    .into());
                }

                partition
                    .next_available_stream_id
                    .store(id + 2, Ordering::Release);
                id
            }
        };

        self.partition_mut(id).active_count += 1;
        self.streams.insert(id, StreamEntry::Active(build(id)));
        Ok(id)
    }

    /// Looks up one stream id, synthesizing the idle and implicitly closed
    /// answers for ids that have no materialized record.
    pub fn get(&self, id: StreamId) -> StreamRef<'_> {
        match self.streams.get(&id) {
            Some(StreamEntry::Active(stream)) => StreamRef::Active(stream),
            Some(StreamEntry::Closed(closed)) => StreamRef::Closed(Some(closed)),
            None => {
                if id >= self.partition(id).next_available_stream_id() {
                    StreamRef::Idle
                } else {
                    StreamRef::Closed(None)
                }
            }
        }
    }

    pub fn classify(&self, id: StreamId) -> StreamKind {
        match self.get(id) {
            StreamRef::Idle => StreamKind::Idle,
            StreamRef::Active(_) => StreamKind::Active,
            StreamRef::Closed(_) => StreamKind::Closed,
        }
    }

    pub fn has_active_streams(&self) -> bool {
        self.streams
            .values()
            .any(|entry| matches!(entry, StreamEntry::Active(_)))
    }

    pub fn get_active_mut(&mut self, id: StreamId) -> Option<&mut ActiveStream> {
        match self.streams.get_mut(&id) {
            Some(StreamEntry::Active(stream)) => Some(stream),
            _ => None,
        }
    }

    pub fn get_closed_mut(&mut self, id: StreamId) -> Option<&mut ClosedStream> {
        match self.streams.get_mut(&id) {
            Some(StreamEntry::Closed(closed)) => Some(closed),
            _ => None,
        }
    }

    /// Applies a mutation to an active stream. Returns false when the stream
    /// is not active anymore.
    pub fn update<F>(&mut self, id: StreamId, f: F) -> bool
    where
        F: FnOnce(&mut ActiveStream),
    {
        match self.get_active_mut(id) {
            Some(stream) => {
                f(stream);
                true
            }
            None => false,
        }
    }

    /// Replaces a stream with its closed record and opportunistically
    /// advances the partition's lowest_stream_id over leading garbage.
    ///
    /// Returns the notifier of the stream if it had one.
    pub fn close(
        &mut self,
        id: StreamId,
        response: Option<StreamResult>,
        garbage: bool,
    ) -> Option<Notifier> {
        let notifier = match self.streams.remove(&id) {
            Some(StreamEntry::Active(stream)) => {
                self.partition_mut(id).active_count -= 1;
                stream.notifier
            }
            Some(StreamEntry::Closed(closed)) => closed.notifier,
            None => None,
        };

        self.streams.insert(
            id,
            StreamEntry::Closed(ClosedStream {
                id,
                notifier: notifier.clone(),
                response,
                garbage,
            }),
        );

        self.collect_garbage(id);
        notifier
    }

    /// Marks a closed stream's record as consumable and retries the garbage
    /// scan. Used once the embedder fetched the stored response.
    pub fn discard_closed(&mut self, id: StreamId) {
        if let Some(closed) = self.get_closed_mut(id) {
            closed.garbage = true;
            closed.response = None;
        }
        self.collect_garbage(id);
    }

    /// Walks the partition of the given id from lowest_stream_id upward,
    /// deleting garbage records until hitting one that must be retained.
    fn collect_garbage(&mut self, id: StreamId) {
        let next = self.partition(id).next_available_stream_id();
        let mut lowest = self.partition(id).lowest_stream_id();

        while lowest < next {
            let collectable = match self.streams.get(&lowest) {
                Some(StreamEntry::Closed(closed)) if closed.garbage => true,
                Some(_) => break,
                // Implicitly closed ids hold no data.
                None => false,
            };

            if collectable {
                self.streams.remove(&lowest);
            }
            lowest += 2;
        }

        self.partition(id)
            .lowest_stream_id
            .store(lowest, Ordering::Release);
    }

    /// Drops every materialized record, announcing the end to the watchers
    /// of streams that were still active. Handler tasks observe their event
    /// channels closing and wind down on their own.
    pub fn clear(&mut self) {
        for (id, entry) in self.streams.drain() {
            if let StreamEntry::Active(stream) = entry {
                if let Some(notifier) = stream.notifier {
                    let _ = notifier.send(Notice::EndStream { stream_id: id });
                }
            }
        }

        self.mine.active_count = 0;
        self.theirs.active_count = 0;
    }

    /// Applies a delta to the send window of every active stream. Triggered
    /// by a change of the peer's INITIAL_WINDOW_SIZE setting.
    pub fn update_all_send_windows(&mut self, delta: WindowSize) -> Result<()> {
        for entry in self.streams.values_mut() {
            if let StreamEntry::Active(stream) = entry {
                stream.send_window =
                    stream
                        .send_window
                        .checked_add(delta)
                        .ok_or(ProtocolError {
                            code: ErrorCode::FLOW_CONTROL_ERROR,
                            message: "INITIAL_WINDOW_SIZE change overflowed a stream window",
                            local: true,
                        })?;
            }
        }
        Ok(())
    }

    /// Applies a delta to the receive window of every active stream.
    /// Triggered when the peer acknowledges a change to our
    /// INITIAL_WINDOW_SIZE setting.
    pub fn update_all_recv_windows(&mut self, delta: WindowSize) -> Result<()> {
        for entry in self.streams.values_mut() {
            if let StreamEntry::Active(stream) = entry {
                stream.recv_window =
                    stream
                        .recv_window
                        .checked_add(delta)
                        .ok_or(ProtocolError {
                            code: ErrorCode::FLOW_CONTROL_ERROR,
                            message: "INITIAL_WINDOW_SIZE change overflowed a stream window",
                            local: true,
                        })?;
            }
        }
        Ok(())
    }

    /// Applies our acknowledged MAX_CONCURRENT_STREAMS to the peer's
    /// partition.
    pub fn update_my_max_active(&mut self, max: Option<u32>) {
        self.theirs.max_active = max;
    }

    /// Applies the peer's MAX_CONCURRENT_STREAMS to our partition.
    pub fn update_their_max_active(&mut self, max: Option<u32>) {
        self.mine.max_active = max;
    }

    /// Ids of all currently active streams, in id order.
    pub fn active_stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, entry)| matches!(entry, StreamEntry::Active(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Emits as many DATA frames as the connection and stream flow control
    /// windows allow, appending them to out.
    ///
    /// A full sweep walks peer initiated streams before local ones, both in
    /// id order, and gives up once the connection window is exhausted. The
    /// encoder is needed for trailer blocks that become due when a body
    /// drains.
    pub fn send_what_we_can(
        &mut self,
        scope: SendScope,
        connection_send_window: &AtomicI32,
        max_frame_size: usize,
        encoder: &mut HeaderEncoder,
        out: &mut Vec<u8>,
    ) {
        match scope {
            SendScope::Stream(id) => {
                if let Some(StreamEntry::Active(stream)) = self.streams.get_mut(&id) {
                    Self::send_stream_data(
                        stream,
                        connection_send_window,
                        max_frame_size,
                        encoder,
                        out,
                    );
                }
            }
            SendScope::All => {
                let mut ids = self.active_stream_ids();
                // Peer initiated streams go first.
                ids.sort_by_key(|id| (self.is_local_stream_id(*id), *id));

                for id in ids {
                    if connection_send_window.load(Ordering::Acquire) <= 0 {
                        break;
                    }
                    if let Some(StreamEntry::Active(stream)) = self.streams.get_mut(&id) {
                        Self::send_stream_data(
                            stream,
                            connection_send_window,
                            max_frame_size,
                            encoder,
                            out,
                        );
                    }
                }
            }
        }
    }

    fn send_stream_data(
        stream: &mut ActiveStream,
        connection_send_window: &AtomicI32,
        max_frame_size: usize,
        encoder: &mut HeaderEncoder,
        out: &mut Vec<u8>,
    ) {
        if !stream.headers_sent {
            return;
        }

        let buffered = match &stream.queued {
            QueuedData::Buffered(buffer) => buffer.len(),
            _ => return,
        };

        let connection_window = connection_send_window.load(Ordering::Acquire);
        let allowed = std::cmp::max(0, std::cmp::min(connection_window, stream.send_window)) as usize;
        let n = std::cmp::min(allowed, buffered);

        if buffered > 0 && n == 0 {
            // Flow control quota exhausted.
            return;
        }
        if buffered == 0 && !stream.body_complete {
            // Nothing to send yet.
            return;
        }

        let end_after_data = stream.body_complete && n == buffered && stream.trailers.is_none();

        if n > 0 {
            let buffer = match &mut stream.queued {
                QueuedData::Buffered(buffer) => buffer,
                _ => unreachable!(),
            };

            let mut sent = 0;
            while sent < n {
                let chunk = std::cmp::min(max_frame_size, n - sent);
                let last = sent + chunk == n;
                out.extend_from_slice(&frame_utils::new_data_frame(
                    stream.id,
                    &buffer[sent..sent + chunk],
                    end_after_data && last,
                ));
                sent += chunk;
            }

            buffer.advance(n);
            stream.send_window -= n as WindowSize;
            connection_send_window.fetch_sub(n as WindowSize, Ordering::AcqRel);

            tracing::trace!(
                stream_id = stream.id,
                sent = n,
                stream_window = stream.send_window,
                "flushed stream data"
            );
        } else if stream.trailers.is_none() {
            // Empty body with a pending end of stream. A zero length DATA
            // frame consumes no flow control quota.
            out.extend_from_slice(&frame_utils::new_data_frame(stream.id, &[], true));
        }

        let drained = match &stream.queued {
            QueuedData::Buffered(buffer) => buffer.is_empty(),
            _ => true,
        };

        if drained && stream.body_complete {
            if let Some(trailers) = stream.trailers.take() {
                let block = encoder.encode_block(&trailers);
                out.extend_from_slice(&frame_utils::new_headers_frames(
                    stream.id,
                    &block,
                    true,
                    max_frame_size,
                ));
            }

            stream.queued = QueuedData::Done;
            let _ = stream.events.send(StreamEvent::LocalEndSent);
        }
    }
}

/// Adds a delta to an atomic flow control window, failing on overflow of the
/// legal window range.
pub fn try_add_window(window: &AtomicI32, delta: WindowSize) -> std::result::Result<WindowSize, ProtocolError> {
    let mut current = window.load(Ordering::Acquire);
    loop {
        let next = current.checked_add(delta).ok_or(ProtocolError {
            code: ErrorCode::FLOW_CONTROL_ERROR,
            message: "Flow control window overflow",
            local: true,
        })?;

        match window.compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(next),
            Err(actual) => current = actual,
        }
    }
}

fn refused_stream() -> ProtocolError {
    ProtocolError {
        code: ErrorCode::REFUSED_STREAM,
        message: "Too many concurrently active streams",
        local: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_WINDOW: WindowSize = 65535;

    fn new_active(id: StreamId) -> (ActiveStream, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            ActiveStream::new(id, events, None, DEFAULT_WINDOW, DEFAULT_WINDOW),
            receiver,
        )
    }

    fn open_stream(set: &mut StreamSet, id: Option<StreamId>) -> StreamId {
        set.new_stream(id, |id| new_active(id).0).unwrap()
    }

    #[test]
    fn parity_of_allocated_ids() {
        let mut client = StreamSet::new(false);
        assert_eq!(open_stream(&mut client, None), 1);
        assert_eq!(open_stream(&mut client, None), 3);

        let mut server = StreamSet::new(true);
        assert_eq!(open_stream(&mut server, None), 2);
        assert_eq!(open_stream(&mut server, None), 4);
    }

    #[test]
    fn classification_follows_partition_counters() {
        let mut set = StreamSet::new(false);
        let id = open_stream(&mut set, None);

        assert!(matches!(set.get(id), StreamRef::Active(_)));
        assert!(matches!(set.get(3), StreamRef::Idle));
        assert!(matches!(set.get(5), StreamRef::Idle));

        set.close(id, None, true);
        // The garbage record was collected, so stream 1 is implicitly closed.
        assert!(matches!(set.get(1), StreamRef::Closed(None)));
        assert_eq!(set.mine().lowest_stream_id(), 3);
        assert!(matches!(set.get(3), StreamRef::Idle));
    }

    #[test]
    fn active_count_tracks_materialized_records() {
        let mut set = StreamSet::new(false);
        let a = open_stream(&mut set, None);
        let b = open_stream(&mut set, None);
        assert_eq!(set.mine().active_count, 2);

        set.close(a, None, true);
        assert_eq!(set.mine().active_count, 1);
        set.close(b, None, true);
        assert_eq!(set.mine().active_count, 0);
    }

    #[test]
    fn max_active_cap_refuses_new_streams() {
        let mut set = StreamSet::new(false);
        set.update_their_max_active(Some(2));

        assert_eq!(open_stream(&mut set, None), 1);
        assert_eq!(open_stream(&mut set, None), 3);

        let err = set.new_stream(None, |id| new_active(id).0).unwrap_err();
        match err {
            Error::Protocol(e) => assert_eq!(e.code, ErrorCode::REFUSED_STREAM),
            other => panic!("unexpected error: {:?}", other),
        }

        // The failed attempt must not burn a stream id.
        assert_eq!(set.mine().next_available_stream_id(), 5);
    }

    #[test]
    fn peer_stream_with_explicit_id_skips_lower_ids() {
        let mut set = StreamSet::new(true);
        let id = set.new_stream(Some(5), |id| new_active(id).0).unwrap();
        assert_eq!(id, 5);

        // 1 and 3 were implicitly closed by the use of 5.
        assert!(matches!(set.get(1), StreamRef::Closed(None)));
        assert!(matches!(set.get(3), StreamRef::Closed(None)));
        assert!(matches!(set.get(7), StreamRef::Idle));

        // Reusing a lower id is rejected.
        assert!(set.new_stream(Some(3), |id| new_active(id).0).is_err());
    }

    #[test]
    fn garbage_collection_stops_at_retained_records() {
        let mut set = StreamSet::new(false);
        let a = open_stream(&mut set, None); // 1
        let b = open_stream(&mut set, None); // 3
        let c = open_stream(&mut set, None); // 5

        // Close 3 with a retained response first: lowest can't move past 1.
        set.close(
            b,
            Some(StreamResult {
                headers: vec![],
                body: bytes::Bytes::new(),
                trailers: None,
            }),
            false,
        );
        assert_eq!(set.mine().lowest_stream_id(), 1);

        set.close(a, None, true);
        // 1 collected, but 3 is retained.
        assert_eq!(set.mine().lowest_stream_id(), 3);

        set.discard_closed(b);
        assert_eq!(set.mine().lowest_stream_id(), 5);

        set.close(c, None, true);
        assert_eq!(set.mine().lowest_stream_id(), 7);
        assert_eq!(set.mine().next_available_stream_id(), 7);
    }

    fn run_scheduler(
        set: &mut StreamSet,
        window: &AtomicI32,
        out: &mut Vec<u8>,
        scope: SendScope,
    ) {
        let mut encoder = HeaderEncoder::new();
        set.send_what_we_can(scope, window, 16384, &mut encoder, out);
    }

    fn parse_frame_headers(buf: &[u8]) -> Vec<crate::proto::FrameHeader> {
        let mut frames = vec![];
        let mut offset = 0;
        while offset < buf.len() {
            let mut raw = [0u8; 9];
            raw.copy_from_slice(&buf[offset..offset + 9]);
            let header = crate::proto::FrameHeader::parse_complete(&raw);
            offset += 9 + header.length as usize;
            frames.push(header);
        }
        frames
    }

    #[test]
    fn scheduler_respects_both_windows_and_frame_size() {
        let mut set = StreamSet::new(false);
        let (mut stream, mut events) = new_active(1);
        stream.headers_sent = true;
        stream.queue_data(&vec![0xab; 100_000]);
        stream.complete_body();
        set.new_stream(Some(1), move |_| stream).unwrap();

        let connection_window = AtomicI32::new(DEFAULT_WINDOW);
        let mut out = vec![];
        run_scheduler(&mut set, &connection_window, &mut out, SendScope::All);

        // 65535 bytes fit in the windows, split at the 16384 frame cap.
        let frames = parse_frame_headers(&out);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames.iter().map(|f| f.length).sum::<u32>(), 65535);
        assert!(frames
            .iter()
            .all(|f| crate::proto::DataFrameFlags::parse(f.flags).end_stream == false));

        assert_eq!(connection_window.load(Ordering::Acquire), 0);
        let stream = set.get_active_mut(1).unwrap();
        assert_eq!(stream.send_window, 0);
        assert!(matches!(events.try_recv(), Err(_)));

        // Replenish both windows with exactly the remainder.
        connection_window.store(34465, Ordering::Release);
        set.get_active_mut(1).unwrap().send_window = 34465;

        let mut out = vec![];
        run_scheduler(&mut set, &connection_window, &mut out, SendScope::Stream(1));

        let frames = parse_frame_headers(&out);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.iter().map(|f| f.length).sum::<u32>(), 34465);
        assert!(crate::proto::DataFrameFlags::parse(frames[2].flags).end_stream);

        assert!(matches!(
            events.try_recv().unwrap(),
            StreamEvent::LocalEndSent
        ));
        assert!(matches!(
            set.get_active_mut(1).unwrap().queued,
            QueuedData::Done
        ));
    }

    #[test]
    fn scheduler_defers_trailers_until_body_drains() {
        let mut set = StreamSet::new(false);
        let (mut stream, _events) = new_active(1);
        stream.headers_sent = true;
        stream.queue_data(b"payload");
        stream.trailers = Some(vec![crate::headers::Header::new(
            &b"grpc-status"[..],
            &b"0"[..],
        )]);
        stream.complete_body();
        set.new_stream(Some(1), move |_| stream).unwrap();

        let connection_window = AtomicI32::new(DEFAULT_WINDOW);
        let mut out = vec![];
        run_scheduler(&mut set, &connection_window, &mut out, SendScope::Stream(1));

        let frames = parse_frame_headers(&out);
        assert_eq!(frames.len(), 2);

        // The DATA frame must not end the stream since trailers follow.
        assert_eq!(frames[0].typ, crate::proto::FrameType::DATA);
        assert!(!crate::proto::DataFrameFlags::parse(frames[0].flags).end_stream);

        assert_eq!(frames[1].typ, crate::proto::FrameType::HEADERS);
        let flags = crate::proto::HeadersFrameFlags::parse(frames[1].flags);
        assert!(flags.end_stream);
        assert!(flags.end_headers);
    }

    #[test]
    fn scheduler_skips_streams_without_sent_headers() {
        let mut set = StreamSet::new(false);
        let (mut stream, _events) = new_active(1);
        stream.queue_data(b"early");
        stream.complete_body();
        set.new_stream(Some(1), move |_| stream).unwrap();

        let connection_window = AtomicI32::new(DEFAULT_WINDOW);
        let mut out = vec![];
        run_scheduler(&mut set, &connection_window, &mut out, SendScope::All);
        assert!(out.is_empty());
    }

    #[test]
    fn sweep_serves_peer_streams_before_local_ones() {
        let mut set = StreamSet::new(false);

        let (mut local, _e1) = new_active(1);
        local.headers_sent = true;
        local.queue_data(&[1; 10]);
        set.new_stream(Some(1), move |_| local).unwrap();

        let (mut remote, _e2) = new_active(2);
        remote.headers_sent = true;
        remote.queue_data(&[2; 10]);
        set.new_stream(Some(2), move |_| remote).unwrap();

        // Connection window only fits one stream's worth of data.
        let connection_window = AtomicI32::new(10);
        let mut out = vec![];
        run_scheduler(&mut set, &connection_window, &mut out, SendScope::All);

        let frames = parse_frame_headers(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, 2);
    }

    #[test]
    fn window_overflow_is_detected() {
        let window = AtomicI32::new(WindowSize::MAX - 10);
        let err = try_add_window(&window, 100).unwrap_err();
        assert_eq!(err.code, ErrorCode::FLOW_CONTROL_ERROR);

        assert_eq!(try_add_window(&window, 10).unwrap(), WindowSize::MAX);
    }

    #[test]
    fn initial_window_size_changes_apply_to_all_active_streams() {
        let mut set = StreamSet::new(false);
        let a = open_stream(&mut set, None);
        let b = open_stream(&mut set, None);

        set.update_all_send_windows(-1000).unwrap();
        assert_eq!(set.get_active_mut(a).unwrap().send_window, DEFAULT_WINDOW - 1000);
        assert_eq!(set.get_active_mut(b).unwrap().send_window, DEFAULT_WINDOW - 1000);

        set.update_all_recv_windows(500).unwrap();
        assert_eq!(set.get_active_mut(a).unwrap().recv_window, DEFAULT_WINDOW + 500);

        // Push a window near the top of the range and watch the overflow.
        set.get_active_mut(a).unwrap().send_window = WindowSize::MAX;
        assert!(set.update_all_send_windows(1).is_err());
    }
}
