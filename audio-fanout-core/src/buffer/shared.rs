use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::models::diagnostics::BufferStats;

/// Identity of a registered read cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(u64);

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor-{}", self.0)
    }
}

/// An appended run of captured audio. Immutable once appended.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub sequence: u64,
    pub data: Arc<[u8]>,
    pub captured_at: DateTime<Utc>,
}

/// The part of a chunk handed to one cursor by a single read.
#[derive(Debug, Clone)]
pub struct ChunkSlice {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    data: Arc<[u8]>,
    range: Range<usize>,
}

impl ChunkSlice {
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Whether this slice ends at the end of its chunk.
    pub fn completes_chunk(&self) -> bool {
        self.range.end == self.data.len()
    }
}

/// Result of reading at a cursor.
#[derive(Debug, Clone)]
pub enum ReadNext {
    Data(ChunkSlice),
    /// Nothing past the cursor yet; more may be appended.
    WouldBlock,
    /// The producer closed the buffer and the cursor has read everything.
    EndOfStream,
    /// The cursor is not (or no longer) registered.
    Detached,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    sequence: u64,
    offset: usize,
}

struct BufferState {
    chunks: VecDeque<AudioChunk>,
    next_sequence: u64,
    cursors: HashMap<CursorId, Cursor>,
    next_cursor_id: u64,
    retained_bytes: usize,
    bytes_appended: u64,
    closed: bool,
}

impl BufferState {
    fn low_water_mark(&self) -> u64 {
        self.cursors
            .values()
            .map(|cursor| cursor.sequence)
            .min()
            .unwrap_or(self.next_sequence)
    }

    /// Drop every chunk no registered cursor still needs.
    fn evict(&mut self) {
        let low_water_mark = self.low_water_mark();
        while let Some(front) = self.chunks.front() {
            if front.sequence >= low_water_mark {
                break;
            }
            self.retained_bytes -= front.data.len();
            self.chunks.pop_front();
        }
    }

    fn chunk(&self, sequence: u64) -> Option<&AudioChunk> {
        let first = self.chunks.front()?.sequence;
        if sequence < first {
            return None;
        }
        self.chunks.get((sequence - first) as usize)
    }

    /// Hand out up to `max_bytes` at `id` and advance it. `None` means the
    /// cursor has caught up with the tail.
    fn claim(&mut self, id: CursorId, max_bytes: usize) -> Result<Option<ChunkSlice>, ()> {
        let cursor = *self.cursors.get(&id).ok_or(())?;
        let Some(chunk) = self.chunk(cursor.sequence) else {
            return Ok(None);
        };

        let end = chunk.data.len().min(cursor.offset + max_bytes);
        let slice = ChunkSlice {
            sequence: chunk.sequence,
            captured_at: chunk.captured_at,
            data: Arc::clone(&chunk.data),
            range: cursor.offset..end,
        };

        let finished = slice.completes_chunk();
        if let Some(position) = self.cursors.get_mut(&id) {
            if finished {
                position.sequence += 1;
                position.offset = 0;
            } else {
                position.offset = end;
            }
        }
        if finished {
            self.evict();
        }
        Ok(Some(slice))
    }
}

/// Append-only, multi-reader buffer of captured audio.
///
/// Written by exactly one producer (the pump's sink), read by any number of
/// cursors that each advance at their own pace. Reads never consume data for
/// other cursors. Chunks are evicted once no registered cursor is at or
/// before them.
pub struct SharedAudioBuffer {
    state: Mutex<BufferState>,
    data_ready: Condvar,
}

impl SharedAudioBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState {
                chunks: VecDeque::new(),
                next_sequence: 0,
                cursors: HashMap::new(),
                next_cursor_id: 0,
                retained_bytes: 0,
                bytes_appended: 0,
                closed: false,
            }),
            data_ready: Condvar::new(),
        }
    }

    /// Append a chunk and return its sequence number.
    ///
    /// Empty runs are ignored and return `None`. Single producer only.
    pub fn append(&self, data: &[u8]) -> Option<u64> {
        if data.is_empty() {
            return None;
        }

        let sequence = {
            let mut state = self.state.lock();
            let sequence = state.next_sequence;
            state.chunks.push_back(AudioChunk {
                sequence,
                data: Arc::from(data),
                captured_at: Utc::now(),
            });
            state.next_sequence += 1;
            state.retained_bytes += data.len();
            state.bytes_appended += data.len() as u64;
            state.evict();
            sequence
        };

        self.data_ready.notify_all();
        Some(sequence)
    }

    /// Sequence number the next appended chunk will receive.
    pub fn tail(&self) -> u64 {
        self.state.lock().next_sequence
    }

    /// Oldest sequence any registered cursor still needs.
    pub fn low_water_mark(&self) -> u64 {
        self.state.lock().low_water_mark()
    }

    /// Register a cursor positioned at the current tail.
    pub fn register_cursor(&self) -> CursorId {
        let mut state = self.state.lock();
        let id = CursorId(state.next_cursor_id);
        state.next_cursor_id += 1;
        let sequence = state.next_sequence;
        state.cursors.insert(id, Cursor { sequence, offset: 0 });
        id
    }

    /// Forget a cursor, release the data only it was holding, and wake any
    /// read blocked on it.
    pub fn unregister_cursor(&self, id: CursorId) {
        {
            let mut state = self.state.lock();
            if state.cursors.remove(&id).is_none() {
                return;
            }
            state.evict();
        }
        self.data_ready.notify_all();
    }

    /// Next unread sequence number of a cursor.
    pub fn cursor_position(&self, id: CursorId) -> Option<u64> {
        self.state.lock().cursors.get(&id).map(|cursor| cursor.sequence)
    }

    /// Non-blocking read of up to `max_bytes` at the cursor.
    pub fn read_next(&self, id: CursorId, max_bytes: usize) -> ReadNext {
        let mut state = self.state.lock();
        match state.claim(id, max_bytes) {
            Err(()) => ReadNext::Detached,
            Ok(Some(slice)) => ReadNext::Data(slice),
            Ok(None) if state.closed => ReadNext::EndOfStream,
            Ok(None) => ReadNext::WouldBlock,
        }
    }

    /// Read up to `max_bytes` at the cursor, waiting until data is appended,
    /// the buffer is closed, or the cursor is unregistered. Never returns
    /// [`ReadNext::WouldBlock`].
    pub fn wait_next(&self, id: CursorId, max_bytes: usize) -> ReadNext {
        let mut state = self.state.lock();
        loop {
            match state.claim(id, max_bytes) {
                Err(()) => return ReadNext::Detached,
                Ok(Some(slice)) => return ReadNext::Data(slice),
                Ok(None) if state.closed => return ReadNext::EndOfStream,
                Ok(None) => self.data_ready.wait(&mut state),
            }
        }
    }

    /// Mark end-of-stream. Cursors drain what was appended, then see
    /// [`ReadNext::EndOfStream`].
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.data_ready.notify_all();
    }

    /// Clear the end-of-stream mark before capture resumes.
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            next_sequence: state.next_sequence,
            retained_chunks: state.chunks.len(),
            retained_bytes: state.retained_bytes,
            live_cursors: state.cursors.len(),
            bytes_appended: state.bytes_appended,
            closed: state.closed,
        }
    }
}

impl Default for SharedAudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}
