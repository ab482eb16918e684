use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::buffer::properties::BufferProperties;
use crate::buffer::shared::{CursorId, ReadNext, SharedAudioBuffer};
use crate::models::audio_format::AudioFormat;
use crate::models::error::FanOutError;

/// Identity of a client reader, unique for the life of the process.
pub type ClientId = u64;

/// Receives the disconnect of a client reader.
pub(crate) trait ClientSite: Send + Sync {
    fn on_client_disconnect(&self, client_id: ClientId);
}

/// One consumer's view of the shared capture stream.
///
/// Created connected by `FanOutAdapter::create_reader`, positioned at the
/// buffer tail. Reads advance a private cursor, so readers never affect each
/// other. Closing (explicitly or on drop) disconnects from the adapter exactly
/// once; the last reader to close stops the capture.
///
/// All methods take `&self`, so a reader can be shared between a thread that
/// reads and one that closes it.
pub struct ClientReader {
    client_id: ClientId,
    format: Arc<AudioFormat>,
    buffer: Arc<SharedAudioBuffer>,
    properties: Arc<BufferProperties>,
    cursor: CursorId,
    site: Weak<dyn ClientSite>,
    closed: AtomicBool,
}

impl ClientReader {
    pub(crate) fn new(
        client_id: ClientId,
        format: Arc<AudioFormat>,
        buffer: Arc<SharedAudioBuffer>,
        properties: Arc<BufferProperties>,
        cursor: CursorId,
        site: Weak<dyn ClientSite>,
    ) -> Self {
        Self {
            client_id,
            format,
            buffer,
            properties,
            cursor,
            site,
            closed: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// The format instance shared with the adapter and other readers.
    pub fn shared_format(&self) -> Arc<AudioFormat> {
        Arc::clone(&self.format)
    }

    /// Read the next captured bytes into `buf`, waiting for data if needed.
    ///
    /// Returns `Ok(0)` at end of stream, or when the reader is closed while
    /// waiting. A chunk larger than `buf` is returned over several reads.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, FanOutError> {
        if self.is_closed() {
            return Err(FanOutError::ReaderClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(copy_into(self.buffer.wait_next(self.cursor, buf.len()), buf).unwrap_or(0))
    }

    /// Like [`ClientReader::read`] but returns `Ok(None)` instead of waiting.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, FanOutError> {
        if self.is_closed() {
            return Err(FanOutError::ReaderClosed);
        }
        if buf.is_empty() {
            return Ok(Some(0));
        }
        Ok(copy_into(self.buffer.read_next(self.cursor, buf.len()), buf))
    }

    /// Read up to `max_bytes` into a new vector. Empty at end of stream.
    pub fn read_bytes(&self, max_bytes: usize) -> Result<Vec<u8>, FanOutError> {
        let mut buf = vec![0u8; max_bytes];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Value of a buffer property in effect at this reader's position.
    pub fn property(&self, name: &str) -> Option<String> {
        let position = self.buffer.cursor_position(self.cursor)?;
        self.properties.value_at(name, position)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the cursor and disconnect from the adapter. Idempotent; wakes
    /// a read blocked on another thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.buffer.unregister_cursor(self.cursor);
        match self.site.upgrade() {
            Some(site) => site.on_client_disconnect(self.client_id),
            None => log::warn!("Client {} closed after its adapter was torn down", self.client_id),
        }
    }
}

/// Copy a read result into `buf`. `None` when the read would block.
fn copy_into(next: ReadNext, buf: &mut [u8]) -> Option<usize> {
    match next {
        ReadNext::Data(slice) => {
            let n = slice.len();
            buf[..n].copy_from_slice(slice.bytes());
            Some(n)
        }
        ReadNext::EndOfStream | ReadNext::Detached => Some(0),
        ReadNext::WouldBlock => None,
    }
}

impl io::Read for ClientReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ClientReader::read(self, buf).map_err(io::Error::other)
    }
}

impl Drop for ClientReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ClientReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientReader")
            .field("client_id", &self.client_id)
            .field("cursor", &self.cursor)
            .field("closed", &self.is_closed())
            .finish()
    }
}
