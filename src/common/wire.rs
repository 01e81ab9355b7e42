use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::io;
use std::marker::PhantomData;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use futures::{Future, Sink};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json;
use tokio_core::reactor::Handle;
use tokio_io::codec::{Decoder, Encoder};

/// Frames larger than this are rejected as a protocol violation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// An outbound backlog beyond this limit means the peer stopped reading;
/// the connection is treated as failed.
pub const SEND_BACKLOG_LIMIT: usize = 4096;

const HEADER_SIZE: usize = 4;

/// Length-prefixed message framing: a 4-byte big-endian payload length
/// followed by one serialized message map.
pub struct MessageCodec<In, Out> {
    _marker: PhantomData<(In, Out)>,
}

impl<In, Out> MessageCodec<In, Out> {
    pub fn new() -> Self {
        MessageCodec {
            _marker: PhantomData,
        }
    }
}

impl<In: DeserializeOwned, Out> Decoder for MessageCodec<In, Out> {
    type Item = In;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<In>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let length = BigEndian::read_u32(&buf[..HEADER_SIZE]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds the limit", length),
            ));
        }
        if buf.len() < HEADER_SIZE + length {
            return Ok(None);
        }
        buf.split_to(HEADER_SIZE);
        let body = buf.split_to(length);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<In, Out: Serialize> Encoder for MessageCodec<In, Out> {
    type Item = Out;
    type Error = io::Error;

    fn encode(&mut self, message: Out, buf: &mut BytesMut) -> io::Result<()> {
        let body = serde_json::to_vec(&message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut header = [0u8; HEADER_SIZE];
        BigEndian::write_u32(&mut header, body.len() as u32);
        buf.reserve(HEADER_SIZE + body.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&body);
        Ok(())
    }
}

struct SendQueueInner<S: Sink> {
    sink: Option<S>,
    pending: VecDeque<S::SinkItem>,
    closed: bool,
}

/// Order-preserving outbound queue over a sink. One send is in flight at
/// a time, the rest wait in order. Pushing is non-blocking; exceeding the
/// backlog limit marks the connection as failed and drops the queue.
pub struct SendQueue<S: Sink> {
    inner: Rc<RefCell<SendQueueInner<S>>>,
}

impl<S: Sink> Clone for SendQueue<S> {
    fn clone(&self) -> Self {
        SendQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<S> SendQueue<S>
where
    S: Sink + 'static,
    S::SinkItem: 'static,
    S::SinkError: Debug,
{
    pub fn new(sink: S) -> Self {
        SendQueue {
            inner: Rc::new(RefCell::new(SendQueueInner {
                sink: Some(sink),
                pending: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// True once the underlying connection failed or was dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Whether both handles drive the same underlying queue.
    pub fn same(&self, other: &SendQueue<S>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn push(&self, handle: &Handle, item: S::SinkItem) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            if inner.pending.len() >= SEND_BACKLOG_LIMIT {
                warn!("Outbound backlog limit reached, dropping connection");
                inner.closed = true;
                inner.pending.clear();
                inner.sink = None;
                return;
            }
            inner.pending.push_back(item);
        }
        self.maybe_send(handle);
    }

    fn maybe_send(&self, handle: &Handle) {
        let (sink, item) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.sink.is_none() || inner.pending.is_empty() {
                return;
            }
            let sink = inner.sink.take().unwrap();
            let item = inner.pending.pop_front().unwrap();
            (sink, item)
        };
        let queue = self.clone();
        let next_handle = handle.clone();
        handle.spawn(sink.send(item).then(move |result| {
            match result {
                Ok(sink) => {
                    queue.inner.borrow_mut().sink = Some(sink);
                    queue.maybe_send(&next_handle);
                }
                Err(e) => {
                    debug!("Outbound send failed: {:?}", e);
                    let mut inner = queue.inner.borrow_mut();
                    inner.closed = true;
                    inner.pending.clear();
                }
            }
            Ok(())
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::collections::HashMap;

    #[test]
    fn roundtrip_one_frame() {
        let mut codec: MessageCodec<HashMap<String, u32>, HashMap<String, u32>> =
            MessageCodec::new();
        let mut message = HashMap::new();
        message.insert("answer".to_string(), 42);

        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec: MessageCodec<HashMap<String, u32>, HashMap<String, u32>> =
            MessageCodec::new();
        let mut message = HashMap::new();
        message.insert("x".to_string(), 1);

        let mut full = BytesMut::new();
        codec.encode(message.clone(), &mut full).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[3..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), message);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec: MessageCodec<HashMap<String, u32>, HashMap<String, u32>> =
            MessageCodec::new();
        let mut buf = BytesMut::new();
        let mut header = [0u8; 4];
        ::byteorder::BigEndian::write_u32(&mut header, (MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(&header);
        assert!(codec.decode(&mut buf).is_err());
    }
}
