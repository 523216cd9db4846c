use std::io::{ErrorKind, Read};

use crate::codec::{Decoder, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally — callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    decoder: Decoder,
    pending: Vec<u8>,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            decoder: Decoder::with_max_payload(config.max_payload_size),
            pending: Vec::new(),
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if !self.pending.is_empty() {
                let (consumed, frame) = self.decoder.feed(&self.pending)?;
                self.pending.drain(..consumed);
                if let Some(frame) = frame {
                    return Ok(frame);
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.pending.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, FrameType, PayloadKind};

    fn request(module: &str, payload: &'static [u8]) -> Frame {
        Frame {
            frame_type: FrameType::MessageRequest,
            chain_key: "ck".to_string(),
            module: module.to_string(),
            method: "run".to_string(),
            sender: "CLIENT".to_string(),
            payload_kind: PayloadKind::Json,
            payload: Bytes::from_static(payload),
        }
    }

    fn wire_for(frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            encode_frame(frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_single_frame() {
        let frame = request("WORKER", b"{}");
        let mut reader = FrameReader::new(Cursor::new(wire_for(std::slice::from_ref(&frame))));

        assert_eq!(reader.read_frame().unwrap(), frame);
    }

    #[test]
    fn read_multiple_frames() {
        let frames = vec![
            request("A", b"1"),
            request("B", b"22"),
            request("C", b"333"),
        ];
        let mut reader = FrameReader::new(Cursor::new(wire_for(&frames)));

        for expected in &frames {
            assert_eq!(&reader.read_frame().unwrap(), expected);
        }
    }

    #[test]
    fn partial_read_handling() {
        let frame = request("SLOW", b"slow-payload");
        let byte_reader = ByteByByteReader {
            bytes: wire_for(std::slice::from_ref(&frame)),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        assert_eq!(reader.read_frame().unwrap(), frame);
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let frame = request("WORKER", b"full-payload");
        let mut wire = wire_for(std::slice::from_ref(&frame));
        wire.truncate(wire.len() - 4);

        let mut reader = FrameReader::new(Cursor::new(wire));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn desynchronized_stream_errors() {
        let mut reader = FrameReader::new(Cursor::new(b"garbage".to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Desynchronized { .. }));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let frame = request("WORKER", b"sixteen byte pay");
        let cfg = FrameConfig {
            max_payload_size: 8,
        };
        let mut reader =
            FrameReader::with_config(Cursor::new(wire_for(std::slice::from_ref(&frame))), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn interrupted_read_retries() {
        let frame = request("RETRY", b"ok");
        let inner = InterruptedThenData {
            interrupted: false,
            bytes: wire_for(std::slice::from_ref(&frame)),
            pos: 0,
        };
        let mut reader = FrameReader::new(inner);

        assert_eq!(reader.read_frame().unwrap(), frame);
    }

    #[test]
    fn roundtrip_over_socket_pair() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let frame = request("PING", b"ping");
        writer.write_frame(&frame).unwrap();

        assert_eq!(reader.read_frame().unwrap(), frame);
    }

    #[test]
    fn accessors_and_into_inner() {
        let cursor = Cursor::new(Vec::<u8>::new());
        let mut reader = FrameReader::new(cursor);

        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
