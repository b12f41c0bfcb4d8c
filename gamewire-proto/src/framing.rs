use crate::registry::is_reserved;
use crate::{CipherSuite, Encryptor, HandlerRegistry, ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

pub const ID_LEN: usize = 1;
pub const LENGTH_LEN: usize = 2;

/// Id byte plus little-endian u16 frame length
pub const HEADER_LEN: usize = ID_LEN + LENGTH_LEN;

/// Upper bound on a single socket read
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 11 * 1024;

/// Largest frame length a peer may declare before the connection is dropped
pub const DEFAULT_MAX_PACKET_LENGTH: usize = 16 * 1024;

/// A complete inbound packet, handed to the registered callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPacket {
    pub id: u8,
    pub encrypted: bool,
    pub variable_length: bool,
    /// Frame length on the wire, header included
    pub length: u16,
    pub cipher: CipherSuite,
    /// Packet body without the id byte or length header, decrypted when needed
    pub payload: Bytes,
}

/// How a packet id is measured on the wire
#[derive(Debug, Clone, Copy)]
struct FrameShape {
    id: u8,
    encrypted: bool,
    fixed_length: u16,
}

impl FrameShape {
    /// Encrypted frames always carry a header since ciphertext length differs from plaintext
    fn reads_header(&self) -> bool {
        self.encrypted || self.fixed_length == 0
    }
}

#[derive(Debug)]
struct PartialPacket {
    shape: FrameShape,
    /// None until the full header has arrived
    expected: Option<usize>,
    bytes: BytesMut,
}

/// Rebuilds packet boundaries from an unstructured byte stream.
///
/// Holds at most one incomplete packet at a time. Bytes past the end of a
/// packet always begin the next one, so a single read may complete several
/// packets and still leave a new partial behind.
#[derive(Debug)]
pub struct FrameAssembler {
    partial: Option<PartialPacket>,
    max_packet_length: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_LENGTH)
    }
}

impl FrameAssembler {
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            partial: None,
            max_packet_length,
        }
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Bytes buffered for the packet in progress
    pub fn pending_len(&self) -> usize {
        self.partial.as_ref().map_or(0, |p| p.bytes.len())
    }

    /// Frame length of the packet in progress, once known
    pub fn expected_len(&self) -> Option<usize> {
        self.partial.as_ref().and_then(|p| p.expected)
    }

    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Consumes one read worth of bytes, pushing every completed packet onto `out`.
    ///
    /// Packets completed before an error are left in `out`. After an error the
    /// assembler is reset and the stream should be treated as unusable.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        registry: &HandlerRegistry,
        encryptor: &dyn Encryptor,
        out: &mut Vec<ProcessedPacket>,
    ) -> Result<()> {
        let result = self.feed_inner(chunk, registry, encryptor, out);
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn feed_inner(
        &mut self,
        chunk: &[u8],
        registry: &HandlerRegistry,
        encryptor: &dyn Encryptor,
        out: &mut Vec<ProcessedPacket>,
    ) -> Result<()> {
        let mut input = chunk;

        if let Some(mut partial) = self.partial.take() {
            let expected = match partial.expected {
                Some(expected) => expected,
                None => {
                    let take = (HEADER_LEN - partial.bytes.len()).min(input.len());
                    partial.bytes.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    match self.expected_length(partial.shape, &partial.bytes)? {
                        Some(expected) => expected,
                        None => {
                            self.partial = Some(partial);
                            return Ok(());
                        }
                    }
                }
            };

            partial.expected = Some(expected);

            let take = (expected - partial.bytes.len()).min(input.len());
            partial.bytes.extend_from_slice(&input[..take]);
            input = &input[take..];

            if partial.bytes.len() < expected {
                trace!(
                    "Packet {} buffered {}/{} bytes",
                    partial.shape.id,
                    partial.bytes.len(),
                    expected
                );
                self.partial = Some(partial);
                return Ok(());
            }

            out.push(self.complete(partial.shape, partial.bytes.freeze(), encryptor)?);
        }

        // At a packet boundary: peel complete packets off the front until the
        // input runs out or only the start of one remains
        while let Some(&id) = input.first() {
            let shape = Self::frame_shape(registry, id)?;

            let expected = match self.expected_length(shape, input)? {
                Some(expected) => expected,
                None => {
                    self.partial = Some(PartialPacket {
                        shape,
                        expected: None,
                        bytes: BytesMut::from(input),
                    });
                    return Ok(());
                }
            };

            if input.len() < expected {
                let mut bytes = BytesMut::with_capacity(expected);
                bytes.extend_from_slice(input);
                self.partial = Some(PartialPacket {
                    shape,
                    expected: Some(expected),
                    bytes,
                });
                return Ok(());
            }

            let (frame, rest) = input.split_at(expected);
            out.push(self.complete(shape, Bytes::copy_from_slice(frame), encryptor)?);
            input = rest;
        }

        Ok(())
    }

    fn frame_shape(registry: &HandlerRegistry, id: u8) -> Result<FrameShape> {
        if is_reserved(id) {
            return Ok(FrameShape {
                id,
                encrypted: false,
                fixed_length: ID_LEN as u16,
            });
        }

        let entry = registry.lookup(id).ok_or_else(|| {
            warn!("Received unknown packet id {}", id);
            ProtocolError::UnknownPacket(id)
        })?;

        Ok(FrameShape {
            id,
            encrypted: entry.encrypted,
            fixed_length: entry.fixed_length,
        })
    }

    /// Returns the frame length once enough of `buf` is present to know it
    fn expected_length(&self, shape: FrameShape, buf: &[u8]) -> Result<Option<usize>> {
        let length = if shape.reads_header() {
            if buf.len() < HEADER_LEN {
                return Ok(None);
            }
            u16::from_le_bytes([buf[1], buf[2]]) as usize
        } else {
            shape.fixed_length as usize
        };

        if shape.reads_header() && length < HEADER_LEN {
            warn!("Packet {} declared invalid length {}", shape.id, length);
            return Err(ProtocolError::InvalidLength {
                id: shape.id,
                length,
            });
        }

        if length > self.max_packet_length {
            warn!(
                "Packet {} declared oversized length {} (max: {})",
                shape.id, length, self.max_packet_length
            );
            return Err(ProtocolError::PacketTooLarge {
                id: shape.id,
                length,
                max: self.max_packet_length,
            });
        }

        Ok(Some(length))
    }

    fn complete(
        &self,
        shape: FrameShape,
        frame: Bytes,
        encryptor: &dyn Encryptor,
    ) -> Result<ProcessedPacket> {
        let length = frame.len() as u16;

        let (payload, cipher) = if shape.encrypted {
            let plaintext = encryptor.decrypt(&frame[HEADER_LEN..])?;

            if shape.fixed_length != 0 && plaintext.len() + ID_LEN != shape.fixed_length as usize {
                return Err(ProtocolError::InvalidLength {
                    id: shape.id,
                    length: plaintext.len() + ID_LEN,
                });
            }

            (plaintext, encryptor.suite())
        } else if shape.reads_header() {
            (frame.slice(HEADER_LEN..), CipherSuite::None)
        } else {
            (frame.slice(ID_LEN..), CipherSuite::None)
        };

        debug!("Framed packet {} ({} bytes on the wire)", shape.id, length);

        Ok(ProcessedPacket {
            id: shape.id,
            encrypted: shape.encrypted,
            variable_length: shape.fixed_length == 0,
            length,
            cipher,
            payload,
        })
    }
}

/// Builds an unencrypted fixed-length frame: id byte followed by the payload
pub fn encode_fixed(id: u8, payload: &[u8]) -> Result<Bytes> {
    if is_reserved(id) {
        return Err(ProtocolError::ReservedId(id));
    }

    let length = ID_LEN + payload.len();
    if length > u16::MAX as usize {
        return Err(ProtocolError::PacketTooLarge {
            id,
            length,
            max: u16::MAX as usize,
        });
    }

    let mut frame = BytesMut::with_capacity(length);
    frame.put_u8(id);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Builds a length-prefixed frame: id, u16 LE total length, payload
pub fn encode_variable(id: u8, payload: &[u8]) -> Result<Bytes> {
    if is_reserved(id) {
        return Err(ProtocolError::ReservedId(id));
    }

    let length = HEADER_LEN + payload.len();
    if length > u16::MAX as usize {
        return Err(ProtocolError::PacketTooLarge {
            id,
            length,
            max: u16::MAX as usize,
        });
    }

    let mut frame = BytesMut::with_capacity(length);
    frame.put_u8(id);
    frame.put_u16_le(length as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChaChaEncryptor, Connection, PlainEncryptor, SERVER_GOODBYE};

    fn noop(_: &Connection, _: &ProcessedPacket) {}

    fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register(10, false, 5, noop).unwrap();
        registry.register(11, false, 1, noop).unwrap();
        registry.register(20, false, 0, noop).unwrap();
        registry.register(30, true, 0, noop).unwrap();
        registry.register(31, true, 4, noop).unwrap();
        registry
    }

    fn feed_all(
        assembler: &mut FrameAssembler,
        registry: &HandlerRegistry,
        chunks: &[&[u8]],
    ) -> Vec<ProcessedPacket> {
        let mut out = Vec::new();
        for chunk in chunks {
            assembler.feed(chunk, registry, &PlainEncryptor, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_fixed_length_single_read() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();

        let packets = feed_all(&mut assembler, &registry, &[&[10, 1, 2, 3, 4]]);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].id, 10);
        assert_eq!(packets[0].length, 5);
        assert_eq!(packets[0].payload.as_ref(), &[1, 2, 3, 4]);
        assert!(!packets[0].variable_length);
        assert!(!packets[0].encrypted);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_variable_length_single_read() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();

        let frame: &[u8] = &[20, 0x07, 0x00, b'A', b'B', b'C', b'D'];
        let packets = feed_all(&mut assembler, &registry, &[frame]);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].id, 20);
        assert_eq!(packets[0].length, 7);
        assert_eq!(packets[0].payload.as_ref(), b"ABCD");
        assert!(packets[0].variable_length);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_header_split_across_reads() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();
        let mut out = Vec::new();

        assembler.feed(&[20], &registry, &PlainEncryptor, &mut out).unwrap();
        assert!(out.is_empty());
        assert!(assembler.has_partial());
        assert_eq!(assembler.expected_len(), None);

        assembler.feed(&[0x07, 0x00], &registry, &PlainEncryptor, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(assembler.expected_len(), Some(7));
        assert_eq!(assembler.pending_len(), HEADER_LEN);

        assembler.feed(b"ABCD", &registry, &PlainEncryptor, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.as_ref(), b"ABCD");
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_header_split_with_payload_in_second_read() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();

        let chunks: &[&[u8]] = &[&[20, 0x07], &[0x00, b'A', b'B', b'C', b'D']];
        let packets = feed_all(&mut assembler, &registry, chunks);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload.as_ref(), b"ABCD");
    }

    #[test]
    fn test_coalesced_packets_in_one_read() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();

        let mut stream = Vec::new();
        stream.extend_from_slice(&[10, 1, 2, 3, 4]);
        stream.extend_from_slice(&encode_variable(20, b"first").unwrap());
        stream.extend_from_slice(&[11]);
        stream.extend_from_slice(&encode_variable(20, b"").unwrap());
        stream.extend_from_slice(&[10, 5, 6, 7, 8]);

        let packets = feed_all(&mut assembler, &registry, &[&stream]);

        let ids: Vec<u8> = packets.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![10, 20, 11, 20, 10]);
        assert_eq!(packets[1].payload.as_ref(), b"first");
        assert!(packets[2].payload.is_empty());
        assert!(packets[3].payload.is_empty());
        assert_eq!(packets[4].payload.as_ref(), &[5, 6, 7, 8]);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_overflow_leaves_next_packet_partial() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();
        let mut out = Vec::new();

        let second = encode_variable(20, b"second").unwrap();
        let mut read = vec![10, 1, 2, 3, 4];
        read.extend_from_slice(&second[..4]);

        assembler.feed(&read, &registry, &PlainEncryptor, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(assembler.expected_len(), Some(second.len()));

        assembler.feed(&second[4..], &registry, &PlainEncryptor, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].payload.as_ref(), b"second");
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_overflow_from_partial_completion() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();

        let chunks: &[&[u8]] = &[&[10, 1], &[2, 3, 4, 11, 10, 9], &[9, 9, 9]];
        let packets = feed_all(&mut assembler, &registry, chunks);

        let ids: Vec<u8> = packets.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![10, 11, 10]);
        assert_eq!(packets[2].payload.as_ref(), &[9, 9, 9, 9]);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_every_split_matches_unsplit() {
        let registry = registry();
        let frame = encode_variable(20, b"split me into pieces").unwrap();

        let mut whole = FrameAssembler::default();
        let expected = feed_all(&mut whole, &registry, &[&frame]);
        assert_eq!(expected.len(), 1);

        for size in 1..=frame.len() {
            let mut assembler = FrameAssembler::default();
            let chunks: Vec<&[u8]> = frame.chunks(size).collect();
            let packets = feed_all(&mut assembler, &registry, &chunks);

            assert_eq!(packets, expected, "chunk size {}", size);
            assert!(!assembler.has_partial());
        }
    }

    #[test]
    fn test_every_split_point_of_coalesced_pair() {
        let registry = registry();
        let mut stream = encode_variable(20, b"alpha").unwrap().to_vec();
        stream.extend_from_slice(&[10, 1, 2, 3, 4]);

        for at in 1..stream.len() {
            let mut assembler = FrameAssembler::default();
            let (a, b) = stream.split_at(at);
            let packets = feed_all(&mut assembler, &registry, &[a, b]);

            assert_eq!(packets.len(), 2, "split at {}", at);
            assert_eq!(packets[0].payload.as_ref(), b"alpha");
            assert_eq!(packets[1].payload.as_ref(), &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_unknown_id_keeps_earlier_packets() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();
        let mut out = Vec::new();

        let result = assembler.feed(&[11, 99, 1, 2], &registry, &PlainEncryptor, &mut out);

        assert!(matches!(result, Err(ProtocolError::UnknownPacket(99))));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 11);
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_oversized_declared_length_rejected() {
        let registry = registry();
        let mut assembler = FrameAssembler::new(64);
        let mut out = Vec::new();

        let result = assembler.feed(&[20, 0xFF, 0xFF, 0], &registry, &PlainEncryptor, &mut out);

        assert!(matches!(
            result,
            Err(ProtocolError::PacketTooLarge { id: 20, length: 0xFFFF, max: 64 })
        ));
        assert!(!assembler.has_partial());
    }

    #[test]
    fn test_undersized_declared_length_rejected() {
        let registry = registry();
        let mut assembler = FrameAssembler::default();
        let mut out = Vec::new();

        let result = assembler.feed(&[20, 0x02, 0x00], &registry, &PlainEncryptor, &mut out);

        assert!(matches!(result, Err(ProtocolError::InvalidLength { id: 20, length: 2 })));
    }

    #[test]
    fn test_encrypted_packet_split() {
        let registry = registry();
        let encryptor = ChaChaEncryptor::new(&[7; 32]);
        let frame = encryptor.finalize(30, b"top secret").unwrap();

        let mut assembler = FrameAssembler::default();
        let mut out = Vec::new();
        for chunk in frame.chunks(5) {
            assembler.feed(chunk, &registry, &encryptor, &mut out).unwrap();
        }

        assert_eq!(out.len(), 1);
        assert!(out[0].encrypted);
        assert_eq!(out[0].cipher, CipherSuite::ChaCha20Poly1305);
        assert_eq!(out[0].length as usize, frame.len());
        assert_eq!(out[0].payload.as_ref(), b"top secret");
    }

    #[test]
    fn test_encrypted_fixed_length_checked_after_decrypt() {
        let registry = registry();
        let encryptor = ChaChaEncryptor::new(&[7; 32]);
        let mut out = Vec::new();

        let good = encryptor.finalize(31, &[1, 2, 3]).unwrap();
        FrameAssembler::default().feed(&good, &registry, &encryptor, &mut out).unwrap();
        assert_eq!(out[0].payload.as_ref(), &[1, 2, 3]);
        assert!(!out[0].variable_length);

        let bad = encryptor.finalize(31, &[1, 2]).unwrap();
        let result = FrameAssembler::default().feed(&bad, &registry, &encryptor, &mut out);
        assert!(matches!(result, Err(ProtocolError::InvalidLength { id: 31, length: 3 })));
    }

    #[test]
    fn test_decryption_failure() {
        let registry = registry();
        let sender = ChaChaEncryptor::new(&[1; 32]);
        let receiver = ChaChaEncryptor::new(&[2; 32]);
        let frame = sender.finalize(30, b"payload").unwrap();

        let mut out = Vec::new();
        let result = FrameAssembler::default().feed(&frame, &registry, &receiver, &mut out);

        assert!(matches!(result, Err(ProtocolError::Decryption(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_goodbye_needs_no_registration() {
        let registry = HandlerRegistry::new();
        let mut assembler = FrameAssembler::default();

        let packets = feed_all(&mut assembler, &registry, &[&[SERVER_GOODBYE]]);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].id, SERVER_GOODBYE);
        assert!(packets[0].payload.is_empty());
    }

    #[test]
    fn test_encode_rejects_reserved_and_oversized() {
        assert!(matches!(encode_fixed(254, &[]), Err(ProtocolError::ReservedId(254))));
        assert!(matches!(encode_variable(255, &[]), Err(ProtocolError::ReservedId(255))));

        let huge = vec![0u8; u16::MAX as usize];
        assert!(matches!(
            encode_variable(20, &huge),
            Err(ProtocolError::PacketTooLarge { id: 20, .. })
        ));
    }
}
