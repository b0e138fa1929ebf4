//! Binary wire protocol for file transfer sessions.
//!
//! Every frame is a 12-byte big-endian header followed by a payload whose
//! length the header declares. Control frames (`Ack`, `End`, `Denied`,
//! `Error`) carry no payload; `Request` carries a fixed 12-byte payload and
//! `FileMetadata` a 16-byte fixed part plus two UTF-8 strings.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol revision carried in every header.
pub const PROTOCOL_VERSION: u8 = 0x11;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 12;

/// Encoded request payload size in bytes.
pub const REQUEST_LEN: usize = 12;

/// Fixed prefix of a file metadata payload, before the two strings.
pub const METADATA_FIXED_LEN: usize = 16;

/// Largest payload a header may announce (32 GiB).
pub const MAX_PAYLOAD_SIZE: u64 = 32 * 1024 * 1024 * 1024;

/// Longest file name or relative path, in bytes.
pub const MAX_STRING_LEN: u32 = 4096;

/// Largest file count a request may announce.
pub const MAX_FILE_COUNT: u32 = 1_000_000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
    #[error("invalid protocol version {0:#04x}")]
    InvalidVersion(u8),
    #[error("invalid frame type {0:#04x}")]
    InvalidType(u8),
    #[error("reserved field must be zero")]
    ReservedFieldUsed,
    #[error("payload of {0} bytes exceeds maximum size")]
    PayloadTooLarge(u64),
    #[error("length field inconsistent with frame contents")]
    InvalidLength,
    #[error("insufficient data, read more and retry")]
    InsufficientData,
    #[error("string field cannot be empty")]
    EmptyString,
    #[error("string field of {0} bytes exceeds maximum length")]
    StringTooLong(u32),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Frame discriminator, one per protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Request = 0x01,
    FileMetadata = 0x02,
    Ack = 0x03,
    End = 0x04,
    Denied = 0x06,
    Error = 0xFF,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Result<Self, ProtoError> {
        match byte {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::FileMetadata),
            0x03 => Ok(Self::Ack),
            0x04 => Ok(Self::End),
            0x06 => Ok(Self::Denied),
            0xFF => Ok(Self::Error),
            other => Err(ProtoError::InvalidType(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Frame header: `version:u8 | type:u8 | length:u64 | reserved:u16`,
/// big-endian. Version and reserved are implicit; they are written on encode
/// and checked on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub frame_type: FrameType,
    pub length: u64,
}

impl Header {
    pub fn new(frame_type: FrameType, length: u64) -> Result<Self, ProtoError> {
        let header = Self { frame_type, length };
        header.validate()?;
        Ok(header)
    }

    /// Smallest and largest payload the given frame type permits.
    fn length_bounds(frame_type: FrameType) -> (u64, u64) {
        match frame_type {
            FrameType::Request => (REQUEST_LEN as u64, REQUEST_LEN as u64),
            // At least one byte of name and one of path.
            FrameType::FileMetadata => (
                METADATA_FIXED_LEN as u64 + 2,
                METADATA_FIXED_LEN as u64 + 2 * MAX_STRING_LEN as u64,
            ),
            FrameType::Ack | FrameType::End | FrameType::Denied | FrameType::Error => (0, 0),
        }
    }

    fn validate(&self) -> Result<(), ProtoError> {
        if self.length > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge(self.length));
        }
        let (min, max) = Self::length_bounds(self.frame_type);
        if self.length < min || self.length > max {
            return Err(ProtoError::InvalidLength);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<[u8; HEADER_LEN], ProtoError> {
        self.validate()?;
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = self.frame_type.as_byte();
        buf[2..10].copy_from_slice(&self.length.to_be_bytes());
        // buf[10..12] is the reserved field, already zero
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtoError::InsufficientData);
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(ProtoError::InvalidVersion(buf[0]));
        }
        let frame_type = FrameType::from_byte(buf[1])?;
        let length = u64::from_be_bytes(buf[2..10].try_into().expect("slice is 8 bytes"));
        let reserved = u16::from_be_bytes(buf[10..12].try_into().expect("slice is 2 bytes"));
        if reserved != 0 {
            return Err(ProtoError::ReservedFieldUsed);
        }
        let header = Self { frame_type, length };
        header.validate()?;
        Ok(header)
    }
}

/// Transfer request: `total_size:u64 | file_count:u32`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub total_size: u64,
    pub file_count: u32,
}

impl Request {
    pub fn new(total_size: u64, file_count: u32) -> Result<Self, ProtoError> {
        let request = Self {
            total_size,
            file_count,
        };
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<(), ProtoError> {
        if self.file_count == 0 || self.file_count > MAX_FILE_COUNT {
            return Err(ProtoError::InvalidLength);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<[u8; REQUEST_LEN], ProtoError> {
        self.validate()?;
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..8].copy_from_slice(&self.total_size.to_be_bytes());
        buf[8..12].copy_from_slice(&self.file_count.to_be_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < REQUEST_LEN {
            return Err(ProtoError::InsufficientData);
        }
        let request = Self {
            total_size: u64::from_be_bytes(buf[0..8].try_into().expect("slice is 8 bytes")),
            file_count: u32::from_be_bytes(buf[8..12].try_into().expect("slice is 4 bytes")),
        };
        request.validate()?;
        Ok(request)
    }
}

/// Per-file metadata announced before the file's raw bytes:
/// `size:u64 | name_len:u32 | path_len:u32 | name | path`.
///
/// `path` is the subdirectory the receiver creates under its download root;
/// `"."` places the file directly in the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    pub name: String,
    pub path: String,
}

impl FileMetadata {
    pub fn new(size: u64, name: impl Into<String>, path: impl Into<String>) -> Result<Self, ProtoError> {
        let metadata = Self {
            size,
            name: name.into(),
            path: path.into(),
        };
        metadata.validate()?;
        Ok(metadata)
    }

    fn validate(&self) -> Result<(), ProtoError> {
        for field in [&self.name, &self.path] {
            if field.is_empty() {
                return Err(ProtoError::EmptyString);
            }
            if field.len() > MAX_STRING_LEN as usize {
                return Err(ProtoError::StringTooLong(field.len() as u32));
            }
        }
        Ok(())
    }

    /// Payload size on the wire, as the header must announce it.
    pub fn encoded_len(&self) -> u64 {
        (METADATA_FIXED_LEN + self.name.len() + self.path.len()) as u64
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        self.validate()?;
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&(self.name.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.path.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(self.path.as_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < METADATA_FIXED_LEN {
            return Err(ProtoError::InsufficientData);
        }
        let size = u64::from_be_bytes(buf[0..8].try_into().expect("slice is 8 bytes"));
        let name_len = u32::from_be_bytes(buf[8..12].try_into().expect("slice is 4 bytes"));
        let path_len = u32::from_be_bytes(buf[12..16].try_into().expect("slice is 4 bytes"));

        if name_len == 0 || path_len == 0 {
            return Err(ProtoError::EmptyString);
        }
        if name_len > MAX_STRING_LEN {
            return Err(ProtoError::StringTooLong(name_len));
        }
        if path_len > MAX_STRING_LEN {
            return Err(ProtoError::StringTooLong(path_len));
        }

        let expected = METADATA_FIXED_LEN + name_len as usize + path_len as usize;
        if buf.len() < expected {
            return Err(ProtoError::InsufficientData);
        }
        if buf.len() > expected {
            return Err(ProtoError::InvalidLength);
        }

        let name_end = METADATA_FIXED_LEN + name_len as usize;
        let name = std::str::from_utf8(&buf[METADATA_FIXED_LEN..name_end])
            .map_err(|_| ProtoError::InvalidUtf8)?
            .to_string();
        let path = std::str::from_utf8(&buf[name_end..expected])
            .map_err(|_| ProtoError::InvalidUtf8)?
            .to_string();

        Ok(Self { size, name, path })
    }
}

/// Write a payload-less control frame (`Ack`, `End`, `Denied`, `Error`).
pub async fn write_control<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_type: FrameType,
) -> anyhow::Result<()> {
    let header = Header::new(frame_type, 0)?;
    writer.write_all(&header.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a request frame (header plus payload).
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> anyhow::Result<()> {
    let header = Header::new(FrameType::Request, REQUEST_LEN as u64)?;
    writer.write_all(&header.encode()?).await?;
    writer.write_all(&request.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a file metadata frame (header plus payload). The file's raw bytes
/// follow separately.
pub async fn write_metadata<W: AsyncWrite + Unpin>(
    writer: &mut W,
    metadata: &FileMetadata,
) -> anyhow::Result<()> {
    let header = Header::new(FrameType::FileMetadata, metadata.encoded_len())?;
    writer.write_all(&header.encode()?).await?;
    writer.write_all(&metadata.encode()?).await?;
    Ok(())
}

/// Read and validate the next frame header.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(Header::decode(&buf)?)
}

/// Read a request payload after its header has been consumed.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Request> {
    let mut buf = [0u8; REQUEST_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(Request::decode(&buf)?)
}

/// Read a file metadata payload after its header has been consumed. The
/// header's validated length bounds the allocation.
pub async fn read_metadata<R: AsyncRead + Unpin>(
    reader: &mut R,
    header: &Header,
) -> anyhow::Result<FileMetadata> {
    let mut buf = vec![0u8; header.length as usize];
    reader.read_exact(&mut buf).await?;
    Ok(FileMetadata::decode(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_header_roundtrip() {
        let cases = [
            Header::new(FrameType::Request, REQUEST_LEN as u64).unwrap(),
            Header::new(FrameType::FileMetadata, 16 + 8 + 1).unwrap(),
            Header::new(FrameType::Ack, 0).unwrap(),
            Header::new(FrameType::End, 0).unwrap(),
            Header::new(FrameType::Denied, 0).unwrap(),
            Header::new(FrameType::Error, 0).unwrap(),
        ];
        for header in cases {
            let encoded = header.encode().unwrap();
            assert_eq!(Header::decode(&encoded).unwrap(), header);
        }
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let mut buf = Header::new(FrameType::Ack, 0).unwrap().encode().unwrap();
        buf[0] = 0x10;
        assert_eq!(Header::decode(&buf), Err(ProtoError::InvalidVersion(0x10)));
    }

    #[test]
    fn test_header_rejects_bad_type() {
        let mut buf = Header::new(FrameType::Ack, 0).unwrap().encode().unwrap();
        buf[1] = 0x05;
        assert_eq!(Header::decode(&buf), Err(ProtoError::InvalidType(0x05)));
    }

    #[test]
    fn test_header_rejects_reserved_field() {
        let mut buf = Header::new(FrameType::Ack, 0).unwrap().encode().unwrap();
        buf[11] = 1;
        assert_eq!(Header::decode(&buf), Err(ProtoError::ReservedFieldUsed));
    }

    #[test]
    fn test_header_rejects_oversized_length() {
        assert_eq!(
            Header::new(FrameType::FileMetadata, MAX_PAYLOAD_SIZE + 1),
            Err(ProtoError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );

        let mut buf = [0u8; HEADER_LEN];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = FrameType::FileMetadata.as_byte();
        buf[2..10].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert_eq!(
            Header::decode(&buf),
            Err(ProtoError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
    }

    #[test]
    fn test_header_rejects_wrong_length_for_type() {
        // Control frames must carry no payload, requests exactly 12 bytes.
        assert_eq!(Header::new(FrameType::Ack, 1), Err(ProtoError::InvalidLength));
        assert_eq!(Header::new(FrameType::End, 4), Err(ProtoError::InvalidLength));
        assert_eq!(
            Header::new(FrameType::Request, 11),
            Err(ProtoError::InvalidLength)
        );

        let mut buf = [0u8; HEADER_LEN];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = FrameType::Denied.as_byte();
        buf[2..10].copy_from_slice(&1u64.to_be_bytes());
        assert_eq!(Header::decode(&buf), Err(ProtoError::InvalidLength));
    }

    #[test]
    fn test_header_short_buffer_is_insufficient() {
        let buf = Header::new(FrameType::Ack, 0).unwrap().encode().unwrap();
        assert_eq!(Header::decode(&buf[..7]), Err(ProtoError::InsufficientData));
        assert_eq!(Header::decode(&[]), Err(ProtoError::InsufficientData));
    }

    #[test]
    fn test_request_roundtrip() {
        let request = Request::new(123_456_789, 42).unwrap();
        let encoded = request.encode().unwrap();
        assert_eq!(Request::decode(&encoded).unwrap(), request);
    }

    #[test]
    fn test_request_bounds_file_count() {
        assert_eq!(Request::new(10, 0), Err(ProtoError::InvalidLength));
        assert_eq!(
            Request::new(10, MAX_FILE_COUNT + 1),
            Err(ProtoError::InvalidLength)
        );
        assert!(Request::new(10, MAX_FILE_COUNT).is_ok());
        assert!(Request::new(0, 1).is_ok());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let cases = [
            FileMetadata::new(0, "a", ".").unwrap(),
            FileMetadata::new(11, "hello.txt", "docs").unwrap(),
            FileMetadata::new(u64::MAX, "x".repeat(4096), "y".repeat(4096)).unwrap(),
            FileMetadata::new(5, "снимок.png", "фото").unwrap(),
        ];
        for metadata in cases {
            let encoded = metadata.encode().unwrap();
            assert_eq!(encoded.len() as u64, metadata.encoded_len());
            assert_eq!(FileMetadata::decode(&encoded).unwrap(), metadata);
        }
    }

    #[test]
    fn test_metadata_rejects_empty_strings() {
        assert_eq!(FileMetadata::new(1, "", "."), Err(ProtoError::EmptyString));
        assert_eq!(FileMetadata::new(1, "a", ""), Err(ProtoError::EmptyString));

        let mut buf = FileMetadata::new(1, "a", ".").unwrap().encode().unwrap();
        buf[8..12].copy_from_slice(&0u32.to_be_bytes());
        assert_eq!(FileMetadata::decode(&buf), Err(ProtoError::EmptyString));
    }

    #[test]
    fn test_metadata_rejects_oversized_strings() {
        assert_eq!(
            FileMetadata::new(1, "a".repeat(4097), "."),
            Err(ProtoError::StringTooLong(4097))
        );
    }

    #[test]
    fn test_metadata_rejects_length_mismatch() {
        // A declared name length that disagrees with the actual bytes must
        // not parse.
        let good = FileMetadata::new(1, "file.txt", "docs").unwrap();
        let mut buf = good.encode().unwrap();
        buf[8..12].copy_from_slice(&9u32.to_be_bytes());
        assert_eq!(FileMetadata::decode(&buf), Err(ProtoError::InsufficientData));

        let mut buf = good.encode().unwrap();
        buf[8..12].copy_from_slice(&7u32.to_be_bytes());
        assert_eq!(FileMetadata::decode(&buf), Err(ProtoError::InvalidLength));
    }

    #[test]
    fn test_metadata_partial_buffer_is_insufficient() {
        let encoded = FileMetadata::new(1, "file.txt", "docs").unwrap().encode().unwrap();
        for cut in [0, 8, METADATA_FIXED_LEN, encoded.len() - 1] {
            assert_eq!(
                FileMetadata::decode(&encoded[..cut]),
                Err(ProtoError::InsufficientData),
                "cut at {cut}"
            );
        }
        // Once the full frame is available the same buffer parses.
        assert!(FileMetadata::decode(&encoded).is_ok());
    }

    #[tokio::test]
    async fn test_frame_io_over_stream() {
        let (mut client, mut server) = duplex(4096);

        let request = Request::new(1024, 2).unwrap();
        let metadata = FileMetadata::new(1024, "a.bin", "sub").unwrap();

        tokio::spawn(async move {
            write_request(&mut client, &request).await.unwrap();
            write_metadata(&mut client, &metadata).await.unwrap();
            write_control(&mut client, FrameType::End).await.unwrap();
        });

        let header = read_header(&mut server).await.unwrap();
        assert_eq!(header.frame_type, FrameType::Request);
        let got = read_request(&mut server).await.unwrap();
        assert_eq!(got, Request::new(1024, 2).unwrap());

        let header = read_header(&mut server).await.unwrap();
        assert_eq!(header.frame_type, FrameType::FileMetadata);
        let got = read_metadata(&mut server, &header).await.unwrap();
        assert_eq!(got.name, "a.bin");
        assert_eq!(got.path, "sub");

        let header = read_header(&mut server).await.unwrap();
        assert_eq!(header.frame_type, FrameType::End);
        assert_eq!(header.length, 0);
    }

    #[tokio::test]
    async fn test_read_header_rejects_garbage() {
        let (mut client, mut server) = duplex(64);
        tokio::spawn(async move {
            client.write_all(&[0u8; HEADER_LEN]).await.unwrap();
        });
        assert!(read_header(&mut server).await.is_err());
    }
}
