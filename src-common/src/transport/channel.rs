//! Point-to-point frame channel over a Unix stream socket.
//!
//! One [`FrameSender`] writes headers and passes one memfd per frame; one
//! [`FrameReceiver`] reads them back, validates the pairing and maps each
//! payload read-only.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tracing::{debug, trace};

use super::fdpass;
use super::memory::{self, MappedRegion, MemoryIdentity};
use super::wire::{FrameHeader, HEADER_LEN};

/// Error raised by either end of a frame channel.
#[derive(Debug)]
pub enum ChannelError {
    /// I/O error on the socket
    Io(io::Error),
    /// Malformed header/descriptor pairing or unusable descriptor
    Protocol(String),
    /// Peer went away without sending end-of-stream
    ConnectionLost,
    /// Channel already ended with an error
    Terminated,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Io(e) => write!(f, "I/O error: {}", e),
            ChannelError::Protocol(msg) => write!(f, "Channel protocol error: {}", msg),
            ChannelError::ConnectionLost => write!(f, "Connection lost"),
            ChannelError::Terminated => write!(f, "Channel already terminated"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => ChannelError::ConnectionLost,
            _ => ChannelError::Io(e),
        }
    }
}

/// Create a connected channel inside one process.
///
/// Returns the sending half and the raw descriptor of the receiving end,
/// ready to be handed to another process.
pub fn channel_pair() -> io::Result<(FrameSender, OwnedFd)> {
    let (local, remote) = std::os::unix::net::UnixStream::pair()?;
    let sender = FrameSender::from_std(local)?;
    Ok((sender, OwnedFd::from(remote)))
}

fn into_tokio(stream: std::os::unix::net::UnixStream) -> io::Result<UnixStream> {
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// Writing end of a frame channel.
#[derive(Debug)]
pub struct FrameSender {
    stream: UnixStream,
}

impl FrameSender {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        Ok(Self::new(into_tokio(stream)?))
    }

    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        Self::from_std(std::os::unix::net::UnixStream::from(fd))
    }

    /// Send one frame. `payload` is duplicated into the peer by the kernel;
    /// the caller keeps (and eventually drops) its own reference.
    pub async fn send(&mut self, header: FrameHeader, payload: BorrowedFd<'_>) -> Result<(), ChannelError> {
        if header.is_eos() {
            return Err(ChannelError::Protocol(
                "frame header with zero length".to_string(),
            ));
        }

        let bytes = header.encode();
        let stream = &self.stream;
        let sent = stream
            .async_io(Interest::WRITABLE, || {
                fdpass::send_with_fds(stream.as_fd(), &bytes, &[payload])
            })
            .await?;

        if sent < HEADER_LEN {
            self.stream.write_all(&bytes[sent..]).await?;
        }

        trace!(sequence = header.sequence, length = header.length, "Sent frame");
        Ok(())
    }

    /// Send the end-of-stream marker and close the write half.
    pub async fn send_eos(&mut self) -> Result<(), ChannelError> {
        self.stream.write_all(&FrameHeader::eos().encode()).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A frame read from a channel. Owns its descriptor and mapping; both are
/// released when the value is dropped.
#[derive(Debug)]
pub struct ReceivedFrame {
    pub sequence: u64,
    pub pts: u64,
    pub duration: u64,
    mapping: MappedRegion,
    fd: OwnedFd,
}

impl ReceivedFrame {
    pub fn data(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Identity of the backing memory object.
    pub fn memory_identity(&self) -> io::Result<MemoryIdentity> {
        memory::identity(self.fd.as_fd())
    }
}

impl AsFd for ReceivedFrame {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    Open,
    Eos,
    Failed,
}

/// Reading end of a frame channel.
#[derive(Debug)]
pub struct FrameReceiver {
    stream: UnixStream,
    expected_size: Option<usize>,
    state: ReceiverState,
    dropped: u64,
}

impl FrameReceiver {
    /// Wrap a connected stream. Frames whose length differs from
    /// `expected_size` are discarded.
    pub fn new(stream: UnixStream, expected_size: Option<usize>) -> Self {
        Self {
            stream,
            expected_size,
            state: ReceiverState::Open,
            dropped: 0,
        }
    }

    pub fn from_fd(fd: OwnedFd, expected_size: Option<usize>) -> io::Result<Self> {
        let stream = into_tokio(std::os::unix::net::UnixStream::from(fd))?;
        Ok(Self::new(stream, expected_size))
    }

    /// Frames discarded for having the wrong size.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` at end-of-stream. After end-of-stream or an error,
    /// no further frames are returned.
    pub async fn receive(&mut self) -> Result<Option<ReceivedFrame>, ChannelError> {
        match self.state {
            ReceiverState::Open => {}
            ReceiverState::Eos => return Ok(None),
            ReceiverState::Failed => return Err(ChannelError::Terminated),
        }

        match self.receive_inner().await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.state = ReceiverState::Eos;
                Ok(None)
            }
            Err(e) => {
                self.state = ReceiverState::Failed;
                Err(e)
            }
        }
    }

    async fn receive_inner(&mut self) -> Result<Option<ReceivedFrame>, ChannelError> {
        loop {
            let (header, mut fds) = self.read_message().await?;

            if header.is_eos() {
                if !fds.is_empty() {
                    return Err(ChannelError::Protocol(
                        "end-of-stream marker carried a descriptor".to_string(),
                    ));
                }
                debug!("Received end-of-stream");
                return Ok(None);
            }

            let fd = match (fds.pop(), fds.is_empty()) {
                (Some(fd), true) => fd,
                (None, _) => {
                    return Err(ChannelError::Protocol(format!(
                        "frame {} arrived without a descriptor",
                        header.sequence
                    )))
                }
                (Some(_), false) => {
                    return Err(ChannelError::Protocol(format!(
                        "frame {} arrived with {} descriptors",
                        header.sequence,
                        fds.len() + 1
                    )))
                }
            };

            let length = header.length as usize;
            if let Some(expected) = self.expected_size {
                if length != expected {
                    debug!(
                        sequence = header.sequence,
                        length,
                        expected,
                        "Dropping frame with unexpected size"
                    );
                    self.dropped += 1;
                    continue;
                }
            }

            let actual = memory::file_size(fd.as_fd())?;
            if actual < length as u64 {
                return Err(ChannelError::Protocol(format!(
                    "descriptor for frame {} holds {} bytes, header says {}",
                    header.sequence, actual, length
                )));
            }

            let mapping = MappedRegion::map(fd.as_fd(), length)
                .map_err(|e| ChannelError::Protocol(format!("cannot map payload: {}", e)))?;

            return Ok(Some(ReceivedFrame {
                sequence: header.sequence,
                pts: header.pts,
                duration: header.duration,
                mapping,
                fd,
            }));
        }
    }

    /// Read exactly one header plus whatever descriptors accompanied it.
    ///
    /// Never asks the kernel for more than the rest of the current header,
    /// so descriptors of the next message cannot be merged into this one.
    async fn read_message(&mut self) -> Result<(FrameHeader, Vec<OwnedFd>), ChannelError> {
        let mut buf = [0u8; HEADER_LEN];
        let mut filled = 0;
        let mut fds = Vec::new();

        while filled < HEADER_LEN {
            let stream = &self.stream;
            let chunk = &mut buf[filled..];
            let received = stream
                .async_io(Interest::READABLE, || {
                    fdpass::recv_with_fds(stream.as_fd(), chunk)
                })
                .await?;

            fds.extend(received.fds);

            if received.truncated {
                return Err(ChannelError::Protocol(
                    "control data truncated".to_string(),
                ));
            }
            if received.len == 0 {
                if filled == 0 && fds.is_empty() {
                    return Err(ChannelError::ConnectionLost);
                }
                return Err(ChannelError::Protocol(format!(
                    "connection closed after {} of {} header bytes",
                    filled, HEADER_LEN
                )));
            }
            filled += received.len;
        }

        Ok((FrameHeader::decode(&buf), fds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FrameMemory;
    use std::collections::HashSet;
    use std::os::unix::fs::MetadataExt;

    fn header(sequence: u64, length: usize) -> FrameHeader {
        FrameHeader {
            sequence,
            pts: sequence * 100_000_000,
            duration: 100_000_000,
            length: length as u32,
        }
    }

    fn pair(expected_size: Option<usize>) -> (FrameSender, FrameReceiver) {
        let (sender, fd) = channel_pair().unwrap();
        (sender, FrameReceiver::from_fd(fd, expected_size).unwrap())
    }

    /// Descriptors open in this process that point at one of `ids`.
    fn open_descriptors_for(ids: &HashSet<MemoryIdentity>) -> usize {
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| std::fs::metadata(entry.ok()?.path()).ok())
            .filter(|meta| {
                ids.contains(&MemoryIdentity {
                    dev: meta.dev(),
                    ino: meta.ino(),
                })
            })
            .count()
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_with_payload() {
        let (mut sender, mut receiver) = pair(Some(4));

        for seq in 0..3u64 {
            let memory = FrameMemory::from_bytes(&[seq as u8; 4]).unwrap();
            sender.send(header(seq, 4), memory.as_fd()).await.unwrap();
        }
        sender.send_eos().await.unwrap();

        for seq in 0..3u64 {
            let frame = receiver.receive().await.unwrap().unwrap();
            assert_eq!(frame.sequence, seq);
            assert_eq!(frame.pts, seq * 100_000_000);
            assert_eq!(frame.duration, 100_000_000);
            assert_eq!(frame.data(), &[seq as u8; 4]);
        }
        assert!(receiver.receive().await.unwrap().is_none());
        // Stays terminal
        assert!(receiver.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_earlier_frame_unchanged_after_next_arrives() {
        let (mut sender, mut receiver) = pair(None);

        let first = FrameMemory::from_bytes(b"first-frame").unwrap();
        sender.send(header(0, 11), first.as_fd()).await.unwrap();
        drop(first);
        let frame0 = receiver.receive().await.unwrap().unwrap();
        let snapshot = frame0.data().to_vec();

        let second = FrameMemory::from_bytes(b"other-frame").unwrap();
        sender.send(header(1, 11), second.as_fd()).await.unwrap();
        let frame1 = receiver.receive().await.unwrap().unwrap();

        assert_eq!(frame0.data(), &snapshot[..]);
        assert_eq!(frame1.data(), b"other-frame");
        assert_ne!(
            frame0.memory_identity().unwrap(),
            frame1.memory_identity().unwrap()
        );
    }

    #[tokio::test]
    async fn test_descriptors_do_not_accumulate() {
        let (mut sender, mut receiver) = pair(Some(64));
        let mut ids = HashSet::new();

        for seq in 0..40u64 {
            let memory = FrameMemory::from_bytes(&[7u8; 64]).unwrap();
            ids.insert(memory.identity().unwrap());
            sender.send(header(seq, 64), memory.as_fd()).await.unwrap();
            drop(memory);

            let frame = receiver.receive().await.unwrap().unwrap();
            assert_eq!(frame.sequence, seq);
            assert!(open_descriptors_for(&ids) <= 1);
        }
        assert_eq!(open_descriptors_for(&ids), 0);
    }

    #[tokio::test]
    async fn test_mis_sized_frames_are_dropped() {
        let (mut sender, mut receiver) = pair(Some(12));

        for (seq, len) in [(0u64, 11usize), (1, 12), (2, 13), (3, 12)] {
            let memory = FrameMemory::from_bytes(&vec![1u8; len]).unwrap();
            sender.send(header(seq, len), memory.as_fd()).await.unwrap();
        }
        sender.send_eos().await.unwrap();

        let mut delivered = Vec::new();
        while let Some(frame) = receiver.receive().await.unwrap() {
            assert_eq!(frame.len(), 12);
            delivered.push(frame.sequence);
        }
        assert_eq!(delivered, vec![1, 3]);
        assert_eq!(receiver.dropped_frames(), 2);
    }

    #[tokio::test]
    async fn test_close_without_eos_is_connection_lost() {
        let (sender, mut receiver) = pair(None);
        drop(sender);

        assert!(matches!(
            receiver.receive().await,
            Err(ChannelError::ConnectionLost)
        ));
        assert!(matches!(
            receiver.receive().await,
            Err(ChannelError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_header_without_descriptor_is_protocol_error() {
        let (local, remote) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut raw = into_tokio(local).unwrap();
        let mut receiver = FrameReceiver::from_fd(OwnedFd::from(remote), None).unwrap();

        raw.write_all(&header(0, 16).encode()).await.unwrap();

        assert!(matches!(
            receiver.receive().await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_header_is_protocol_error() {
        let (local, remote) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut raw = into_tokio(local).unwrap();
        let mut receiver = FrameReceiver::from_fd(OwnedFd::from(remote), None).unwrap();

        raw.write_all(&header(0, 16).encode()[..10]).await.unwrap();
        drop(raw);

        assert!(matches!(
            receiver.receive().await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_two_descriptors_is_protocol_error() {
        let (local, remote) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut receiver = FrameReceiver::from_fd(OwnedFd::from(remote), None).unwrap();

        let a = FrameMemory::from_bytes(&[0u8; 8]).unwrap();
        let b = FrameMemory::from_bytes(&[0u8; 8]).unwrap();
        fdpass::send_with_fds(local.as_fd(), &header(0, 8).encode(), &[a.as_fd(), b.as_fd()])
            .unwrap();

        assert!(matches!(
            receiver.receive().await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_undersized_descriptor_is_protocol_error() {
        let (mut sender, mut receiver) = pair(None);

        let memory = FrameMemory::from_bytes(&[0u8; 8]).unwrap();
        sender.send(header(0, 4096), memory.as_fd()).await.unwrap();

        assert!(matches!(
            receiver.receive().await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected_by_sender() {
        let (mut sender, _receiver) = pair(None);
        let memory = FrameMemory::from_bytes(&[0u8; 8]).unwrap();
        assert!(matches!(
            sender.send(FrameHeader::eos(), memory.as_fd()).await,
            Err(ChannelError::Protocol(_))
        ));
    }
}
