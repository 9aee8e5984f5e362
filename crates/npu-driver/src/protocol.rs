//! Secure-session protocol
//!
//! Typed commands exchanged with the trusted side. A [`TeeChannel`] performs
//! one synchronous transaction per [`Request`]; [`SecureSession`] owns the
//! channel, enforces the open/closed state and unpacks responses.
//!
//! Failed commands are never retried. The caller decides what a failure
//! means for its own state.

use crate::error::{NpuError, Result};
use crate::memory::Segment;
use bytemuck::{Pod, Zeroable};
use npu_chip::mmu::{is_page_aligned, PAGE_SIZE};
use npu_chip::tee::{cmd, command_name, npu_mode, result};
use std::fmt;
use tracing::{debug, error, info, warn};

/// One physically contiguous run handed to the trusted side
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RegionEntry {
    /// Physical base address
    pub base: u64,
    /// Length in pages
    pub pages: u64,
}

impl RegionEntry {
    /// Entry for a page-multiple segment
    pub fn from_segment(seg: &Segment) -> Self {
        Self {
            base: seg.phys,
            pages: (seg.len / PAGE_SIZE) as u64,
        }
    }

    /// Length in bytes
    #[allow(clippy::cast_possible_truncation)]
    pub const fn len(&self) -> usize {
        self.pages as usize * PAGE_SIZE
    }

    /// True for an empty run
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }
}

/// Region entries for a list of page-multiple segments
pub fn region_entries(segments: &[Segment]) -> Vec<RegionEntry> {
    segments.iter().map(RegionEntry::from_segment).collect()
}

/// Clip scatter-gather `segments` to the window `[offset, offset + size)`.
///
/// # Errors
///
/// Returns a usage error if the window is not page aligned, is empty or runs
/// past the segments, if there are no segments, or if a clipped piece is not
/// a page multiple.
pub fn clip_segments(
    segments: &[Segment],
    offset: usize,
    size: usize,
    page: usize,
) -> Result<Vec<Segment>> {
    if segments.is_empty() {
        return Err(NpuError::usage("buffer has no memory segments"));
    }
    if size == 0 {
        return Err(NpuError::usage("zero-sized buffer window"));
    }
    if offset % page != 0 {
        return Err(NpuError::usage(format!(
            "window offset {offset} not aligned to {page}"
        )));
    }
    let total: usize = segments.iter().map(|s| s.len).sum();
    let end = offset
        .checked_add(size)
        .filter(|&end| end <= total)
        .ok_or_else(|| {
            NpuError::usage(format!(
                "window [{offset}, +{size}) exceeds buffer of {total} bytes"
            ))
        })?;

    let mut clipped = Vec::new();
    let mut seg_start = 0usize;
    for seg in segments {
        let seg_end = seg_start + seg.len;
        let lo = offset.max(seg_start);
        let hi = end.min(seg_end);
        if lo < hi {
            let piece = Segment {
                phys: seg.phys + (lo - seg_start) as u64,
                len: hi - lo,
            };
            if piece.len % page != 0 {
                return Err(NpuError::usage(format!(
                    "clipped segment of {} bytes is not a page multiple",
                    piece.len
                )));
            }
            clipped.push(piece);
        }
        seg_start = seg_end;
    }
    Ok(clipped)
}

/// Regions of a network, in the order the trusted side expects them
#[derive(Debug, Clone, Copy)]
pub struct NetworkLayout<'a> {
    /// Code buffer runs
    pub code: &'a [RegionEntry],
    /// Page-table runs
    pub page_tables: &'a [RegionEntry],
    /// Pool runs
    pub pool: &'a [RegionEntry],
    /// Profiling trace runs
    pub profile: &'a [RegionEntry],
}

/// Accelerator mode requested at activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpuMode {
    /// Non-secure execution
    NonSecure,
    /// Secure execution
    Secure,
}

impl NpuMode {
    /// Mode for a network with the given secure flag
    pub const fn for_network(secure: bool) -> Self {
        if secure {
            Self::Secure
        } else {
            Self::NonSecure
        }
    }

    /// Wire value
    pub const fn wire(self) -> u64 {
        match self {
            Self::NonSecure => npu_mode::NON_SECURE,
            Self::Secure => npu_mode::SECURE,
        }
    }
}

impl fmt::Display for NpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonSecure => write!(f, "non-secure"),
            Self::Secure => write!(f, "secure"),
        }
    }
}

/// A command for the trusted side
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    /// Load a container into the given regions
    CreateNetwork {
        /// Raw container
        container: &'a [u8],
        /// Network memory
        layout: NetworkLayout<'a>,
    },
    /// Unload a network
    DestroyNetwork {
        /// Trusted network id
        network: u64,
    },
    /// Link a buffer to a network
    AttachIoBuffer {
        /// Trusted buffer id
        buffer: u64,
        /// Trusted network id
        network: u64,
    },
    /// Unlink an attachment
    DetachIoBuffer {
        /// Trusted network id
        network: u64,
        /// Trusted attachment id
        attachment: u64,
    },
    /// Bind an attachment to an input slot
    SetInput {
        /// Trusted network id
        network: u64,
        /// Trusted attachment id
        attachment: u64,
        /// Slot index
        index: u32,
    },
    /// Bind an attachment to an output slot
    SetOutput {
        /// Trusted network id
        network: u64,
        /// Trusted attachment id
        attachment: u64,
        /// Slot index
        index: u32,
    },
    /// Start one execution
    StartNetwork {
        /// Trusted network id
        network: u64,
    },
    /// Register a buffer over physical runs
    CreateIoBufferFromRegions {
        /// Buffer memory
        regions: &'a [RegionEntry],
        /// Memory is secure
        secure: bool,
        /// Buffer size in bytes
        size: u64,
    },
    /// Register a window of a buffer known by memory id
    CreateIoBufferFromMemId {
        /// Memory id of the existing buffer
        mem_id: u64,
        /// Window offset
        offset: u64,
        /// Window size
        size: u64,
    },
    /// Unregister a buffer
    DestroyIoBuffer {
        /// Trusted buffer id
        buffer: u64,
    },
    /// Read and clear the latched interrupt status
    ReadInterruptStatus,
    /// Activate the accelerator
    ActivateNpu {
        /// Requested mode
        mode: NpuMode,
    },
    /// Return the accelerator to idle
    DeactivateNpu,
    /// Dump accelerator state to the trusted log
    DumpState,
}

impl Request<'_> {
    /// Command id
    pub const fn command(&self) -> u32 {
        match self {
            Self::CreateNetwork { .. } => cmd::CREATE_NETWORK,
            Self::DestroyNetwork { .. } => cmd::DESTROY_NETWORK,
            Self::AttachIoBuffer { .. } => cmd::ATTACH_IO_BUFFER,
            Self::DetachIoBuffer { .. } => cmd::DETACH_IO_BUFFER,
            Self::SetInput { .. } => cmd::SET_INPUT,
            Self::SetOutput { .. } => cmd::SET_OUTPUT,
            Self::StartNetwork { .. } => cmd::START_NETWORK,
            Self::CreateIoBufferFromRegions { .. } => cmd::CREATE_IO_BUFFER_FROM_REGIONS,
            Self::CreateIoBufferFromMemId { .. } => cmd::CREATE_IO_BUFFER_FROM_MEM_ID,
            Self::DestroyIoBuffer { .. } => cmd::DESTROY_IO_BUFFER,
            Self::ReadInterruptStatus => cmd::READ_INTERRUPT_STATUS,
            Self::ActivateNpu { .. } => cmd::ACTIVATE_NPU,
            Self::DeactivateNpu => cmd::DEACTIVATE_NPU,
            Self::DumpState => cmd::DUMP_STATE,
        }
    }
}

/// Result of a successful command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Command has no output
    Done,
    /// New trusted network id
    Network(u64),
    /// New trusted attachment id
    Attachment(u64),
    /// New trusted buffer id and its memory id
    IoBuffer {
        /// Trusted buffer id
        id: u64,
        /// Memory id
        mem_id: u64,
    },
    /// Latched interrupt status
    InterruptStatus(u32),
}

/// One synchronous request/response transport
pub trait TeeChannel: Send {
    /// Establish the session with the trusted side
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be set up.
    fn open(&mut self) -> Result<()>;

    /// Perform one transaction
    ///
    /// # Errors
    ///
    /// Returns a protocol error carrying the trusted side's result code.
    fn transact(&mut self, request: &Request<'_>) -> Result<Response>;

    /// Tear the session down
    fn close(&mut self);
}

/// Lifecycle of the secure session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet opened
    Uninitialized,
    /// Commands accepted
    Open,
    /// Closed for good
    Closed,
}

/// The device's single session with the trusted side
pub struct SecureSession {
    state: SessionState,
    channel: Box<dyn TeeChannel>,
    active_networks: usize,
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("state", &self.state)
            .field("active_networks", &self.active_networks)
            .finish_non_exhaustive()
    }
}

fn unexpected(command: u32, response: Response) -> NpuError {
    error!("{} returned unexpected {:?}", command_name(command), response);
    NpuError::protocol(command, result::COMMUNICATION)
}

impl SecureSession {
    /// Session over `channel`, not yet open
    pub fn new(channel: Box<dyn TeeChannel>) -> Self {
        Self {
            state: SessionState::Uninitialized,
            channel,
            active_networks: 0,
        }
    }

    /// Current state
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Networks created and not yet destroyed on the trusted side
    pub const fn active_networks(&self) -> usize {
        self.active_networks
    }

    /// Open the session
    ///
    /// # Errors
    ///
    /// Returns error if the session is not fresh or the channel fails.
    pub fn open(&mut self) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(NpuError::usage(format!(
                "secure session already {:?}",
                self.state
            )));
        }
        self.channel.open()?;
        self.state = SessionState::Open;
        info!("Secure session open");
        Ok(())
    }

    /// Close the session. Further commands fail with a bad-state error.
    pub fn close(&mut self) {
        if self.state == SessionState::Open {
            if self.active_networks > 0 {
                warn!(
                    "Closing secure session with {} live networks",
                    self.active_networks
                );
            }
            self.channel.close();
            info!("Secure session closed");
        }
        self.state = SessionState::Closed;
    }

    /// Send one request
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the session is not open or the trusted
    /// side rejects the command.
    pub fn call(&mut self, request: &Request<'_>) -> Result<Response> {
        let command = request.command();
        if self.state != SessionState::Open {
            error!(
                "{} issued while secure session is {:?}",
                command_name(command),
                self.state
            );
            return Err(NpuError::protocol(command, result::BAD_STATE));
        }

        debug!("-> {}", command_name(command));
        let response = self.channel.transact(request)?;

        match (command, response) {
            (cmd::CREATE_NETWORK, Response::Network(_)) => self.active_networks += 1,
            (cmd::DESTROY_NETWORK, _) => {
                self.active_networks = self.active_networks.saturating_sub(1);
            }
            _ => {}
        }
        Ok(response)
    }

    fn call_done(&mut self, request: &Request<'_>) -> Result<()> {
        match self.call(request)? {
            Response::Done => Ok(()),
            other => Err(unexpected(request.command(), other)),
        }
    }

    /// Load a container, returning the trusted network id
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the container.
    pub fn create_network(&mut self, container: &[u8], layout: NetworkLayout<'_>) -> Result<u64> {
        let request = Request::CreateNetwork { container, layout };
        match self.call(&request)? {
            Response::Network(id) => Ok(id),
            other => Err(unexpected(request.command(), other)),
        }
    }

    /// Unload a network
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn destroy_network(&mut self, network: u64) -> Result<()> {
        self.call_done(&Request::DestroyNetwork { network })
    }

    /// Link a buffer to a network, returning the trusted attachment id
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn attach(&mut self, buffer: u64, network: u64) -> Result<u64> {
        let request = Request::AttachIoBuffer { buffer, network };
        match self.call(&request)? {
            Response::Attachment(id) => Ok(id),
            other => Err(unexpected(request.command(), other)),
        }
    }

    /// Unlink an attachment
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn detach(&mut self, network: u64, attachment: u64) -> Result<()> {
        self.call_done(&Request::DetachIoBuffer {
            network,
            attachment,
        })
    }

    /// Bind an attachment to input slot `index`
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn set_input(&mut self, network: u64, attachment: u64, index: u32) -> Result<()> {
        self.call_done(&Request::SetInput {
            network,
            attachment,
            index,
        })
    }

    /// Bind an attachment to output slot `index`
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn set_output(&mut self, network: u64, attachment: u64, index: u32) -> Result<()> {
        self.call_done(&Request::SetOutput {
            network,
            attachment,
            index,
        })
    }

    /// Start one execution
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn start_network(&mut self, network: u64) -> Result<()> {
        self.call_done(&Request::StartNetwork { network })
    }

    /// Register a buffer over `regions`, returning its id and memory id
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn buffer_from_regions(
        &mut self,
        regions: &[RegionEntry],
        secure: bool,
        size: u64,
    ) -> Result<(u64, u64)> {
        let request = Request::CreateIoBufferFromRegions {
            regions,
            secure,
            size,
        };
        match self.call(&request)? {
            Response::IoBuffer { id, mem_id } => Ok((id, mem_id)),
            other => Err(unexpected(request.command(), other)),
        }
    }

    /// Register a window of the buffer known as `mem_id`
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn buffer_from_mem_id(&mut self, mem_id: u64, offset: u64, size: u64) -> Result<u64> {
        let request = Request::CreateIoBufferFromMemId {
            mem_id,
            offset,
            size,
        };
        match self.call(&request)? {
            Response::IoBuffer { id, .. } => Ok(id),
            other => Err(unexpected(request.command(), other)),
        }
    }

    /// Unregister a buffer
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn destroy_buffer(&mut self, buffer: u64) -> Result<()> {
        self.call_done(&Request::DestroyIoBuffer { buffer })
    }

    /// Read and clear the interrupt status
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn read_interrupt_status(&mut self) -> Result<u32> {
        let request = Request::ReadInterruptStatus;
        match self.call(&request)? {
            Response::InterruptStatus(status) => Ok(status),
            other => Err(unexpected(request.command(), other)),
        }
    }

    /// Activate the accelerator
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn activate(&mut self, mode: NpuMode) -> Result<()> {
        self.call_done(&Request::ActivateNpu { mode })
    }

    /// Return the accelerator to idle
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn deactivate(&mut self) -> Result<()> {
        self.call_done(&Request::DeactivateNpu)
    }

    /// Ask the trusted side to dump accelerator state
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the command.
    pub fn dump_state(&mut self) -> Result<()> {
        self.call_done(&Request::DumpState)
    }
}

/// True if every run is a non-empty page multiple
pub fn runs_are_valid(runs: &[RegionEntry]) -> bool {
    runs.iter().all(|r| !r.is_empty() && is_page_aligned(r.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const PAGE: usize = PAGE_SIZE;

    fn segs() -> Vec<Segment> {
        vec![
            Segment { phys: 0x10_0000, len: 2 * PAGE },
            Segment { phys: 0x20_0000, len: 3 * PAGE },
            Segment { phys: 0x30_0000, len: PAGE },
        ]
    }

    #[test]
    fn test_clip_whole_and_window() {
        assert_eq!(clip_segments(&segs(), 0, 6 * PAGE, PAGE).unwrap(), segs());

        let clipped = clip_segments(&segs(), PAGE, 3 * PAGE, PAGE).unwrap();
        assert_eq!(
            clipped,
            vec![
                Segment { phys: 0x10_0000 + PAGE as u64, len: PAGE },
                Segment { phys: 0x20_0000, len: 2 * PAGE },
            ]
        );
    }

    #[test]
    fn test_clip_rejections() {
        assert!(clip_segments(&[], 0, PAGE, PAGE).is_err());
        assert!(clip_segments(&segs(), 0, 0, PAGE).is_err());
        assert!(clip_segments(&segs(), 100, PAGE, PAGE).is_err());
        assert!(clip_segments(&segs(), 0, 7 * PAGE, PAGE).is_err());
        assert!(clip_segments(&segs(), PAGE, usize::MAX, PAGE).is_err());
        // Window end inside a page leaves a partial piece
        assert!(clip_segments(&segs(), 0, PAGE + 1, PAGE).is_err());
    }

    #[test]
    fn test_region_entries() {
        let entries = region_entries(&segs());
        assert_eq!(entries[1], RegionEntry { base: 0x20_0000, pages: 3 });
        assert!(runs_are_valid(&entries));
        assert_eq!(std::mem::size_of::<RegionEntry>(), npu_chip::tee::REGION_ENTRY_SIZE);
    }

    /// Channel replaying canned results
    struct Scripted {
        replies: VecDeque<Result<Response>>,
        seen: Vec<u32>,
    }

    impl TeeChannel for Scripted {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn transact(&mut self, request: &Request<'_>) -> Result<Response> {
            self.seen.push(request.command());
            self.replies
                .pop_front()
                .unwrap_or(Err(NpuError::protocol(request.command(), result::GENERIC)))
        }

        fn close(&mut self) {}
    }

    fn session(replies: Vec<Result<Response>>) -> SecureSession {
        SecureSession::new(Box::new(Scripted {
            replies: replies.into(),
            seen: Vec::new(),
        }))
    }

    #[test]
    fn test_commands_rejected_outside_open() {
        let mut s = session(vec![Ok(Response::Done)]);
        let err = s.deactivate().unwrap_err();
        assert_eq!(err.protocol_code(), Some(result::BAD_STATE));

        s.open().unwrap();
        s.deactivate().unwrap();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.deactivate().unwrap_err().protocol_code(), Some(result::BAD_STATE));
    }

    #[test]
    fn test_network_count_tracking() {
        let mut s = session(vec![
            Ok(Response::Network(7)),
            Ok(Response::Network(8)),
            Ok(Response::Done),
        ]);
        s.open().unwrap();
        let layout = NetworkLayout { code: &[], page_tables: &[], pool: &[], profile: &[] };
        assert_eq!(s.create_network(&[], layout).unwrap(), 7);
        assert_eq!(s.create_network(&[], layout).unwrap(), 8);
        assert_eq!(s.active_networks(), 2);
        s.destroy_network(7).unwrap();
        assert_eq!(s.active_networks(), 1);
    }

    #[test]
    fn test_unexpected_response_is_protocol_error() {
        let mut s = session(vec![Ok(Response::Done)]);
        s.open().unwrap();
        let err = s.read_interrupt_status().unwrap_err();
        assert_eq!(err.protocol_code(), Some(result::COMMUNICATION));
    }
}
