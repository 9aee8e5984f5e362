//! Shared-memory transport to the trusted side
//!
//! Each transaction writes a 64-byte [`ParamBlock`] at offset 0 of the
//! non-secure shared region, bulk payloads right after it, and invokes the
//! [`TrustedEndpoint`]. Output parameters are read back from the same block.
//!
//! ```text
//! offset 0            64
//! ┌───────────────────┬───────────────────────────────┐
//! │ p0 p1 p2 p3       │ payload (container, runs)     │
//! └───────────────────┴───────────────────────────────┘
//! ```
//!
//! A memory reference parameter carries `a = offset`, `b = length` into the
//! region the command was invoked with.

use crate::config::DriverConfig;
use crate::error::{NpuError, Result};
use crate::memory::{MemoryKind, MemoryProvider, MemoryRegion};
use crate::protocol::{RegionEntry, Request, Response, TeeChannel};
use bytemuck::{Pod, Zeroable};
use npu_chip::tee::{cmd, command_name, describe, result, PARAM_BLOCK_SIZE, REGION_ENTRY_SIZE};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// One parameter slot
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Param {
    /// First value, or memory reference offset
    pub a: u64,
    /// Second value, or memory reference length
    pub b: u64,
}

impl Param {
    /// Value pair
    pub const fn value(a: u64, b: u64) -> Self {
        Self { a, b }
    }

    /// Memory reference to `[offset, offset + len)` of the invoked region
    pub const fn memref(offset: usize, len: usize) -> Self {
        Self {
            a: offset as u64,
            b: len as u64,
        }
    }
}

/// Fixed parameter block at the start of the shared region
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ParamBlock {
    /// Four parameter slots
    pub params: [Param; 4],
}

impl ParamBlock {
    /// Decode the block at offset 0 of `region`
    ///
    /// # Errors
    ///
    /// Returns error if the region is smaller than a block.
    pub fn read_from(region: &MemoryRegion) -> Result<Self> {
        let raw = region.read_vec(0, PARAM_BLOCK_SIZE)?;
        Ok(bytemuck::pod_read_unaligned(&raw))
    }

    /// Encode the block at offset 0 of `region`
    ///
    /// # Errors
    ///
    /// Returns error if the region is smaller than a block.
    pub fn write_to(&self, region: &MemoryRegion) -> Result<()> {
        region.write(0, bytemuck::bytes_of(self))
    }
}

/// Bytes referenced by memory reference `param`
///
/// # Errors
///
/// Returns error if the reference runs past the region.
pub fn read_memref(region: &MemoryRegion, param: Param) -> Result<Vec<u8>> {
    let offset = usize::try_from(param.a).map_err(|_| NpuError::usage("memref offset overflow"))?;
    let len = usize::try_from(param.b).map_err(|_| NpuError::usage("memref length overflow"))?;
    region.read_vec(offset, len)
}

/// Decode a list of region entries
pub fn decode_entries(raw: &[u8]) -> Vec<RegionEntry> {
    raw.chunks_exact(REGION_ENTRY_SIZE)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

fn pack(lo: usize, hi: usize) -> u64 {
    (lo as u64 & 0xFFFF_FFFF) | ((hi as u64) << 32)
}

/// Unpack two counts from one parameter value
#[allow(clippy::cast_possible_truncation)]
pub const fn unpack(v: u64) -> (usize, usize) {
    ((v & 0xFFFF_FFFF) as usize, (v >> 32) as usize)
}

fn marshal(request: &Request<'_>) -> (ParamBlock, Vec<u8>) {
    let mut block = ParamBlock::default();
    let mut payload = Vec::new();
    let p = &mut block.params;

    match *request {
        Request::CreateNetwork { container, layout } => {
            payload.extend_from_slice(container);
            payload.resize(container.len().next_multiple_of(8), 0);
            let runs_at = PARAM_BLOCK_SIZE + payload.len();
            for part in [layout.code, layout.page_tables, layout.pool, layout.profile] {
                payload.extend_from_slice(bytemuck::cast_slice(part));
            }
            p[0] = Param::memref(PARAM_BLOCK_SIZE, container.len());
            p[1] = Param::memref(runs_at, PARAM_BLOCK_SIZE + payload.len() - runs_at);
            p[2] = Param::value(
                pack(layout.code.len(), layout.page_tables.len()),
                pack(layout.pool.len(), layout.profile.len()),
            );
        }
        Request::DestroyNetwork { network } | Request::StartNetwork { network } => {
            p[0] = Param::value(network, 0);
        }
        Request::AttachIoBuffer { buffer, network } => p[0] = Param::value(buffer, network),
        Request::DetachIoBuffer {
            network,
            attachment,
        } => p[0] = Param::value(network, attachment),
        Request::SetInput {
            network,
            attachment,
            index,
        }
        | Request::SetOutput {
            network,
            attachment,
            index,
        } => {
            p[0] = Param::value(network, attachment);
            p[1] = Param::value(u64::from(index), 0);
        }
        Request::CreateIoBufferFromRegions {
            regions,
            secure,
            size,
        } => {
            payload.extend_from_slice(bytemuck::cast_slice(regions));
            p[0] = Param::memref(PARAM_BLOCK_SIZE, payload.len());
            p[1] = Param::value(u64::from(secure), size);
        }
        Request::CreateIoBufferFromMemId {
            mem_id,
            offset,
            size,
        } => {
            p[0] = Param::value(mem_id, offset);
            p[1] = Param::value(size, 0);
        }
        Request::DestroyIoBuffer { buffer } => p[0] = Param::value(buffer, 0),
        Request::ActivateNpu { mode } => p[0] = Param::value(mode.wire(), 0),
        Request::ReadInterruptStatus | Request::DeactivateNpu | Request::DumpState => {}
    }

    (block, payload)
}

#[allow(clippy::cast_possible_truncation)]
fn unmarshal(request: &Request<'_>, block: &ParamBlock) -> Response {
    let p = &block.params;
    match *request {
        Request::CreateNetwork { .. } => Response::Network(p[3].a),
        Request::AttachIoBuffer { .. } => Response::Attachment(p[1].a),
        Request::CreateIoBufferFromRegions { .. } => Response::IoBuffer {
            id: p[2].a,
            mem_id: p[2].b,
        },
        Request::CreateIoBufferFromMemId { mem_id, .. } => Response::IoBuffer { id: p[2].a, mem_id },
        Request::ReadInterruptStatus => Response::InterruptStatus(p[0].a as u32),
        _ => Response::Done,
    }
}

/// The trusted counterpart of the driver
pub trait TrustedEndpoint: Send + Sync + fmt::Debug {
    /// Open a session with trusted application `app`, returning its id or a
    /// result code
    ///
    /// # Errors
    ///
    /// Returns the trusted side's result code on rejection.
    fn open_session(
        &self,
        app: &[u8; 16],
        shared: &MemoryRegion,
        secure: &MemoryRegion,
    ) -> std::result::Result<u32, u32>;

    /// Execute `command` with the parameter block at the start of `params`,
    /// returning its result code
    fn invoke(&self, session: u32, command: u32, params: &MemoryRegion) -> u32;

    /// Close a session
    fn close_session(&self, session: u32);
}

/// [`TeeChannel`] over a pair of physically contiguous shared regions
pub struct SharedMemoryChannel {
    memory: Arc<dyn MemoryProvider>,
    endpoint: Arc<dyn TrustedEndpoint>,
    app: [u8; 16],
    shared_size: usize,
    secure_size: usize,
    shared: Option<MemoryRegion>,
    secure: Option<MemoryRegion>,
    session: Option<u32>,
}

impl fmt::Debug for SharedMemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryChannel")
            .field("endpoint", &self.endpoint)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl SharedMemoryChannel {
    /// Channel to `endpoint` with regions from `memory`, not yet open
    pub fn new(
        memory: Arc<dyn MemoryProvider>,
        endpoint: Arc<dyn TrustedEndpoint>,
        config: &DriverConfig,
    ) -> Self {
        Self {
            memory,
            endpoint,
            app: config.trusted_app,
            shared_size: config.shared_region_size.max(PARAM_BLOCK_SIZE),
            secure_size: config.secure_region_size,
            shared: None,
            secure: None,
            session: None,
        }
    }

    fn fail(command: u32, code: u32) -> NpuError {
        error!(
            "{} failed: {} ({:#010x})",
            command_name(command),
            describe(code),
            code
        );
        NpuError::protocol(command, code)
    }
}

impl TeeChannel for SharedMemoryChannel {
    fn open(&mut self) -> Result<()> {
        let shared = self.memory.allocate(self.shared_size, MemoryKind::Contiguous)?;
        let secure = self.memory.allocate(self.secure_size, MemoryKind::Contiguous)?;

        let session = self
            .endpoint
            .open_session(&self.app, &shared, &secure)
            .map_err(|code| Self::fail(cmd::OPEN_SESSION, code))?;

        info!(
            "Trusted session {} open (shared {} B, secure {} B)",
            session,
            shared.size(),
            secure.size()
        );
        self.shared = Some(shared);
        self.secure = Some(secure);
        self.session = Some(session);
        Ok(())
    }

    fn transact(&mut self, request: &Request<'_>) -> Result<Response> {
        let command = request.command();
        let (Some(session), Some(shared)) = (self.session, self.shared.as_ref()) else {
            return Err(Self::fail(command, result::BAD_STATE));
        };

        let (block, payload) = marshal(request);
        let needed = PARAM_BLOCK_SIZE + payload.len();

        let oversized;
        let region = if needed <= shared.size() {
            shared
        } else {
            debug!(
                "{} payload of {} B exceeds shared region, using a temporary one",
                command_name(command),
                payload.len()
            );
            oversized = self.memory.allocate(needed, MemoryKind::Contiguous)?;
            &oversized
        };

        block.write_to(region)?;
        region.write(PARAM_BLOCK_SIZE, &payload)?;

        let code = self.endpoint.invoke(session, command, region);
        if code != result::SUCCESS {
            return Err(Self::fail(command, code));
        }

        let out = ParamBlock::read_from(region)?;
        Ok(unmarshal(request, &out))
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.endpoint.close_session(session);
        }
        self.shared = None;
        self.secure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NetworkLayout, NpuMode};

    #[test]
    fn test_param_block_layout() {
        assert_eq!(std::mem::size_of::<ParamBlock>(), PARAM_BLOCK_SIZE);
        let mut block = ParamBlock::default();
        block.params[2] = Param::value(0x0102, 0);
        let bytes = bytemuck::bytes_of(&block);
        assert_eq!(u64::from_ne_bytes(bytes[32..40].try_into().unwrap()), 0x0102);
    }

    #[test]
    fn test_create_network_marshaling() {
        let code = [RegionEntry { base: 0x1000, pages: 1 }];
        let pt = [RegionEntry { base: 0x8000, pages: 2 }];
        let profile = [
            RegionEntry { base: 0xA000, pages: 1 },
            RegionEntry { base: 0xC000, pages: 1 },
        ];
        let container = [7u8; 13];
        let request = Request::CreateNetwork {
            container: &container,
            layout: NetworkLayout {
                code: &code,
                page_tables: &pt,
                pool: &[],
                profile: &profile,
            },
        };

        let (block, payload) = marshal(&request);
        let p = block.params;
        assert_eq!(p[0], Param::memref(64, 13));
        assert_eq!(p[1].a, 64 + 16);
        assert_eq!(p[1].b, 4 * 16);
        assert_eq!(unpack(p[2].a), (1, 1));
        assert_eq!(unpack(p[2].b), (0, 2));

        let runs_at = p[1].a as usize - PARAM_BLOCK_SIZE;
        let runs = decode_entries(&payload[runs_at..]);
        assert_eq!(runs, vec![code[0], pt[0], profile[0], profile[1]]);
    }

    #[test]
    fn test_value_commands() {
        let (block, payload) = marshal(&Request::SetOutput {
            network: 3,
            attachment: 9,
            index: 1,
        });
        assert!(payload.is_empty());
        assert_eq!(block.params[0], Param::value(3, 9));
        assert_eq!(block.params[1].a, 1);

        let (block, _) = marshal(&Request::ActivateNpu { mode: NpuMode::Secure });
        assert_eq!(block.params[0].a, npu_chip::tee::npu_mode::SECURE);
    }

    #[test]
    fn test_unmarshal_outputs() {
        let mut block = ParamBlock::default();
        block.params[2] = Param::value(11, 22);
        let response = unmarshal(
            &Request::CreateIoBufferFromRegions { regions: &[], secure: false, size: 4096 },
            &block,
        );
        assert_eq!(response, Response::IoBuffer { id: 11, mem_id: 22 });

        let response = unmarshal(
            &Request::CreateIoBufferFromMemId { mem_id: 5, offset: 0, size: 4096 },
            &block,
        );
        assert_eq!(response, Response::IoBuffer { id: 11, mem_id: 5 });
    }
}
