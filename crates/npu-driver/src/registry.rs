//! Per-session handle registry
//!
//! Host-side records of every Network and IoBuffer a session owns. The
//! registry only keeps books: trusted-side commands are issued by the session
//! before it mutates the registry, and every mutation happens under the
//! session lock.
//!
//! An attachment references its buffer by handle and only ever adjusts the
//! buffer's reference count. A buffer is released only when no attachment
//! references it.

use crate::error::{NpuError, Result};
use crate::handle::{Handle, HandleTable};
use crate::memory::MemoryRegion;
use crate::report::NetworkStats;
use npu_models::{LayerProfile, ResourceDescriptor};

/// Slot an attachment is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Input slot index
    Input(u32),
    /// Output slot index
    Output(u32),
}

/// An IoBuffer linked to a Network
#[derive(Debug)]
pub struct Attachment {
    /// Trusted-side attachment id
    pub trusted_id: u64,
    /// Buffer this attachment references
    pub buffer: Handle,
    /// Slot the attachment is bound to, if any
    pub binding: Option<Binding>,
}

/// Device memory owned by one network
#[derive(Debug)]
pub struct NetworkRegions {
    /// Code buffer
    pub code: MemoryRegion,
    /// Page-table buffer
    pub page_tables: MemoryRegion,
    /// Working pool, absent when the container declares none
    pub pool: Option<MemoryRegion>,
    /// Operation trace buffer, profiling networks only
    pub profile: Option<MemoryRegion>,
}

/// A network loaded on the trusted side
#[derive(Debug)]
pub struct Network {
    /// Trusted-side network id
    pub trusted_id: u64,
    /// Network name from the container
    pub name: String,
    /// Sized resources
    pub resources: ResourceDescriptor,
    /// Owned memory
    pub regions: NetworkRegions,
    /// Attachment namespace
    pub attachments: HandleTable<Attachment>,
    /// Run statistics
    pub stats: NetworkStats,
    /// Per-layer profiling accumulators
    pub layers: Vec<LayerProfile>,
    /// Declared input slots
    pub input_slots: u32,
    /// Declared output slots
    pub output_slots: u32,
}

impl Network {
    /// Attachment bound to `binding`, if any
    pub fn bound(&self, binding: Binding) -> Option<Handle> {
        self.attachments
            .iter()
            .find(|(_, a)| a.binding == Some(binding))
            .map(|(h, _)| h)
    }
}

/// An I/O buffer known to the trusted side
#[derive(Debug)]
pub struct IoBuffer {
    /// Trusted-side buffer id
    pub trusted_id: u64,
    /// Cross-session memory id
    pub mem_id: u64,
    /// Size handed to the trusted side
    pub size: usize,
    /// Buffer lives in secure memory
    pub secure: bool,
    /// Host backing; absent for buffers created from a memory id
    pub region: Option<MemoryRegion>,
    /// Offset of the buffer inside `region`
    pub window_offset: usize,
    /// Live attachments referencing this buffer
    pub ref_count: usize,
}

/// Networks and buffers owned by one session
#[derive(Debug)]
pub struct SessionRegistry {
    networks: HandleTable<Network>,
    buffers: HandleTable<IoBuffer>,
}

impl SessionRegistry {
    /// Empty registry with per-table limits
    pub fn new(max_networks: usize, max_buffers: usize) -> Self {
        Self {
            networks: HandleTable::with_limit(max_networks),
            buffers: HandleTable::with_limit(max_buffers),
        }
    }

    /// Record a network
    ///
    /// # Errors
    ///
    /// Returns the network back if the session holds its limit already.
    pub fn insert_network(&mut self, network: Network) -> std::result::Result<Handle, Network> {
        self.networks.try_insert(network)
    }

    /// Record a buffer
    ///
    /// # Errors
    ///
    /// Returns the buffer back if the session holds its limit already.
    pub fn insert_buffer(&mut self, buffer: IoBuffer) -> std::result::Result<Handle, IoBuffer> {
        self.buffers.try_insert(buffer)
    }

    /// Network named by `handle`
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale.
    pub fn network(&self, handle: Handle) -> Result<&Network> {
        self.networks
            .get(handle)
            .ok_or_else(|| NpuError::not_found("network", handle.as_raw()))
    }

    /// Mutable network named by `handle`
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale.
    pub fn network_mut(&mut self, handle: Handle) -> Result<&mut Network> {
        self.networks
            .get_mut(handle)
            .ok_or_else(|| NpuError::not_found("network", handle.as_raw()))
    }

    /// Buffer named by `handle`
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale.
    pub fn buffer(&self, handle: Handle) -> Result<&IoBuffer> {
        self.buffers
            .get(handle)
            .ok_or_else(|| NpuError::not_found("I/O buffer", handle.as_raw()))
    }

    /// Attachment `attachment` of network `network`
    ///
    /// # Errors
    ///
    /// Returns error if either handle is stale.
    pub fn attachment(&self, network: Handle, attachment: Handle) -> Result<&Attachment> {
        self.network(network)?
            .attachments
            .get(attachment)
            .ok_or_else(|| NpuError::not_found("attachment", attachment.as_raw()))
    }

    /// Record an attachment of `buffer` to `network`
    ///
    /// # Errors
    ///
    /// Returns error if either handle is stale.
    pub fn attach(&mut self, network: Handle, buffer: Handle, trusted_id: u64) -> Result<Handle> {
        let size = self.buffer(buffer)?.size;
        let net = self
            .networks
            .get_mut(network)
            .ok_or_else(|| NpuError::not_found("network", network.as_raw()))?;

        let attachment = net.attachments.insert(Attachment {
            trusted_id,
            buffer,
            binding: None,
        });
        net.stats.attached_buffers += 1;
        net.stats.attached_bytes += size;

        if let Some(buf) = self.buffers.get_mut(buffer) {
            buf.ref_count += 1;
        }
        Ok(attachment)
    }

    /// Bind an attachment to a slot, clearing any previous holder of the slot
    ///
    /// # Errors
    ///
    /// Returns error if either handle is stale.
    pub fn bind(&mut self, network: Handle, attachment: Handle, binding: Binding) -> Result<()> {
        let net = self.network_mut(network)?;
        if !net.attachments.contains(attachment) {
            return Err(NpuError::not_found("attachment", attachment.as_raw()));
        }
        if let Some(previous) = net.bound(binding) {
            if let Some(a) = net.attachments.get_mut(previous) {
                a.binding = None;
            }
        }
        if let Some(a) = net.attachments.get_mut(attachment) {
            a.binding = Some(binding);
        }
        Ok(())
    }

    /// Remove an attachment, decrementing its buffer's reference count
    ///
    /// # Errors
    ///
    /// Returns error if either handle is stale.
    pub fn detach(&mut self, network: Handle, attachment: Handle) -> Result<Attachment> {
        let net = self
            .networks
            .get_mut(network)
            .ok_or_else(|| NpuError::not_found("network", network.as_raw()))?;
        let removed = net
            .attachments
            .remove(attachment)
            .ok_or_else(|| NpuError::not_found("attachment", attachment.as_raw()))?;

        let size = self.buffers.get(removed.buffer).map_or(0, |b| b.size);
        net.stats.attached_buffers = net.stats.attached_buffers.saturating_sub(1);
        net.stats.attached_bytes = net.stats.attached_bytes.saturating_sub(size);

        if let Some(buf) = self.buffers.get_mut(removed.buffer) {
            buf.ref_count = buf.ref_count.saturating_sub(1);
        }
        Ok(removed)
    }

    /// Remove a network, dropping each of its attachments first.
    ///
    /// Referenced buffers only lose a reference; they are never released
    /// here. The network's regions are freed when the returned value drops.
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale.
    pub fn release_network(&mut self, handle: Handle) -> Result<Network> {
        let mut net = self
            .networks
            .remove(handle)
            .ok_or_else(|| NpuError::not_found("network", handle.as_raw()))?;

        for attachment in net.attachments.handles() {
            if let Some(a) = net.attachments.remove(attachment) {
                if let Some(buf) = self.buffers.get_mut(a.buffer) {
                    buf.ref_count = buf.ref_count.saturating_sub(1);
                }
            }
        }
        net.stats.attached_buffers = 0;
        net.stats.attached_bytes = 0;

        tracing::debug!("Released network '{}' ({})", net.name, handle);
        Ok(net)
    }

    /// Remove a buffer no attachment references
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale or the buffer is still attached.
    pub fn release_buffer(&mut self, handle: Handle) -> Result<IoBuffer> {
        let buf = self.buffer(handle)?;
        if buf.ref_count > 0 {
            return Err(NpuError::usage(format!(
                "I/O buffer {handle} still has {} attachments",
                buf.ref_count
            )));
        }
        self.buffers
            .remove(handle)
            .ok_or_else(|| NpuError::not_found("I/O buffer", handle.as_raw()))
    }

    /// Live network handles
    pub fn network_handles(&self) -> Vec<Handle> {
        self.networks.handles()
    }

    /// Live buffer handles
    pub fn buffer_handles(&self) -> Vec<Handle> {
        self.buffers.handles()
    }

    /// Live networks
    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    /// Live buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::SystemMemory;
    use crate::memory::{MemoryKind, MemoryProvider};
    use npu_chip::mmu::PAGE_SIZE;

    fn resources() -> ResourceDescriptor {
        ResourceDescriptor {
            secure: false,
            code_size: PAGE_SIZE,
            pool_size: 0,
            page_tables: 1,
            page_table_size: PAGE_SIZE,
            profiling: false,
            layer_count: 0,
            op_count: 0,
            profile_buffer_size: 0,
            layers: Vec::new(),
            operations: Vec::new(),
        }
    }

    fn network(mem: &SystemMemory, trusted_id: u64) -> Network {
        Network {
            trusted_id,
            name: format!("net{trusted_id}"),
            resources: resources(),
            regions: NetworkRegions {
                code: mem.allocate(PAGE_SIZE, MemoryKind::Scattered).unwrap(),
                page_tables: mem.allocate(PAGE_SIZE, MemoryKind::Contiguous).unwrap(),
                pool: None,
                profile: None,
            },
            attachments: HandleTable::new(),
            stats: NetworkStats::default(),
            layers: Vec::new(),
            input_slots: 2,
            output_slots: 1,
        }
    }

    fn buffer(mem: &SystemMemory, trusted_id: u64) -> IoBuffer {
        IoBuffer {
            trusted_id,
            mem_id: 0x1000 + trusted_id,
            size: PAGE_SIZE,
            secure: false,
            region: Some(mem.allocate(PAGE_SIZE, MemoryKind::Scattered).unwrap()),
            window_offset: 0,
            ref_count: 0,
        }
    }

    #[test]
    fn test_shared_buffer_ref_counting() {
        let mem = SystemMemory::new(1 << 20, 0);
        let mut reg = SessionRegistry::new(4, 4);
        let a = reg.insert_network(network(&mem, 1)).unwrap();
        let b = reg.insert_network(network(&mem, 2)).unwrap();
        let buf = reg.insert_buffer(buffer(&mem, 3)).unwrap();

        reg.attach(a, buf, 10).unwrap();
        reg.attach(b, buf, 11).unwrap();
        assert_eq!(reg.buffer(buf).unwrap().ref_count, 2);
        assert_eq!(reg.network(a).unwrap().stats.attached_bytes, PAGE_SIZE);

        let released = reg.release_network(a).unwrap();
        assert_eq!(released.trusted_id, 1);
        assert_eq!(reg.buffer(buf).unwrap().ref_count, 1);
        assert!(matches!(reg.release_buffer(buf), Err(NpuError::Usage { .. })));

        drop(released);
        assert_eq!(mem.live_bytes(), 5 * PAGE_SIZE - 2 * PAGE_SIZE);

        reg.release_network(b).unwrap();
        reg.release_buffer(buf).unwrap();
        assert_eq!(mem.live_bytes(), 0);
    }

    #[test]
    fn test_binding_moves_between_attachments() {
        let mem = SystemMemory::new(1 << 20, 0);
        let mut reg = SessionRegistry::new(4, 4);
        let net = reg.insert_network(network(&mem, 1)).unwrap();
        let x = reg.insert_buffer(buffer(&mem, 2)).unwrap();
        let y = reg.insert_buffer(buffer(&mem, 3)).unwrap();
        let ax = reg.attach(net, x, 10).unwrap();
        let ay = reg.attach(net, y, 11).unwrap();

        reg.bind(net, ax, Binding::Input(0)).unwrap();
        reg.bind(net, ay, Binding::Input(0)).unwrap();
        let n = reg.network(net).unwrap();
        assert_eq!(n.bound(Binding::Input(0)), Some(ay));
        assert_eq!(reg.attachment(net, ax).unwrap().binding, None);

        let removed = reg.detach(net, ay).unwrap();
        assert_eq!(removed.trusted_id, 11);
        assert_eq!(reg.network(net).unwrap().bound(Binding::Input(0)), None);
        assert_eq!(reg.buffer(y).unwrap().ref_count, 0);
        assert!(reg.detach(net, ay).is_err());
    }

    #[test]
    fn test_stale_handles_and_limits() {
        let mem = SystemMemory::new(1 << 20, 0);
        let mut reg = SessionRegistry::new(1, 1);
        let net = reg.insert_network(network(&mem, 1)).unwrap();
        let rejected = reg.insert_network(network(&mem, 2)).unwrap_err();
        assert_eq!(rejected.trusted_id, 2);

        reg.release_network(net).unwrap();
        assert!(matches!(reg.network(net), Err(NpuError::NotFound { kind: "network", .. })));

        let again = reg.insert_network(network(&mem, 3)).unwrap();
        assert_ne!(again, net);
        assert_eq!(again.index(), net.index());
        assert!(reg.attach(net, again, 0).is_err());
        assert_eq!(reg.network_count(), 1);
    }
}
