//! Client sessions
//!
//! A [`Session`] owns a network namespace and a buffer namespace. Every call
//! takes the session lock, so calls on one session are serialized; calls on
//! different sessions only meet at the device locks.
//!
//! Trusted-side teardown is best-effort: a failing destroy or detach is
//! logged, the host-side record is released anyway and the first failure is
//! returned.

use crate::device::DeviceShared;
use crate::error::{NpuError, Result};
use crate::handle::Handle;
use crate::memory::{aligned_size, ForeignHandle, MemoryKind, MemoryRegion};
use crate::protocol::{clip_segments, region_entries, NetworkLayout};
use crate::registry::{Binding, IoBuffer, Network, NetworkRegions, SessionRegistry};
use crate::report::{BufferInfo, NetworkReport, NetworkStats};
use crate::coordinator::RunReport;
use npu_chip::mmu::PAGE_SIZE;
use npu_models::{Container, ResourceSizer};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One client of the device
pub struct Session {
    id: u64,
    device: Arc<DeviceShared>,
    registry: Mutex<SessionRegistry>,
    closed: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn keep_first(first: &mut Option<NpuError>, what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("{} failed, releasing host state anyway: {}", what, e);
        first.get_or_insert(e);
    }
}

impl Session {
    pub(crate) fn new(id: u64, device: Arc<DeviceShared>) -> Self {
        let registry =
            SessionRegistry::new(device.config.max_networks, device.config.max_buffers);
        Self {
            id,
            device,
            registry: Mutex::new(registry),
            closed: AtomicBool::new(false),
        }
    }

    /// Session id
    pub const fn id(&self) -> u64 {
        self.id
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, SessionRegistry>> {
        let registry = self.registry.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(NpuError::usage(format!("session {} is closed", self.id)));
        }
        Ok(registry)
    }

    fn allocate(&self, size: usize, kind: MemoryKind) -> Result<MemoryRegion> {
        self.device.memory.allocate(size, kind)
    }

    /// Load a container, returning the new network's handle.
    ///
    /// Nothing is left behind on failure: regions are freed and a network
    /// already created on the trusted side is destroyed again.
    ///
    /// # Errors
    ///
    /// Returns error if the container is invalid or cannot be sized, memory
    /// runs out, the trusted side rejects it, or the session is full.
    pub fn create_network(&self, container: &[u8]) -> Result<Handle> {
        let parsed = Container::from_bytes(container)?;
        let resources = ResourceSizer::new(self.device.config.page_table_strategy).size(&parsed)?;

        let mut registry = self.lock_open()?;

        let regions = NetworkRegions {
            code: self.allocate(resources.code_size, MemoryKind::Scattered)?,
            page_tables: self.allocate(resources.page_table_size, MemoryKind::Contiguous)?,
            pool: (resources.pool_size > 0)
                .then(|| self.allocate(resources.pool_size, MemoryKind::Scattered))
                .transpose()?,
            profile: (resources.profile_buffer_size > 0)
                .then(|| self.allocate(resources.profile_buffer_size, MemoryKind::Scattered))
                .transpose()?,
        };
        regions.page_tables.clear()?;
        if let Some(profile) = &regions.profile {
            profile.clear()?;
        }

        let code = region_entries(regions.code.segments());
        let page_tables = region_entries(regions.page_tables.segments());
        let pool = regions
            .pool
            .as_ref()
            .map(|r| region_entries(r.segments()))
            .unwrap_or_default();
        let profile = regions
            .profile
            .as_ref()
            .map(|r| region_entries(r.segments()))
            .unwrap_or_default();

        let trusted_id = self.device.secure.lock().create_network(
            parsed.data(),
            NetworkLayout {
                code: &code,
                page_tables: &page_tables,
                pool: &pool,
                profile: &profile,
            },
        )?;

        let name = parsed.metadata().name();
        let network = Network {
            trusted_id,
            name: name.clone(),
            layers: resources.layers.clone(),
            resources,
            regions,
            attachments: crate::handle::HandleTable::new(),
            stats: NetworkStats::default(),
            input_slots: parsed.metadata().input_count,
            output_slots: parsed.metadata().output_count,
        };

        let handle = match registry.insert_network(network) {
            Ok(handle) => handle,
            Err(network) => {
                drop(registry);
                keep_first(
                    &mut None,
                    "rollback DestroyNetwork",
                    self.device.secure.lock().destroy_network(network.trusted_id),
                );
                return Err(NpuError::resource(format!(
                    "session {} holds its limit of {} networks",
                    self.id, self.device.config.max_networks
                )));
            }
        };
        drop(registry);

        self.device.global.lock().stats.networks_created += 1;
        info!(
            "Session {}: network '{}' created ({}, trusted id {})",
            self.id, name, handle, trusted_id
        );
        Ok(handle)
    }

    fn destroy_network_locked(&self, registry: &mut SessionRegistry, handle: Handle) -> Result<()> {
        let net = registry.network(handle)?;
        let network = net.trusted_id;
        let attachments: Vec<u64> = net.attachments.iter().map(|(_, a)| a.trusted_id).collect();

        let mut first = None;
        {
            // Never tear a network down under a running execution
            let _hw = self.device.hw.lock();
            let mut secure = self.device.secure.lock();
            for attachment in attachments {
                keep_first(&mut first, "DetachIoBuffer", secure.detach(network, attachment));
            }
            keep_first(&mut first, "DestroyNetwork", secure.destroy_network(network));
        }

        let released = registry.release_network(handle)?;
        debug!("Session {}: network '{}' destroyed", self.id, released.name);
        first.map_or(Ok(()), Err)
    }

    /// Destroy a network and every attachment it holds. Attached buffers
    /// stay alive with one reference less each.
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale, or the first trusted-side
    /// failure; the network is released either way.
    pub fn destroy_network(&self, network: Handle) -> Result<()> {
        let mut registry = self.lock_open()?;
        self.destroy_network_locked(&mut registry, network)
    }

    fn commit_buffer(
        &self,
        mut registry: MutexGuard<'_, SessionRegistry>,
        buffer: IoBuffer,
    ) -> Result<Handle> {
        let handle = match registry.insert_buffer(buffer) {
            Ok(handle) => handle,
            Err(buffer) => {
                drop(registry);
                keep_first(
                    &mut None,
                    "rollback DestroyIoBuffer",
                    self.device.secure.lock().destroy_buffer(buffer.trusted_id),
                );
                return Err(NpuError::resource(format!(
                    "session {} holds its limit of {} buffers",
                    self.id, self.device.config.max_buffers
                )));
            }
        };
        drop(registry);

        self.device.global.lock().stats.buffers_created += 1;
        debug!("Session {}: I/O buffer {} created", self.id, handle);
        Ok(handle)
    }

    fn register_region(
        &self,
        registry: MutexGuard<'_, SessionRegistry>,
        region: MemoryRegion,
        offset: usize,
        size: usize,
        secure: bool,
    ) -> Result<Handle> {
        let runs = region_entries(&clip_segments(region.segments(), offset, size, PAGE_SIZE)?);
        let (trusted_id, mem_id) =
            self.device
                .secure
                .lock()
                .buffer_from_regions(&runs, secure, size as u64)?;

        self.commit_buffer(
            registry,
            IoBuffer {
                trusted_id,
                mem_id,
                size,
                secure,
                region: Some(region),
                window_offset: offset,
                ref_count: 0,
            },
        )
    }

    /// Allocate a fresh I/O buffer of at least `size` bytes
    ///
    /// # Errors
    ///
    /// Returns error if `size` is zero, memory runs out or the trusted side
    /// rejects the buffer.
    pub fn allocate_buffer(&self, size: usize, secure: bool) -> Result<Handle> {
        let aligned = aligned_size(size)?;
        let registry = self.lock_open()?;
        let region = self.allocate(aligned, MemoryKind::Scattered)?;
        self.register_region(registry, region, 0, aligned, secure)
    }

    /// Create an I/O buffer over the window `[offset, offset + size)` of
    /// foreign memory
    ///
    /// # Errors
    ///
    /// Returns error if the handle cannot be imported, the window is not
    /// page aligned or exceeds the memory, or the trusted side rejects it.
    pub fn import_buffer(
        &self,
        foreign: ForeignHandle,
        offset: usize,
        size: usize,
        secure: bool,
    ) -> Result<Handle> {
        let registry = self.lock_open()?;
        let region = self.device.memory.import(foreign)?;
        self.register_region(registry, region, offset, size, secure)
    }

    /// Create an I/O buffer over a window of a buffer known by memory id,
    /// possibly owned by another session. The buffer has no host mapping.
    ///
    /// # Errors
    ///
    /// Returns error if `size` is zero or the trusted side rejects the id or
    /// window.
    pub fn buffer_from_mem_id(&self, mem_id: u64, offset: usize, size: usize) -> Result<Handle> {
        if size == 0 {
            return Err(NpuError::usage("zero-sized buffer window"));
        }
        let registry = self.lock_open()?;
        let trusted_id = self.device.secure.lock().buffer_from_mem_id(
            mem_id,
            offset as u64,
            size as u64,
        )?;

        self.commit_buffer(
            registry,
            IoBuffer {
                trusted_id,
                mem_id,
                size,
                secure: false,
                region: None,
                window_offset: 0,
                ref_count: 0,
            },
        )
    }

    fn host_window<'r>(
        registry: &'r SessionRegistry,
        buffer: Handle,
        offset: usize,
        len: usize,
    ) -> Result<(&'r MemoryRegion, usize)> {
        let buf = registry.buffer(buffer)?;
        if buf.secure {
            return Err(NpuError::usage(format!(
                "I/O buffer {buffer} is secure and not host accessible"
            )));
        }
        let Some(region) = buf.region.as_ref() else {
            return Err(NpuError::usage(format!(
                "I/O buffer {buffer} has no host mapping"
            )));
        };
        match offset.checked_add(len) {
            Some(end) if end <= buf.size => Ok((region, buf.window_offset + offset)),
            _ => Err(NpuError::usage(format!(
                "access of {len} bytes at {offset} exceeds I/O buffer of {} bytes",
                buf.size
            ))),
        }
    }

    /// Copy `data` into a buffer at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is stale, secure, unmapped or too small.
    pub fn write_buffer(&self, buffer: Handle, offset: usize, data: &[u8]) -> Result<()> {
        let registry = self.lock_open()?;
        let (region, at) = Self::host_window(&registry, buffer, offset, data.len())?;
        region.write(at, data)
    }

    /// Copy `len` bytes out of a buffer at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is stale, secure, unmapped or too small.
    pub fn read_buffer(&self, buffer: Handle, offset: usize, len: usize) -> Result<Vec<u8>> {
        let registry = self.lock_open()?;
        let (region, at) = Self::host_window(&registry, buffer, offset, len)?;
        region.read_vec(at, len)
    }

    fn destroy_buffer_locked(&self, registry: &mut SessionRegistry, handle: Handle) -> Result<()> {
        let buf = registry.buffer(handle)?;
        if buf.ref_count > 0 {
            return Err(NpuError::usage(format!(
                "I/O buffer {handle} still has {} attachments",
                buf.ref_count
            )));
        }

        let mut first = None;
        keep_first(
            &mut first,
            "DestroyIoBuffer",
            self.device.secure.lock().destroy_buffer(buf.trusted_id),
        );
        registry.release_buffer(handle)?;
        first.map_or(Ok(()), Err)
    }

    /// Destroy an I/O buffer no network is attached to
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale or the buffer is still attached,
    /// or the trusted-side failure; an unattached buffer is released either
    /// way.
    pub fn destroy_buffer(&self, buffer: Handle) -> Result<()> {
        let mut registry = self.lock_open()?;
        self.destroy_buffer_locked(&mut registry, buffer)
    }

    /// Attach a buffer to a network
    ///
    /// # Errors
    ///
    /// Returns error if either handle is stale or the trusted side rejects
    /// the attachment.
    pub fn attach(&self, network: Handle, buffer: Handle) -> Result<Handle> {
        let mut registry = self.lock_open()?;
        let net_id = registry.network(network)?.trusted_id;
        let buf_id = registry.buffer(buffer)?.trusted_id;

        let trusted_id = self.device.secure.lock().attach(buf_id, net_id)?;
        let attachment = registry.attach(network, buffer, trusted_id)?;
        debug!(
            "Session {}: buffer {} attached to network {} as {}",
            self.id, buffer, network, attachment
        );
        Ok(attachment)
    }

    /// Detach an attachment from its network
    ///
    /// # Errors
    ///
    /// Returns error if either handle is stale, or the trusted-side failure;
    /// the attachment is released either way.
    pub fn detach(&self, network: Handle, attachment: Handle) -> Result<()> {
        let mut registry = self.lock_open()?;
        let net_id = registry.network(network)?.trusted_id;
        let att_id = registry.attachment(network, attachment)?.trusted_id;

        let mut first = None;
        keep_first(
            &mut first,
            "DetachIoBuffer",
            self.device.secure.lock().detach(net_id, att_id),
        );
        registry.detach(network, attachment)?;
        first.map_or(Ok(()), Err)
    }

    fn bind(&self, network: Handle, attachment: Handle, binding: Binding) -> Result<()> {
        let mut registry = self.lock_open()?;
        let net = registry.network(network)?;
        let (index, slots) = match binding {
            Binding::Input(i) => (i, net.input_slots),
            Binding::Output(i) => (i, net.output_slots),
        };
        if index >= slots {
            return Err(NpuError::usage(format!(
                "slot {index} out of range, network '{}' declares {slots} ({binding:?})",
                net.name
            )));
        }
        let net_id = net.trusted_id;
        let att_id = registry.attachment(network, attachment)?.trusted_id;

        {
            let mut secure = self.device.secure.lock();
            match binding {
                Binding::Input(i) => secure.set_input(net_id, att_id, i)?,
                Binding::Output(i) => secure.set_output(net_id, att_id, i)?,
            }
        }
        registry.bind(network, attachment, binding)
    }

    /// Bind an attachment to input slot `index`
    ///
    /// # Errors
    ///
    /// Returns error if a handle is stale, `index` is not below the declared
    /// input count, or the trusted side rejects the binding.
    pub fn set_input(&self, network: Handle, attachment: Handle, index: u32) -> Result<()> {
        self.bind(network, attachment, Binding::Input(index))
    }

    /// Bind an attachment to output slot `index`
    ///
    /// # Errors
    ///
    /// Returns error if a handle is stale, `index` is not below the declared
    /// output count, or the trusted side rejects the binding.
    pub fn set_output(&self, network: Handle, attachment: Handle, index: u32) -> Result<()> {
        self.bind(network, attachment, Binding::Output(index))
    }

    /// Run a network once, blocking until it completes, faults or times out.
    ///
    /// Network and device counters are updated exactly once per call that
    /// reaches the hardware.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if another session holds the reservation, a protocol
    /// error if the trusted side refuses to start, or the hardware fault.
    pub fn run(&self, network: Handle) -> Result<RunReport> {
        {
            let global = self.device.global.lock();
            if let Some(holder) = global.reservation.filter(|&h| h != self.id) {
                debug!("Session {}: NPU reserved by session {}", self.id, holder);
                return Err(NpuError::Busy { holder });
            }
        }

        let mut registry = self.lock_open()?;
        let net = registry.network_mut(network)?;

        let outcome = self.device.coordinator().execute(net);
        net.stats.record(&outcome);
        drop(registry);

        self.device.global.lock().stats.record(&outcome);
        outcome
    }

    /// Reserve the accelerator for this session. Re-reserving is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if another session holds the reservation.
    pub fn reserve(&self) -> Result<()> {
        let mut global = self.device.global.lock();
        match global.reservation {
            Some(holder) if holder != self.id => Err(NpuError::Busy { holder }),
            _ => {
                global.reservation = Some(self.id);
                info!("Session {} reserved the NPU", self.id);
                Ok(())
            }
        }
    }

    /// Release this session's reservation
    ///
    /// # Errors
    ///
    /// Returns error if this session does not hold the reservation.
    pub fn release_reservation(&self) -> Result<()> {
        let mut global = self.device.global.lock();
        if global.reservation == Some(self.id) {
            global.reservation = None;
            info!("Session {} released the NPU", self.id);
            Ok(())
        } else {
            Err(NpuError::usage(format!(
                "session {} does not hold the reservation",
                self.id
            )))
        }
    }

    /// Statistics and profile of a network
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale.
    pub fn network_report(&self, network: Handle) -> Result<NetworkReport> {
        let registry = self.registry.lock();
        let net = registry.network(network)?;
        Ok(NetworkReport {
            name: net.name.clone(),
            secure: net.resources.secure,
            code_size: net.resources.code_size,
            pool_size: net.resources.pool_size,
            page_table_size: net.resources.page_table_size,
            input_slots: net.input_slots,
            output_slots: net.output_slots,
            stats: net.stats.clone(),
            layers: net.layers.clone(),
        })
    }

    /// State of an I/O buffer
    ///
    /// # Errors
    ///
    /// Returns error if the handle is stale.
    pub fn buffer_info(&self, buffer: Handle) -> Result<BufferInfo> {
        let registry = self.registry.lock();
        let buf = registry.buffer(buffer)?;
        Ok(BufferInfo {
            size: buf.size,
            secure: buf.secure,
            mem_id: buf.mem_id,
            ref_count: buf.ref_count,
            host_mapped: buf.region.is_some() && !buf.secure,
        })
    }

    /// Live network handles
    pub fn networks(&self) -> Vec<Handle> {
        self.registry.lock().network_handles()
    }

    /// Live buffer handles
    pub fn buffers(&self) -> Vec<Handle> {
        self.registry.lock().buffer_handles()
    }

    fn teardown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut global = self.device.global.lock();
            global.sessions.remove(&self.id);
            if global.reservation == Some(self.id) {
                global.reservation = None;
            }
        }

        let mut first = None;
        {
            let mut registry = self.registry.lock();
            let (networks, buffers) = (registry.network_count(), registry.buffer_count());
            if networks + buffers > 0 {
                debug!(
                    "Session {}: releasing {} networks, {} buffers",
                    self.id, networks, buffers
                );
            }
            for handle in registry.network_handles() {
                if let Err(e) = self.destroy_network_locked(&mut registry, handle) {
                    first.get_or_insert(e);
                }
            }
            for handle in registry.buffer_handles() {
                if let Err(e) = self.destroy_buffer_locked(&mut registry, handle) {
                    first.get_or_insert(e);
                }
            }
        }

        self.device.power_down_if_idle();
        info!("Session {} closed", self.id);
        first.map_or(Ok(()), Err)
    }

    /// End the session, destroying its networks and then its buffers
    ///
    /// # Errors
    ///
    /// Returns the first trusted-side failure; everything is released
    /// regardless.
    pub fn close(self) -> Result<()> {
        self.teardown()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Session {} teardown: {}", self.id, e);
        }
    }
}
