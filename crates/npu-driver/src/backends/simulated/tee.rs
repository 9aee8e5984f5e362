// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated trusted application
//!
//! Implements the trusted side of the command set over [`SystemMemory`]:
//! it re-validates containers, keeps its own network, attachment and buffer
//! tables, and plays the accelerator. A started network completes on a
//! background thread after the configured latency by latching a status word
//! and raising the platform interrupt.
//!
//! A deactivation bumps the run epoch; completions of an older epoch are
//! dropped, so a late interrupt can never complete a later run.

use super::memory::SystemMemory;
use super::platform::SimulatedPlatform;
use crate::channel::{decode_entries, read_memref, unpack, Param, ParamBlock, TrustedEndpoint};
use crate::memory::MemoryRegion;
use crate::protocol::{runs_are_valid, RegionEntry};
use npu_chip::irq;
use npu_chip::tee::{cmd, command_name, npu_mode, result, TRUSTED_APP_UUID};
use npu_models::{Container, OpTrace};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the accelerator does with the next started network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunOutcome {
    /// Signal completion
    #[default]
    Complete,
    /// Signal a bus error
    BusError,
    /// Signal an MMU exception
    MmuException,
    /// Raise the interrupt with an empty status
    Spurious,
    /// Never signal
    Hang,
}

impl RunOutcome {
    const fn status(self) -> Option<u32> {
        match self {
            Self::Complete => Some(irq::DONE),
            Self::BusError => Some(irq::BUS_ERROR),
            Self::MmuException => Some(irq::MMU_EXCEPTION),
            Self::Spurious => Some(0),
            Self::Hang => None,
        }
    }
}

/// Trusted-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeeCounters {
    /// Successful ActivateNpu commands
    pub activations: u64,
    /// DeactivateNpu commands
    pub deactivations: u64,
    /// DumpState commands
    pub dumps: u64,
    /// Networks started
    pub starts: u64,
    /// Starts while another execution was in flight
    pub overlaps: u64,
    /// Highest number of executions in flight at once
    pub max_concurrent: u64,
}

#[derive(Debug)]
struct SimNetwork {
    secure: bool,
    inputs: u32,
    outputs: u32,
    op_sizes: Vec<u32>,
    profile: Option<Vec<RegionEntry>>,
    attachments: BTreeMap<u64, u64>,
    bound_inputs: BTreeMap<u32, u64>,
    bound_outputs: BTreeMap<u32, u64>,
}

#[derive(Debug)]
struct SimBuffer {
    mem_id: u64,
    size: u64,
    window: bool,
    attached: usize,
}

#[derive(Debug, Default)]
struct TeeState {
    sessions: BTreeSet<u32>,
    next_session: u32,
    networks: HashMap<u64, SimNetwork>,
    buffers: HashMap<u64, SimBuffer>,
    next_id: u64,
    next_mem_id: u64,
    mode: Option<u64>,
    epoch: u64,
    latched: u32,
    running: u64,
    outcome: RunOutcome,
    scripted: VecDeque<RunOutcome>,
    failures: HashMap<u32, u32>,
    counters: TeeCounters,
}

impl TeeState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug)]
struct TeeInner {
    memory: Arc<SystemMemory>,
    platform: Arc<SimulatedPlatform>,
    target_id: u32,
    latency: Duration,
    reject_signatures: bool,
    state: Mutex<TeeState>,
}

/// Trusted endpoint backed by the simulator
#[derive(Debug, Clone)]
pub struct SimulatedTee {
    inner: Arc<TeeInner>,
}

type Outcome = std::result::Result<(), u32>;

impl SimulatedTee {
    /// Trusted side for accelerator `target_id` over `memory`, completing
    /// runs after `latency` through `platform`
    pub fn new(
        memory: Arc<SystemMemory>,
        platform: Arc<SimulatedPlatform>,
        target_id: u32,
        latency: Duration,
        reject_signatures: bool,
    ) -> Self {
        Self {
            inner: Arc::new(TeeInner {
                memory,
                platform,
                target_id,
                latency,
                reject_signatures,
                state: Mutex::new(TeeState {
                    next_mem_id: 0x1000,
                    ..TeeState::default()
                }),
            }),
        }
    }

    /// Outcome of every run not covered by a scripted outcome
    pub fn set_outcome(&self, outcome: RunOutcome) {
        self.inner.state.lock().outcome = outcome;
    }

    /// Queue outcomes for the next runs, in order
    pub fn script(&self, outcomes: impl IntoIterator<Item = RunOutcome>) {
        self.inner.state.lock().scripted.extend(outcomes);
    }

    /// Fail the next `command` with result `code`
    pub fn fail_next(&self, command: u32, code: u32) {
        self.inner.state.lock().failures.insert(command, code);
    }

    /// Counter snapshot
    pub fn counters(&self) -> TeeCounters {
        self.inner.state.lock().counters
    }

    /// Networks currently loaded
    pub fn live_networks(&self) -> usize {
        self.inner.state.lock().networks.len()
    }

    /// Buffers currently registered
    pub fn live_buffers(&self) -> usize {
        self.inner.state.lock().buffers.len()
    }

    /// Activation mode, `None` while idle
    pub fn mode(&self) -> Option<u64> {
        self.inner.state.lock().mode
    }

    /// Attachments of a network bound to its input and output slots
    pub fn bindings(&self, network: u64) -> Option<(Vec<u64>, Vec<u64>)> {
        let state = self.inner.state.lock();
        let net = state.networks.get(&network)?;
        Some((
            net.bound_inputs.values().copied().collect(),
            net.bound_outputs.values().copied().collect(),
        ))
    }
}

fn valid_runs(memory: &SystemMemory, runs: &[RegionEntry]) -> bool {
    runs_are_valid(runs) && runs.iter().all(|r| memory.contains(r.base, r.len()))
}

fn runs_len(runs: &[RegionEntry]) -> usize {
    runs.iter().map(RegionEntry::len).sum()
}

/// Scatter `data` across `runs`
fn write_runs(memory: &SystemMemory, runs: &[RegionEntry], data: &[u8]) -> Outcome {
    let mut at = 0;
    for run in runs {
        if at == data.len() {
            break;
        }
        let n = run.len().min(data.len() - at);
        memory
            .write_phys(run.base, &data[at..at + n])
            .map_err(|_| result::BAD_PARAMETERS)?;
        at += n;
    }
    if at == data.len() {
        Ok(())
    } else {
        Err(result::SHORT_BUFFER)
    }
}

fn usize_of(v: u64) -> std::result::Result<usize, u32> {
    usize::try_from(v).map_err(|_| result::BAD_PARAMETERS)
}

impl TeeInner {
    fn create_network(&self, st: &mut TeeState, params: &MemoryRegion, p: &mut [Param; 4]) -> Outcome {
        let raw = read_memref(params, p[0]).map_err(|_| result::BAD_PARAMETERS)?;
        let runs = decode_entries(&read_memref(params, p[1]).map_err(|_| result::BAD_PARAMETERS)?);
        let (code_n, pt_n) = unpack(p[2].a);
        let (pool_n, prof_n) = unpack(p[2].b);
        if code_n + pt_n + pool_n + prof_n != runs.len() || !valid_runs(&self.memory, &runs) {
            return Err(result::BAD_PARAMETERS);
        }
        let (code, rest) = runs.split_at(code_n);
        let (page_tables, rest) = rest.split_at(pt_n);
        let profile = &rest[pool_n..];
        if code.is_empty() || page_tables.is_empty() {
            return Err(result::BAD_PARAMETERS);
        }

        let container = Container::from_bytes(&raw).map_err(|_| result::BAD_FORMAT)?;
        let target = container.metadata().target_id;
        if target != self.target_id {
            warn!(
                "TA: container '{}' built for target {}, accelerator is {}",
                container.metadata().name(),
                target,
                self.target_id
            );
            return Err(result::BAD_FORMAT);
        }
        if container.is_secure() && self.reject_signatures {
            warn!("TA: signature of '{}' rejected", container.metadata().name());
            return Err(result::SECURITY);
        }
        write_runs(&self.memory, code, container.code())?;

        let op_sizes: Vec<u32> = container
            .aux()
            .map(|aux| aux.operations.iter().map(|op| op.size).collect())
            .unwrap_or_default();
        let profile = if container.is_profiling() {
            if runs_len(profile) < op_sizes.len() * npu_chip::container::OP_TRACE_RECORD_SIZE {
                return Err(result::SHORT_BUFFER);
            }
            Some(profile.to_vec())
        } else {
            None
        };

        let id = st.alloc_id();
        st.networks.insert(
            id,
            SimNetwork {
                secure: container.is_secure(),
                inputs: container.metadata().input_count,
                outputs: container.metadata().output_count,
                op_sizes,
                profile,
                attachments: BTreeMap::new(),
                bound_inputs: BTreeMap::new(),
                bound_outputs: BTreeMap::new(),
            },
        );
        debug!("TA: network {} loaded ('{}')", id, container.metadata().name());
        p[3] = Param::value(id, 0);
        Ok(())
    }

    fn bind(st: &mut TeeState, p: &[Param; 4], input: bool) -> Outcome {
        let index = u32::try_from(p[1].a).map_err(|_| result::BAD_PARAMETERS)?;
        let net = st.networks.get_mut(&p[0].a).ok_or(result::ITEM_NOT_FOUND)?;
        if !net.attachments.contains_key(&p[0].b) {
            return Err(result::ITEM_NOT_FOUND);
        }
        let (slots, bound) = if input {
            (net.inputs, &mut net.bound_inputs)
        } else {
            (net.outputs, &mut net.bound_outputs)
        };
        if index >= slots {
            return Err(result::BAD_PARAMETERS);
        }
        bound.insert(index, p[0].b);
        Ok(())
    }

    fn detach(st: &mut TeeState, network: u64, attachment: u64) -> Outcome {
        let net = st.networks.get_mut(&network).ok_or(result::ITEM_NOT_FOUND)?;
        let buffer = net.attachments.remove(&attachment).ok_or(result::ITEM_NOT_FOUND)?;
        net.bound_inputs.retain(|_, a| *a != attachment);
        net.bound_outputs.retain(|_, a| *a != attachment);
        if let Some(buf) = st.buffers.get_mut(&buffer) {
            buf.attached = buf.attached.saturating_sub(1);
        }
        Ok(())
    }

    fn start_network(self: &Arc<Self>, st: &mut TeeState, network: u64) -> Outcome {
        let Some(mode) = st.mode else {
            return Err(result::BAD_STATE);
        };
        let net = st.networks.get(&network).ok_or(result::ITEM_NOT_FOUND)?;
        if net.secure && mode != npu_mode::SECURE {
            return Err(result::ACCESS_DENIED);
        }

        let outcome = st.scripted.pop_front().unwrap_or(st.outcome);
        if outcome == RunOutcome::Complete {
            if let Some(runs) = &net.profile {
                let trace: Vec<u8> = net
                    .op_sizes
                    .iter()
                    .zip(1u64..)
                    .flat_map(|(&size, i)| {
                        OpTrace {
                            cycles: 100 * i,
                            time_ns: 1000 * i,
                            bytes_in: size,
                            bytes_out: size / 2,
                        }
                        .to_bytes()
                    })
                    .collect();
                write_runs(&self.memory, runs, &trace)?;
            }
        }

        if st.running > 0 {
            st.counters.overlaps += 1;
        }
        st.running += 1;
        st.counters.max_concurrent = st.counters.max_concurrent.max(st.running);
        st.counters.starts += 1;

        let Some(status) = outcome.status() else {
            debug!("TA: network {} will hang", network);
            return Ok(());
        };
        let epoch = st.epoch;
        let inner = Arc::clone(self);
        thread::spawn(move || {
            thread::sleep(inner.latency);
            {
                let mut st = inner.state.lock();
                if st.epoch != epoch {
                    debug!("TA: dropping completion of a cancelled run");
                    return;
                }
                st.latched = status;
            }
            inner.platform.raise_irq();
        });
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, st: &mut TeeState, command: u32, params: &MemoryRegion) -> Outcome {
        let mut block = ParamBlock::read_from(params).map_err(|_| result::BAD_PARAMETERS)?;
        let p = &mut block.params;

        match command {
            cmd::CREATE_NETWORK => self.create_network(st, params, p)?,
            cmd::DESTROY_NETWORK => {
                let net = st.networks.remove(&p[0].a).ok_or(result::ITEM_NOT_FOUND)?;
                for buffer in net.attachments.values() {
                    if let Some(buf) = st.buffers.get_mut(buffer) {
                        buf.attached = buf.attached.saturating_sub(1);
                    }
                }
            }
            cmd::ATTACH_IO_BUFFER => {
                let (buffer, network) = (p[0].a, p[0].b);
                if !st.buffers.contains_key(&buffer) || !st.networks.contains_key(&network) {
                    return Err(result::ITEM_NOT_FOUND);
                }
                let id = st.alloc_id();
                if let Some(net) = st.networks.get_mut(&network) {
                    net.attachments.insert(id, buffer);
                }
                if let Some(buf) = st.buffers.get_mut(&buffer) {
                    buf.attached += 1;
                }
                p[1] = Param::value(id, 0);
            }
            cmd::DETACH_IO_BUFFER => Self::detach(st, p[0].a, p[0].b)?,
            cmd::SET_INPUT => Self::bind(st, p, true)?,
            cmd::SET_OUTPUT => Self::bind(st, p, false)?,
            cmd::START_NETWORK => self.start_network(st, p[0].a)?,
            cmd::CREATE_IO_BUFFER_FROM_REGIONS => {
                let runs = decode_entries(&read_memref(params, p[0]).map_err(|_| result::BAD_PARAMETERS)?);
                let size = p[1].b;
                if size == 0 || runs.is_empty() || !valid_runs(&self.memory, &runs) {
                    return Err(result::BAD_PARAMETERS);
                }
                if usize_of(size)? > runs_len(&runs) {
                    return Err(result::SHORT_BUFFER);
                }
                let id = st.alloc_id();
                st.next_mem_id += 1;
                let mem_id = st.next_mem_id;
                st.buffers.insert(
                    id,
                    SimBuffer {
                        mem_id,
                        size,
                        window: false,
                        attached: 0,
                    },
                );
                p[2] = Param::value(id, mem_id);
            }
            cmd::CREATE_IO_BUFFER_FROM_MEM_ID => {
                let (mem_id, offset, size) = (p[0].a, p[0].b, p[1].a);
                let source = st
                    .buffers
                    .values()
                    .find(|b| b.mem_id == mem_id && !b.window)
                    .ok_or(result::ITEM_NOT_FOUND)?;
                if size == 0 || offset.checked_add(size).map_or(true, |end| end > source.size) {
                    return Err(result::BAD_PARAMETERS);
                }
                let id = st.alloc_id();
                st.buffers.insert(
                    id,
                    SimBuffer {
                        mem_id,
                        size,
                        window: true,
                        attached: 0,
                    },
                );
                p[2] = Param::value(id, 0);
            }
            cmd::DESTROY_IO_BUFFER => {
                let buf = st.buffers.get(&p[0].a).ok_or(result::ITEM_NOT_FOUND)?;
                if buf.attached > 0 {
                    return Err(result::BUSY);
                }
                st.buffers.remove(&p[0].a);
            }
            cmd::READ_INTERRUPT_STATUS => {
                let status = std::mem::take(&mut st.latched);
                st.running = st.running.saturating_sub(1);
                p[0] = Param::value(u64::from(status), 0);
            }
            cmd::ACTIVATE_NPU => {
                let mode = p[0].a;
                if mode != npu_mode::NON_SECURE && mode != npu_mode::SECURE {
                    return Err(result::BAD_PARAMETERS);
                }
                if st.mode.is_some() {
                    return Err(result::BAD_STATE);
                }
                st.mode = Some(mode);
                st.counters.activations += 1;
            }
            cmd::DEACTIVATE_NPU => {
                st.mode = None;
                st.epoch += 1;
                st.running = 0;
                st.latched = 0;
                st.counters.deactivations += 1;
            }
            cmd::DUMP_STATE => {
                st.counters.dumps += 1;
                info!(
                    "TA state: mode {:?}, {} networks, {} buffers, {} in flight, status {:#010x}",
                    st.mode,
                    st.networks.len(),
                    st.buffers.len(),
                    st.running,
                    st.latched
                );
            }
            _ => return Err(result::NOT_IMPLEMENTED),
        }

        block.write_to(params).map_err(|_| result::SHORT_BUFFER)
    }
}

impl TrustedEndpoint for SimulatedTee {
    fn open_session(
        &self,
        app: &[u8; 16],
        shared: &MemoryRegion,
        secure: &MemoryRegion,
    ) -> std::result::Result<u32, u32> {
        if *app != TRUSTED_APP_UUID {
            return Err(result::ITEM_NOT_FOUND);
        }
        if !shared.is_contiguous() || !secure.is_contiguous() {
            return Err(result::BAD_PARAMETERS);
        }
        let mut st = self.inner.state.lock();
        st.next_session += 1;
        let id = st.next_session;
        st.sessions.insert(id);
        Ok(id)
    }

    fn invoke(&self, session: u32, command: u32, params: &MemoryRegion) -> u32 {
        let mut st = self.inner.state.lock();
        if !st.sessions.contains(&session) {
            return result::BAD_STATE;
        }
        if let Some(code) = st.failures.remove(&command) {
            debug!("TA: injected failure of {}", command_name(command));
            return code;
        }
        match self.inner.dispatch(&mut st, command, params) {
            Ok(()) => result::SUCCESS,
            Err(code) => code,
        }
    }

    fn close_session(&self, session: u32) {
        self.inner.state.lock().sessions.remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, MemoryProvider};
    use npu_chip::mmu::PAGE_SIZE;

    fn tee() -> (SimulatedTee, Arc<SystemMemory>) {
        let memory = Arc::new(SystemMemory::new(1 << 22, 0));
        let tee = SimulatedTee::new(
            Arc::clone(&memory),
            Arc::new(SimulatedPlatform::new()),
            0,
            Duration::from_millis(1),
            false,
        );
        (tee, memory)
    }

    fn call(tee: &SimulatedTee, session: u32, command: u32, region: &MemoryRegion, params: [Param; 4]) -> (u32, ParamBlock) {
        ParamBlock { params }.write_to(region).unwrap();
        let code = tee.invoke(session, command, region);
        (code, ParamBlock::read_from(region).unwrap())
    }

    #[test]
    fn test_unknown_application_refused() {
        let (tee, memory) = tee();
        let shared = memory.allocate(PAGE_SIZE, MemoryKind::Contiguous).unwrap();
        assert_eq!(
            tee.open_session(&[0; 16], &shared, &shared),
            Err(result::ITEM_NOT_FOUND)
        );
        let session = tee.open_session(&TRUSTED_APP_UUID, &shared, &shared).unwrap();
        tee.close_session(session);
        let (code, _) = call(&tee, session, cmd::DUMP_STATE, &shared, [Param::default(); 4]);
        assert_eq!(code, result::BAD_STATE);
    }

    #[test]
    fn test_activation_state_machine() {
        let (tee, memory) = tee();
        let shared = memory.allocate(PAGE_SIZE, MemoryKind::Contiguous).unwrap();
        let s = tee.open_session(&TRUSTED_APP_UUID, &shared, &shared).unwrap();
        let mode = [Param::value(npu_mode::SECURE, 0), Param::default(), Param::default(), Param::default()];

        assert_eq!(call(&tee, s, cmd::ACTIVATE_NPU, &shared, mode).0, result::SUCCESS);
        assert_eq!(tee.mode(), Some(npu_mode::SECURE));
        assert_eq!(call(&tee, s, cmd::ACTIVATE_NPU, &shared, mode).0, result::BAD_STATE);
        assert_eq!(call(&tee, s, cmd::DEACTIVATE_NPU, &shared, mode).0, result::SUCCESS);
        assert_eq!(tee.mode(), None);

        let bad = [Param::value(7, 0), Param::default(), Param::default(), Param::default()];
        assert_eq!(call(&tee, s, cmd::ACTIVATE_NPU, &shared, bad).0, result::BAD_PARAMETERS);
        assert_eq!(call(&tee, s, 99, &shared, bad).0, result::NOT_IMPLEMENTED);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let (tee, memory) = tee();
        let shared = memory.allocate(PAGE_SIZE, MemoryKind::Contiguous).unwrap();
        let s = tee.open_session(&TRUSTED_APP_UUID, &shared, &shared).unwrap();
        tee.fail_next(cmd::DUMP_STATE, result::TARGET_DEAD);
        let none = [Param::default(); 4];
        assert_eq!(call(&tee, s, cmd::DUMP_STATE, &shared, none).0, result::TARGET_DEAD);
        assert_eq!(call(&tee, s, cmd::DUMP_STATE, &shared, none).0, result::SUCCESS);
        assert_eq!(tee.counters().dumps, 1);
    }

    #[test]
    fn test_buffer_registration_and_windows() {
        let (tee, memory) = tee();
        let shared = memory.allocate(PAGE_SIZE, MemoryKind::Contiguous).unwrap();
        let s = tee.open_session(&TRUSTED_APP_UUID, &shared, &shared).unwrap();
        let backing = memory.allocate(PAGE_SIZE, MemoryKind::Contiguous).unwrap();
        let run = RegionEntry::from_segment(&backing.segments()[0]);
        shared.write(64, bytemuck::bytes_of(&run)).unwrap();

        let (code, out) = call(
            &tee,
            s,
            cmd::CREATE_IO_BUFFER_FROM_REGIONS,
            &shared,
            [Param::memref(64, 16), Param::value(0, 4096), Param::default(), Param::default()],
        );
        assert_eq!(code, result::SUCCESS);
        let (buffer, mem_id) = (out.params[2].a, out.params[2].b);

        // a window of the buffer by memory id
        let (code, out) = call(
            &tee,
            s,
            cmd::CREATE_IO_BUFFER_FROM_MEM_ID,
            &shared,
            [Param::value(mem_id, 1024), Param::value(1024, 0), Param::default(), Param::default()],
        );
        assert_eq!(code, result::SUCCESS);
        assert_ne!(out.params[2].a, buffer);
        let (code, _) = call(
            &tee,
            s,
            cmd::CREATE_IO_BUFFER_FROM_MEM_ID,
            &shared,
            [Param::value(mem_id, 4000), Param::value(1024, 0), Param::default(), Param::default()],
        );
        assert_eq!(code, result::BAD_PARAMETERS);
        assert_eq!(tee.live_buffers(), 2);

        // oversized claim over a one-page run
        shared.write(64, bytemuck::bytes_of(&run)).unwrap();
        let (code, _) = call(
            &tee,
            s,
            cmd::CREATE_IO_BUFFER_FROM_REGIONS,
            &shared,
            [Param::memref(64, 16), Param::value(0, 8192), Param::default(), Param::default()],
        );
        assert_eq!(code, result::SHORT_BUFFER);
    }
}
