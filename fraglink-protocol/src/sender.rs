//! Outbound Fragment Engine
//!
//! Accepts whole packets, serializes them through the loader, and carries
//! each as a registry entry of sized fragments keyed by the packet-id the
//! peer allocates. Fragments are emitted one per entry per outbound poll;
//! selective re-send is driven by peer signalling, and the optional
//! equality-verification loop re-emits fragments until every peer echo
//! matches byte for byte.
//!
//! All mutators serialize on one engine-wide mutex. Finished packet-ids
//! are posted to a separate queue with its own condition variable so a
//! blocked waiter does not hold the main lock.

use crate::fragment::{
    AllocatePacket, MessagePacket, RetrySendPacket, SendCompletePacket, VerifyCompletePacket,
};
use crate::loader::PacketLoader;
use crate::packet::{Packet, PacketError};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Default largest fragment body in bytes.
pub const DEFAULT_SPLIT_SIZE: usize = 496;

/// Sentinel returned by the finished-id accessors when nothing is queued
/// or the engine is closed.
pub const NO_ID: i32 = -1;

/// Failures surfaced out-of-band from the outbound engine.
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("failed to serialize a submitted packet: {0}")]
    Serialize(#[source] PacketError),
}

/// Per-message outbound state.
struct OutboundEntry {
    packet_id: i32,
    fragments: Vec<Vec<u8>>,
    /// Fragment ids not yet acknowledged, in emission order.
    to_resend: Vec<i32>,
    /// Snapshot of `to_resend` the current re-send pass walks.
    resend_current: Vec<i32>,
    /// Emission cursor; -1 queues the re-send acknowledgement marker.
    cursor: i32,
    resending: bool,
    force_stop: bool,
}

impl OutboundEntry {
    fn new(packet_id: i32, message: &[u8], split_size: usize) -> Self {
        let fragments: Vec<Vec<u8>> = message.chunks(split_size).map(<[u8]>::to_vec).collect();
        let to_resend = (0..fragments.len() as i32).collect();
        OutboundEntry {
            packet_id,
            fragments,
            to_resend,
            resend_current: Vec::new(),
            cursor: 0,
            resending: false,
            force_stop: false,
        }
    }

    fn message_for(&self, fragment_id: i32) -> Packet {
        Packet::Message(MessagePacket::new(
            self.packet_id,
            fragment_id,
            self.fragments[fragment_id as usize].clone(),
        ))
    }

    fn enter_resend(&mut self, zero_index: bool) {
        self.cursor = if zero_index { 0 } else { -1 };
        self.resending = true;
        self.resend_current.clear();
        self.resend_current.extend_from_slice(&self.to_resend);
    }

    /// The next packet this entry wants on the wire.
    fn next_packet(&mut self, verify_equality: bool) -> Packet {
        if self.cursor < 0 {
            self.cursor = 0;
            return Packet::RetrySend(RetrySendPacket::new(self.packet_id, true));
        }
        if !self.resending
            && verify_equality
            && self.cursor as usize >= self.fragments.len()
            && !self.force_stop
        {
            self.enter_resend(true);
        }
        if self.resending {
            if verify_equality
                && self.cursor as usize >= self.resend_current.len()
                && !self.force_stop
            {
                self.enter_resend(true);
            }
            if (self.cursor as usize) < self.resend_current.len() {
                let fragment_id = self.resend_current[self.cursor as usize];
                self.cursor += 1;
                return self.message_for(fragment_id);
            }
        } else if (self.cursor as usize) < self.fragments.len() {
            let fragment_id = self.cursor;
            self.cursor += 1;
            return self.message_for(fragment_id);
        }
        if verify_equality && (self.to_resend.is_empty() || self.force_stop) {
            Packet::VerifyComplete(VerifyCompletePacket::new(self.packet_id))
        } else {
            Packet::SendComplete(SendCompletePacket::new(self.packet_id, false))
        }
    }

    /// Feeds a peer packet into the entry; true means the entry is done
    /// and must be removed.
    fn handle(&mut self, packet: &Packet, verify_responses: bool) -> bool {
        match packet {
            Packet::SendStop(_) => {
                self.cursor = self.fragments.len() as i32;
                return true;
            }
            Packet::SendComplete(complete) if complete.is_acknowledgement() => {
                self.cursor = self.fragments.len() as i32;
                return true;
            }
            Packet::MessageResponse(response) => {
                if let Some(fragment_id) = response.fragment_id {
                    if let Some(original) = self.fragments.get(fragment_id as usize) {
                        let echoed = response.payload.as_deref().unwrap_or_default();
                        if !verify_responses || echoed == original.as_slice() {
                            self.to_resend.retain(|&id| id != fragment_id);
                        }
                    }
                }
            }
            Packet::RetrySend(retry) if !retry.is_acknowledgement() => {
                self.enter_resend(false);
            }
            _ => {}
        }
        false
    }
}

struct SenderState {
    input_queue: VecDeque<Packet>,
    allocation_inputs: BTreeMap<uuid::Uuid, Vec<u8>>,
    registry: BTreeMap<i32, OutboundEntry>,
    split_size: usize,
    loader: PacketLoader,
    verify_responses: bool,
    verify_equality: bool,
}

/// Per-message outbound fragment state machine registry.
pub struct FragmentSender {
    state: Mutex<SenderState>,
    finished: Mutex<VecDeque<i32>>,
    finished_cv: Condvar,
    errors: Mutex<VecDeque<SenderError>>,
    closed: AtomicBool,
}

impl FragmentSender {
    pub fn new(loader: PacketLoader) -> Self {
        Self::with_split_size(loader, DEFAULT_SPLIT_SIZE)
    }

    /// # Panics
    /// Panics if `split_size` is 0.
    pub fn with_split_size(loader: PacketLoader, split_size: usize) -> Self {
        assert!(split_size >= 1, "split size is less than 1");
        FragmentSender {
            state: Mutex::new(SenderState {
                input_queue: VecDeque::new(),
                allocation_inputs: BTreeMap::new(),
                registry: BTreeMap::new(),
                split_size,
                loader,
                verify_responses: false,
                verify_equality: false,
            }),
            finished: Mutex::new(VecDeque::new()),
            finished_cv: Condvar::new(),
            errors: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues a packet for fragmentation and transfer. Non-blocking.
    pub fn submit(&self, packet: Packet) {
        self.state.lock().input_queue.push_back(packet);
    }

    /// The packets to transmit now: one `Allocate` per message still
    /// awaiting a packet-id, plus one packet per active registry entry.
    ///
    /// A packet that fails to serialize is dropped from the input queue
    /// and its error queued for [`take_error`](Self::take_error); the
    /// engine stays usable.
    pub fn poll_outbound(&self) -> Vec<Packet> {
        let mut state = self.state.lock();
        let state = &mut *state;
        while let Some(packet) = state.input_queue.pop_front() {
            match state.loader.write_to_vec(&packet, true) {
                Ok(bytes) => {
                    state.allocation_inputs.insert(uuid::Uuid::new_v4(), bytes);
                }
                Err(error) => {
                    tracing::debug!(%error, "dropping unserializable submission");
                    self.errors.lock().push_back(SenderError::Serialize(error));
                }
            }
        }
        let mut out = Vec::new();
        for (allocation_id, bytes) in &state.allocation_inputs {
            let count = bytes.len().div_ceil(state.split_size) as i32;
            out.push(Packet::Allocate(AllocatePacket::new(count, *allocation_id)));
        }
        let verify_equality = state.verify_equality;
        for entry in state.registry.values_mut() {
            out.push(entry.next_packet(verify_equality));
        }
        out
    }

    /// Feeds a peer packet in. Returns whether it was a fragment-protocol
    /// packet addressed to this engine.
    pub fn ingest(&self, packet: &Packet) -> bool {
        if !packet.is_valid() {
            return false;
        }
        let Some(packet_id) = packet.fragment_packet_id() else {
            return false;
        };
        let mut state = self.state.lock();
        if let Packet::Allocation(allocation) = packet {
            if allocation.successful() {
                if let Some(allocation_id) = allocation.allocation_id {
                    if let Some(bytes) = state.allocation_inputs.remove(&allocation_id) {
                        let entry = OutboundEntry::new(packet_id, &bytes, state.split_size);
                        tracing::debug!(
                            packet_id,
                            fragments = entry.fragments.len(),
                            "outbound entry allocated"
                        );
                        state.registry.insert(packet_id, entry);
                        return true;
                    }
                }
            }
            return true;
        }
        let verify_responses = state.verify_responses;
        let remove = state
            .registry
            .get_mut(&packet_id)
            .map(|entry| entry.handle(packet, verify_responses))
            .unwrap_or(false);
        if remove {
            state.registry.remove(&packet_id);
            drop(state);
            tracing::debug!(packet_id, "outbound entry finished");
            let mut finished = self.finished.lock();
            finished.push_back(packet_id);
            self.finished_cv.notify_one();
        }
        true
    }

    /// Removes a registry entry without signalling the peer.
    pub fn delete(&self, packet_id: i32) {
        self.state.lock().registry.remove(&packet_id);
    }

    /// Whether submissions are waiting for their first allocation request.
    pub fn pending_waiting(&self) -> bool {
        !self.state.lock().input_queue.is_empty()
    }

    /// Drops submissions and allocation requests not yet answered.
    pub fn clear_pending(&self) {
        let mut state = self.state.lock();
        state.input_queue.clear();
        state.allocation_inputs.clear();
    }

    /// Drops every active entry. Only sound when done with the engine.
    pub fn clear_registry(&self) {
        self.state.lock().registry.clear();
    }

    pub fn finished_waiting(&self) -> bool {
        !self.finished.lock().is_empty()
    }

    /// Blocks until a message completes, returning its packet-id, or
    /// [`NO_ID`] once the engine is closed.
    pub fn block_on_finished(&self) -> i32 {
        let mut finished = self.finished.lock();
        while finished.is_empty() && !self.closed.load(Ordering::Acquire) {
            self.finished_cv.wait(&mut finished);
        }
        finished.pop_front().unwrap_or(NO_ID)
    }

    /// Non-blocking variant of [`block_on_finished`](Self::block_on_finished).
    pub fn poll_finished(&self) -> i32 {
        self.finished.lock().pop_front().unwrap_or(NO_ID)
    }

    pub fn clear_finished(&self) {
        self.finished.lock().clear();
    }

    /// Drains one out-of-band engine error, if any.
    pub fn take_error(&self) -> Option<SenderError> {
        self.errors.lock().pop_front()
    }

    pub fn split_size(&self) -> usize {
        self.state.lock().split_size
    }

    /// # Panics
    /// Panics if `split_size` is 0.
    pub fn set_split_size(&self, split_size: usize) {
        assert!(split_size >= 1, "split size is less than 1");
        self.state.lock().split_size = split_size;
    }

    pub fn loader(&self) -> PacketLoader {
        self.state.lock().loader.clone()
    }

    pub fn set_loader(&self, loader: PacketLoader) {
        self.state.lock().loader = loader;
    }

    pub fn verify_responses(&self) -> bool {
        self.state.lock().verify_responses
    }

    /// Turning response verification off also turns equality verification
    /// off.
    pub fn set_verify_responses(&self, verify: bool) {
        let mut state = self.state.lock();
        state.verify_responses = verify;
        if !verify {
            state.verify_equality = false;
        }
    }

    pub fn verify_equality(&self) -> bool {
        self.state.lock().verify_equality
    }

    /// Ignored unless response verification is on.
    pub fn set_verify_equality(&self, verify: bool) {
        let mut state = self.state.lock();
        if state.verify_responses {
            state.verify_equality = verify;
        }
    }

    /// Latches the force-stop flag so the equality loop for `packet_id`
    /// completes on its next pass.
    pub fn stop_verification(&self, packet_id: i32) {
        let mut state = self.state.lock();
        if !state.verify_equality {
            return;
        }
        if let Some(entry) = state.registry.get_mut(&packet_id) {
            entry.force_stop = true;
        }
    }

    /// As [`stop_verification`](Self::stop_verification) for every entry.
    pub fn stop_all_verification(&self) {
        let mut state = self.state.lock();
        if !state.verify_equality {
            return;
        }
        for entry in state.registry.values_mut() {
            entry.force_stop = true;
        }
    }

    /// Clears all queues and registries and wakes blocked waiters, which
    /// observe the [`NO_ID`] sentinel.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            state.input_queue.clear();
            state.allocation_inputs.clear();
            state.registry.clear();
        }
        self.finished.lock().clear();
        self.finished_cv.notify_all();
    }
}
