//! Inbound Fragment Engine
//!
//! Creates a registry entry per incoming message when an allocation
//! request arrives for an unknown handle, accumulates fragments in any
//! order, acknowledges each once per receipt, and forces completion or a
//! retry request after a configured run of barren outbound polls. A fully
//! received message is reassembled in fragment-id order and parsed back
//! into a packet through the loader and factory.
//!
//! The packet-id namespace is private to one receiver: ids start at 0 and
//! advance past in-use values; when advancing would overflow, the
//! allocator saturates at the sentinel and answers allocations with
//! success = false.

use crate::factory::PacketFactory;
use crate::fragment::{
    AllocationPacket, MessageResponsePacket, RetrySendPacket, SendCompletePacket, SendStopPacket,
};
use crate::loader::PacketLoader;
use crate::packet::{Packet, PacketError};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// Default barren polls a receiver entry tolerates before forcing
/// completion or a retry request.
pub const DEFAULT_EMPTY_SENDS_UNTIL_FORCED: u32 = 2;

/// Sentinel returned by the finished-id accessors when nothing is queued
/// or the engine is closed.
pub const NO_ID: i32 = -1;

/// Failures surfaced out-of-band from the inbound engine.
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("failed to reassemble message {packet_id}: {source}")]
    Reassemble {
        packet_id: i32,
        #[source]
        source: PacketError,
    },
}

/// Per-message inbound state.
struct InboundEntry {
    packet_id: i32,
    allocation_id: Uuid,
    fragments: Vec<Option<Vec<u8>>>,
    /// Fragment ids still missing.
    ids_to_receive: Vec<i32>,
    /// Fragment ids owed an acknowledgement this cycle.
    ids_to_ack: Vec<i32>,
    cursor: usize,
    consumed: bool,
    sends_till_forced: u32,
    forced_countdown_active: bool,
    verify_received: bool,
}

impl InboundEntry {
    fn new(packet_id: i32, fragment_count: usize, allocation_id: Uuid, sends_till_forced: u32) -> Self {
        InboundEntry {
            packet_id,
            allocation_id,
            fragments: vec![None; fragment_count],
            ids_to_receive: (0..fragment_count as i32).collect(),
            ids_to_ack: Vec::new(),
            cursor: 0,
            consumed: false,
            sends_till_forced,
            forced_countdown_active: false,
            verify_received: false,
        }
    }

    /// The next control packet or acknowledgement this entry wants on the
    /// wire, if any.
    fn next_packet(&mut self, verify_responses: bool, verify_equality: bool) -> Option<Packet> {
        if self.cursor < self.ids_to_ack.len() {
            let fragment_id = self.ids_to_ack[self.cursor];
            self.cursor += 1;
            if self.cursor >= self.ids_to_ack.len() {
                self.ids_to_ack.clear();
                self.cursor = 0;
            }
            let body = if verify_responses {
                self.fragments
                    .get(fragment_id as usize)
                    .and_then(Clone::clone)
            } else {
                None
            };
            return Some(Packet::MessageResponse(MessageResponsePacket::new(
                self.packet_id,
                fragment_id,
                body,
            )));
        }
        if self.forced_countdown_active {
            if self.sends_till_forced > 0 && !(verify_equality && !self.verify_received) {
                self.sends_till_forced -= 1;
            }
        } else {
            self.forced_countdown_active = true;
        }
        if self.sends_till_forced == 0 && !(verify_equality && !self.verify_received) {
            return Some(if self.ids_to_receive.is_empty() {
                Packet::SendComplete(SendCompletePacket::new(self.packet_id, true))
            } else {
                Packet::RetrySend(RetrySendPacket::new(self.packet_id, false))
            });
        }
        None
    }

    /// Feeds a peer packet into the entry.
    fn handle(&mut self, packet: &Packet, empty_sends_until_forced: u32) {
        match packet {
            Packet::SendComplete(complete) if !complete.is_acknowledgement() => {
                self.sends_till_forced = 0;
            }
            Packet::VerifyComplete(_) => {
                self.sends_till_forced = 0;
                self.verify_received = true;
            }
            Packet::RetrySend(retry) if retry.is_acknowledgement() => {
                self.sends_till_forced = empty_sends_until_forced + 1;
            }
            Packet::Message(message) => {
                let (Some(fragment_id), Some(body)) = (message.fragment_id, &message.payload)
                else {
                    return;
                };
                let index = fragment_id as usize;
                if index >= self.fragments.len() {
                    return;
                }
                // A re-received fragment overwrites the stored body but is
                // only owed one acknowledgement per ack cycle.
                self.fragments[index] = Some(body.clone());
                self.ids_to_receive.retain(|&id| id != fragment_id);
                if !self.ids_to_ack.contains(&fragment_id) {
                    self.ids_to_ack.push(fragment_id);
                }
            }
            _ => {}
        }
    }

    /// Reassembles and parses the inner packet once everything arrived,
    /// at most once per entry.
    fn consume(
        &mut self,
        loader: &PacketLoader,
        factory: &PacketFactory,
        verify_equality: bool,
    ) -> Result<Option<Packet>, PacketError> {
        if self.consumed
            || !self.ids_to_receive.is_empty()
            || self.fragments.is_empty()
            || (verify_equality && !self.verify_received)
        {
            return Ok(None);
        }
        self.consumed = true;
        let total: usize = self
            .fragments
            .iter()
            .map(|f| f.as_ref().map_or(0, Vec::len))
            .sum();
        let mut message = Vec::with_capacity(total);
        for fragment in &self.fragments {
            if let Some(body) = fragment {
                message.extend_from_slice(body);
            }
        }
        loader.read_from_slice(&message, factory, None)
    }
}

struct ReceiverState {
    registry: BTreeMap<i32, InboundEntry>,
    allocated: VecDeque<AllocationPacket>,
    force_stop_ids: VecDeque<i32>,
    next_id: i32,
    empty_sends_until_forced: u32,
    loader: PacketLoader,
    factory: PacketFactory,
    verify_responses: bool,
    verify_equality: bool,
}

impl ReceiverState {
    /// Advances the id cursor past in-use values; -1 once the namespace is
    /// exhausted.
    fn allocate_id(&mut self) -> i32 {
        while self.next_id >= 0 && self.registry.contains_key(&self.next_id) {
            self.next_id = self.next_id.checked_add(1).unwrap_or(-1);
        }
        if self.next_id < 0 {
            self.next_id = -1;
        }
        self.next_id
    }
}

/// Per-message inbound fragment state machine registry.
pub struct FragmentReceiver {
    state: Mutex<ReceiverState>,
    output: Mutex<VecDeque<Packet>>,
    output_cv: Condvar,
    finished: Mutex<VecDeque<i32>>,
    finished_cv: Condvar,
    errors: Mutex<VecDeque<ReceiverError>>,
    closed: AtomicBool,
}

impl FragmentReceiver {
    pub fn new(loader: PacketLoader, factory: PacketFactory) -> Self {
        FragmentReceiver {
            state: Mutex::new(ReceiverState {
                registry: BTreeMap::new(),
                allocated: VecDeque::new(),
                force_stop_ids: VecDeque::new(),
                next_id: 0,
                empty_sends_until_forced: DEFAULT_EMPTY_SENDS_UNTIL_FORCED,
                loader,
                factory,
                verify_responses: false,
                verify_equality: false,
            }),
            output: Mutex::new(VecDeque::new()),
            output_cv: Condvar::new(),
            finished: Mutex::new(VecDeque::new()),
            finished_cv: Condvar::new(),
            errors: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether reconstructed packets are ready to take.
    pub fn receive_ready(&self) -> bool {
        !self.output.lock().is_empty()
    }

    /// Takes the next reconstructed packet, blocking until one arrives or
    /// the engine closes (`None`).
    pub fn recv_blocking(&self) -> Option<Packet> {
        let mut output = self.output.lock();
        while output.is_empty() && !self.closed.load(Ordering::Acquire) {
            self.output_cv.wait(&mut output);
        }
        output.pop_front()
    }

    /// Non-blocking variant of [`recv_blocking`](Self::recv_blocking).
    pub fn poll_recv(&self) -> Option<Packet> {
        self.output.lock().pop_front()
    }

    /// The control packets to transmit now: outstanding allocation
    /// answers, one acknowledgement or forced-completion packet per entry,
    /// and any queued stop requests. Completed messages are reassembled as
    /// a side effect and queued for the receive accessors.
    pub fn poll_outbound(&self) -> Vec<Packet> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut out = Vec::new();
        while let Some(allocation) = state.allocated.pop_front() {
            out.push(Packet::Allocation(allocation));
        }
        let verify_responses = state.verify_responses;
        let verify_equality = state.verify_equality;
        let mut removed = Vec::new();
        for (&packet_id, entry) in state.registry.iter_mut() {
            if let Some(packet) = entry.next_packet(verify_responses, verify_equality) {
                let completes = matches!(&packet, Packet::SendComplete(_));
                out.push(packet);
                if completes {
                    removed.push(packet_id);
                }
            }
            match entry.consume(&state.loader, &state.factory, verify_equality) {
                Ok(Some(inner)) => {
                    tracing::debug!(packet_id, "message reassembled");
                    let mut output = self.output.lock();
                    output.push_back(inner);
                    self.output_cv.notify_one();
                }
                Ok(None) => {}
                Err(source) => {
                    tracing::debug!(packet_id, %source, "reassembled message failed to parse");
                    self.errors
                        .lock()
                        .push_back(ReceiverError::Reassemble { packet_id, source });
                }
            }
        }
        for packet_id in removed {
            state.registry.remove(&packet_id);
            tracing::debug!(packet_id, "inbound entry finished");
            let mut finished = self.finished.lock();
            finished.push_back(packet_id);
            self.finished_cv.notify_one();
        }
        while let Some(packet_id) = state.force_stop_ids.pop_front() {
            out.push(Packet::SendStop(SendStopPacket::new(packet_id)));
        }
        out
    }

    /// Feeds a peer packet in: allocation requests for a novel handle
    /// create an entry, fragment packets route to theirs.
    pub fn ingest(&self, packet: &Packet) {
        if !packet.is_valid() {
            return;
        }
        if let Packet::Allocate(allocate) = packet {
            let (Some(fragment_count), Some(allocation_id)) =
                (allocate.fragment_count, allocate.allocation_id)
            else {
                return;
            };
            if fragment_count <= 0 {
                return;
            }
            let mut state = self.state.lock();
            if state
                .registry
                .values()
                .any(|entry| entry.allocation_id == allocation_id)
            {
                return;
            }
            let packet_id = state.allocate_id();
            if packet_id >= 0 {
                let sends_till_forced = state.empty_sends_until_forced + 1;
                state.registry.insert(
                    packet_id,
                    InboundEntry::new(
                        packet_id,
                        fragment_count as usize,
                        allocation_id,
                        sends_till_forced,
                    ),
                );
                tracing::debug!(packet_id, fragment_count, "inbound entry allocated");
                state
                    .allocated
                    .push_back(AllocationPacket::new(packet_id, allocation_id, true));
            } else {
                tracing::debug!("packet-id namespace exhausted, refusing allocation");
                state
                    .allocated
                    .push_back(AllocationPacket::new(0, allocation_id, false));
            }
            return;
        }
        if let Some(packet_id) = packet.fragment_packet_id() {
            let mut state = self.state.lock();
            let empty_sends = state.empty_sends_until_forced;
            if let Some(entry) = state.registry.get_mut(&packet_id) {
                entry.handle(packet, empty_sends);
            }
        }
    }

    /// Drops an entry and schedules a `SendStop` for the peer.
    pub fn delete(&self, packet_id: i32) {
        let mut state = self.state.lock();
        state.force_stop_ids.push_back(packet_id);
        state.registry.remove(&packet_id);
    }

    /// Drops every entry, scheduling a `SendStop` for each. Only sound
    /// when done with the engine.
    pub fn clear_registry(&self) {
        let mut state = self.state.lock();
        let ids: Vec<i32> = state.registry.keys().copied().collect();
        state.force_stop_ids.extend(ids);
        state.registry.clear();
    }

    /// Drops reconstructed packets not yet taken.
    pub fn clear_pending(&self) {
        self.output.lock().clear();
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
    pub fn take_error(&self) -> Option<ReceiverError> {
        self.errors.lock().pop_front()
    }

    pub fn empty_sends_until_forced(&self) -> u32 {
        self.state.lock().empty_sends_until_forced
    }

    /// # Panics
    /// Panics if `count` is 0.
    pub fn set_empty_sends_until_forced(&self, count: u32) {
        assert!(count >= 1, "empty sends until forced is less than 1");
        self.state.lock().empty_sends_until_forced = count;
    }

    pub fn loader(&self) -> PacketLoader {
        self.state.lock().loader.clone()
    }

    pub fn set_loader(&self, loader: PacketLoader) {
        self.state.lock().loader = loader;
    }

    pub fn factory(&self) -> PacketFactory {
        self.state.lock().factory.clone()
    }

    pub fn set_factory(&self, factory: PacketFactory) {
        self.state.lock().factory = factory;
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

    /// Latches verification received for `packet_id` so consumption can
    /// proceed without the peer's verify-complete signal.
    pub fn stop_verification(&self, packet_id: i32) {
        let mut state = self.state.lock();
        if !state.verify_equality {
            return;
        }
        if let Some(entry) = state.registry.get_mut(&packet_id) {
            entry.verify_received = true;
        }
    }

    /// As [`stop_verification`](Self::stop_verification) for every entry.
    pub fn stop_all_verification(&self) {
        let mut state = self.state.lock();
        if !state.verify_equality {
            return;
        }
        for entry in state.registry.values_mut() {
            entry.verify_received = true;
        }
    }

    /// Clears all queues and registries and wakes blocked waiters, which
    /// observe the sentinel returns.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            state.registry.clear();
            state.allocated.clear();
            state.force_stop_ids.clear();
        }
        self.output.lock().clear();
        self.output_cv.notify_all();
        self.finished.lock().clear();
        self.finished_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{AllocatePacket, MessagePacket, SendStopPacket, VerifyCompletePacket};
    use crate::loader::PacketLoader;

    fn receiver() -> FragmentReceiver {
        let loader = PacketLoader::new();
        let factory = PacketFactory::new(false, loader.clone());
        FragmentReceiver::new(loader, factory)
    }

    fn framed(inner: &Packet) -> Vec<u8> {
        PacketLoader::new().write_to_vec(inner, true).unwrap()
    }

    fn allocate(receiver: &FragmentReceiver, count: i32) -> i32 {
        let handle = Uuid::new_v4();
        receiver.ingest(&Packet::Allocate(AllocatePacket::new(count, handle)));
        let polled = receiver.poll_outbound();
        match &polled[0] {
            Packet::Allocation(a) => {
                assert!(a.successful());
                a.packet_id.unwrap()
            }
            other => panic!("expected Allocation, got {other:?}"),
        }
    }

    #[test]
    fn test_allocation_grants_sequential_ids() {
        let receiver = receiver();
        assert_eq!(allocate(&receiver, 1), 0);
        assert_eq!(allocate(&receiver, 1), 1);
        assert_eq!(allocate(&receiver, 1), 2);
    }

    #[test]
    fn test_duplicate_allocation_handle_ignored() {
        let receiver = receiver();
        let handle = Uuid::new_v4();
        receiver.ingest(&Packet::Allocate(AllocatePacket::new(2, handle)));
        receiver.ingest(&Packet::Allocate(AllocatePacket::new(2, handle)));
        let allocations = receiver
            .poll_outbound()
            .into_iter()
            .filter(|p| matches!(p, Packet::Allocation(_)))
            .count();
        assert_eq!(allocations, 1);
    }

    #[test]
    fn test_single_fragment_reassembly_and_forced_complete() {
        let receiver = receiver();
        let inner = Packet::SendStop(SendStopPacket::new(7));
        let id = allocate(&receiver, 1);

        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, framed(&inner))));

        // First poll acknowledges the fragment and consumes the message.
        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::MessageResponse(_)));
        assert_eq!(receiver.poll_recv(), Some(inner));

        // Default tolerance 2: two barren polls, then the forced complete.
        assert!(receiver.poll_outbound().is_empty());
        assert!(receiver.poll_outbound().is_empty());
        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::SendComplete(c) if c.is_acknowledgement()));
        assert_eq!(receiver.poll_finished(), id);
        assert!(receiver.poll_outbound().is_empty());
    }

    #[test]
    fn test_out_of_order_fragments_reassemble_by_id() {
        let receiver = receiver();
        let inner = Packet::Identifier(crate::core::IdentifierPacket::new("reordered"));
        let bytes = framed(&inner);
        let id = allocate(&receiver, 3);

        let third = bytes.len() - 8;
        receiver.ingest(&Packet::Message(MessagePacket::new(
            id,
            2,
            bytes[8..].to_vec(),
        )));
        receiver.ingest(&Packet::Message(MessagePacket::new(
            id,
            0,
            bytes[..4].to_vec(),
        )));
        receiver.ingest(&Packet::Message(MessagePacket::new(
            id,
            1,
            bytes[4..8].to_vec(),
        )));
        let _ = third;

        let _ = receiver.poll_outbound();
        assert_eq!(receiver.poll_recv(), Some(inner));
    }

    #[test]
    fn test_one_ack_per_poll_with_echo_when_verifying() {
        let receiver = receiver();
        receiver.set_verify_responses(true);
        let id = allocate(&receiver, 2);

        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, vec![1, 2])));
        receiver.ingest(&Packet::Message(MessagePacket::new(id, 1, vec![3, 4])));

        let polled = receiver.poll_outbound();
        assert_eq!(polled.len(), 1);
        match &polled[0] {
            Packet::MessageResponse(r) => {
                assert_eq!(r.fragment_id, Some(0));
                assert_eq!(r.payload.as_deref(), Some(&[1u8, 2][..]));
            }
            other => panic!("expected MessageResponse, got {other:?}"),
        }
        let polled = receiver.poll_outbound();
        match &polled[0] {
            Packet::MessageResponse(r) => assert_eq!(r.fragment_id, Some(1)),
            other => panic!("expected MessageResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_fragment_acked_once_per_cycle() {
        let receiver = receiver();
        let id = allocate(&receiver, 2);

        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, vec![1])));
        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, vec![1])));

        let acks = receiver
            .poll_outbound()
            .into_iter()
            .filter(|p| matches!(p, Packet::MessageResponse(_)))
            .count();
        assert_eq!(acks, 1);
        // The cycle drained; nothing further is owed for the duplicate.
        assert!(receiver.poll_outbound().is_empty());
    }

    #[test]
    fn test_missing_fragment_forces_retry_request() {
        let receiver = receiver();
        receiver.set_empty_sends_until_forced(1);
        let id = allocate(&receiver, 2);

        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, vec![1])));
        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::MessageResponse(_)));

        // Tolerance 1: one barren poll, then the retry request.
        assert!(receiver.poll_outbound().is_empty());
        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::RetrySend(r) if !r.is_acknowledgement()));
    }

    #[test]
    fn test_retry_marker_rearms_countdown() {
        let receiver = receiver();
        receiver.set_empty_sends_until_forced(1);
        let id = allocate(&receiver, 2);
        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, vec![1])));
        let _ = receiver.poll_outbound();
        assert!(receiver.poll_outbound().is_empty());

        // The sender's marker resets the tolerance before the retry fires.
        receiver.ingest(&Packet::RetrySend(RetrySendPacket::new(id, true)));
        assert!(receiver.poll_outbound().is_empty());
        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::RetrySend(r) if !r.is_acknowledgement()));
    }

    #[test]
    fn test_verify_equality_holds_consumption_until_signal() {
        let receiver = receiver();
        receiver.set_verify_responses(true);
        receiver.set_verify_equality(true);
        let inner = Packet::SendStop(SendStopPacket::new(3));
        let id = allocate(&receiver, 1);
        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, framed(&inner))));

        let _ = receiver.poll_outbound();
        assert_eq!(receiver.poll_recv(), None);
        // Barren polls do not force completion while verification is
        // outstanding.
        for _ in 0..5 {
            assert!(receiver.poll_outbound().is_empty());
        }

        receiver.ingest(&Packet::VerifyComplete(VerifyCompletePacket::new(id)));
        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::SendComplete(c) if c.is_acknowledgement()));
        assert_eq!(receiver.poll_recv(), Some(inner));
        assert_eq!(receiver.poll_finished(), id);
    }

    #[test]
    fn test_sender_complete_signal_short_circuits_countdown() {
        let receiver = receiver();
        let inner = Packet::SendStop(SendStopPacket::new(3));
        let id = allocate(&receiver, 1);
        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, framed(&inner))));
        let _ = receiver.poll_outbound();

        receiver.ingest(&Packet::SendComplete(SendCompletePacket::new(id, false)));
        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::SendComplete(c) if c.is_acknowledgement()));
    }

    #[test]
    fn test_delete_schedules_send_stop() {
        let receiver = receiver();
        let id = allocate(&receiver, 2);
        receiver.delete(id);

        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::SendStop(s) if s.packet_id == Some(id)));
        // The freed id is granted again.
        assert_eq!(allocate(&receiver, 1), id);
    }

    #[test]
    fn test_unparseable_message_surfaces_out_of_band() {
        let receiver = receiver();
        let id = allocate(&receiver, 1);
        receiver.ingest(&Packet::Message(MessagePacket::new(id, 0, vec![0xFF])));

        let _ = receiver.poll_outbound();
        assert!(receiver.poll_recv().is_none());
        assert!(matches!(
            receiver.take_error(),
            Some(ReceiverError::Reassemble { packet_id, .. }) if packet_id == id
        ));
        // The engine keeps serving the entry's control traffic.
        assert!(receiver.poll_outbound().is_empty());
        assert!(receiver.poll_outbound().is_empty());
        let polled = receiver.poll_outbound();
        assert!(matches!(&polled[0], Packet::SendComplete(_)));
    }

    #[test]
    fn test_zero_fragment_allocation_ignored() {
        let receiver = receiver();
        let mut allocate = AllocatePacket::empty();
        allocate.fragment_count = Some(0);
        allocate.allocation_id = Some(Uuid::new_v4());
        receiver.ingest(&Packet::Allocate(allocate));
        assert!(receiver.poll_outbound().is_empty());
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        use std::sync::Arc;
        let receiver = Arc::new(receiver());
        let waiter = {
            let receiver = receiver.clone();
            std::thread::spawn(move || receiver.recv_blocking())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        receiver.close();
        assert_eq!(waiter.join().unwrap(), None);
    }
}
