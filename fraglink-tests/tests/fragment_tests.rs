//! Fragment engine scenarios
//!
//! Drives a sender and receiver pair at the packet level: single-fragment
//! transfer, selective re-send after loss, equality verification with a
//! corrupted echo, forced completion pacing, and id allocator liveness.

use fraglink::protocol::fragment::MessagePacket;
use fraglink::protocol::receiver::NO_ID;
use fraglink::{FragmentReceiver, FragmentSender, FragmentationOptions, Packet, PacketFactory, PacketLoader};

fn engines(options: &FragmentationOptions) -> (FragmentSender, FragmentReceiver) {
    let loader = PacketLoader::new();
    let factory = PacketFactory::new(false, loader.clone());
    let sender = FragmentSender::new(loader.clone());
    let receiver = FragmentReceiver::new(loader, factory);
    options.setup_sender(&sender);
    options.setup_receiver(&receiver);
    (sender, receiver)
}

/// A valid inner packet whose framed form is exactly `frame_len` bytes.
fn inner_of_framed_len(frame_len: usize) -> Packet {
    // Frame overhead: tag(2) + length(4) + packet-id(4) + fragment-id(4).
    assert!(frame_len >= 14);
    Packet::Message(MessagePacket::new(5, 0, vec![0xA5; frame_len - 14]))
}

/// Runs both engines until the receiver delivers a packet or the poll
/// budget runs out, applying `filter` to sender-to-receiver traffic.
fn pump_until_delivery(
    sender: &FragmentSender,
    receiver: &FragmentReceiver,
    mut filter: impl FnMut(&Packet) -> bool,
    max_rounds: usize,
) -> Option<Packet> {
    for _ in 0..max_rounds {
        for packet in sender.poll_outbound() {
            if filter(&packet) {
                receiver.ingest(&packet);
            }
        }
        for packet in receiver.poll_outbound() {
            sender.ingest(&packet);
        }
        if let Some(delivered) = receiver.poll_recv() {
            return Some(delivered);
        }
    }
    None
}

/// Runs both engines until the sender reports the message finished.
fn pump_until_finished(sender: &FragmentSender, receiver: &FragmentReceiver, max_rounds: usize) -> i32 {
    for _ in 0..max_rounds {
        for packet in sender.poll_outbound() {
            receiver.ingest(&packet);
        }
        for packet in receiver.poll_outbound() {
            sender.ingest(&packet);
        }
        let finished = sender.poll_finished();
        if finished != NO_ID {
            return finished;
        }
    }
    NO_ID
}

#[test]
fn test_single_fragment_message_end_to_end() {
    // Scenario: a 10-byte frame at split size 16 travels as one fragment.
    let options = FragmentationOptions {
        split_size: 16,
        ..Default::default()
    };
    let (sender, receiver) = engines(&options);
    let inner = Packet::SendStop(fraglink::protocol::fragment::SendStopPacket::new(7));
    sender.submit(inner.clone());

    let mut fragments_seen = 0;
    let delivered = pump_until_delivery(
        &sender,
        &receiver,
        |packet| {
            if matches!(packet, Packet::Message(_)) {
                fragments_seen += 1;
            }
            true
        },
        16,
    );
    assert_eq!(delivered, Some(inner));
    assert_eq!(fragments_seen, 1);

    // Both sides settle: receiver forces completion, sender finishes.
    let finished = pump_until_finished(&sender, &receiver, 16);
    assert_eq!(finished, 0);
    assert_eq!(receiver.poll_finished(), 0);
    assert!(sender.poll_outbound().is_empty());
    assert!(receiver.poll_outbound().is_empty());
}

#[test]
fn test_fragment_count_and_sizes() {
    // 1000-byte inner frame at split 400: 3 fragments, last one 200 bytes.
    let options = FragmentationOptions {
        split_size: 400,
        ..Default::default()
    };
    let (sender, receiver) = engines(&options);
    let inner = inner_of_framed_len(1000);
    sender.submit(inner.clone());

    let mut sizes = Vec::new();
    let delivered = pump_until_delivery(
        &sender,
        &receiver,
        |packet| {
            if let Packet::Message(message) = packet {
                sizes.push(message.payload.as_ref().unwrap().len());
            }
            true
        },
        32,
    );
    assert_eq!(delivered, Some(inner));
    assert_eq!(sizes, [400, 400, 200]);
}

#[test]
fn test_resend_after_fragment_loss() {
    // Fragment 1 of 3 is dropped in transit; the receiver times out into
    // a retry request, the sender re-sends only the missing fragment.
    let options = FragmentationOptions {
        split_size: 400,
        ..Default::default()
    };
    let (sender, receiver) = engines(&options);
    let inner = inner_of_framed_len(1000);
    sender.submit(inner.clone());

    let mut drop_armed = true;
    let mut retransmits = 0;
    let delivered = pump_until_delivery(
        &sender,
        &receiver,
        |packet| {
            if let Packet::Message(message) = packet {
                if message.fragment_id == Some(1) {
                    if drop_armed {
                        drop_armed = false;
                        return false;
                    }
                    retransmits += 1;
                }
            }
            true
        },
        64,
    );
    assert_eq!(delivered, Some(inner));
    assert_eq!(retransmits, 1);

    let finished = pump_until_finished(&sender, &receiver, 32);
    assert_eq!(finished, 0);
}

#[test]
fn test_equality_verification_with_corrupted_echo() {
    // Both sides verify equality; the first echo of fragment 0 is
    // corrupted in transit, so the sender re-sends fragment 0 until the
    // echo matches, then completes through the verify handshake.
    let options = FragmentationOptions {
        split_size: 400,
        verify_fragments: true,
        equality_verify_fragments: true,
        ..Default::default()
    };
    let (sender, receiver) = engines(&options);
    let inner = inner_of_framed_len(800);
    sender.submit(inner.clone());

    let mut corrupt_armed = true;
    let mut verify_complete_seen = 0;
    for _ in 0..128 {
        for packet in sender.poll_outbound() {
            if matches!(packet, Packet::VerifyComplete(_)) {
                verify_complete_seen += 1;
            }
            receiver.ingest(&packet);
        }
        for mut packet in receiver.poll_outbound() {
            if let Packet::MessageResponse(response) = &mut packet {
                if response.fragment_id == Some(0) && corrupt_armed {
                    corrupt_armed = false;
                    if let Some(body) = response.payload.as_mut() {
                        body[0] ^= 0xFF;
                    }
                }
            }
            sender.ingest(&packet);
        }
        if sender.poll_finished() != NO_ID {
            break;
        }
    }

    assert!(!corrupt_armed, "corrupted echo was exercised");
    assert!(verify_complete_seen >= 1);
    assert_eq!(receiver.poll_recv(), Some(inner));
    assert_eq!(receiver.poll_finished(), 0);
}

#[test]
fn test_equality_verification_clean_path_emits_verify_complete_once() {
    let options = FragmentationOptions {
        split_size: 400,
        verify_fragments: true,
        equality_verify_fragments: true,
        ..Default::default()
    };
    let (sender, receiver) = engines(&options);
    let inner = inner_of_framed_len(800);
    sender.submit(inner.clone());

    let mut verify_completes = 0;
    for _ in 0..64 {
        for packet in sender.poll_outbound() {
            if matches!(packet, Packet::VerifyComplete(_)) {
                verify_completes += 1;
            }
            receiver.ingest(&packet);
        }
        for packet in receiver.poll_outbound() {
            sender.ingest(&packet);
        }
        if sender.poll_finished() != NO_ID {
            break;
        }
    }
    assert_eq!(verify_completes, 1);
    assert_eq!(receiver.poll_recv(), Some(inner));
}

#[test]
fn test_interleaved_messages_complete_independently() {
    // Two messages in flight at once; no cross-message ordering is
    // assumed, both reassemble.
    let options = FragmentationOptions {
        split_size: 64,
        ..Default::default()
    };
    let (sender, receiver) = engines(&options);
    let first = inner_of_framed_len(200);
    let second = Packet::Identifier(fraglink::protocol::core::IdentifierPacket::new("second"));
    sender.submit(first.clone());
    sender.submit(second.clone());

    let mut delivered = Vec::new();
    for _ in 0..64 {
        for packet in sender.poll_outbound() {
            receiver.ingest(&packet);
        }
        for packet in receiver.poll_outbound() {
            sender.ingest(&packet);
        }
        while let Some(packet) = receiver.poll_recv() {
            delivered.push(packet);
        }
        if delivered.len() == 2 {
            break;
        }
    }
    assert_eq!(delivered.len(), 2);
    assert!(delivered.contains(&first));
    assert!(delivered.contains(&second));
}

#[test]
fn test_finished_ids_block_and_wake() {
    use std::sync::Arc;

    let options = FragmentationOptions {
        split_size: 64,
        ..Default::default()
    };
    let (sender, receiver) = engines(&options);
    let sender = Arc::new(sender);
    let inner = inner_of_framed_len(100);
    sender.submit(inner);

    let waiter = {
        let sender = sender.clone();
        std::thread::spawn(move || sender.block_on_finished())
    };
    // The waiter blocks while the transfer is pumped on this thread.
    for _ in 0..32 {
        for packet in sender.poll_outbound() {
            receiver.ingest(&packet);
        }
        for packet in receiver.poll_outbound() {
            sender.ingest(&packet);
        }
        if receiver.poll_recv().is_some() {
            // Keep pumping until the sender hears the acked completion.
        }
        if !waiter.is_finished() {
            std::thread::yield_now();
        } else {
            break;
        }
    }
    assert_eq!(waiter.join().unwrap(), 0);
}

#[test]
fn test_receiver_id_reuse_only_after_delete() {
    let options = FragmentationOptions::default();
    let (_, receiver) = engines(&options);

    let first = uuid::Uuid::new_v4();
    receiver.ingest(&Packet::Allocate(
        fraglink::protocol::fragment::AllocatePacket::new(1, first),
    ));
    let second = uuid::Uuid::new_v4();
    receiver.ingest(&Packet::Allocate(
        fraglink::protocol::fragment::AllocatePacket::new(1, second),
    ));

    let granted: Vec<i32> = receiver
        .poll_outbound()
        .into_iter()
        .filter_map(|packet| match packet {
            Packet::Allocation(a) => a.packet_id,
            _ => None,
        })
        .collect();
    assert_eq!(granted, [0, 1]);

    // The allocator rests on the last granted id; deleting that owner
    // frees the id for the next allocation.
    receiver.delete(1);
    let third = uuid::Uuid::new_v4();
    receiver.ingest(&Packet::Allocate(
        fraglink::protocol::fragment::AllocatePacket::new(1, third),
    ));
    let granted: Vec<i32> = receiver
        .poll_outbound()
        .into_iter()
        .filter_map(|packet| match packet {
            Packet::Allocation(a) => a.packet_id,
            _ => None,
        })
        .collect();
    assert_eq!(granted, [1]);
}

#[test]
fn test_sender_delete_cancels_silently() {
    let options = FragmentationOptions {
        split_size: 64,
        ..Default::default()
    };
    let (sender, receiver) = engines(&options);
    sender.submit(inner_of_framed_len(200));

    for packet in sender.poll_outbound() {
        receiver.ingest(&packet);
    }
    for packet in receiver.poll_outbound() {
        sender.ingest(&packet);
    }
    sender.delete(0);
    // Nothing further is emitted for the deleted entry.
    assert!(sender.poll_outbound().is_empty());
    assert_eq!(sender.poll_finished(), NO_ID);
}
