mod common;

use common::*;
use msglink::simulator::SimulatorParams;
use msglink::{ConnectionState, MessageHandler, NetworkHost, TransportMode};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A 40 kB message is split into fragments, pushed through a lossy link, and must
///  reassemble bit-for-bit identically on the far side.
#[test]
fn fragmented_message_reassembles_identically_under_loss() {
    let port = free_udp_port();
    let server = NetworkHost::new(test_config()).unwrap();

    let handler_slot: Arc<Mutex<Option<Arc<RecordingHandler>>>> = Arc::new(Mutex::new(None));
    let slot = handler_slot.clone();
    let acceptor = Acceptor::new(Box::new(
        move |_| -> Arc<dyn MessageHandler> {
            let handler = RecordingHandler::new();
            *slot.lock().unwrap() = Some(handler.clone());
            handler
        },
    ));
    server.start_server(port, TransportMode::Udp, acceptor.clone()).unwrap();

    let client_host = NetworkHost::new(test_config()).unwrap();
    let client = client_host
        .connect(format!("127.0.0.1:{}", port).parse().unwrap(), TransportMode::Udp)
        .unwrap();

    assert!(
        wait_for(
            Duration::from_secs(5),
            || server.process(),
            || client.connection_state() == ConnectionState::Ok,
        ),
        "handshake did not complete"
    );

    client.set_send_simulator(SimulatorParams {
        enabled: true,
        constant_packet_send_delay: Duration::from_millis(5),
        uniform_random_packet_send_delay: Duration::from_millis(10),
        packet_loss_rate: 0.2,
    });

    let payload: Vec<u8> = (0..40_000u32).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect();
    let mut message = client.start_new_message(TEST_MESSAGE_ID, payload.len()).unwrap();
    message.reliable = true;
    message.payload_mut().extend_from_slice(&payload);
    client.end_and_queue(message).unwrap();

    assert!(
        wait_for(
            Duration::from_secs(60),
            || {
                server.process();
                acceptor.process_all();
                client.process();
            },
            || handler_slot.lock().unwrap().as_ref().is_some_and(|h| h.count() == 1),
        ),
        "the fragmented message never arrived"
    );

    let handler = handler_slot.lock().unwrap().clone().unwrap();
    let received = handler.payloads();
    assert_eq!(received[0].len(), payload.len());
    assert_eq!(received[0], payload, "reassembly must be bit-for-bit identical");

    client_host.shutdown();
    server.shutdown();
}
