//! One side of the connection is a bare UDP socket speaking the wire format,
//! so the test controls exactly which acknowledgements the other side sees.

mod harness;

use anyhow::{ensure, Result};
use harness::*;
use interconnect::{Config, Flags, Header, Peer, Received};
use protocol::{decode, encode, write_chunk};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const NODE: i32 = 3;

async fn next_packet(socket: &UdpSocket, within: Duration) -> Result<Header> {
    let mut buf = vec![0u8; 65_536];
    let (len, _) = timeout(within, socket.recv_from(&mut buf)).await??;
    let (header, _) = decode(&buf[..len], true)?;
    Ok(header)
}

fn data(identity: &Header, sequence: u32, flags: Flags, chunks: &[&[u8]]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for chunk in chunks {
        write_chunk(&mut payload, chunk)?;
    }
    let header = Header {
        sequence,
        flags,
        ..*identity
    };
    encode(&header, &payload, true)
}

fn answer(packet: &Header, extra: Flags) -> Result<Vec<u8>> {
    let ack = Header {
        flags: packet.flags | Flags::ACK | extra,
        ..*packet
    };
    encode(&ack, &[], true)
}

#[tokio::test]
async fn test_data_for_an_instance_not_set_up_is_retried() -> Result<()> {
    init_tracing();
    timeout(TEST_TIMEOUT, async {
        let config = fast_config();
        let sender = Process::bind(&config, 0, 100).await?;
        let receiver = Process::bind(&config, -1, 200).await?;
        let to = receiver.interconnect.local_addr();

        // Instance 1 runs to completion, so the receiver knows the session.
        let (mut tx, mut rx) = tokio::try_join!(
            sender.setup(sender.topology(1, vec![], Some(send_link(NODE, &[receiver.peer()])))),
            receiver.setup(receiver.topology(1, vec![recv_link(NODE, &[sender.peer()])], None)),
        )?;
        tx.send_eos(NODE).await?;
        assert_eq!(rx.receive(NODE, 0).await?, Received::EndOfStream);
        tx.teardown(false).await?;
        rx.teardown(false).await?;

        // A sender of instance 2 that is one step ahead of the receiver.
        let raw = UdpSocket::bind(loopback()).await?;
        let identity = Header {
            motion_node_id: NODE,
            send_slice_index: 1,
            recv_slice_index: 0,
            src_content_id: 5,
            src_pid: 500,
            src_listener_port: u32::from(raw.local_addr()?.port()),
            dst_content_id: receiver.content_id,
            dst_pid: receiver.pid,
            dst_listener_port: u32::from(to.port()),
            session_id: SESSION,
            instance_id: 2,
            ..Default::default()
        };
        let early = data(&identity, 1, Flags::empty(), &[b"early"])?;
        raw.send_to(&early, to).await?;
        let nak = next_packet(&raw, Duration::from_secs(2)).await?;
        assert_eq!(nak.sequence, 1);
        assert!(nak.flags.contains(Flags::ACK | Flags::NAK));
        assert!(!nak.flags.contains(Flags::STOP));

        let ghost = Peer::new(5, 500, raw.local_addr()?);
        let handshake = async {
            loop {
                raw.send_to(&data(&identity, 0, Flags::empty(), &[])?, to).await?;
                match next_packet(&raw, Duration::from_millis(50)).await {
                    Ok(ack) if ack.sequence == 0 && !ack.flags.contains(Flags::NAK) => break,
                    _ => continue,
                }
            }
            Ok::<_, anyhow::Error>(())
        };
        let (mut rx, ()) = tokio::try_join!(
            receiver.setup(receiver.topology(2, vec![recv_link(NODE, &[ghost])], None)),
            handshake,
        )?;

        // The refused packet was not counted: sequence 1 is still the one expected.
        raw.send_to(&early, to).await?;
        let ack = next_packet(&raw, Duration::from_secs(2)).await?;
        assert_eq!(ack.sequence, 1);
        assert_eq!(ack.flags, Flags::ACK);
        raw.send_to(&data(&identity, 2, Flags::EOS, &[])?, to).await?;
        let ack = next_packet(&raw, Duration::from_secs(2)).await?;
        ensure!(ack.sequence == 2, "end of stream acknowledged as {}", ack.sequence);

        assert_eq!(rx.receive(NODE, 0).await?, Received::Chunk(b"early".to_vec()));
        assert_eq!(rx.receive(NODE, 0).await?, Received::EndOfStream);
        rx.teardown(false).await?;
        assert!(receiver.interconnect.statistics().mismatches >= 1);
        Ok(())
    })
    .await?
}

#[tokio::test]
async fn test_sender_resends_a_refused_packet_at_once() -> Result<()> {
    init_tracing();
    timeout(TEST_TIMEOUT, async {
        // Timer-driven retransmits cannot fire within the test.
        let config = Config {
            retransmit_base_ms: 10_000,
            retransmit_cap_ms: 10_000,
            ..fast_config()
        };
        let sender = Process::bind(&config, 0, 100).await?;
        let raw = UdpSocket::bind(loopback()).await?;
        let ghost = Peer::new(-1, 900, raw.local_addr()?);
        let from = sender.interconnect.local_addr();

        let handshake = async {
            let hello = next_packet(&raw, Duration::from_secs(5)).await?;
            ensure!(hello.sequence == 0, "expected a handshake, got {}", hello.sequence);
            raw.send_to(&answer(&hello, Flags::empty())?, from).await?;
            Ok::<_, anyhow::Error>(())
        };
        let (mut tx, ()) = tokio::try_join!(
            sender.setup(sender.topology(1, vec![], Some(send_link(NODE, &[ghost])))),
            handshake,
        )?;

        tx.send(NODE, 0, b"retry me").await?;
        let receiver = async {
            let first = next_packet(&raw, Duration::from_secs(2)).await?;
            ensure!(first.sequence == 1, "first packet carries {}", first.sequence);
            raw.send_to(&answer(&first, Flags::NAK)?, from).await?;
            let again = next_packet(&raw, Duration::from_secs(2)).await?;
            ensure!(again.sequence == 1, "resent packet carries {}", again.sequence);
            ensure!(again.total_len == first.total_len, "resent packet changed");
            raw.send_to(&answer(&again, Flags::empty())?, from).await?;
            Ok::<_, anyhow::Error>(())
        };
        tokio::try_join!(async { Ok::<_, anyhow::Error>(tx.send_eos(NODE).await?) }, receiver)?;

        assert_eq!(tx.statistics(NODE)?.retransmits, 1);
        tx.teardown(false).await?;
        assert_eq!(sender.interconnect.connection_count(), 0);
        Ok(())
    })
    .await?
}
