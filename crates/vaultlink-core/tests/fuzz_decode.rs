use rand::{thread_rng, Rng};
use vaultlink_core::{ClientFrameDecoder, ServerFrame, ServerFrameDecoder};

fn drain_server(decoder: &mut ServerFrameDecoder) {
    while let Ok(Some(_)) = decoder.next_frame() {}
}

#[test]
fn fuzz_decode_server_frames_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let mut decoder = ServerFrameDecoder::new();
        decoder.push(&data);
        drain_server(&mut decoder);
    }
}

#[test]
fn fuzz_decode_client_frames_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let mut decoder = ClientFrameDecoder::new();
        decoder.push(&data);
        while let Ok(Some(_)) = decoder.next_frame() {}
    }
}

#[test]
fn random_mutation_of_valid_msg_is_handled() {
    let mut rng = thread_rng();
    let frame = b"MSG scope.forApp.ping.r1 4 scope.forVault.ping 11\r\n{\"ok\":true}\r\n".to_vec();

    for _ in 0..1_000 {
        let mut mutated = frame.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        let mut decoder = ServerFrameDecoder::new();
        decoder.push(&mutated);
        drain_server(&mut decoder);
    }
}

#[test]
fn random_chunking_of_valid_stream_decodes_identically() {
    let mut rng = thread_rng();
    let wire: &[u8] = b"INFO {\"server_id\":\"s\"}\r\nPING\r\nMSG a.b 1 3\r\nabc\r\n+OK\r\nMSG a.c 2 r.x 0\r\n\r\nPONG\r\n";

    for _ in 0..500 {
        let mut decoder = ServerFrameDecoder::new();
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < wire.len() {
            let step = rng.gen_range(1..=8).min(wire.len() - offset);
            decoder.push(&wire[offset..offset + step]);
            offset += step;
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 6);
        assert!(matches!(frames[0], ServerFrame::Info(_)));
        assert_eq!(frames[1], ServerFrame::Ping);
        assert!(matches!(&frames[2], ServerFrame::Msg(m) if &m.payload[..] == b"abc"));
        assert_eq!(frames[3], ServerFrame::Ok);
        assert!(matches!(&frames[4], ServerFrame::Msg(m) if m.payload.is_empty() && m.reply_to.is_some()));
        assert_eq!(frames[5], ServerFrame::Pong);
    }
}
