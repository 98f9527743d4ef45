use bytes::Bytes;
use wire::codec::Codec;

use super::*;

const PSK: &[u8] = b"chunker test psk";
const TS: u32 = 1_700_000_000;
const REQUEST_ID: u64 = 7;

fn codec() -> Codec {
    Codec::new(PSK)
}

fn chunk(
    flags: Flags,
    headers: &[(String, String)],
    body: &[u8],
    cfg: &ChunkerConfig,
) -> ChunkedResponse {
    chunk_response(
        &codec(),
        VERSION_3,
        flags,
        REQUEST_ID,
        TS,
        200,
        headers,
        body,
        cfg,
    )
    .unwrap()
}

fn decode(raw: &Bytes) -> Packet {
    codec().decode(raw, TS).unwrap()
}

fn one_chunk_cfg() -> ChunkerConfig {
    ChunkerConfig {
        head_duplication: 1,
        body_duplication: 1,
        ..Default::default()
    }
}

#[test]
fn test_empty_body_is_one_final_head_datagram() {
    let chunks = chunk(Flags(0), &[], b"", &one_chunk_cfg());
    assert_eq!(chunks.head.len(), 1);
    assert!(chunks.body.is_empty());
    assert_eq!(chunks.body_total, 0);

    let pkt = decode(&chunks.head[0]);
    assert!(pkt.header.flags.final_marker());
    match pkt.payload {
        Payload::RespHead(p) => {
            assert_eq!(p.status, 200);
            assert_eq!(p.body_total, 0);
            assert_eq!(p.body_len, 0);
            assert!(!p.parity);
        }
        other => panic!("expected RespHead, got {other:?}"),
    }
}

#[test]
fn test_two_chunk_split_is_balanced() {
    // 1200-byte MTU, long-id HMAC: 1160 usable bytes, so a 2000-byte body
    // splits into two 1000-byte chunks.
    let body = vec![0x41u8; 2000];
    let chunks = chunk(Flags(0), &[], &body, &one_chunk_cfg());

    assert_eq!(chunks.body_total, 2);
    assert_eq!(chunks.body.len(), 2);
    for (seq, raw) in chunks.body.iter().enumerate() {
        let pkt = decode(raw);
        assert_eq!(pkt.header.sequence, seq as u16);
        assert_eq!(pkt.header.sequence_total, 2);
        match pkt.payload {
            Payload::RespBody(p) => assert_eq!(p.data.len(), 1000),
            other => panic!("expected RespBody, got {other:?}"),
        }
    }
}

#[test]
fn test_last_chunk_may_be_shorter() {
    let body = vec![7u8; 2500];
    let chunks = chunk(Flags(0), &[], &body, &one_chunk_cfg());

    // 2500 over a 1160 budget: three chunks of ceil(2500/3) = 834.
    assert_eq!(chunks.body_total, 3);
    let lens: Vec<usize> = chunks
        .body
        .iter()
        .map(|raw| match decode(raw).payload {
            Payload::RespBody(p) => p.data.len(),
            other => panic!("expected RespBody, got {other:?}"),
        })
        .collect();
    assert_eq!(lens, vec![834, 834, 832]);
}

#[test]
fn test_every_datagram_fits_the_mtu_budget() {
    let headers: Vec<(String, String)> = (0..40)
        .map(|i| (format!("x-header-{i}"), "v".repeat(80)))
        .collect();
    let body = vec![3u8; 10_000];

    for flags in [Flags(0), Flags(FLAG_ENCRYPT), Flags(FLAG_AGG_TAG)] {
        let chunks = chunk(flags, &headers, &body, &one_chunk_cfg());
        assert!(chunks.head.len() > 1, "block must spill into continuations");
        for raw in chunks.head.iter().chain(chunks.body.iter()) {
            assert!(
                raw.len() <= 1200,
                "datagram of {} bytes exceeds the MTU budget (flags {flags})",
                raw.len()
            );
        }
    }
}

#[test]
fn test_head_continuations_carry_the_whole_block() {
    let headers: Vec<(String, String)> = (0..40)
        .map(|i| (format!("x-header-{i}"), "v".repeat(80)))
        .collect();
    let chunks = chunk(Flags(0), &headers, b"", &one_chunk_cfg());

    let mut block = vec![];
    for (i, raw) in chunks.head.iter().enumerate() {
        let pkt = decode(raw);
        assert_eq!(pkt.header.sequence, i as u16);
        assert_eq!(pkt.header.sequence_total, chunks.head.len() as u16);
        match pkt.payload {
            Payload::RespHead(p) => block.extend_from_slice(&p.block_frag),
            Payload::RespHeadCont(p) => block.extend_from_slice(&p.block_frag),
            other => panic!("unexpected payload {other:?}"),
        }
    }
    let decoded = wire::header_block::decode_header_block(&block).unwrap();
    assert_eq!(decoded.len(), 40);
    assert_eq!(decoded[0].0, "x-header-0");
}

#[test]
fn test_parity_chunk_is_xor_of_data_chunks() {
    let body: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
    let cfg = ChunkerConfig {
        parity: true,
        ..one_chunk_cfg()
    };
    let chunks = chunk(Flags(0), &[], &body, &cfg);

    assert!(chunks.parity);
    assert_eq!(chunks.body_total, 4);
    assert_eq!(chunks.body.len(), 5, "four data chunks plus parity");

    let mut payloads = vec![];
    for raw in &chunks.body {
        let pkt = decode(raw);
        assert_eq!(pkt.header.sequence_total, 5, "wire total counts parity");
        match pkt.payload {
            Payload::RespBody(p) => payloads.push(p.data),
            other => panic!("expected RespBody, got {other:?}"),
        }
    }

    let chunk_size = payloads[0].len();
    let mut expected = vec![0u8; chunk_size];
    for data in &payloads[..4] {
        for (i, b) in data.iter().enumerate() {
            expected[i] ^= b;
        }
    }
    assert_eq!(&payloads[4][..], &expected[..]);
}

#[test]
fn test_aggregate_tag_rides_the_final_data_chunk() {
    let body = vec![9u8; 3000];
    let chunks = chunk(Flags(FLAG_AGG_TAG), &[], &body, &one_chunk_cfg());
    assert_eq!(chunks.body_total, 3);

    let expected_tag = {
        let chunk_size = 1000;
        let parts: Vec<&[u8]> = body.chunks(chunk_size).collect();
        codec().key().tag(&parts)
    };

    for (seq, raw) in chunks.body.iter().enumerate() {
        let pkt = decode(raw);
        match pkt.payload {
            Payload::RespBody(p) => {
                if seq == 2 {
                    assert!(pkt.header.flags.final_marker());
                    assert_eq!(p.aggregate_tag, Some(expected_tag));
                } else {
                    assert!(!pkt.header.flags.final_marker());
                    assert_eq!(p.aggregate_tag, None);
                }
            }
            other => panic!("expected RespBody, got {other:?}"),
        }
    }

    // Intermediate chunks save the 16-byte tag.
    assert_eq!(chunks.body[0].len() + 16, chunks.body[2].len());
}

#[test]
fn test_emit_order_duplicates_head_and_body() {
    let cfg = ChunkerConfig {
        head_duplication: 4,
        body_duplication: 2,
        ..Default::default()
    };
    let chunks = chunk(Flags(0), &[], &vec![1u8; 2000], &cfg);

    let order: Vec<&Bytes> = chunks.emit_order().collect();
    assert_eq!(order.len(), 4 + 2 * 2);
    assert_eq!(chunks.total_datagrams(), 8);
    // Head copies first; redundant copies are verbatim.
    assert_eq!(order[0], order[3]);
    assert_eq!(order[4], &chunks.body[0]);
    assert_eq!(order[6], order[4]);
}

#[test]
fn test_rejects_encrypt_with_aggregate_tag() {
    let err = chunk_response(
        &codec(),
        VERSION_3,
        Flags(FLAG_ENCRYPT | FLAG_AGG_TAG),
        REQUEST_ID,
        TS,
        200,
        &[],
        b"x",
        &ChunkerConfig::default(),
    )
    .unwrap_err();
    assert_eq!(err, Error::ErrAggTagWithEncrypt);
}

#[test]
fn test_rejects_absurd_mtu() {
    let err = chunk_response(
        &codec(),
        VERSION_3,
        Flags(0),
        REQUEST_ID,
        TS,
        200,
        &[],
        b"x",
        &ChunkerConfig {
            mtu_budget: 48,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert_eq!(err, Error::ErrBadGeometry);
}
