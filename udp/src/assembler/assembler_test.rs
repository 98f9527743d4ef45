use wire::crypto::KeySchedule;

use super::*;

fn key() -> KeySchedule {
    KeySchedule::new(b"assembler test psk")
}

fn header(kind: PacketKind, flags: Flags, sequence: u16, sequence_total: u16) -> Header {
    Header {
        version: VERSION_3,
        kind,
        flags,
        request_id: 1,
        sequence,
        sequence_total,
        payload_len: 0,
        timestamp: 0,
    }
}

fn head_pkt(flags: Flags, parity: bool, body_total: u16, body_len: u32, block: &[u8]) -> Packet {
    Packet::new(
        header(PK_RESP_HEAD, flags, 0, 1),
        Payload::RespHead(RespHeadPayload {
            status: 200,
            parity,
            body_total,
            body_len,
            block_frag: Bytes::copy_from_slice(block),
            inline_body: Bytes::new(),
        }),
    )
}

fn inline_head_pkt(flags: Flags, body: &'static [u8]) -> Packet {
    Packet::new(
        header(PK_RESP_HEAD, flags, 0, 1),
        Payload::RespHead(RespHeadPayload {
            status: 200,
            parity: false,
            body_total: 0,
            body_len: body.len() as u32,
            block_frag: Bytes::new(),
            inline_body: Bytes::from_static(body),
        }),
    )
}

fn body_pkt(flags: Flags, seq: u16, wire_total: u16, data: Bytes) -> Packet {
    Packet::new(
        header(PK_RESP_BODY, flags, seq, wire_total),
        Payload::RespBody(RespBodyPayload {
            data,
            aggregate_tag: None,
        }),
    )
}

/// Splits `body` the way the chunker would for the given chunk count.
fn split(body: &[u8], n: usize) -> Vec<Bytes> {
    let chunk_size = body.len().div_ceil(n);
    body.chunks(chunk_size).map(Bytes::copy_from_slice).collect()
}

fn parity_of(chunks: &[Bytes]) -> Bytes {
    let chunk_size = chunks[0].len();
    let mut parity = vec![0u8; chunk_size];
    for chunk in chunks {
        for (i, b) in chunk.iter().enumerate() {
            parity[i] ^= b;
        }
    }
    Bytes::from(parity)
}

#[test]
fn test_in_order_assembly() -> Result<()> {
    let body = b"the quick brown fox jumps over the lazy dog".repeat(40);
    let chunks = split(&body, 3);
    let flags = Flags(0);

    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 3, body.len() as u32, b"\x01\x04text"))?;
    for (seq, chunk) in chunks.iter().enumerate() {
        assert!(!asm.is_complete());
        asm.on_packet(&body_pkt(flags, seq as u16, 3, chunk.clone()))?;
    }
    assert!(asm.is_complete());

    let resp = asm.take(&key())?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.headers, vec![("content-type".to_owned(), "text".to_owned())]);
    assert_eq!(&resp.body[..], &body[..]);
    Ok(())
}

#[test]
fn test_assembly_is_idempotent_under_reorder_and_duplication() -> Result<()> {
    let body: Vec<u8> = (0..2048u32).map(|i| (i * 7) as u8).collect();
    let chunks = split(&body, 4);
    let flags = Flags(0);

    // Body first (stashed as pending), head last, every datagram twice.
    let mut asm = ResponseAssembler::new(flags);
    for seq in [3usize, 1, 0, 2, 2, 0] {
        let admitted =
            asm.on_packet(&body_pkt(flags, seq as u16, 4, chunks[seq].clone()))?;
        assert_ne!(admitted, Admitted::Ignored);
    }
    assert!(!asm.is_complete(), "nothing completes before the head");

    asm.on_packet(&head_pkt(flags, false, 4, body.len() as u32, b""))?;
    assert!(asm.is_complete());

    let resp = asm.take(&key())?;
    assert_eq!(&resp.body[..], &body[..]);
    assert!(resp.headers.is_empty());
    Ok(())
}

#[test]
fn test_duplicates_are_dropped_after_first_acceptance() -> Result<()> {
    let flags = Flags(0);
    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 2, 8, b""))?;

    let pkt = body_pkt(flags, 0, 2, Bytes::from_static(b"AAAA"));
    assert_eq!(asm.on_packet(&pkt)?, Admitted::Progress);
    assert_eq!(asm.on_packet(&pkt)?, Admitted::Duplicate);

    let dup_head = head_pkt(flags, false, 2, 8, b"");
    assert_eq!(asm.on_packet(&dup_head)?, Admitted::Duplicate);
    Ok(())
}

#[test]
fn test_parity_repairs_any_single_missing_chunk() -> Result<()> {
    let body: Vec<u8> = (0..3777u32).map(|i| (i ^ 0x5A) as u8).collect();
    let chunks = split(&body, 4);
    let parity = parity_of(&chunks);
    let flags = Flags(0);

    for dropped in 0..4usize {
        let mut asm = ResponseAssembler::new(flags);
        asm.on_packet(&head_pkt(flags, true, 4, body.len() as u32, b""))?;
        for (seq, chunk) in chunks.iter().enumerate() {
            if seq != dropped {
                asm.on_packet(&body_pkt(flags, seq as u16, 5, chunk.clone()))?;
            }
        }
        asm.on_packet(&body_pkt(flags, 4, 5, parity.clone()))?;

        assert!(asm.is_complete(), "parity must cover dropped chunk {dropped}");
        let resp = asm.take(&key())?;
        assert_eq!(
            &resp.body[..],
            &body[..],
            "wrong bytes after repairing chunk {dropped}"
        );
    }
    Ok(())
}

#[test]
fn test_two_missing_chunks_never_complete() -> Result<()> {
    let body = vec![0xEEu8; 4000];
    let chunks = split(&body, 4);
    let parity = parity_of(&chunks);
    let flags = Flags(0);

    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, true, 4, body.len() as u32, b""))?;
    asm.on_packet(&body_pkt(flags, 0, 5, chunks[0].clone()))?;
    asm.on_packet(&body_pkt(flags, 3, 5, chunks[3].clone()))?;
    asm.on_packet(&body_pkt(flags, 4, 5, parity))?;

    assert!(!asm.is_complete());
    assert_eq!(asm.first_body_gap(), Some(1));
    assert_eq!(asm.missing_body_sequences(256), vec![1, 2]);
    Ok(())
}

#[test]
fn test_sequence_out_of_range_is_rejected() -> Result<()> {
    let flags = Flags(0);
    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 2, 8, b""))?;

    let err = asm
        .on_packet(&body_pkt(flags, 2, 2, Bytes::from_static(b"AAAA")))
        .unwrap_err();
    assert_eq!(err, Error::ErrSequenceOutOfRange);
    Ok(())
}

#[test]
fn test_late_head_with_different_declaration_is_rejected() -> Result<()> {
    let flags = Flags(0);
    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 2, 2000, b""))?;

    let err = asm
        .on_packet(&head_pkt(flags, false, 2, 1999, b""))
        .unwrap_err();
    assert_eq!(err, Error::ErrHeadMismatch);
    Ok(())
}

#[test]
fn test_flag_mismatch_is_rejected() -> Result<()> {
    let mut asm = ResponseAssembler::new(Flags(0));
    let err = asm
        .on_packet(&head_pkt(Flags(FLAG_ENCRYPT), false, 0, 0, b""))
        .unwrap_err();
    assert_eq!(err, Error::ErrFlagMismatch);
    Ok(())
}

#[test]
fn test_wrong_chunk_length_is_rejected() -> Result<()> {
    let flags = Flags(0);
    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 2, 2000, b""))?;

    let err = asm
        .on_packet(&body_pkt(flags, 0, 2, Bytes::from_static(b"short")))
        .unwrap_err();
    assert_eq!(err, Error::ErrChunkLengthInvalid);
    Ok(())
}

#[test]
fn test_empty_body_completes_on_head_alone() -> Result<()> {
    let flags = Flags(0);
    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 0, 0, b""))?;

    assert!(asm.is_complete());
    let resp = asm.take(&key())?;
    assert!(resp.body.is_empty());
    Ok(())
}

#[test]
fn test_inline_body_completes_on_head_alone() -> Result<()> {
    let flags = Flags(0);
    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&inline_head_pkt(flags, b"hello"))?;

    assert!(asm.is_complete());
    assert_eq!(asm.first_body_gap(), None);
    let resp = asm.take(&key())?;
    assert_eq!(&resp.body[..], b"hello");
    Ok(())
}

#[test]
fn test_inline_body_length_must_match_declaration() -> Result<()> {
    let flags = Flags(0);
    let mut asm = ResponseAssembler::new(flags);
    let mut pkt = inline_head_pkt(flags, b"hello");
    if let Payload::RespHead(ref mut p) = pkt.payload {
        p.body_len = 9;
    }
    assert_eq!(asm.on_packet(&pkt).unwrap_err(), Error::ErrBadGeometry);
    Ok(())
}

#[test]
fn test_aggregate_tag_gates_completion() -> Result<()> {
    let body = vec![0x11u8; 2000];
    let chunks = split(&body, 2);
    let flags = Flags(FLAG_AGG_TAG);
    let tag = key().tag(&[&chunks[0][..], &chunks[1][..]]);

    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 2, body.len() as u32, b""))?;
    asm.on_packet(&body_pkt(flags, 0, 2, chunks[0].clone()))?;

    // Final chunk without its tag: payload complete, delivery refused.
    let mut untagged = body_pkt(flags, 1, 2, chunks[1].clone());
    untagged.header.flags = flags.with(FLAG_FINAL);
    asm.on_packet(&untagged)?;
    assert!(!asm.is_complete(), "tag pending");
    assert_eq!(asm.first_body_gap(), Some(1));

    // The real final datagram carries the aggregate tag.
    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 2, body.len() as u32, b""))?;
    asm.on_packet(&body_pkt(flags, 0, 2, chunks[0].clone()))?;
    let mut tagged = body_pkt(flags, 1, 2, chunks[1].clone());
    tagged.header.flags = flags.with(FLAG_FINAL);
    if let Payload::RespBody(ref mut p) = tagged.payload {
        p.aggregate_tag = Some(tag);
    }
    asm.on_packet(&tagged)?;
    assert!(asm.is_complete());
    let resp = asm.take(&key())?;
    assert_eq!(&resp.body[..], &body[..]);
    Ok(())
}

#[test]
fn test_bad_aggregate_tag_is_fatal() -> Result<()> {
    let body = vec![0x22u8; 1000];
    let chunks = split(&body, 1);
    let flags = Flags(FLAG_AGG_TAG);

    let mut asm = ResponseAssembler::new(flags);
    asm.on_packet(&head_pkt(flags, false, 1, body.len() as u32, b""))?;
    let mut tagged = body_pkt(flags, 0, 1, chunks[0].clone());
    tagged.header.flags = flags.with(FLAG_FINAL);
    if let Payload::RespBody(ref mut p) = tagged.payload {
        p.aggregate_tag = Some([0u8; 16]);
    }
    asm.on_packet(&tagged)?;

    assert!(asm.is_complete(), "completion gate passes, delivery must not");
    assert_eq!(asm.take(&key()).unwrap_err(), Error::ErrAggTagVerifyFailed);
    Ok(())
}

#[test]
fn test_head_gap_is_visible_once_body_arrives_early() -> Result<()> {
    let flags = Flags(0);
    let mut asm = ResponseAssembler::new(flags);
    assert_eq!(asm.first_head_gap(), None, "no evidence, no gap");

    asm.on_packet(&body_pkt(flags, 0, 2, Bytes::from_static(b"early")))?;
    assert_eq!(asm.first_head_gap(), Some(0));
    assert_eq!(asm.missing_head_sequences(256), vec![0]);
    Ok(())
}
