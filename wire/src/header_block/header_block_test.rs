use super::*;

fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
    raw.iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_static_table_ids_are_stable() {
    assert_eq!(static_id("content-type"), Some(1));
    assert_eq!(static_id("Content-Type"), Some(1), "case-insensitive match");
    assert_eq!(static_id("location"), Some(11));
    assert_eq!(static_id("x-akari-hop"), None);
}

#[test]
fn test_roundtrip_static_and_literal_names() -> Result<()> {
    let headers = pairs(&[
        ("content-type", "text/html; charset=utf-8"),
        ("x-frame-options", "DENY"),
        ("content-length", "1234"),
    ]);

    let block = encode_header_block(&headers)?;
    // Static names cost a single id byte.
    assert_eq!(block[0], 1);
    let decoded = decode_header_block(&block)?;
    assert_eq!(decoded, headers);
    Ok(())
}

#[test]
fn test_names_fold_to_lowercase() -> Result<()> {
    let block = encode_header_block(&pairs(&[("X-Custom", "v")]))?;
    let decoded = decode_header_block(&block)?;
    assert_eq!(decoded, pairs(&[("x-custom", "v")]));
    Ok(())
}

#[test]
fn test_duplicates_keep_insertion_order() -> Result<()> {
    let headers = pairs(&[
        ("set-cookie", "a=1"),
        ("set-cookie", "b=2"),
        ("set-cookie", "c=3"),
    ]);
    let decoded = decode_header_block(&encode_header_block(&headers)?)?;
    assert_eq!(decoded, headers);
    Ok(())
}

#[test]
fn test_varint16_boundary_values() -> Result<()> {
    for len in [0usize, 1, 0x7F, 0x80, 0x100, 0x7FFF] {
        let headers = pairs(&[("etag", &"v".repeat(len))]);
        let decoded = decode_header_block(&encode_header_block(&headers)?)?;
        assert_eq!(decoded, headers, "roundtrip failed for value length {len}");
    }

    let too_long = pairs(&[("etag", &"v".repeat(0x8000))]);
    assert_eq!(
        encode_header_block(&too_long),
        Err(Error::ErrHeaderValueTooLong)
    );
    Ok(())
}

#[test]
fn test_decode_rejects_unknown_id() {
    assert_eq!(
        decode_header_block(&[12, 1, b'x']),
        Err(Error::ErrUnknownHeaderId { id: 12 })
    );
}

#[test]
fn test_decode_rejects_truncation() {
    let block = encode_header_block(&pairs(&[("server", "akari")])).unwrap();
    for cut in 1..block.len() {
        assert!(
            decode_header_block(&block[..cut]).is_err(),
            "truncation at {cut} must not decode"
        );
    }
}

#[test]
fn test_empty_block_is_empty_list() -> Result<()> {
    assert_eq!(encode_header_block(&[])?.len(), 0);
    assert!(decode_header_block(&[])?.is_empty());
    Ok(())
}
