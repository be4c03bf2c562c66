//! Tests for streamed reads of chunked objects: full-body GET, byte ranges,
//! nested manifests, and the cache rules on the read path.

mod common;

use bytes::Bytes;
use common::{client_addr, collect_body, env_with, get_request, get_request_with, header, put_request, test_config};
use hyper::StatusCode;
use storage_gateway::cache_store::CacheStore;
use storage_gateway::digest::md5_u128;
use storage_gateway::gateway::handle_request;
use storage_gateway::storage_rpc::StorageRpc;

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn test_full_get_reproduces_uploaded_body() {
    let env = env_with(test_config());
    let body = vec![0x41u8; 10 * MIB];
    handle_request(put_request("/a/b", body.clone()), client_addr(), env.ctx.clone())
        .await
        .unwrap();

    let response = handle_request(get_request("/a/b"), client_addr(), env.ctx.clone())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-length"), Some("10485760"));
    assert_eq!(
        header(&response, "etag"),
        Some("b687a5f87a7d32b4a6cc38ceea237a02")
    );
    assert!(header(&response, "last-modified").is_some());
    assert_eq!(collect_body(response).await, Bytes::from(body));

    // The top-level key is never cached for chunked objects.
    assert!(env.cache.get(b"a/b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mid_object_range_read() {
    let env = env_with(test_config());
    let body = vec![0x41u8; 10 * MIB];
    handle_request(put_request("/a/b", body), client_addr(), env.ctx.clone())
        .await
        .unwrap();

    // Four bytes out of chunk 3, crossing nothing.
    let response = handle_request(
        get_request_with("/a/b", &[("range", "bytes=5242880-5242883")]),
        client_addr(),
        env.ctx.clone(),
    )
    .await
    .unwrap();

    // Ranges are served as a plain 200 over chunked transfer, not a 206.
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "content-length").is_none());
    assert_eq!(collect_body(response).await, Bytes::from(vec![0x41u8; 4]));
}

#[tokio::test]
async fn test_range_reads_match_body_slices() {
    let env = env_with(test_config());
    let body: Vec<u8> = (0..(5 * MIB)).map(|i| (i % 239) as u8).collect();
    handle_request(put_request("/sliced", body.clone()), client_addr(), env.ctx.clone())
        .await
        .unwrap();

    let cases: &[(&str, usize, usize)] = &[
        // Within the first chunk.
        ("bytes=0-1023", 0, 1024),
        // Crossing the chunk 1 / chunk 2 boundary.
        ("bytes=2097000-2097300", 2_097_000, 301),
        // Open-ended range runs through the last byte.
        ("bytes=5242000-", 5_242_000, 5 * MIB - 5_242_000),
    ];

    for (range, start, len) in cases {
        let response = handle_request(
            get_request_with("/sliced", &[("range", range)]),
            client_addr(),
            env.ctx.clone(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "range {}", range);
        let got = collect_body(response).await;
        assert_eq!(
            got.as_ref(),
            &body[*start..*start + *len],
            "range {}",
            range
        );
    }
}

#[tokio::test]
async fn test_suffix_range_selects_tail() {
    let env = env_with(test_config());
    let body: Vec<u8> = (0..(3 * MIB)).map(|i| (i % 97) as u8).collect();
    handle_request(put_request("/tail", body.clone()), client_addr(), env.ctx.clone())
        .await
        .unwrap();

    let response = handle_request(
        get_request_with("/tail", &[("range", "bytes=-4096")]),
        client_addr(),
        env.ctx.clone(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        collect_body(response).await.as_ref(),
        &body[body.len() - 4096..]
    );
}

#[tokio::test]
async fn test_multiple_ranges_concatenate_in_one_response() {
    let env = env_with(test_config());
    let body: Vec<u8> = (0..(3 * MIB)).map(|i| (i % 211) as u8).collect();
    handle_request(put_request("/multi", body.clone()), client_addr(), env.ctx.clone())
        .await
        .unwrap();

    let response = handle_request(
        get_request_with("/multi", &[("range", "bytes=0-9, 1048576-1048585")]),
        client_addr(),
        env.ctx.clone(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let expected: Vec<u8> = body[0..10]
        .iter()
        .chain(&body[1_048_576..1_048_586])
        .copied()
        .collect();
    assert_eq!(collect_body(response).await.as_ref(), &expected[..]);
}

#[tokio::test]
async fn test_range_beyond_object_is_not_satisfiable() {
    let env = env_with(test_config());
    handle_request(
        put_request("/small-file", b"just a few bytes".to_vec()),
        client_addr(),
        env.ctx.clone(),
    )
    .await
    .unwrap();

    let response = handle_request(
        get_request_with("/small-file", &[("range", "bytes=4096-8191")]),
        client_addr(),
        env.ctx.clone(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = handle_request(
        get_request_with("/small-file", &[("range", "bytes=zzz")]),
        client_addr(),
        env.ctx.clone(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_range_on_small_object_slices_leaf() {
    let env = env_with(test_config());
    let body = b"hello ranged world".to_vec();
    handle_request(put_request("/leaf", body.clone()), client_addr(), env.ctx.clone())
        .await
        .unwrap();

    let response = handle_request(
        get_request_with("/leaf", &[("range", "bytes=6-11")]),
        client_addr(),
        env.ctx.clone(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(collect_body(response).await, Bytes::from_static(b"ranged"));
}

#[tokio::test]
async fn test_nested_manifest_streams_in_order() {
    let env = env_with(test_config());

    // Build a two-level tree by hand: the parent's first child is itself a
    // manifest over two grand-children, the second child is a leaf.
    let grand_a = vec![0x61u8; 1000];
    let grand_b = vec![0x62u8; 500];
    let leaf = vec![0x63u8; 700];

    let inner_key = storage_gateway::chunk_key::chunk_key(b"tree", 1);
    let inner_body: Vec<u8> = [grand_a.as_slice(), grand_b.as_slice()].concat();
    for (i, part) in [grand_a.as_slice(), grand_b.as_slice()].iter().enumerate() {
        let key = storage_gateway::chunk_key::chunk_key(&inner_key, i as u32 + 1);
        env.storage
            .put(&key, Bytes::copy_from_slice(part), part.len() as u64, i as u32 + 1)
            .await
            .unwrap();
    }
    env.storage
        .put_manifest(&inner_key, inner_body.len() as u64, 1000, 2, md5_u128(&inner_body))
        .await
        .unwrap();

    let leaf_key = storage_gateway::chunk_key::chunk_key(b"tree", 2);
    env.storage
        .put(&leaf_key, Bytes::from(leaf.clone()), leaf.len() as u64, 2)
        .await
        .unwrap();

    let full: Vec<u8> = [inner_body.as_slice(), leaf.as_slice()].concat();
    env.storage
        .put_manifest(b"tree", full.len() as u64, 1000, 2, md5_u128(&full))
        .await
        .unwrap();

    let response = handle_request(get_request("/tree"), client_addr(), env.ctx.clone())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(collect_body(response).await, Bytes::from(full.clone()));

    // Ranged read across the grand-child boundary.
    let response = handle_request(
        get_request_with("/tree", &[("range", "bytes=900-1600")]),
        client_addr(),
        env.ctx.clone(),
    )
    .await
    .unwrap();
    assert_eq!(collect_body(response).await.as_ref(), &full[900..=1600]);
}
