
use std::time::Duration;

use harness::{
    client_hello_record, take_records, test_config, CaptureBackend, SplitterHandle, TlsBackend,
    CAPTURE_REPLY, TEST_TIMEOUT,
};
use rstest::rstest;
use terasu_proxy::Config;
use terasu_tls_record::GapRange;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Send `input`, close the write side, and collect everything sent back.
async fn exchange(addr: std::net::SocketAddr, input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(input).await?;
    stream.shutdown().await?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    Ok(reply)
}

fn server_hello_record() -> Vec<u8> {
    let mut record = client_hello_record(60);
    record[5] = 0x02;
    record
}

fn mismatched_length_record() -> Vec<u8> {
    // Handshake header claims 100 body bytes; the record carries 49.
    let mut record = vec![0x16, 0x03, 0x01, 0x00, 0x35, 0x01, 0x00, 0x00, 0x64];
    record.extend(std::iter::repeat(0xAB).take(49));
    record
}

#[tokio::test]
async fn client_hello_arrives_as_two_records() {
    let mut backend = CaptureBackend::spawn().await.unwrap();
    let splitter = SplitterHandle::spawn(backend.addr, 3, GapRange::NONE)
        .await
        .unwrap();

    let hello = client_hello_record(200);
    let mut input = hello.clone();
    input.extend_from_slice(b"application bytes");

    let reply = timeout(TEST_TIMEOUT, exchange(splitter.listen_addr, &input))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, CAPTURE_REPLY);

    let received = backend.next_received().await;
    let (records, rest) = take_records(&received, 2);

    assert_eq!(records[0].payload.len(), 3);
    assert_eq!(records[1].payload.len(), 201);
    for record in &records {
        assert_eq!(record.content_type, 0x16);
        assert_eq!(record.version, 0x0301);
    }
    let rejoined = [records[0].payload.as_slice(), records[1].payload.as_slice()].concat();
    assert_eq!(rejoined, &hello[5..]);
    assert_eq!(rest, b"application bytes");

    splitter.wait_for(|s| &s.sessions_split, 1).await;
    assert_eq!(
        splitter
            .stats
            .bytes_to_client
            .load(std::sync::atomic::Ordering::Relaxed),
        CAPTURE_REPLY.len() as u64
    );
}

#[tokio::test]
async fn zero_first_fragment_forwards_record_unchanged() {
    let mut backend = CaptureBackend::spawn().await.unwrap();
    let splitter = SplitterHandle::spawn(backend.addr, 0, GapRange::NONE)
        .await
        .unwrap();

    let hello = client_hello_record(120);
    timeout(TEST_TIMEOUT, exchange(splitter.listen_addr, &hello))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(backend.next_received().await, hello);
    splitter.wait_for(|s| &s.sessions_split, 1).await;
}

#[rstest]
#[case::plain_http(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n".to_vec())]
#[case::server_hello(server_hello_record())]
#[case::length_mismatch(mismatched_length_record())]
#[case::truncated_record(client_hello_record(300)[..100].to_vec())]
#[tokio::test]
async fn unsplittable_input_reaches_upstream_verbatim(#[case] input: Vec<u8>) {
    let mut backend = CaptureBackend::spawn().await.unwrap();
    let splitter = SplitterHandle::spawn(backend.addr, 3, GapRange::NONE)
        .await
        .unwrap();

    let reply = timeout(TEST_TIMEOUT, exchange(splitter.listen_addr, &input))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, CAPTURE_REPLY);
    assert_eq!(backend.next_received().await, input);

    splitter.wait_for(|s| &s.sessions_forwarded, 1).await;
}

#[tokio::test]
async fn oversized_record_is_forwarded_as_header_then_rest() {
    let mut backend = CaptureBackend::spawn().await.unwrap();
    let config = Config {
        max_record_size: 64,
        ..test_config()
    };
    let splitter = SplitterHandle::spawn_with(backend.addr, config).await.unwrap();

    let hello = client_hello_record(200);
    timeout(TEST_TIMEOUT, exchange(splitter.listen_addr, &hello))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(backend.next_received().await, hello);
    splitter.wait_for(|s| &s.sessions_forwarded, 1).await;
}

#[tokio::test]
async fn stalled_client_is_forwarded_after_read_timeout() {
    let mut backend = CaptureBackend::spawn().await.unwrap();
    let splitter = SplitterHandle::spawn(backend.addr, 3, GapRange::NONE)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(splitter.listen_addr).await.unwrap();
    stream.write_all(&[0x16, 0x03, 0x01]).await.unwrap();

    // Longer than the configured read timeout.
    tokio::time::sleep(Duration::from_millis(300)).await;
    stream.write_all(b"late").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, CAPTURE_REPLY);
    assert_eq!(backend.next_received().await, b"\x16\x03\x01late");

    splitter.wait_for(|s| &s.sessions_forwarded, 1).await;
}

#[tokio::test]
async fn silent_client_is_abandoned() {
    let mut backend = CaptureBackend::spawn().await.unwrap();
    let splitter = SplitterHandle::spawn(backend.addr, 3, GapRange::NONE)
        .await
        .unwrap();

    let reply = timeout(TEST_TIMEOUT, exchange(splitter.listen_addr, b""))
        .await
        .unwrap()
        .unwrap_or_default();
    assert!(reply.is_empty());

    // The upstream connection was opened, then closed without data.
    assert!(backend.next_received().await.is_empty());
    splitter.wait_for(|s| &s.sessions_abandoned, 1).await;
}

#[tokio::test]
async fn dial_failure_closes_client() {
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let splitter = SplitterHandle::spawn(dead_addr, 3, GapRange::NONE)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(splitter.listen_addr).await.unwrap();
    let _ = stream.write_all(&client_hello_record(50)).await;

    let mut buf = Vec::new();
    let read = timeout(TEST_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .unwrap();
    // Either a clean EOF or a reset; never data.
    if let Ok(n) = read {
        assert_eq!(n, 0);
    }

    splitter.wait_for(|s| &s.dial_failed, 1).await;
}

#[rstest]
#[case::one_byte(1, GapRange::NONE)]
#[case::default_split(3, GapRange::new(5, 15).unwrap())]
#[case::past_handshake_header(40, GapRange::new(0, 5).unwrap())]
#[tokio::test]
async fn tls_handshake_completes_through_splitter(
    #[case] first_fragment: usize,
    #[case] gap: GapRange,
) {
    let backend = TlsBackend::spawn("split.example.test", b"split-ok")
        .await
        .unwrap();
    let splitter = SplitterHandle::spawn(backend.addr, first_fragment, gap)
        .await
        .unwrap();

    let reply = timeout(TEST_TIMEOUT, backend.exchange_via(splitter.listen_addr, b"whoami"))
        .await
        .expect("timeout")
        .expect("tls exchange failed");

    assert_eq!(reply, backend.marker);
    assert_eq!(backend.connection_count(), 1);
    splitter.wait_for(|s| &s.sessions_split, 1).await;
}
