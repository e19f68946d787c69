//! Reading the initial record from a stream and writing records back out.

use std::io;
use std::time::Duration;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RecordError;
use crate::gap::GapRange;
use crate::record::{Record, MAX_RECORD_PAYLOAD, RECORD_HEADER_LEN};

/// Outcome of reading the first record of a stream.
///
/// `raw` holds every byte consumed from the stream, in order, whether or not
/// the read succeeded. Callers that give up on parsing forward it verbatim.
#[derive(Debug)]
pub struct InitialRead {
    /// Bytes consumed from the stream.
    pub raw: Vec<u8>,
    /// The parsed record, or why parsing stopped.
    pub result: Result<Record, RecordError>,
}

/// Read one record from `stream`.
///
/// The optional `timeout` bounds the whole read and applies to this call
/// only. A declared payload length above `max_payload` fails with
/// [`RecordError::TooLarge`] after consuming just the header.
pub async fn read_initial_record<R>(
    stream: &mut R,
    timeout: Option<Duration>,
    max_payload: usize,
) -> InitialRead
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(RECORD_HEADER_LEN);

    let result = match timeout {
        Some(limit) => {
            match tokio::time::timeout(limit, read_record(stream, max_payload, &mut raw)).await {
                Ok(result) => result,
                Err(_) => Err(RecordError::TimedOut),
            }
        }
        None => read_record(stream, max_payload, &mut raw).await,
    };

    InitialRead { raw, result }
}

async fn read_record<R>(
    stream: &mut R,
    max_payload: usize,
    raw: &mut Vec<u8>,
) -> Result<Record, RecordError>
where
    R: AsyncRead + Unpin,
{
    fill_to(stream, raw, RECORD_HEADER_LEN).await?;

    let length = u16::from_be_bytes([raw[3], raw[4]]) as usize;
    if length > max_payload {
        return Err(RecordError::TooLarge {
            length,
            limit: max_payload,
        });
    }

    raw.reserve_exact(length);
    fill_to(stream, raw, RECORD_HEADER_LEN + length).await?;

    Ok(Record::new(
        raw[0],
        u16::from_be_bytes([raw[1], raw[2]]),
        raw[RECORD_HEADER_LEN..].to_vec(),
    ))
}

/// Read until `raw` holds `target` bytes. Bytes read before an error stay in `raw`.
async fn fill_to<R>(stream: &mut R, raw: &mut Vec<u8>, target: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while raw.len() < target {
        let want = (target - raw.len()) as u64;
        let n = (&mut *stream).take(want).read_buf(raw).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {} of {} bytes", raw.len(), target),
            ));
        }
    }
    Ok(())
}

/// Write a single record, header and payload in one vectored write.
pub async fn write_record<W>(stream: &mut W, record: &Record) -> Result<(), RecordError>
where
    W: AsyncWrite + Unpin,
{
    let header = record.header()?;
    let mut buf = Buf::chain(&header[..], &record.payload[..]);
    stream.write_all_buf(&mut buf).await?;
    Ok(())
}

/// Write records in order, pausing once between the first and second.
///
/// Nothing is written if any payload exceeds the record size limit.
pub async fn write_records<W>(
    stream: &mut W,
    records: &[Record],
    gap: GapRange,
) -> Result<(), RecordError>
where
    W: AsyncWrite + Unpin,
{
    if let Some(oversized) = records
        .iter()
        .find(|r| r.payload.len() > MAX_RECORD_PAYLOAD)
    {
        return Err(RecordError::PayloadTooLarge(oversized.payload.len()));
    }

    for (idx, record) in records.iter().enumerate() {
        write_record(stream, record).await?;

        if idx == 0 && records.len() > 1 {
            stream.flush().await?;
            let delay = gap.sample();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::client_hello;
    use tokio::time::Instant;

    const MAX: usize = 64 * 1024;

    #[tokio::test]
    async fn test_read_full_record() {
        let record = client_hello(200);
        let mut bytes = record.encode().unwrap();
        bytes.extend_from_slice(b"trailing application data");

        let mut stream = &bytes[..];
        let read = read_initial_record(&mut stream, None, MAX).await;

        assert_eq!(read.result.unwrap(), record);
        assert_eq!(read.raw, record.encode().unwrap());
        assert_eq!(stream, b"trailing application data");
    }

    #[tokio::test]
    async fn test_read_record_delivered_in_fragments() {
        let record = client_hello(64);
        let bytes = record.encode().unwrap();

        let mut stream = tokio_test::io::Builder::new()
            .read(&bytes[..2])
            .read(&bytes[2..7])
            .read(&bytes[7..40])
            .read(&bytes[40..])
            .build();
        let read = read_initial_record(&mut stream, None, MAX).await;

        assert_eq!(read.result.unwrap(), record);
        assert_eq!(read.raw, bytes);
    }

    #[tokio::test]
    async fn test_read_empty_stream() {
        let mut stream: &[u8] = &[];
        let read = read_initial_record(&mut stream, None, MAX).await;
        assert!(read.raw.is_empty());
        assert!(read.result.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_read_short_header() {
        let mut stream: &[u8] = &[0x16, 0x03];
        let read = read_initial_record(&mut stream, None, MAX).await;
        assert_eq!(read.raw, vec![0x16, 0x03]);
        assert!(read.result.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_read_truncated_payload_keeps_bytes() {
        let encoded = client_hello(100).encode().unwrap();
        let mut stream = &encoded[..60];
        let read = read_initial_record(&mut stream, None, MAX).await;
        assert_eq!(read.raw, &encoded[..60]);
        assert!(read.result.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_read_too_large_consumes_only_header() {
        let encoded = client_hello(300).encode().unwrap();
        let mut stream = &encoded[..];
        let read = read_initial_record(&mut stream, None, 100).await;

        assert_eq!(read.raw, &encoded[..5]);
        assert!(matches!(
            read.result,
            Err(RecordError::TooLarge {
                length: 304,
                limit: 100
            })
        ));
        assert_eq!(stream.len(), encoded.len() - 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_keeps_partial_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0x16, 0x03, 0x01, 0x00]).await.unwrap();

        let read =
            read_initial_record(&mut server, Some(Duration::from_millis(250)), MAX).await;
        assert_eq!(read.raw, vec![0x16, 0x03, 0x01, 0x00]);
        assert!(matches!(read.result, Err(RecordError::TimedOut)));

        // The deadline does not outlive the call.
        client.write_all(b"later").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"later");
    }

    #[tokio::test]
    async fn test_write_record_sends_header_then_payload() {
        let record = Record::new(0x16, 0x0303, vec![0x01, 0x00, 0x00, 0x01, 0xAA]);

        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x16, 0x03, 0x03, 0x00, 0x05])
            .write(&[0x01, 0x00, 0x00, 0x01, 0xAA])
            .build();
        write_record(&mut stream, &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_records_frames_each_record() {
        let parts = client_hello(50).split_client_hello(3).unwrap();
        let mut out = Vec::new();
        write_records(&mut out, &parts, GapRange::NONE).await.unwrap();

        let mut expected = parts[0].encode().unwrap();
        expected.extend(parts[1].encode().unwrap());
        assert_eq!(out, expected);
        assert_eq!(&out[..8], &[0x16, 0x03, 0x01, 0x00, 0x03, 0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_write_records_rejects_oversized_without_writing() {
        let records = vec![
            Record::new(0x16, 0x0301, vec![1, 2, 3]),
            Record::new(0x16, 0x0301, vec![0; MAX_RECORD_PAYLOAD + 1]),
        ];
        let mut out = Vec::new();
        let err = write_records(&mut out, &records, GapRange::NONE)
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::PayloadTooLarge(65536)));
        assert!(out.is_empty());
    }

    /// Time between the first and second record arriving at the reader.
    async fn measure_gap(gap: GapRange, records: usize) -> Vec<Duration> {
        let parts: Vec<Record> = (0..records)
            .map(|i| Record::new(0x16, 0x0301, vec![i as u8; 10]))
            .collect();
        let (mut writer, mut reader) = tokio::io::duplex(4096);

        let writer_task = tokio::spawn(async move {
            write_records(&mut writer, &parts, gap).await.unwrap();
        });

        let mut arrivals = Vec::new();
        let mut buf = [0u8; 15];
        for _ in 0..records {
            reader.read_exact(&mut buf).await.unwrap();
            arrivals.push(Instant::now());
        }
        writer_task.await.unwrap();

        arrivals.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_within_range() {
        let gap = GapRange::new(5, 15).unwrap();
        for _ in 0..50 {
            let delays = measure_gap(gap, 2).await;
            assert!(delays[0] >= Duration::from_millis(5), "{:?}", delays);
            assert!(delays[0] <= Duration::from_millis(15), "{:?}", delays);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_gap_has_no_delay() {
        let delays = measure_gap(GapRange::NONE, 2).await;
        assert_eq!(delays[0], Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_only_after_first_record() {
        let gap = GapRange::new(10, 10).unwrap();
        let delays = measure_gap(gap, 4).await;
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::ZERO);
        assert_eq!(delays[2], Duration::ZERO);
    }
}
