//! Wire codec benchmarks
//!
//! Covers the hot paths of every connection:
//! - HTTP/2 frame encoding and incremental decoding
//! - WebSocket frame masking, encoding and parsing
//! - HTTP/1.1 chunked transfer coding
//!
//! Run with: cargo bench --bench frame_codecs

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use xserve::http::chunked::{decode_chunked_body, encode_chunked_body};
use xserve::http::h2::codec::{FrameCodec as H2Codec, FrameDecoder};
use xserve::http::h2::frames::{DataFrame, FrameFlags, FrameType};
use xserve::ws::{Frame, FrameCodec as WsCodec, OpCode};

const SIZES: [usize; 3] = [64, 4 * 1024, 64 * 1024];

fn bench_h2_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("h2_frames");

    group.bench_function("encode_header", |b| {
        b.iter(|| {
            black_box(H2Codec::encode_header(
                black_box(FrameType::Data),
                black_box(FrameFlags::from_u8(0x01)),
                black_box(1),
                black_box(1024),
            ))
        });
    });

    for size in SIZES {
        let frame = DataFrame::new(1, Bytes::from(vec![0x5a; size.min(16_384)]), false);
        group.throughput(Throughput::Bytes(frame.data.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode_data", size), &frame, |b, frame| {
            b.iter(|| black_box(H2Codec::encode_data_frame(frame)));
        });

        // Ten back-to-back frames, as read off the socket
        let mut wire = Vec::new();
        for _ in 0..10 {
            wire.extend_from_slice(&H2Codec::encode_data_frame(&frame));
        }
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::new("decode_data_x10", size), &wire, |b, wire| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new(1 << 20);
                decoder.feed(wire);
                let mut count = 0;
                while let Ok(Some(frame)) = decoder.next_frame() {
                    black_box(&frame);
                    count += 1;
                }
                assert_eq!(count, 10);
            });
        });
    }

    group.finish();
}

fn bench_ws_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("ws_frames");

    for size in SIZES {
        let frame = Frame::new(OpCode::Binary, vec![0xa5u8; size], true);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode_masked", size), &frame, |b, frame| {
            b.iter(|| {
                let mut out = BytesMut::with_capacity(size + 14);
                WsCodec::encode(frame, Some([1, 2, 3, 4]), &mut out);
                black_box(out);
            });
        });

        let mut wire = BytesMut::new();
        WsCodec::encode(&frame, Some([1, 2, 3, 4]), &mut wire);
        let server = WsCodec::server(1 << 20, false);
        group.bench_with_input(BenchmarkId::new("parse_masked", size), &wire, |b, wire| {
            b.iter(|| {
                let mut buf = wire.clone();
                black_box(server.parse(&mut buf).ok().flatten())
            });
        });
    }

    group.finish();
}

fn bench_chunked(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked");

    for size in SIZES {
        let body = vec![b'c'; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &body, |b, body| {
            b.iter(|| black_box(encode_chunked_body(body, 1024)));
        });

        let encoded = match encode_chunked_body(&body, 1024) {
            Ok(encoded) => encoded,
            Err(e) => panic!("encode failed: {}", e),
        };
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| black_box(decode_chunked_body(encoded)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_h2_frames, bench_ws_frames, bench_chunked);
criterion_main!(benches);
