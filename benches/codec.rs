//! Codec Benchmarks
//!
//! Measures control message and session frame encode/decode cost.

#![allow(clippy::unwrap_used)]

use burrow_protocol::{Frame, FrameCodec, Message, MessageCodec, NewTunnelRequest, PingRequest};
use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};

fn new_tunnel() -> Message {
    NewTunnelRequest {
        id: "agent-1".into(),
        client_hash: "0123456789abcdef0123456789abcdef".into(),
        tunnel_hash: "fedcba9876543210".into(),
        proto: "http".into(),
        export_addr: "127.0.0.1:3000".into(),
        registry_addr: "broker.example.com:7801".into(),
    }
    .into()
}

fn bench_message_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_codec");

    for (name, message) in [("ping", PingRequest.into()), ("new_tunnel", new_tunnel())] {
        group.bench_with_input(BenchmarkId::new("encode", name), &message, |b, message| {
            let mut codec = MessageCodec::new();
            let mut buf = BytesMut::with_capacity(256);
            b.iter(|| {
                buf.clear();
                codec.encode(message.clone(), &mut buf).unwrap();
                black_box(buf.len())
            });
        });

        let mut encoded = BytesMut::new();
        MessageCodec::new().encode(message, &mut encoded).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", name), &encoded, |b, encoded| {
            let mut codec = MessageCodec::new();
            b.iter(|| {
                let mut src = encoded.clone();
                black_box(codec.decode(&mut src).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for size in [64usize, 1024, 16384, 65536] {
        let frame = Frame::Data {
            stream_id: 1,
            data: Bytes::from(vec![0xAB; size]),
        };
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, frame| {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::with_capacity(size + 16);
            b.iter(|| {
                buf.clear();
                codec.encode(frame.clone(), &mut buf).unwrap();
                black_box(buf.len())
            });
        });

        let mut encoded = BytesMut::new();
        FrameCodec::new().encode(frame, &mut encoded).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            let mut codec = FrameCodec::new();
            b.iter(|| {
                let mut src = encoded.clone();
                black_box(codec.decode(&mut src).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_message_codec, bench_frame_codec);
criterion_main!(benches);
