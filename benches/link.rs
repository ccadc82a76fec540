//! Link Benchmarks
//!
//! Measures `link_streams` throughput between two in-memory pipes.

#![allow(clippy::unwrap_used)]

use burrow_core::link_streams;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;

/// Push `total` bytes from one end through the link and drain them at the other
async fn transfer(total: usize, link_buffer: usize) -> (u64, u64) {
    let (a, mut client) = tokio::io::duplex(64 * 1024);
    let (b, mut server) = tokio::io::duplex(64 * 1024);
    let link = tokio::spawn(link_streams(a, b, link_buffer));

    let writer = tokio::spawn(async move {
        let chunk = vec![0x5Au8; 16 * 1024];
        let mut sent = 0;
        while sent < total {
            let n = chunk.len().min(total - sent);
            client.write_all(&chunk[..n]).await.unwrap();
            sent += n;
        }
        client.shutdown().await.unwrap();
        client
    });

    let mut sink = Vec::with_capacity(total);
    server.read_to_end(&mut sink).await.unwrap();
    drop(server);

    drop(writer.await.unwrap());
    link.await.unwrap()
}

fn bench_link_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("link_throughput");
    let total = 4 * 1024 * 1024;
    group.throughput(Throughput::Bytes(total as u64));

    for link_buffer in [2048usize, 16 * 1024, 64 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(link_buffer),
            &link_buffer,
            |b, &link_buffer| {
                b.to_async(&rt).iter(|| transfer(total, link_buffer));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_link_throughput);
criterion_main!(benches);
