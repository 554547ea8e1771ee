//! Domain socket proxy and REPL frame throughput benchmarks.
//!
//! Measures a request/echo round trip through a live proxy socket, and
//! write_frame/read_frame cost for typical REPL payload sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kernel_agent::proxy::DomainSocketProxy;
use kernel_agent::repl::codec::{read_frame, write_frame, ReplOp, MAX_FRAME_BYTES};
use kernel_agent::types::ProxyConfig;
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

fn bench_proxy_echo(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let upstream_path = dir.path().join("engine.sock");

    let proxy = rt.block_on(async {
        let listener = UnixListener::bind(&upstream_path).unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        DomainSocketProxy::start(&upstream_path, dir.path(), &ProxyConfig::default())
            .await
            .unwrap()
    });
    let proxy_path = proxy.host_proxy_path().to_path_buf();

    let mut group = c.benchmark_group("proxy_echo");
    for &size in &[64usize, 4096, 65536] {
        let payload = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, p| {
            b.iter(|| {
                rt.block_on(async {
                    let mut conn = UnixStream::connect(&proxy_path).await.unwrap();
                    conn.write_all(black_box(p)).await.unwrap();
                    let mut back = vec![0u8; p.len()];
                    conn.read_exact(&mut back).await.unwrap();
                    back
                })
            });
        });
    }
    group.finish();

    let mut proxy = proxy;
    rt.block_on(proxy.close());
}

fn bench_repl_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("repl_frame_round_trip");
    for &size in &[2usize, 1024, 65536] {
        let payload = vec![b'x'; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, p| {
            b.iter(|| {
                rt.block_on(async {
                    let mut buf = Vec::with_capacity(p.len() + 5);
                    write_frame(&mut buf, ReplOp::Status as u8, black_box(p)).await.unwrap();
                    let mut cursor = Cursor::new(buf);
                    read_frame(&mut cursor, MAX_FRAME_BYTES).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_proxy_echo, bench_repl_frames);
criterion_main!(benches);
