//! Gemini Server Performance Benchmark Suite
//!
//! Measures the hot paths of a single exchange:
//! - Request line framing, whole and split across reads
//! - Request construction (URL resolution)
//! - Status line formatting
//! - A full in-memory session, from request bytes to closed response

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gemini_server::server::{
    gatekeeper::{Gatekeeper, TransportInfo},
    request::{LineParser, RequestBuilder},
    response::format_status_line,
    ConnectionInfo, Request, Response, ResponseError, ServerEvent, Session, Status,
};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    runtime::Runtime,
    sync::broadcast,
};

const REQUEST: &[u8] = b"gemini://example.org/docs/overview.gmi?lang=en\r\n";

/// Benchmark group for request line framing
///
/// Measures:
/// - A line delivered in one read
/// - A line delivered in small chunks
fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_line");
    group.throughput(Throughput::Bytes(REQUEST.len() as u64));

    group.bench_function("single_read", |b| {
        b.iter(|| {
            let mut parser = LineParser::new();
            parser.feed(REQUEST).unwrap().unwrap()
        });
    });

    for chunk in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("chunked", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut parser = LineParser::new();
                REQUEST
                    .chunks(chunk)
                    .find_map(|bytes| parser.feed(bytes).unwrap())
                    .unwrap()
            });
        });
    }

    group.bench_function("build_request", |b| {
        b.iter_batched(
            || LineParser::new().feed(REQUEST).unwrap().unwrap(),
            |line| RequestBuilder::new(ConnectionInfo::new(None)).build(line).unwrap(),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Benchmark group for status line formatting
fn bench_status_line(c: &mut Criterion) {
    c.bench_function("status_line", |b| {
        b.iter(|| format_status_line(Status::SUCCESS, "text/gemini; charset=utf-8; lang=en").unwrap());
    });
}

async fn respond(request: Request, response: Response<DuplexStream>) -> Result<(), ResponseError> {
    response.send("text/gemini", request.path().as_bytes()).await
}

/// Benchmark group for a complete exchange over an in-memory transport
fn bench_session(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let gatekeeper = Gatekeeper::default();
    let transport = TransportInfo::anonymous();
    let (events, _) = broadcast::channel::<ServerEvent>(16);

    c.bench_function("session_round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            let (server, mut client) = duplex(4096);
            client.write_all(REQUEST).await.unwrap();

            let mut session = Session::new(server, ConnectionInfo::new(None));
            session.run(&transport, &gatekeeper, &respond, &events).await.unwrap();

            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            received
        });
    });
}

// Configure benchmark groups
criterion_group!(
    name = benches;
    config = Criterion::default()
        .significance_level(0.05)
        .noise_threshold(0.05);
    targets = bench_parser, bench_status_line, bench_session
);
criterion_main!(benches);
