//! Line framing and classification benchmark suite.
//!
//! Measures the per-line cost of the receive path:
//! - Framing bursts split into socket-sized chunks
//! - Classifying replies and broadcasts
//! - Parsing listener events
//!
//! Run with: cargo bench --bench line_framer
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kanata_link::ParsedEvent;
use kanata_link::protocol::classify_line;
use kanata_link::transport::LineFramer;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const CHUNK_SIZES: &[usize] = &[16, 512, 4096];
const LINES_PER_BURST: usize = 256;

const REPLY: &str = r#"{"LayerNames":{"names":["base","nav","sym","num"],"request_id":42}}"#;
const BROADCAST: &str = r#"{"LayerChange":{"new":"nav"}}"#;
const PUSH: &str = r#"{"MessagePush":{"message":["launch:obsidian","keypath://layer/nav/activate"]}}"#;

fn burst() -> Vec<u8> {
    let mut bytes = Vec::new();
    for index in 0..LINES_PER_BURST {
        let line = if index % 4 == 0 { REPLY } else { BROADCAST };
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
    }
    bytes
}

// ============================================================================
// Benchmark: Framing
// ============================================================================

fn bench_framing(c: &mut Criterion) {
    let input = burst();

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(input.len() as u64));

    for &chunk_size in CHUNK_SIZES {
        group.bench_with_input(
            BenchmarkId::new("chunked", chunk_size),
            &chunk_size,
            |b, &size| {
                b.iter(|| {
                    let mut framer = LineFramer::new(64 * 1024);
                    let mut lines = 0usize;
                    for chunk in input.chunks(size) {
                        framer.push(chunk).expect("push");
                        while let Some(line) = framer.next_line().expect("frame") {
                            lines += black_box(line).len();
                        }
                    }
                    lines
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Benchmark: Classification
// ============================================================================

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");

    group.bench_function("reply", |b| {
        b.iter(|| classify_line(black_box(REPLY)).expect("classify"));
    });
    group.bench_function("broadcast", |b| {
        b.iter(|| classify_line(black_box(BROADCAST)).expect("classify"));
    });
    group.bench_function("listener_push", |b| {
        b.iter(|| ParsedEvent::from_line(black_box(PUSH)));
    });

    group.finish();
}

criterion_group!(benches, bench_framing, bench_classify);
criterion_main!(benches);
