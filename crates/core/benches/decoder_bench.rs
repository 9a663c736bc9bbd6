//! Decoder throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use lfsgc_core::layout::Geometry;
use lfsgc_core::sim::{encode_segment, FileSpec, PartialSpec};
use lfsgc_core::SegmentLog;

fn geometry() -> Geometry {
    Geometry {
        block_size: 4096,
        blocks_per_segment: 2048,
        first_data_block: 1,
        nsegments: 64,
        crc_seed: 0x1234,
        r_segments_percentage: 5,
    }
}

/// A segment packed with small partial segments, each holding a few files
fn dense_segment(g: &Geometry) -> Vec<u8> {
    let mut vblocknr = 0;
    let psegs: Vec<PartialSpec> = (0..60)
        .map(|p| {
            let files = (0..4)
                .map(|f| {
                    let data: Vec<(u64, u64)> = (0..6)
                        .map(|i| {
                            vblocknr += 1;
                            (vblocknr, i)
                        })
                        .collect();
                    vblocknr += 1;
                    FileSpec::regular(100 + f, p + 1, data, [vblocknr])
                })
                .collect();
            PartialSpec {
                seq: 7,
                create: 1_700_000_000,
                cno: p + 1,
                files,
            }
        })
        .collect();
    encode_segment(g, 3, &psegs)
}

fn bench_decode(c: &mut Criterion) {
    let g = geometry();
    let buf = dense_segment(&g);

    let mut group = c.benchmark_group("decoder");
    group.throughput(Throughput::Bytes(buf.len() as u64));

    group.bench_function("walk_all_blocks", |b| {
        b.iter(|| {
            let log = SegmentLog::new(black_box(&buf), &g, 3);
            let mut count = 0u64;
            for pseg in log.partial_segments() {
                for file in pseg.files() {
                    count += file.blocks().count() as u64;
                }
            }
            black_box(count)
        });
    });

    group.bench_function("validate_summaries", |b| {
        b.iter(|| {
            let log = SegmentLog::new(black_box(&buf), &g, 3);
            black_box(log.partial_segments().count())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
