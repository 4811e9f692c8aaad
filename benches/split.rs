// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Measures the splitter on a realistic mix of responses and interleaved data.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rtsp_player::splitter::{BodyLen, SplitHandler, Splitter};

/// Counts messages: four-byte `$` headers and blank-line-terminated text.
#[derive(Default)]
struct Counter {
    messages: usize,
}

impl SplitHandler for Counter {
    fn search_tail(&mut self, data: &[u8]) -> Option<usize> {
        match data {
            [b'$', _, _, _, ..] => Some(4),
            [b'$', ..] => None,
            _ => data
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|p| p + 4),
        }
    }

    fn on_header(&mut self, header: &[u8]) -> Result<BodyLen, String> {
        self.messages += 1;
        if let [b'$', _, hi, lo] = header {
            return Ok(BodyLen::Fixed(usize::from(u16::from_be_bytes([*hi, *lo]))));
        }
        Ok(BodyLen::None)
    }

    fn on_body(&mut self, _body: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

fn make_input() -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..10_000u32 {
        if i % 100 == 0 {
            data.extend_from_slice(
                format!("RTSP/1.0 200 OK\r\nCSeq: {i}\r\nSession: 708345999\r\n\r\n").as_bytes(),
            );
        }
        data.extend_from_slice(b"$\x00\x05\xa0");
        data.extend(std::iter::repeat(0x42).take(1440));
    }
    data
}

fn criterion_benchmark(c: &mut Criterion) {
    let input = make_input();
    let mut g = c.benchmark_group("split");
    g.throughput(Throughput::Bytes(input.len() as u64));
    for read_size in [1500, 16384, 65536] {
        g.bench_with_input(BenchmarkId::from_parameter(read_size), &read_size, |b, &n| {
            b.iter(|| {
                let mut s = Splitter::new();
                let mut counter = Counter::default();
                for chunk in input.chunks(n) {
                    s.input(chunk, &mut counter).unwrap();
                }
                assert_eq!(counter.messages, 10_100);
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
