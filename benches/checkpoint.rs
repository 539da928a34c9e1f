// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use checkpoint::{CaptureResult, Checkpoint};
use core::num::NonZeroUsize;
use criterion::measurement::Measurement;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn capture<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    let mut cp = Checkpoint::new();

    c.bench_function(name, |b| {
        b.iter(|| unsafe { black_box(cp.capture()).is_fresh() })
    });
}

fn round_trip<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    c.bench_function(name, |b| {
        b.iter(|| {
            let mut cp = Checkpoint::new();
            match unsafe { cp.capture() } {
                CaptureResult::Fresh => unsafe {
                    cp.restore(NonZeroUsize::new(1).unwrap())
                },
                CaptureResult::Resumed(value) => value.get(),
            }
        })
    });
}

fn capture_time(c: &mut Criterion) {
    capture("capture_time", c);
}
fn round_trip_time(c: &mut Criterion) {
    round_trip("round_trip_time", c);
}

criterion_group!(
    name = time;
    config = Criterion::default();
    targets = capture_time, round_trip_time
);

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        use criterion_cycles_per_byte::CyclesPerByte;

        fn capture_cycles(c: &mut Criterion<CyclesPerByte>) {
            capture("capture_cycles", c);
        }
        fn round_trip_cycles(c: &mut Criterion<CyclesPerByte>) {
            round_trip("round_trip_cycles", c);
        }

        criterion_group!(
            name = cycles;
            config = Criterion::default().with_measurement(CyclesPerByte);
            targets = capture_cycles, round_trip_cycles
        );

        criterion_main!(cycles, time);
    } else {
        criterion_main!(time);
    }
}
