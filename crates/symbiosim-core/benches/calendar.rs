use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use symbiosim_core::{EventCalendar, EventKind, SymbiontId};

const KINDS: [EventKind; 5] = [
    EventKind::Escape,
    EventKind::Digestion,
    EventKind::EndG0,
    EventKind::EndMitosis,
    EventKind::Departure,
];

fn scattered_times(count: usize) -> Vec<f64> {
    // Cheap LCG scatter; the calendar only cares about ordering pressure.
    let mut state: u64 = 0x2545_F491_4F6C_DD1D;
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 11) as f64 / (1u64 << 53) as f64 * 1_000.0
        })
        .collect()
}

fn calendar_benchmarks(c: &mut Criterion) {
    let times = scattered_times(4_096);

    c.bench_function("calendar_insert_4096", |b| {
        b.iter(|| {
            let mut calendar = EventCalendar::new();
            for (i, &t) in times.iter().enumerate() {
                calendar.insert(t, KINDS[i % KINDS.len()], SymbiontId::default());
            }
            black_box(calendar.len())
        });
    });

    c.bench_function("calendar_insert_extract_4096", |b| {
        b.iter(|| {
            let mut calendar = EventCalendar::new();
            for (i, &t) in times.iter().enumerate() {
                calendar.insert(t, KINDS[i % KINDS.len()], SymbiontId::default());
            }
            while let Some(event) = calendar.extract_min() {
                black_box(event.time);
            }
        });
    });
}

criterion_group!(benches, calendar_benchmarks);
criterion_main!(benches);
