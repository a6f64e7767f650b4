use std::hint::black_box;

use kring::Ring;

fn main() {
    if Ring::new(8).is_err() {
        eprintln!("io_uring unavailable here; skipping benches");
        return;
    }
    divan::main();
}

#[divan::bench]
fn bench_acquire_encode_flush(bencher: divan::Bencher) {
    let mut ring = Ring::new(256).unwrap();
    bencher.bench_local(move || {
        for tag in 0..64u64 {
            let sqe = ring.get_sqe().unwrap();
            sqe.prepare_nop();
            sqe.set_data64(tag);
        }
        ring.submit_and_wait(64).unwrap();
        ring.cq_advance(64);
        black_box(&ring);
    });
}

#[divan::bench(args = [1, 8, 64])]
fn bench_nop_roundtrip(bencher: divan::Bencher, batch: u32) {
    let mut ring = Ring::new(256).unwrap();
    bencher.bench_local(move || {
        for tag in 0..batch as u64 {
            let sqe = ring.get_sqe().unwrap();
            sqe.prepare_nop();
            sqe.set_data64(tag);
        }
        ring.submit_and_wait(batch).unwrap();
        let mut seen = 0;
        while seen < batch {
            let cqe = ring.wait_cqe().unwrap();
            black_box(cqe.user_data);
            ring.cqe_seen(&cqe);
            seen += 1;
        }
    });
}
