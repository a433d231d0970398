//! Print this thread's rseq-reported CPU identity from a few threads.
//!
//! Run with:
//!   cargo run -p rseq --example cpu_id

fn main() {
    let Some(cpu) = rseq::current_cpu() else {
        println!("rseq unavailable (need Linux x86_64, kernel >= 4.18).");
        return;
    };
    println!("main thread: cpu_id = {cpu}");
    println!(
        "virtual-CPU (mm_cid) support: {}",
        if rseq::virtual_cpu_supported() { "yes" } else { "no" }
    );

    let handles: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                std::thread_local! {
                    static RSEQ: rseq::RseqLocal = rseq::RseqLocal::new();
                }
                let cpu = RSEQ.with(|r| r.cpu_id());
                let vcpu = RSEQ.with(|r| r.virtual_cpu_id());
                println!("thread {i}: cpu_id = {cpu:?}, vcpu_id = {vcpu:?}");
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
