extern crate frameprof;

use std::rc::Rc;
use std::thread;
use std::time::Duration;

use frameprof::{GpuTimer, HostTimers, Profiler};

fn main() {
    let p = Profiler::new();
    // stands in for a GL or Vulkan query pool
    let timer: Rc<dyn GpuTimer> = Rc::new(HostTimers::new());
    p.set_default_gpu_timer(Some(timer));

    let mut stats = String::new();
    let start = p.micro_seconds();

    for _ in 0..40 {
        let now = (p.micro_seconds() - start) / 1_000_000.0;
        let frame = p.frame(now, 0.1, &mut stats);
        let printing = frame.will_print();

        {
            let _g = p.section("physics");

            let _g = p.section("collision");
            thread::sleep(Duration::from_millis(1));
            drop(_g);

            let _g = p.section("update positions");
            thread::sleep(Duration::from_millis(1));
        }
        {
            let _g = p.section("render");

            for _ in 0..3 {
                let _g = p.section("opaque object");
                thread::sleep(Duration::from_millis(1));
            }
            p.accumulation_split();
            for _ in 0..2 {
                let _g = p.section("transparent object");
                thread::sleep(Duration::from_millis(1));
            }

            let _g = p.section_ex("gpu submit", None, true);
            thread::sleep(Duration::from_millis(2));
        }

        drop(frame);
        if printing && !stats.is_empty() {
            println!("{}", stats);
        }
    }
}
