extern crate frameprof;

use std::thread;
use std::time::Duration;

fn main() {
    let p = frameprof::Profiler::new();
    let mut stats = String::new();

    for frame in 0..20 {
        p.begin_frame();

        let setup = p.begin_section("setup");
        thread::sleep(Duration::from_millis(1));
        p.end_section(setup);

        let physics = p.begin_section("physics");
        thread::sleep(Duration::from_millis(2));
        p.end_section(physics);

        let render = p.begin_section("render");
        thread::sleep(Duration::from_millis(4));
        p.end_section(render);

        p.end_frame();

        // this would usually depend on a debug flag, or use custom functionality for drawing the
        // debug information.
        if frame % 5 == 4 {
            p.print(&mut stats);
            println!("frame {}:\n{}", frame, stats);
        }
    }
}
