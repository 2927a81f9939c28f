// Two threads tick counters in a named shared mapping that the main thread watches.



use simmap::MapCfg;



const NAME: &str = "SIMMAP_COUNTER";

fn main() {
    env_logger::init();

    // Both threads must open the name before anything closes it; after that the name is gone.
    let owned = MapCfg::shared(NAME).size(8).create().unwrap().ok().unwrap();

    println!("Counting for three seconds...");
    let fizz = std::thread::spawn(|| tick(0, 300));
    let buzz = std::thread::spawn(|| tick(4, 500));

    for _ in 0..6 {
        std::thread::sleep(std::time::Duration::from_millis(500));
        println!("fizz = {}, buzz = {}", owned.read_i32(0), owned.read_i32(4));
    }

    fizz.join().unwrap();
    buzz.join().unwrap();
}

// Each thread owns one four-byte slot, so no two writers touch the same bytes.
fn tick(offset: usize, period_ms: u64) {
    let mut local = MapCfg::shared(NAME).open().unwrap();
    assert!(local.is_valid(), "{:?}", local.error());

    for _ in 0..(3000 / period_ms) {
        std::thread::sleep(std::time::Duration::from_millis(period_ms));
        let next = local.read_i32(offset) + 1;
        local.write_i32(offset, next);
    }

    // Whichever handle closes first unlinks the name. Mappings that are still open keep working.
    local.close();
}
