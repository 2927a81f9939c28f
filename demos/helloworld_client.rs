use simmap::Mapping;

fn main() {
    env_logger::init();

    // Open the mapping the server created; its size comes from the system.
    let map = Mapping::open_shared("SIMMAP_HELLOWORLD").unwrap();
    if let Some(e) = map.error() {
        eprintln!("Is the server running? {}", e);
        std::process::exit(1);
    }

    let len = map.read_i32(0).max(0) as usize;
    let mut buf = vec![0u8; len];
    let copied = map.read(4, &mut buf);

    println!("{}", String::from_utf8_lossy(&buf[..copied]));
}
