use simmap::Mapping;

fn main() -> simmap::Result<()> {
    env_logger::init();

    // Put a greeting in a named shared mapping that outlives this call.
    let mut map = Mapping::create_shared("SIMMAP_HELLOWORLD", 64)?.ok()?;
    let greeting = b"Hello, world!";
    map.write_i32(0, greeting.len() as i32);
    map.write(4, greeting);

    // Start the client process, and wait on its output.
    let status = std::process::Command::new("cargo")
        .args(["run", "--example", "helloworld_client"])
        .status()
        .map_err(|e| simmap::Error::Os { op: "spawn", source: e })?;
    println!("Client exited with {}", status);

    // Closing unlinks the name.
    map.close();
    Ok(())
}
