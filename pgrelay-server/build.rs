fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the wire contract into prost messages and tonic stubs
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/db.proto"], &["proto"])?;

    Ok(())
}
