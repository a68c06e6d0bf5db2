fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile_protos(&["proto/node_control.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/node_control.proto");
    Ok(())
}
