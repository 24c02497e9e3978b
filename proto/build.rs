use std::error::Error;

// generated code is checked in, regenerate with REGENERATE_PROTO=1 (needs protoc)
fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-changed=balancer.proto");
    println!("cargo:rerun-if-env-changed=REGENERATE_PROTO");
    if std::env::var("REGENERATE_PROTO").is_err() {
        return Ok(());
    }
    tonic_build::configure()
        .out_dir("src/generated/")
        .build_client(false)
        .build_server(false)
        .compile_protos(&["balancer.proto"], &["."])?;
    Ok(())
}
