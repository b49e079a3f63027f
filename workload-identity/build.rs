use std::env;

fn main() -> Result<(), anyhow::Error> {
    println!("cargo:rerun-if-changed=proto/workload.proto");

    // Check if this is a docs.rs build
    if env::var_os("DOCS_RS").is_some() {
        println!("cargo:warning=Skipping protobuf code generation on docs.rs.");
        return Ok(());
    }

    // protox compiles the descriptor set in-process, so no `protoc` binary is needed.
    let file_descriptors = protox::compile(["workload.proto"], ["proto"])?;

    tonic_prost_build::configure()
        .build_client(true)
        // The server half backs the in-process fake Workload API used by tests.
        .build_server(true)
        .compile_fds(file_descriptors)?;

    Ok(())
}
