//! Compiles `proto/csi.proto` into the tonic server stubs used by
//! `transport::server`. `protoc` and the well-known type includes come from
//! `protoc-bin-vendored`, so no system protobuf installation is required.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    // SAFETY: build scripts are single-threaded; nothing else reads the
    // environment concurrently.
    unsafe {
        std::env::set_var("PROTOC", protoc);
    }

    let includes = [
        std::path::PathBuf::from("proto"),
        protoc_bin_vendored::include_path()?,
    ];

    tonic_build::configure()
        .build_client(false)
        .compile_protos(&["proto/csi.proto"], &includes)?;

    println!("cargo:rerun-if-changed=proto/csi.proto");
    Ok(())
}
