fn main() {
    println!("cargo:rerun-if-changed=proto/agent.proto");

    volo_build::Builder::protobuf()
        .add_service("proto/agent.proto")
        .include_dirs(vec![std::path::PathBuf::from(".")])
        .write()
        .unwrap();
}
