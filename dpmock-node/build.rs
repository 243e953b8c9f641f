fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Kubelet device plugin API. The plugin serves DevicePlugin and calls
    // Registration; tests play kubelet with the opposite pair.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/deviceplugin.proto"], &["proto"])?;
    Ok(())
}
