//! Naming helpers for `/dev` paths.

/// Directory holding device nodes.
pub const DEV_DIR: &str = "/dev/";

/// Turn a device path into something usable as a single file name,
/// e.g. `/dev/sda` becomes `_dev_sda`.
pub fn device_file_name(dev: &str) -> String {
    dev.replace('/', "_")
}

/// Prefix a bare kernel name like `sda1` with `/dev/`; paths are
/// returned unchanged.
pub fn dev_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{DEV_DIR}{name}")
    }
}
