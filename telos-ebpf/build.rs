//! Generates kernel type bindings (`task_struct`, `file`, `dentry`) from
//! the build host's BTF with `aya-tool`.
//!
//! Set `TELOS_VMLINUX_RS` to a pre-generated bindings file to build on a
//! machine without `/sys/kernel/btf/vmlinux` or without `aya-tool`.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

const KERNEL_TYPES: &[&str] = &["task_struct", "file", "dentry"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=TELOS_VMLINUX_RS");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("cargo sets OUT_DIR"));
    let bindings = out_dir.join("vmlinux.rs");

    if let Some(pregenerated) = env::var_os("TELOS_VMLINUX_RS") {
        fs::copy(&pregenerated, &bindings).expect("copy TELOS_VMLINUX_RS");
        return;
    }

    let output = Command::new("aya-tool")
        .arg("generate")
        .args(KERNEL_TYPES)
        .output()
        .expect(
            "aya-tool not found: `cargo install --git https://github.com/aya-rs/aya aya-tool` \
             or set TELOS_VMLINUX_RS",
        );
    if !output.status.success() {
        panic!(
            "aya-tool generate failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    fs::write(&bindings, output.stdout).expect("write vmlinux.rs");
}
